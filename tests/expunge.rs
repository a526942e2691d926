//! Memory-pressure behavior: the allocator-driven expunge policy.

use shmcache::{now_secs, Cache, CacheConfig, Value};

fn tight_cache(ttl: u32) -> Cache {
    Cache::create(&CacheConfig {
        shm_size: 256 * 1024,
        size_hint: 0,
        ttl,
        gc_ttl: 0,
        slam_defense: false,
        ..CacheConfig::default()
    })
    .unwrap()
}

fn payload() -> Value {
    Value::bytes(&[0xA5; 4096])
}

#[test]
fn pressure_wipes_in_no_ttl_mode_and_stores_never_fail() {
    let cache = tight_cache(0);
    let value = payload();

    // Far more data than the region holds; every store must still
    // succeed because exhaustion triggers a full wipe and a retry.
    for i in 0..100u32 {
        let key = format!("wipe-{i}");
        assert!(
            cache.store(key.as_bytes(), &value, 0, false),
            "store {i} failed instead of expunging"
        );
    }

    let info = cache.info(true);
    assert!(info.expunges >= 1, "pressure never fired");
    assert!(info.num_entries < 100, "nothing was ever wiped");
    assert_eq!(info.num_inserts, 100);

    // The survivors are intact.
    let survivors = cache.info(false).cache_list.unwrap();
    assert_eq!(survivors.len() as u64, info.num_entries);
    cache.destroy();
}

#[test]
fn ttl_mode_with_nothing_stale_escalates_to_a_full_wipe() {
    let cache = tight_cache(600);
    let value = payload();

    // All entries are fresh and carry no TTL of their own, so the
    // sweep finds nothing and each trigger escalates to a real wipe.
    for i in 0..60u32 {
        let key = format!("fresh-{i}");
        assert!(cache.store(key.as_bytes(), &value, 0, false));
    }

    let info = cache.info(true);
    assert!(info.expunges >= 1);
    assert!(info.num_entries < 60);
    cache.destroy();
}

#[test]
fn ttl_mode_sweep_drops_entries_dead_by_their_own_ttl() {
    let cache = tight_cache(600);
    let value = payload();

    for i in 0..8u32 {
        let key = format!("short-{i}");
        assert!(cache.store(key.as_bytes(), &value, 1, false));
    }
    std::thread::sleep(std::time::Duration::from_secs(2));

    // Push the region past half full so the next trigger sweeps.
    let mut info = cache.info(true);
    let mut i = 0u32;
    while info.expunges == 0 {
        let key = format!("filler-{i}");
        assert!(cache.store(key.as_bytes(), &value, 0, false));
        info = cache.info(true);
        i += 1;
        assert!(i < 200, "pressure never fired");
    }

    // The expired entries were unlinked by the sweep, not merely
    // hidden by the TTL check on read.
    let survivors = cache.info(false).cache_list.unwrap();
    assert!(
        survivors
            .iter()
            .all(|slot| !slot.identifier.starts_with(b"short-")),
        "expired entries survived the sweep"
    );
    cache.destroy();
}

#[test]
fn update_growth_under_pressure_runs_the_sweep_without_deadlocking() {
    let cache = tight_cache(600);

    assert!(cache.store(b"grow", &Value::str("tiny"), 0, false));

    // Push the region past half full without tripping pressure yet.
    for i in 0..9u32 {
        let key = format!("ballast-{i}");
        assert!(cache.store(key.as_bytes(), &payload(), 0, false));
    }
    assert_eq!(cache.info(true).expunges, 0);

    // Growing the value far past its pool forces an SMA allocation
    // that fails and fires the TTL-aware sweep from this same thread,
    // while this thread is mid-update on the slot being swept.
    let big = "x".repeat(200 * 1024);
    let updated = cache.update(b"grow", |v| {
        *v = Value::str(&big);
        true
    });
    assert!(updated);
    assert!(cache.info(true).expunges >= 1);

    // The cache stays usable afterwards.
    assert!(cache.store(b"after", &Value::Int(1), 0, false));
    assert!(cache.exists(b"after", now_secs()));
    cache.destroy();
}

#[test]
fn a_value_larger_than_the_region_fails_without_livelock() {
    let cache = tight_cache(0);
    let oversized = Value::bytes(&vec![1u8; 512 * 1024]);
    assert!(!cache.store(b"too-big", &oversized, 0, false));

    // The cache stays usable afterwards.
    assert!(cache.store(b"fits", &Value::Int(1), 0, false));
    assert!(cache.exists(b"fits", now_secs()));
    cache.destroy();
}
