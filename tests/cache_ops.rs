//! End-to-end cache behavior over a private shared region.

use std::rc::Rc;
use std::sync::Arc;

use shmcache::{now_secs, ArrayKey, ArrayValue, Cache, CacheConfig, Value};

fn cache_with(config: CacheConfig) -> Cache {
    Cache::create(&config).unwrap()
}

fn small_cache() -> Cache {
    cache_with(CacheConfig {
        shm_size: 4 << 20,
        ..CacheConfig::default()
    })
}

#[test]
fn basic_round_trip_updates_counters() {
    let cache = small_cache();
    let now = now_secs();

    assert!(cache.store(b"alpha", &Value::Int(42), 0, false));
    let entry = cache.find(b"alpha", now).expect("stored entry is findable");
    assert_eq!(entry.value(), Value::Int(42));
    cache.release(entry);

    let info = cache.info(true);
    assert_eq!(info.num_entries, 1);
    assert_eq!(info.num_hits, 1);
    assert_eq!(info.num_misses, 0);
    assert_eq!(info.num_inserts, 1);
    cache.destroy();
}

#[test]
fn exclusive_store_refuses_live_entries() {
    let cache = small_cache();
    let now = now_secs();

    assert!(cache.store(b"k", &Value::str("v1"), 60, true));
    assert!(!cache.store(b"k", &Value::str("v2"), 60, true));

    let entry = cache.find(b"k", now).unwrap();
    assert_eq!(entry.value(), Value::str("v1"));
    drop(entry);

    // A replacing store goes through.
    assert!(cache.store(b"k", &Value::str("v2"), 60, false));
    let entry = cache.find(b"k", now).unwrap();
    assert_eq!(entry.value(), Value::str("v2"));
    drop(entry);
    cache.destroy();
}

#[test]
fn hard_ttl_expires_on_read() {
    let cache = small_cache();
    let now = now_secs();

    assert!(cache.store(b"k", &Value::Int(1), 1, false));
    assert!(cache.exists(b"k", now));

    // Two seconds later the entry reads as a miss and is unlinked.
    assert!(cache.find(b"k", now + 2).is_none());
    let info = cache.info(true);
    assert_eq!(info.num_misses, 1);
    assert_eq!(info.num_entries, 0);
    cache.destroy();
}

#[test]
fn deferred_reclamation_waits_for_readers() {
    let cache = small_cache();
    let now = now_secs();

    assert!(cache.store(b"k", &Value::str("held"), 0, false));
    let held = cache.find(b"k", now).unwrap();

    assert!(cache.delete(b"k"));
    assert!(cache.find(b"k", now).is_none());

    // The reader's view stays intact while the slot sits on the
    // deleted list.
    assert_eq!(held.value(), Value::str("held"));
    let info = cache.info(false);
    assert_eq!(info.deleted_list.as_ref().unwrap().len(), 1);
    assert_eq!(info.num_entries, 0);

    drop(held);

    // The next store sweeps the pending list.
    assert!(cache.store(b"other", &Value::Int(5), 0, false));
    let info = cache.info(false);
    assert!(info.deleted_list.unwrap().is_empty());
    cache.destroy();
}

#[test]
fn release_restores_ref_count() {
    let cache = small_cache();
    let now = now_secs();
    assert!(cache.store(b"rc", &Value::Int(9), 0, false));

    let first = cache.find(b"rc", now).unwrap();
    assert_eq!(first.ref_count(), 1);
    let second = cache.find(b"rc", now).unwrap();
    assert_eq!(second.ref_count(), 2);
    drop(second);
    assert_eq!(first.ref_count(), 1);
    cache.release(first);

    let again = cache.find(b"rc", now).unwrap();
    assert_eq!(again.ref_count(), 1);
    drop(again);
    cache.destroy();
}

#[test]
fn delete_reports_absence() {
    let cache = small_cache();
    assert!(!cache.delete(b"missing"));
    assert!(cache.store(b"present", &Value::Null, 0, false));
    assert!(cache.delete(b"present"));
    assert!(!cache.delete(b"present"));
    cache.destroy();
}

#[test]
fn update_increments_scalars_in_place() {
    let cache = small_cache();
    let now = now_secs();
    assert!(cache.store(b"counter", &Value::Int(10), 0, false));

    let updated = cache.update(b"counter", |v| {
        if let Value::Int(i) = v {
            *i += 1;
            true
        } else {
            false
        }
    });
    assert!(updated);

    let entry = cache.find(b"counter", now).unwrap();
    assert_eq!(entry.value(), Value::Int(11));
    drop(entry);

    // Container values refuse in-place updates.
    let array = Value::array(
        [(ArrayKey::str("k"), Value::Int(1))].into_iter().collect(),
    );
    assert!(cache.store(b"arr", &array, 0, false));
    assert!(!cache.update(b"arr", |_| true));

    // A miss is a false, and an updater returning false sticks.
    assert!(!cache.update(b"missing", |_| true));
    assert!(!cache.update(b"counter", |_| false));
    cache.destroy();
}

#[test]
fn store_all_inserts_string_keys_and_bails_on_failure() {
    let cache = small_cache();
    let now = now_secs();

    let mut batch = ArrayValue::new();
    batch.insert(ArrayKey::str("one"), Value::Int(1));
    batch.insert(ArrayKey::Int(99), Value::Int(2)); // integer keys are skipped
    batch.insert(ArrayKey::str("two"), Value::Int(2));

    let results = cache.store_all(&batch, 0, false);
    assert!(results.is_empty());
    assert!(cache.exists(b"one", now));
    assert!(cache.exists(b"two", now));
    assert!(!cache.exists(b"99", now));

    // Exclusive mode: an existing key fails its slot in the batch and
    // stops the walk there.
    let mut second = ArrayValue::new();
    second.insert(ArrayKey::str("one"), Value::Int(7));
    second.insert(ArrayKey::str("three"), Value::Int(3));
    let results = cache.store_all(&second, 0, true);
    assert_eq!(results.get(b"one".as_slice()), Some(&-1));
    assert!(!cache.exists(b"three", now));
    cache.destroy();
}

#[test]
fn slam_defense_suppresses_the_second_writer() {
    // Thread owners only diverge in threading mode; in process mode
    // both writers here would share a pid.
    let cache = Arc::new(cache_with(CacheConfig {
        shm_size: 4 << 20,
        threading: true,
        ..CacheConfig::default()
    }));

    // Both stores must land in the same second for the defense to
    // consider them a slam; retry across second boundaries.
    let mut attempts = 0;
    loop {
        attempts += 1;
        cache.clear();
        let before = now_secs();

        assert!(cache.store(b"slam", &Value::str("first"), 0, false));
        let peer = Arc::clone(&cache);
        let second = std::thread::spawn(move || peer.store(b"slam", &Value::str("second"), 0, false))
            .join()
            .unwrap();
        assert!(second, "a suppressed duplicate still reports success");

        if now_secs() == before {
            // Same second: exactly one insert happened and the first
            // writer's value survived.
            let info = cache.info(true);
            assert_eq!(info.num_inserts, 1);
            let entry = cache.find(b"slam", now_secs()).unwrap();
            assert_eq!(entry.value(), Value::str("first"));
            drop(entry);
            break;
        }
        assert!(attempts < 16, "could not land two stores in one second");
    }
    match Arc::try_unwrap(cache) {
        Ok(cache) => cache.destroy(),
        Err(_) => unreachable!(),
    }
}

#[test]
fn clear_resets_everything_but_start_time() {
    let cache = small_cache();
    let now = now_secs();

    for i in 0..10u8 {
        assert!(cache.store(&[b'k', i], &Value::Int(i as i64), 0, false));
    }
    drop(cache.find(b"\x6b\x00", now)); // one hit
    let start = cache.info(true).start_time;

    cache.clear();

    let info = cache.info(false);
    assert_eq!(info.num_entries, 0);
    assert_eq!(info.num_hits, 0);
    assert_eq!(info.num_misses, 0);
    assert_eq!(info.num_inserts, 0);
    assert_eq!(info.mem_size, 0);
    assert!(info.cache_list.unwrap().is_empty());
    assert!(info.start_time >= start);
    cache.destroy();
}

#[test]
fn bucket_count_comes_from_the_prime_table() {
    let small = cache_with(CacheConfig {
        shm_size: 4 << 20,
        size_hint: 0,
        ..CacheConfig::default()
    });
    assert_eq!(small.info(true).num_slots, 2053);
    small.destroy();

    let huge = cache_with(CacheConfig {
        shm_size: 4 << 20,
        size_hint: 1_000_000,
        ..CacheConfig::default()
    });
    assert_eq!(huge.info(true).num_slots, 19457);
    huge.destroy();
}

#[test]
fn values_round_trip_with_shared_subtrees() {
    let cache = small_cache();
    let now = now_secs();

    let shared = Rc::new(std::cell::RefCell::new(
        [(ArrayKey::str("inner"), Value::Int(1))].into_iter().collect::<ArrayValue>(),
    ));
    let root = Value::array(
        [
            (ArrayKey::str("a"), Value::Array(Rc::clone(&shared))),
            (ArrayKey::str("b"), Value::Array(shared)),
        ]
        .into_iter()
        .collect(),
    );

    assert!(cache.store(b"graph", &root, 0, false));
    let entry = cache.find(b"graph", now).unwrap();
    let out = entry.value();
    assert_eq!(out, root);

    let Value::Array(out) = out else { panic!() };
    let out = out.borrow();
    let (Some(Value::Array(a)), Some(Value::Array(b))) =
        (out.get(&ArrayKey::str("a")), out.get(&ArrayKey::str("b")))
    else {
        panic!()
    };
    assert!(Rc::ptr_eq(a, b), "sharing survives the cache round trip");
    drop(entry);
    cache.destroy();
}

#[test]
fn info_snapshots_live_and_deleted_slots() {
    let cache = small_cache();
    let now = now_secs();

    assert!(cache.store(b"watched", &Value::str("x"), 30, false));
    let held = cache.find(b"watched", now).unwrap();

    let info = cache.info(false);
    let list = info.cache_list.unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].identifier, b"watched");
    assert_eq!(list[0].ttl, 30);
    assert_eq!(list[0].num_hits, 1);
    assert_eq!(list[0].ref_count, 1);
    assert!(list[0].mem_size > 0);
    assert_eq!(info.slot_distribution.unwrap().len(), 1);

    cache.delete(b"watched");
    let info = cache.info(false);
    let deleted = info.deleted_list.unwrap();
    assert_eq!(deleted.len(), 1);
    assert!(deleted[0].deletion_time >= now);
    drop(held);
    cache.destroy();
}

#[test]
fn configured_serializer_resolves_lazily_by_name() {
    use shmcache::{register_serializer, Serializer};

    /// Default framing behind an XOR mask, so a plain default decode
    /// of the payload would fail.
    struct MaskedSerializer;

    impl Serializer for MaskedSerializer {
        fn name(&self) -> &'static str {
            "masked"
        }
        fn serialize(&self, value: &Value) -> Option<Vec<u8>> {
            let mut bytes = shmcache::default_serializer().serialize(value)?;
            for b in &mut bytes {
                *b ^= 0x5A;
            }
            Some(bytes)
        }
        fn unserialize(&self, bytes: &[u8]) -> Option<Value> {
            let unmasked: Vec<u8> = bytes.iter().map(|b| b ^ 0x5A).collect();
            shmcache::default_serializer().unserialize(&unmasked)
        }
    }

    register_serializer(Arc::new(MaskedSerializer));

    let cache = cache_with(CacheConfig {
        shm_size: 4 << 20,
        serializer_name: Some("masked".to_string()),
        ..CacheConfig::default()
    });
    let now = now_secs();

    // With a serializer configured, whole arrays travel through it.
    let array = Value::array(
        [(ArrayKey::str("n"), Value::Int(1))].into_iter().collect(),
    );
    assert!(cache.store(b"masked-array", &array, 0, false));
    let entry = cache.find(b"masked-array", now).unwrap();
    assert_eq!(entry.value(), array);
    drop(entry);
    cache.destroy();
}

#[test]
fn preload_path_in_config_seeds_the_cache_at_create() {
    let dir = tempfile::tempdir().unwrap();
    let bytes = shmcache::default_serializer()
        .serialize(&Value::str("seeded"))
        .unwrap();
    std::fs::write(dir.path().join("boot.data"), bytes).unwrap();

    let cache = cache_with(CacheConfig {
        shm_size: 4 << 20,
        preload_path: Some(dir.path().to_path_buf()),
        ..CacheConfig::default()
    });
    let entry = cache.find(b"boot", now_secs()).unwrap();
    assert_eq!(entry.value(), Value::str("seeded"));
    drop(entry);
    cache.destroy();
}

#[test]
fn concurrent_writers_and_readers_stay_consistent() {
    let cache = Arc::new(small_cache());
    let threads: Vec<_> = (0..4u8)
        .map(|t| {
            let cache = Arc::clone(&cache);
            std::thread::spawn(move || {
                let now = now_secs();
                for i in 0..50u8 {
                    let key = [b'w', t, i];
                    assert!(cache.store(&key, &Value::Int((t as i64) << 8 | i as i64), 0, false));
                    let entry = cache.find(&key, now).expect("own key is visible");
                    assert_eq!(entry.value(), Value::Int((t as i64) << 8 | i as i64));
                    drop(entry);
                }
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }

    let info = cache.info(true);
    assert_eq!(info.num_entries, 200);
    assert_eq!(info.num_inserts, 200);
    match Arc::try_unwrap(cache) {
        Ok(cache) => cache.destroy(),
        Err(_) => unreachable!(),
    }
}
