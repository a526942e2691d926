//! The cache engine: a prime-sized bucket table of chained slots in
//! shared memory, with per-slot locks, deferred reclamation of entries
//! still held by readers, a pressure-driven expunge policy, and a
//! single-slot "lastkey" filter that suppresses duplicate inserts.
//!
//! Lock order: a thread holds at most one slot lock at a time and may
//! take the header lock briefly while holding it, never the reverse.
//! The lastkey lock is leaf-only. Counters are atomics and are not
//! linearizable with the operations they count.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use hashbrown::HashMap;
use log::{debug, error, warn};

use crate::config::CacheConfig;
use crate::copy::{fetch_value, rewrite_scalar, store_value, CopyContext, CopyMode};
use crate::pool::Pool;
use crate::serializer::{find_serializer, Serializer};
use crate::shm::layout::{
    cache_shell_size, CacheHeader, EntryRecord, SlotRecord, ValueRecord, CACHE_HEADER_SIZE,
    KIND_ARRAY, KIND_OBJECT, NONE, SLOT_RECORD_SIZE, VFLAG_SERIALIZED,
};
use crate::shm::{InterruptGuard, Sma, ShmMutex};
use crate::value::{hash_bytes, ArrayKey, ArrayValue, Value};

/// Bucket counts step up in ~1k increments; the last prime wins for
/// any larger hint.
const PRIMES: [usize; 21] = [
    257, 521, 1031, 2053, 3079, 4099, 5147, 6151, 7177, 8209, 9221, 10243, 11273, 12289, 13313,
    14341, 15361, 16411, 17417, 18433, 19457,
];

/// Smallest tabulated prime at or above `n`.
pub(crate) fn make_prime(n: usize) -> usize {
    for &p in PRIMES.iter() {
        if p >= n {
            return p;
        }
    }
    PRIMES[PRIMES.len() - 1]
}

/// Seconds since the epoch; the clock every TTL decision uses.
pub fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

static CREATE_SEQ: AtomicU64 = AtomicU64::new(0);

fn self_owner(threading: bool) -> u64 {
    let pid = std::process::id() as u64;
    if !threading {
        return pid;
    }
    static NEXT_THREAD: AtomicU64 = AtomicU64::new(1);
    thread_local! {
        static OWNER: u64 = NEXT_THREAD.fetch_add(1, Ordering::Relaxed);
    }
    (pid << 32) | OWNER.with(|o| *o)
}

/// A materialized key: identifier bytes plus their stable hash, the
/// second it was built, and the id of the writer building it. Owner
/// assignment happens here, never inside the defense check.
struct CacheKey<'a> {
    identifier: &'a [u8],
    h: u64,
    mtime: i64,
    owner: u64,
}

impl<'a> CacheKey<'a> {
    fn new(identifier: &'a [u8], now: i64, threading: bool) -> CacheKey<'a> {
        CacheKey {
            identifier,
            h: hash_bytes(identifier),
            mtime: now,
            owner: self_owner(threading),
        }
    }
}

/// Per-slot descriptor returned by a full `info` snapshot.
#[derive(Clone, Debug)]
pub struct SlotInfo {
    pub identifier: Vec<u8>,
    pub ttl: u32,
    pub num_hits: u64,
    pub mtime: i64,
    pub creation_time: i64,
    pub deletion_time: i64,
    pub access_time: i64,
    pub ref_count: i32,
    pub mem_size: u64,
}

/// Read-only snapshot of cache state.
#[derive(Clone, Debug, Default)]
pub struct CacheInfo {
    pub num_slots: usize,
    pub ttl: u32,
    pub num_hits: u64,
    pub num_misses: u64,
    pub num_inserts: u64,
    pub expunges: u64,
    pub start_time: i64,
    pub mem_size: u64,
    pub num_entries: u64,
    /// Live slots, in bucket order; `None` on a limited snapshot.
    pub cache_list: Option<Vec<SlotInfo>>,
    /// Slots awaiting reclamation; `None` on a limited snapshot.
    pub deleted_list: Option<Vec<SlotInfo>>,
    /// `(bucket index, chain length)` for non-empty buckets.
    pub slot_distribution: Option<Vec<(usize, u64)>>,
}

/// A borrowed reference to a found entry. Dropping it releases the
/// reader reference; `Cache::release` does the same explicitly.
pub struct EntryHandle<'a> {
    inner: &'a CacheInner,
    entry: u64,
}

impl EntryHandle<'_> {
    /// Copy the cached value out into a fresh native graph.
    pub fn value(&self) -> Value {
        let serializer = self.inner.serializer();
        unsafe { fetch_value(&self.inner.sma, self.inner.entry_rec(self.entry).value, serializer.as_ref()) }
    }

    pub fn ttl(&self) -> u32 {
        unsafe { self.inner.entry_rec(self.entry).ttl }
    }

    pub fn mem_size(&self) -> u64 {
        unsafe { self.inner.entry_rec(self.entry).mem_size }
    }

    pub fn ref_count(&self) -> i32 {
        unsafe { self.inner.entry_rec(self.entry).ref_count.load(Ordering::Relaxed) }
    }
}

impl Drop for EntryHandle<'_> {
    fn drop(&mut self) {
        unsafe {
            self.inner
                .entry_rec(self.entry)
                .ref_count
                .fetch_sub(1, Ordering::Relaxed);
        }
    }
}

/// The shared-memory user-data cache.
pub struct Cache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    sma: Arc<Sma>,
    /// Offset of the cache shell (header + bucket table) in the region.
    shell: u64,
    num_slots: usize,
    ttl: u32,
    gc_ttl: u32,
    slam_defense: bool,
    threading: bool,
    serializer_name: Option<String>,
    serializer: OnceLock<Option<Arc<dyn Serializer>>>,
    header_lock: ShmMutex,
    lastkey_lock: ShmMutex,
    owns_region: bool,
}

unsafe impl Send for CacheInner {}
unsafe impl Sync for CacheInner {}

impl Cache {
    /// Create a cache over a fresh private region sized by
    /// `config.shm_size`.
    pub fn create(config: &CacheConfig) -> io::Result<Cache> {
        let name = format!(
            "shmcache-{}-{}",
            std::process::id(),
            CREATE_SEQ.fetch_add(1, Ordering::Relaxed)
        );
        let sma = Sma::create(&name, config.shm_size)?;
        Self::build(sma, config, true)
    }

    /// Create a cache over an allocator the host already owns (and may
    /// share with other caches).
    pub fn create_ex(sma: Arc<Sma>, config: &CacheConfig) -> io::Result<Cache> {
        Self::build(sma, config, false)
    }

    fn build(sma: Arc<Sma>, config: &CacheConfig, owns_region: bool) -> io::Result<Cache> {
        let num_slots = make_prime(config.size_hint.max(2000));
        let shell = sma.alloc(cache_shell_size(num_slots)).ok_or_else(|| {
            error!(
                "unable to allocate shared memory for cache structures \
                 (perhaps your shared memory size isn't large enough?)"
            );
            io::Error::new(io::ErrorKind::OutOfMemory, "cache shell allocation failed")
        })?;

        let (header_lock, lastkey_lock) = unsafe {
            std::ptr::write_bytes(sma.ptr(shell), 0, cache_shell_size(num_slots));
            let header = sma.deref_mut::<CacheHeader>(shell);
            header.start_time = now_secs();
            header.deleted_list = NONE;
            (
                ShmMutex::init(&mut header.lock)?,
                ShmMutex::init(&mut header.lastkey_lock)?,
            )
        };

        let inner = Arc::new(CacheInner {
            sma: Arc::clone(&sma),
            shell,
            num_slots,
            ttl: config.ttl,
            gc_ttl: config.gc_ttl,
            slam_defense: config.slam_defense,
            threading: config.threading,
            serializer_name: config.serializer_name.clone(),
            serializer: OnceLock::new(),
            header_lock,
            lastkey_lock,
            owns_region,
        });

        // Hang the expunge policy off the allocator: a failed alloc
        // runs it once, then the allocation is retried.
        let weak: Weak<CacheInner> = Arc::downgrade(&inner);
        sma.set_pressure_hook(Box::new(move |requested| {
            if let Some(cache) = weak.upgrade() {
                cache.expunge(requested);
            }
        }));

        let cache = Cache { inner };
        if let Some(path) = &config.preload_path {
            crate::preload::preload(&cache, path);
        }
        Ok(cache)
    }

    /// Tear down the embedded header locks. The SMA-backed shell is
    /// knowingly leaked: other processes may still be traversing it.
    pub fn destroy(self) {
        unsafe {
            self.inner.header_lock.destroy();
            self.inner.lastkey_lock.destroy();
        }
        if self.inner.owns_region {
            let _ = self.inner.sma.unlink();
        }
    }

    /// Copy `value` into the cache under `identifier`.
    /// `exclusive` refuses to replace a live, unexpired entry.
    pub fn store(&self, identifier: &[u8], value: &Value, ttl: u32, exclusive: bool) -> bool {
        let _guard = InterruptGuard::new();
        self.inner
            .store_one(identifier, value, ttl, exclusive, now_secs(), false)
    }

    /// Batch insert of every string-keyed element of `data`. Bails on
    /// the first failure, recording `-1` for the failing key in the
    /// result map; interrupts stay masked across the whole batch.
    pub fn store_all(
        &self,
        data: &ArrayValue,
        ttl: u32,
        exclusive: bool,
    ) -> HashMap<Vec<u8>, i64> {
        let mut results = HashMap::new();
        let now = now_secs();
        let _guard = InterruptGuard::new();

        for (key, value) in data.iter() {
            let ArrayKey::Str(skey) = key else { continue };
            if !self.inner.store_one(skey.as_bytes(), value, ttl, exclusive, now, true) {
                results.insert(skey.as_bytes().to_vec(), -1);
                break;
            }
        }
        results
    }

    /// Look up `identifier`; on a hit the entry's refcount is bumped
    /// and a handle returned. Every handle must be dropped (or passed
    /// to `release`) exactly once.
    pub fn find(&self, identifier: &[u8], now: i64) -> Option<EntryHandle<'_>> {
        self.inner.find(identifier, now)
    }

    /// Like `find`, but touches neither refcounts nor statistics.
    pub fn exists(&self, identifier: &[u8], now: i64) -> bool {
        self.inner.exists(identifier, now)
    }

    /// Run `updater` against the live value for `identifier`, writing
    /// scalars back in place. Containers and objects are refused.
    pub fn update(&self, identifier: &[u8], updater: impl FnOnce(&mut Value) -> bool) -> bool {
        self.inner.update(identifier, updater)
    }

    /// Unlink the matching slot. Valid regardless of the busy flag and
    /// of outstanding reader references.
    pub fn delete(&self, identifier: &[u8]) -> bool {
        self.inner.delete(identifier)
    }

    /// Drop a handle obtained from `find`.
    pub fn release(&self, entry: EntryHandle<'_>) {
        drop(entry);
    }

    /// Empty the cache and reset every counter except `start_time`.
    pub fn clear(&self) {
        self.inner.clear();
    }

    /// Snapshot counters; with `limited == false`, also every live and
    /// pending-delete slot plus the bucket occupancy distribution.
    pub fn info(&self, limited: bool) -> CacheInfo {
        self.inner.info(limited)
    }

    pub(crate) fn inner_threading(&self) -> bool {
        self.inner.threading
    }

    pub(crate) fn effective_serializer(&self) -> Arc<dyn Serializer> {
        self.inner
            .serializer()
            .unwrap_or_else(crate::serializer::default_serializer)
    }
}

impl CacheInner {
    unsafe fn header(&self) -> &CacheHeader {
        self.sma.deref::<CacheHeader>(self.shell)
    }

    #[allow(clippy::mut_from_ref)]
    unsafe fn header_mut(&self) -> &mut CacheHeader {
        self.sma.deref_mut::<CacheHeader>(self.shell)
    }

    /// Offset of the cell holding the head of `h`'s bucket chain.
    fn bucket_cell(&self, h: u64) -> u64 {
        self.shell + CACHE_HEADER_SIZE as u64 + (h % self.num_slots as u64) * 8
    }

    fn bucket_cell_at(&self, index: usize) -> u64 {
        self.shell + CACHE_HEADER_SIZE as u64 + index as u64 * 8
    }

    unsafe fn slot(&self, off: u64) -> &SlotRecord {
        self.sma.deref::<SlotRecord>(off)
    }

    #[allow(clippy::mut_from_ref)]
    unsafe fn slot_mut(&self, off: u64) -> &mut SlotRecord {
        self.sma.deref_mut::<SlotRecord>(off)
    }

    unsafe fn entry_rec(&self, off: u64) -> &EntryRecord {
        self.sma.deref::<EntryRecord>(off)
    }

    unsafe fn slot_lock(&self, off: u64) -> ShmMutex {
        ShmMutex::from_existing(&mut self.slot_mut(off).lock)
    }

    /// Offset of a slot's `next` cell, usable as a chain link.
    fn next_cell(&self, slot_off: u64) -> u64 {
        slot_off + std::mem::offset_of!(SlotRecord, next) as u64
    }

    fn deleted_list_cell(&self) -> u64 {
        self.shell + std::mem::offset_of!(CacheHeader, deleted_list) as u64
    }

    fn busy(&self) -> bool {
        unsafe { self.header().busy.load(Ordering::SeqCst) != 0 }
    }

    /// Resolve the configured serializer name once, lazily.
    fn serializer(&self) -> Option<Arc<dyn Serializer>> {
        self.serializer
            .get_or_init(|| {
                let name = self.serializer_name.as_deref()?;
                let found = find_serializer(name);
                if found.is_none() {
                    warn!("serializer '{name}' is not registered; values copy structurally");
                }
                found
            })
            .clone()
    }

    unsafe fn identifier_matches(&self, slot: &SlotRecord, identifier: &[u8]) -> bool {
        slot.identifier_len as usize == identifier.len()
            && self.sma.bytes(slot.identifier, identifier.len()) == identifier
    }

    /// The slam defense: a single lastkey fingerprint under its own
    /// lock. Returns true when this store duplicates another writer's
    /// insert from the same second and should be skipped.
    fn defense(&self, key: &CacheKey) -> bool {
        if !self.slam_defense {
            return false;
        }
        let _guard = self.lastkey_lock.lock();
        unsafe {
            let last = &mut self.header_mut().lastkey;
            if last.h == key.h
                && last.identifier_len == key.identifier.len() as u32
                && last.mtime == key.mtime
                && last.owner != key.owner
            {
                debug!(
                    "potential cache slam averted for key '{}'",
                    String::from_utf8_lossy(key.identifier)
                );
                return true;
            }
            last.h = key.h;
            last.identifier_len = key.identifier.len() as u32;
            last.mtime = key.mtime;
            last.owner = key.owner;
        }
        false
    }

    fn clear_lastkey(&self) {
        let _guard = self.lastkey_lock.lock();
        unsafe {
            let last = &mut self.header_mut().lastkey;
            last.h = 0;
            last.identifier_len = 0;
            last.mtime = 0;
            last.owner = 0;
        }
    }

    /// One store: defense, fresh pool, deep copy, insert. `quick`
    /// skips the busy check and opportunistic GC (batch path).
    fn store_one(
        &self,
        identifier: &[u8],
        value: &Value,
        ttl: u32,
        exclusive: bool,
        now: i64,
        quick: bool,
    ) -> bool {
        if identifier.is_empty() || identifier.len() > u32::MAX as usize {
            return false;
        }
        let key = CacheKey::new(identifier, now, self.threading);

        // A suppressed duplicate reports success so the caller does
        // not recompute and thrash.
        if self.defense(&key) {
            return true;
        }

        let Some(pool) = Pool::create(&self.sma) else {
            error!("unable to allocate memory for a cache entry pool");
            return false;
        };

        let inserted = match self.make_entry(value, &pool, ttl) {
            Some(entry_off) => {
                if quick {
                    self.quick_insert(&key, entry_off, &pool, now, exclusive)
                } else {
                    self.insert(&key, entry_off, &pool, now, exclusive)
                }
            }
            None => false,
        };

        // In any case of failure the pool (and the partial copy inside
        // it) is destroyed.
        if !inserted {
            pool.destroy();
        }
        inserted
    }

    /// Build the entry record and the deep copy inside `pool`.
    fn make_entry(&self, value: &Value, pool: &Pool, ttl: u32) -> Option<u64> {
        let entry_off = pool.alloc(std::mem::size_of::<EntryRecord>())?;
        let ctx = CopyContext {
            pool,
            mode: CopyMode::In,
            serializer: self.serializer(),
        };
        let value_off = store_value(value, &ctx)?;
        unsafe {
            let entry = self.sma.deref_mut::<EntryRecord>(entry_off);
            entry.value = value_off;
            entry.pool = pool.record_off();
            entry.mem_size = 0;
            entry.ttl = ttl;
            entry.ref_count.store(0, Ordering::Relaxed);
        }
        Some(entry_off)
    }

    /// Busy check plus opportunistic GC, then the chain insert.
    fn insert(&self, key: &CacheKey, entry_off: u64, pool: &Pool, now: i64, exclusive: bool) -> bool {
        if self.busy() {
            return false;
        }
        self.process_pending_removals();
        self.quick_insert(key, entry_off, pool, now, exclusive)
    }

    /// The insertion protocol: walk the bucket, expire stale siblings
    /// on touch, replace or reject a live match, then link a new slot
    /// at the head of the chain.
    fn quick_insert(
        &self,
        key: &CacheKey,
        entry_off: u64,
        pool: &Pool,
        now: i64,
        exclusive: bool,
    ) -> bool {
        // The slot record and identifier copy are pool allocations;
        // making them before any lock is held keeps allocator pressure
        // callbacks from re-entering a held lock.
        let Some(slot_off) = pool.alloc(SLOT_RECORD_SIZE) else {
            return false;
        };
        let Some(id_off) = pool.alloc_bytes(key.identifier) else {
            return false;
        };
        unsafe {
            let slot = self.slot_mut(slot_off);
            if ShmMutex::init(&mut slot.lock).is_err() {
                return false;
            }
            slot.h = key.h;
            slot.identifier = id_off;
            slot.identifier_len = key.identifier.len() as u32;
            slot.mtime = key.mtime;
            slot.owner = key.owner;
            slot.entry = entry_off;
            slot.next = NONE;
            slot.num_hits = 0;
            slot.creation_time = now;
            slot.access_time = now;
            slot.deletion_time = 0;
        }

        let bucket = self.bucket_cell(key.h);
        let mut link = bucket;
        loop {
            let cur = unsafe { *self.sma.deref::<u64>(link) };
            if cur == NONE {
                break;
            }
            let lock = unsafe { self.slot_lock(cur) };
            let guard = lock.lock();
            let (matched, stale, next_link) = unsafe {
                let slot = self.slot(cur);
                let entry = self.entry_rec(slot.entry);
                if slot.h == key.h && self.identifier_matches(slot, key.identifier) {
                    // Exclusive adds bail when the existing entry has
                    // no TTL or has not timed out yet.
                    if exclusive
                        && (entry.ttl == 0 || slot.creation_time + entry.ttl as i64 >= now)
                    {
                        return false;
                    }
                    (true, false, 0)
                } else {
                    // Runtime cleanup of the chain: drop entries idle
                    // past the cache TTL or dead past their own.
                    let stale = (self.ttl > 0 && slot.access_time < now - self.ttl as i64)
                        || (entry.ttl > 0 && slot.creation_time + (entry.ttl as i64) < now);
                    (false, stale, self.next_cell(cur))
                }
            };
            drop(guard);

            if matched {
                self.remove_slot(link, cur, now);
                break;
            }
            if stale {
                // The chain head shifted into this link; examine it
                // again without advancing.
                self.remove_slot(link, cur, now);
            } else {
                link = next_link;
            }
        }

        {
            let _guard = self.header_lock.lock();
            unsafe {
                let head = self.sma.deref_mut::<u64>(bucket);
                self.slot_mut(slot_off).next = *head;
                *head = slot_off;
            }
        }

        unsafe {
            let entry = self.sma.deref_mut::<EntryRecord>(entry_off);
            entry.mem_size = pool.size();
            let header = self.header();
            header.mem_size.fetch_add(entry.mem_size, Ordering::Relaxed);
            header.num_entries.fetch_add(1, Ordering::Relaxed);
            header.num_inserts.fetch_add(1, Ordering::Relaxed);
        }
        true
    }

    fn find(&self, identifier: &[u8], now: i64) -> Option<EntryHandle<'_>> {
        if self.busy() {
            // structural reorganization in progress
            return None;
        }
        let h = hash_bytes(identifier);
        let mut link = self.bucket_cell(h);

        loop {
            let cur = unsafe { *self.sma.deref::<u64>(link) };
            if cur == NONE {
                break;
            }
            let lock = unsafe { self.slot_lock(cur) };
            let guard = lock.lock();
            unsafe {
                let slot = self.slot_mut(cur);
                if slot.h == h && self.identifier_matches(slot, identifier) {
                    let entry = self.entry_rec(slot.entry);
                    if entry.ttl > 0 && slot.creation_time + (entry.ttl as i64) < now {
                        drop(guard);
                        // Expired on read: unlink and count a miss.
                        self.remove_slot(link, cur, now);
                        self.header().num_misses.fetch_add(1, Ordering::Relaxed);
                        return None;
                    }

                    slot.num_hits += 1;
                    slot.access_time = now;
                    entry.ref_count.fetch_add(1, Ordering::Relaxed);
                    self.header().num_hits.fetch_add(1, Ordering::Relaxed);
                    let entry_off = slot.entry;
                    drop(guard);
                    return Some(EntryHandle {
                        inner: self,
                        entry: entry_off,
                    });
                }
            }
            let next_link = self.next_cell(cur);
            drop(guard);
            link = next_link;
        }

        unsafe {
            self.header().num_misses.fetch_add(1, Ordering::Relaxed);
        }
        None
    }

    fn exists(&self, identifier: &[u8], now: i64) -> bool {
        if self.busy() {
            return false;
        }
        let h = hash_bytes(identifier);
        let mut link = self.bucket_cell(h);

        loop {
            let cur = unsafe { *self.sma.deref::<u64>(link) };
            if cur == NONE {
                return false;
            }
            let lock = unsafe { self.slot_lock(cur) };
            let guard = lock.lock();
            unsafe {
                let slot = self.slot(cur);
                if slot.h == h && self.identifier_matches(slot, identifier) {
                    let entry = self.entry_rec(slot.entry);
                    // Expired entries read as absent but stay linked.
                    return !(entry.ttl > 0 && slot.creation_time + (entry.ttl as i64) < now);
                }
            }
            let next_link = self.next_cell(cur);
            drop(guard);
            link = next_link;
        }
    }

    fn update(&self, identifier: &[u8], updater: impl FnOnce(&mut Value) -> bool) -> bool {
        if self.busy() {
            return false;
        }
        let now = now_secs();
        let h = hash_bytes(identifier);
        let mut link = self.bucket_cell(h);

        loop {
            let cur = unsafe { *self.sma.deref::<u64>(link) };
            if cur == NONE {
                return false;
            }
            let lock = unsafe { self.slot_lock(cur) };
            let guard = lock.lock();
            let entry_off = unsafe {
                let slot = self.slot_mut(cur);
                if slot.h == h && self.identifier_matches(slot, identifier) {
                    let entry = self.entry_rec(slot.entry);
                    let rec = self.sma.deref::<ValueRecord>(entry.value);

                    // Serialized forms would need re-serialization and
                    // container graphs cannot be rewritten in place.
                    if rec.kind == KIND_ARRAY || rec.kind == KIND_OBJECT {
                        return false;
                    }
                    if rec.flags & VFLAG_SERIALIZED != 0 {
                        return false;
                    }

                    // Hold a reader reference across the write-back so
                    // a pressure expunge fired by pool growth defers
                    // this entry instead of freeing it underneath us.
                    entry.ref_count.fetch_add(1, Ordering::Relaxed);
                    slot.mtime = now;
                    slot.entry
                } else {
                    NONE
                }
            };
            let next_link = self.next_cell(cur);
            drop(guard);

            if entry_off == NONE {
                link = next_link;
                continue;
            }

            // The write-back may grow the entry's pool, and a failed
            // pool allocation fires the expunge callback, whose TTL
            // sweep takes every slot lock in turn. The slot lock is
            // released above so that sweep can never relock it on this
            // thread; the held reference keeps the records alive.
            let written = unsafe {
                let entry = self.entry_rec(entry_off);
                let mut value = fetch_value(&self.sma, entry.value, None);
                if updater(&mut value) {
                    let pool = Pool::attach(&self.sma, entry.pool);
                    rewrite_scalar(&pool, entry.value, &value, CopyMode::Other)
                } else {
                    false
                }
            };
            unsafe {
                self.entry_rec(entry_off)
                    .ref_count
                    .fetch_sub(1, Ordering::Relaxed);
            }
            return written;
        }
    }

    fn delete(&self, identifier: &[u8]) -> bool {
        let now = now_secs();
        let h = hash_bytes(identifier);
        let mut link = self.bucket_cell(h);

        loop {
            let cur = unsafe { *self.sma.deref::<u64>(link) };
            if cur == NONE {
                return false;
            }
            let lock = unsafe { self.slot_lock(cur) };
            let guard = lock.lock();
            let matched = unsafe {
                let slot = self.slot(cur);
                slot.h == h && self.identifier_matches(slot, identifier)
            };
            let next_link = self.next_cell(cur);
            drop(guard);

            if matched {
                self.remove_slot(link, cur, now);
                return true;
            }
            link = next_link;
        }
    }

    /// The unlink primitive. Splices the slot out of whatever chain
    /// `link` belongs to, settles the header counters, then frees the
    /// pool immediately or parks the slot on the deleted list while
    /// readers finish. Interrupts are masked across the window.
    fn remove_slot(&self, link: u64, dead: u64, now: i64) {
        let _interrupts = InterruptGuard::new();
        unsafe {
            let entry_off;
            {
                let _guard = self.header_lock.lock();
                let slot = self.slot_mut(dead);
                *self.sma.deref_mut::<u64>(link) = slot.next;
                entry_off = slot.entry;
                let entry = self.entry_rec(entry_off);
                let header = self.header();
                header.mem_size.fetch_sub(entry.mem_size, Ordering::Relaxed);
                header.num_entries.fetch_sub(1, Ordering::Relaxed);
            }

            if self.entry_rec(entry_off).ref_count.load(Ordering::Relaxed) <= 0 {
                self.free_slot(dead);
            } else {
                let _guard = self.header_lock.lock();
                let header = self.header_mut();
                let slot = self.slot_mut(dead);
                slot.next = header.deleted_list;
                slot.deletion_time = now;
                header.deleted_list = dead;
            }
        }
    }

    /// Destroy the slot's lock and release its pool — slot, key and
    /// value go together.
    fn free_slot(&self, dead: u64) {
        unsafe {
            let lock = self.slot_lock(dead);
            // Wait out any thread still inspecting the slot.
            drop(lock.lock());
            lock.destroy();
            let pool_off = self.entry_rec(self.slot(dead).entry).pool;
            Pool::attach(&self.sma, pool_off).destroy();
        }
    }

    /// Sweep the deleted list: free entries nobody reads anymore, and
    /// force-free entries parked longer than `gc_ttl` with a warning.
    /// The header lock is taken and released per node so no free runs
    /// inside it; `next` is staged under the lock before any unlink.
    fn process_pending_removals(&self) {
        unsafe {
            if self.header().deleted_list == NONE {
                return;
            }
        }
        let now = now_secs();
        let mut link = self.deleted_list_cell();

        loop {
            let mut freed = NONE;
            {
                let _guard = self.header_lock.lock();
                unsafe {
                    let cur = *self.sma.deref::<u64>(link);
                    if cur == NONE {
                        break;
                    }
                    let slot = self.slot(cur);
                    let staged_next = slot.next;
                    let refs = self.entry_rec(slot.entry).ref_count.load(Ordering::Relaxed);
                    let gc_secs = if self.gc_ttl > 0 {
                        now - slot.deletion_time
                    } else {
                        0
                    };

                    if refs <= 0 || gc_secs > self.gc_ttl as i64 {
                        if refs > 0 {
                            warn!(
                                "GC cache entry '{}' was on gc-list for {} seconds",
                                String::from_utf8_lossy(
                                    self.sma.bytes(slot.identifier, slot.identifier_len as usize)
                                ),
                                gc_secs
                            );
                        }
                        *self.sma.deref_mut::<u64>(link) = staged_next;
                        freed = cur;
                    } else {
                        link = self.next_cell(cur);
                    }
                }
            }
            if freed != NONE {
                self.free_slot(freed);
            }
        }
    }

    /// Unlink every slot in every bucket and reset the lastkey.
    fn real_expunge(&self, now: i64) {
        for index in 0..self.num_slots {
            let cell = self.bucket_cell_at(index);
            loop {
                let head = unsafe { *self.sma.deref::<u64>(cell) };
                if head == NONE {
                    break;
                }
                self.remove_slot(cell, head, now);
            }
        }
        self.clear_lastkey();
    }

    /// The pressure-driven expunge policy. Invoked by the allocator
    /// with the size of the allocation that failed.
    fn expunge(&self, requested: usize) {
        let now = now_secs();
        unsafe {
            // Back off if another expunge or clear is already running.
            if self
                .header()
                .busy
                .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return;
            }
        }

        self.process_pending_removals();

        let half = self.sma.total_size() / 2;
        if self.ttl == 0 {
            // Without a cache TTL there is nothing selective to do:
            // wipe everything once memory is genuinely tight.
            if self.sma.avail_mem() < half {
                unsafe {
                    self.header().expunges.fetch_add(1, Ordering::Relaxed);
                }
                self.real_expunge(now);
            }
        } else if self.sma.avail_mem() < half {
            unsafe {
                self.header().expunges.fetch_add(1, Ordering::Relaxed);
            }

            // Sweep entries dead by their own TTL, falling back to the
            // cache TTL for entries without one.
            for index in 0..self.num_slots {
                let mut link = self.bucket_cell_at(index);
                loop {
                    let cur = unsafe { *self.sma.deref::<u64>(link) };
                    if cur == NONE {
                        break;
                    }
                    let lock = unsafe { self.slot_lock(cur) };
                    let guard = lock.lock();
                    let (expired, next_link) = unsafe {
                        let slot = self.slot(cur);
                        let entry = self.entry_rec(slot.entry);
                        let expired = if entry.ttl > 0 {
                            slot.creation_time + (entry.ttl as i64) < now
                        } else {
                            slot.creation_time + (self.ttl as i64) < now
                        };
                        (expired, self.next_cell(cur))
                    };
                    drop(guard);

                    if expired {
                        self.remove_slot(link, cur, now);
                    } else {
                        link = next_link;
                    }
                }
            }

            if self.sma.avail_size(requested) {
                self.clear_lastkey();
            } else {
                self.real_expunge(now);
            }
        }

        unsafe {
            self.header().busy.store(0, Ordering::SeqCst);
        }
    }

    fn clear(&self) {
        let now = now_secs();
        unsafe {
            if self
                .header()
                .busy
                .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return;
            }
        }

        for index in 0..self.num_slots {
            let cell = self.bucket_cell_at(index);
            loop {
                let head = unsafe { *self.sma.deref::<u64>(cell) };
                if head == NONE {
                    break;
                }
                self.remove_slot(cell, head, now);
            }
        }

        unsafe {
            let header = self.header_mut();
            header.num_hits.store(0, Ordering::Relaxed);
            header.num_misses.store(0, Ordering::Relaxed);
            header.num_inserts.store(0, Ordering::Relaxed);
            header.expunges.store(0, Ordering::Relaxed);
            header.start_time = now;
        }
        self.clear_lastkey();

        unsafe {
            self.header().busy.store(0, Ordering::SeqCst);
        }
    }

    unsafe fn slot_info(&self, off: u64) -> SlotInfo {
        let slot = self.slot(off);
        let entry = self.entry_rec(slot.entry);
        SlotInfo {
            identifier: self
                .sma
                .bytes(slot.identifier, slot.identifier_len as usize)
                .to_vec(),
            ttl: entry.ttl,
            num_hits: slot.num_hits,
            mtime: slot.mtime,
            creation_time: slot.creation_time,
            deletion_time: slot.deletion_time,
            access_time: slot.access_time,
            ref_count: entry.ref_count.load(Ordering::Relaxed),
            mem_size: entry.mem_size,
        }
    }

    fn info(&self, limited: bool) -> CacheInfo {
        let mut info = unsafe {
            let header = self.header();
            CacheInfo {
                num_slots: self.num_slots,
                ttl: self.ttl,
                num_hits: header.num_hits.load(Ordering::Relaxed),
                num_misses: header.num_misses.load(Ordering::Relaxed),
                num_inserts: header.num_inserts.load(Ordering::Relaxed),
                expunges: header.expunges.load(Ordering::Relaxed),
                start_time: header.start_time,
                mem_size: header.mem_size.load(Ordering::Relaxed),
                num_entries: header.num_entries.load(Ordering::Relaxed),
                ..CacheInfo::default()
            }
        };
        if limited {
            return info;
        }

        let mut cache_list = Vec::new();
        let mut distribution = Vec::new();
        for index in 0..self.num_slots {
            let mut cur = unsafe { *self.sma.deref::<u64>(self.bucket_cell_at(index)) };
            let mut chained = 0u64;
            while cur != NONE {
                let lock = unsafe { self.slot_lock(cur) };
                let guard = lock.lock();
                let (snapshot, next) = unsafe { (self.slot_info(cur), self.slot(cur).next) };
                drop(guard);
                cache_list.push(snapshot);
                chained += 1;
                cur = next;
            }
            if chained > 0 {
                distribution.push((index, chained));
            }
        }

        let mut deleted = Vec::new();
        {
            let _guard = self.header_lock.lock();
            let mut cur = unsafe { self.header().deleted_list };
            while cur != NONE {
                unsafe {
                    deleted.push(self.slot_info(cur));
                    cur = self.slot(cur).next;
                }
            }
        }

        info.cache_list = Some(cache_list);
        info.deleted_list = Some(deleted);
        info.slot_distribution = Some(distribution);
        info
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primes_step_up_from_the_table() {
        assert_eq!(make_prime(0), 257);
        assert_eq!(make_prime(2000), 2053);
        assert_eq!(make_prime(2053), 2053);
        assert_eq!(make_prime(9000), 9221);
        // Past the table the last prime wins.
        assert_eq!(make_prime(1_000_000), 19457);
    }

    #[test]
    fn owner_ids_distinguish_threads_only_in_threading_mode() {
        let process_owner = self_owner(false);
        assert_eq!(process_owner, std::process::id() as u64);

        let a = self_owner(true);
        let b = std::thread::spawn(|| self_owner(true)).join().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn key_materialization_sets_owner_and_hash() {
        let key = CacheKey::new(b"alpha", 1234, false);
        assert_eq!(key.h, hash_bytes(b"alpha"));
        assert_eq!(key.mtime, 1234);
        assert_eq!(key.owner, self_owner(false));
    }
}
