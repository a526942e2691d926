/// `#[repr(C)]` structures that live in shared memory (mmap).
///
/// All structs use fixed-size fields and explicit padding so the layout
/// is identical across compilations and processes. The region is mapped
/// at a different base address in every process, so structures refer to
/// each other by byte offset from the region base; `NONE` (0) plays the
/// role of a null pointer.
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64};

use super::lock::LockCell;

/// Magic bytes at the start of the region to validate the mapping.
pub const MAGIC: [u8; 8] = *b"SHMUC001";

/// Null offset.
pub const NONE: u64 = 0;

/// Size of the fixed allocator header at the start of the region.
pub const REGION_HEADER_SIZE: usize = 128;

/// Allocator bookkeeping at offset 0 of the region.
///
/// `avail` and `free_head` are only read or written under `lock`.
#[repr(C)]
pub struct RegionHeader {
    pub magic: [u8; 8],      // 0..8
    pub version: u32,        // 8..12
    pub _pad0: u32,          // 12..16
    pub total_size: u64,     // 16..24
    pub avail: u64,          // 24..32  (bytes on the free list)
    pub free_head: u64,      // 32..40  (address-ordered free list)
    pub lock: LockCell,      // 40..104
    pub _pad1: [u8; 24],     // 104..128
}

const _: () = assert!(std::mem::size_of::<RegionHeader>() == REGION_HEADER_SIZE);

/// Header of every allocator block, free or live.
/// `next_free` is meaningful only while the block is on the free list.
pub const BLOCK_HEADER_SIZE: usize = 16;

#[repr(C)]
pub struct BlockHeader {
    pub size: u64,      // total block size, header included
    pub next_free: u64, // next free block offset, NONE when live
}

const _: () = assert!(std::mem::size_of::<BlockHeader>() == BLOCK_HEADER_SIZE);

/// Identifying fingerprint of a key, as kept in `lastkey` for the slam
/// defense. Not enough to recover the identifier bytes; enough for an
/// educated guess that two inserts are the same key.
#[repr(C)]
pub struct KeyFingerprint {
    pub h: u64,              // 0..8
    pub identifier_len: u32, // 8..12
    pub _pad: u32,           // 12..16
    pub mtime: i64,          // 16..24  (second the key was materialized)
    pub owner: u64,          // 24..32  (writer id)
}

const _: () = assert!(std::mem::size_of::<KeyFingerprint>() == 32);

/// Size of the cache header; the bucket table follows it immediately.
pub const CACHE_HEADER_SIZE: usize = 256;

/// Cache-wide shared state. Lives at the start of the cache shell
/// allocation (one SMA block holding header + bucket table).
///
/// `deleted_list` and the bucket cells are guarded by `lock`; the
/// counters are plain atomics and deliberately not linearizable with
/// the operations they count.
#[repr(C)]
pub struct CacheHeader {
    pub lock: LockCell,          // 0..64
    pub lastkey_lock: LockCell,  // 64..128
    pub lastkey: KeyFingerprint, // 128..160
    pub num_hits: AtomicU64,     // 160..168
    pub num_misses: AtomicU64,   // 168..176
    pub num_inserts: AtomicU64,  // 176..184
    pub expunges: AtomicU64,     // 184..192
    pub mem_size: AtomicU64,     // 192..200
    pub num_entries: AtomicU64,  // 200..208
    pub start_time: i64,         // 208..216
    pub deleted_list: u64,       // 216..224  (slot offset)
    pub busy: AtomicU32,         // 224..228
    pub _pad0: u32,              // 228..232
    pub _pad1: [u8; 24],         // 232..256
}

const _: () = assert!(std::mem::size_of::<CacheHeader>() == CACHE_HEADER_SIZE);

/// Size of the cache shell allocation for a bucket table of `n` slots.
pub fn cache_shell_size(n: usize) -> usize {
    CACHE_HEADER_SIZE + n * std::mem::size_of::<u64>()
}

/// One node in a bucket chain. Allocated inside its entry's pool, so
/// freeing the pool frees the slot and the identifier bytes together.
pub const SLOT_RECORD_SIZE: usize = 160;

#[repr(C)]
pub struct SlotRecord {
    pub lock: LockCell,      // 0..64
    pub h: u64,              // 64..72
    pub identifier: u64,     // 72..80   (offset of identifier bytes, in pool)
    pub identifier_len: u32, // 80..84
    pub _pad0: u32,          // 84..88
    pub mtime: i64,          // 88..96
    pub owner: u64,          // 96..104
    pub entry: u64,          // 104..112 (EntryRecord offset)
    pub next: u64,           // 112..120 (bucket chain, or deleted list)
    pub num_hits: u64,       // 120..128
    pub creation_time: i64,  // 128..136
    pub access_time: i64,    // 136..144
    pub deletion_time: i64,  // 144..152
    pub _pad1: [u8; 8],      // 152..160
}

const _: () = assert!(std::mem::size_of::<SlotRecord>() == SLOT_RECORD_SIZE);

/// The copied value plus its TTL, refcount, pool and size.
///
/// `ref_count` is atomic because `release` decrements it without any
/// lock while writers inspect it under the slot lock.
#[repr(C)]
pub struct EntryRecord {
    pub value: u64,           // 0..8   (root ValueRecord offset)
    pub pool: u64,            // 8..16  (PoolRecord offset)
    pub mem_size: u64,        // 16..24 (pool.size at insertion, never mutated)
    pub ttl: u32,             // 24..28 (0 = no per-entry TTL)
    pub ref_count: AtomicI32, // 28..32
}

const _: () = assert!(std::mem::size_of::<EntryRecord>() == 32);

/// Pool bookkeeping; lives at the start of the pool's first block.
#[repr(C)]
pub struct PoolRecord {
    pub first_block: u64,   // 0..8
    pub current_block: u64, // 8..16
    pub size: u64,          // 16..24 (total bytes obtained from the SMA)
    pub _pad: u64,          // 24..32
}

const _: () = assert!(std::mem::size_of::<PoolRecord>() == 32);

/// Header of one pool block; `capacity` bytes of arena follow it.
#[repr(C)]
pub struct PoolBlock {
    pub next: u64,     // 0..8
    pub capacity: u64, // 8..16
    pub used: u64,     // 16..24
    pub _pad: u64,     // 24..32
}

pub const POOL_BLOCK_SIZE: usize = 32;

const _: () = assert!(std::mem::size_of::<PoolBlock>() == POOL_BLOCK_SIZE);

/// Value kinds stored in `ValueRecord::kind`.
pub const KIND_NULL: u32 = 0;
pub const KIND_BOOL: u32 = 1;
pub const KIND_INT: u32 = 2;
pub const KIND_FLOAT: u32 = 3;
pub const KIND_STR: u32 = 4;
pub const KIND_BYTES: u32 = 5;
pub const KIND_ARRAY: u32 = 6;
pub const KIND_OBJECT: u32 = 7;

/// The payload is serializer output (a byte string in `data`/`len`)
/// rather than a pooled structure of the declared kind.
pub const VFLAG_SERIALIZED: u32 = 1;

/// One copied value node inside a pool.
///
/// Scalars keep their bits in `data`; strings and byte strings point
/// `data` at a pool allocation of `len + 1` bytes (NUL kept for parity
/// with identifier storage); arrays point `data` at an `ArrayRecord`.
#[repr(C)]
pub struct ValueRecord {
    pub kind: u32,  // 0..4
    pub flags: u32, // 4..8
    pub refs: u32,  // 8..12 (shared-subtree count within the entry)
    pub _pad: u32,  // 12..16
    pub data: u64,  // 16..24
    pub len: u64,   // 24..32
}

const _: () = assert!(std::mem::size_of::<ValueRecord>() == 32);

/// Array key kinds stored in `ArrayNode::key_kind`.
pub const AKEY_INT: u32 = 0;
pub const AKEY_STR: u32 = 1;

/// Pooled mirror of an ordered container: a prime-sized bucket array
/// plus an insertion-order list threaded through the nodes.
#[repr(C)]
pub struct ArrayRecord {
    pub buckets: u64,     // 0..8   (offset of num_buckets u64 chain heads)
    pub num_buckets: u64, // 8..16
    pub list_head: u64,   // 16..24
    pub list_tail: u64,   // 24..32
    pub count: u64,       // 32..40
    pub _pad: u64,        // 40..48
}

const _: () = assert!(std::mem::size_of::<ArrayRecord>() == 48);

/// One element of a pooled array.
#[repr(C)]
pub struct ArrayNode {
    pub hash: u64,           // 0..8   (key hash; bucket = hash % num_buckets)
    pub key_kind: u32,       // 8..12
    pub key_len: u32,        // 12..16
    pub key_data: u64,       // 16..24 (i64 bits, or offset of key bytes)
    pub value: u64,          // 24..32 (ValueRecord offset)
    pub next_in_bucket: u64, // 32..40
    pub list_next: u64,      // 40..48
}

const _: () = assert!(std::mem::size_of::<ArrayNode>() == 48);
