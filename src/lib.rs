//! An in-process, shared-memory user-data cache.
//!
//! Arbitrary values keyed by opaque byte strings live in one
//! memory-mapped segment shared by cooperating workers. Entries carry
//! their own TTL, readers hold refcounted references while writers may
//! delete (reclamation is deferred until readers finish), and memory
//! pressure triggers an expunge sweep instead of per-insert eviction.
//!
//! ```no_run
//! use shmcache::{Cache, CacheConfig, Value, now_secs};
//!
//! let cache = Cache::create(&CacheConfig::default())?;
//! cache.store(b"answer", &Value::Int(42), 0, false);
//! if let Some(entry) = cache.find(b"answer", now_secs()) {
//!     assert_eq!(entry.value(), Value::Int(42));
//! }
//! # Ok::<(), std::io::Error>(())
//! ```
//!
//! The crate is Unix-only: the segment is a mapped file and the locks
//! embedded in it are process-shared pthread mutexes. Safety rests on
//! the documented protocol — offsets instead of pointers, one lock per
//! slot, header lock for structure, deferred frees — with the unsafe
//! confined to the `shm`, `pool` and `copy` internals.

mod cache;
mod config;
mod copy;
mod pool;
mod preload;
mod serializer;
mod shm;
mod value;

pub use cache::{now_secs, Cache, CacheInfo, EntryHandle, SlotInfo};
pub use config::CacheConfig;
pub use preload::preload;
pub use serializer::{
    default_serializer, find_serializer, register_serializer, BinarySerializer, Serializer,
};
pub use shm::Sma;
pub use value::{ArrayKey, ArrayValue, ObjectValue, Value};
