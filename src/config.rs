//! Cache configuration.

use std::path::PathBuf;

/// Recognized options; field-per-option with sensible defaults.
#[derive(Clone, Debug)]
pub struct CacheConfig {
    /// Target bucket count; rounded up to the smallest tabulated prime
    /// at or above `max(size_hint, 2000)`.
    pub size_hint: usize,
    /// Cache-wide access TTL in seconds. 0 means "wipe on pressure":
    /// no staleness sweeps, only full expunges when memory runs out.
    pub ttl: u32,
    /// Seconds a pending-deletion slot may sit on the GC list before
    /// it is force-freed with a warning. 0 disables the escape hatch.
    pub gc_ttl: u32,
    /// Size of the shared region `Cache::create` builds its own
    /// allocator over; also drives the half-full expunge trigger.
    pub shm_size: usize,
    /// Enable the lastkey duplicate-insert suppressor.
    pub slam_defense: bool,
    /// Name of a registered serializer; `None` uses the built-in one
    /// (and keeps structural copies for containers).
    pub serializer_name: Option<String>,
    /// Directory scanned by `preload`.
    pub preload_path: Option<PathBuf>,
    /// Multi-threaded hosting: writer ids become per-thread and
    /// `preload` is refused.
    pub threading: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            size_hint: 0,
            ttl: 0,
            gc_ttl: 3600,
            shm_size: 32 * 1024 * 1024,
            slam_defense: true,
            serializer_name: None,
            preload_path: None,
            threading: false,
        }
    }
}
