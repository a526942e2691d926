/// Shared-memory plumbing.
///
/// `region` maps the named file, `alloc` runs a free-list allocator
/// over it, `layout` declares every `#[repr(C)]` structure stored
/// inside, and `lock` provides the process-shared mutexes embedded in
/// those structures.
pub mod alloc;
pub mod layout;
pub mod lock;
pub mod region;

pub use alloc::Sma;
pub use lock::{InterruptGuard, ShmMutex};
