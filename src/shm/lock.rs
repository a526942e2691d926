/// Cross-process mutual exclusion using POSIX pthread_mutex with
/// PTHREAD_PROCESS_SHARED attribute.
///
/// The mutexes live inside the shared region (embedded in the cache
/// header and in every slot record) so any process mapping the region
/// can take them. On Linux the mutexes are additionally robust: if a
/// holder dies, the next locker recovers the mutex instead of hanging.
use std::io;
use std::mem::MaybeUninit;

/// Bytes reserved for one embedded mutex.
/// pthread_mutex_t is 40 bytes on x86_64 Linux, 64 on macOS arm64.
pub const MUTEX_SIZE: usize = 64;

/// Opaque, 8-byte aligned cell a `ShmMutex` is initialized into.
/// Embedded in `#[repr(C)]` records that live in the mapped region.
#[repr(C)]
pub struct LockCell {
    _opaque: [u64; MUTEX_SIZE / 8],
}

const _: () = assert!(std::mem::size_of::<LockCell>() == MUTEX_SIZE);

/// A handle to a process-shared mutex stored in mapped memory.
pub struct ShmMutex {
    mutex_ptr: *mut libc::pthread_mutex_t,
}

unsafe impl Send for ShmMutex {}
unsafe impl Sync for ShmMutex {}

impl ShmMutex {
    /// Initialize a new mutex in the given cell.
    ///
    /// # Safety
    /// `cell` must point into shared memory that no other process is
    /// concurrently initializing, and must stay mapped for the life of
    /// every handle attached to it.
    pub unsafe fn init(cell: *mut LockCell) -> io::Result<Self> {
        let mutex_ptr = cell as *mut libc::pthread_mutex_t;

        let mut attr: libc::pthread_mutexattr_t = MaybeUninit::zeroed().assume_init();
        let ret = libc::pthread_mutexattr_init(&mut attr);
        if ret != 0 {
            return Err(io::Error::from_raw_os_error(ret));
        }

        let ret = libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
        if ret != 0 {
            libc::pthread_mutexattr_destroy(&mut attr);
            return Err(io::Error::from_raw_os_error(ret));
        }

        #[cfg(target_os = "linux")]
        {
            let ret = libc::pthread_mutexattr_setrobust(&mut attr, libc::PTHREAD_MUTEX_ROBUST);
            if ret != 0 {
                libc::pthread_mutexattr_destroy(&mut attr);
                return Err(io::Error::from_raw_os_error(ret));
            }
        }

        let ret = libc::pthread_mutex_init(mutex_ptr, &attr);
        libc::pthread_mutexattr_destroy(&mut attr);
        if ret != 0 {
            return Err(io::Error::from_raw_os_error(ret));
        }

        Ok(ShmMutex { mutex_ptr })
    }

    /// Attach to an already-initialized mutex.
    ///
    /// # Safety
    /// `cell` must hold a mutex previously initialized with `init` and
    /// still mapped.
    pub unsafe fn from_existing(cell: *mut LockCell) -> Self {
        ShmMutex {
            mutex_ptr: cell as *mut libc::pthread_mutex_t,
        }
    }

    /// Acquire the mutex, blocking until available. Returns a guard
    /// that releases on drop.
    pub fn lock(&self) -> ShmMutexGuard<'_> {
        unsafe {
            let ret = libc::pthread_mutex_lock(self.mutex_ptr);
            #[cfg(target_os = "linux")]
            if ret == libc::EOWNERDEAD {
                // The previous owner died while holding the lock. Counter
                // drift is repaired by the next expunge; mark the mutex
                // usable again and carry on.
                libc::pthread_mutex_consistent(self.mutex_ptr);
                return ShmMutexGuard { mutex: self };
            }
            debug_assert_eq!(ret, 0, "pthread_mutex_lock failed: {ret}");
        }
        ShmMutexGuard { mutex: self }
    }

    fn unlock(&self) {
        unsafe {
            let ret = libc::pthread_mutex_unlock(self.mutex_ptr);
            debug_assert_eq!(ret, 0, "pthread_mutex_unlock failed: {ret}");
        }
    }

    /// Destroy the mutex. Only call when no other process is using it.
    pub unsafe fn destroy(&self) {
        libc::pthread_mutex_destroy(self.mutex_ptr);
    }
}

/// RAII guard for a `ShmMutex`.
pub struct ShmMutexGuard<'a> {
    mutex: &'a ShmMutex,
}

impl Drop for ShmMutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

/// Masks all signals for the current thread while alive.
///
/// Wrapped around the windows where a bucket chain or the deleted list
/// is structurally inconsistent, so a signal handler that unwinds the
/// thread cannot observe a torn data structure.
pub struct InterruptGuard {
    saved: libc::sigset_t,
}

impl InterruptGuard {
    pub fn new() -> Self {
        unsafe {
            let mut all: libc::sigset_t = MaybeUninit::zeroed().assume_init();
            let mut saved: libc::sigset_t = MaybeUninit::zeroed().assume_init();
            libc::sigfillset(&mut all);
            libc::pthread_sigmask(libc::SIG_BLOCK, &all, &mut saved);
            InterruptGuard { saved }
        }
    }
}

impl Default for InterruptGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        unsafe {
            libc::pthread_sigmask(libc::SIG_SETMASK, &self.saved, std::ptr::null_mut());
        }
    }
}
