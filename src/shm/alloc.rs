/// Shared-memory allocator (SMA): a first-fit free list over the
/// mapped region.
///
/// Blocks carry a 16-byte header; the free list is kept in address
/// order so freed neighbours coalesce. Callers receive region offsets
/// (never pointers) because every process maps the region at its own
/// base address.
///
/// When an allocation cannot be satisfied the registered pressure
/// callback runs once (the cache hangs its expunge there) and the
/// allocation is retried exactly once, so callers never livelock.
use std::io;
use std::sync::Arc;

use parking_lot::Mutex;

use super::layout::{BlockHeader, RegionHeader, BLOCK_HEADER_SIZE, NONE, REGION_HEADER_SIZE};
use super::lock::ShmMutex;
use super::region::ShmRegion;

/// Allocation granularity; all block sizes and user offsets are
/// multiples of this.
const GRAIN: usize = 16;

/// Minimum leftover worth keeping as its own free block after a split.
const MIN_SPLIT: u64 = 48;

pub type PressureHook = Box<dyn Fn(usize) + Send + Sync>;

/// Handle to the shared-memory allocator.
pub struct Sma {
    region: ShmRegion,
    lock: ShmMutex,
    pressure: Mutex<Option<PressureHook>>,
}

unsafe impl Send for Sma {}
unsafe impl Sync for Sma {}

impl Sma {
    /// Create a fresh region of `size` bytes and set up the free list.
    pub fn create(name: &str, size: usize) -> io::Result<Arc<Sma>> {
        let region = ShmRegion::create(name, size)?;

        let base = region.base_ptr();
        let lock = unsafe {
            let header = &mut *(base as *mut RegionHeader);
            let heap = (size - REGION_HEADER_SIZE) as u64;
            header.free_head = REGION_HEADER_SIZE as u64;
            header.avail = heap;

            let first = &mut *(base.add(REGION_HEADER_SIZE) as *mut BlockHeader);
            first.size = heap;
            first.next_free = NONE;

            ShmMutex::init(&mut (*(base as *mut RegionHeader)).lock)?
        };

        Ok(Arc::new(Sma {
            region,
            lock,
            pressure: Mutex::new(None),
        }))
    }

    /// Attach to a region another process created.
    pub fn attach(name: &str) -> io::Result<Arc<Sma>> {
        let region = ShmRegion::open(name)?;
        let lock = unsafe {
            let header = &mut *(region.base_ptr() as *mut RegionHeader);
            ShmMutex::from_existing(&mut header.lock)
        };
        Ok(Arc::new(Sma {
            region,
            lock,
            pressure: Mutex::new(None),
        }))
    }

    /// Register the callback run when an allocation fails. The cache
    /// installs its expunge here at creation.
    pub fn set_pressure_hook(&self, hook: PressureHook) {
        *self.pressure.lock() = Some(hook);
    }

    /// Allocate `n` bytes; returns the user offset, or `None` when the
    /// region is exhausted even after the pressure callback ran.
    pub fn alloc(&self, n: usize) -> Option<u64> {
        if let Some(off) = self.alloc_inner(n) {
            return Some(off);
        }
        {
            let hook = self.pressure.lock();
            match hook.as_ref() {
                Some(cb) => cb(n),
                None => return None,
            }
        }
        self.alloc_inner(n)
    }

    fn alloc_inner(&self, n: usize) -> Option<u64> {
        let need = (BLOCK_HEADER_SIZE + round_up(n)) as u64;
        let _guard = self.lock.lock();

        unsafe {
            let header = self.header_mut();
            // Walk the free list through link cells so the winning block
            // can be spliced out without a second pass.
            let mut link: *mut u64 = &mut header.free_head;
            while *link != NONE {
                let off = *link;
                let block = self.deref_mut::<BlockHeader>(off);
                if block.size >= need {
                    if block.size - need >= MIN_SPLIT {
                        // Split: the tail remains free at the same list
                        // position, keeping address order.
                        let rest_off = off + need;
                        let rest = self.deref_mut::<BlockHeader>(rest_off);
                        rest.size = block.size - need;
                        rest.next_free = block.next_free;
                        *link = rest_off;
                        block.size = need;
                    } else {
                        *link = block.next_free;
                    }
                    header.avail -= block.size;
                    block.next_free = NONE;
                    return Some(off + BLOCK_HEADER_SIZE as u64);
                }
                link = &mut block.next_free;
            }
        }
        None
    }

    /// Return an allocation to the free list, coalescing with adjacent
    /// free neighbours.
    pub fn free(&self, user_off: u64) {
        debug_assert!(user_off >= (REGION_HEADER_SIZE + BLOCK_HEADER_SIZE) as u64);
        let off = user_off - BLOCK_HEADER_SIZE as u64;
        let _guard = self.lock.lock();

        unsafe {
            let header = self.header_mut();
            header.avail += self.deref::<BlockHeader>(off).size;

            // Find the address-ordered insertion point, remembering the
            // preceding free block for backward coalescing.
            let mut prev = NONE;
            let mut link: *mut u64 = &mut header.free_head;
            while *link != NONE && *link < off {
                prev = *link;
                link = &mut self.deref_mut::<BlockHeader>(prev).next_free;
            }

            let next = *link;
            let block = self.deref_mut::<BlockHeader>(off);
            block.next_free = next;
            *link = off;

            if next != NONE && off + block.size == next {
                let n = self.deref::<BlockHeader>(next);
                block.size += n.size;
                block.next_free = n.next_free;
            }
            if prev != NONE {
                let p = self.deref_mut::<BlockHeader>(prev);
                if prev + p.size == off {
                    p.size += block.size;
                    p.next_free = block.next_free;
                }
            }
        }
    }

    /// Total bytes currently on the free list.
    pub fn avail_mem(&self) -> usize {
        let _guard = self.lock.lock();
        unsafe { self.header().avail as usize }
    }

    /// Whether a single contiguous allocation of `n` bytes would
    /// currently succeed.
    pub fn avail_size(&self, n: usize) -> bool {
        let need = (BLOCK_HEADER_SIZE + round_up(n)) as u64;
        let _guard = self.lock.lock();
        unsafe {
            let mut off = self.header().free_head;
            while off != NONE {
                let block = self.deref::<BlockHeader>(off);
                if block.size >= need {
                    return true;
                }
                off = block.next_free;
            }
        }
        false
    }

    /// Size of the whole region, allocator header included.
    pub fn total_size(&self) -> usize {
        self.region.len()
    }

    /// Remove the backing file.
    pub fn unlink(&self) -> io::Result<()> {
        self.region.unlink()
    }

    /// Raw pointer at a region offset.
    ///
    /// # Safety
    /// `off` must lie inside the region.
    pub unsafe fn ptr(&self, off: u64) -> *mut u8 {
        debug_assert!((off as usize) < self.region.len());
        self.region.base_ptr().add(off as usize)
    }

    /// # Safety
    /// `off` must be a live allocation (or region structure) of type `T`.
    pub unsafe fn deref<T>(&self, off: u64) -> &T {
        &*(self.ptr(off) as *const T)
    }

    /// # Safety
    /// As `deref`, and the caller must hold whatever lock guards `T`.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn deref_mut<T>(&self, off: u64) -> &mut T {
        &mut *(self.ptr(off) as *mut T)
    }

    /// # Safety
    /// `off..off+len` must be live allocated bytes.
    pub unsafe fn bytes(&self, off: u64, len: usize) -> &[u8] {
        std::slice::from_raw_parts(self.ptr(off), len)
    }

    /// # Safety
    /// As `bytes`, for a freshly allocated destination.
    pub unsafe fn copy_in(&self, off: u64, src: &[u8]) {
        std::ptr::copy_nonoverlapping(src.as_ptr(), self.ptr(off), src.len());
    }

    unsafe fn header(&self) -> &RegionHeader {
        &*(self.region.base_ptr() as *const RegionHeader)
    }

    #[allow(clippy::mut_from_ref)]
    unsafe fn header_mut(&self) -> &mut RegionHeader {
        &mut *(self.region.base_ptr() as *mut RegionHeader)
    }
}

fn round_up(n: usize) -> usize {
    n.div_ceil(GRAIN) * GRAIN
}
