//! Per-entry arena.
//!
//! A pool is a bump allocator chaining blocks obtained from the SMA.
//! It owns every byte of one cache entry — the copied value, the
//! identifier bytes, and the slot record itself — so the whole entry
//! is released in one step by freeing the chain. Allocations are never
//! freed individually and `size` only grows.
//!
//! The pool's own bookkeeping record is the first bump allocation of
//! its first block, so a bare region offset is enough to reattach from
//! any process.

use std::sync::Arc;

use crate::shm::layout::{PoolBlock, PoolRecord, NONE, POOL_BLOCK_SIZE};
use crate::shm::Sma;

/// Capacity of the first block.
const INITIAL_BLOCK: usize = 1024;

/// Block capacities double up to this bound.
const MAX_BLOCK: usize = 64 * 1024;

/// Handle to a pool; clones of the handle share the shm state.
pub struct Pool {
    sma: Arc<Sma>,
    record: u64,
}

impl Pool {
    /// Create a pool with one fresh block. `None` when the SMA cannot
    /// satisfy even the initial block.
    pub fn create(sma: &Arc<Sma>) -> Option<Pool> {
        let first = sma.alloc(POOL_BLOCK_SIZE + INITIAL_BLOCK)?;
        let record = first + POOL_BLOCK_SIZE as u64;
        unsafe {
            let block = sma.deref_mut::<PoolBlock>(first);
            block.next = NONE;
            block.capacity = INITIAL_BLOCK as u64;
            // The PoolRecord is the first bump allocation.
            block.used = std::mem::size_of::<PoolRecord>() as u64;

            let rec = sma.deref_mut::<PoolRecord>(record);
            rec.first_block = first;
            rec.current_block = first;
            rec.size = (POOL_BLOCK_SIZE + INITIAL_BLOCK) as u64;
        }
        Some(Pool {
            sma: Arc::clone(sma),
            record,
        })
    }

    /// Reattach to the pool whose record lives at `record` (as kept in
    /// an entry record).
    pub fn attach(sma: &Arc<Sma>, record: u64) -> Pool {
        Pool {
            sma: Arc::clone(sma),
            record,
        }
    }

    /// Offset of the pool record, for storing in an entry record.
    pub fn record_off(&self) -> u64 {
        self.record
    }

    pub(crate) fn sma(&self) -> &Arc<Sma> {
        &self.sma
    }

    /// Total bytes this pool has obtained from the SMA.
    pub fn size(&self) -> u64 {
        unsafe { self.sma.deref::<PoolRecord>(self.record).size }
    }

    /// Bump-allocate `n` bytes (8-byte aligned). `None` on SMA
    /// exhaustion; the pool stays destroyable.
    pub fn alloc(&self, n: usize) -> Option<u64> {
        let need = round_up(n) as u64;
        unsafe {
            let rec = self.sma.deref_mut::<PoolRecord>(self.record);
            let block = self.sma.deref_mut::<PoolBlock>(rec.current_block);
            if block.used + need <= block.capacity {
                let off = rec.current_block + POOL_BLOCK_SIZE as u64 + block.used;
                block.used += need;
                return Some(off);
            }

            let grow = (block.capacity as usize * 2).min(MAX_BLOCK);
            let capacity = round_up(grow.max(need as usize));
            let fresh = self.sma.alloc(POOL_BLOCK_SIZE + capacity)?;

            let new_block = self.sma.deref_mut::<PoolBlock>(fresh);
            new_block.next = NONE;
            new_block.capacity = capacity as u64;
            new_block.used = need;

            block.next = fresh;
            rec.current_block = fresh;
            rec.size += (POOL_BLOCK_SIZE + capacity) as u64;
            Some(fresh + POOL_BLOCK_SIZE as u64)
        }
    }

    /// Allocate `src.len() + 1` bytes and copy `src` in, NUL kept at
    /// the end so identifier bytes read like C strings in a debugger.
    pub fn alloc_bytes(&self, src: &[u8]) -> Option<u64> {
        let off = self.alloc(src.len() + 1)?;
        unsafe {
            self.sma.copy_in(off, src);
            *self.sma.ptr(off + src.len() as u64) = 0;
        }
        Some(off)
    }

    /// Zeroed allocation, for bucket arrays whose cells must start as
    /// null offsets.
    pub fn alloc_zeroed(&self, n: usize) -> Option<u64> {
        let off = self.alloc(n)?;
        unsafe {
            std::ptr::write_bytes(self.sma.ptr(off), 0, n);
        }
        Some(off)
    }

    /// Release every block back to the SMA. Infallible.
    pub fn destroy(self) {
        unsafe {
            let mut block = self.sma.deref::<PoolRecord>(self.record).first_block;
            while block != NONE {
                let next = self.sma.deref::<PoolBlock>(block).next;
                self.sma.free(block);
                block = next;
            }
        }
    }
}

fn round_up(n: usize) -> usize {
    n.div_ceil(8) * 8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sma(name: &str) -> Arc<Sma> {
        let unique = format!("pool-{name}-{}", std::process::id());
        let sma = Sma::create(&unique, 1 << 18).unwrap();
        sma.unlink().unwrap();
        sma
    }

    #[test]
    fn allocations_do_not_overlap() {
        let sma = sma("overlap");
        let pool = Pool::create(&sma).unwrap();

        let a = pool.alloc_bytes(b"aaaa").unwrap();
        let b = pool.alloc_bytes(b"bbbbbbbb").unwrap();
        unsafe {
            assert_eq!(sma.bytes(a, 4), b"aaaa");
            assert_eq!(sma.bytes(b, 8), b"bbbbbbbb");
        }
        pool.destroy();
    }

    #[test]
    fn growth_chains_blocks_and_tracks_size() {
        let sma = sma("growth");
        let pool = Pool::create(&sma).unwrap();
        let initial = pool.size();

        // Overflow the first block several times over.
        for _ in 0..64 {
            pool.alloc(256).unwrap();
        }
        assert!(pool.size() > initial);

        // An allocation larger than the doubling bound still succeeds.
        assert!(pool.alloc(2 * MAX_BLOCK).is_some());
        pool.destroy();
    }

    #[test]
    fn destroy_returns_everything_to_the_sma() {
        let sma = sma("destroy");
        let before = sma.avail_mem();

        let pool = Pool::create(&sma).unwrap();
        for _ in 0..16 {
            pool.alloc(1000).unwrap();
        }
        pool.destroy();

        assert_eq!(sma.avail_mem(), before);
    }

    #[test]
    fn attach_sees_the_same_pool() {
        let sma = sma("attach");
        let pool = Pool::create(&sma).unwrap();
        let off = pool.alloc_bytes(b"shared").unwrap();

        let other = Pool::attach(&sma, pool.record_off());
        assert_eq!(other.size(), pool.size());
        unsafe {
            assert_eq!(sma.bytes(off, 6), b"shared");
        }
        other.destroy();
    }
}
