//! Arena-based memory allocation for version records and trie nodes.
//!
//! Allocations are bump-pointer carves out of chained blocks. Addresses are
//! stable for the arena's lifetime and nothing is ever freed individually;
//! the whole arena drops when the memtable is flushed.

use crate::constants::{ARENA_ALIGN, ARENA_CHUNK_SIZE};
use parking_lot::Mutex;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Chained bump allocator with aligned allocation.
///
/// A `growing` arena never refuses; a `bounded` arena returns `None` once its
/// byte budget is reserved, which is the signal that seals a trie in place.
pub(crate) struct Arena {
    state: Mutex<ArenaState>,
    /// Bytes handed out to callers (after alignment rounding).
    used: AtomicUsize,
    /// Bytes reserved in blocks; the memory footprint.
    reserved: AtomicUsize,
    chunk_size: usize,
    limit: usize,
}

struct ArenaState {
    /// Blocks are u64-backed so every block start is 8-aligned.
    blocks: Vec<Box<[u64]>>,
    /// Byte offset into the last block.
    offset: usize,
}

// Raw pointers into the blocks are handed out; the blocks themselves are
// append-only and pinned behind boxes, so access from any thread is sound.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    /// Creates an unbounded arena carving blocks of the default chunk size.
    pub(crate) fn growing() -> Self {
        Self::new(ARENA_CHUNK_SIZE, usize::MAX)
    }

    /// Creates an arena that refuses allocation beyond `budget` total bytes.
    pub(crate) fn bounded(budget: usize) -> Self {
        Self::new(ARENA_CHUNK_SIZE.min(budget.max(ARENA_ALIGN)), budget)
    }

    fn new(chunk_size: usize, limit: usize) -> Self {
        Self {
            state: Mutex::new(ArenaState {
                blocks: Vec::new(),
                offset: 0,
            }),
            used: AtomicUsize::new(0),
            reserved: AtomicUsize::new(0),
            chunk_size: round_up(chunk_size, ARENA_ALIGN),
            limit,
        }
    }

    /// Allocates `len` bytes aligned to [`ARENA_ALIGN`], zero-initialized.
    ///
    /// Returns `None` only for a bounded arena whose budget is exhausted.
    pub(crate) fn alloc(&self, len: usize) -> Option<NonNull<u8>> {
        let len = round_up(len.max(1), ARENA_ALIGN);
        let mut state = self.state.lock();

        let remaining = state
            .blocks
            .last()
            .map(|b| b.len() * 8 - state.offset)
            .unwrap_or(0);
        if remaining < len {
            let reserved = self.reserved.load(Ordering::Relaxed);
            let mut block_size = len.max(self.chunk_size);
            if reserved + block_size > self.limit {
                // Squeeze an exact-fit block out of the remaining budget.
                block_size = len;
                if reserved + block_size > self.limit {
                    return None;
                }
            }
            state.blocks.push(vec![0u64; block_size / 8].into_boxed_slice());
            state.offset = 0;
            self.reserved.fetch_add(block_size, Ordering::Relaxed);
        }

        let offset = state.offset;
        state.offset += len;
        let block = state.blocks.last_mut().unwrap();
        // 8-aligned base plus 8-aligned offset keeps every address 8-aligned.
        let ptr = unsafe { (block.as_mut_ptr() as *mut u8).add(offset) };
        self.used.fetch_add(len, Ordering::Relaxed);
        NonNull::new(ptr)
    }

    /// Allocates and returns the address as `usize`, for intrusive links.
    pub(crate) fn alloc_addr(&self, len: usize) -> Option<usize> {
        self.alloc(len).map(|p| p.as_ptr() as usize)
    }

    /// Bytes handed out to callers.
    pub(crate) fn used(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    /// Bytes reserved in blocks; never decreases.
    pub(crate) fn reserved(&self) -> usize {
        self.reserved.load(Ordering::Relaxed)
    }
}

#[inline]
fn round_up(len: usize, align: usize) -> usize {
    (len + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_is_aligned() {
        let arena = Arena::growing();
        for len in [1, 3, 8, 17, 255] {
            let ptr = arena.alloc(len).unwrap();
            assert_eq!(ptr.as_ptr() as usize % ARENA_ALIGN, 0);
        }
    }

    #[test]
    fn test_addresses_are_stable_and_disjoint() {
        let arena = Arena::growing();
        let mut addrs = Vec::new();
        for i in 0..10_000usize {
            let addr = arena.alloc_addr(16 + i % 32).unwrap();
            unsafe { *(addr as *mut u64) = i as u64 };
            addrs.push(addr);
        }
        for (i, addr) in addrs.iter().enumerate() {
            assert_eq!(unsafe { *(*addr as *const u64) }, i as u64);
        }
    }

    #[test]
    fn test_bounded_arena_refuses_past_budget() {
        let arena = Arena::bounded(1024);
        let mut total = 0;
        while let Some(_) = arena.alloc(64) {
            total += 64;
            assert!(total <= 1024);
        }
        assert_eq!(total, 1024);
        assert!(arena.alloc(8).is_none());
        // Refusal is sticky.
        assert!(arena.alloc(8).is_none());
    }

    #[test]
    fn test_bounded_squeezes_exact_fit() {
        // Budget below one chunk still serves small allocations.
        let arena = Arena::bounded(128);
        assert!(arena.alloc(100).is_some());
        assert!(arena.alloc(64).is_none());
        assert!(arena.alloc(24).is_some());
    }

    #[test]
    fn test_oversize_allocation_gets_own_block() {
        let arena = Arena::growing();
        let big = ARENA_CHUNK_SIZE * 2;
        let addr = arena.alloc_addr(big).unwrap();
        unsafe {
            std::ptr::write_bytes(addr as *mut u8, 0xAB, big);
        }
        assert!(arena.reserved() >= big);
    }

    #[test]
    fn test_usage_counters_monotonic() {
        let arena = Arena::growing();
        let mut last = 0;
        for _ in 0..100 {
            arena.alloc(40).unwrap();
            let used = arena.used();
            assert!(used > last);
            assert!(arena.reserved() >= used);
            last = used;
        }
    }
}
