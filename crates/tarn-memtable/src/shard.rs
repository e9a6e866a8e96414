//! Hash-sharded lock table protecting per-key version lists.
//!
//! One mutex out of a fixed array guards each per-key tree, selected by
//! mixing the key's root-cell address. Root cells are arena-allocated and
//! therefore heavily aligned; the rotate-and-byte-swap mix spreads their
//! addresses across shards before the modulo.

use parking_lot::{Mutex, MutexGuard};

/// Fixed-size table of shard locks.
pub(crate) struct LockTable {
    shards: Vec<Mutex<()>>,
}

impl LockTable {
    /// Creates a table with `count` shards. `count` must be non-zero.
    pub(crate) fn new(count: usize) -> Self {
        debug_assert!(count > 0);
        let mut shards = Vec::with_capacity(count);
        shards.resize_with(count, Mutex::default);
        Self { shards }
    }

    /// Number of shards.
    pub(crate) fn len(&self) -> usize {
        self.shards.len()
    }

    /// Shard index for a root-cell address.
    #[inline]
    pub(crate) fn shard_index(&self, slot_addr: usize) -> usize {
        let mixed = slot_addr.rotate_left(3).swap_bytes();
        mixed % self.shards.len()
    }

    /// Locks the shard guarding `slot_addr`.
    #[inline]
    pub(crate) fn lock(&self, slot_addr: usize) -> MutexGuard<'_, ()> {
        self.shards[self.shard_index(slot_addr)].lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_address_same_shard() {
        let table = LockTable::new(37);
        for addr in (8..4096usize).step_by(8) {
            assert_eq!(table.shard_index(addr), table.shard_index(addr));
        }
    }

    #[test]
    fn test_aligned_addresses_spread_across_shards() {
        // Arena addresses are 8-aligned and often share high bits; the mix
        // must still reach most shards.
        let table = LockTable::new(11);
        let base = 0x7F00_0000_0000usize;
        let mut hit = vec![false; table.len()];
        for i in 0..1024 {
            hit[table.shard_index(base + i * 8)] = true;
        }
        let covered = hit.iter().filter(|&&h| h).count();
        assert!(covered == table.len(), "only {covered}/{} shards hit", table.len());
    }

    #[test]
    fn test_lock_unlock() {
        let table = LockTable::new(5);
        let addr = 0x1000;
        {
            let _guard = table.lock(addr);
        }
        // Re-lockable after drop.
        let _guard = table.lock(addr);
    }
}
