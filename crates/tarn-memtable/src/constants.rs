//! Memtable constants for the arena, trie, and version-tree layers.

/// Allocation chunk granularity for arenas. A trie whose budget is smaller
/// than one chunk allocates a single block of exactly its budget.
pub(crate) const ARENA_CHUNK_SIZE: usize = 256 * 1024;

/// All arena allocations are aligned to this many bytes, which keeps the low
/// three bits of every node address free for link tags.
pub(crate) const ARENA_ALIGN: usize = 8;

/// Upper bound on a red-black insertion path. A valid red-black tree over at
/// most 2^63 nodes never exceeds twice its black height.
pub(crate) const MAX_TREE_DEPTH: usize = 2 * (usize::BITS as usize - 1);

/// Initial capacity of a trie node's edge array.
pub(crate) const EDGE_INITIAL_CAPACITY: usize = 4;

/// Hard cap on edge-array capacity: one slot per possible label byte.
pub(crate) const EDGE_MAX_CAPACITY: usize = 256;

/// Canonical name of the byte-lexicographic user-key comparator. Any other
/// comparator is routed to the fallback representation at factory time.
pub const BYTEWISE_COMPARATOR_NAME: &str = "tarn.BytewiseComparator";
