//! In-memory multi-version memtable representation for TarnDB.
//!
//! This crate provides the write-absorbing front tier of the LSM engine:
//! an ordered, multi-version key/value index built from two layers:
//!
//! - a chain of arena-backed Patricia tries mapping each user key to a
//!   per-key slot, appended to as each trie's arena budget runs out;
//! - one intrusive threaded red-black tree per user key holding every
//!   version of that key, ordered by tag descending (newest first).
//!
//! Concurrency: the engine serializes writers; readers run concurrently,
//! coordinating per key through a hash-sharded mutex table while the
//! memtable is mutable and lock-free once it is sealed. All nodes live in
//! arenas and are dropped wholesale when the memtable is flushed.
//!
//! The factory routes non-bytewise user-key comparators to a fallback
//! representation, so the engine always receives a working memtable.

mod arena;
mod constants;
mod encoding;
mod fallback;
mod factory;
mod iter;
mod rbtree;
mod rep;
mod shard;
mod trie;

pub use constants::BYTEWISE_COMPARATOR_NAME;
pub use factory::{
    new_patricia_factory, KeyComparator, MemtableIterator, MemtableRep, MemtableRepFactory,
    PatriciaRepFactory,
};
pub use fallback::{VectorRep, VectorRepFactory};
pub use iter::MemtableIter;
pub use rep::{encode_lookup_key, parse_record, EntryHandle, PatriciaMemtable};
