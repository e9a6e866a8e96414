//! Engine-facing memtable traits and factory routing.
//!
//! The trie-based representation only supports byte-lexicographic user-key
//! ordering. The factory checks the comparator's canonical name and routes
//! any other ordering to a fallback factory, so the engine never has to know
//! which representation it got.

use crate::constants::BYTEWISE_COMPARATOR_NAME;
use crate::fallback::VectorRepFactory;
use crate::iter::MemtableIter;
use crate::rep::{EntryHandle, PatriciaMemtable};
use std::cmp::Ordering;
use std::sync::Arc;
use tarn_common::MemtableConfig;

/// A named user-key comparator.
///
/// The name identifies the ordering; two comparators with the same name must
/// order identically. Routing decisions are made on the name alone.
#[derive(Clone)]
pub struct KeyComparator {
    name: &'static str,
    compare: fn(&[u8], &[u8]) -> Ordering,
}

impl KeyComparator {
    pub fn new(name: &'static str, compare: fn(&[u8], &[u8]) -> Ordering) -> Self {
        Self { name, compare }
    }

    /// The byte-lexicographic comparator the trie representation supports.
    pub fn bytewise() -> Self {
        Self {
            name: BYTEWISE_COMPARATOR_NAME,
            compare: |a, b| a.cmp(b),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    #[inline]
    pub fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        (self.compare)(a, b)
    }
}

/// Ordered iterator over a memtable representation.
///
/// `key` returns the full record framing; the slice is owned by the iterator
/// and invalidated by any repositioning call.
pub trait MemtableIterator {
    fn valid(&self) -> bool;
    fn key(&self) -> &[u8];
    fn next(&mut self);
    fn prev(&mut self);
    fn seek(&mut self, user_key: &[u8], tag: u64);
    fn seek_for_prev(&mut self, user_key: &[u8], tag: u64);
    fn seek_to_first(&mut self);
    fn seek_to_last(&mut self);
}

impl MemtableIterator for MemtableIter<'_> {
    fn valid(&self) -> bool {
        MemtableIter::valid(self)
    }

    fn key(&self) -> &[u8] {
        MemtableIter::key(self)
    }

    fn next(&mut self) {
        MemtableIter::next(self)
    }

    fn prev(&mut self) {
        MemtableIter::prev(self)
    }

    fn seek(&mut self, user_key: &[u8], tag: u64) {
        MemtableIter::seek(self, user_key, tag)
    }

    fn seek_for_prev(&mut self, user_key: &[u8], tag: u64) {
        MemtableIter::seek_for_prev(self, user_key, tag)
    }

    fn seek_to_first(&mut self) {
        MemtableIter::seek_to_first(self)
    }

    fn seek_to_last(&mut self) {
        MemtableIter::seek_to_last(self)
    }
}

/// A memtable representation as the engine sees it.
pub trait MemtableRep: Send + Sync {
    /// Allocates a record buffer the caller fills and passes to `insert`.
    fn allocate(&self, len: usize) -> EntryHandle;

    /// Inserts a record. Requires a unique `(user_key, tag)` and a memtable
    /// that has not been sealed.
    fn insert(&self, handle: EntryHandle);

    /// True if a record equal to the length-prefixed internal key exists.
    fn contains(&self, memtable_key: &[u8]) -> bool;

    /// Visits versions of the lookup key from its tag downward until the
    /// visitor returns false.
    fn get(&self, memtable_key: &[u8], visitor: &mut dyn FnMut(&[u8]) -> bool);

    /// Seals the representation; idempotent.
    fn mark_read_only(&self);

    fn approximate_memory_usage(&self) -> usize;

    fn num_entries(&self) -> usize;

    fn iter(&self) -> Box<dyn MemtableIterator + '_>;
}

impl MemtableRep for PatriciaMemtable {
    fn allocate(&self, len: usize) -> EntryHandle {
        PatriciaMemtable::allocate(self, len)
    }

    fn insert(&self, handle: EntryHandle) {
        PatriciaMemtable::insert(self, handle)
    }

    fn contains(&self, memtable_key: &[u8]) -> bool {
        PatriciaMemtable::contains(self, memtable_key)
    }

    fn get(&self, memtable_key: &[u8], visitor: &mut dyn FnMut(&[u8]) -> bool) {
        PatriciaMemtable::get(self, memtable_key, visitor)
    }

    fn mark_read_only(&self) {
        PatriciaMemtable::mark_read_only(self)
    }

    fn approximate_memory_usage(&self) -> usize {
        PatriciaMemtable::approximate_memory_usage(self)
    }

    fn num_entries(&self) -> usize {
        PatriciaMemtable::num_entries(self)
    }

    fn iter(&self) -> Box<dyn MemtableIterator + '_> {
        Box::new(PatriciaMemtable::iter(self))
    }
}

/// Creates memtable representations for the engine.
pub trait MemtableRepFactory: Send + Sync {
    fn create(&self, comparator: &KeyComparator) -> Box<dyn MemtableRep>;

    fn name(&self) -> &'static str;

    /// Whether `insert` may be called from multiple threads at once. The
    /// trie representation requires the engine to serialize writers.
    fn supports_concurrent_insert(&self) -> bool {
        false
    }
}

/// Factory for the trie-based representation with fallback routing.
pub struct PatriciaRepFactory {
    config: MemtableConfig,
    fallback: Arc<dyn MemtableRepFactory>,
}

impl PatriciaRepFactory {
    /// `fallback` handles non-bytewise comparators; defaults to the sorted
    /// vector representation.
    pub fn new(config: MemtableConfig, fallback: Option<Arc<dyn MemtableRepFactory>>) -> Self {
        Self {
            config,
            fallback: fallback.unwrap_or_else(|| Arc::new(VectorRepFactory)),
        }
    }
}

impl MemtableRepFactory for PatriciaRepFactory {
    fn create(&self, comparator: &KeyComparator) -> Box<dyn MemtableRep> {
        if comparator.name() == BYTEWISE_COMPARATOR_NAME {
            Box::new(PatriciaMemtable::new(&self.config))
        } else {
            tracing::debug!(
                comparator = comparator.name(),
                fallback = self.fallback.name(),
                "non-bytewise comparator, routing to fallback memtable"
            );
            self.fallback.create(comparator)
        }
    }

    fn name(&self) -> &'static str {
        "PatriciaTrieRepFactory"
    }

    fn supports_concurrent_insert(&self) -> bool {
        false
    }
}

/// Convenience constructor mirroring the engine's factory wiring:
/// `sharding_count == 0` derives the lock table size from the host.
pub fn new_patricia_factory(
    sharding_count: usize,
    fallback: Option<Arc<dyn MemtableRepFactory>>,
) -> Arc<dyn MemtableRepFactory> {
    let config = MemtableConfig {
        sharding_count,
        ..Default::default()
    };
    Arc::new(PatriciaRepFactory::new(config, fallback))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rep::parse_record;

    fn reverse_comparator() -> KeyComparator {
        KeyComparator::new("test.ReverseBytewiseComparator", |a, b| b.cmp(a))
    }

    #[test]
    fn test_bytewise_routes_to_trie_rep() {
        let factory = new_patricia_factory(4, None);
        let rep = factory.create(&KeyComparator::bytewise());
        rep.insert(EntryHandle::encode(b"banana", 1, b"x"));
        rep.insert(EntryHandle::encode(b"apple", 1, b"y"));

        let mut iter = rep.iter();
        iter.seek_to_first();
        assert!(iter.valid());
        // Bytewise ascending: apple first.
        let (user_key, _, _) = parse_record(iter.key()).unwrap();
        assert_eq!(user_key, b"apple");
    }

    #[test]
    fn test_non_bytewise_routes_to_fallback() {
        let factory = new_patricia_factory(4, None);
        let rep = factory.create(&reverse_comparator());
        rep.insert(EntryHandle::encode(b"apple", 1, b"y"));
        rep.insert(EntryHandle::encode(b"banana", 1, b"x"));

        let mut iter = rep.iter();
        iter.seek_to_first();
        assert!(iter.valid());
        // Reverse ordering: banana first, proving the fallback took over.
        let (user_key, _, _) = parse_record(iter.key()).unwrap();
        assert_eq!(user_key, b"banana");
    }

    #[test]
    fn test_factory_advertises_serial_insert() {
        let factory = new_patricia_factory(0, None);
        assert!(!factory.supports_concurrent_insert());
        assert_eq!(factory.name(), "PatriciaTrieRepFactory");
    }

    #[test]
    fn test_comparator_accessors() {
        let bytewise = KeyComparator::bytewise();
        assert_eq!(bytewise.name(), BYTEWISE_COMPARATOR_NAME);
        assert_eq!(bytewise.compare(b"a", b"b"), Ordering::Less);
        assert_eq!(bytewise.compare(b"b", b"a"), Ordering::Greater);
        assert_eq!(bytewise.compare(b"a", b"a"), Ordering::Equal);

        let reverse = reverse_comparator();
        assert_eq!(reverse.compare(b"a", b"b"), Ordering::Greater);
    }
}
