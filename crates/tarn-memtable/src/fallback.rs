//! Sorted-vector fallback representation for non-bytewise comparators.
//!
//! Keeps full records in a vector ordered by the user comparator (then tag
//! descending) under a reader-writer lock. Iterators work on a snapshot.
//! This trades throughput for simplicity; it exists so custom comparators
//! still get a correct memtable.

use crate::encoding::{length_prefixed_slice, split_internal_key};
use crate::factory::{KeyComparator, MemtableIterator, MemtableRep, MemtableRepFactory};
use crate::rep::EntryHandle;
use parking_lot::RwLock;
use std::cmp::Ordering;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

/// Internal key of a stored record.
fn record_key(record: &[u8]) -> (&[u8], u64) {
    let internal_key = length_prefixed_slice(record).expect("stored record framing");
    split_internal_key(internal_key)
}

/// Scan order: user key by the comparator ascending, then tag descending.
fn compare_to_probe(
    comparator: &KeyComparator,
    record: &[u8],
    user_key: &[u8],
    tag: u64,
) -> Ordering {
    let (record_user_key, record_tag) = record_key(record);
    comparator
        .compare(record_user_key, user_key)
        .then_with(|| tag.cmp(&record_tag))
}

/// Comparator-ordered vector memtable.
pub struct VectorRep {
    comparator: KeyComparator,
    entries: RwLock<Vec<Arc<[u8]>>>,
    immutable: AtomicBool,
    value_bytes: AtomicUsize,
}

impl VectorRep {
    pub fn new(comparator: KeyComparator) -> Self {
        Self {
            comparator,
            entries: RwLock::new(Vec::new()),
            immutable: AtomicBool::new(false),
            value_bytes: AtomicUsize::new(0),
        }
    }
}

impl MemtableRep for VectorRep {
    fn allocate(&self, len: usize) -> EntryHandle {
        EntryHandle::with_len(len)
    }

    fn insert(&self, handle: EntryHandle) {
        debug_assert!(!self.immutable.load(AtomicOrdering::Acquire), "insert after seal");
        let record: Arc<[u8]> = Arc::from(handle.as_slice());
        let mut entries = self.entries.write();
        let at = {
            let (user_key, tag) = record_key(&record);
            let at = entries.partition_point(|r| {
                compare_to_probe(&self.comparator, r, user_key, tag) == Ordering::Less
            });
            debug_assert!(
                entries
                    .get(at)
                    .map(|r| compare_to_probe(&self.comparator, r, user_key, tag) != Ordering::Equal)
                    .unwrap_or(true),
                "duplicate (user_key, tag) insertion"
            );
            at
        };
        self.value_bytes.fetch_add(record.len(), AtomicOrdering::Relaxed);
        entries.insert(at, record);
    }

    fn contains(&self, memtable_key: &[u8]) -> bool {
        let Some(internal_key) = length_prefixed_slice(memtable_key) else {
            return false;
        };
        let (user_key, tag) = split_internal_key(internal_key);
        let entries = self.entries.read();
        let at = entries
            .partition_point(|r| compare_to_probe(&self.comparator, r, user_key, tag) == Ordering::Less);
        entries
            .get(at)
            .map(|r| compare_to_probe(&self.comparator, r, user_key, tag) == Ordering::Equal)
            .unwrap_or(false)
    }

    fn get(&self, memtable_key: &[u8], visitor: &mut dyn FnMut(&[u8]) -> bool) {
        let Some(internal_key) = length_prefixed_slice(memtable_key) else {
            return;
        };
        let (user_key, tag) = split_internal_key(internal_key);
        let entries = self.entries.read();
        let mut at = entries
            .partition_point(|r| compare_to_probe(&self.comparator, r, user_key, tag) == Ordering::Less);
        while let Some(record) = entries.get(at) {
            let (record_user_key, _) = record_key(record);
            if self.comparator.compare(record_user_key, user_key) != Ordering::Equal {
                break;
            }
            if !visitor(record) {
                break;
            }
            at += 1;
        }
    }

    fn mark_read_only(&self) {
        self.immutable.store(true, AtomicOrdering::Release);
    }

    fn approximate_memory_usage(&self) -> usize {
        self.value_bytes.load(AtomicOrdering::Relaxed)
    }

    fn num_entries(&self) -> usize {
        self.entries.read().len()
    }

    fn iter(&self) -> Box<dyn MemtableIterator + '_> {
        Box::new(VectorIter {
            comparator: self.comparator.clone(),
            entries: self.entries.read().clone(),
            at: 0,
            valid: false,
        })
    }
}

/// Snapshot iterator over a [`VectorRep`].
struct VectorIter {
    comparator: KeyComparator,
    entries: Vec<Arc<[u8]>>,
    at: usize,
    valid: bool,
}

impl MemtableIterator for VectorIter {
    fn valid(&self) -> bool {
        self.valid
    }

    fn key(&self) -> &[u8] {
        debug_assert!(self.valid);
        &self.entries[self.at][..]
    }

    fn next(&mut self) {
        debug_assert!(self.valid);
        if self.at + 1 < self.entries.len() {
            self.at += 1;
        } else {
            self.valid = false;
        }
    }

    fn prev(&mut self) {
        debug_assert!(self.valid);
        if self.at > 0 {
            self.at -= 1;
        } else {
            self.valid = false;
        }
    }

    fn seek(&mut self, user_key: &[u8], tag: u64) {
        self.at = self.entries.partition_point(|r| {
            compare_to_probe(&self.comparator, r, user_key, tag) == Ordering::Less
        });
        self.valid = self.at < self.entries.len();
    }

    fn seek_for_prev(&mut self, user_key: &[u8], tag: u64) {
        let end = self.entries.partition_point(|r| {
            compare_to_probe(&self.comparator, r, user_key, tag) != Ordering::Greater
        });
        if end == 0 {
            self.valid = false;
        } else {
            self.at = end - 1;
            self.valid = true;
        }
    }

    fn seek_to_first(&mut self) {
        self.at = 0;
        self.valid = !self.entries.is_empty();
    }

    fn seek_to_last(&mut self) {
        self.valid = !self.entries.is_empty();
        if self.valid {
            self.at = self.entries.len() - 1;
        }
    }
}

/// Factory for [`VectorRep`]; the default fallback.
pub struct VectorRepFactory;

impl MemtableRepFactory for VectorRepFactory {
    fn create(&self, comparator: &KeyComparator) -> Box<dyn MemtableRep> {
        Box::new(VectorRep::new(comparator.clone()))
    }

    fn name(&self) -> &'static str {
        "VectorRepFactory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insert_kv(rep: &VectorRep, user_key: &[u8], tag: u64, value: &[u8]) {
        rep.insert(EntryHandle::encode(user_key, tag, value));
    }

    fn scan_keys(rep: &VectorRep) -> Vec<(Vec<u8>, u64)> {
        let mut iter = MemtableRep::iter(rep);
        iter.seek_to_first();
        let mut out = Vec::new();
        while iter.valid() {
            let (user_key, tag) = record_key(iter.key());
            out.push((user_key.to_vec(), tag));
            iter.next();
        }
        out
    }

    #[test]
    fn test_scan_order_bytewise() {
        let rep = VectorRep::new(KeyComparator::bytewise());
        insert_kv(&rep, b"banana", 7, b"v");
        insert_kv(&rep, b"apple", 3, b"v");
        insert_kv(&rep, b"apple", 5, b"v");

        assert_eq!(
            scan_keys(&rep),
            vec![
                (b"apple".to_vec(), 5),
                (b"apple".to_vec(), 3),
                (b"banana".to_vec(), 7),
            ]
        );
    }

    #[test]
    fn test_scan_order_respects_custom_comparator() {
        let reverse = KeyComparator::new("test.ReverseBytewiseComparator", |a, b| b.cmp(a));
        let rep = VectorRep::new(reverse);
        insert_kv(&rep, b"apple", 1, b"v");
        insert_kv(&rep, b"banana", 1, b"v");
        insert_kv(&rep, b"cherry", 1, b"v");

        let keys: Vec<_> = scan_keys(&rep).into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![b"cherry".to_vec(), b"banana".to_vec(), b"apple".to_vec()]);
    }

    #[test]
    fn test_contains_and_get() {
        let rep = VectorRep::new(KeyComparator::bytewise());
        insert_kv(&rep, b"key", 9, b"v9");
        insert_kv(&rep, b"key", 4, b"v4");

        let probe = EntryHandle::encode(b"key", 9, b"");
        let probe_key = &probe.as_slice()[..probe.as_slice().len() - 1];
        assert!(rep.contains(probe_key));

        let mut tags = Vec::new();
        let lookup = EntryHandle::encode(b"key", u64::MAX, b"");
        let lookup_key = &lookup.as_slice()[..lookup.as_slice().len() - 1];
        rep.get(lookup_key, &mut |record| {
            tags.push(record_key(record).1);
            true
        });
        assert_eq!(tags, vec![9, 4]);
    }

    #[test]
    fn test_seek_and_seek_for_prev() {
        let rep = VectorRep::new(KeyComparator::bytewise());
        insert_kv(&rep, b"apple", 5, b"v");
        insert_kv(&rep, b"apple", 3, b"v");
        insert_kv(&rep, b"banana", 7, b"v");

        let mut iter = MemtableRep::iter(&rep);
        iter.seek(b"apple", 4);
        assert!(iter.valid());
        assert_eq!(record_key(iter.key()), (&b"apple"[..], 3));

        iter.seek_for_prev(b"apple", 4);
        assert!(iter.valid());
        assert_eq!(record_key(iter.key()), (&b"apple"[..], 5));

        iter.seek(b"zebra", 1);
        assert!(!iter.valid());
    }
}
