//! The trie-based memtable representation.
//!
//! A `PatriciaMemtable` is an append-only chain of Patricia tries plus one
//! growing arena for version records. Each user key is owned by exactly one
//! trie: the first trie in the chain that saw it. A trie whose arena budget
//! runs out is sealed in place and a new trie with twice the budget is
//! appended, so readers union across the chain and ordered scans merge it.
//!
//! Writers are serialized by the engine (the factory advertises no
//! concurrent insert); readers run concurrently with the writer, taking the
//! shard lock for a key's version list while the memtable is mutable and no
//! lock at all once it is sealed.

use crate::arena::Arena;
use crate::encoding::{
    decode_varint32, length_prefixed_slice, put_fixed64, put_varint32, split_internal_key,
    varint32_len,
};
use crate::iter::MemtableIter;
use crate::rbtree::{self, root_cell, NODE_HEADER_SIZE, ROOT_CELL_SIZE};
use crate::shard::LockTable;
use crate::trie::{Trie, TrieInsert};
use bytes::{BufMut, BytesMut};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use tarn_common::MemtableConfig;

/// A caller-filled record buffer, consumed by [`PatriciaMemtable::insert`].
///
/// Record layout:
/// ```text
/// varint32  internal_key_len        (= user_key_len + 8)
/// bytes     user_key
/// fixed64   tag                     (little-endian)
/// varint32  value_len
/// bytes     value
/// ```
pub struct EntryHandle {
    buf: BytesMut,
}

impl EntryHandle {
    pub(crate) fn with_len(len: usize) -> Self {
        Self {
            buf: BytesMut::zeroed(len),
        }
    }

    /// Builds a fully framed record from its parts.
    pub fn encode(user_key: &[u8], tag: u64, value: &[u8]) -> Self {
        let len = varint32_len((user_key.len() + 8) as u32)
            + user_key.len()
            + 8
            + varint32_len(value.len() as u32)
            + value.len();
        let mut buf = BytesMut::with_capacity(len);
        put_varint32_buf(&mut buf, (user_key.len() + 8) as u32);
        buf.put_slice(user_key);
        buf.put_u64_le(tag);
        put_varint32_buf(&mut buf, value.len() as u32);
        buf.put_slice(value);
        Self { buf }
    }

    /// The raw record bytes, for caller-side filling after `allocate`.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }
}

fn put_varint32_buf(buf: &mut BytesMut, mut value: u32) {
    while value >= 0x80 {
        buf.put_u8((value as u8) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

/// Append-only chain of tries with lock-free readers. Capacity is reserved
/// up front; the writer appends, readers observe the published length.
pub(crate) struct TrieVec {
    slots: Box<[AtomicPtr<Trie>]>,
    len: AtomicUsize,
}

impl TrieVec {
    fn with_capacity(capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect();
        Self {
            slots,
            len: AtomicUsize::new(0),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub(crate) fn get(&self, index: usize) -> &Trie {
        debug_assert!(index < self.len());
        unsafe { &*self.slots[index].load(Ordering::Acquire) }
    }

    fn push(&self, trie: Trie) {
        let len = self.len.load(Ordering::Relaxed);
        assert!(
            len < self.slots.len(),
            "memtable trie chain exceeded its reserved capacity; flush is overdue"
        );
        self.slots[len].store(Box::into_raw(Box::new(trie)), Ordering::Release);
        self.len.store(len + 1, Ordering::Release);
    }
}

impl Drop for TrieVec {
    fn drop(&mut self) {
        for i in 0..self.len.load(Ordering::Relaxed) {
            drop(unsafe { Box::from_raw(self.slots[i].load(Ordering::Relaxed)) });
        }
    }
}

/// In-memory multi-version index: Patricia tries over user keys composed
/// with one threaded red-black tree of versions per key.
pub struct PatriciaMemtable {
    tries: TrieVec,
    locks: LockTable,
    /// Version records and root cells; dropped wholesale with the memtable.
    nodes: Arena,
    immutable: AtomicBool,
    num_entries: AtomicUsize,
    base_block_size: usize,
    refresh_threshold: usize,
}

impl PatriciaMemtable {
    /// Creates an empty memtable with one trie of the base arena budget.
    pub fn new(config: &MemtableConfig) -> Self {
        debug_assert!(config.validate().is_ok());
        let tries = TrieVec::with_capacity(config.trie_capacity);
        tries.push(Trie::new(config.base_block_size));
        Self {
            tries,
            locks: LockTable::new(config.effective_sharding_count()),
            nodes: Arena::growing(),
            immutable: AtomicBool::new(false),
            num_entries: AtomicUsize::new(0),
            base_block_size: config.base_block_size,
            refresh_threshold: config.cursor_refresh_threshold,
        }
    }

    /// Allocates a record buffer for the caller to fill and pass to `insert`.
    pub fn allocate(&self, len: usize) -> EntryHandle {
        EntryHandle::with_len(len)
    }

    /// Inserts a record.
    ///
    /// Requires that no record with the same `(user_key, tag)` was inserted
    /// before and that the memtable has not been sealed.
    pub fn insert(&self, handle: EntryHandle) {
        debug_assert!(!self.is_read_only(), "insert after seal");
        let entry = &handle.buf[..];
        let internal_key = length_prefixed_slice(entry).expect("malformed record framing");
        let (user_key, tag) = split_internal_key(internal_key);

        let value_region = &entry[varint32_len(internal_key.len() as u32) + internal_key.len()..];
        let (value_len, varint_len) =
            decode_varint32(value_region).expect("malformed value framing");
        let prefixed_value = &value_region[..varint_len + value_len as usize];

        let node_addr = self
            .nodes
            .alloc_addr(NODE_HEADER_SIZE + prefixed_value.len())
            .expect("memtable arena allocation failed");
        rbtree::init_version_node(node_addr, tag, prefixed_value);

        // The first trie that already owns the key, or that has room for it,
        // takes the record; this keeps every key in exactly one trie.
        let mut index = 0;
        loop {
            let trie = self.tries.get(index);
            match trie.insert(user_key, || {
                // Runs before the slot is published: no reader can observe
                // the cell until its first version is in place.
                let cell = self
                    .nodes
                    .alloc_addr(ROOT_CELL_SIZE)
                    .expect("memtable arena allocation failed");
                rbtree::init_root_cell(cell);
                rbtree::insert_multi(root_cell(cell), node_addr);
                cell
            }) {
                TrieInsert::Inserted(_) => break,
                TrieInsert::Found(slot) => {
                    let _guard = self.locks.lock(slot);
                    let root = root_cell(slot);
                    debug_assert_eq!(
                        rbtree::equal_unique(root, tag),
                        rbtree::NIL,
                        "duplicate (user_key, tag) insertion"
                    );
                    rbtree::insert_multi(root, node_addr);
                    break;
                }
                TrieInsert::Full => {
                    if index == self.tries.len() - 1 {
                        let budget = self.base_block_size << self.tries.len();
                        tracing::debug!(
                            tries = self.tries.len() + 1,
                            budget,
                            "trie arena exhausted, appending trie"
                        );
                        self.tries.push(Trie::new(budget));
                    }
                    index += 1;
                }
            }
        }
        self.num_entries.fetch_add(1, Ordering::Relaxed);
    }

    /// True if a record equal to the length-prefixed internal key exists.
    pub fn contains(&self, memtable_key: &[u8]) -> bool {
        let Some(internal_key) = length_prefixed_slice(memtable_key) else {
            debug_assert!(false, "malformed lookup key");
            return false;
        };
        let (user_key, tag) = split_internal_key(internal_key);
        let sealed = self.is_read_only();
        for i in 0..self.tries.len() {
            let Some(slot) = self.tries.get(i).lookup(user_key) else {
                continue;
            };
            let _guard = (!sealed).then(|| self.locks.lock(slot));
            return rbtree::equal_unique(root_cell(slot), tag) != rbtree::NIL;
        }
        false
    }

    /// Visits the versions of a key starting at its lookup tag and walking
    /// toward older versions, until `visitor` returns false. The visitor
    /// receives the full record in the memtable's output framing; the slice
    /// is only valid for the duration of the call.
    pub fn get(&self, memtable_key: &[u8], visitor: &mut dyn FnMut(&[u8]) -> bool) {
        let Some(internal_key) = length_prefixed_slice(memtable_key) else {
            debug_assert!(false, "malformed lookup key");
            return;
        };
        let (user_key, tag) = split_internal_key(internal_key);
        let sealed = self.is_read_only();
        let mut buffer = Vec::new();
        for i in 0..self.tries.len() {
            let Some(slot) = self.tries.get(i).lookup(user_key) else {
                continue;
            };
            let root = root_cell(slot);
            let _guard = (!sealed).then(|| self.locks.lock(slot));
            let mut addr = rbtree::lower_bound(root, tag);
            while addr != rbtree::NIL {
                build_record(&mut buffer, user_key, addr);
                if !visitor(&buffer) {
                    break;
                }
                addr = rbtree::move_next(addr);
            }
            // The first trie containing the key owns all of its versions.
            break;
        }
    }

    /// Seals the memtable. Idempotent; readers afterwards take no locks.
    pub fn mark_read_only(&self) {
        if !self.immutable.swap(true, Ordering::Release) {
            tracing::debug!(
                entries = self.num_entries(),
                tries = self.tries.len(),
                "memtable sealed"
            );
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.immutable.load(Ordering::Acquire)
    }

    /// Arena footprint of the trie chain and the version records.
    pub fn approximate_memory_usage(&self) -> usize {
        let mut total = self.nodes.reserved();
        for i in 0..self.tries.len() {
            total += self.tries.get(i).mem_size();
        }
        total
    }

    /// Number of records inserted.
    pub fn num_entries(&self) -> usize {
        self.num_entries.load(Ordering::Relaxed)
    }

    /// Creates an ordered iterator over the current contents. The variant
    /// (single- or multi-trie, locked or lock-free) is fixed by the state at
    /// construction.
    pub fn iter(&self) -> MemtableIter<'_> {
        MemtableIter::new(self)
    }

    pub(crate) fn tries(&self) -> &TrieVec {
        &self.tries
    }

    pub(crate) fn locks(&self) -> &LockTable {
        &self.locks
    }

    pub(crate) fn refresh_threshold(&self) -> usize {
        self.refresh_threshold
    }
}

/// Builds the length-prefixed internal key accepted by
/// [`PatriciaMemtable::contains`] and [`PatriciaMemtable::get`].
pub fn encode_lookup_key(user_key: &[u8], tag: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(user_key.len() + 13);
    put_varint32(&mut buf, (user_key.len() + 8) as u32);
    buf.extend_from_slice(user_key);
    put_fixed64(&mut buf, tag);
    buf
}

/// Splits a full record into `(user_key, tag, value)`, or `None` if the
/// framing is malformed.
pub fn parse_record(record: &[u8]) -> Option<(&[u8], u64, &[u8])> {
    let internal_key = length_prefixed_slice(record)?;
    let (user_key, tag) = split_internal_key(internal_key);
    let value_region = &record[varint32_len(internal_key.len() as u32) + internal_key.len()..];
    let value = length_prefixed_slice(value_region)?;
    Some((user_key, tag, value))
}

/// Assembles the output framing for one version of a key into `buf`:
/// `varint32(len) || user_key || tag || prefixed_value`.
pub(crate) fn build_record(buf: &mut Vec<u8>, user_key: &[u8], node_addr: usize) {
    let prefixed_value = rbtree::node_prefixed_value(node_addr);
    buf.clear();
    buf.reserve(user_key.len() + prefixed_value.len() + 13);
    put_varint32(buf, (user_key.len() + 8) as u32);
    buf.extend_from_slice(user_key);
    put_fixed64(buf, rbtree::node_tag(node_addr));
    buf.extend_from_slice(prefixed_value);
}
