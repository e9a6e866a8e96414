//! Arena-backed Patricia trie mapping user keys to per-key slots.
//!
//! Path-compressed byte trie with a single mutating writer and any number of
//! concurrent readers. Every structural change is prepared off to the side in
//! the arena and published with one `Release` store (a new slot value, a new
//! edge-array pointer, or a replacement child pointer), so readers always
//! observe a consistent tree. Superseded nodes are never freed; they stay
//! valid for readers that still hold them and die with the arena.
//!
//! The trie owns a bounded arena. When the arena refuses an allocation the
//! insert reports [`TrieInsert::Full`] without having modified anything, and
//! the caller seals this trie in place and opens a fresh one.
//!
//! Node layout (`#[repr(C)]`, 32 bytes, arena-allocated):
//! ```text
//! +--------------------+ 0
//! | prefix address     | 8    compressed path bytes (in the arena)
//! | prefix_len: u32    | 12
//! | (pad): u32         | 16
//! | slot: AtomicUsize  | 24   0, or the per-key root-cell address
//! | edges: AtomicUsize | 32   0, or an edge-array address
//! +--------------------+
//! ```
//! An edge array is `{count, capacity, labels[capacity], children[capacity]}`
//! and is append-only; entries are stored unordered and readers sort their
//! own snapshots. A key that is a proper prefix of another lands on a node
//! that carries both a slot and edges, and orders before its extensions.

use crate::arena::Arena;
use crate::constants::{EDGE_INITIAL_CAPACITY, EDGE_MAX_CAPACITY};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Outcome of a trie insertion attempt.
pub(crate) enum TrieInsert {
    /// The key was new; the slot returned by the init closure is published.
    Inserted(usize),
    /// The key already had a slot.
    Found(usize),
    /// The trie's arena budget is exhausted; nothing was modified.
    Full,
}

#[repr(C)]
struct TrieNode {
    prefix_addr: usize,
    prefix_len: u32,
    _pad: u32,
    slot: AtomicUsize,
    edges: AtomicUsize,
}

const TRIE_NODE_SIZE: usize = std::mem::size_of::<TrieNode>();

#[inline]
fn node_ref<'a>(addr: usize) -> &'a TrieNode {
    debug_assert!(addr != 0 && addr % 8 == 0);
    unsafe { &*(addr as *const TrieNode) }
}

#[inline]
fn node_prefix<'a>(addr: usize) -> &'a [u8] {
    let node = node_ref(addr);
    if node.prefix_len == 0 {
        return &[];
    }
    unsafe { std::slice::from_raw_parts(node.prefix_addr as *const u8, node.prefix_len as usize) }
}

#[inline]
fn node_slot(addr: usize) -> usize {
    node_ref(addr).slot.load(Ordering::Acquire)
}

#[inline]
fn node_edges(addr: usize) -> Edges {
    Edges(node_ref(addr).edges.load(Ordering::Acquire))
}

fn write_trie_node(addr: usize, prefix_addr: usize, prefix_len: u32, slot: usize, edges: usize) {
    unsafe {
        (addr as *mut TrieNode).write(TrieNode {
            prefix_addr,
            prefix_len,
            _pad: 0,
            slot: AtomicUsize::new(slot),
            edges: AtomicUsize::new(edges),
        })
    }
}

/// Handle to an edge array; 0 means "no edges".
#[derive(Clone, Copy)]
struct Edges(usize);

impl Edges {
    const HEADER: usize = 16;

    fn size_for(capacity: usize) -> usize {
        Self::HEADER + round8(capacity) + capacity * 8
    }

    fn init(addr: usize, capacity: usize) {
        unsafe {
            (addr as *mut AtomicUsize).write(AtomicUsize::new(0));
            ((addr + 8) as *mut usize).write(capacity);
        }
    }

    #[inline]
    fn count(self) -> usize {
        if self.0 == 0 {
            return 0;
        }
        unsafe { (*(self.0 as *const AtomicUsize)).load(Ordering::Acquire) }
    }

    #[inline]
    fn capacity(self) -> usize {
        if self.0 == 0 {
            return 0;
        }
        unsafe { *((self.0 + 8) as *const usize) }
    }

    #[inline]
    fn label(self, i: usize) -> u8 {
        unsafe { *((self.0 + Self::HEADER + i) as *const u8) }
    }

    #[inline]
    fn child_slot(self, i: usize) -> &'static AtomicUsize {
        let children = self.0 + Self::HEADER + round8(self.capacity());
        unsafe { &*((children + i * 8) as *const AtomicUsize) }
    }

    #[inline]
    fn child(self, i: usize) -> usize {
        self.child_slot(i).load(Ordering::Acquire)
    }

    /// Scans for `label`, returning its storage index and current child.
    fn find(self, label: u8) -> Option<(usize, usize)> {
        let n = self.count();
        for i in 0..n {
            if self.label(i) == label {
                return Some((i, self.child(i)));
            }
        }
        None
    }

    /// Writer only: stages an entry at `index` without publishing it.
    fn stage(self, index: usize, label: u8, child: usize) {
        debug_assert!(index < self.capacity());
        unsafe { *((self.0 + Self::HEADER + index) as *mut u8) = label };
        self.child_slot(index).store(child, Ordering::Relaxed);
    }

    /// Writer only: publishes entries staged up to `count`.
    fn publish_count(self, count: usize) {
        unsafe { (*(self.0 as *const AtomicUsize)).store(count, Ordering::Release) }
    }

    /// Writer only: replaces the child at a storage index (node split).
    fn replace_child(self, index: usize, child: usize) {
        self.child_slot(index).store(child, Ordering::Release);
    }

    /// Sorted snapshot of the published entries.
    fn snapshot(self) -> Vec<(u8, usize)> {
        let n = self.count();
        let mut out = Vec::with_capacity(n);
        for i in 0..n {
            out.push((self.label(i), self.child(i)));
        }
        out.sort_unstable_by_key(|&(label, _)| label);
        out
    }
}

#[inline]
fn round8(len: usize) -> usize {
    (len + 7) & !7
}

#[inline]
fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

/// A single Patricia trie with its bounded arena.
pub(crate) struct Trie {
    arena: Arena,
    root: usize,
    num_words: AtomicUsize,
}

// All shared state is published through atomics; arena blocks are pinned.
unsafe impl Send for Trie {}
unsafe impl Sync for Trie {}

impl Trie {
    /// Creates an empty trie with an arena budget of `budget` bytes.
    pub(crate) fn new(budget: usize) -> Self {
        let arena = Arena::bounded(budget);
        let root = arena
            .alloc_addr(TRIE_NODE_SIZE)
            .expect("trie arena budget too small for a root node");
        write_trie_node(root, 0, 0, 0, 0);
        Self {
            arena,
            root,
            num_words: AtomicUsize::new(0),
        }
    }

    /// Number of distinct user keys stored.
    pub(crate) fn num_words(&self) -> usize {
        self.num_words.load(Ordering::Acquire)
    }

    /// Bytes of arena memory reserved by this trie.
    pub(crate) fn mem_size(&self) -> usize {
        self.arena.reserved()
    }

    /// Looks up `key`, returning its slot if the key has one.
    pub(crate) fn lookup(&self, key: &[u8]) -> Option<usize> {
        let mut addr = self.root;
        let mut pos = 0;
        loop {
            let prefix = node_prefix(addr);
            let rest = &key[pos..];
            if rest.len() < prefix.len() || &rest[..prefix.len()] != prefix {
                return None;
            }
            pos += prefix.len();
            if pos == key.len() {
                let slot = node_slot(addr);
                return (slot != 0).then_some(slot);
            }
            let (_, child) = node_edges(addr).find(key[pos])?;
            addr = child;
            pos += 1;
        }
    }

    /// Inserts `key`, creating its slot with `init` if absent.
    ///
    /// `init` runs before the slot becomes visible to any reader, so a slot
    /// address observed through `lookup` is always fully initialized. Only
    /// one writer may call `insert` at a time.
    pub(crate) fn insert(&self, key: &[u8], init: impl FnOnce() -> usize) -> TrieInsert {
        let mut parent_edges = Edges(0);
        let mut parent_index = 0usize;
        let mut addr = self.root;
        let mut pos = 0;
        loop {
            let prefix = node_prefix(addr);
            let rest = &key[pos..];
            let matched = common_prefix_len(prefix, rest);
            if matched < prefix.len() {
                return self.split(parent_edges, parent_index, addr, matched, rest, init);
            }
            pos += matched;
            if pos == key.len() {
                let slot = node_slot(addr);
                if slot != 0 {
                    return TrieInsert::Found(slot);
                }
                let cell = init();
                debug_assert!(cell != 0);
                node_ref(addr).slot.store(cell, Ordering::Release);
                self.num_words.fetch_add(1, Ordering::Release);
                return TrieInsert::Inserted(cell);
            }
            let edges = node_edges(addr);
            match edges.find(key[pos]) {
                Some((index, child)) => {
                    parent_edges = edges;
                    parent_index = index;
                    addr = child;
                    pos += 1;
                }
                None => return self.append_leaf(addr, edges, &key[pos..], init),
            }
        }
    }

    /// Copies `bytes` into the arena, returning its address (0 for empty).
    fn stash_prefix(&self, bytes: &[u8]) -> Option<usize> {
        if bytes.is_empty() {
            return Some(0);
        }
        let addr = self.arena.alloc_addr(bytes.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), addr as *mut u8, bytes.len());
        }
        Some(addr)
    }

    /// Adds a leaf for `suffix` (label byte plus remaining prefix) under
    /// `addr`, growing the edge array when it is at capacity.
    fn append_leaf(
        &self,
        addr: usize,
        edges: Edges,
        suffix: &[u8],
        init: impl FnOnce() -> usize,
    ) -> TrieInsert {
        let label = suffix[0];
        let staged = (|| {
            let prefix_addr = self.stash_prefix(&suffix[1..])?;
            let leaf = self.arena.alloc_addr(TRIE_NODE_SIZE)?;
            write_trie_node(leaf, prefix_addr, (suffix.len() - 1) as u32, 0, 0);

            let count = edges.count();
            let grown = if edges.0 == 0 || count == edges.capacity() {
                // A full 256-way node never appends: all labels exist.
                debug_assert!(count < EDGE_MAX_CAPACITY);
                let capacity = if edges.0 == 0 {
                    EDGE_INITIAL_CAPACITY
                } else {
                    (edges.capacity() * 2).min(EDGE_MAX_CAPACITY)
                };
                let grown = Edges(self.arena.alloc_addr(Edges::size_for(capacity))?);
                Edges::init(grown.0, capacity);
                for i in 0..count {
                    grown.stage(i, edges.label(i), edges.child(i));
                }
                Some(grown)
            } else {
                None
            };
            Some((leaf, count, grown))
        })();
        let Some((leaf, count, grown)) = staged else {
            return TrieInsert::Full;
        };

        let cell = init();
        debug_assert!(cell != 0);
        node_ref(leaf).slot.store(cell, Ordering::Release);

        match grown {
            Some(grown) => {
                grown.stage(count, label, leaf);
                grown.publish_count(count + 1);
                node_ref(addr).edges.store(grown.0, Ordering::Release);
            }
            None => {
                edges.stage(count, label, leaf);
                edges.publish_count(count + 1);
            }
        }
        self.num_words.fetch_add(1, Ordering::Release);
        TrieInsert::Inserted(cell)
    }

    /// Splits `addr` at `matched` bytes into its prefix: a new interior node
    /// takes the shared prefix and adopts a shortened replacement of the old
    /// node, plus (unless the key ends at the split point) a new leaf for the
    /// key's remainder. Published by swapping the parent's child pointer.
    fn split(
        &self,
        parent_edges: Edges,
        parent_index: usize,
        addr: usize,
        matched: usize,
        rest: &[u8],
        init: impl FnOnce() -> usize,
    ) -> TrieInsert {
        // The root has an empty prefix and can never split.
        debug_assert!(parent_edges.0 != 0);
        let old = node_ref(addr);
        let old_prefix = node_prefix(addr);
        let key_ends_here = rest.len() == matched;

        let staged = (|| {
            // Shortened copy of the old node; shares prefix bytes, slot, and
            // edge array with the original.
            let replacement = self.arena.alloc_addr(TRIE_NODE_SIZE)?;
            write_trie_node(
                replacement,
                old.prefix_addr + matched + 1,
                (old_prefix.len() - matched - 1) as u32,
                old.slot.load(Ordering::Acquire),
                old.edges.load(Ordering::Acquire),
            );

            let mid_edges = Edges(self.arena.alloc_addr(Edges::size_for(EDGE_INITIAL_CAPACITY))?);
            Edges::init(mid_edges.0, EDGE_INITIAL_CAPACITY);
            mid_edges.stage(0, old_prefix[matched], replacement);

            let mid = self.arena.alloc_addr(TRIE_NODE_SIZE)?;
            write_trie_node(mid, old.prefix_addr, matched as u32, 0, mid_edges.0);

            if key_ends_here {
                mid_edges.publish_count(1);
            } else {
                let leaf_prefix = self.stash_prefix(&rest[matched + 1..])?;
                let leaf = self.arena.alloc_addr(TRIE_NODE_SIZE)?;
                write_trie_node(leaf, leaf_prefix, (rest.len() - matched - 1) as u32, 0, 0);
                mid_edges.stage(1, rest[matched], leaf);
                mid_edges.publish_count(2);
            }
            Some(mid)
        })();
        let Some(mid) = staged else {
            return TrieInsert::Full;
        };

        let cell = init();
        debug_assert!(cell != 0);
        if key_ends_here {
            node_ref(mid).slot.store(cell, Ordering::Release);
        } else {
            let (_, leaf) = Edges(node_ref(mid).edges.load(Ordering::Relaxed))
                .find(rest[matched])
                .expect("staged leaf");
            node_ref(leaf).slot.store(cell, Ordering::Release);
        }

        parent_edges.replace_child(parent_index, mid);
        self.num_words.fetch_add(1, Ordering::Release);
        TrieInsert::Inserted(cell)
    }

    /// Lexicographic cursor over this trie's keys.
    pub(crate) fn cursor(&self) -> TrieCursor<'_> {
        TrieCursor {
            trie: self,
            frames: Vec::new(),
            key_buf: Vec::new(),
            valid: false,
        }
    }
}

/// One step of a cursor's root-to-position path.
struct Frame {
    node: usize,
    /// Sorted snapshot of the node's edges at visit time.
    edges: Vec<(u8, usize)>,
    /// Index into `edges` the path descends through; -1 while positioned at
    /// the node itself.
    pos: isize,
    /// `key_buf` length before this node's label and prefix.
    mark: usize,
}

/// Lexicographic iterator over a trie's keys.
///
/// A cursor is positioned at a key (its node carries a slot) or invalid.
/// Snapshots taken while the trie grows may miss keys added after the
/// relevant node was visited; callers compensate by re-seeking once the trie
/// has grown past a threshold.
pub(crate) struct TrieCursor<'a> {
    trie: &'a Trie,
    frames: Vec<Frame>,
    key_buf: Vec<u8>,
    valid: bool,
}

impl<'a> TrieCursor<'a> {
    /// True if positioned at a key.
    pub(crate) fn valid(&self) -> bool {
        self.valid
    }

    /// The key at the current position.
    pub(crate) fn key(&self) -> &[u8] {
        debug_assert!(self.valid);
        &self.key_buf
    }

    /// The slot of the key at the current position.
    pub(crate) fn slot(&self) -> usize {
        debug_assert!(self.valid);
        let slot = node_slot(self.frames.last().expect("positioned cursor").node);
        debug_assert!(slot != 0);
        slot
    }

    fn reset(&mut self) {
        self.frames.clear();
        self.key_buf.clear();
        self.valid = false;
    }

    fn push_frame(&mut self, label: Option<u8>, node: usize) {
        let mark = self.key_buf.len();
        if let Some(byte) = label {
            self.key_buf.push(byte);
        }
        self.key_buf.extend_from_slice(node_prefix(node));
        self.frames.push(Frame {
            node,
            edges: node_edges(node).snapshot(),
            pos: -1,
            mark,
        });
    }

    fn pop_frame(&mut self) {
        let frame = self.frames.pop().expect("frame to pop");
        self.key_buf.truncate(frame.mark);
    }

    /// Positions at the first key in the subtree of the top frame, the top
    /// node itself included.
    fn descend_first(&mut self) -> bool {
        loop {
            let top = self.frames.last().expect("top frame");
            if node_slot(top.node) != 0 {
                self.valid = true;
                return true;
            }
            if top.edges.is_empty() {
                // Only a bare root is slotless and childless.
                self.valid = false;
                return false;
            }
            let (label, child) = top.edges[0];
            self.frames.last_mut().expect("top frame").pos = 0;
            self.push_frame(Some(label), child);
        }
    }

    /// Positions at the last key in the subtree of the top frame.
    fn descend_last(&mut self) -> bool {
        loop {
            let top = self.frames.last().expect("top frame");
            if top.edges.is_empty() {
                self.valid = node_slot(top.node) != 0;
                return self.valid;
            }
            let index = top.edges.len() - 1;
            let (label, child) = top.edges[index];
            self.frames.last_mut().expect("top frame").pos = index as isize;
            self.push_frame(Some(label), child);
        }
    }

    /// Pops the top frame and positions at the first key of the next sibling
    /// subtree, walking up as siblings run out.
    fn next_subtree(&mut self) -> bool {
        loop {
            self.pop_frame();
            let Some(parent) = self.frames.last_mut() else {
                self.valid = false;
                return false;
            };
            let next = parent.pos + 1;
            if (next as usize) < parent.edges.len() {
                parent.pos = next;
                let (label, child) = parent.edges[next as usize];
                self.push_frame(Some(label), child);
                return self.descend_first();
            }
        }
    }

    /// Positions at the lexicographically first key. False if empty.
    pub(crate) fn seek_begin(&mut self) -> bool {
        self.reset();
        self.push_frame(None, self.trie.root);
        self.descend_first()
    }

    /// Positions at the lexicographically last key. False if empty.
    pub(crate) fn seek_end(&mut self) -> bool {
        self.reset();
        self.push_frame(None, self.trie.root);
        self.descend_last()
    }

    /// Positions at the first key `>= key`. False if none.
    pub(crate) fn seek_lower_bound(&mut self, key: &[u8]) -> bool {
        self.reset();
        self.push_frame(None, self.trie.root);
        let mut pos = 0;
        loop {
            let top_node = self.frames.last().expect("top frame").node;
            let prefix = node_prefix(top_node);
            let rest = &key[pos..];
            let matched = common_prefix_len(prefix, rest);
            if matched == rest.len() {
                // Search key exhausted: every key below sorts >= it.
                return self.descend_first();
            }
            if matched < prefix.len() {
                if rest[matched] < prefix[matched] {
                    return self.descend_first();
                }
                return self.next_subtree();
            }
            pos += matched;
            let byte = key[pos];
            let (index, entry) = {
                let edges = &self.frames.last().expect("top frame").edges;
                let index = edges.partition_point(|&(label, _)| label < byte);
                if index == edges.len() {
                    return self.next_subtree();
                }
                (index, edges[index])
            };
            self.frames.last_mut().expect("top frame").pos = index as isize;
            self.push_frame(Some(entry.0), entry.1);
            if entry.0 != byte {
                return self.descend_first();
            }
            pos += 1;
        }
    }

    /// Positions at the last key `<= key`. False if none.
    pub(crate) fn seek_rev_lower_bound(&mut self, key: &[u8]) -> bool {
        if !self.seek_lower_bound(key) {
            return self.seek_end();
        }
        if self.key_buf.as_slice() > key {
            return self.decr();
        }
        true
    }

    /// Steps to the next key in lexicographic order.
    pub(crate) fn incr(&mut self) -> bool {
        debug_assert!(self.valid);
        let top = self.frames.last_mut().expect("top frame");
        if !top.edges.is_empty() {
            top.pos = 0;
            let (label, child) = top.edges[0];
            self.push_frame(Some(label), child);
            return self.descend_first();
        }
        self.next_subtree()
    }

    /// Steps to the previous key in lexicographic order.
    pub(crate) fn decr(&mut self) -> bool {
        debug_assert!(self.valid);
        loop {
            self.pop_frame();
            let Some(parent) = self.frames.last_mut() else {
                self.valid = false;
                return false;
            };
            let through = parent.pos;
            debug_assert!(through >= 0);
            if through > 0 {
                parent.pos = through - 1;
                let (label, child) = parent.edges[(through - 1) as usize];
                self.push_frame(Some(label), child);
                return self.descend_last();
            }
            // Came up through the first child; the parent's own key, if any,
            // is the immediate predecessor.
            parent.pos = -1;
            if node_slot(parent.node) != 0 {
                self.valid = true;
                return true;
            }
        }
    }
}
