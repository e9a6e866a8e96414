//! Ordered iteration over a memtable: user keys in lexicographic order,
//! versions within a key in tag-descending order.
//!
//! One lexicographic cursor per trie. With a single trie the cursor steps
//! directly; with a chain of tries a heap merges the cursors by their
//! current user key (ascending when moving forward, descending when moving
//! backward). Switching direction re-seeks every cursor from the last
//! emitted user key and rebuilds the heap. While the memtable is mutable,
//! every version-tree step happens under the shard lock of the key's slot
//! and a cursor whose trie has grown past a threshold re-seeks before it is
//! stepped; once sealed, neither applies. Both variants are fixed when the
//! iterator is constructed.

use crate::encoding::{length_prefixed_slice, split_internal_key};
use crate::rbtree::{self, root_cell, RootCell, NIL};
use crate::rep::{build_record, PatriciaMemtable};
use crate::trie::{Trie, TrieCursor};

/// A per-trie merge source: the trie, its lexicographic cursor, and the key
/// count observed when the cursor was last positioned.
struct Item<'a> {
    trie: &'a Trie,
    cursor: TrieCursor<'a>,
    num_words: usize,
}

impl<'a> Item<'a> {
    fn new(trie: &'a Trie) -> Self {
        Self {
            trie,
            cursor: trie.cursor(),
            num_words: trie.num_words(),
        }
    }

    fn refresh(&mut self) {
        self.num_words = self.trie.num_words();
    }

    /// True if the trie gained more than `threshold` keys since the cursor
    /// was positioned; resynchronizes the observed count.
    fn needs_refresh(&mut self, threshold: usize) -> bool {
        let now = self.trie.num_words();
        if now - self.num_words > threshold {
            self.num_words = now;
            true
        } else {
            false
        }
    }
}

#[inline]
fn heap_less(items: &[Item<'_>], a: usize, b: usize, forward: bool) -> bool {
    let ka = items[a].cursor.key();
    let kb = items[b].cursor.key();
    if forward {
        ka < kb
    } else {
        ka > kb
    }
}

fn sift_down(order: &mut [usize], items: &[Item<'_>], mut at: usize, forward: bool) {
    loop {
        let left = 2 * at + 1;
        if left >= order.len() {
            break;
        }
        let mut child = left;
        let right = left + 1;
        if right < order.len() && heap_less(items, order[right], order[left], forward) {
            child = right;
        }
        if heap_less(items, order[child], order[at], forward) {
            order.swap(child, at);
            at = child;
        } else {
            break;
        }
    }
}

fn sift_up(order: &mut [usize], items: &[Item<'_>], mut at: usize, forward: bool) {
    while at > 0 {
        let parent = (at - 1) / 2;
        if heap_less(items, order[at], order[parent], forward) {
            order.swap(at, parent);
            at = parent;
        } else {
            break;
        }
    }
}

/// Ordered iterator over a [`PatriciaMemtable`].
///
/// The record returned by [`key`](Self::key) lives in an internal buffer and
/// is invalidated by any repositioning call.
pub struct MemtableIter<'a> {
    rep: &'a PatriciaMemtable,
    items: Vec<Item<'a>>,
    /// Item indices; the first `heap_len` form the live merge heap.
    order: Vec<usize>,
    heap_len: usize,
    multi: bool,
    locked: bool,
    /// 1 forward, -1 backward, 0 before the first seek.
    direction: i8,
    /// Current version node, or `NIL` when invalid.
    current: usize,
    buffer: Vec<u8>,
}

impl<'a> MemtableIter<'a> {
    pub(crate) fn new(rep: &'a PatriciaMemtable) -> Self {
        let count = rep.tries().len();
        let items = (0..count).map(|i| Item::new(rep.tries().get(i))).collect();
        Self {
            rep,
            items,
            order: (0..count).collect(),
            heap_len: 0,
            multi: count > 1,
            locked: !rep.is_read_only(),
            direction: 0,
            current: NIL,
            buffer: Vec::new(),
        }
    }

    /// True if positioned at a record.
    pub fn valid(&self) -> bool {
        self.current != NIL
    }

    /// The current record: `varint32(len) || user_key || tag || value`.
    pub fn key(&self) -> &[u8] {
        debug_assert!(self.valid());
        &self.buffer
    }

    fn with_lock<R>(&self, slot: usize, f: impl FnOnce(&RootCell) -> R) -> R {
        let root = root_cell(slot);
        if self.locked {
            let _guard = self.rep.locks().lock(slot);
            f(root)
        } else {
            f(root)
        }
    }

    fn current_item_index(&self) -> usize {
        if self.multi {
            self.order[0]
        } else {
            0
        }
    }

    fn current_slot(&self) -> usize {
        self.items[self.current_item_index()].cursor.slot()
    }

    fn build_current_record(&mut self) {
        debug_assert!(self.current != NIL);
        let user_key = self.items[self.current_item_index()].cursor.key();
        build_record(&mut self.buffer, user_key, self.current);
    }

    /// The user key of the last built record.
    fn buffered_user_key(&self) -> &[u8] {
        let internal_key = length_prefixed_slice(&self.buffer).expect("buffered record");
        split_internal_key(internal_key).0
    }

    /// Re-seeks every cursor with `seek` and heapifies for `direction`.
    /// Cursors over empty tries or with no match drop out until the next
    /// rebuild.
    fn rebuild(&mut self, direction: i8, mut seek: impl FnMut(&mut Item<'a>) -> bool) {
        self.direction = direction;
        self.heap_len = self.items.len();
        let mut at = 0;
        while at < self.heap_len {
            let item = &mut self.items[self.order[at]];
            item.refresh();
            if item.trie.num_words() > 0 && seek(item) {
                at += 1;
            } else {
                self.heap_len -= 1;
                self.order.swap(at, self.heap_len);
            }
        }
        let forward = direction == 1;
        let heap = &mut self.order[..self.heap_len];
        for at in (0..heap.len() / 2).rev() {
            sift_down(heap, &self.items, at, forward);
        }
    }

    /// If the winning trie outgrew the refresh threshold, re-seeks its
    /// cursor to the current user key before stepping it.
    fn update_current(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let threshold = self.rep.refresh_threshold();
        let index = self.current_item_index();
        let item = &mut self.items[index];
        if item.needs_refresh(threshold) {
            let internal_key = length_prefixed_slice(&self.buffer).expect("buffered record");
            let (user_key, _) = split_internal_key(internal_key);
            item.cursor.seek_lower_bound(user_key);
        }
    }

    /// Advances to the next user key; positions on its newest version.
    fn item_next(&mut self) -> bool {
        if self.multi {
            if self.direction != 1 {
                let pivot = self.buffered_user_key().to_vec();
                self.rebuild(1, |item| item.cursor.seek_lower_bound(&pivot));
                if self.heap_len == 0 {
                    return false;
                }
            } else {
                self.update_current();
            }
            // Pop the winner, step its cursor, re-push while in range.
            let last = self.heap_len - 1;
            self.order[..self.heap_len].swap(0, last);
            sift_down(&mut self.order[..last], &self.items, 0, true);
            let index = self.order[last];
            if self.items[index].cursor.incr() {
                sift_up(&mut self.order[..self.heap_len], &self.items, last, true);
            } else {
                self.heap_len -= 1;
                if self.heap_len == 0 {
                    return false;
                }
            }
        } else {
            self.update_current();
            if !self.items[0].cursor.incr() {
                return false;
            }
        }
        let slot = self.current_slot();
        self.current = self.with_lock(slot, rbtree::leftmost);
        debug_assert!(self.current != NIL);
        true
    }

    /// Retreats to the previous user key; positions on its oldest version.
    fn item_prev(&mut self) -> bool {
        if self.multi {
            if self.direction != -1 {
                let pivot = self.buffered_user_key().to_vec();
                self.rebuild(-1, |item| item.cursor.seek_rev_lower_bound(&pivot));
                if self.heap_len == 0 {
                    return false;
                }
            } else {
                self.update_current();
            }
            let last = self.heap_len - 1;
            self.order[..self.heap_len].swap(0, last);
            sift_down(&mut self.order[..last], &self.items, 0, false);
            let index = self.order[last];
            if self.items[index].cursor.decr() {
                sift_up(&mut self.order[..self.heap_len], &self.items, last, false);
            } else {
                self.heap_len -= 1;
                if self.heap_len == 0 {
                    return false;
                }
            }
        } else {
            self.update_current();
            if !self.items[0].cursor.decr() {
                return false;
            }
        }
        let slot = self.current_slot();
        self.current = self.with_lock(slot, rbtree::rightmost);
        debug_assert!(self.current != NIL);
        true
    }

    /// Advances to the next record. Requires a valid position.
    pub fn next(&mut self) {
        debug_assert!(self.valid());
        let slot = self.current_slot();
        self.current = self.with_lock(slot, |_| rbtree::move_next(self.current));
        if self.current == NIL && !self.item_next() {
            return;
        }
        self.build_current_record();
    }

    /// Retreats to the previous record. Requires a valid position.
    pub fn prev(&mut self) {
        debug_assert!(self.valid());
        let slot = self.current_slot();
        self.current = self.with_lock(slot, |_| rbtree::move_prev(self.current));
        if self.current == NIL && !self.item_prev() {
            return;
        }
        self.build_current_record();
    }

    /// Positions at the first record whose internal key is `>= (user_key,
    /// tag)` in scan order.
    pub fn seek(&mut self, user_key: &[u8], tag: u64) {
        if self.multi {
            self.rebuild(1, |item| item.cursor.seek_lower_bound(user_key));
            if self.heap_len == 0 {
                self.current = NIL;
                return;
            }
        } else {
            let item = &mut self.items[0];
            item.refresh();
            if item.trie.num_words() == 0 || !item.cursor.seek_lower_bound(user_key) {
                self.current = NIL;
                return;
            }
        }
        let slot = self.current_slot();
        self.current = self.with_lock(slot, |root| rbtree::lower_bound(root, tag));
        if self.current == NIL && !self.item_next() {
            return;
        }
        self.build_current_record();
    }

    /// Positions at the last record whose internal key is `<= (user_key,
    /// tag)` in scan order.
    pub fn seek_for_prev(&mut self, user_key: &[u8], tag: u64) {
        if self.multi {
            self.rebuild(-1, |item| item.cursor.seek_rev_lower_bound(user_key));
            if self.heap_len == 0 {
                self.current = NIL;
                return;
            }
        } else {
            let item = &mut self.items[0];
            item.refresh();
            if item.trie.num_words() == 0 || !item.cursor.seek_rev_lower_bound(user_key) {
                self.current = NIL;
                return;
            }
        }
        let slot = self.current_slot();
        self.current = self.with_lock(slot, |root| rbtree::reverse_lower_bound(root, tag));
        if self.current == NIL && !self.item_prev() {
            return;
        }
        self.build_current_record();
    }

    /// Positions at the first record. Valid afterwards iff non-empty.
    pub fn seek_to_first(&mut self) {
        if self.multi {
            self.rebuild(1, |item| item.cursor.seek_begin());
            if self.heap_len == 0 {
                self.current = NIL;
                return;
            }
        } else {
            let item = &mut self.items[0];
            item.refresh();
            if item.trie.num_words() == 0 || !item.cursor.seek_begin() {
                self.current = NIL;
                return;
            }
        }
        let slot = self.current_slot();
        self.current = self.with_lock(slot, rbtree::leftmost);
        debug_assert!(self.current != NIL);
        self.build_current_record();
    }

    /// Positions at the last record. Valid afterwards iff non-empty.
    pub fn seek_to_last(&mut self) {
        if self.multi {
            self.rebuild(-1, |item| item.cursor.seek_end());
            if self.heap_len == 0 {
                self.current = NIL;
                return;
            }
        } else {
            let item = &mut self.items[0];
            item.refresh();
            if item.trie.num_words() == 0 || !item.cursor.seek_end() {
                self.current = NIL;
                return;
            }
        }
        let slot = self.current_slot();
        self.current = self.with_lock(slot, rbtree::rightmost);
        debug_assert!(self.current != NIL);
        self.build_current_record();
    }
}
