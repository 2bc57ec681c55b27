use std::cell::RefCell;
use std::rc::{Rc, Weak};

use tracing::{debug, trace};

use crate::cursor::{Cursor, CursorState};
use crate::error::Error;
use crate::node::{HALF, INDEX_MIN, MAX_KEYS, NIL, ORDER};
use crate::page_store::PageStore;

// One level of a recorded descent: the index block visited, its key count
// at visit time, and the child slot taken.
#[derive(Clone, Copy)]
struct PathEntry {
    block: u64,
    keys: usize,
    slot: usize,
}

/// Occupancy counters: live records, blocks owned by the tree, and open
/// cursors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Stats {
    pub records: u64,
    pub blocks: usize,
    pub cursors: usize,
}

pub(crate) struct TreeInner {
    store: PageStore,
    root: u64,
    first_leaf: u64,
    depth: usize,
    records: u64,
    path: Vec<PathEntry>,
    cursors: Vec<Weak<RefCell<CursorState>>>,
}

/// An ordered map from `u64` keys to `u64` values, stored as a B+ tree
/// whose every node fills one 4096-byte page block.
///
/// A tree is single-threaded; open [`Cursor`]s share it and are patched in
/// place whenever the structure changes, so they keep iterating coherently
/// across inserts and deletes.
pub struct Tree {
    pub(crate) inner: Rc<RefCell<TreeInner>>,
}

impl Tree {
    /// Creates an empty tree over the default arena reservation.
    pub fn new() -> Result<Tree, Error> {
        Tree::build(PageStore::new()?)
    }

    /// Creates an empty tree whose arena is capped at `blocks` 4096-byte
    /// blocks. Structural growth past the cap fails with
    /// [`Error::OutOfMemory`], leaving the tree untouched.
    pub fn with_capacity(blocks: usize) -> Result<Tree, Error> {
        Tree::build(PageStore::with_blocks(blocks)?)
    }

    fn build(mut store: PageStore) -> Result<Tree, Error> {
        let root = store.allocate()?;
        store.node_mut(root).init_leaf();
        debug!(root, "created tree");
        Ok(Tree {
            inner: Rc::new(RefCell::new(TreeInner {
                store,
                root,
                first_leaf: root,
                depth: 0,
                records: 0,
                path: Vec::new(),
                cursors: Vec::new(),
            })),
        })
    }

    /// Looks up the value stored under `key`.
    pub fn get(&self, key: u64) -> Option<u64> {
        self.inner.borrow().get(key)
    }

    /// Inserts `(key, value)`, overwriting the value in place if the key
    /// is already present.
    pub fn insert(&mut self, key: u64, value: u64) -> Result<(), Error> {
        self.inner.borrow_mut().insert(key, value)
    }

    /// Removes `key`, returning the value it held.
    pub fn remove(&mut self, key: u64) -> Option<u64> {
        self.inner.borrow_mut().remove(key)
    }

    pub fn len(&self) -> u64 {
        self.inner.borrow().records
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visits every record in ascending key order. The callback must not
    /// touch the tree it is observing.
    pub fn for_each(&self, mut f: impl FnMut(u64, u64)) {
        let inner = self.inner.borrow();
        let mut block = inner.first_leaf;
        loop {
            let node = inner.store.node(block);
            for i in 0..node.count() {
                f(node.key(i), node.value(i));
            }
            match node.next() {
                NIL => break,
                next => block = next,
            }
        }
    }

    /// Opens a cursor on the first record. On an empty tree the cursor
    /// starts past the end and reads nothing until records appear ahead
    /// of it.
    pub fn cursor(&self) -> Cursor {
        let leaf = self.inner.borrow().first_leaf;
        self.register(leaf, 0)
    }

    /// Opens a cursor positioned at the first record whose key is >=
    /// `key`.
    pub fn cursor_at(&self, key: u64) -> Cursor {
        let (leaf, pos) = {
            let inner = self.inner.borrow();
            let leaf = inner.locate_leaf(key);
            (leaf, inner.store.node(leaf).search_leaf(key))
        };
        self.register(leaf, pos)
    }

    fn register(&self, leaf: u64, pos: usize) -> Cursor {
        let state = Rc::new(RefCell::new(CursorState {
            leaf: Some(leaf),
            pos,
            invalid: false,
        }));
        self.inner.borrow_mut().cursors.push(Rc::downgrade(&state));
        Cursor::new(Rc::downgrade(&self.inner), state)
    }

    /// Current occupancy counters.
    pub fn stats(&self) -> Stats {
        let mut inner = self.inner.borrow_mut();
        inner.cursors.retain(|c| c.strong_count() > 0);
        Stats {
            records: inner.records,
            blocks: inner.store.in_use(),
            cursors: inner.cursors.len(),
        }
    }
}

impl TreeInner {
    fn get(&self, key: u64) -> Option<u64> {
        let node = self.store.node(self.locate_leaf(key));
        let i = node.search_leaf(key);
        (i < node.count() && node.key(i) == key).then(|| node.value(i))
    }

    // Read-only descent to the leaf covering `key`.
    fn locate_leaf(&self, key: u64) -> u64 {
        let mut block = self.root;
        for _ in 0..self.depth {
            let node = self.store.node(block);
            block = node.child(node.search_index(key));
        }
        debug_assert!(self.store.node(block).is_leaf());
        block
    }

    // Recording descent: one path entry per index layer.
    fn descend(&mut self, key: u64) -> u64 {
        self.path.clear();
        let mut block = self.root;
        for _ in 0..self.depth {
            let node = self.store.node(block);
            let keys = node.count();
            let slot = node.search_index(key);
            let child = node.child(slot);
            self.path.push(PathEntry { block, keys, slot });
            block = child;
        }
        debug_assert!(self.store.node(block).is_leaf());
        block
    }

    fn insert(&mut self, key: u64, value: u64) -> Result<(), Error> {
        let leaf = self.descend(key);
        let node = self.store.node(leaf);
        let n = node.count();
        let i = node.search_leaf(key);
        if i < n && node.key(i) == key {
            self.store.node_mut(leaf).set_value(i, value);
            return Ok(());
        }
        if n < MAX_KEYS {
            self.store.node_mut(leaf).insert_pair(i, key, value);
            self.records += 1;
            self.shift_cursors_for_insert(leaf, i);
            return Ok(());
        }

        // Full leaf. Claim every block the split cascade can need before
        // touching anything; past this point the mutation cannot fail.
        let mut reserve = self.reserve_split_blocks()?;
        let new_leaf = reserve.pop().unwrap();
        let mut promoted = self.split_leaf(leaf, new_leaf, i, key, value);
        self.records += 1;

        let mut right = new_leaf;
        for level in (0..self.depth).rev() {
            let entry = self.path[level];
            if entry.keys < MAX_KEYS {
                self.store
                    .node_mut(entry.block)
                    .insert_separator(entry.slot, promoted, right);
                debug_assert!(reserve.is_empty());
                return Ok(());
            }
            let new_index = reserve.pop().unwrap();
            promoted = self.split_index(entry.block, new_index, entry.slot, promoted, right);
            right = new_index;
        }

        // The promoted key escaped the top of the path: grow a new root.
        let new_root = reserve.pop().unwrap();
        debug_assert!(reserve.is_empty());
        let mut node = self.store.node_mut(new_root);
        node.init_index();
        node.set_count(1);
        node.set_key(0, promoted);
        node.set_child(0, self.root);
        node.set_child(1, right);
        self.root = new_root;
        self.depth += 1;
        trace!(depth = self.depth, "root split");
        Ok(())
    }

    // Count and claim the blocks a pending leaf split can consume: one per
    // full ancestor on the recorded path, one extra root block when the
    // full run reaches the top (or the root is the splitting leaf), and
    // one for the new leaf. All or nothing.
    fn reserve_split_blocks(&mut self) -> Result<Vec<u64>, Error> {
        let mut need = 1; // the new leaf
        let mut level = self.depth;
        while level > 0 && self.path[level - 1].keys == MAX_KEYS {
            need += 1;
            level -= 1;
        }
        if level == 0 {
            need += 1; // new root
        }
        let mut claimed = Vec::with_capacity(need);
        for _ in 0..need {
            match self.store.allocate() {
                Ok(block) => claimed.push(block),
                Err(e) => {
                    for block in claimed {
                        self.store.release(block);
                    }
                    return Err(e);
                }
            }
        }
        Ok(claimed)
    }

    // Split a full leaf around insertion position `i`, writing the upper
    // half into `new_leaf` and splicing it into the chain. Returns the
    // promoted key: the right leaf's first key.
    fn split_leaf(&mut self, leaf: u64, new_leaf: u64, i: usize, key: u64, value: u64) -> u64 {
        // Stage the combined 256-pair sequence, then deal half to each side.
        let mut keys = [0u64; ORDER];
        let mut values = [0u64; ORDER];
        let old_next;
        {
            let node = self.store.node(leaf);
            debug_assert_eq!(node.count(), MAX_KEYS);
            old_next = node.next();
            for j in 0..i {
                keys[j] = node.key(j);
                values[j] = node.value(j);
            }
            keys[i] = key;
            values[i] = value;
            for j in i..MAX_KEYS {
                keys[j + 1] = node.key(j);
                values[j + 1] = node.value(j);
            }
        }
        {
            let mut left = self.store.node_mut(leaf);
            for j in 0..HALF {
                left.set_key(j, keys[j]);
                left.set_value(j, values[j]);
            }
            left.set_count(HALF);
            left.set_next(new_leaf);
        }
        {
            let mut right = self.store.node_mut(new_leaf);
            right.init_leaf();
            for j in 0..HALF {
                right.set_key(j, keys[HALF + j]);
                right.set_value(j, values[HALF + j]);
            }
            right.set_count(HALF);
            right.set_next(old_next);
        }
        trace!(leaf, new_leaf, "leaf split");
        self.patch_cursors(leaf, |c| {
            if c.pos >= i && !(c.invalid && c.pos == i) {
                c.pos += 1;
            }
            if c.pos >= HALF {
                c.leaf = Some(new_leaf);
                c.pos -= HALF;
            }
        });
        keys[HALF]
    }

    // Split a full index node receiving separator `key` and right child
    // `child` at `pos`. Writes the upper half into `new_index` and returns
    // the key promoted to the layer above.
    fn split_index(&mut self, block: u64, new_index: u64, pos: usize, key: u64, child: u64) -> u64 {
        let mut keys = [0u64; ORDER];
        let mut children = [0u64; ORDER + 1];
        {
            let node = self.store.node(block);
            debug_assert_eq!(node.count(), MAX_KEYS);
            for j in 0..pos {
                keys[j] = node.key(j);
            }
            keys[pos] = key;
            for j in pos..MAX_KEYS {
                keys[j + 1] = node.key(j);
            }
            for j in 0..=pos {
                children[j] = node.child(j);
            }
            children[pos + 1] = child;
            for j in (pos + 1)..=MAX_KEYS {
                children[j + 1] = node.child(j);
            }
        }
        {
            let mut left = self.store.node_mut(block);
            for j in 0..HALF {
                left.set_key(j, keys[j]);
            }
            for j in 0..=HALF {
                left.set_child(j, children[j]);
            }
            left.set_count(HALF);
        }
        {
            let mut right = self.store.node_mut(new_index);
            right.init_index();
            for j in 0..INDEX_MIN {
                right.set_key(j, keys[HALF + 1 + j]);
            }
            for j in 0..=INDEX_MIN {
                right.set_child(j, children[HALF + 1 + j]);
            }
            right.set_count(INDEX_MIN);
        }
        trace!(block, new_index, "index split");
        keys[HALF]
    }

    fn remove(&mut self, key: u64) -> Option<u64> {
        let leaf = self.descend(key);
        let node = self.store.node(leaf);
        let n = node.count();
        let i = node.search_leaf(key);
        if i >= n || node.key(i) != key {
            return None;
        }
        let old = node.value(i);
        self.store.node_mut(leaf).remove_pair(i);
        self.records -= 1;
        self.patch_cursors(leaf, |c| {
            if c.pos == i {
                // The record under the cursor is gone; the cursor stays on
                // the slot and reports nothing until it is advanced.
                c.invalid = true;
            } else if c.pos > i {
                c.pos -= 1;
            }
        });
        if self.depth > 0 && n <= HALF {
            self.refill_leaf(leaf);
        }
        Some(old)
    }

    // Bring an under-full leaf back to half capacity: rotate a pair in
    // from a sibling with spare records, else merge with a sibling and
    // shrink the parent.
    fn refill_leaf(&mut self, leaf: u64) {
        let entry = self.path[self.depth - 1];
        let (parent, pos) = (entry.block, entry.slot);
        if pos < entry.keys {
            let right = self.store.node(parent).child(pos + 1);
            if self.store.node(right).count() > HALF {
                self.rotate_leaf_from_right(leaf, right, parent, pos);
                return;
            }
        }
        if pos > 0 {
            let left = self.store.node(parent).child(pos - 1);
            if self.store.node(left).count() > HALF {
                self.rotate_leaf_from_left(leaf, left, parent, pos);
                return;
            }
            self.merge_leaf_into_left(leaf, left, pos);
        } else {
            let right = self.store.node(parent).child(pos + 1);
            self.merge_right_leaf(leaf, right, pos);
        }
    }

    fn rotate_leaf_from_right(&mut self, leaf: u64, right: u64, parent: u64, pos: usize) {
        let (k, v) = {
            let node = self.store.node(right);
            (node.key(0), node.value(0))
        };
        let end = {
            let mut node = self.store.node_mut(leaf);
            let n = node.count();
            node.set_key(n, k);
            node.set_value(n, v);
            node.set_count(n + 1);
            n
        };
        self.store.node_mut(right).remove_pair(0);
        let new_first = self.store.node(right).key(0);
        self.store.node_mut(parent).set_key(pos, new_first);
        self.patch_cursors(right, |c| {
            if c.pos == 0 {
                c.leaf = Some(leaf);
                c.pos = end;
            } else {
                c.pos -= 1;
            }
        });
    }

    fn rotate_leaf_from_left(&mut self, leaf: u64, left: u64, parent: u64, pos: usize) {
        let (k, v, ln) = {
            let node = self.store.node(left);
            let ln = node.count();
            (node.key(ln - 1), node.value(ln - 1), ln)
        };
        self.store.node_mut(left).set_count(ln - 1);
        self.store.node_mut(leaf).insert_pair(0, k, v);
        self.store.node_mut(parent).set_key(pos - 1, k);
        self.patch_cursors(leaf, |c| c.pos += 1);
        self.patch_cursors(left, |c| {
            if c.pos == ln - 1 {
                c.leaf = Some(leaf);
                c.pos = 0;
            }
        });
    }

    fn merge_leaf_into_left(&mut self, leaf: u64, left: u64, pos: usize) {
        let mut keys = [0u64; HALF];
        let mut values = [0u64; HALF];
        let (n, next) = {
            let node = self.store.node(leaf);
            let n = node.count();
            for j in 0..n {
                keys[j] = node.key(j);
                values[j] = node.value(j);
            }
            (n, node.next())
        };
        let ln = {
            let mut dst = self.store.node_mut(left);
            let ln = dst.count();
            for j in 0..n {
                dst.set_key(ln + j, keys[j]);
                dst.set_value(ln + j, values[j]);
            }
            dst.set_count(ln + n);
            dst.set_next(next);
            ln
        };
        trace!(leaf, left, "leaf merged into left sibling");
        self.patch_cursors(leaf, |c| {
            c.leaf = Some(left);
            c.pos += ln;
        });
        self.store.release(leaf);
        self.shrink_index(self.depth - 1, pos - 1);
    }

    fn merge_right_leaf(&mut self, leaf: u64, right: u64, pos: usize) {
        let mut keys = [0u64; HALF];
        let mut values = [0u64; HALF];
        let (rn, next) = {
            let node = self.store.node(right);
            let rn = node.count();
            for j in 0..rn {
                keys[j] = node.key(j);
                values[j] = node.value(j);
            }
            (rn, node.next())
        };
        let n = {
            let mut dst = self.store.node_mut(leaf);
            let n = dst.count();
            for j in 0..rn {
                dst.set_key(n + j, keys[j]);
                dst.set_value(n + j, values[j]);
            }
            dst.set_count(n + rn);
            dst.set_next(next);
            n
        };
        trace!(right, leaf, "leaf merged into left sibling");
        self.patch_cursors(right, |c| {
            c.leaf = Some(leaf);
            c.pos += n;
        });
        self.store.release(right);
        self.shrink_index(self.depth - 1, pos);
    }

    // Remove the separator at `sep` (with the child on its right) from the
    // index node at `level` of the recorded path, then restore that node's
    // occupancy; merges cascade toward the root.
    fn shrink_index(&mut self, level: usize, sep: usize) {
        let block = self.path[level].block;
        self.store.node_mut(block).remove_separator(sep);
        let n = self.store.node(block).count();
        if level == 0 {
            if n == 0 {
                // A root with a single child left: drop one layer.
                self.root = self.store.node(block).child(0);
                self.store.release(block);
                self.depth -= 1;
                trace!(depth = self.depth, "root collapsed");
                if self.depth == 0 {
                    self.path = Vec::new();
                }
            }
            return;
        }
        if n < INDEX_MIN {
            self.refill_index(level);
        }
    }

    fn refill_index(&mut self, level: usize) {
        let node = self.path[level].block;
        let entry = self.path[level - 1];
        let (parent, pos) = (entry.block, entry.slot);
        if pos < entry.keys {
            let right = self.store.node(parent).child(pos + 1);
            if self.store.node(right).count() > INDEX_MIN {
                self.rotate_index_from_right(node, right, parent, pos);
                return;
            }
        }
        if pos > 0 {
            let left = self.store.node(parent).child(pos - 1);
            if self.store.node(left).count() > INDEX_MIN {
                self.rotate_index_from_left(node, left, parent, pos);
                return;
            }
            self.merge_index_into_left(node, left, parent, pos, level);
        } else {
            let right = self.store.node(parent).child(pos + 1);
            self.merge_right_index(node, right, parent, pos, level);
        }
    }

    // The parent's separator comes down as this node's new last key, the
    // right sibling's first child crosses over, and the sibling's first
    // key cycles up into the parent.
    fn rotate_index_from_right(&mut self, node: u64, right: u64, parent: u64, pos: usize) {
        let sep = self.store.node(parent).key(pos);
        let (up, crossing) = {
            let r = self.store.node(right);
            (r.key(0), r.child(0))
        };
        {
            let mut n = self.store.node_mut(node);
            let count = n.count();
            n.set_key(count, sep);
            n.set_child(count + 1, crossing);
            n.set_count(count + 1);
        }
        self.store.node_mut(right).drop_first_entry();
        self.store.node_mut(parent).set_key(pos, up);
    }

    fn rotate_index_from_left(&mut self, node: u64, left: u64, parent: u64, pos: usize) {
        let sep = self.store.node(parent).key(pos - 1);
        let (up, crossing, ln) = {
            let l = self.store.node(left);
            let ln = l.count();
            (l.key(ln - 1), l.child(ln), ln)
        };
        self.store.node_mut(node).push_front_entry(sep, crossing);
        self.store.node_mut(left).set_count(ln - 1);
        self.store.node_mut(parent).set_key(pos - 1, up);
    }

    // An index merge pulls the parent's separator down as the middle key
    // of the combined node.
    fn merge_index_into_left(&mut self, node: u64, left: u64, parent: u64, pos: usize, level: usize) {
        let sep = self.store.node(parent).key(pos - 1);
        let mut keys = [0u64; INDEX_MIN];
        let mut children = [0u64; INDEX_MIN + 1];
        let n = {
            let src = self.store.node(node);
            let n = src.count();
            for j in 0..n {
                keys[j] = src.key(j);
            }
            for j in 0..=n {
                children[j] = src.child(j);
            }
            n
        };
        {
            let mut dst = self.store.node_mut(left);
            let ln = dst.count();
            dst.set_key(ln, sep);
            for j in 0..n {
                dst.set_key(ln + 1 + j, keys[j]);
            }
            for j in 0..=n {
                dst.set_child(ln + 1 + j, children[j]);
            }
            dst.set_count(ln + 1 + n);
        }
        trace!(node, left, "index node merged into left sibling");
        self.store.release(node);
        self.shrink_index(level - 1, pos - 1);
    }

    fn merge_right_index(&mut self, node: u64, right: u64, parent: u64, pos: usize, level: usize) {
        let sep = self.store.node(parent).key(pos);
        let mut keys = [0u64; INDEX_MIN];
        let mut children = [0u64; INDEX_MIN + 1];
        let rn = {
            let src = self.store.node(right);
            let rn = src.count();
            for j in 0..rn {
                keys[j] = src.key(j);
            }
            for j in 0..=rn {
                children[j] = src.child(j);
            }
            rn
        };
        {
            let mut dst = self.store.node_mut(node);
            let n = dst.count();
            dst.set_key(n, sep);
            for j in 0..rn {
                dst.set_key(n + 1 + j, keys[j]);
            }
            for j in 0..=rn {
                dst.set_child(n + 1 + j, children[j]);
            }
            dst.set_count(n + 1 + rn);
        }
        trace!(right, node, "index node merged into left sibling");
        self.store.release(right);
        self.shrink_index(level - 1, pos);
    }

    // Apply `f` to every live cursor parked on `leaf`, pruning dead weak
    // entries along the way.
    fn patch_cursors(&mut self, leaf: u64, mut f: impl FnMut(&mut CursorState)) {
        self.cursors.retain(|weak| match weak.upgrade() {
            Some(state) => {
                let mut state = state.borrow_mut();
                if state.leaf == Some(leaf) {
                    f(&mut state);
                }
                true
            }
            None => false,
        });
    }

    fn shift_cursors_for_insert(&mut self, leaf: u64, i: usize) {
        self.patch_cursors(leaf, |c| {
            // An invalidated cursor parked exactly on the landing slot
            // stays, so it picks up the new record there; this is what
            // keeps a cursor on a key that is deleted and re-inserted.
            if c.pos >= i && !(c.invalid && c.pos == i) {
                c.pos += 1;
            }
        });
    }

    pub(crate) fn cursor_get(&self, state: &CursorState) -> Option<(u64, u64)> {
        if state.invalid {
            return None;
        }
        let node = self.store.node(state.leaf?);
        (state.pos < node.count()).then(|| (node.key(state.pos), node.value(state.pos)))
    }

    pub(crate) fn cursor_update(&mut self, state: &CursorState, value: u64) -> bool {
        if state.invalid {
            return false;
        }
        let leaf = match state.leaf {
            Some(leaf) => leaf,
            None => return false,
        };
        if state.pos >= self.store.node(leaf).count() {
            return false;
        }
        self.store.node_mut(leaf).set_value(state.pos, value);
        true
    }

    pub(crate) fn cursor_advance(&self, state: &mut CursorState) -> bool {
        if state.invalid {
            // Whatever slid into the vacated slot is the next record.
            state.invalid = false;
        } else if state.leaf.is_some() {
            state.pos += 1;
        }
        let leaf = match state.leaf {
            Some(leaf) => leaf,
            None => return false,
        };
        let node = self.store.node(leaf);
        if state.pos >= node.count() {
            match node.next() {
                NIL => {
                    state.leaf = None;
                    return false;
                }
                next => {
                    state.leaf = Some(next);
                    state.pos = 0;
                }
            }
        }
        true
    }

    pub(crate) fn unregister(&mut self, state: &Rc<RefCell<CursorState>>) {
        self.cursors.retain(|weak| weak.as_ptr() != Rc::as_ptr(state));
    }
}

#[cfg(test)]
impl TreeInner {
    // Walk the whole tree asserting every structural invariant: key order
    // and separator bounds, occupancy limits, leaf chain agreement, and
    // counter accuracy.
    fn check(&self) {
        let mut leaves = Vec::new();
        let mut blocks = 0usize;
        let mut records = 0u64;
        self.check_node(
            self.root,
            self.depth,
            true,
            None,
            None,
            &mut leaves,
            &mut blocks,
            &mut records,
        );
        assert_eq!(records, self.records);
        assert_eq!(blocks, self.store.in_use());

        let mut chain = Vec::new();
        let mut block = self.first_leaf;
        loop {
            chain.push(block);
            match self.store.node(block).next() {
                NIL => break,
                next => block = next,
            }
        }
        assert_eq!(chain, leaves, "leaf chain disagrees with the index");

        let mut last: Option<u64> = None;
        for &leaf in &chain {
            let node = self.store.node(leaf);
            for i in 0..node.count() {
                let k = node.key(i);
                assert!(last.map_or(true, |l| l < k), "chain keys not ascending");
                last = Some(k);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn check_node(
        &self,
        block: u64,
        levels: usize,
        is_root: bool,
        lo: Option<u64>,
        hi: Option<u64>,
        leaves: &mut Vec<u64>,
        blocks: &mut usize,
        records: &mut u64,
    ) {
        *blocks += 1;
        let node = self.store.node(block);
        let n = node.count();
        for i in 0..n {
            let k = node.key(i);
            if i > 0 {
                assert!(node.key(i - 1) < k, "keys not strictly ascending");
            }
            assert!(lo.map_or(true, |b| b <= k), "key below subtree bound");
            assert!(hi.map_or(true, |b| k < b), "key above subtree bound");
        }
        if levels == 0 {
            assert!(node.is_leaf());
            if !is_root {
                assert!(n >= HALF, "leaf under-full: {}", n);
            }
            leaves.push(block);
            *records += n as u64;
        } else {
            assert!(!node.is_leaf());
            if is_root {
                assert!(n >= 1, "index root is empty");
            } else {
                assert!(n >= INDEX_MIN, "index node under-full: {}", n);
            }
            for i in 0..=n {
                let lo = if i == 0 { lo } else { Some(node.key(i - 1)) };
                let hi = if i == n { hi } else { Some(node.key(i)) };
                self.check_node(node.child(i), levels - 1, false, lo, hi, leaves, blocks, records);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;
    use std::collections::BTreeMap;

    fn check(tree: &Tree) {
        tree.inner.borrow().check();
    }

    fn depth(tree: &Tree) -> usize {
        tree.inner.borrow().depth
    }

    #[test]
    fn grows_and_shrinks_through_every_layer() {
        // 80k records exceed what one 256-way root of full leaves can
        // cover, so the tree must reach two index layers.
        let mut keys: Vec<u64> = (0..80_000).collect();
        let mut rng = StdRng::seed_from_u64(0x1db7);
        keys.shuffle(&mut rng);

        let mut tree = Tree::new().unwrap();
        for (step, &k) in keys.iter().enumerate() {
            tree.insert(k, k.wrapping_mul(31)).unwrap();
            if step % 7919 == 0 {
                check(&tree);
            }
        }
        check(&tree);
        assert!(depth(&tree) >= 2);
        assert_eq!(tree.len(), 80_000);

        keys.shuffle(&mut rng);
        for (step, &k) in keys.iter().enumerate() {
            assert_eq!(tree.remove(k), Some(k.wrapping_mul(31)));
            if step % 7919 == 0 {
                check(&tree);
            }
        }
        check(&tree);
        assert_eq!(tree.len(), 0);
        assert_eq!(depth(&tree), 0);
        assert_eq!(tree.stats().blocks, 1);
    }

    #[test]
    fn random_mix_against_model() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut tree = Tree::new().unwrap();
        let mut model = BTreeMap::new();
        for step in 0..40_000 {
            let k = rng.gen_range(0..2_000u64);
            if rng.gen_bool(0.6) {
                let v = rng.gen::<u64>();
                tree.insert(k, v).unwrap();
                model.insert(k, v);
            } else {
                assert_eq!(tree.remove(k), model.remove(&k));
            }
            if step % 4999 == 0 {
                check(&tree);
            }
        }
        check(&tree);
        assert_eq!(tree.len(), model.len() as u64);
        let mut walked = Vec::new();
        tree.for_each(|k, v| walked.push((k, v)));
        assert_eq!(walked, model.into_iter().collect::<Vec<_>>());
    }

    #[test]
    fn exhausted_arena_fails_cleanly() {
        // Room for the root leaf plus one split (new leaf + new root).
        let mut tree = Tree::with_capacity(3).unwrap();
        for k in 0..400 {
            match tree.insert(k, k) {
                Ok(()) => {}
                Err(Error::OutOfMemory) => {
                    // The failed insert must not have changed anything.
                    check(&tree);
                    assert_eq!(tree.get(k), None);
                    let records = tree.len();
                    assert!(matches!(tree.insert(k, k), Err(Error::OutOfMemory)));
                    assert_eq!(tree.len(), records);
                    return;
                }
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        panic!("a 3-block arena cannot hold 400 records");
    }

    #[test]
    fn freed_blocks_are_recycled() {
        let mut tree = Tree::with_capacity(8).unwrap();
        // Repeatedly grow past one split and shrink back; the arena never
        // needs more than one tree's worth of blocks.
        for round in 0..10u64 {
            for k in 0..300 {
                tree.insert(k, round).unwrap();
            }
            check(&tree);
            for k in 0..300 {
                tree.remove(k).unwrap();
            }
            check(&tree);
            assert_eq!(tree.stats().blocks, 1);
        }
    }

    #[test]
    fn path_buffer_is_dropped_at_depth_zero() {
        let mut tree = Tree::new().unwrap();
        for k in 0..300 {
            tree.insert(k, k).unwrap();
        }
        assert_eq!(depth(&tree), 1);
        assert!(tree.inner.borrow().path.capacity() > 0);
        for k in 0..300 {
            tree.remove(k).unwrap();
        }
        assert_eq!(depth(&tree), 0);
        assert_eq!(tree.inner.borrow().path.capacity(), 0);
    }
}
