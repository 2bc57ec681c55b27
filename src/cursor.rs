use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::tree::{Tree, TreeInner};

// Where a cursor currently stands: a leaf block and a slot inside it.
// `leaf` is None once the cursor has walked off the rightmost leaf. The
// `invalid` flag records that the slot's record was deleted out from
// under the cursor; the tree rewrites these fields whenever records move.
pub(crate) struct CursorState {
    pub(crate) leaf: Option<u64>,
    pub(crate) pos: usize,
    pub(crate) invalid: bool,
}

/// A forward iterator over one tree's records that stays coherent while
/// the tree is mutated underneath it.
///
/// Deleting the record under a cursor leaves the cursor parked on the
/// vacated slot: [`get`](Cursor::get) reports nothing until the next
/// [`advance`](Cursor::advance), which lands on whatever record follows.
/// A cursor outliving its tree goes quiet instead of dangling.
pub struct Cursor {
    tree: Weak<RefCell<TreeInner>>,
    state: Rc<RefCell<CursorState>>,
}

impl Cursor {
    pub(crate) fn new(tree: Weak<RefCell<TreeInner>>, state: Rc<RefCell<CursorState>>) -> Cursor {
        Cursor { tree, state }
    }

    /// The record under the cursor, unless it was deleted or the cursor
    /// stands past the end.
    pub fn get(&self) -> Option<(u64, u64)> {
        let tree = self.tree.upgrade()?;
        let tree = tree.borrow();
        let state = self.state.borrow();
        tree.cursor_get(&state)
    }

    /// Overwrites the value of the record under the cursor. Returns false
    /// when the cursor has nothing under it.
    pub fn update(&self, value: u64) -> bool {
        match self.tree.upgrade() {
            Some(tree) => {
                let mut tree = tree.borrow_mut();
                let state = self.state.borrow();
                tree.cursor_update(&state, value)
            }
            None => false,
        }
    }

    /// Steps to the next record, following the leaf chain. Returns false
    /// once the cursor has moved past the last record (or its tree is
    /// gone); the cursor stays parked there.
    pub fn advance(&mut self) -> bool {
        match self.tree.upgrade() {
            Some(tree) => {
                let tree = tree.borrow();
                let mut state = self.state.borrow_mut();
                tree.cursor_advance(&mut state)
            }
            None => false,
        }
    }

    /// Another handle on the owning tree, or None once the tree has been
    /// dropped.
    pub fn tree(&self) -> Option<Tree> {
        self.tree.upgrade().map(|inner| Tree { inner })
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        if let Some(tree) = self.tree.upgrade() {
            tree.borrow_mut().unregister(&self.state);
        }
    }
}
