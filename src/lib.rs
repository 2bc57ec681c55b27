mod cursor;
mod error;
mod page_store;

/// This module implements the B+ tree engine itself.
///
/// The tree maps 64-bit unsigned keys to 64-bit opaque values. Every node
/// occupies exactly one 4096-byte page block, index nodes branch up to 256
/// ways, and leaves are chained left to right so a full traversal never
/// touches the index layers. Structural changes (splits, rotations, merges)
/// also patch every open cursor, which is what lets cursors keep iterating
/// while the tree changes underneath them.
///
mod tree;

/// Typed accessors over the raw 512-slot block layout shared by leaf and
/// index nodes.
mod node;

pub use cursor::Cursor;
pub use error::Error;
pub use tree::{Stats, Tree};
