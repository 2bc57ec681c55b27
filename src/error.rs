use thiserror::Error;

/// Failures the tree can report. Absent keys and exhausted cursors are
/// ordinary results (`None`/`false`), not errors.
#[derive(Error, Debug)]
pub enum Error {
    /// The block arena has no free page left for a pending split.
    /// The tree is left untouched.
    #[error("block arena exhausted")]
    OutOfMemory,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
