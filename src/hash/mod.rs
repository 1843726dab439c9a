//! Tree hashing used to recompute block root hashes.

pub mod block_root;
pub mod tree;

use thiserror::Error;

pub use block_root::{BlockRootHashDigest, HashCategory};
pub use tree::{combine, TreeHasher};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HashError {
    #[error("hasher already produced its digest")]
    AlreadyDigested,

    #[error("block root hash is missing the {0}")]
    MissingField(&'static str),

    #[error("{field} has {len} bytes, expected 48 or none")]
    InvalidHashLength { field: &'static str, len: usize },
}
