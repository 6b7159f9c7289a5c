//! Error taxonomy shared by the retrieval queue, the disk cache and the
//! sync engine.
//!
//! `BlockError` is `Clone` because a single fetch failure is delivered to
//! every requester attached to the same retrieval.

use thiserror::Error;

use crate::block::{BlockId, BlockKind};

pub type Result<T> = std::result::Result<T, BlockError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BlockError {
    /// Cache miss. Recoverable by fetching from the block server.
    #[error("no such block: {0}")]
    NoSuchBlock(BlockId),

    /// Declared and actual byte counts disagree. Treated as corruption.
    #[error("size mismatch for block {id}: expected {expected} bytes, found {actual}")]
    SizeMismatch {
        id: BlockId,
        expected: u64,
        actual: u64,
    },

    /// Hash or decrypt mismatch; fatal to this block.
    #[error("block {id} failed verification: {reason}")]
    Verification { id: BlockId, reason: String },

    #[error("no key for generation {0}")]
    UnknownKeyGen(u32),

    #[error("expected a {expected} block, got {actual}")]
    WrongBlockType { expected: BlockKind, actual: BlockKind },

    /// Transient block server failure.
    #[error("block server error: {0}")]
    Server(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("disk cache is full: {0}")]
    CacheFull(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("path not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("not a file: {0}")]
    NotAFile(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("file too large: needs {needed} leaf blocks, limit is {limit}")]
    FileTooLarge { needed: usize, limit: usize },

    #[error("retrieval queue is shut down")]
    Shutdown,

    #[error("request canceled")]
    Canceled,
}

impl BlockError {
    /// Whether a sync that failed with this error may be retried as is.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, BlockError::Server(_) | BlockError::Io(_))
    }
}

impl From<std::io::Error> for BlockError {
    fn from(e: std::io::Error) -> Self {
        BlockError::Io(e.to_string())
    }
}

impl From<bincode::Error> for BlockError {
    fn from(e: bincode::Error) -> Self {
        BlockError::Codec(e.to_string())
    }
}

impl From<nix::errno::Errno> for BlockError {
    fn from(e: nix::errno::Errno) -> Self {
        BlockError::Io(e.to_string())
    }
}
