//! Writes made while a file is syncing, kept as explicit commands so they
//! can be replayed against the file's new blocks once the sync lands.

use std::fmt;

use crate::block::BlockInfo;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeferredOp {
    Write { off: u64, data: Vec<u8> },
    Truncate { size: u64 },
}

impl fmt::Display for DeferredOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeferredOp::Write { off, data } => write!(f, "write of {} bytes at {}", data.len(), off),
            DeferredOp::Truncate { size } => write!(f, "truncate to {size}"),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct DeferredState {
    pub ops: Vec<DeferredOp>,
    /// Unrefs recorded during the sync window.
    pub unrefs: Vec<BlockInfo>,
}

impl DeferredState {
    pub fn push(&mut self, op: DeferredOp) {
        self.ops.push(op);
    }
}
