//! Folder head metadata.

use serde::{Deserialize, Serialize};

use crate::block::BlockInfo;

/// Blocks a revision added and dropped.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockChanges {
    pub refs: Vec<BlockInfo>,
    pub unrefs: Vec<BlockInfo>,
}

impl BlockChanges {
    pub fn is_empty(&self) -> bool {
        self.refs.is_empty() && self.unrefs.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RootMetadata {
    pub revision: u64,
    pub root: BlockInfo,
    /// Inline changes of the last revision; empty when they were too big
    /// and went to `changes_ptr` instead.
    pub changes: BlockChanges,
    pub changes_ptr: Option<BlockInfo>,
}

impl RootMetadata {
    pub fn new(root: BlockInfo) -> Self {
        Self {
            revision: 1,
            root,
            changes: BlockChanges {
                refs: vec![root],
                unrefs: Vec::new(),
            },
            changes_ptr: None,
        }
    }
}
