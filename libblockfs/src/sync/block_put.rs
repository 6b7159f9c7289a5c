//! Blocks readied by one sync, waiting to be uploaded and finalized.

use std::collections::HashMap;
use std::sync::Arc;

use crate::block::{Block, BlockInfo, BlockPointer, ReadyBlock};

pub struct BlockPutEntry {
    /// Pointer the block had before readying: temporary or previous.
    pub old_ptr: BlockPointer,
    pub info: BlockInfo,
    pub block: Arc<Block>,
    pub ready: ReadyBlock,
    /// Already stored by an earlier attempt.
    pub landed: bool,
}

#[derive(Default)]
pub struct BlockPutState {
    entries: Vec<BlockPutEntry>,
    /// Final pointer -> the pointer it supersedes.
    old_ptrs: HashMap<BlockPointer, BlockPointer>,
}

impl BlockPutState {
    pub fn add(&mut self, old_ptr: BlockPointer, info: BlockInfo, block: Arc<Block>, ready: ReadyBlock, landed: bool) {
        self.old_ptrs.insert(info.ptr, old_ptr);
        self.entries.push(BlockPutEntry {
            old_ptr,
            info,
            block,
            ready,
            landed,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[BlockPutEntry] {
        &self.entries
    }

    pub fn entries_mut(&mut self) -> &mut [BlockPutEntry] {
        &mut self.entries
    }

    pub fn old_ptr(&self, final_ptr: &BlockPointer) -> Option<BlockPointer> {
        self.old_ptrs.get(final_ptr).copied()
    }

    pub fn infos(&self) -> Vec<BlockInfo> {
        self.entries.iter().map(|e| e.info).collect()
    }
}
