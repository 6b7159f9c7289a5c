//! Decides where file blocks end.

use crate::block::FileBlock;
use crate::error::{BlockError, Result};
use crate::sync::md::BlockChanges;

pub trait BlockSplitter: Send + Sync {
    /// Copy `data` into `block` at local offset `off`. When writing past the
    /// end of the last block, stop at the split point; otherwise copy
    /// everything and let a later split pass fix the boundaries. Returns
    /// the number of bytes copied.
    fn copy_until_split(&self, block: &mut FileBlock, last_block: bool, data: &[u8], off: u64) -> usize;

    /// 0 if the block ends where it should, a positive local offset where
    /// it should be cut, or a negative value if it should take bytes from
    /// its next sibling.
    fn check_split(&self, block: &FileBlock) -> i64;

    /// Bytes a leaf holds once split.
    fn max_size(&self) -> usize;

    fn max_ptrs_per_block(&self) -> usize;

    /// Whether a revision's block changes stay inline in the metadata.
    fn should_embed_changes(&self, changes: &BlockChanges) -> bool;
}

/// Splits at a fixed leaf size.
#[derive(Debug, Clone)]
pub struct BlockSplitterSimple {
    max_size: usize,
    max_ptrs_per_block: usize,
    block_changes_max_size: u64,
}

impl BlockSplitterSimple {
    pub fn new(max_size: usize, max_ptrs_per_block: usize, block_changes_max_size: u64) -> Result<Self> {
        if max_size == 0 {
            return Err(BlockError::InvalidConfig("splitter max_size must be > 0".into()));
        }
        if max_ptrs_per_block < 2 {
            return Err(BlockError::InvalidConfig(format!(
                "splitter max_ptrs_per_block={max_ptrs_per_block} < 2"
            )));
        }
        Ok(Self {
            max_size,
            max_ptrs_per_block,
            block_changes_max_size,
        })
    }
}

impl BlockSplitter for BlockSplitterSimple {
    fn copy_until_split(&self, block: &mut FileBlock, last_block: bool, data: &[u8], off: u64) -> usize {
        let Some((off, end)) = usize::try_from(off)
            .ok()
            .and_then(|off| off.checked_add(data.len()).map(|end| (off, end)))
        else {
            return 0;
        };
        let mut n = data.len();
        let cur_len = block.contents.len();

        if end > cur_len {
            let mut new_len = end;
            if last_block && new_len > self.max_size {
                if off >= self.max_size {
                    return 0;
                }
                new_len = self.max_size;
                n = new_len - off;
            }
            if new_len > cur_len {
                // Zero-fills any gap between the old end and `off`.
                block.contents.resize(new_len, 0);
            }
        }
        block.contents[off..off + n].copy_from_slice(&data[..n]);
        n
    }

    fn check_split(&self, block: &FileBlock) -> i64 {
        let len = block.contents.len();
        if len > self.max_size {
            self.max_size as i64
        } else if len < self.max_size {
            -1
        } else {
            0
        }
    }

    fn max_size(&self) -> usize {
        self.max_size
    }

    fn max_ptrs_per_block(&self) -> usize {
        self.max_ptrs_per_block
    }

    fn should_embed_changes(&self, changes: &BlockChanges) -> bool {
        bincode::serialized_size(changes).unwrap_or(u64::MAX) <= self.block_changes_max_size
    }
}
