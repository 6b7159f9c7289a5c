//! Block shapes. `Block` is a closed variant over directory, file and
//! generic blocks with a shared capability set.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::pointer::{BlockInfo, DataVer, FIRST_VALID_DATA_VER};
use crate::error::{BlockError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockKind {
    Dir,
    File,
    Common,
}

impl fmt::Display for BlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BlockKind::Dir => "directory",
            BlockKind::File => "file",
            BlockKind::Common => "common",
        };
        f.write_str(s)
    }
}

/// Generic view of a block: only the fields every block shape shares.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CommonBlock {
    pub is_ind: bool,
    #[serde(skip)]
    pub encoded_size: u32,
}

impl PartialEq for CommonBlock {
    fn eq(&self, other: &Self) -> bool {
        self.is_ind == other.is_ind
    }
}

/// Pointer from an indirect file block to one of its leaves.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndirectFilePtr {
    pub info: BlockInfo,
    /// Offset of the leaf's first byte within the file.
    pub off: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileBlock {
    pub is_ind: bool,
    pub contents: Vec<u8>,
    /// Offset-ordered; the first entry is always at offset 0.
    pub iptrs: Vec<IndirectFilePtr>,
    #[serde(skip)]
    pub encoded_size: u32,
}

impl FileBlock {
    pub fn direct(contents: Vec<u8>) -> Self {
        Self {
            contents,
            ..Default::default()
        }
    }

    /// Index of the leaf holding byte `off`.
    pub fn leaf_index(&self, off: u64) -> usize {
        match self.iptrs.partition_point(|p| p.off <= off) {
            0 => 0,
            n => n - 1,
        }
    }

    /// Start offset of the leaf after `idx`, if any.
    pub fn next_leaf_off(&self, idx: usize) -> Option<u64> {
        self.iptrs.get(idx + 1).map(|p| p.off)
    }
}

impl PartialEq for FileBlock {
    fn eq(&self, other: &Self) -> bool {
        self.is_ind == other.is_ind && self.contents == other.contents && self.iptrs == other.iptrs
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryType {
    File,
    Dir,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub info: BlockInfo,
    pub kind: EntryType,
    pub size: u64,
    /// Nanoseconds since the epoch, from the folder's clock.
    pub mtime: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DirBlock {
    pub children: BTreeMap<String, DirEntry>,
    #[serde(skip)]
    pub encoded_size: u32,
}

impl PartialEq for DirBlock {
    fn eq(&self, other: &Self) -> bool {
        self.children == other.children
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Block {
    Dir(DirBlock),
    File(FileBlock),
    Common(CommonBlock),
}

impl Block {
    pub fn kind(&self) -> BlockKind {
        match self {
            Block::Dir(_) => BlockKind::Dir,
            Block::File(_) => BlockKind::File,
            Block::Common(_) => BlockKind::Common,
        }
    }

    pub fn is_ind(&self) -> bool {
        match self {
            Block::Dir(_) => false,
            Block::File(b) => b.is_ind,
            Block::Common(b) => b.is_ind,
        }
    }

    pub fn encoded_size(&self) -> u32 {
        match self {
            Block::Dir(b) => b.encoded_size,
            Block::File(b) => b.encoded_size,
            Block::Common(b) => b.encoded_size,
        }
    }

    pub fn set_encoded_size(&mut self, size: u32) {
        match self {
            Block::Dir(b) => b.encoded_size = size,
            Block::File(b) => b.encoded_size = size,
            Block::Common(b) => b.encoded_size = size,
        }
    }

    pub fn data_version(&self) -> DataVer {
        match self {
            Block::File(b) if b.is_ind => b
                .iptrs
                .iter()
                .map(|p| p.info.ptr.data_ver)
                .max()
                .unwrap_or(FIRST_VALID_DATA_VER)
                .max(FIRST_VALID_DATA_VER),
            _ => FIRST_VALID_DATA_VER,
        }
    }

    /// Independent copy. The cached encoded size is not carried over since
    /// the copy is about to diverge from the committed bytes.
    pub fn deep_copy(&self) -> Block {
        let mut copy = self.clone();
        copy.set_encoded_size(0);
        copy
    }

    /// Produce a value of the requested kind from this canonical block.
    /// Any block can be viewed as a `Common` block; otherwise kinds must
    /// match.
    pub fn materialize(&self, kind: BlockKind) -> Result<Block> {
        if kind == self.kind() {
            return Ok(self.clone());
        }
        match kind {
            BlockKind::Common => Ok(Block::Common(CommonBlock {
                is_ind: self.is_ind(),
                encoded_size: self.encoded_size(),
            })),
            _ => Err(BlockError::WrongBlockType {
                expected: kind,
                actual: self.kind(),
            }),
        }
    }

    pub fn as_file(&self) -> Result<&FileBlock> {
        match self {
            Block::File(b) => Ok(b),
            other => Err(BlockError::WrongBlockType {
                expected: BlockKind::File,
                actual: other.kind(),
            }),
        }
    }

    pub fn as_file_mut(&mut self) -> Result<&mut FileBlock> {
        match self {
            Block::File(b) => Ok(b),
            other => Err(BlockError::WrongBlockType {
                expected: BlockKind::File,
                actual: other.kind(),
            }),
        }
    }

    pub fn as_dir(&self) -> Result<&DirBlock> {
        match self {
            Block::Dir(b) => Ok(b),
            other => Err(BlockError::WrongBlockType {
                expected: BlockKind::Dir,
                actual: other.kind(),
            }),
        }
    }
}
