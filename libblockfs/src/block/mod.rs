//! Block model: identities, shapes, and readying.

pub mod pointer;
pub mod ready;
pub mod types;

pub use pointer::{
    BlockContext, BlockId, BlockInfo, BlockPointer, DataVer, FIRST_VALID_DATA_VER, FIRST_VALID_KEY_GEN, KeyGen,
    RefNonce, TlfId, UserId,
};
pub use ready::{BlockReadier, ReadyBlock};
pub use types::{Block, BlockKind, CommonBlock, DirBlock, DirEntry, EntryType, FileBlock, IndirectFilePtr};
