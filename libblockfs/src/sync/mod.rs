//! Dirty-block tracking and the sync engine.
pub mod block_put;
pub mod deferred;
pub mod dirty;
pub mod file_data;
pub mod folder;
pub mod lock;
pub mod md;

pub use block_put::{BlockPutEntry, BlockPutState};
pub use deferred::{DeferredOp, DeferredState};
pub use dirty::{BlockSyncState, DirtyFile, ReadiedBlock};
pub use folder::{BlockReqType, FolderBlockOps, FolderBranch, FolderDeps, FsPath, MASTER_BRANCH};
pub use lock::{LeveledGuard, LeveledMutex, LeveledRwLock, LockLevel, LockState};
pub use md::{BlockChanges, RootMetadata};
