//! Per-file dirty tracking.

use std::collections::HashMap;
use std::sync::Arc;

use super::deferred::DeferredState;
use crate::block::{Block, BlockInfo, BlockPointer, DirEntry, ReadyBlock};

/// Sync state of one block of a file.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum BlockSyncState {
    #[default]
    Clean,
    Dirty,
    /// Being uploaded and not modified since the upload snapshot.
    SyncingNotDirty,
    /// Being uploaded and modified again since.
    SyncingAndDirty,
    SyncedNotDirty,
    SyncedAndDirty,
}

impl BlockSyncState {
    /// Whether a writer must deep-copy the block before touching it.
    pub fn needs_copy(self) -> bool {
        self == BlockSyncState::SyncingNotDirty
    }

    pub fn is_dirty(self) -> bool {
        !matches!(self, BlockSyncState::Clean | BlockSyncState::SyncedNotDirty)
    }

    pub fn on_write(self) -> Self {
        use BlockSyncState::*;
        match self {
            Clean | Dirty | SyncedNotDirty => Dirty,
            SyncingNotDirty | SyncingAndDirty => SyncingAndDirty,
            SyncedAndDirty => SyncedAndDirty,
        }
    }

    pub fn on_sync_start(self) -> Self {
        match self {
            BlockSyncState::Dirty => BlockSyncState::SyncingNotDirty,
            other => other,
        }
    }

    pub fn on_sync_complete(self) -> Self {
        match self {
            BlockSyncState::SyncingNotDirty => BlockSyncState::SyncedNotDirty,
            BlockSyncState::SyncingAndDirty => BlockSyncState::SyncedAndDirty,
            other => other,
        }
    }

    pub fn on_sync_error(self) -> Self {
        match self {
            BlockSyncState::SyncingNotDirty | BlockSyncState::SyncingAndDirty => BlockSyncState::Dirty,
            other => other,
        }
    }
}

/// A block readied by a sync, kept after a failed attempt so a retry can
/// reuse its final identity (and skip the upload if it landed) as long as
/// `snapshot` is still the live block.
#[derive(Clone)]
pub struct ReadiedBlock {
    pub snapshot: Arc<Block>,
    pub info: BlockInfo,
    pub ready: ReadyBlock,
    pub landed: bool,
}

pub struct DirtyFile {
    /// Directory entry as the pending writes left it.
    pub entry: DirEntry,
    states: HashMap<BlockPointer, BlockSyncState>,
    /// Committed blocks this file no longer references.
    pub unrefs: Vec<BlockInfo>,
    /// Set while a sync of this file is in flight.
    pub deferred: Option<DeferredState>,
    pub readied: HashMap<BlockPointer, ReadiedBlock>,
}

impl DirtyFile {
    pub fn new(entry: DirEntry) -> Self {
        Self {
            entry,
            states: HashMap::new(),
            unrefs: Vec::new(),
            deferred: None,
            readied: HashMap::new(),
        }
    }

    pub fn state(&self, ptr: &BlockPointer) -> BlockSyncState {
        self.states.get(ptr).copied().unwrap_or_default()
    }

    pub fn set_state(&mut self, ptr: BlockPointer, state: BlockSyncState) {
        if state == BlockSyncState::Clean {
            self.states.remove(&ptr);
        } else {
            self.states.insert(ptr, state);
        }
    }

    pub fn forget(&mut self, ptr: &BlockPointer) {
        self.states.remove(ptr);
        self.readied.remove(ptr);
    }

    pub fn pointers(&self) -> impl Iterator<Item = &BlockPointer> {
        self.states.keys()
    }

    /// Nothing dirty, nothing to unref and no sync in flight.
    pub fn is_clean(&self) -> bool {
        self.states.is_empty() && self.unrefs.is_empty() && self.deferred.is_none()
    }

    pub fn is_syncing(&self) -> bool {
        self.deferred.is_some()
    }

    /// Record a superseded committed block. While a sync is in flight the
    /// unref goes with the deferred ops, which regenerate it on replay.
    pub fn add_unref(&mut self, info: BlockInfo) {
        match self.deferred.as_mut() {
            Some(deferred) => deferred.unrefs.push(info),
            None => self.unrefs.push(info),
        }
    }

    pub fn sync_started(&mut self) {
        for state in self.states.values_mut() {
            *state = state.on_sync_start();
        }
        self.deferred = Some(DeferredState::default());
    }

    pub fn sync_completed(&mut self) {
        for state in self.states.values_mut() {
            *state = state.on_sync_complete();
        }
    }

    /// Put every block back to `Dirty` and fold the deferred unrefs back
    /// in. The deferred ops are already reflected in the dirty blocks.
    pub fn sync_failed(&mut self) {
        for state in self.states.values_mut() {
            *state = state.on_sync_error();
        }
        if let Some(deferred) = self.deferred.take() {
            self.unrefs.extend(deferred.unrefs);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use BlockSyncState::*;

    #[test]
    fn test_state_table() {
        // (state, on_write, on_sync_start, on_sync_complete, on_sync_error)
        let table = [
            (Clean, Dirty, Clean, Clean, Clean),
            (Dirty, Dirty, SyncingNotDirty, Dirty, Dirty),
            (SyncingNotDirty, SyncingAndDirty, SyncingNotDirty, SyncedNotDirty, Dirty),
            (SyncingAndDirty, SyncingAndDirty, SyncingAndDirty, SyncedAndDirty, Dirty),
            (SyncedNotDirty, Dirty, SyncedNotDirty, SyncedNotDirty, SyncedNotDirty),
            (SyncedAndDirty, SyncedAndDirty, SyncedAndDirty, SyncedAndDirty, SyncedAndDirty),
        ];
        for (state, write, start, complete, error) in table {
            assert_eq!(state.on_write(), write, "{state:?} on write");
            assert_eq!(state.on_sync_start(), start, "{state:?} on sync start");
            assert_eq!(state.on_sync_complete(), complete, "{state:?} on sync complete");
            assert_eq!(state.on_sync_error(), error, "{state:?} on sync error");
            assert_eq!(state.needs_copy(), state == SyncingNotDirty);
        }
    }

    #[test]
    fn test_sync_failed_restores_dirty_and_unrefs() {
        use crate::block::{EntryType, UserId};

        let ptr = BlockPointer::temporary(1, UserId::default());
        let entry = DirEntry {
            info: BlockInfo::unfinalized(ptr),
            kind: EntryType::File,
            size: 0,
            mtime: 0,
        };
        let mut df = DirtyFile::new(entry);
        df.set_state(ptr, Dirty);
        df.sync_started();
        assert_eq!(df.state(&ptr), SyncingNotDirty);

        let old = BlockInfo {
            ptr: BlockPointer::temporary(1, UserId::default()),
            encoded_size: 10,
        };
        df.add_unref(old);
        assert!(df.unrefs.is_empty());

        df.set_state(ptr, df.state(&ptr).on_write());
        df.sync_failed();
        assert_eq!(df.state(&ptr), Dirty);
        assert_eq!(df.unrefs, vec![old]);
        assert!(!df.is_syncing());
    }
}
