//! Block operations for one folder branch.
//!
//! Three leveled locks guard a folder:
//! - `md_writer` serializes everything that advances the revision
//! - `head` guards the folder's `RootMetadata`
//! - `blocks` guards the in-memory block state (dirty blocks, dirty files)
//!
//! Reads take `blocks` shared and drop it to fetch a missing block, then
//! retry. Writes and syncs take it exclusively and fetch while holding it.
//!
//! A sync readies a snapshot of a file's dirty blocks under `blocks`,
//! uploads without it, then finalizes under `head` and `blocks`. Writes
//! that land during the upload copy-on-write the blocks being uploaded
//! and are queued as deferred ops, which are replayed against the new
//! blocks once the sync finalizes.

use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::block_put::BlockPutState;
use super::deferred::{DeferredOp, DeferredState};
use super::dirty::{BlockSyncState, DirtyFile, ReadiedBlock};
use super::file_data::{self, FileBlockAccess};
use super::lock::{LeveledMutex, LeveledRwLock, LockLevel, LockState};
use super::md::{BlockChanges, RootMetadata};
use crate::block::{
    Block, BlockInfo, BlockKind, BlockPointer, BlockReadier, DirBlock, DirEntry, EntryType, FileBlock, ReadyBlock,
    TlfId, UserId,
};
use crate::cadapter::BlockServer;
use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::crypto::KeyMetadata;
use crate::error::{BlockError, Result};
use crate::retrieval::{BlockRetrievalQueue, ON_DEMAND_PRIORITY};
use crate::splitter::BlockSplitter;

pub const MASTER_BRANCH: &str = "master";

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FolderBranch {
    pub tlf: TlfId,
    pub branch: String,
}

impl FolderBranch {
    pub fn master(tlf: TlfId) -> Self {
        Self {
            tlf,
            branch: MASTER_BRANCH.to_string(),
        }
    }
}

/// A path inside a folder branch. The root has no names.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FsPath {
    pub folder: FolderBranch,
    pub names: Vec<String>,
}

impl FsPath {
    pub fn root(folder: FolderBranch) -> Self {
        Self {
            folder,
            names: Vec::new(),
        }
    }

    /// Parse a `/`-separated path. Empty components are skipped; `.` and
    /// `..` are rejected.
    pub fn parse(folder: FolderBranch, path: &str) -> Result<Self> {
        let mut names = Vec::new();
        for name in path.split('/').filter(|n| !n.is_empty()) {
            if name == "." || name == ".." {
                return Err(BlockError::InvalidPath(path.to_string()));
            }
            names.push(name.to_string());
        }
        Ok(Self { folder, names })
    }

    pub fn child(&self, name: &str) -> Self {
        let mut names = self.names.clone();
        names.push(name.to_string());
        Self {
            folder: self.folder.clone(),
            names,
        }
    }

    pub fn is_root(&self) -> bool {
        self.names.is_empty()
    }

    pub fn name(&self) -> Option<&str> {
        self.names.last().map(String::as_str)
    }

    pub fn parent_names(&self) -> &[String] {
        match self.names.len() {
            0 => &[],
            n => &self.names[..n - 1],
        }
    }

    fn key(&self) -> String {
        self.names.join("/")
    }
}

impl fmt::Display for FsPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.names.join("/"))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockReqType {
    Read,
    /// Dirty the block and return the writable version.
    Write,
}

/// Collaborators shared by a folder's operations.
#[derive(Clone)]
pub struct FolderDeps {
    pub user: UserId,
    pub kmd: Arc<dyn KeyMetadata>,
    pub server: Arc<dyn BlockServer>,
    pub retrieval: Arc<BlockRetrievalQueue>,
    pub readier: BlockReadier,
    pub splitter: Arc<dyn BlockSplitter>,
    pub clock: Arc<dyn Clock>,
    pub config: SyncConfig,
}

struct BlockState {
    root: BlockInfo,
    dirty_blocks: HashMap<BlockPointer, Arc<Block>>,
    /// Keyed by path within the folder.
    files: HashMap<String, DirtyFile>,
}

/// Blocks fetched by the current operation; they stay usable even if the
/// clean cache drops them before the operation retries.
type Fetched = HashMap<BlockPointer, Arc<Block>>;

enum Lookup<T> {
    Found(T),
    Missing(BlockPointer, BlockKind),
}

macro_rules! found {
    ($e:expr) => {
        match $e {
            Lookup::Found(v) => v,
            Lookup::Missing(ptr, kind) => return Ok(Lookup::Missing(ptr, kind)),
        }
    };
}

/// Directory blocks from the root down: `chain[0]` is the root.
type DirChain = Vec<(BlockInfo, Arc<Block>)>;

struct SyncPlan {
    puts: BlockPutState,
    changes: BlockChanges,
    changes_ptr: Option<BlockInfo>,
    new_root: BlockInfo,
}

pub struct FolderBlockOps {
    folder: FolderBranch,
    deps: FolderDeps,
    md_writer: LeveledMutex<()>,
    head: LeveledRwLock<RootMetadata>,
    blocks: LeveledRwLock<BlockState>,
}

impl FolderBlockOps {
    /// Start a new, empty folder: upload an empty root directory.
    pub async fn create(folder: FolderBranch, deps: FolderDeps) -> Result<Self> {
        let root = Block::Dir(DirBlock::default());
        let (info, ready) = deps.readier.ready(deps.kmd.as_ref(), deps.user, &root)?;
        deps.server
            .put(folder.tlf, info.ptr.id, &info.ptr.context, &ready)
            .await?;
        let ops = Self::open(folder, deps, RootMetadata::new(info))?;
        ops.cache_clean(info, &root).await;
        Ok(ops)
    }

    /// Operate on an existing folder whose head is `head`.
    pub fn open(folder: FolderBranch, deps: FolderDeps, head: RootMetadata) -> Result<Self> {
        if deps.kmd.tlf_id() != folder.tlf {
            return Err(BlockError::InvalidConfig(format!(
                "key metadata is for {}, folder is {}",
                deps.kmd.tlf_id(),
                folder.tlf
            )));
        }
        let root = head.root;
        Ok(Self {
            folder,
            deps,
            md_writer: LeveledMutex::new(LockLevel::MdWriter, ()),
            head: LeveledRwLock::new(LockLevel::Head, head),
            blocks: LeveledRwLock::new(
                LockLevel::Block,
                BlockState {
                    root,
                    dirty_blocks: HashMap::new(),
                    files: HashMap::new(),
                },
            ),
        })
    }

    pub fn folder(&self) -> &FolderBranch {
        &self.folder
    }

    pub fn path(&self, path: &str) -> Result<FsPath> {
        FsPath::parse(self.folder.clone(), path)
    }

    fn check_folder(&self, path: &FsPath) -> Result<()> {
        if path.folder != self.folder {
            return Err(BlockError::InvalidPath(format!(
                "{path} belongs to {}/{}, not {}/{}",
                path.folder.tlf, path.folder.branch, self.folder.tlf, self.folder.branch
            )));
        }
        Ok(())
    }

    pub async fn head(&self) -> RootMetadata {
        let ls = LockState::new();
        self.head.read(&ls).await.clone()
    }

    async fn cache_clean(&self, info: BlockInfo, block: &Block) {
        let mut block = block.clone();
        block.set_encoded_size(info.encoded_size);
        self.deps
            .retrieval
            .clean_cache()
            .put(info.ptr.id, Arc::new(block))
            .await;
    }

    async fn local_block(&self, bs: &BlockState, fetched: &Fetched, ptr: &BlockPointer) -> Option<Arc<Block>> {
        if let Some(block) = bs.dirty_blocks.get(ptr) {
            return Some(block.clone());
        }
        if let Some(block) = fetched.get(ptr) {
            return Some(block.clone());
        }
        self.deps.retrieval.clean_cache().get(&ptr.id).await
    }

    async fn lookup_block(
        &self,
        bs: &BlockState,
        fetched: &Fetched,
        ptr: &BlockPointer,
        kind: BlockKind,
    ) -> Lookup<Arc<Block>> {
        match self.local_block(bs, fetched, ptr).await {
            Some(block) => Lookup::Found(block),
            None => Lookup::Missing(*ptr, kind),
        }
    }

    async fn fetch_block(&self, ptr: BlockPointer, kind: BlockKind) -> Result<Arc<Block>> {
        tracing::debug!("fetching {} block {}", kind, ptr);
        let block = self
            .deps
            .retrieval
            .get_block(&CancellationToken::new(), ON_DEMAND_PRIORITY, self.deps.kmd.clone(), ptr, kind)
            .await?;
        Ok(Arc::new(block))
    }

    async fn dir_chain(&self, bs: &BlockState, fetched: &Fetched, names: &[String]) -> Result<Lookup<DirChain>> {
        let mut chain = Vec::with_capacity(names.len() + 1);
        let root = found!(self.lookup_block(bs, fetched, &bs.root.ptr, BlockKind::Dir).await);
        chain.push((bs.root, root));
        for (i, name) in names.iter().enumerate() {
            let entry = {
                let dir = chain[i].1.as_dir()?;
                *dir
                    .children
                    .get(name)
                    .ok_or_else(|| BlockError::NotFound(names[..=i].join("/")))?
            };
            if entry.kind != EntryType::Dir {
                return Err(BlockError::NotADirectory(names[..=i].join("/")));
            }
            let block = found!(self.lookup_block(bs, fetched, &entry.info.ptr, BlockKind::Dir).await);
            chain.push((entry.info, block));
        }
        Ok(Lookup::Found(chain))
    }

    /// The entry of a file or directory, with pending file changes applied.
    async fn entry(&self, bs: &BlockState, fetched: &Fetched, path: &FsPath) -> Result<Lookup<DirEntry>> {
        if let Some(df) = bs.files.get(&path.key()) {
            return Ok(Lookup::Found(df.entry));
        }
        let Some(name) = path.name() else {
            return Ok(Lookup::Found(DirEntry {
                info: bs.root,
                kind: EntryType::Dir,
                size: 0,
                mtime: 0,
            }));
        };
        let chain = found!(self.dir_chain(bs, fetched, path.parent_names()).await?);
        let parent = chain[chain.len() - 1].1.as_dir()?;
        let entry = parent
            .children
            .get(name)
            .ok_or_else(|| BlockError::NotFound(path.to_string()))?;
        Ok(Lookup::Found(*entry))
    }

    async fn file_entry(&self, bs: &BlockState, fetched: &Fetched, path: &FsPath) -> Result<Lookup<DirEntry>> {
        let entry = found!(self.entry(bs, fetched, path).await?);
        if entry.kind != EntryType::File {
            return Err(BlockError::NotAFile(path.to_string()));
        }
        Ok(Lookup::Found(entry))
    }

    /// Resolve a file entry while holding `blocks` exclusively.
    async fn file_entry_locked(&self, bs: &BlockState, fetched: &mut Fetched, path: &FsPath) -> Result<DirEntry> {
        loop {
            match self.file_entry(bs, fetched, path).await? {
                Lookup::Found(entry) => return Ok(entry),
                Lookup::Missing(ptr, kind) => {
                    let block = self.fetch_block(ptr, kind).await?;
                    fetched.insert(ptr, block);
                }
            }
        }
    }

    async fn dir_chain_locked(&self, bs: &BlockState, fetched: &mut Fetched, names: &[String]) -> Result<DirChain> {
        loop {
            match self.dir_chain(bs, fetched, names).await? {
                Lookup::Found(chain) => return Ok(chain),
                Lookup::Missing(ptr, kind) => {
                    let block = self.fetch_block(ptr, kind).await?;
                    fetched.insert(ptr, block);
                }
            }
        }
    }

    // ---- reads ----

    pub async fn read(&self, path: &FsPath, off: u64, len: usize) -> Result<Vec<u8>> {
        self.check_folder(path)?;
        let mut fetched = Fetched::new();
        loop {
            let (ptr, kind) = {
                let ls = LockState::new();
                let bs = self.blocks.read(&ls).await;
                match self.read_locked(&bs, &fetched, path, off, len).await? {
                    Lookup::Found(data) => return Ok(data),
                    Lookup::Missing(ptr, kind) => (ptr, kind),
                }
            };
            let block = self.fetch_block(ptr, kind).await?;
            fetched.insert(ptr, block);
        }
    }

    async fn read_locked(
        &self,
        bs: &BlockState,
        fetched: &Fetched,
        path: &FsPath,
        off: u64,
        len: usize,
    ) -> Result<Lookup<Vec<u8>>> {
        let entry = found!(self.file_entry(bs, fetched, path).await?);
        if off >= entry.size || len == 0 {
            return Ok(Lookup::Found(Vec::new()));
        }
        let end = entry.size.min(off.saturating_add(len as u64));
        let mut out = vec![0u8; (end - off) as usize];

        let top = found!(self.lookup_block(bs, fetched, &entry.info.ptr, BlockKind::File).await);
        let top = top.as_file()?;
        if !top.is_ind {
            file_data::copy_range(&top.contents, 0, off, end, &mut out);
            return Ok(Lookup::Found(out));
        }
        for iptr in file_data::leaves_in_range(top, off, end) {
            let leaf = found!(self.lookup_block(bs, fetched, &iptr.info.ptr, BlockKind::File).await);
            file_data::copy_range(&leaf.as_file()?.contents, iptr.off, off, end, &mut out);
        }
        Ok(Lookup::Found(out))
    }

    pub async fn stat(&self, path: &FsPath) -> Result<DirEntry> {
        self.check_folder(path)?;
        let mut fetched = Fetched::new();
        loop {
            let (ptr, kind) = {
                let ls = LockState::new();
                let bs = self.blocks.read(&ls).await;
                match self.entry(&bs, &fetched, path).await? {
                    Lookup::Found(entry) => return Ok(entry),
                    Lookup::Missing(ptr, kind) => (ptr, kind),
                }
            };
            let block = self.fetch_block(ptr, kind).await?;
            fetched.insert(ptr, block);
        }
    }

    /// Children of a directory, with pending file changes applied.
    pub async fn read_dir(&self, path: &FsPath) -> Result<BTreeMap<String, DirEntry>> {
        self.check_folder(path)?;
        let mut fetched = Fetched::new();
        loop {
            let (ptr, kind) = {
                let ls = LockState::new();
                let bs = self.blocks.read(&ls).await;
                match self.dir_chain(&bs, &fetched, &path.names).await? {
                    Lookup::Found(chain) => {
                        let mut children = chain[chain.len() - 1].1.as_dir()?.children.clone();
                        for (name, entry) in children.iter_mut() {
                            if let Some(df) = bs.files.get(&path.child(name).key()) {
                                *entry = df.entry;
                            }
                        }
                        return Ok(children);
                    }
                    Lookup::Missing(ptr, kind) => (ptr, kind),
                }
            };
            let block = self.fetch_block(ptr, kind).await?;
            fetched.insert(ptr, block);
        }
    }

    /// Get one of a file's blocks. A write request dirties the block,
    /// copying it first if an in-flight sync still uploads it, and
    /// returns the writable version as of this call.
    pub async fn get_block(&self, path: &FsPath, ptr: BlockPointer, req: BlockReqType) -> Result<Arc<Block>> {
        self.check_folder(path)?;
        if req == BlockReqType::Read {
            let mut fetched = Fetched::new();
            loop {
                {
                    let ls = LockState::new();
                    let bs = self.blocks.read(&ls).await;
                    if let Some(block) = self.local_block(&bs, &fetched, &ptr).await {
                        return Ok(block);
                    }
                }
                let block = self.fetch_block(ptr, BlockKind::File).await?;
                fetched.insert(ptr, block);
            }
        }

        let ls = LockState::new();
        let mut guard = self.blocks.write(&ls).await;
        let bs = &mut *guard;
        let key = path.key();
        let mut fetched = Fetched::new();
        let entry = self.file_entry_locked(bs, &mut fetched, path).await?;
        let fresh = !bs.files.contains_key(&key);
        bs.files.entry(key.clone()).or_insert_with(|| DirtyFile::new(entry));

        let mut acc = FileAccess::new(self, bs, &key, fetched);
        let res = acc.dirty_block(ptr).await;
        if res.is_err() && fresh {
            acc.discard_if_clean();
        }
        res?;
        bs.dirty_blocks
            .get(&ptr)
            .cloned()
            .ok_or(BlockError::NoSuchBlock(ptr.id))
    }

    // ---- writes ----

    pub async fn write(&self, path: &FsPath, off: u64, data: &[u8]) -> Result<()> {
        self.check_folder(path)?;
        if data.is_empty() {
            return Ok(());
        }
        let ls = LockState::new();
        let mut guard = self.blocks.write(&ls).await;
        let op = DeferredOp::Write {
            off,
            data: data.to_vec(),
        };
        self.apply_op(&mut guard, path, &op, true).await
    }

    pub async fn truncate(&self, path: &FsPath, size: u64) -> Result<()> {
        self.check_folder(path)?;
        let ls = LockState::new();
        let mut guard = self.blocks.write(&ls).await;
        self.apply_op(&mut guard, path, &DeferredOp::Truncate { size }, true).await
    }

    /// Apply a write or truncate under the exclusive block lock. A failed
    /// op leaves the file as it was. With `record`, an op that succeeded is
    /// also queued for replay if a sync is in flight.
    async fn apply_op(&self, bs: &mut BlockState, path: &FsPath, op: &DeferredOp, record: bool) -> Result<()> {
        let key = path.key();
        let mut fetched = Fetched::new();
        let entry = self.file_entry_locked(bs, &mut fetched, path).await?;
        let fresh = !bs.files.contains_key(&key);
        let curr_size = bs
            .files
            .entry(key.clone())
            .or_insert_with(|| DirtyFile::new(entry))
            .entry
            .size;

        let mut acc = FileAccess::new(self, bs, &key, fetched);
        let splitter = self.deps.splitter.as_ref();
        let res = match op {
            DeferredOp::Write { off, data } => file_data::write(&mut acc, splitter, data, *off, curr_size).await,
            DeferredOp::Truncate { size } => file_data::truncate(&mut acc, splitter, *size, curr_size)
                .await
                .map(|()| *size),
        };
        let new_size = match res {
            Ok(size) => size,
            Err(e) => {
                if fresh {
                    acc.discard_if_clean();
                }
                return Err(e);
            }
        };

        let now = self.deps.clock.now();
        let df = acc.file()?;
        df.entry.size = new_size;
        df.entry.mtime = now;
        if record {
            if let Some(deferred) = df.deferred.as_mut() {
                deferred.push(op.clone());
            }
        }
        Ok(())
    }

    // ---- sync ----

    /// Upload a file's dirty blocks and the directories above it, and
    /// advance the folder head. Returns false if there was nothing to do.
    pub async fn sync(&self, path: &FsPath) -> Result<bool> {
        self.check_folder(path)?;
        let key = path.key();
        let ls = LockState::new();
        let _writer = self.md_writer.lock(&ls).await;

        let mut plan = {
            let mut guard = self.blocks.write(&ls).await;
            let bs = &mut *guard;
            if !bs.files.contains_key(&key) {
                return Ok(false);
            }
            self.prepare_sync(bs, path, &key).await?
        };

        tracing::debug!("syncing {}: uploading {} blocks", path, plan.puts.len());
        let results = self.put_blocks(&plan.puts).await;
        let mut first_err = None;
        for (entry, res) in plan.puts.entries_mut().iter_mut().zip(results) {
            match res {
                Ok(()) => entry.landed = true,
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }

        match first_err {
            None => {
                self.finalize_sync(&ls, path, &key, plan).await;
                Ok(true)
            }
            Some(e) => {
                self.sync_failed(&ls, &key, &plan.puts, &e).await;
                Err(e)
            }
        }
    }

    async fn prepare_sync(&self, bs: &mut BlockState, path: &FsPath, key: &str) -> Result<SyncPlan> {
        let top_ptr = bs
            .files
            .get(key)
            .map(|df| df.entry.info.ptr)
            .ok_or_else(|| BlockError::NotFound(path.to_string()))?;

        if bs.dirty_blocks.contains_key(&top_ptr) {
            let mut acc = FileAccess::new(self, bs, key, Fetched::new());
            file_data::split_leaves(&mut acc, self.deps.splitter.as_ref()).await?;
        }

        let df = bs
            .files
            .get(key)
            .ok_or_else(|| BlockError::NotFound(path.to_string()))?;
        let mut puts = BlockPutState::default();
        let top_info = match bs.dirty_blocks.get(&top_ptr) {
            None => df.entry.info,
            Some(top) => {
                let file = top.as_file()?;
                if file.is_ind {
                    let mut new_top = file.clone();
                    for (i, iptr) in file.iptrs.iter().enumerate() {
                        let Some(leaf) = bs.dirty_blocks.get(&iptr.info.ptr) else {
                            continue;
                        };
                        let (info, ready, landed) = self.ready_or_reuse(df, &iptr.info.ptr, leaf)?;
                        new_top.iptrs[i].info = info;
                        puts.add(iptr.info.ptr, info, leaf.clone(), ready, landed);
                    }
                    let block = Block::File(new_top);
                    let (info, ready) = self.ready(&block)?;
                    puts.add(top_ptr, info, Arc::new(block), ready, false);
                    info
                } else {
                    let (info, ready, landed) = self.ready_or_reuse(df, &top_ptr, top)?;
                    puts.add(top_ptr, info, top.clone(), ready, landed);
                    info
                }
            }
        };

        let entry = DirEntry {
            info: top_info,
            ..df.entry
        };
        let mut unrefs = df.unrefs.clone();
        let name = path.name().ok_or_else(|| BlockError::NotAFile(path.to_string()))?;
        let new_root = self
            .ready_dir_chain(bs, path.parent_names(), name, entry, &mut puts, &mut unrefs)
            .await?;
        let (changes, changes_ptr) = self.plan_changes(&mut puts, unrefs)?;

        if let Some(df) = bs.files.get_mut(key) {
            df.sync_started();
        }
        Ok(SyncPlan {
            puts,
            changes,
            changes_ptr,
            new_root,
        })
    }

    fn ready(&self, block: &Block) -> Result<(BlockInfo, ReadyBlock)> {
        self.deps
            .readier
            .ready(self.deps.kmd.as_ref(), self.deps.user, block)
    }

    /// Reuse the result of a failed sync if the block has not changed.
    fn ready_or_reuse(
        &self,
        df: &DirtyFile,
        ptr: &BlockPointer,
        live: &Arc<Block>,
    ) -> Result<(BlockInfo, ReadyBlock, bool)> {
        if let Some(r) = df.readied.get(ptr) {
            if Arc::ptr_eq(&r.snapshot, live) {
                return Ok((r.info, r.ready.clone(), r.landed));
            }
        }
        let (info, ready) = self.ready(live)?;
        Ok((info, ready, false))
    }

    /// Ready new versions of every directory from the parent of `name` up
    /// to the root. Returns the new root.
    async fn ready_dir_chain(
        &self,
        bs: &BlockState,
        parent_names: &[String],
        name: &str,
        entry: DirEntry,
        puts: &mut BlockPutState,
        unrefs: &mut Vec<BlockInfo>,
    ) -> Result<BlockInfo> {
        let mut fetched = Fetched::new();
        let chain = self.dir_chain_locked(bs, &mut fetched, parent_names).await?;
        let now = self.deps.clock.now();

        let mut child_name = name.to_string();
        let mut child_entry = entry;
        for level in (0..chain.len()).rev() {
            let (old_info, old_block) = &chain[level];
            let mut dir = old_block.as_dir()?.clone();
            dir.children.insert(child_name, child_entry);
            let block = Block::Dir(dir);
            let (info, ready) = self.ready(&block)?;
            puts.add(old_info.ptr, info, Arc::new(block), ready, false);
            if old_info.is_committed() {
                unrefs.push(*old_info);
            }
            if level == 0 {
                return Ok(info);
            }

            child_name = parent_names[level - 1].clone();
            let parent = chain[level - 1].1.as_dir()?;
            let mut parent_entry = *parent
                .children
                .get(&child_name)
                .ok_or_else(|| BlockError::NotFound(parent_names[..level].join("/")))?;
            parent_entry.info = info;
            parent_entry.mtime = now;
            child_entry = parent_entry;
        }
        Err(BlockError::InvalidPath("empty directory chain".into()))
    }

    /// Build the revision's block changes, moving them into their own
    /// block when they are too big to embed.
    fn plan_changes(
        &self,
        puts: &mut BlockPutState,
        unrefs: Vec<BlockInfo>,
    ) -> Result<(BlockChanges, Option<BlockInfo>)> {
        let changes = BlockChanges {
            refs: puts.infos(),
            unrefs,
        };
        if self.deps.splitter.should_embed_changes(&changes) {
            return Ok((changes, None));
        }
        let block = Block::File(FileBlock::direct(bincode::serialize(&changes)?));
        let (info, ready) = self.ready(&block)?;
        puts.add(info.ptr, info, Arc::new(block), ready, false);
        Ok((changes, Some(info)))
    }

    /// Upload with bounded parallelism. Results line up with the entries.
    async fn put_blocks(&self, puts: &BlockPutState) -> Vec<Result<()>> {
        let tlf = self.folder.tlf;
        stream::iter(puts.entries())
            .map(|entry| async move {
                if entry.landed {
                    return Ok(());
                }
                self.deps
                    .server
                    .put(tlf, entry.info.ptr.id, &entry.info.ptr.context, &entry.ready)
                    .await
            })
            .buffered(self.deps.config.max_parallel_puts.max(1))
            .collect()
            .await
    }

    async fn commit_head(&self, head: &mut RootMetadata, bs: &mut BlockState, plan: &SyncPlan) {
        for entry in plan.puts.entries() {
            self.cache_clean(entry.info, &entry.block).await;
        }
        bs.root = plan.new_root;
        head.revision += 1;
        head.root = plan.new_root;
        head.changes = match plan.changes_ptr {
            Some(_) => BlockChanges::default(),
            None => plan.changes.clone(),
        };
        head.changes_ptr = plan.changes_ptr;
    }

    async fn finalize_sync(&self, ls: &LockState, path: &FsPath, key: &str, plan: SyncPlan) {
        let mut head = self.head.write(ls).await;
        let mut guard = self.blocks.write(ls).await;
        let bs = &mut *guard;
        self.commit_head(&mut head, bs, &plan).await;

        let deferred = match bs.files.remove(key) {
            Some(mut df) => {
                df.sync_completed();
                for ptr in df.pointers() {
                    bs.dirty_blocks.remove(ptr);
                }
                df.deferred.take().unwrap_or_default()
            }
            None => DeferredState::default(),
        };

        tracing::info!(
            "synced {} at revision {}: {} blocks, {} deferred ops",
            path,
            head.revision,
            plan.puts.len(),
            deferred.ops.len()
        );
        // Each op already succeeded once against the pre-sync blocks, and
        // the revision is committed either way.
        for op in &deferred.ops {
            if let Err(e) = self.apply_op(bs, path, op, false).await {
                tracing::warn!("replaying {} on {} after sync failed: {}", op, path, e);
            }
        }
    }

    async fn sync_failed(&self, ls: &LockState, key: &str, puts: &BlockPutState, err: &BlockError) {
        let mut guard = self.blocks.write(ls).await;
        let Some(df) = guard.files.get_mut(key) else {
            return;
        };
        df.sync_failed();
        df.readied.clear();
        if err.is_recoverable() {
            for entry in puts.entries() {
                if df.state(&entry.old_ptr) == BlockSyncState::Clean {
                    continue;
                }
                df.readied.insert(
                    entry.old_ptr,
                    ReadiedBlock {
                        snapshot: entry.block.clone(),
                        info: entry.info,
                        ready: entry.ready.clone(),
                        landed: entry.landed,
                    },
                );
            }
        }
        let landed = puts.entries().iter().filter(|e| e.landed).count();
        tracing::warn!(
            "sync of {} failed after {}/{} blocks landed: {}",
            key,
            landed,
            puts.len(),
            err
        );
    }

    // ---- namespace ----

    pub async fn create_file(&self, path: &FsPath) -> Result<DirEntry> {
        self.create_entry(path, EntryType::File).await
    }

    pub async fn create_dir(&self, path: &FsPath) -> Result<DirEntry> {
        self.create_entry(path, EntryType::Dir).await
    }

    async fn create_entry(&self, path: &FsPath, kind: EntryType) -> Result<DirEntry> {
        self.check_folder(path)?;
        let name = path
            .name()
            .ok_or_else(|| BlockError::AlreadyExists(path.to_string()))?;

        let ls = LockState::new();
        let _writer = self.md_writer.lock(&ls).await;
        let mut head = self.head.write(&ls).await;
        let mut guard = self.blocks.write(&ls).await;
        let bs = &mut *guard;

        let mut fetched = Fetched::new();
        let chain = self.dir_chain_locked(bs, &mut fetched, path.parent_names()).await?;
        if chain[chain.len() - 1].1.as_dir()?.children.contains_key(name) {
            return Err(BlockError::AlreadyExists(path.to_string()));
        }

        let block = match kind {
            EntryType::File => Block::File(FileBlock::default()),
            EntryType::Dir => Block::Dir(DirBlock::default()),
        };
        let (info, ready) = self.ready(&block)?;
        let mut puts = BlockPutState::default();
        puts.add(info.ptr, info, Arc::new(block), ready, false);
        let entry = DirEntry {
            info,
            kind,
            size: 0,
            mtime: self.deps.clock.now(),
        };

        let mut unrefs = Vec::new();
        let new_root = self
            .ready_dir_chain(bs, path.parent_names(), name, entry, &mut puts, &mut unrefs)
            .await?;
        let (changes, changes_ptr) = self.plan_changes(&mut puts, unrefs)?;

        for res in self.put_blocks(&puts).await {
            res?;
        }
        let plan = SyncPlan {
            puts,
            changes,
            changes_ptr,
            new_root,
        };
        self.commit_head(&mut head, bs, &plan).await;
        tracing::info!("created {} at revision {}", path, head.revision);
        Ok(entry)
    }

    // ---- introspection ----

    pub async fn block_state(&self, path: &FsPath, ptr: &BlockPointer) -> BlockSyncState {
        let ls = LockState::new();
        let bs = self.blocks.read(&ls).await;
        bs.files
            .get(&path.key())
            .map(|df| df.state(ptr))
            .unwrap_or_default()
    }

    pub async fn dirty_block(&self, ptr: &BlockPointer) -> Option<Arc<Block>> {
        let ls = LockState::new();
        self.blocks.read(&ls).await.dirty_blocks.get(ptr).cloned()
    }

    /// Pointers of the file's current top block and leaves.
    pub async fn file_pointers(&self, path: &FsPath) -> Result<(BlockPointer, Vec<BlockPointer>)> {
        let entry = self.stat(path).await?;
        let top = self.get_block(path, entry.info.ptr, BlockReqType::Read).await?;
        let leaves = top.as_file()?.iptrs.iter().map(|p| p.info.ptr).collect();
        Ok((entry.info.ptr, leaves))
    }
}

/// Writable view of one dirty file used by the byte-level operations.
struct FileAccess<'a> {
    ops: &'a FolderBlockOps,
    bs: &'a mut BlockState,
    key: &'a str,
    fetched: Fetched,
}

impl<'a> FileAccess<'a> {
    fn new(ops: &'a FolderBlockOps, bs: &'a mut BlockState, key: &'a str, fetched: Fetched) -> Self {
        Self {
            ops,
            bs,
            key,
            fetched,
        }
    }

    fn file(&mut self) -> Result<&mut DirtyFile> {
        self.bs
            .files
            .get_mut(self.key)
            .ok_or_else(|| BlockError::NotFound(self.key.to_string()))
    }

    /// Forget a file entry an op created but never got to modify.
    fn discard_if_clean(&mut self) {
        if self.bs.files.get(self.key).is_some_and(DirtyFile::is_clean) {
            self.bs.files.remove(self.key);
        }
    }

    /// Dirty the top block or one of its leaves. The leaf is found and
    /// loaded before anything is modified.
    async fn dirty_block(&mut self, ptr: BlockPointer) -> Result<()> {
        if ptr == self.file()?.entry.info.ptr {
            self.top_mut().await?;
            return Ok(());
        }
        let (idx, info) = {
            let top = self.top().await?;
            let idx = top
                .iptrs
                .iter()
                .position(|p| p.info.ptr == ptr)
                .ok_or(BlockError::NoSuchBlock(ptr.id))?;
            (idx, top.iptrs[idx].info)
        };
        self.load_leaves(&[info]).await?;
        self.top_mut().await?.iptrs[idx].info.encoded_size = 0;
        self.leaf_mut(&info).await?;
        Ok(())
    }

    /// Load a block without dirtying it.
    async fn load(&mut self, ptr: &BlockPointer) -> Result<Arc<Block>> {
        match self
            .ops
            .lookup_block(&*self.bs, &self.fetched, ptr, BlockKind::File)
            .await
        {
            Lookup::Found(block) => Ok(block),
            Lookup::Missing(ptr, kind) => {
                let block = self.ops.fetch_block(ptr, kind).await?;
                self.fetched.insert(ptr, block.clone());
                Ok(block)
            }
        }
    }

    /// Make sure the block is in the dirty set and safe to modify.
    async fn ensure_dirty(&mut self, info: &BlockInfo) -> Result<()> {
        let ptr = info.ptr;
        let state = self.file()?.state(&ptr);
        if let Some(existing) = self.bs.dirty_blocks.get(&ptr) {
            if state.needs_copy() {
                let copy = Arc::new(existing.deep_copy());
                self.bs.dirty_blocks.insert(ptr, copy);
                tracing::debug!("copied {} before writing it during a sync", ptr);
            }
        } else {
            let block = self.load(&ptr).await?;
            self.bs.dirty_blocks.insert(ptr, Arc::new(block.deep_copy()));
            if info.is_committed() {
                self.file()?.add_unref(*info);
            }
        }
        self.file()?.set_state(ptr, state.on_write());
        Ok(())
    }

    fn block_mut(&mut self, ptr: &BlockPointer) -> Result<&mut FileBlock> {
        let block = self
            .bs
            .dirty_blocks
            .get_mut(ptr)
            .ok_or(BlockError::NoSuchBlock(ptr.id))?;
        Arc::make_mut(block).as_file_mut()
    }
}

#[async_trait::async_trait]
impl<'a> FileBlockAccess for FileAccess<'a> {
    async fn top(&mut self) -> Result<&FileBlock> {
        let ptr = self.file()?.entry.info.ptr;
        if !self.bs.dirty_blocks.contains_key(&ptr) && !self.fetched.contains_key(&ptr) {
            let block = self.load(&ptr).await?;
            self.fetched.insert(ptr, block);
        }
        let block = match self.bs.dirty_blocks.get(&ptr) {
            Some(block) => block,
            None => self.fetched.get(&ptr).ok_or(BlockError::NoSuchBlock(ptr.id))?,
        };
        block.as_file()
    }

    async fn top_mut(&mut self) -> Result<&mut FileBlock> {
        let info = self.file()?.entry.info;
        self.ensure_dirty(&info).await?;
        self.file()?.entry.info.encoded_size = 0;
        self.block_mut(&info.ptr)
    }

    async fn leaf_mut(&mut self, info: &BlockInfo) -> Result<&mut FileBlock> {
        self.ensure_dirty(info).await?;
        self.block_mut(&info.ptr)
    }

    fn add_leaf(&mut self, block: FileBlock) -> BlockPointer {
        let ptr = BlockPointer::temporary(self.ops.deps.kmd.latest_key_gen(), self.ops.deps.user);
        self.bs.dirty_blocks.insert(ptr, Arc::new(Block::File(block)));
        if let Some(df) = self.bs.files.get_mut(self.key) {
            df.set_state(ptr, BlockSyncState::Clean.on_write());
        }
        ptr
    }

    fn remove_leaf(&mut self, info: &BlockInfo) {
        let was_dirty = self.bs.dirty_blocks.remove(&info.ptr).is_some();
        if let Some(df) = self.bs.files.get_mut(self.key) {
            df.forget(&info.ptr);
            if !was_dirty && info.is_committed() {
                df.add_unref(*info);
            }
        }
    }

    fn dirty_leaf(&self, ptr: &BlockPointer) -> Option<&FileBlock> {
        self.bs.dirty_blocks.get(ptr).and_then(|b| b.as_file().ok())
    }

    async fn load_leaves(&mut self, infos: &[BlockInfo]) -> Result<()> {
        for info in infos {
            if self.bs.dirty_blocks.contains_key(&info.ptr) || self.fetched.contains_key(&info.ptr) {
                continue;
            }
            let block = self.load(&info.ptr).await?;
            self.fetched.insert(info.ptr, block);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_paths() {
        let folder = FolderBranch::master(TlfId::random());
        let p = FsPath::parse(folder.clone(), "/a//b/c.txt").unwrap();
        assert_eq!(p.names, vec!["a", "b", "c.txt"]);
        assert_eq!(p.name(), Some("c.txt"));
        assert_eq!(p.parent_names(), &["a".to_string(), "b".to_string()]);
        assert_eq!(p.to_string(), "/a/b/c.txt");
        assert_eq!(p.key(), "a/b/c.txt");

        let root = FsPath::parse(folder.clone(), "/").unwrap();
        assert!(root.is_root());
        assert!(root.parent_names().is_empty());
        assert_eq!(root.child("x").key(), "x");

        assert!(FsPath::parse(folder, "a/../b").is_err());
    }
}
