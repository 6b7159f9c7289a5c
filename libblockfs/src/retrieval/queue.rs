//! Deduplicating, prioritized block fetches served by a fixed worker pool.
//!
//! A request first checks the clean cache and then the disk cache. On a
//! miss it joins the queued retrieval for the same block id, or creates
//! one. Workers take the highest-priority retrieval, fetch and verify it
//! once, populate both caches, and hand every requester its own copy.
//!
//! A block fetched for a real request also queues its children (the leaves
//! of an indirect file, or the entries of a directory) at background
//! priority, with a bounded number of prefetches in flight.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify, Semaphore, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::heap::RetrievalHeap;
use crate::block::{Block, BlockId, BlockKind, BlockPointer, BlockReadier, DirEntry, EntryType, ReadyBlock};
use crate::cache::{BlockCache, DiskBlockCache};
use crate::cadapter::BlockServer;
use crate::crypto::KeyMetadata;
use crate::error::{BlockError, Result};

/// Priority of a request a caller is blocked on.
pub const ON_DEMAND_PRIORITY: i32 = 1 << 30;
/// Priority of prefetches.
pub const BACKGROUND_PRIORITY: i32 = 1 << 15;
/// Prefetches in flight at once, unless configured otherwise.
pub const DEFAULT_MAX_PREFETCHES: usize = 2;

struct Requester {
    kind: BlockKind,
    tx: oneshot::Sender<Result<Block>>,
}

impl Requester {
    fn deliver(self, canonical: &Result<Arc<Block>>) {
        let res = match canonical {
            Ok(block) => block.materialize(self.kind),
            Err(e) => Err(e.clone()),
        };
        // The receiver may have given up waiting.
        let _ = self.tx.send(res);
    }
}

struct Retrieval {
    ptr: BlockPointer,
    kmd: Arc<dyn KeyMetadata>,
    requests: Vec<Requester>,
}

#[derive(Default)]
struct QueueState {
    heap: RetrievalHeap,
    /// Queued and in-flight retrievals. An in-flight one is no longer in
    /// the heap but still collects requesters.
    entries: HashMap<BlockId, Retrieval>,
    seq: u64,
    shut_down: bool,
}

struct QueueInner {
    state: Mutex<QueueState>,
    work: Notify,
    cancel: CancellationToken,
    server: Arc<dyn BlockServer>,
    readier: BlockReadier,
    clean: BlockCache,
    disk: Option<Arc<DiskBlockCache>>,
    num_workers: usize,
    /// `None` when prefetching is off.
    prefetch: Option<Arc<Semaphore>>,
}

/// Waits for one request's result.
pub struct RetrievalHandle {
    rx: oneshot::Receiver<Result<Block>>,
    ctx: CancellationToken,
}

impl RetrievalHandle {
    fn ready(ctx: &CancellationToken, res: Result<Block>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(res);
        Self { rx, ctx: ctx.clone() }
    }

    /// Resolves with the block, the fetch error, `Canceled` if the
    /// request's context is canceled first, or `Shutdown`.
    pub async fn wait(self) -> Result<Block> {
        tokio::select! {
            biased;
            res = self.rx => res.unwrap_or(Err(BlockError::Shutdown)),
            _ = self.ctx.cancelled() => Err(BlockError::Canceled),
        }
    }
}

pub struct BlockRetrievalQueue {
    inner: Arc<QueueInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl BlockRetrievalQueue {
    /// Spawns `num_workers` fetch workers on the current runtime. Zero
    /// disables fetching: requests are answered from the caches or fail
    /// with `NoSuchBlock`.
    pub fn new(
        num_workers: usize,
        server: Arc<dyn BlockServer>,
        readier: BlockReadier,
        clean: BlockCache,
        disk: Option<Arc<DiskBlockCache>>,
    ) -> Self {
        Self::with_prefetch_limit(num_workers, DEFAULT_MAX_PREFETCHES, server, readier, clean, disk)
    }

    /// Like `new`, with at most `max_prefetches` prefetches in flight.
    /// Zero turns prefetching off.
    pub fn with_prefetch_limit(
        num_workers: usize,
        max_prefetches: usize,
        server: Arc<dyn BlockServer>,
        readier: BlockReadier,
        clean: BlockCache,
        disk: Option<Arc<DiskBlockCache>>,
    ) -> Self {
        let inner = Arc::new(QueueInner {
            state: Mutex::new(QueueState::default()),
            work: Notify::new(),
            cancel: CancellationToken::new(),
            server,
            readier,
            clean,
            disk,
            num_workers,
            prefetch: (max_prefetches > 0).then(|| Arc::new(Semaphore::new(max_prefetches))),
        });
        let workers = (0..num_workers)
            .map(|_| tokio::spawn(worker_loop(inner.clone())))
            .collect();
        Self {
            inner,
            workers: Mutex::new(workers),
        }
    }

    pub fn clean_cache(&self) -> &BlockCache {
        &self.inner.clean
    }

    pub fn disk_cache(&self) -> Option<&Arc<DiskBlockCache>> {
        self.inner.disk.as_ref()
    }

    pub async fn request(
        &self,
        ctx: &CancellationToken,
        priority: i32,
        kmd: Arc<dyn KeyMetadata>,
        ptr: BlockPointer,
        kind: BlockKind,
    ) -> RetrievalHandle {
        self.inner.request(ctx, priority, kmd, ptr, kind).await
    }

    /// `request` and wait for it.
    pub async fn get_block(
        &self,
        ctx: &CancellationToken,
        priority: i32,
        kmd: Arc<dyn KeyMetadata>,
        ptr: BlockPointer,
        kind: BlockKind,
    ) -> Result<Block> {
        self.request(ctx, priority, kmd, ptr, kind).await.wait().await
    }

    /// Number of retrievals queued or in flight.
    pub async fn pending(&self) -> usize {
        self.inner.state.lock().await.entries.len()
    }

    /// Priority of a queued (not yet started) retrieval.
    pub async fn priority_of(&self, id: &BlockId) -> Option<i32> {
        self.inner.state.lock().await.heap.priority_of(id)
    }

    /// Stop accepting requests, abandon in-flight fetches, and fail every
    /// pending requester with `Shutdown`.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let drained: Vec<Retrieval> = {
            let mut st = self.inner.state.lock().await;
            st.shut_down = true;
            st.heap = RetrievalHeap::new();
            st.entries.drain().map(|(_, r)| r).collect()
        };
        let err = Err(BlockError::Shutdown);
        for retrieval in drained {
            for requester in retrieval.requests {
                requester.deliver(&err);
            }
        }
        let workers: Vec<_> = self.workers.lock().await.drain(..).collect();
        for handle in workers {
            if let Err(e) = handle.await {
                tracing::warn!("retrieval worker exited abnormally: {}", e);
            }
        }
    }
}

impl Drop for BlockRetrievalQueue {
    fn drop(&mut self) {
        // Workers exit; queued senders drop with the state and their
        // receivers see `Shutdown`.
        self.inner.cancel.cancel();
    }
}

async fn worker_loop(inner: Arc<QueueInner>) {
    loop {
        let next = {
            let mut st = inner.state.lock().await;
            match st.heap.pop() {
                Some((id, priority)) => st.entries.get(&id).map(|r| (r.ptr, r.kmd.clone(), priority)),
                None => None,
            }
        };
        let Some((ptr, kmd, priority)) = next else {
            tokio::select! {
                _ = inner.cancel.cancelled() => return,
                _ = inner.work.notified() => continue,
            }
        };

        let res = tokio::select! {
            _ = inner.cancel.cancelled() => Err(BlockError::Shutdown),
            res = inner.fetch(&ptr, kmd.as_ref()) => res,
        };
        match &res {
            Ok(block) if priority > BACKGROUND_PRIORITY => inner.prefetch_children(block, kmd),
            Ok(_) => {}
            Err(e) => tracing::debug!("retrieval of {} failed: {}", ptr.id, e),
        }

        let finished = inner.state.lock().await.entries.remove(&ptr.id);
        if let Some(retrieval) = finished {
            for requester in retrieval.requests {
                requester.deliver(&res);
            }
        }
        if inner.cancel.is_cancelled() {
            return;
        }
    }
}

impl QueueInner {
    pub async fn request(
        &self,
        ctx: &CancellationToken,
        priority: i32,
        kmd: Arc<dyn KeyMetadata>,
        ptr: BlockPointer,
        kind: BlockKind,
    ) -> RetrievalHandle {
        if let Some(block) = self.check_caches(kmd.as_ref(), &ptr).await {
            return RetrievalHandle::ready(ctx, block.materialize(kind));
        }
        if self.num_workers == 0 {
            return RetrievalHandle::ready(ctx, Err(BlockError::NoSuchBlock(ptr.id)));
        }

        let (tx, rx) = oneshot::channel();
        let requester = Requester { kind, tx };
        let mut guard = self.state.lock().await;
        if guard.shut_down {
            drop(guard);
            requester.deliver(&Err(BlockError::Shutdown));
            return RetrievalHandle { rx, ctx: ctx.clone() };
        }

        let st = &mut *guard;
        if let Some(entry) = st.entries.get_mut(&ptr.id) {
            entry.requests.push(requester);
            if st.heap.raise(&ptr.id, priority) {
                tracing::debug!("raised retrieval of {} to priority {}", ptr.id, priority);
            }
        } else {
            st.seq += 1;
            let seq = st.seq;
            st.heap.push(ptr.id, priority, seq);
            st.entries.insert(
                ptr.id,
                Retrieval {
                    ptr,
                    kmd,
                    requests: vec![requester],
                },
            );
            self.work.notify_one();
        }
        RetrievalHandle { rx, ctx: ctx.clone() }
    }

    async fn check_caches(&self, kmd: &dyn KeyMetadata, ptr: &BlockPointer) -> Option<Arc<Block>> {
        if let Some(block) = self.clean.get(&ptr.id).await {
            return Some(block);
        }
        let disk = self.disk.as_ref()?;
        let (buf, server_half) = match disk.get(kmd.tlf_id(), ptr.id).await {
            Ok(hit) => hit,
            Err(BlockError::NoSuchBlock(_)) => return None,
            Err(e) => {
                tracing::warn!("disk cache lookup of {} failed: {}", ptr.id, e);
                return None;
            }
        };
        match self.readier.decode(kmd, ptr, &ReadyBlock { buf, server_half }) {
            Ok(block) => {
                let block = Arc::new(block);
                self.clean.put(ptr.id, block.clone()).await;
                Some(block)
            }
            Err(e) => {
                tracing::warn!("cached copy of {} is unusable: {}", ptr.id, e);
                None
            }
        }
    }

    /// Queue the children of a block someone asked for. Prefetched blocks
    /// do not prefetch their own children.
    fn prefetch_children(self: &Arc<Self>, block: &Block, kmd: Arc<dyn KeyMetadata>) {
        let Some(limit) = self.prefetch.clone() else {
            return;
        };
        let children = children_of(block);
        if children.is_empty() {
            return;
        }
        tracing::debug!("prefetching {} child blocks", children.len());
        let inner = self.clone();
        tokio::spawn(async move {
            for (ptr, kind) in children {
                let permit = tokio::select! {
                    _ = inner.cancel.cancelled() => return,
                    permit = limit.clone().acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return,
                    },
                };
                let handle = inner
                    .request(&inner.cancel, BACKGROUND_PRIORITY, kmd.clone(), ptr, kind)
                    .await;
                tokio::spawn(async move {
                    if let Err(e) = handle.wait().await {
                        tracing::debug!("prefetch of {} failed: {}", ptr.id, e);
                    }
                    drop(permit);
                });
            }
        });
    }

    async fn fetch(&self, ptr: &BlockPointer, kmd: &dyn KeyMetadata) -> Result<Arc<Block>> {
        let tlf = kmd.tlf_id();
        let ready = self.server.get(tlf, ptr.id, &ptr.context).await?;
        let block = Arc::new(self.readier.decode(kmd, ptr, &ready)?);

        self.clean.put(ptr.id, block.clone()).await;
        if let Some(disk) = &self.disk {
            if let Err(e) = disk.put(tlf, ptr.id, &ready.buf, ready.server_half).await {
                tracing::warn!("failed to cache block {} on disk: {}", ptr.id, e);
            }
        }
        Ok(block)
    }
}

/// Pointers a prefetch of `block` would fetch: an indirect file's leaves,
/// or a directory's entries, smallest first.
fn children_of(block: &Block) -> Vec<(BlockPointer, BlockKind)> {
    match block {
        Block::File(file) if file.is_ind => file.iptrs.iter().map(|p| (p.info.ptr, BlockKind::File)).collect(),
        Block::Dir(dir) => {
            let mut entries: Vec<&DirEntry> = dir.children.values().collect();
            entries.sort_by_key(|e| e.size);
            entries
                .into_iter()
                .map(|e| {
                    let kind = match e.kind {
                        EntryType::File => BlockKind::File,
                        EntryType::Dir => BlockKind::Dir,
                    };
                    (e.info.ptr, kind)
                })
                .collect()
        }
        _ => Vec::new(),
    }
}
