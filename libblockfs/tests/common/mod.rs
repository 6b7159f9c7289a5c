#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

use libblockfs::block::{BlockContext, BlockId, BlockReadier, ReadyBlock, TlfId, UserId};
use libblockfs::cache::BlockCache;
use libblockfs::cadapter::{BlockServer, MemBlockServer};
use libblockfs::clock::{Clock, TestClock};
use libblockfs::config::SyncConfig;
use libblockfs::crypto::{KeyMetadata, TlfKeys};
use libblockfs::error::{BlockError, Result};
use libblockfs::retrieval::BlockRetrievalQueue;
use libblockfs::splitter::BlockSplitterSimple;
use libblockfs::sync::{FolderBlockOps, FolderBranch, FolderDeps};

pub const TEST_USER: UserId = UserId([7; 16]);

/// Memory block server that can hold puts at a gate and fail a chosen put.
pub struct TestServer {
    inner: MemBlockServer,
    gated: AtomicBool,
    gate: Semaphore,
    waiting: AtomicUsize,
    puts: AtomicUsize,
    // 1-based put number to fail, 0 for none
    fail_on: AtomicUsize,
    attempted: Mutex<Vec<BlockId>>,
}

impl TestServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: MemBlockServer::new(),
            gated: AtomicBool::new(false),
            gate: Semaphore::new(0),
            waiting: AtomicUsize::new(0),
            puts: AtomicUsize::new(0),
            fail_on: AtomicUsize::new(0),
            attempted: Mutex::new(Vec::new()),
        })
    }

    pub fn inner(&self) -> &MemBlockServer {
        &self.inner
    }

    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn close_gate(&self) {
        self.gated.store(true, Ordering::SeqCst);
    }

    pub fn open_gate(&self) {
        self.gated.store(false, Ordering::SeqCst);
        self.gate.add_permits(1024);
    }

    /// Fail the `n`-th put from now on (1 = the next one).
    pub fn fail_put_in(&self, n: usize) {
        self.fail_on.store(self.put_count() + n, Ordering::SeqCst);
    }

    pub fn heal(&self) {
        self.fail_on.store(0, Ordering::SeqCst);
    }

    /// Ids of every put attempted so far, in order.
    pub fn attempted(&self) -> Vec<BlockId> {
        self.attempted.lock().unwrap().clone()
    }

    /// Wait until at least `n` puts are parked at the gate.
    pub async fn wait_for_gated_puts(&self, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.waiting.load(Ordering::SeqCst) < n {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("puts never reached the gate");
    }
}

#[async_trait]
impl BlockServer for TestServer {
    async fn get(&self, tlf: TlfId, id: BlockId, context: &BlockContext) -> Result<ReadyBlock> {
        self.inner.get(tlf, id, context).await
    }

    async fn put(&self, tlf: TlfId, id: BlockId, context: &BlockContext, block: &ReadyBlock) -> Result<()> {
        let n = self.puts.fetch_add(1, Ordering::SeqCst) + 1;
        self.attempted.lock().unwrap().push(id);
        if self.gated.load(Ordering::SeqCst) {
            self.waiting.fetch_add(1, Ordering::SeqCst);
            let permit = self.gate.acquire().await.map_err(|e| BlockError::Server(e.to_string()))?;
            permit.forget();
            self.waiting.fetch_sub(1, Ordering::SeqCst);
        }
        if self.fail_on.load(Ordering::SeqCst) == n {
            return Err(BlockError::Server(format!("injected failure on put {n}")));
        }
        self.inner.put(tlf, id, context, block).await
    }

    async fn delete(&self, tlf: TlfId, id: BlockId, context: &BlockContext) -> Result<usize> {
        self.inner.delete(tlf, id, context).await
    }
}

pub struct FolderOpts {
    pub leaf_size: usize,
    pub max_ptrs: usize,
    pub changes_max: u64,
    pub max_parallel_puts: usize,
    pub workers: usize,
}

impl Default for FolderOpts {
    fn default() -> Self {
        Self {
            leaf_size: 8,
            max_ptrs: 64,
            changes_max: 64 * 1024,
            max_parallel_puts: 4,
            workers: 2,
        }
    }
}

pub fn make_keys() -> Arc<TlfKeys> {
    Arc::new(TlfKeys::random(TlfId::random()))
}

pub fn make_queue(server: Arc<dyn BlockServer>, workers: usize) -> Arc<BlockRetrievalQueue> {
    Arc::new(BlockRetrievalQueue::new(
        workers,
        server,
        BlockReadier::default(),
        BlockCache::new(1024),
        None,
    ))
}

pub fn make_deps(
    server: Arc<dyn BlockServer>,
    keys: Arc<TlfKeys>,
    queue: Arc<BlockRetrievalQueue>,
    clock: Arc<dyn Clock>,
    opts: &FolderOpts,
) -> FolderDeps {
    FolderDeps {
        user: TEST_USER,
        kmd: keys,
        server,
        retrieval: queue,
        readier: BlockReadier::default(),
        splitter: Arc::new(BlockSplitterSimple::new(opts.leaf_size, opts.max_ptrs, opts.changes_max).unwrap()),
        clock,
        config: SyncConfig {
            max_parallel_puts: opts.max_parallel_puts,
        },
    }
}

/// A fresh folder on `server`, plus what is needed to reopen it.
pub async fn make_folder(server: Arc<TestServer>, opts: FolderOpts) -> (FolderBlockOps, Arc<TlfKeys>) {
    let keys = make_keys();
    let queue = make_queue(server.clone(), opts.workers);
    let clock = Arc::new(TestClock::new(1_000));
    let folder = FolderBranch::master(keys.tlf_id());
    let ops = FolderBlockOps::create(folder, make_deps(server, keys.clone(), queue, clock, &opts))
        .await
        .unwrap();
    (ops, keys)
}

/// Open the same folder with cold caches, so every block is fetched.
pub async fn reopen(ops: &FolderBlockOps, server: Arc<TestServer>, keys: Arc<TlfKeys>) -> FolderBlockOps {
    let opts = FolderOpts::default();
    let queue = make_queue(server.clone(), opts.workers);
    let deps = make_deps(server, keys, queue, Arc::new(TestClock::new(1_000)), &opts);
    FolderBlockOps::open(ops.folder().clone(), deps, ops.head().await).unwrap()
}

pub fn make_data(len: usize) -> Vec<u8> {
    (0..len).map(|i| b'a' + (i % 26) as u8).collect()
}
