mod common;

use common::*;
use libblockfs::block::{Block, BlockKind, BlockReadier, FileBlock};
use libblockfs::cache::{BlockCache, DiskBlockCache, StaticDiskLimiter};
use libblockfs::cadapter::{BlockServer, MemBlockServer};
use libblockfs::clock::TestClock;
use libblockfs::crypto::KeyMetadata;
use libblockfs::retrieval::{BlockRetrievalQueue, ON_DEMAND_PRIORITY};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

async fn make_disk_cache() -> Arc<DiskBlockCache> {
    let limiter = Arc::new(StaticDiskLimiter::new(1 << 20, 1_000));
    Arc::new(
        DiskBlockCache::in_memory(limiter, Arc::new(TestClock::new(1)))
            .await
            .unwrap(),
    )
}

#[tokio::test]
async fn test_disk_cache_round_trip_through_queue() {
    let keys = make_keys();
    let block = Block::File(FileBlock::direct(b"plaintext leaf".to_vec()));
    let (info, ready) = BlockReadier::default().ready(keys.as_ref(), TEST_USER, &block).unwrap();

    let disk = make_disk_cache().await;
    disk.put(keys.tlf_id(), info.ptr.id, &ready.buf, ready.server_half)
        .await
        .unwrap();

    // The server has nothing: only the disk cache can answer.
    let server = Arc::new(MemBlockServer::new());
    let queue = BlockRetrievalQueue::new(
        1,
        server.clone(),
        BlockReadier::default(),
        BlockCache::new(16),
        Some(disk),
    );
    let got = queue
        .get_block(&CancellationToken::new(), ON_DEMAND_PRIORITY, keys.clone(), info.ptr, BlockKind::File)
        .await
        .unwrap();
    assert_eq!(got, block);
    assert_eq!(server.get_count(), 0);
    queue.shutdown().await;
}

#[tokio::test]
async fn test_fetch_fills_disk_cache_for_later_queues() {
    let keys = make_keys();
    let server = Arc::new(MemBlockServer::new());
    let block = Block::File(FileBlock::direct(make_data(100)));
    let (info, ready) = BlockReadier::default().ready(keys.as_ref(), TEST_USER, &block).unwrap();
    server
        .put(keys.tlf_id(), info.ptr.id, &info.ptr.context, &ready)
        .await
        .unwrap();

    let disk = make_disk_cache().await;
    let queue = BlockRetrievalQueue::new(
        2,
        server.clone(),
        BlockReadier::default(),
        BlockCache::new(16),
        Some(disk.clone()),
    );
    let ctx = CancellationToken::new();
    queue
        .get_block(&ctx, ON_DEMAND_PRIORITY, keys.clone(), info.ptr, BlockKind::File)
        .await
        .unwrap();
    queue.shutdown().await;

    let (buf, half) = disk.get(keys.tlf_id(), info.ptr.id).await.unwrap();
    assert_eq!(buf, ready.buf);
    assert_eq!(half, ready.server_half);

    // No workers and a cold clean cache: served from disk or not at all.
    let offline = BlockRetrievalQueue::new(0, server.clone(), BlockReadier::default(), BlockCache::new(16), Some(disk));
    let got = offline
        .get_block(&ctx, ON_DEMAND_PRIORITY, keys, info.ptr, BlockKind::File)
        .await
        .unwrap();
    assert_eq!(got, block);
    assert_eq!(server.get_count(), 1);
}

#[tokio::test]
async fn test_requests_at_two_priorities_share_a_fetch() {
    let keys = make_keys();
    let server = Arc::new(MemBlockServer::new());
    let block = Block::File(FileBlock::direct(b"shared".to_vec()));
    let (info, ready) = BlockReadier::default().ready(keys.as_ref(), TEST_USER, &block).unwrap();
    server
        .put(keys.tlf_id(), info.ptr.id, &info.ptr.context, &ready)
        .await
        .unwrap();

    let queue = BlockRetrievalQueue::new(1, server.clone(), BlockReadier::default(), BlockCache::new(16), None);
    let ctx = CancellationToken::new();
    let low = queue.request(&ctx, 2, keys.clone(), info.ptr, BlockKind::File).await;
    let high = queue.request(&ctx, 9, keys.clone(), info.ptr, BlockKind::File).await;
    let (low, high) = timeout(Duration::from_secs(5), async { (low.wait().await, high.wait().await) })
        .await
        .unwrap();
    assert_eq!(low.unwrap(), block);
    assert_eq!(high.unwrap(), block);
    assert_eq!(server.get_count(), 1);

    let late = queue
        .get_block(&ctx, 1, keys, info.ptr, BlockKind::File)
        .await
        .unwrap();
    assert_eq!(late, block);
    assert_eq!(server.get_count(), 1);
    queue.shutdown().await;
}
