//! Persistent secondary cache of encrypted blocks.
//!
//! Three stores back the cache:
//! - `blocks`: block id -> encrypted bytes and server half
//! - `meta`: block id -> owning TLF, byte size and LRU stamp
//! - `tlfs`: `tlf ‖ id` -> empty, the per-TLF index eviction samples from
//!
//! Every entry in `blocks` has exactly one `meta` record and at most one
//! `tlfs` entry. Eviction is approximate LRU over a random sample.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::kv::{FileKvStore, KvStore, MemKvStore, WriteBatch};
use super::limiter::{DiskLimiter, LimiterStatus};
use crate::block::pointer::{BLOCK_ID_LEN, TLF_ID_LEN};
use crate::block::{BlockId, TlfId};
use crate::clock::Clock;
use crate::crypto::ServerHalf;
use crate::error::{BlockError, Result};

pub const DEFAULT_NUM_BLOCKS_TO_EVICT: usize = 10;
/// Sample this many candidates per block to evict.
pub const EVICTION_CONSIDERATION_FACTOR: usize = 3;
pub const MAX_EVICTIONS_PER_PUT: usize = 100;

const BLOCK_DB_DIR: &str = "blocks";
const META_DB_DIR: &str = "meta";
const TLF_DB_DIR: &str = "tlfs";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskBlockCacheMetadata {
    pub tlf: TlfId,
    pub block_size: u32,
    /// Clock nanos of the last put or get.
    pub lru_time: u64,
}

#[derive(Serialize, Deserialize)]
struct DiskBlockCacheEntry {
    buf: Vec<u8>,
    server_half: ServerHalf,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiskCacheStatus {
    pub num_blocks: u64,
    pub curr_bytes: u64,
    /// Hex TLF id -> cached block count.
    pub tlf_counts: BTreeMap<String, u64>,
    pub limiter: LimiterStatus,
}

#[derive(Default)]
struct CacheCounts {
    tlf_counts: HashMap<TlfId, u64>,
    num_blocks: u64,
    curr_bytes: u64,
}

impl CacheCounts {
    fn add(&mut self, tlf: TlfId, bytes: u64) {
        *self.tlf_counts.entry(tlf).or_default() += 1;
        self.num_blocks += 1;
        self.curr_bytes += bytes;
    }

    fn remove(&mut self, tlf: TlfId, bytes: u64) {
        if let Some(c) = self.tlf_counts.get_mut(&tlf) {
            *c = c.saturating_sub(1);
            if *c == 0 {
                self.tlf_counts.remove(&tlf);
            }
        }
        self.num_blocks = self.num_blocks.saturating_sub(1);
        self.curr_bytes = self.curr_bytes.saturating_sub(bytes);
    }
}

fn tlf_key(tlf: &TlfId, id: &BlockId) -> Vec<u8> {
    let mut key = Vec::with_capacity(TLF_ID_LEN + BLOCK_ID_LEN);
    key.extend_from_slice(tlf.as_bytes());
    key.extend_from_slice(id.as_bytes());
    key
}

/// Order TLFs for eviction at random, weighted by how many blocks each
/// holds (key = u^(1/w), largest first).
fn shuffle_tlfs_weighted(counts: &HashMap<TlfId, u64>) -> Vec<(TlfId, u64)> {
    let mut keyed: Vec<(f64, TlfId, u64)> = counts
        .iter()
        .filter(|(_, c)| **c > 0)
        .map(|(tlf, c)| (rand::random::<f64>().powf(1.0 / *c as f64), *tlf, *c))
        .collect();
    keyed.sort_by(|a, b| b.0.total_cmp(&a.0));
    keyed.into_iter().map(|(_, tlf, c)| (tlf, c)).collect()
}

pub struct DiskBlockCache {
    block_db: Arc<dyn KvStore>,
    meta_db: Arc<dyn KvStore>,
    tlf_db: Arc<dyn KvStore>,
    counts: Mutex<CacheCounts>,
    limiter: Arc<dyn DiskLimiter>,
    clock: Arc<dyn Clock>,
}

impl DiskBlockCache {
    /// Open (or create) a cache under `dir`, rebuilding counts from what is
    /// already there.
    pub async fn open<P: AsRef<Path>>(dir: P, limiter: Arc<dyn DiskLimiter>, clock: Arc<dyn Clock>) -> Result<Self> {
        let dir = dir.as_ref();
        let block_db = FileKvStore::open(dir.join(BLOCK_DB_DIR)).await?;
        let meta_db = FileKvStore::open(dir.join(META_DB_DIR)).await?;
        let tlf_db = FileKvStore::open(dir.join(TLF_DB_DIR)).await?;
        let cache = Self::from_stores(Arc::new(block_db), Arc::new(meta_db), Arc::new(tlf_db), limiter, clock).await?;
        tracing::info!("opened disk block cache at {:?}", dir);
        Ok(cache)
    }

    pub async fn in_memory(limiter: Arc<dyn DiskLimiter>, clock: Arc<dyn Clock>) -> Result<Self> {
        Self::from_stores(
            Arc::new(MemKvStore::new()),
            Arc::new(MemKvStore::new()),
            Arc::new(MemKvStore::new()),
            limiter,
            clock,
        )
        .await
    }

    pub async fn from_stores(
        block_db: Arc<dyn KvStore>,
        meta_db: Arc<dyn KvStore>,
        tlf_db: Arc<dyn KvStore>,
        limiter: Arc<dyn DiskLimiter>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let cache = Self {
            block_db,
            meta_db,
            tlf_db,
            counts: Mutex::new(CacheCounts::default()),
            limiter,
            clock,
        };
        cache.sync_block_counts().await?;
        Ok(cache)
    }

    /// Rebuild counts from `meta` and drop entries that lost their partner
    /// in one of the other stores.
    async fn sync_block_counts(&self) -> Result<()> {
        let mut counts = self.counts.lock().await;
        *counts = CacheCounts::default();

        let block_keys: HashSet<Vec<u8>> = self.block_db.keys().await?.into_iter().collect();
        let mut live: HashMap<BlockId, TlfId> = HashMap::new();
        let mut block_batch = WriteBatch::default();
        let mut meta_batch = WriteBatch::default();
        let mut tlf_batch = WriteBatch::default();

        for key in self.meta_db.keys().await? {
            let meta = match self.meta_db.get(&key).await? {
                Some(buf) => bincode::deserialize::<DiskBlockCacheMetadata>(&buf).ok(),
                None => None,
            };
            match (BlockId::from_slice(&key), meta) {
                (Some(id), Some(meta)) if block_keys.contains(&key) => {
                    counts.add(meta.tlf, meta.block_size as u64);
                    live.insert(id, meta.tlf);
                }
                _ => {
                    meta_batch.delete(&key);
                    block_batch.delete(&key);
                }
            }
        }

        for key in &block_keys {
            let known = BlockId::from_slice(key).is_some_and(|id| live.contains_key(&id));
            if !known {
                block_batch.delete(key);
            }
        }

        let mut indexed = HashSet::new();
        for key in self.tlf_db.keys().await? {
            let entry = (key.len() == TLF_ID_LEN + BLOCK_ID_LEN)
                .then(|| (TlfId::from_slice(&key[..TLF_ID_LEN]), BlockId::from_slice(&key[TLF_ID_LEN..])));
            match entry {
                Some((Some(tlf), Some(id))) if live.get(&id) == Some(&tlf) => {
                    indexed.insert(id);
                }
                _ => tlf_batch.delete(&key),
            }
        }
        for (id, tlf) in &live {
            if !indexed.contains(id) {
                tlf_batch.put(&tlf_key(tlf, id), &[]);
            }
        }

        let orphans = block_batch.len() + meta_batch.len() + tlf_batch.len();
        if orphans > 0 {
            tracing::warn!("disk block cache: cleaning up {} orphaned entries", orphans);
        }
        self.block_db.write(block_batch).await?;
        self.meta_db.write(meta_batch).await?;
        self.tlf_db.write(tlf_batch).await?;

        self.limiter
            .on_enable(counts.curr_bytes as i64, counts.num_blocks as i64)
            .await;
        tracing::debug!(
            "disk block cache holds {} blocks, {} bytes",
            counts.num_blocks,
            counts.curr_bytes
        );
        Ok(())
    }

    async fn read_metadata(&self, id: &BlockId) -> Result<Option<DiskBlockCacheMetadata>> {
        match self.meta_db.get(id.as_bytes()).await? {
            Some(buf) => Ok(Some(bincode::deserialize(&buf)?)),
            None => Ok(None),
        }
    }

    async fn write_metadata(&self, id: &BlockId, meta: &DiskBlockCacheMetadata) -> Result<()> {
        self.meta_db.put(id.as_bytes(), &bincode::serialize(meta)?).await
    }

    pub async fn metadata(&self, id: &BlockId) -> Result<Option<DiskBlockCacheMetadata>> {
        let _counts = self.counts.lock().await;
        self.read_metadata(id).await
    }

    /// Store a block, evicting older entries when the limiter refuses it.
    pub async fn put(&self, tlf: TlfId, id: BlockId, buf: &[u8], server_half: ServerHalf) -> Result<()> {
        self.limiter.backpressure().await?;

        let mut counts = self.counts.lock().await;
        let now = self.clock.now();

        if let Some(mut meta) = self.read_metadata(&id).await? {
            // Content addressed: the bytes cannot have changed.
            meta.lru_time = now;
            return self.write_metadata(&id, &meta).await;
        }

        let bytes = buf.len() as i64;
        let mut admitted = false;
        for _ in 0..MAX_EVICTIONS_PER_PUT {
            if self.limiter.reserve(bytes, 1).await?.admitted() {
                admitted = true;
                break;
            }
            let (removed, _) = self
                .evict_locked(&mut counts, None, DEFAULT_NUM_BLOCKS_TO_EVICT)
                .await?;
            if removed == 0 {
                break;
            }
        }
        if !admitted {
            return Err(BlockError::CacheFull(format!(
                "no room for {bytes} bytes of block {id} ({} blocks, {} bytes cached)",
                counts.num_blocks, counts.curr_bytes
            )));
        }

        let res = self.write_new_entry(tlf, id, buf, server_half, now).await;
        self.limiter.commit_or_rollback(bytes, 1, res.is_ok()).await;
        res?;
        counts.add(tlf, bytes as u64);
        tracing::debug!("disk block cache put {} ({} bytes)", id, bytes);
        Ok(())
    }

    async fn write_new_entry(&self, tlf: TlfId, id: BlockId, buf: &[u8], server_half: ServerHalf, now: u64) -> Result<()> {
        let entry = DiskBlockCacheEntry {
            buf: buf.to_vec(),
            server_half,
        };
        self.block_db.put(id.as_bytes(), &bincode::serialize(&entry)?).await?;
        self.tlf_db.put(&tlf_key(&tlf, &id), &[]).await?;
        let meta = DiskBlockCacheMetadata {
            tlf,
            block_size: buf.len() as u32,
            lru_time: now,
        };
        // Metadata last: a crash before this leaves orphans that reopen
        // removes, never a record pointing at missing bytes.
        self.write_metadata(&id, &meta).await
    }

    /// Fetch a cached block and refresh its LRU stamp.
    pub async fn get(&self, tlf: TlfId, id: BlockId) -> Result<(Vec<u8>, ServerHalf)> {
        let _counts = self.counts.lock().await;
        let Some(mut meta) = self.read_metadata(&id).await? else {
            return Err(BlockError::NoSuchBlock(id));
        };
        if meta.tlf != tlf {
            return Err(BlockError::NoSuchBlock(id));
        }
        let Some(raw) = self.block_db.get(id.as_bytes()).await? else {
            return Err(BlockError::NoSuchBlock(id));
        };
        let entry: DiskBlockCacheEntry = bincode::deserialize(&raw)?;
        if entry.buf.len() != meta.block_size as usize {
            return Err(BlockError::SizeMismatch {
                id,
                expected: meta.block_size as u64,
                actual: entry.buf.len() as u64,
            });
        }
        meta.lru_time = self.clock.now();
        self.write_metadata(&id, &meta).await?;
        Ok((entry.buf, entry.server_half))
    }

    /// Remove blocks. Returns how many were cached and the bytes freed.
    pub async fn delete(&self, ids: &[BlockId]) -> Result<(usize, u64)> {
        let mut counts = self.counts.lock().await;
        self.delete_locked(&mut counts, ids).await
    }

    async fn delete_locked(&self, counts: &mut CacheCounts, ids: &[BlockId]) -> Result<(usize, u64)> {
        let mut block_batch = WriteBatch::default();
        let mut meta_batch = WriteBatch::default();
        let mut tlf_batch = WriteBatch::default();
        let mut removed = Vec::new();

        for id in ids {
            let Some(meta) = self.read_metadata(id).await? else {
                continue;
            };
            block_batch.delete(id.as_bytes());
            meta_batch.delete(id.as_bytes());
            tlf_batch.delete(&tlf_key(&meta.tlf, id));
            removed.push(meta);
        }
        if removed.is_empty() {
            return Ok((0, 0));
        }

        self.block_db.write(block_batch).await?;
        self.meta_db.write(meta_batch).await?;
        self.tlf_db.write(tlf_batch).await?;

        let mut bytes = 0u64;
        for meta in &removed {
            counts.remove(meta.tlf, meta.block_size as u64);
            bytes += meta.block_size as u64;
        }
        self.limiter.release(bytes as i64, removed.len() as i64).await;
        Ok((removed.len(), bytes))
    }

    /// Evict about `n` of the least recently used blocks.
    pub async fn evict(&self, n: usize) -> Result<(usize, u64)> {
        let mut counts = self.counts.lock().await;
        self.evict_locked(&mut counts, None, n).await
    }

    pub async fn evict_from_tlf(&self, tlf: TlfId, n: usize) -> Result<(usize, u64)> {
        let mut counts = self.counts.lock().await;
        self.evict_locked(&mut counts, Some(tlf), n).await
    }

    async fn evict_locked(&self, counts: &mut CacheCounts, only: Option<TlfId>, n: usize) -> Result<(usize, u64)> {
        if n == 0 || counts.num_blocks == 0 {
            return Ok((0, 0));
        }
        let tlfs = match only {
            Some(tlf) => match counts.tlf_counts.get(&tlf) {
                Some(c) => vec![(tlf, *c)],
                None => return Ok((0, 0)),
            },
            None => shuffle_tlfs_weighted(&counts.tlf_counts),
        };

        let (mut removed, mut bytes) = (0, 0);
        for (tlf, tlf_count) in tlfs {
            if removed >= n {
                break;
            }
            let (r, b) = self.evict_some_from_tlf(counts, tlf, tlf_count, n - removed).await?;
            removed += r;
            bytes += b;
        }
        tracing::debug!("disk block cache evicted {} blocks ({} bytes)", removed, bytes);
        Ok((removed, bytes))
    }

    /// Sample `want * EVICTION_CONSIDERATION_FACTOR` index entries from a
    /// random pivot and remove the `want` oldest.
    async fn evict_some_from_tlf(
        &self,
        counts: &mut CacheCounts,
        tlf: TlfId,
        tlf_count: u64,
        want: usize,
    ) -> Result<(usize, u64)> {
        let num = want * EVICTION_CONSIDERATION_FACTOR;
        let pivot = if num as u64 >= tlf_count {
            BlockId::default()
        } else {
            // Leave room after the pivot for `num` entries on average.
            BlockId::random_in_range(0.0, 1.0 - num as f64 / tlf_count as f64)
        };
        let prefix = tlf.as_bytes().to_vec();
        let start = tlf_key(&tlf, &pivot);

        let mut sample = self.tlf_db.scan(&start, &prefix, num).await?;
        if sample.len() < num {
            // Wrap around to the front of this TLF's range.
            let wrapped = self.tlf_db.scan(&prefix, &prefix, num - sample.len()).await?;
            sample.extend(wrapped.into_iter().filter(|(k, _)| *k < start));
        }

        let mut broken = WriteBatch::default();
        let mut candidates = Vec::with_capacity(sample.len());
        for (key, _) in sample {
            let id = BlockId::from_slice(&key[TLF_ID_LEN..]);
            let meta = match id {
                Some(id) => self.read_metadata(&id).await.ok().flatten(),
                None => None,
            };
            match (id, meta) {
                (Some(id), Some(meta)) => candidates.push((id, meta)),
                _ => broken.delete(&key),
            }
        }
        let broken_count = broken.len();
        if broken_count > 0 {
            tracing::warn!("disk block cache: removing {} broken index entries for {}", broken_count, tlf);
            self.tlf_db.write(broken).await?;
        }

        candidates.sort_by_key(|(_, meta)| meta.lru_time);
        let to_evict: Vec<BlockId> = candidates
            .into_iter()
            .take(want.saturating_sub(broken_count))
            .map(|(id, _)| id)
            .collect();
        let (removed, bytes) = self.delete_locked(counts, &to_evict).await?;
        Ok((removed + broken_count, bytes))
    }

    /// Drop every cached block of `tlf`.
    pub async fn clear_tlf(&self, tlf: TlfId) -> Result<(usize, u64)> {
        let mut counts = self.counts.lock().await;
        let prefix = tlf.as_bytes().to_vec();
        let (mut removed, mut bytes) = (0, 0);
        loop {
            let batch = self.tlf_db.scan(&prefix, &prefix, 256).await?;
            if batch.is_empty() {
                break;
            }
            let ids: Vec<BlockId> = batch
                .iter()
                .filter_map(|(k, _)| BlockId::from_slice(&k[TLF_ID_LEN..]))
                .collect();
            let (r, b) = self.delete_locked(&mut counts, &ids).await?;
            // Index entries whose metadata is gone are not removed above.
            let mut stale = WriteBatch::default();
            for (k, _) in &batch {
                stale.delete(k);
            }
            self.tlf_db.write(stale).await?;
            removed += r;
            bytes += b;
        }
        counts.tlf_counts.remove(&tlf);
        Ok((removed, bytes))
    }

    pub async fn status(&self) -> DiskCacheStatus {
        let (num_blocks, curr_bytes, tlf_counts) = {
            let counts = self.counts.lock().await;
            let tlf_counts = counts
                .tlf_counts
                .iter()
                .map(|(tlf, c)| (tlf.to_string(), *c))
                .collect();
            (counts.num_blocks, counts.curr_bytes, tlf_counts)
        };
        DiskCacheStatus {
            num_blocks,
            curr_bytes,
            tlf_counts,
            limiter: self.limiter.status().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::limiter::StaticDiskLimiter;
    use crate::clock::TestClock;
    use std::time::Duration;

    async fn make_cache(byte_limit: i64) -> (DiskBlockCache, Arc<TestClock>) {
        let clock = Arc::new(TestClock::new(1));
        let limiter = Arc::new(StaticDiskLimiter::new(byte_limit, 1_000));
        let cache = DiskBlockCache::in_memory(limiter, clock.clone()).await.unwrap();
        (cache, clock)
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let (cache, clock) = make_cache(1 << 20).await;
        let tlf = TlfId::random();
        let id = BlockId::random();
        let half = ServerHalf([3; 32]);

        assert_eq!(cache.get(tlf, id).await.unwrap_err(), BlockError::NoSuchBlock(id));

        cache.put(tlf, id, b"encrypted", half).await.unwrap();
        let (buf, got_half) = cache.get(tlf, id).await.unwrap();
        assert_eq!(buf, b"encrypted");
        assert_eq!(got_half, half);
        assert_eq!(
            cache.get(TlfId::random(), id).await.unwrap_err(),
            BlockError::NoSuchBlock(id)
        );

        clock.add(Duration::from_secs(5));
        cache.get(tlf, id).await.unwrap();
        let meta = cache.metadata(&id).await.unwrap().unwrap();
        assert_eq!(meta.lru_time, 1 + 5_000_000_000);
        assert_eq!(meta.block_size, 9);

        assert_eq!(cache.delete(&[id, BlockId::random()]).await.unwrap(), (1, 9));
        assert!(cache.metadata(&id).await.unwrap().is_none());
        let status = cache.status().await;
        assert_eq!(status.num_blocks, 0);
        assert_eq!(status.limiter.used_bytes, 0);
    }

    #[tokio::test]
    async fn test_static_limit_evicts_to_admit() {
        let (cache, clock) = make_cache(8).await;
        let tlf = TlfId::random();
        for _ in 0..3 {
            cache.put(tlf, BlockId::random(), &[1, 2], ServerHalf::default()).await.unwrap();
            clock.add(Duration::from_secs(1));
        }
        assert_eq!(cache.status().await.curr_bytes, 6);

        let big = BlockId::random();
        cache.put(tlf, big, &[9; 4], ServerHalf::default()).await.unwrap();
        let status = cache.status().await;
        assert!(status.num_blocks < 4);
        assert!(status.curr_bytes <= 8);
        assert_eq!(cache.get(tlf, big).await.unwrap().0, vec![9; 4]);
    }

    #[tokio::test]
    async fn test_put_larger_than_limit_is_cache_full() {
        let (cache, _) = make_cache(4).await;
        let err = cache
            .put(TlfId::random(), BlockId::random(), &[0; 5], ServerHalf::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BlockError::CacheFull(_)));
        assert_eq!(cache.status().await.limiter.used_bytes, 0);
    }

    #[tokio::test]
    async fn test_size_mismatch() {
        let clock = Arc::new(TestClock::new(1));
        let block_db: Arc<dyn KvStore> = Arc::new(MemKvStore::new());
        let cache = DiskBlockCache::from_stores(
            block_db.clone(),
            Arc::new(MemKvStore::new()),
            Arc::new(MemKvStore::new()),
            Arc::new(StaticDiskLimiter::new(1 << 20, 1_000)),
            clock,
        )
        .await
        .unwrap();
        let tlf = TlfId::random();
        let id = BlockId::random();
        cache.put(tlf, id, b"abcd", ServerHalf::default()).await.unwrap();

        let truncated = DiskBlockCacheEntry {
            buf: b"ab".to_vec(),
            server_half: ServerHalf::default(),
        };
        block_db
            .put(id.as_bytes(), &bincode::serialize(&truncated).unwrap())
            .await
            .unwrap();
        assert_eq!(
            cache.get(tlf, id).await.unwrap_err(),
            BlockError::SizeMismatch {
                id,
                expected: 4,
                actual: 2
            }
        );
    }

    #[tokio::test]
    async fn test_evict_from_tlf_and_clear() {
        let (cache, clock) = make_cache(1 << 20).await;
        let (a, b) = (TlfId::random(), TlfId::random());
        let mut a_ids = Vec::new();
        for i in 0..6u8 {
            let id = BlockId::random();
            cache.put(a, id, &[i; 3], ServerHalf::default()).await.unwrap();
            a_ids.push(id);
            cache.put(b, BlockId::random(), &[i; 3], ServerHalf::default()).await.unwrap();
            clock.add(Duration::from_secs(1));
        }

        // The sample covers the whole TLF, so the two oldest go.
        assert_eq!(cache.evict_from_tlf(a, 2).await.unwrap(), (2, 6));
        assert!(cache.metadata(&a_ids[0]).await.unwrap().is_none());
        assert!(cache.metadata(&a_ids[1]).await.unwrap().is_none());
        assert!(cache.metadata(&a_ids[2]).await.unwrap().is_some());

        assert_eq!(cache.clear_tlf(a).await.unwrap(), (4, 12));
        let status = cache.status().await;
        assert_eq!(status.num_blocks, 6);
        assert_eq!(status.tlf_counts.get(&b.to_string()), Some(&6));
        assert!(!status.tlf_counts.contains_key(&a.to_string()));
    }

    #[tokio::test]
    async fn test_reopen_rebuilds_counts_and_removes_orphans() {
        let tmp = tempfile::tempdir().unwrap();
        let clock = Arc::new(TestClock::new(1));
        let tlf = TlfId::random();
        let id = BlockId::random();
        {
            let cache = DiskBlockCache::open(tmp.path(), Arc::new(StaticDiskLimiter::new(1 << 20, 100)), clock.clone())
                .await
                .unwrap();
            cache.put(tlf, id, b"keep me", ServerHalf::default()).await.unwrap();
        }

        // Bytes with no metadata, as left by an interrupted put.
        let orphan = BlockId::random();
        {
            let blocks = FileKvStore::open(tmp.path().join(BLOCK_DB_DIR)).await.unwrap();
            blocks.put(orphan.as_bytes(), b"junk").await.unwrap();
        }

        let limiter = Arc::new(StaticDiskLimiter::new(1 << 20, 100));
        let cache = DiskBlockCache::open(tmp.path(), limiter, clock).await.unwrap();
        let status = cache.status().await;
        assert_eq!(status.num_blocks, 1);
        assert_eq!(status.curr_bytes, 7);
        assert_eq!(status.limiter.used_bytes, 7);
        assert_eq!(cache.get(tlf, id).await.unwrap().0, b"keep me");

        let blocks = FileKvStore::open(tmp.path().join(BLOCK_DB_DIR)).await.unwrap();
        assert!(blocks.get(orphan.as_bytes()).await.unwrap().is_none());
    }
}
