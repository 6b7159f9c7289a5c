//! In-memory cache of clean (committed) blocks, keyed by block id.

use moka::future::Cache;
use std::sync::Arc;

use crate::block::{Block, BlockId};

#[derive(Clone)]
pub struct BlockCache {
    cache: Cache<BlockId, Arc<Block>>,
}

impl BlockCache {
    pub fn new(capacity: u64) -> Self {
        Self {
            cache: Cache::builder().max_capacity(capacity).build(),
        }
    }

    pub async fn get(&self, id: &BlockId) -> Option<Arc<Block>> {
        self.cache.get(id).await
    }

    pub async fn put(&self, id: BlockId, block: Arc<Block>) {
        self.cache.insert(id, block).await;
    }

    pub async fn remove(&self, id: &BlockId) {
        self.cache.invalidate(id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::FileBlock;

    #[tokio::test]
    async fn test_put_get_remove() {
        let cache = BlockCache::new(16);
        let id = BlockId::random();
        assert!(cache.get(&id).await.is_none());

        let block = Arc::new(Block::File(FileBlock::direct(vec![1, 2, 3])));
        cache.put(id, block.clone()).await;
        let got = cache.get(&id).await.unwrap();
        assert!(Arc::ptr_eq(&got, &block));

        cache.remove(&id).await;
        assert!(cache.get(&id).await.is_none());
    }
}
