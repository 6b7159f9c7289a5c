//! In-memory block server for tests and single-process use.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;

use super::client::{BlockServer, StoredBlock};
use crate::block::{BlockContext, BlockId, ReadyBlock, TlfId};
use crate::error::{BlockError, Result};

#[derive(Default)]
pub struct MemBlockServer {
    blocks: RwLock<HashMap<BlockId, StoredBlock>>,
    gets: AtomicUsize,
    puts: AtomicUsize,
}

impl MemBlockServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `get` calls served, hits and misses alike.
    pub fn get_count(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub async fn contains(&self, id: &BlockId) -> bool {
        self.blocks.read().await.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.blocks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl BlockServer for MemBlockServer {
    async fn get(&self, tlf: TlfId, id: BlockId, _context: &BlockContext) -> Result<ReadyBlock> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        let blocks = self.blocks.read().await;
        match blocks.get(&id) {
            Some(stored) if stored.tlf == tlf => Ok(ReadyBlock {
                buf: stored.buf.clone(),
                server_half: stored.server_half,
            }),
            _ => Err(BlockError::NoSuchBlock(id)),
        }
    }

    async fn put(&self, tlf: TlfId, id: BlockId, context: &BlockContext, block: &ReadyBlock) -> Result<()> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        let mut blocks = self.blocks.write().await;
        let stored = blocks.entry(id).or_insert_with(|| StoredBlock {
            tlf,
            buf: block.buf.clone(),
            server_half: block.server_half,
            refs: Vec::new(),
        });
        if stored.buf != block.buf {
            return Err(BlockError::Server(format!("conflicting bytes for block {id}")));
        }
        stored.add_ref(context.ref_nonce);
        Ok(())
    }

    async fn delete(&self, _tlf: TlfId, id: BlockId, context: &BlockContext) -> Result<usize> {
        let mut blocks = self.blocks.write().await;
        let Some(stored) = blocks.get_mut(&id) else {
            return Ok(0);
        };
        let left = stored.remove_ref(context.ref_nonce);
        if left == 0 {
            blocks.remove(&id);
        }
        Ok(left)
    }
}
