//! Block server interface consumed by the retrieval queue and the sync
//! engine, plus a retrying client wrapper.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::{Duration, sleep};

use crate::block::{BlockContext, BlockId, ReadyBlock, RefNonce, TlfId};
use crate::crypto::ServerHalf;
use crate::error::Result;

#[async_trait]
pub trait BlockServer: Send + Sync {
    async fn get(&self, tlf: TlfId, id: BlockId, context: &BlockContext) -> Result<ReadyBlock>;

    /// Store the bytes (if new) and add the reference in `context`.
    async fn put(&self, tlf: TlfId, id: BlockId, context: &BlockContext, block: &ReadyBlock) -> Result<()>;

    /// Drop the reference in `context`; returns how many remain. The bytes
    /// are removed with the last reference.
    async fn delete(&self, tlf: TlfId, id: BlockId, context: &BlockContext) -> Result<usize>;
}

/// What a server keeps for one block id.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct StoredBlock {
    pub tlf: TlfId,
    pub buf: Vec<u8>,
    pub server_half: ServerHalf,
    pub refs: Vec<RefNonce>,
}

impl StoredBlock {
    pub fn add_ref(&mut self, nonce: RefNonce) {
        if !self.refs.contains(&nonce) {
            self.refs.push(nonce);
        }
    }

    pub fn remove_ref(&mut self, nonce: RefNonce) -> usize {
        self.refs.retain(|r| *r != nonce);
        self.refs.len()
    }
}

/// Retry policy for `BlockServerClient`.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_retry_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_retry_delay_ms: 100,
        }
    }
}

/// Wraps a backend and retries recoverable failures with exponential
/// backoff. Non-recoverable errors are returned at once.
pub struct BlockServerClient<B: BlockServer> {
    backend: B,
    config: RetryConfig,
}

impl<B: BlockServer> BlockServerClient<B> {
    pub fn new(backend: B, config: RetryConfig) -> Self {
        Self { backend, config }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    async fn execute_with_retry<T, F, Fut>(&self, operation: F, operation_name: &'static str) -> Result<T>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: std::future::Future<Output = Result<T>> + Send,
        T: Send,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) if e.is_recoverable() && attempt <= self.config.max_retries => {
                    let delay_ms = self.config.initial_retry_delay_ms * 2u64.pow(attempt - 1);
                    tracing::debug!("{operation_name} failed (attempt {attempt}): {e}; retrying in {delay_ms}ms");
                    sleep(Duration::from_millis(delay_ms)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl<B: BlockServer> BlockServer for BlockServerClient<B> {
    async fn get(&self, tlf: TlfId, id: BlockId, context: &BlockContext) -> Result<ReadyBlock> {
        self.execute_with_retry(|| self.backend.get(tlf, id, context), "get")
            .await
    }

    async fn put(&self, tlf: TlfId, id: BlockId, context: &BlockContext, block: &ReadyBlock) -> Result<()> {
        self.execute_with_retry(|| self.backend.put(tlf, id, context, block), "put")
            .await
    }

    async fn delete(&self, tlf: TlfId, id: BlockId, context: &BlockContext) -> Result<usize> {
        self.execute_with_retry(|| self.backend.delete(tlf, id, context), "delete")
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::UserId;
    use crate::cadapter::memory::MemBlockServer;
    use crate::error::BlockError;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` puts with a recoverable error.
    struct Flaky {
        inner: MemBlockServer,
        failures: AtomicU32,
    }

    #[async_trait]
    impl BlockServer for Flaky {
        async fn get(&self, tlf: TlfId, id: BlockId, context: &BlockContext) -> Result<ReadyBlock> {
            self.inner.get(tlf, id, context).await
        }

        async fn put(&self, tlf: TlfId, id: BlockId, context: &BlockContext, block: &ReadyBlock) -> Result<()> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(BlockError::Server("try again".into()));
            }
            self.inner.put(tlf, id, context, block).await
        }

        async fn delete(&self, tlf: TlfId, id: BlockId, context: &BlockContext) -> Result<usize> {
            self.inner.delete(tlf, id, context).await
        }
    }

    #[tokio::test]
    async fn test_client_retries_recoverable_errors() {
        let flaky = Flaky {
            inner: MemBlockServer::new(),
            failures: AtomicU32::new(2),
        };
        let client = BlockServerClient::new(
            flaky,
            RetryConfig {
                max_retries: 3,
                initial_retry_delay_ms: 1,
            },
        );
        let tlf = TlfId::random();
        let id = BlockId::random();
        let ctx = BlockContext::first_ref(UserId::default());
        let block = ReadyBlock {
            buf: vec![1, 2, 3],
            server_half: ServerHalf::default(),
        };
        client.put(tlf, id, &ctx, &block).await.unwrap();
        assert_eq!(client.get(tlf, id, &ctx).await.unwrap(), block);

        // Misses are returned at once; there is nothing to retry against.
        let missing = BlockId::random();
        let err = client.get(tlf, missing, &ctx).await.unwrap_err();
        assert_eq!(err, BlockError::NoSuchBlock(missing));
    }

    #[tokio::test]
    async fn test_client_gives_up() {
        let flaky = Flaky {
            inner: MemBlockServer::new(),
            failures: AtomicU32::new(10),
        };
        let client = BlockServerClient::new(
            flaky,
            RetryConfig {
                max_retries: 2,
                initial_retry_delay_ms: 1,
            },
        );
        let block = ReadyBlock {
            buf: vec![9],
            server_half: ServerHalf::default(),
        };
        let err = client
            .put(TlfId::random(), BlockId::random(), &BlockContext::first_ref(UserId::default()), &block)
            .await
            .unwrap_err();
        assert!(err.is_recoverable());
        assert_eq!(client.backend().failures.load(Ordering::SeqCst), 7);
    }
}
