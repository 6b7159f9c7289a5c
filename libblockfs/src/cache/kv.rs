//! Ordered key-value stores backing the disk block cache.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tokio::{fs, io::AsyncWriteExt};

use crate::error::{BlockError, Result};

pub enum BatchOp {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

#[derive(Default)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        self.ops.push(BatchOp::Put(key.to_vec(), value.to_vec()));
    }

    pub fn delete(&mut self, key: &[u8]) {
        self.ops.push(BatchOp::Delete(key.to_vec()));
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }
}

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Apply every op in order while holding the store's write lock.
    async fn write(&self, batch: WriteBatch) -> Result<()>;

    /// Up to `limit` entries with key >= `start` that begin with `prefix`,
    /// in key order.
    async fn scan(&self, start: &[u8], prefix: &[u8], limit: usize) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    async fn keys(&self) -> Result<Vec<Vec<u8>>>;

    async fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::default();
        batch.put(key, value);
        self.write(batch).await
    }

    async fn delete(&self, key: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::default();
        batch.delete(key);
        self.write(batch).await
    }
}

#[derive(Default)]
pub struct MemKvStore {
    map: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemKvStore {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.map.read().await.get(key).cloned())
    }

    async fn write(&self, batch: WriteBatch) -> Result<()> {
        let mut map = self.map.write().await;
        for op in batch.ops {
            match op {
                BatchOp::Put(k, v) => {
                    map.insert(k, v);
                }
                BatchOp::Delete(k) => {
                    map.remove(&k);
                }
            }
        }
        Ok(())
    }

    async fn scan(&self, start: &[u8], prefix: &[u8], limit: usize) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let map = self.map.read().await;
        Ok(map
            .range(start.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .take(limit)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn keys(&self) -> Result<Vec<Vec<u8>>> {
        Ok(self.map.read().await.keys().cloned().collect())
    }
}

/// One file per key under `root/<hex[0..2]>/<hex>`, with the key set held
/// in memory for ordered scans.
pub struct FileKvStore {
    root: PathBuf,
    index: RwLock<BTreeSet<Vec<u8>>>,
}

impl FileKvStore {
    pub async fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        let mut index = BTreeSet::new();

        let mut shards = fs::read_dir(&root).await?;
        while let Some(shard) = shards.next_entry().await? {
            if !shard.file_type().await?.is_dir() {
                continue;
            }
            let mut files = fs::read_dir(shard.path()).await?;
            while let Some(file) = files.next_entry().await? {
                let name = file.file_name();
                let Some(name) = name.to_str() else {
                    continue;
                };
                if name.ends_with(".tmp") {
                    // Interrupted write.
                    let _ = fs::remove_file(file.path()).await;
                    continue;
                }
                match hex::decode(name) {
                    Ok(key) => {
                        index.insert(key);
                    }
                    Err(_) => tracing::warn!("ignoring stray file {:?} in {:?}", name, root),
                }
            }
        }

        Ok(Self {
            root,
            index: RwLock::new(index),
        })
    }

    fn path_for(&self, key: &[u8]) -> Result<PathBuf> {
        if key.is_empty() {
            return Err(BlockError::Io("empty key".into()));
        }
        let hex = hex::encode(key);
        Ok(self.root.join(&hex[0..2]).join(hex))
    }

    async fn write_file(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).await?;
        }
        let tmp = path.with_extension("tmp");
        let mut f = fs::File::create(&tmp).await?;
        f.write_all(value).await?;
        f.flush().await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn remove_file(&self, key: &[u8]) -> Result<()> {
        match fs::remove_file(self.path_for(key)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_file(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match fs::read(self.path_for(key)?).await {
            Ok(buf) => Ok(Some(buf)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl KvStore for FileKvStore {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if !self.index.read().await.contains(key) {
            return Ok(None);
        }
        self.read_file(key).await
    }

    async fn write(&self, batch: WriteBatch) -> Result<()> {
        let mut index = self.index.write().await;
        for op in batch.ops {
            match op {
                BatchOp::Put(k, v) => {
                    self.write_file(&k, &v).await?;
                    index.insert(k);
                }
                BatchOp::Delete(k) => {
                    self.remove_file(&k).await?;
                    index.remove(&k);
                }
            }
        }
        Ok(())
    }

    async fn scan(&self, start: &[u8], prefix: &[u8], limit: usize) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let keys: Vec<Vec<u8>> = {
            let index = self.index.read().await;
            index
                .range(start.to_vec()..)
                .take_while(|k| k.starts_with(prefix))
                .take(limit)
                .cloned()
                .collect()
        };
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = self.read_file(&key).await? {
                out.push((key, value));
            }
        }
        Ok(out)
    }

    async fn keys(&self) -> Result<Vec<Vec<u8>>> {
        Ok(self.index.read().await.iter().cloned().collect())
    }
}
