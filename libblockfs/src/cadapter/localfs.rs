//! Local directory backend: a `BlockServer` that keeps blocks on local disk.
//!
//! Each block id maps to `root/<hex[0..2]>/<hex[2..]>`, holding the bincode
//! encoding of the stored bytes, server half and reference nonces.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tokio::{fs, io::AsyncWriteExt};

use super::client::{BlockServer, StoredBlock};
use crate::block::{BlockContext, BlockId, ReadyBlock, TlfId};
use crate::error::{BlockError, Result};

pub struct LocalFsBlockServer {
    root: PathBuf,
    // Serializes read-modify-write of reference lists.
    write_lock: Mutex<()>,
}

impl LocalFsBlockServer {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    fn path_for(&self, id: &BlockId) -> PathBuf {
        let hex = id.to_string();
        self.root.join(&hex[0..2]).join(&hex[2..])
    }

    async fn load(&self, id: &BlockId) -> Result<Option<StoredBlock>> {
        match fs::read(self.path_for(id)).await {
            Ok(buf) => Ok(Some(bincode::deserialize(&buf)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(BlockError::Server(format!("read block {id}: {e}"))),
        }
    }

    async fn store(&self, id: &BlockId, stored: &StoredBlock) -> Result<()> {
        let path = self.path_for(id);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).await?;
        }
        let data = bincode::serialize(stored)?;
        let tmp = path.with_extension("tmp");
        let mut f = fs::File::create(&tmp).await?;
        f.write_all(&data).await?;
        f.flush().await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

#[async_trait]
impl BlockServer for LocalFsBlockServer {
    async fn get(&self, tlf: TlfId, id: BlockId, _context: &BlockContext) -> Result<ReadyBlock> {
        match self.load(&id).await? {
            Some(stored) if stored.tlf == tlf => Ok(ReadyBlock {
                buf: stored.buf,
                server_half: stored.server_half,
            }),
            _ => Err(BlockError::NoSuchBlock(id)),
        }
    }

    async fn put(&self, tlf: TlfId, id: BlockId, context: &BlockContext, block: &ReadyBlock) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut stored = match self.load(&id).await? {
            Some(stored) => {
                if stored.buf != block.buf {
                    return Err(BlockError::Server(format!("conflicting bytes for block {id}")));
                }
                stored
            }
            None => StoredBlock {
                tlf,
                buf: block.buf.clone(),
                server_half: block.server_half,
                refs: Vec::new(),
            },
        };
        stored.add_ref(context.ref_nonce);
        self.store(&id, &stored).await
    }

    async fn delete(&self, _tlf: TlfId, id: BlockId, context: &BlockContext) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        let Some(mut stored) = self.load(&id).await? else {
            return Ok(0);
        };
        let left = stored.remove_ref(context.ref_nonce);
        if left == 0 {
            match fs::remove_file(self.path_for(&id)).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        } else {
            self.store(&id, &stored).await?;
        }
        Ok(left)
    }
}
