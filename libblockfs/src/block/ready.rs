//! Readying turns a plaintext block into the encrypted bytes that get
//! uploaded, and derives the block's final pointer from them. `decode` is
//! the inverse applied to fetched bytes.

use std::sync::Arc;

use super::pointer::{BlockContext, BlockInfo, BlockPointer, UserId};
use super::types::Block;
use crate::crypto::{BincodeCodec, Codec, Crypto, KeyMetadata, ServerHalf, Sha256Crypto};
use crate::error::{BlockError, Result};

/// Encrypted block bytes plus the key material needed to decrypt them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadyBlock {
    pub buf: Vec<u8>,
    pub server_half: ServerHalf,
}

impl ReadyBlock {
    pub fn encoded_size(&self) -> u32 {
        self.buf.len() as u32
    }
}

#[derive(Clone)]
pub struct BlockReadier {
    codec: Arc<dyn Codec>,
    crypto: Arc<dyn Crypto>,
}

impl Default for BlockReadier {
    fn default() -> Self {
        Self::new(Arc::new(BincodeCodec), Arc::new(Sha256Crypto))
    }
}

impl BlockReadier {
    pub fn new(codec: Arc<dyn Codec>, crypto: Arc<dyn Crypto>) -> Self {
        Self { codec, crypto }
    }

    /// Encode, encrypt under the latest key generation with a fresh server
    /// half, and hash the ciphertext into the final block id.
    pub fn ready(&self, kmd: &dyn KeyMetadata, user: UserId, block: &Block) -> Result<(BlockInfo, ReadyBlock)> {
        let plain = self.codec.encode_block(block)?;
        let key_gen = kmd.latest_key_gen();
        let key = kmd.crypt_key(key_gen)?;
        let server_half = self.crypto.make_server_half();
        let buf = self.crypto.encrypt_block(&key, &server_half, &plain);
        let ptr = BlockPointer {
            id: self.crypto.hash(&buf),
            key_gen,
            data_ver: block.data_version(),
            context: BlockContext::first_ref(user),
        };
        let ready = ReadyBlock { buf, server_half };
        let info = BlockInfo {
            ptr,
            encoded_size: ready.encoded_size(),
        };
        Ok((info, ready))
    }

    /// Verify and decode fetched bytes for `ptr`.
    pub fn decode(&self, kmd: &dyn KeyMetadata, ptr: &BlockPointer, ready: &ReadyBlock) -> Result<Block> {
        if self.crypto.hash(&ready.buf) != ptr.id {
            return Err(BlockError::Verification {
                id: ptr.id,
                reason: "content hash mismatch".into(),
            });
        }
        let key = kmd.crypt_key(ptr.key_gen)?;
        let plain = self
            .crypto
            .decrypt_block(&key, &ready.server_half, &ready.buf)
            .ok_or_else(|| BlockError::Verification {
                id: ptr.id,
                reason: "decryption failed".into(),
            })?;
        let mut block = self.codec.decode_block(&plain)?;
        block.set_encoded_size(ready.encoded_size());
        Ok(block)
    }
}
