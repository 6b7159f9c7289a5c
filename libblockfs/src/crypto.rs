//! Codec, crypto provider and key lookup used to ready and verify blocks.
//!
//! `Sha256Crypto` is a reference provider for tests and the demo: a
//! SHA-256 keystream with a SHA-256 tag. It stands in for the real cipher,
//! which lives outside this crate.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::block::{Block, BlockId, KeyGen, TlfId, FIRST_VALID_KEY_GEN};
use crate::error::{BlockError, Result};

const TAG_LEN: usize = 32;

/// Per-block key material stored next to the block bytes.
#[derive(Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerHalf(pub [u8; 32]);

impl std::fmt::Debug for ServerHalf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ServerHalf(..)")
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct TlfCryptKey(pub [u8; 32]);

impl std::fmt::Debug for TlfCryptKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TlfCryptKey(..)")
    }
}

pub trait Codec: Send + Sync {
    fn encode_block(&self, block: &Block) -> Result<Vec<u8>>;
    fn decode_block(&self, buf: &[u8]) -> Result<Block>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BincodeCodec;

impl Codec for BincodeCodec {
    fn encode_block(&self, block: &Block) -> Result<Vec<u8>> {
        Ok(bincode::serialize(block)?)
    }

    fn decode_block(&self, buf: &[u8]) -> Result<Block> {
        Ok(bincode::deserialize(buf)?)
    }
}

pub trait Crypto: Send + Sync {
    fn make_server_half(&self) -> ServerHalf;
    fn encrypt_block(&self, key: &TlfCryptKey, half: &ServerHalf, plain: &[u8]) -> Vec<u8>;
    /// `None` when the ciphertext does not authenticate under this key.
    fn decrypt_block(&self, key: &TlfCryptKey, half: &ServerHalf, cipher: &[u8]) -> Option<Vec<u8>>;
    fn hash(&self, buf: &[u8]) -> BlockId;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Sha256Crypto;

impl Sha256Crypto {
    fn block_key(key: &TlfCryptKey, half: &ServerHalf) -> [u8; 32] {
        let mut h = Sha256::new();
        h.update(b"block-key");
        h.update(key.0);
        h.update(half.0);
        h.finalize().into()
    }

    fn apply_keystream(block_key: &[u8; 32], buf: &mut [u8]) {
        for (i, chunk) in buf.chunks_mut(32).enumerate() {
            let mut h = Sha256::new();
            h.update(block_key);
            h.update((i as u64).to_le_bytes());
            let pad = h.finalize();
            for (b, p) in chunk.iter_mut().zip(pad.iter()) {
                *b ^= p;
            }
        }
    }

    fn tag(block_key: &[u8; 32], body: &[u8]) -> [u8; TAG_LEN] {
        let mut h = Sha256::new();
        h.update(b"tag");
        h.update(block_key);
        h.update(body);
        h.finalize().into()
    }
}

impl Crypto for Sha256Crypto {
    fn make_server_half(&self) -> ServerHalf {
        let mut half = [0u8; 32];
        rand::rng().fill_bytes(&mut half);
        ServerHalf(half)
    }

    fn encrypt_block(&self, key: &TlfCryptKey, half: &ServerHalf, plain: &[u8]) -> Vec<u8> {
        let bk = Self::block_key(key, half);
        let mut body = plain.to_vec();
        Self::apply_keystream(&bk, &mut body);
        let mut out = Vec::with_capacity(TAG_LEN + body.len());
        out.extend_from_slice(&Self::tag(&bk, &body));
        out.extend_from_slice(&body);
        out
    }

    fn decrypt_block(&self, key: &TlfCryptKey, half: &ServerHalf, cipher: &[u8]) -> Option<Vec<u8>> {
        if cipher.len() < TAG_LEN {
            return None;
        }
        let bk = Self::block_key(key, half);
        let (tag, body) = cipher.split_at(TAG_LEN);
        if Self::tag(&bk, body).as_slice() != tag {
            return None;
        }
        let mut plain = body.to_vec();
        Self::apply_keystream(&bk, &mut plain);
        Some(plain)
    }

    fn hash(&self, buf: &[u8]) -> BlockId {
        BlockId::new(Sha256::digest(buf).into())
    }
}

/// Key lookup for one TLF.
pub trait KeyMetadata: Send + Sync {
    fn tlf_id(&self) -> TlfId;
    fn latest_key_gen(&self) -> KeyGen;
    fn crypt_key(&self, key_gen: KeyGen) -> Result<TlfCryptKey>;
}

/// In-process key set: generation `n` is `keys[n - 1]`.
#[derive(Clone)]
pub struct TlfKeys {
    tlf: TlfId,
    keys: Vec<TlfCryptKey>,
}

impl TlfKeys {
    pub fn new(tlf: TlfId, first: TlfCryptKey) -> Self {
        Self {
            tlf,
            keys: vec![first],
        }
    }

    pub fn random(tlf: TlfId) -> Self {
        let mut key = [0u8; 32];
        rand::rng().fill_bytes(&mut key);
        Self::new(tlf, TlfCryptKey(key))
    }

    pub fn rekey(&mut self, key: TlfCryptKey) -> KeyGen {
        self.keys.push(key);
        self.latest_key_gen()
    }
}

impl KeyMetadata for TlfKeys {
    fn tlf_id(&self) -> TlfId {
        self.tlf
    }

    fn latest_key_gen(&self) -> KeyGen {
        self.keys.len() as KeyGen
    }

    fn crypt_key(&self, key_gen: KeyGen) -> Result<TlfCryptKey> {
        if key_gen < FIRST_VALID_KEY_GEN {
            return Err(BlockError::UnknownKeyGen(key_gen));
        }
        self.keys
            .get((key_gen - FIRST_VALID_KEY_GEN) as usize)
            .copied()
            .ok_or(BlockError::UnknownKeyGen(key_gen))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::FileBlock;

    #[test]
    fn test_encrypt_decrypt() {
        let crypto = Sha256Crypto;
        let keys = TlfKeys::random(TlfId::random());
        let key = keys.crypt_key(1).unwrap();
        let half = crypto.make_server_half();

        let plain = vec![42u8; 100];
        let cipher = crypto.encrypt_block(&key, &half, &plain);
        assert_ne!(&cipher[TAG_LEN..], plain.as_slice());
        assert_eq!(crypto.decrypt_block(&key, &half, &cipher), Some(plain));

        let other = crypto.make_server_half();
        assert_eq!(crypto.decrypt_block(&key, &other, &cipher), None);

        let mut tampered = cipher.clone();
        tampered[TAG_LEN + 3] ^= 1;
        assert_eq!(crypto.decrypt_block(&key, &half, &tampered), None);
    }

    #[test]
    fn test_key_generations() {
        let mut keys = TlfKeys::random(TlfId::random());
        assert_eq!(keys.latest_key_gen(), 1);
        assert_eq!(keys.rekey(TlfCryptKey([7; 32])), 2);
        assert!(keys.crypt_key(2).is_ok());
        assert_eq!(keys.crypt_key(0), Err(BlockError::UnknownKeyGen(0)));
        assert_eq!(keys.crypt_key(3), Err(BlockError::UnknownKeyGen(3)));
    }

    #[test]
    fn test_codec_round_trip() {
        let codec = BincodeCodec;
        let block = Block::File(FileBlock::direct(b"hello".to_vec()));
        let buf = codec.encode_block(&block).unwrap();
        assert_eq!(codec.decode_block(&buf).unwrap(), block);
        assert!(codec.decode_block(&[0xff; 3]).is_err());
    }
}
