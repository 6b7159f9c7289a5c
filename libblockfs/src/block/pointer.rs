//! Block identities: ids, contexts, pointers and infos.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const BLOCK_ID_LEN: usize = 32;
pub const TLF_ID_LEN: usize = 16;

/// Content-derived block identity (SHA-256 of the encrypted bytes).
/// Temporary ids handed out to unfinalized blocks are random.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId([u8; BLOCK_ID_LEN]);

impl BlockId {
    pub fn new(bytes: [u8; BLOCK_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; BLOCK_ID_LEN] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; BLOCK_ID_LEN] {
        &self.0
    }

    pub fn random() -> Self {
        let mut bytes = [0u8; BLOCK_ID_LEN];
        rand::rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Random id whose position in the id space, read as a fraction of the
    /// whole space, falls in `[start, end)`. Used to pick eviction pivots.
    pub fn random_in_range(start: f64, end: f64) -> Self {
        let start = start.clamp(0.0, 1.0);
        let end = end.clamp(start, 1.0);
        let frac = start + rand::random::<f64>() * (end - start);
        let prefix = (frac * u64::MAX as f64) as u64;
        let mut bytes = [0u8; BLOCK_ID_LEN];
        rand::rng().fill_bytes(&mut bytes[8..]);
        bytes[..8].copy_from_slice(&prefix.to_be_bytes());
        Self(bytes)
    }

    pub fn max() -> Self {
        Self([0xff; BLOCK_ID_LEN])
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form keeps pointer dumps readable.
        write!(f, "BlockId({})", &hex::encode(self.0)[..12])
    }
}

/// Top-level folder id.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TlfId([u8; TLF_ID_LEN]);

impl TlfId {
    pub fn new(bytes: [u8; TLF_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; TLF_ID_LEN] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    pub fn random() -> Self {
        let mut bytes = [0u8; TLF_ID_LEN];
        rand::rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; TLF_ID_LEN] {
        &self.0
    }
}

impl fmt::Display for TlfId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for TlfId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TlfId({})", hex::encode(self.0))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub [u8; 16]);

pub type KeyGen = u32;
pub const FIRST_VALID_KEY_GEN: KeyGen = 1;

pub type DataVer = u32;
pub const FIRST_VALID_DATA_VER: DataVer = 1;

/// Distinguishes references that share the same block bytes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RefNonce(pub [u8; 8]);

pub const ZERO_REF_NONCE: RefNonce = RefNonce([0; 8]);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockContext {
    pub creator: UserId,
    pub writer: UserId,
    pub ref_nonce: RefNonce,
}

impl BlockContext {
    pub fn first_ref(user: UserId) -> Self {
        Self {
            creator: user,
            writer: user,
            ref_nonce: ZERO_REF_NONCE,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockPointer {
    pub id: BlockId,
    pub key_gen: KeyGen,
    pub data_ver: DataVer,
    pub context: BlockContext,
}

impl BlockPointer {
    /// Pointer for a block that has not been readied yet.
    pub fn temporary(key_gen: KeyGen, user: UserId) -> Self {
        Self {
            id: BlockId::random(),
            key_gen,
            data_ver: FIRST_VALID_DATA_VER,
            context: BlockContext::first_ref(user),
        }
    }
}

impl fmt::Display for BlockPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.key_gen)
    }
}

/// A pointer plus its committed encoded size. Zero size marks a block that
/// only has a temporary identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockInfo {
    pub ptr: BlockPointer,
    pub encoded_size: u32,
}

impl BlockInfo {
    pub fn unfinalized(ptr: BlockPointer) -> Self {
        Self {
            ptr,
            encoded_size: 0,
        }
    }

    pub fn is_committed(&self) -> bool {
        self.encoded_size > 0
    }
}
