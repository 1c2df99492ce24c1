use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};
use xxhash_rust::xxh3::Xxh3;

use super::{PenumbraError, Result};

/// Width of a chunk hash in bytes.
pub const HASH_LEN: usize = 16;

const SEQUENTIAL_TAG: [u8; 8] = *b"\0seqhash";
const TEMP_TAG: [u8; 8] = [0xff; 8];

/// Content identity of a chunk.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Hash([u8; HASH_LEN]);

impl Hash {
    /// Sentinel naming the empty B-tree; never stored as a chunk key.
    pub const EMPTY: Hash = Hash([0; HASH_LEN]);

    /// Wraps raw digest bytes.
    pub const fn from_bytes(bytes: [u8; HASH_LEN]) -> Self {
        Hash(bytes)
    }

    /// Raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    /// True for [`Hash::EMPTY`].
    pub fn is_empty(&self) -> bool {
        self.0 == [0; HASH_LEN]
    }

    /// Digest of a chunk payload and its outgoing references.
    pub fn of_content(data: &[u8], refs: &[Hash]) -> Hash {
        let mut hasher = Xxh3::new();
        hasher.update(&(data.len() as u64).to_le_bytes());
        hasher.update(data);
        for r in refs {
            hasher.update(&r.0);
        }
        Hash(hasher.digest128().to_be_bytes())
    }

    pub(crate) fn sequential(n: u64) -> Hash {
        Self::tagged(SEQUENTIAL_TAG, n)
    }

    /// Placeholder for B-tree nodes that only exist inside an unflushed write.
    pub(crate) fn temp(n: u64) -> Hash {
        Self::tagged(TEMP_TAG, n)
    }

    pub(crate) fn is_temp(&self) -> bool {
        self.0[..8] == TEMP_TAG
    }

    fn tagged(tag: [u8; 8], n: u64) -> Hash {
        let mut bytes = [0u8; HASH_LEN];
        bytes[..8].copy_from_slice(&tag);
        bytes[8..].copy_from_slice(&n.to_be_bytes());
        Hash(bytes)
    }

    /// Parses the lowercase hex form produced by `Display`.
    pub fn parse(s: &str) -> Result<Hash> {
        let mut bytes = [0u8; HASH_LEN];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|_| PenumbraError::InvalidArgument(format!("invalid hash '{s}'")))?;
        Ok(Hash(bytes))
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({self})")
    }
}

impl FromStr for Hash {
    type Err = PenumbraError;

    fn from_str(s: &str) -> Result<Self> {
        Hash::parse(s)
    }
}

impl Serialize for Hash {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct HashVisitor;

        impl Visitor<'_> for HashVisitor {
            type Value = Hash;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a 32 character hex hash")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Hash, E> {
                Hash::parse(v).map_err(E::custom)
            }
        }

        deserializer.deserialize_str(HashVisitor)
    }
}

/// Strategy used to name new chunks.
///
/// `Content` is the production mode. `Sequential` hands out increasing ids
/// and is only meant for tests that want predictable hashes; clones share
/// one counter so every store built from the same hasher stays collision free.
#[derive(Clone, Debug, Default)]
pub enum ChunkHasher {
    /// xxh3-128 over payload and refs.
    #[default]
    Content,
    /// Monotonic test ids.
    Sequential(Arc<AtomicU64>),
}

impl ChunkHasher {
    /// A fresh sequential hasher starting at 1.
    pub fn sequential() -> Self {
        ChunkHasher::Sequential(Arc::new(AtomicU64::new(0)))
    }

    /// Names a chunk with the given payload and refs.
    pub fn hash(&self, data: &[u8], refs: &[Hash]) -> Hash {
        match self {
            ChunkHasher::Content => Hash::of_content(data, refs),
            ChunkHasher::Sequential(counter) => {
                Hash::sequential(counter.fetch_add(1, Ordering::Relaxed) + 1)
            }
        }
    }
}
