#![forbid(unsafe_code)]

use super::Hash;

/// CRC32 stored beside every chunk payload in the durable store.
pub fn chunk_crc32(hash: &Hash, refs: &[Hash], payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(hash.as_bytes());
    for r in refs {
        hasher.update(r.as_bytes());
    }
    hasher.update(payload);
    hasher.finalize()
}
