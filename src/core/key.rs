//! Content keys

use serde::Serialize;
use std::fmt;
use xxhash_rust::xxh3::xxh3_128;

/// 128-bit key identifying a cached object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CacheKey([u8; 16]);

impl CacheKey {
    pub const fn from_raw(bytes: [u8; 16]) -> Self {
        CacheKey(bytes)
    }

    /// Hash arbitrary content (typically a normalized URL) into a key.
    pub fn hash(data: &[u8]) -> Self {
        CacheKey(xxh3_128(data).to_le_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Low 32 bits, used for bucket selection and log output.
    pub fn slice32(&self) -> u32 {
        u32::from_le_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}
