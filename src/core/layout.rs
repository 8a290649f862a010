//! Storage units and native-order byte access shared by the on-disk formats
//!
//! Every persisted integer is written in the byte order of the host that
//! wrote it. There is no endianness negotiation: a span written on a
//! little-endian host is only readable on a little-endian host.

use crate::error::FormatError;

/// Size of a device sector.
pub const DEVICE_BLOCK_SIZE: usize = 512;

/// Size of a store block; the unit for stripe lengths and metadata copies.
pub const STORE_BLOCK_SIZE: usize = 8192;

/// Bytes at the start of every span that are never interpreted.
pub const SPAN_START: u64 = (16 * DEVICE_BLOCK_SIZE) as u64;

/// Cache database format version written by this engine.
pub const CACHE_DB_MAJOR_VERSION: u16 = 24;
pub const CACHE_DB_MINOR_VERSION: u16 = 0;

/// Highest minor version accepted when reading.
pub const CACHE_DB_MAX_MINOR_VERSION: u16 = 2;

/// Bounds-checked reader over a byte slice in native byte order.
pub(crate) struct NativeReader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> NativeReader<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        NativeReader { bytes, offset: 0 }
    }

    #[cfg(test)]
    pub(crate) fn position(&self) -> usize {
        self.offset
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], FormatError> {
        let end = self.offset + N;
        if end > self.bytes.len() {
            return Err(FormatError::Truncated {
                needed: end,
                available: self.bytes.len(),
            });
        }
        let mut out = [0u8; N];
        out.copy_from_slice(&self.bytes[self.offset..end]);
        self.offset = end;
        Ok(out)
    }

    pub(crate) fn u16(&mut self) -> Result<u16, FormatError> {
        self.take::<2>().map(u16::from_ne_bytes)
    }

    pub(crate) fn u32(&mut self) -> Result<u32, FormatError> {
        self.take::<4>().map(u32::from_ne_bytes)
    }

    pub(crate) fn i32(&mut self) -> Result<i32, FormatError> {
        self.take::<4>().map(i32::from_ne_bytes)
    }

    pub(crate) fn u64(&mut self) -> Result<u64, FormatError> {
        self.take::<8>().map(u64::from_ne_bytes)
    }

    pub(crate) fn i64(&mut self) -> Result<i64, FormatError> {
        self.take::<8>().map(i64::from_ne_bytes)
    }
}

/// Append-only writer mirroring [`NativeReader`].
pub(crate) struct NativeWriter {
    bytes: Vec<u8>,
}

impl NativeWriter {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        NativeWriter {
            bytes: Vec::with_capacity(capacity),
        }
    }

    pub(crate) fn u16(&mut self, value: u16) {
        self.bytes.extend_from_slice(&value.to_ne_bytes());
    }

    pub(crate) fn u32(&mut self, value: u32) {
        self.bytes.extend_from_slice(&value.to_ne_bytes());
    }

    pub(crate) fn i32(&mut self, value: i32) {
        self.bytes.extend_from_slice(&value.to_ne_bytes());
    }

    pub(crate) fn u64(&mut self, value: u64) {
        self.bytes.extend_from_slice(&value.to_ne_bytes());
    }

    pub(crate) fn i64(&mut self, value: i64) {
        self.bytes.extend_from_slice(&value.to_ne_bytes());
    }

    pub(crate) fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// Round `bytes` up to a whole number of store blocks.
pub fn round_to_store_block(bytes: usize) -> usize {
    bytes.div_ceil(STORE_BLOCK_SIZE) * STORE_BLOCK_SIZE
}
