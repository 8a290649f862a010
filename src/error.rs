//! Error types for span and stripe operations

use crate::core::key::CacheKey;
use thiserror::Error;

/// Problems with the persisted representation of a span or stripe.
///
/// A format error on a single redundant copy is not fatal; it only becomes
/// fatal for a stripe when no usable header/footer pair remains.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    #[error("Bad magic number: expected {expected:#010x}, found {found:#010x}")]
    BadMagic { expected: u32, found: u32 },

    #[error("Truncated structure: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("Inconsistent span counts: {used} used + {free} free != {total} stripe spans")]
    InconsistentCounts { used: u32, free: u32, total: u32 },

    #[error("Stripe span {index} offset {offset} is not aligned to the store block size")]
    MisalignedStripe { index: usize, offset: u64 },

    #[error("Stripe span {index} is in use but has zero length")]
    EmptyStripe { index: usize },

    #[error("Stripe span {index} at offset {offset} with {len} blocks runs past the end of the span")]
    StripeOutOfRange { index: usize, offset: u64, len: u64 },

    #[error("Unsupported stripe format version: {major}.{minor}")]
    UnsupportedVersion { major: u16, minor: u16 },

    #[error("Stripe descriptor has a zero generation token")]
    ZeroGeneration,

    #[error("No valid header/footer pair found in any stripe descriptor copy")]
    StripeUnreadable,
}

/// Errors surfaced by the storage engine.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Format error: {0}")]
    Format(#[from] FormatError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Admission control rejected a write; the caller may retry later.
    #[error("Write backlog exceeded on stripe {stripe}: {backlog} bytes pending, limit {threshold}")]
    WriteBacklogExceeded {
        stripe: usize,
        backlog: u64,
        threshold: u64,
    },

    /// Caller invariant violation: the request already holds an open entry.
    #[error("Duplicate open entry for key {key} on stripe {stripe}")]
    DuplicateOpenEntry { stripe: usize, key: CacheKey },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl CacheError {
    /// True for business-rule rejections that a caller may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CacheError::WriteBacklogExceeded { .. })
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;
