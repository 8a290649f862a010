//! Span header format
//!
//! A span is a raw storage region (file, partition or whole device). Its
//! header lives at [`SPAN_START`](crate::core::layout::SPAN_START) and is
//! followed by a variable-length directory of stripe spans.
//!
//! ```text
//! offset  size  field
//! 0       4     magic (0xABCD1237)
//! 4       4     n_stripes       distinct volumes
//! 8       4     n_free          free stripe spans
//! 12      4     n_used          stripe spans in use
//! 16      4     n_stripe_spans  directory entries
//! 20      4     padding
//! 24      8     n_storage_blocks
//! 32      24*n  stripe span descriptors
//! ```

use crate::core::layout::{NativeReader, NativeWriter, STORE_BLOCK_SIZE};
use crate::error::FormatError;
use serde::Serialize;

/// Magic number marking an initialized span header.
pub const SPAN_MAGIC: u32 = 0xABCD_1237;

/// Size of the fixed part of the span header.
pub const SPAN_HEADER_FIXED_LEN: usize = 32;

/// Size of one serialized stripe span descriptor.
pub const STRIPE_SPAN_DESCRIPTOR_LEN: usize = 24;

const TYPE_MASK: u32 = 0b111;
const FREE_BIT: u32 = 1 << 3;

/// A section of a span that holds (or could hold) a stripe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StripeSpanDescriptor {
    /// Byte offset of the stripe from the start of the span
    pub offset: u64,
    /// Length in store blocks
    pub len: u64,
    /// Volume index when in use
    pub number: i32,
    /// Raw bitfield word: type in bits 0..3, free flag in bit 3.
    /// Remaining bits are kept untouched so re-serialization is exact.
    #[serde(skip)]
    bits: u32,
}

impl StripeSpanDescriptor {
    pub fn new(offset: u64, len: u64, number: i32, stripe_type: u8, free: bool) -> Self {
        let mut bits = u32::from(stripe_type) & TYPE_MASK;
        if free {
            bits |= FREE_BIT;
        }
        StripeSpanDescriptor {
            offset,
            len,
            number,
            bits,
        }
    }

    /// 3-bit type tag
    pub fn stripe_type(&self) -> u8 {
        (self.bits & TYPE_MASK) as u8
    }

    pub fn is_free(&self) -> bool {
        self.bits & FREE_BIT != 0
    }

    /// Length in bytes, `None` when it does not fit in a `u64`
    pub fn len_bytes(&self) -> Option<u64> {
        self.len.checked_mul(STORE_BLOCK_SIZE as u64)
    }

    /// First byte past the stripe
    pub fn end(&self) -> Option<u64> {
        self.len_bytes()?.checked_add(self.offset)
    }

    fn read(reader: &mut NativeReader<'_>) -> Result<Self, FormatError> {
        Ok(StripeSpanDescriptor {
            offset: reader.u64()?,
            len: reader.u64()?,
            number: reader.i32()?,
            bits: reader.u32()?,
        })
    }

    fn write(&self, writer: &mut NativeWriter) {
        writer.u64(self.offset);
        writer.u64(self.len);
        writer.i32(self.number);
        writer.u32(self.bits);
    }
}

/// Parsed span header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpanHeader {
    pub magic: u32,
    /// Number of distinct volumes with stripes in this span
    pub n_stripes: u32,
    pub n_free: u32,
    pub n_used: u32,
    pub n_stripe_spans: u32,
    #[serde(skip)]
    padding: u32,
    /// Total store blocks in the span
    pub n_storage_blocks: u64,
    pub stripes: Vec<StripeSpanDescriptor>,
}

impl SpanHeader {
    /// Build a header for `stripes`, deriving the directory counts.
    pub fn new(n_storage_blocks: u64, stripes: Vec<StripeSpanDescriptor>) -> Self {
        let n_free = stripes.iter().filter(|s| s.is_free()).count() as u32;
        let n_used = stripes.len() as u32 - n_free;
        let mut volumes: Vec<i32> = stripes
            .iter()
            .filter(|s| !s.is_free())
            .map(|s| s.number)
            .collect();
        volumes.sort_unstable();
        volumes.dedup();

        SpanHeader {
            magic: SPAN_MAGIC,
            n_stripes: volumes.len() as u32,
            n_free,
            n_used,
            n_stripe_spans: stripes.len() as u32,
            padding: 0,
            n_storage_blocks,
            stripes,
        }
    }

    /// Serialized length of a header with `n_stripe_spans` descriptors.
    pub fn encoded_len(n_stripe_spans: usize) -> usize {
        SPAN_HEADER_FIXED_LEN
            .saturating_add(n_stripe_spans.saturating_mul(STRIPE_SPAN_DESCRIPTOR_LEN))
    }

    /// Parse a header from a buffer read at the span start.
    ///
    /// The magic is checked before anything else is interpreted. The
    /// descriptor array is bounded by `n_stripe_spans` and by the buffer.
    /// Count consistency is not checked here; see [`SpanHeader::validate`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FormatError> {
        let mut reader = NativeReader::new(bytes);

        let magic = reader.u32()?;
        if magic != SPAN_MAGIC {
            return Err(FormatError::BadMagic {
                expected: SPAN_MAGIC,
                found: magic,
            });
        }

        let n_stripes = reader.u32()?;
        let n_free = reader.u32()?;
        let n_used = reader.u32()?;
        let n_stripe_spans = reader.u32()?;
        let padding = reader.u32()?;
        let n_storage_blocks = reader.u64()?;

        let needed = Self::encoded_len(n_stripe_spans as usize);
        if needed > bytes.len() {
            return Err(FormatError::Truncated {
                needed,
                available: bytes.len(),
            });
        }

        let stripes = (0..n_stripe_spans)
            .map(|_| StripeSpanDescriptor::read(&mut reader))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(SpanHeader {
            magic,
            n_stripes,
            n_free,
            n_used,
            n_stripe_spans,
            padding,
            n_storage_blocks,
            stripes,
        })
    }

    /// Serialize the header; the output is exactly `encoded_len` bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut writer = NativeWriter::with_capacity(Self::encoded_len(self.stripes.len()));
        writer.u32(self.magic);
        writer.u32(self.n_stripes);
        writer.u32(self.n_free);
        writer.u32(self.n_used);
        writer.u32(self.n_stripe_spans);
        writer.u32(self.padding);
        writer.u64(self.n_storage_blocks);
        for stripe in &self.stripes {
            stripe.write(&mut writer);
        }
        writer.into_bytes()
    }

    /// Check the structural invariants a mount routine relies on.
    pub fn validate(&self) -> Result<(), FormatError> {
        if self.magic != SPAN_MAGIC {
            return Err(FormatError::BadMagic {
                expected: SPAN_MAGIC,
                found: self.magic,
            });
        }

        if u64::from(self.n_used) + u64::from(self.n_free) != u64::from(self.n_stripe_spans) {
            return Err(FormatError::InconsistentCounts {
                used: self.n_used,
                free: self.n_free,
                total: self.n_stripe_spans,
            });
        }

        let span_bytes = self.n_storage_blocks.saturating_mul(STORE_BLOCK_SIZE as u64);
        for (index, stripe) in self.stripes.iter().enumerate() {
            if stripe.offset % STORE_BLOCK_SIZE as u64 != 0 {
                return Err(FormatError::MisalignedStripe {
                    index,
                    offset: stripe.offset,
                });
            }
            if !stripe.is_free() && stripe.len == 0 {
                return Err(FormatError::EmptyStripe { index });
            }
            if !stripe.end().is_some_and(|end| end <= span_bytes) {
                return Err(FormatError::StripeOutOfRange {
                    index,
                    offset: stripe.offset,
                    len: stripe.len,
                });
            }
        }

        Ok(())
    }

    /// Descriptors that are in use, with their directory index.
    pub fn in_use(&self) -> impl Iterator<Item = (usize, &StripeSpanDescriptor)> {
        self.stripes.iter().enumerate().filter(|(_, s)| !s.is_free())
    }
}
