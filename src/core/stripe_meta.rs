//! Stripe descriptor format (header/footer copies)
//!
//! Every stripe persists its state four times: header and footer of copy A,
//! then header and footer of copy B. Header copies carry the segment
//! freelist; footers stop after the fixed fields. A clean sync leaves the
//! header and footer of a copy with the same `sync_serial`; a crash in the
//! middle of a sync leaves them different, which is how a torn copy is
//! detected.
//!
//! ```text
//! offset  size  field
//! 0       4     magic (0xF1D0F00D)
//! 4       2     version major
//! 6       2     version minor
//! 8       8     create_time
//! 16      8     write_pos
//! 24      8     last_write_pos
//! 32      8     agg_pos
//! 40      4     generation (never 0)
//! 44      4     phase
//! 48      4     cycle
//! 52      4     sync_serial
//! 56      4     write_serial
//! 60      4     dirty
//! 64      4     sector_size
//! 68      4     unused
//! 72      2*n   freelist (headers only)
//! ```

use crate::core::layout::{
    round_to_store_block, NativeReader, NativeWriter, CACHE_DB_MAJOR_VERSION,
    CACHE_DB_MAX_MINOR_VERSION, CACHE_DB_MINOR_VERSION, DEVICE_BLOCK_SIZE, STORE_BLOCK_SIZE,
};
use crate::error::FormatError;
use rand::Rng;
use serde::Serialize;
use std::fmt;
use tracing::debug;

/// Magic number of a live stripe descriptor.
pub const STRIPE_MAGIC: u32 = 0xF1D0_F00D;

/// Size of the fixed part of a stripe descriptor.
pub const STRIPE_META_FIXED_LEN: usize = 72;

/// Directory entries per bucket.
pub const DIR_DEPTH: u64 = 4;

/// Serialized size of one directory entry.
pub const SIZEOF_DIR: u64 = 10;

/// Upper bound on buckets per directory segment.
pub const MAX_BUCKETS_PER_SEGMENT: u64 = 1 << 14;

/// Persisted stripe state, one per copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StripeMeta {
    pub magic: u32,
    pub version_major: u16,
    pub version_minor: u16,
    /// Creation time, seconds since the epoch
    pub create_time: i64,
    pub write_pos: i64,
    pub last_write_pos: i64,
    pub agg_pos: i64,
    /// Token distinguishing metadata instances; never zero
    pub generation: u32,
    pub phase: u32,
    pub cycle: u32,
    pub sync_serial: u32,
    pub write_serial: u32,
    pub dirty: u32,
    pub sector_size: u32,
    #[serde(skip)]
    pub(crate) unused: u32,
    /// Per-segment freelist heads (header copies only)
    pub freelist: Vec<u16>,
}

impl StripeMeta {
    /// Fresh metadata for a newly initialized stripe.
    ///
    /// The generation token is random and non-zero.
    pub fn new(segments: usize) -> Self {
        let generation = rand::thread_rng().gen_range(1..=u32::MAX);
        StripeMeta {
            magic: STRIPE_MAGIC,
            version_major: CACHE_DB_MAJOR_VERSION,
            version_minor: CACHE_DB_MINOR_VERSION,
            create_time: chrono::Utc::now().timestamp(),
            write_pos: 0,
            last_write_pos: 0,
            agg_pos: 0,
            generation,
            phase: 0,
            cycle: 0,
            sync_serial: 0,
            write_serial: 0,
            dirty: 0,
            sector_size: DEVICE_BLOCK_SIZE as u32,
            unused: 0,
            freelist: vec![0; segments],
        }
    }

    /// Serialized length including the freelist.
    pub fn encoded_len(&self) -> usize {
        STRIPE_META_FIXED_LEN + self.freelist.len() * 2
    }

    /// Parse one copy. `freelist_len` is the segment count for header
    /// copies and 0 for footers.
    pub fn from_bytes(bytes: &[u8], freelist_len: usize) -> Result<Self, FormatError> {
        let mut reader = NativeReader::new(bytes);

        let magic = reader.u32()?;
        if magic != STRIPE_MAGIC {
            return Err(FormatError::BadMagic {
                expected: STRIPE_MAGIC,
                found: magic,
            });
        }

        let version_major = reader.u16()?;
        let version_minor = reader.u16()?;
        let create_time = reader.i64()?;
        let write_pos = reader.i64()?;
        let last_write_pos = reader.i64()?;
        let agg_pos = reader.i64()?;
        let generation = reader.u32()?;
        let phase = reader.u32()?;
        let cycle = reader.u32()?;
        let sync_serial = reader.u32()?;
        let write_serial = reader.u32()?;
        let dirty = reader.u32()?;
        let sector_size = reader.u32()?;
        let unused = reader.u32()?;

        let needed = STRIPE_META_FIXED_LEN + freelist_len * 2;
        if needed > bytes.len() {
            return Err(FormatError::Truncated {
                needed,
                available: bytes.len(),
            });
        }
        let freelist = (0..freelist_len)
            .map(|_| reader.u16())
            .collect::<Result<Vec<_>, _>>()?;

        Ok(StripeMeta {
            magic,
            version_major,
            version_minor,
            create_time,
            write_pos,
            last_write_pos,
            agg_pos,
            generation,
            phase,
            cycle,
            sync_serial,
            write_serial,
            dirty,
            sector_size,
            unused,
            freelist,
        })
    }

    /// Serialize exactly `encoded_len` bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut writer = NativeWriter::with_capacity(self.encoded_len());
        writer.u32(self.magic);
        writer.u16(self.version_major);
        writer.u16(self.version_minor);
        writer.i64(self.create_time);
        writer.i64(self.write_pos);
        writer.i64(self.last_write_pos);
        writer.i64(self.agg_pos);
        writer.u32(self.generation);
        writer.u32(self.phase);
        writer.u32(self.cycle);
        writer.u32(self.sync_serial);
        writer.u32(self.write_serial);
        writer.u32(self.dirty);
        writer.u32(self.sector_size);
        writer.u32(self.unused);
        for entry in &self.freelist {
            writer.u16(*entry);
        }
        writer.into_bytes()
    }

    /// Serialize padded to whole store blocks, ready to write to disk.
    pub fn to_block(&self) -> Vec<u8> {
        let mut bytes = self.to_bytes();
        bytes.resize(round_to_store_block(bytes.len()), 0);
        bytes
    }

    /// The footer form of this descriptor (no freelist).
    pub fn footer(&self) -> Self {
        StripeMeta {
            freelist: Vec::new(),
            ..self.clone()
        }
    }

    /// Check everything a parsed copy must satisfy to be trusted.
    pub fn validate(&self) -> Result<(), FormatError> {
        if self.magic != STRIPE_MAGIC {
            return Err(FormatError::BadMagic {
                expected: STRIPE_MAGIC,
                found: self.magic,
            });
        }
        if !version_supported(self.version_major, self.version_minor) {
            return Err(FormatError::UnsupportedVersion {
                major: self.version_major,
                minor: self.version_minor,
            });
        }
        if self.generation == 0 {
            return Err(FormatError::ZeroGeneration);
        }
        Ok(())
    }
}

/// Versions this engine can read.
pub fn version_supported(major: u16, minor: u16) -> bool {
    major <= CACHE_DB_MAJOR_VERSION && minor <= CACHE_DB_MAX_MINOR_VERSION
}

/// Position of a descriptor copy on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum MetaCopy {
    AHeader,
    AFooter,
    BHeader,
    BFooter,
}

impl MetaCopy {
    pub const ALL: [MetaCopy; 4] = [
        MetaCopy::AHeader,
        MetaCopy::AFooter,
        MetaCopy::BHeader,
        MetaCopy::BFooter,
    ];

    fn index(self) -> usize {
        match self {
            MetaCopy::AHeader => 0,
            MetaCopy::AFooter => 1,
            MetaCopy::BHeader => 2,
            MetaCopy::BFooter => 3,
        }
    }

    pub fn is_header(self) -> bool {
        matches!(self, MetaCopy::AHeader | MetaCopy::BHeader)
    }
}

impl fmt::Display for MetaCopy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MetaCopy::AHeader => "Header A",
            MetaCopy::AFooter => "Footer A",
            MetaCopy::BHeader => "Header B",
            MetaCopy::BFooter => "Footer B",
        };
        f.write_str(name)
    }
}

/// The header/footer pair chosen by reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconciledMeta {
    pub header: StripeMeta,
    pub footer: StripeMeta,
    pub header_copy: MetaCopy,
    pub footer_copy: MetaCopy,
}

/// The four stored copies of a stripe descriptor, as read.
///
/// A copy that failed to parse or validate is stored as `None`.
#[derive(Debug, Clone, Default)]
pub struct StripeCopies {
    copies: [Option<StripeMeta>; 4],
}

impl StripeCopies {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome of reading one copy. Invalid copies are absent.
    pub fn insert(&mut self, copy: MetaCopy, parsed: Result<StripeMeta, FormatError>) {
        let slot = &mut self.copies[copy.index()];
        *slot = match parsed.and_then(|meta| meta.validate().map(|_| meta)) {
            Ok(meta) => Some(meta),
            Err(err) => {
                debug!(%copy, error = %err, "stripe descriptor copy unusable");
                None
            }
        };
    }

    pub fn get(&self, copy: MetaCopy) -> Option<&StripeMeta> {
        self.copies[copy.index()].as_ref()
    }

    /// Number of copies that validated.
    pub fn valid_count(&self) -> usize {
        self.copies.iter().filter(|c| c.is_some()).count()
    }

    /// Pick the header/footer pair to trust after an unclean shutdown.
    ///
    /// A pair qualifies when both copies are present and agree on
    /// `generation` and `sync_serial`. The qualifying pair with the highest
    /// `sync_serial` wins; ties go to same-copy pairs, then to copy A.
    pub fn reconcile(&self) -> Result<ReconciledMeta, FormatError> {
        const PAIRS: [(MetaCopy, MetaCopy); 4] = [
            (MetaCopy::AHeader, MetaCopy::AFooter),
            (MetaCopy::BHeader, MetaCopy::BFooter),
            (MetaCopy::AHeader, MetaCopy::BFooter),
            (MetaCopy::BHeader, MetaCopy::AFooter),
        ];

        let mut best: Option<(MetaCopy, MetaCopy, &StripeMeta, &StripeMeta)> = None;
        for (h, f) in PAIRS {
            let (Some(header), Some(footer)) = (self.get(h), self.get(f)) else {
                continue;
            };
            if header.generation != footer.generation || header.sync_serial != footer.sync_serial {
                continue;
            }
            let better = match best {
                None => true,
                Some((_, _, current, _)) => header.sync_serial > current.sync_serial,
            };
            if better {
                best = Some((h, f, header, footer));
            }
        }

        match best {
            Some((header_copy, footer_copy, header, footer)) => Ok(ReconciledMeta {
                header: header.clone(),
                footer: footer.clone(),
                header_copy,
                footer_copy,
            }),
            None => Err(FormatError::StripeUnreadable),
        }
    }
}

/// Find the first valid stripe descriptor on a store-block boundary.
///
/// Returns the byte offset within `buf`. Only the fixed fields are
/// checked, the way a scanner finds candidate copies.
pub fn probe_for_stripe(buf: &[u8]) -> Option<usize> {
    let mut offset = 0;
    while buf.len() - offset >= STRIPE_META_FIXED_LEN {
        if let Ok(meta) = StripeMeta::from_bytes(&buf[offset..], 0) {
            if version_supported(meta.version_major, meta.version_minor) {
                return Some(offset);
            }
        }
        offset += STORE_BLOCK_SIZE;
        if offset >= buf.len() {
            break;
        }
    }
    None
}

/// Directory shape derived from the distance between a header and footer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StripeGeometry {
    pub segments: u64,
    pub buckets: u64,
}

impl StripeGeometry {
    /// `delta` is the byte distance from a copy's header to its footer.
    ///
    /// Assumes the header and freelist fit in one store block.
    pub fn from_delta(delta: u64) -> Self {
        let space = delta.saturating_sub(STORE_BLOCK_SIZE as u64);
        let n_buckets = space / (DIR_DEPTH * SIZEOF_DIR);
        let mut segments = (n_buckets / MAX_BUCKETS_PER_SEGMENT).max(1);
        while n_buckets / segments > MAX_BUCKETS_PER_SEGMENT {
            segments += 1;
        }
        StripeGeometry {
            segments,
            buckets: n_buckets / segments,
        }
    }

    pub fn entries(&self) -> u64 {
        self.buckets * self.segments * DIR_DEPTH
    }

    /// Bytes taken by the directory proper.
    pub fn directory_bytes(&self) -> u64 {
        self.buckets * self.segments * DIR_DEPTH * SIZEOF_DIR
    }

    /// Distance from header to footer for a directory of this shape.
    pub fn delta(&self) -> u64 {
        let raw = STORE_BLOCK_SIZE as u64 + self.directory_bytes();
        raw.div_ceil(STORE_BLOCK_SIZE as u64) * STORE_BLOCK_SIZE as u64
    }
}

impl fmt::Display for StripeGeometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} segments with {} buckets per segment for {} total directory entries taking {} bytes",
            self.segments,
            self.buckets,
            self.entries(),
            self.directory_bytes()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(generation: u32, sync_serial: u32) -> StripeMeta {
        let mut m = StripeMeta::new(4);
        m.generation = generation;
        m.sync_serial = sync_serial;
        m
    }

    fn copies(
        ah: Option<StripeMeta>,
        af: Option<StripeMeta>,
        bh: Option<StripeMeta>,
        bf: Option<StripeMeta>,
    ) -> StripeCopies {
        let mut c = StripeCopies::new();
        for (copy, m) in MetaCopy::ALL.into_iter().zip([ah, af, bh, bf]) {
            let parsed = m.ok_or(FormatError::BadMagic {
                expected: STRIPE_MAGIC,
                found: 0,
            });
            c.insert(copy, parsed);
        }
        c
    }

    #[test]
    fn test_meta_creation() {
        let m = StripeMeta::new(8);
        assert_eq!(m.magic, STRIPE_MAGIC);
        assert_ne!(m.generation, 0);
        assert_eq!(m.freelist.len(), 8);
        assert!(m.validate().is_ok());
    }

    #[test]
    fn test_meta_serialization() {
        let mut m = StripeMeta::new(3);
        m.write_pos = 123_456;
        m.freelist = vec![1, 2, 0xFFFF];

        let bytes = m.to_bytes();
        assert_eq!(bytes.len(), STRIPE_META_FIXED_LEN + 6);

        let parsed = StripeMeta::from_bytes(&bytes, 3).unwrap();
        assert_eq!(parsed, m);

        let block = m.to_block();
        assert_eq!(block.len(), STORE_BLOCK_SIZE);
        assert_eq!(StripeMeta::from_bytes(&block, 3).unwrap(), m);
    }

    #[test]
    fn test_footer_has_no_freelist() {
        let m = StripeMeta::new(5);
        let footer = m.footer();
        assert!(footer.freelist.is_empty());
        assert_eq!(footer.generation, m.generation);
        assert_eq!(footer.encoded_len(), STRIPE_META_FIXED_LEN);
    }

    #[test]
    fn test_bad_magic() {
        let mut bytes = StripeMeta::new(0).to_block();
        bytes[..4].copy_from_slice(&0xDEADBEEFu32.to_ne_bytes());
        assert_eq!(
            StripeMeta::from_bytes(&bytes, 0),
            Err(FormatError::BadMagic {
                expected: STRIPE_MAGIC,
                found: 0xDEADBEEF
            })
        );
    }

    #[test]
    fn test_validation() {
        let mut m = StripeMeta::new(0);
        m.generation = 0;
        assert_eq!(m.validate(), Err(FormatError::ZeroGeneration));

        let mut m = StripeMeta::new(0);
        m.version_major = 25;
        assert!(matches!(
            m.validate(),
            Err(FormatError::UnsupportedVersion { major: 25, .. })
        ));

        let mut m = StripeMeta::new(0);
        m.version_minor = 2;
        assert!(m.validate().is_ok());
    }

    #[test]
    fn test_reconcile_clean() {
        let c = copies(
            Some(meta(7, 10)),
            Some(meta(7, 10)),
            Some(meta(7, 9)),
            Some(meta(7, 9)),
        );
        let r = c.reconcile().unwrap();
        assert_eq!(r.header_copy, MetaCopy::AHeader);
        assert_eq!(r.footer_copy, MetaCopy::AFooter);
        assert_eq!(r.header.sync_serial, 10);
    }

    #[test]
    fn test_reconcile_prefers_newer_copy() {
        let c = copies(
            Some(meta(7, 10)),
            Some(meta(7, 10)),
            Some(meta(7, 11)),
            Some(meta(7, 11)),
        );
        let r = c.reconcile().unwrap();
        assert_eq!(r.header_copy, MetaCopy::BHeader);
        assert_eq!(r.footer_copy, MetaCopy::BFooter);
    }

    #[test]
    fn test_reconcile_torn_write() {
        // Copy B was being synced when the crash happened.
        let c = copies(
            Some(meta(7, 10)),
            Some(meta(7, 10)),
            Some(meta(7, 11)),
            Some(meta(7, 9)),
        );
        let r = c.reconcile().unwrap();
        assert_eq!(r.header.sync_serial, 10);
        assert_eq!(r.header_copy, MetaCopy::AHeader);
    }

    #[test]
    fn test_reconcile_missing_copy() {
        let c = copies(None, Some(meta(7, 10)), Some(meta(7, 10)), Some(meta(7, 10)));
        let r = c.reconcile().unwrap();
        assert_eq!(r.header_copy, MetaCopy::BHeader);
        assert_eq!(r.footer_copy, MetaCopy::BFooter);

        // Only one header and one footer survive, from different copies.
        let c = copies(None, Some(meta(7, 10)), Some(meta(7, 10)), None);
        let r = c.reconcile().unwrap();
        assert_eq!(r.header_copy, MetaCopy::BHeader);
        assert_eq!(r.footer_copy, MetaCopy::AFooter);
    }

    #[test]
    fn test_reconcile_generation_mismatch() {
        let c = copies(Some(meta(7, 10)), Some(meta(8, 10)), None, None);
        assert_eq!(c.reconcile(), Err(FormatError::StripeUnreadable));
    }

    #[test]
    fn test_reconcile_nothing_valid() {
        let c = copies(None, None, None, None);
        assert_eq!(c.valid_count(), 0);
        assert_eq!(c.reconcile(), Err(FormatError::StripeUnreadable));
    }

    #[test]
    fn test_insert_rejects_zero_generation() {
        let mut c = StripeCopies::new();
        c.insert(MetaCopy::AHeader, Ok(meta(0, 1)));
        assert!(c.get(MetaCopy::AHeader).is_none());
    }

    #[test]
    fn test_probe_for_stripe() {
        let mut buf = vec![0u8; STORE_BLOCK_SIZE * 4];
        let m = StripeMeta::new(0).to_block();
        buf[2 * STORE_BLOCK_SIZE..3 * STORE_BLOCK_SIZE].copy_from_slice(&m);
        assert_eq!(probe_for_stripe(&buf), Some(2 * STORE_BLOCK_SIZE));
        assert_eq!(probe_for_stripe(&buf[3 * STORE_BLOCK_SIZE..]), None);
        assert_eq!(probe_for_stripe(&[]), None);
    }

    #[test]
    fn test_geometry() {
        let g = StripeGeometry::from_delta(STORE_BLOCK_SIZE as u64 + 40 * 1000);
        assert_eq!(g.segments, 1);
        assert_eq!(g.buckets, 1000);
        assert_eq!(g.entries(), 4000);

        let big = StripeGeometry::from_delta(STORE_BLOCK_SIZE as u64 + 40 * 100_000);
        assert_eq!(big.segments, 7);
        assert!(big.buckets <= MAX_BUCKETS_PER_SEGMENT);

        // Too small to hold a directory still yields one segment.
        let tiny = StripeGeometry::from_delta(0);
        assert_eq!(tiny.segments, 1);
        assert_eq!(tiny.buckets, 0);
    }

    #[test]
    fn test_geometry_delta_round_trip() {
        let g = StripeGeometry {
            segments: 2,
            buckets: 100,
        };
        assert_eq!(g.delta() % STORE_BLOCK_SIZE as u64, 0);
        // Block rounding only ever adds room.
        assert!(StripeGeometry::from_delta(g.delta()).entries() >= g.entries());
    }
}
