//! Disk I/O for spans

use crate::core::layout::{round_to_store_block, SPAN_START, STORE_BLOCK_SIZE};
use crate::core::span::{SpanHeader, StripeSpanDescriptor};
use crate::core::stripe_meta::{
    probe_for_stripe, MetaCopy, StripeCopies, StripeGeometry, StripeMeta, STRIPE_META_FIXED_LEN,
};
use crate::error::{FormatError, Result};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// Read size while scanning for a footer.
const SCAN_CHUNK: usize = 128 * STORE_BLOCK_SIZE;

/// Where the four descriptor copies of a stripe live.
///
/// Header A sits at the stripe offset and footer A `delta` bytes later.
/// Copy B follows immediately, with the same header-to-footer distance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StripeLayout {
    pub offset: u64,
    pub delta: u64,
}

impl StripeLayout {
    pub fn new(offset: u64, geometry: &StripeGeometry) -> Self {
        StripeLayout {
            offset,
            delta: geometry.delta(),
        }
    }

    pub fn position(&self, copy: MetaCopy) -> u64 {
        let block = STORE_BLOCK_SIZE as u64;
        match copy {
            MetaCopy::AHeader => self.offset,
            MetaCopy::AFooter => self.offset.saturating_add(self.delta),
            MetaCopy::BHeader => self.offset.saturating_add(self.delta).saturating_add(block),
            MetaCopy::BFooter => self
                .offset
                .saturating_add(self.delta.saturating_mul(2))
                .saturating_add(block),
        }
    }

    /// First byte after the last copy.
    pub fn end(&self) -> u64 {
        self.position(MetaCopy::BFooter) + STORE_BLOCK_SIZE as u64
    }

    pub fn geometry(&self) -> StripeGeometry {
        StripeGeometry::from_delta(self.delta)
    }
}

/// Outcome of locating and reading a stripe's descriptor copies.
#[derive(Debug, Clone)]
pub struct StripeScan {
    /// Stripe offset, where header A is expected
    pub offset: u64,
    /// Known once footer A has been found.
    pub layout: Option<StripeLayout>,
    pub copies: StripeCopies,
}

impl StripeScan {
    pub fn position(&self, copy: MetaCopy) -> Option<u64> {
        match (self.layout, copy) {
            (Some(layout), copy) => Some(layout.position(copy)),
            (None, MetaCopy::AHeader) => Some(self.offset),
            (None, _) => None,
        }
    }
}

/// An open span (regular file or device).
pub struct SpanFile {
    file: File,
    path: PathBuf,
    writable: bool,
}

impl SpanFile {
    /// Open for inspection. Nothing is ever written through this handle.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(&path)?;
        Ok(SpanFile {
            file,
            path: path.as_ref().to_path_buf(),
            writable: false,
        })
    }

    /// Open for reading and writing.
    pub fn open_rw<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        Ok(SpanFile {
            file,
            path: path.as_ref().to_path_buf(),
            writable: true,
        })
    }

    /// Create (or truncate) a file-backed span of `len` bytes.
    pub fn create<P: AsRef<Path>>(path: P, len: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(len)?;
        Ok(SpanFile {
            file,
            path: path.as_ref().to_path_buf(),
            writable: true,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn size(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Read exactly `len` bytes at `offset`.
    pub fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.file.seek(SeekFrom::Start(offset))?;
        let mut buffer = vec![0u8; len];
        self.file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    /// Read up to `len` bytes at `offset`; shorter only at end of file.
    pub fn read_up_to(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.file.seek(SeekFrom::Start(offset))?;
        let mut buffer = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            match self.file.read(&mut buffer[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        buffer.truncate(filled);
        Ok(buffer)
    }

    /// Read the span header.
    ///
    /// One store block is read first; a directory that does not fit in it
    /// is re-read at full size. A short span yields
    /// [`FormatError::Truncated`].
    pub fn read_header(&mut self) -> Result<SpanHeader> {
        let block = self.read_up_to(SPAN_START, STORE_BLOCK_SIZE)?;
        match SpanHeader::from_bytes(&block) {
            Err(FormatError::Truncated { needed, .. })
                if block.len() == STORE_BLOCK_SIZE && needed > STORE_BLOCK_SIZE =>
            {
                trace!(needed, "span directory spans several blocks, re-reading");
                let full = self.read_up_to(SPAN_START, needed)?;
                Ok(SpanHeader::from_bytes(&full)?)
            }
            other => Ok(other?),
        }
    }

    pub fn write_header(&mut self, header: &SpanHeader) -> Result<()> {
        let mut bytes = header.to_bytes();
        bytes.resize(round_to_store_block(bytes.len()), 0);
        self.write_at(SPAN_START, &bytes)
    }

    /// Zero the span header block, leaving the span uninitialized.
    pub fn clear(&mut self) -> Result<()> {
        self.write_at(SPAN_START, &[0u8; STORE_BLOCK_SIZE])?;
        self.sync()
    }

    /// Read one descriptor copy. Short reads are reported as a format
    /// error on that copy, not as an I/O failure.
    pub fn read_meta(
        &mut self,
        offset: u64,
        freelist_len: usize,
    ) -> Result<std::result::Result<StripeMeta, FormatError>> {
        let len = round_to_store_block(STRIPE_META_FIXED_LEN + freelist_len * 2);
        let bytes = self.read_up_to(offset, len)?;
        Ok(StripeMeta::from_bytes(&bytes, freelist_len))
    }

    pub fn write_meta(&mut self, offset: u64, meta: &StripeMeta) -> Result<()> {
        self.write_at(offset, &meta.to_block())
    }

    /// Write all four copies of `meta` (headers with the freelist, footers
    /// without).
    pub fn write_stripe_copies(&mut self, layout: &StripeLayout, meta: &StripeMeta) -> Result<()> {
        let footer = meta.footer();
        for copy in MetaCopy::ALL {
            let data = if copy.is_header() { meta } else { &footer };
            self.write_meta(layout.position(copy), data)?;
        }
        Ok(())
    }

    /// Locate and read the descriptor copies of the stripe in `descriptor`.
    ///
    /// Footer A is found by scanning store-block boundaries after header A,
    /// up to a sixteenth of the stripe plus one block. When header A is
    /// readable the footer must carry its generation; otherwise the first
    /// valid descriptor is taken. Copy B is read at the positions implied by the
    /// resulting header-to-footer distance.
    ///
    /// A torn footer A makes header B the first match, so the distance
    /// that puts more copies of the generation in place wins.
    pub fn scan_stripe(&mut self, descriptor: &StripeSpanDescriptor) -> Result<StripeScan> {
        let start = descriptor.offset;
        let len_bytes = descriptor.len_bytes().unwrap_or(u64::MAX);
        let stripe_end = start.saturating_add(len_bytes);
        let window = (len_bytes / 16).max(2 * STORE_BLOCK_SIZE as u64);
        let window_end = start
            .saturating_add(window)
            .saturating_add(STORE_BLOCK_SIZE as u64)
            .min(stripe_end);

        let header_a = self.read_meta(start, 0)?.and_then(|m| m.validate().map(|_| m));
        let generation = header_a.as_ref().ok().map(|m| m.generation);

        let found = self.find_footer(
            start.saturating_add(STORE_BLOCK_SIZE as u64),
            window_end,
            generation,
        )?;

        let mut copies = StripeCopies::new();
        let Some((found_pos, found)) = found else {
            debug!(offset = start, "no footer found for stripe");
            copies.insert(MetaCopy::AHeader, header_a);
            return Ok(StripeScan {
                offset: start,
                layout: None,
                copies,
            });
        };

        let layout = self.settle_layout(start, found_pos, found.generation)?;
        let segments = layout.geometry().segments as usize;

        for copy in MetaCopy::ALL {
            let freelist_len = if copy.is_header() { segments } else { 0 };
            copies.insert(copy, self.read_meta(layout.position(copy), freelist_len)?);
        }

        Ok(StripeScan {
            offset: start,
            layout: Some(layout),
            copies,
        })
    }

    /// Decide whether the descriptor found at `found` is footer A or, with
    /// footer A torn, header B.
    fn settle_layout(&mut self, start: u64, found: u64, generation: u32) -> Result<StripeLayout> {
        let block = STORE_BLOCK_SIZE as u64;
        let as_footer = StripeLayout {
            offset: start,
            delta: found - start,
        };
        if as_footer.delta < 2 * block {
            return Ok(as_footer);
        }
        let as_header_b = StripeLayout {
            offset: start,
            delta: as_footer.delta - block,
        };

        let footer_score = self.copies_in_place(&as_footer, generation)?;
        let header_b_score = self.copies_in_place(&as_header_b, generation)?;
        if header_b_score > footer_score {
            debug!(
                offset = start,
                delta = as_header_b.delta,
                "footer A unreadable, located stripe from header B"
            );
            return Ok(as_header_b);
        }
        Ok(as_footer)
    }

    /// Number of copies under `layout` that validate with `generation`.
    fn copies_in_place(&mut self, layout: &StripeLayout, generation: u32) -> Result<usize> {
        let mut count = 0;
        for copy in MetaCopy::ALL {
            let meta = self.read_meta(layout.position(copy), 0)?;
            if matches!(meta, Ok(m) if m.generation == generation && m.validate().is_ok()) {
                count += 1;
            }
        }
        Ok(count)
    }

    fn find_footer(
        &mut self,
        from: u64,
        to: u64,
        generation: Option<u32>,
    ) -> Result<Option<(u64, StripeMeta)>> {
        let mut pos = from;
        while pos < to {
            let want = SCAN_CHUNK.min((to - pos) as usize);
            let buf = self.read_up_to(pos, want)?;

            let mut at = 0;
            while at < buf.len() {
                let Some(found) = probe_for_stripe(&buf[at..]) else {
                    break;
                };
                let candidate = at + found;
                if let Ok(meta) = StripeMeta::from_bytes(&buf[candidate..], 0) {
                    let matches = generation.map_or(true, |g| g == meta.generation);
                    if matches && meta.validate().is_ok() {
                        return Ok(Some((pos + candidate as u64, meta)));
                    }
                }
                at = candidate + STORE_BLOCK_SIZE;
            }

            if buf.len() < want {
                break;
            }
            pos += buf.len() as u64;
        }
        Ok(None)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(std::io::Error::new(
                ErrorKind::PermissionDenied,
                format!("{} is open read-only", self.path.display()),
            )
            .into());
        }
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        self.file.flush()?;
        Ok(())
    }

    /// Sync all writes to disk
    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CacheError;
    use tempfile::NamedTempFile;

    const SPAN_LEN: u64 = 64 * STORE_BLOCK_SIZE as u64;

    fn span_with_stripe() -> (NamedTempFile, StripeSpanDescriptor, StripeLayout, StripeMeta) {
        let temp = NamedTempFile::new().unwrap();
        let mut span = SpanFile::create(temp.path(), SPAN_LEN).unwrap();

        let offset = SPAN_START + STORE_BLOCK_SIZE as u64;
        let descriptor = StripeSpanDescriptor::new(offset, 48, 1, 1, false);
        let header = SpanHeader::new(SPAN_LEN / STORE_BLOCK_SIZE as u64, vec![descriptor]);
        span.write_header(&header).unwrap();

        let layout = StripeLayout {
            offset,
            delta: 2 * STORE_BLOCK_SIZE as u64,
        };
        let meta = StripeMeta::new(layout.geometry().segments as usize);
        span.write_stripe_copies(&layout, &meta).unwrap();
        (temp, descriptor, layout, meta)
    }

    #[test]
    fn test_header_round_trip() {
        let (temp, descriptor, _, _) = span_with_stripe();
        let mut span = SpanFile::open(temp.path()).unwrap();
        let header = span.read_header().unwrap();
        assert_eq!(header.stripes, vec![descriptor]);
        assert!(header.validate().is_ok());
    }

    #[test]
    fn test_large_directory_is_reread() {
        let temp = NamedTempFile::new().unwrap();
        let mut span = SpanFile::create(temp.path(), SPAN_LEN).unwrap();
        let stripes: Vec<_> = (0..500)
            .map(|i| StripeSpanDescriptor::new(i * STORE_BLOCK_SIZE as u64, 1, 0, 0, true))
            .collect();
        let header = SpanHeader::new(1, stripes);
        assert!(SpanHeader::encoded_len(500) > STORE_BLOCK_SIZE);
        span.write_header(&header).unwrap();

        assert_eq!(span.read_header().unwrap(), header);
    }

    #[test]
    fn test_short_span() {
        let temp = NamedTempFile::new().unwrap();
        SpanFile::create(temp.path(), SPAN_START + 2).unwrap();
        let mut span = SpanFile::open(temp.path()).unwrap();
        assert!(matches!(
            span.read_header(),
            Err(CacheError::Format(FormatError::Truncated { .. }))
        ));
    }

    #[test]
    fn test_read_only_refuses_writes() {
        let (temp, _, _, _) = span_with_stripe();
        let mut span = SpanFile::open(temp.path()).unwrap();
        assert!(!span.is_writable());
        assert!(matches!(span.clear(), Err(CacheError::Io(_))));
        assert!(span.read_header().is_ok());
    }

    #[test]
    fn test_clear() {
        let (temp, _, _, _) = span_with_stripe();
        SpanFile::open_rw(temp.path()).unwrap().clear().unwrap();
        let mut span = SpanFile::open(temp.path()).unwrap();
        assert!(matches!(
            span.read_header(),
            Err(CacheError::Format(FormatError::BadMagic { found: 0, .. }))
        ));
    }

    #[test]
    fn test_scan_finds_all_copies() {
        let (temp, descriptor, layout, meta) = span_with_stripe();
        let mut span = SpanFile::open(temp.path()).unwrap();
        let scan = span.scan_stripe(&descriptor).unwrap();

        assert_eq!(scan.layout, Some(layout));
        assert_eq!(scan.copies.valid_count(), 4);
        assert_eq!(scan.position(MetaCopy::BFooter), Some(layout.position(MetaCopy::BFooter)));
        let reconciled = scan.copies.reconcile().unwrap();
        assert_eq!(reconciled.header, meta);
    }

    #[test]
    fn test_scan_with_torn_header_a() {
        let (temp, descriptor, layout, meta) = span_with_stripe();
        {
            let mut span = SpanFile::open_rw(temp.path()).unwrap();
            span.write_at(layout.offset, &[0xFF; 64]).unwrap();
        }
        let mut span = SpanFile::open(temp.path()).unwrap();
        let scan = span.scan_stripe(&descriptor).unwrap();

        assert_eq!(scan.layout, Some(layout));
        assert!(scan.copies.get(MetaCopy::AHeader).is_none());
        let reconciled = scan.copies.reconcile().unwrap();
        assert_eq!(reconciled.header_copy, MetaCopy::BHeader);
        assert_eq!(reconciled.header.generation, meta.generation);
    }

    #[test]
    fn test_scan_with_torn_footer_a() {
        let (temp, descriptor, layout, meta) = span_with_stripe();
        {
            let mut span = SpanFile::open_rw(temp.path()).unwrap();
            span.write_at(layout.position(MetaCopy::AFooter), &[0xFF; 64])
                .unwrap();
        }
        let mut span = SpanFile::open(temp.path()).unwrap();
        let scan = span.scan_stripe(&descriptor).unwrap();

        // Header B is the first match but must not be taken for footer A.
        assert_eq!(scan.layout, Some(layout));
        assert!(scan.copies.get(MetaCopy::AFooter).is_none());
        assert_eq!(scan.copies.valid_count(), 3);
        let reconciled = scan.copies.reconcile().unwrap();
        assert_eq!(reconciled.header, meta);
    }

    #[test]
    fn test_scan_with_oversized_length() {
        let (temp, mut descriptor, _, _) = span_with_stripe();
        descriptor.len = u64::MAX;
        let mut span = SpanFile::open(temp.path()).unwrap();
        let scan = span.scan_stripe(&descriptor).unwrap();
        assert!(scan.layout.is_some());
    }

    #[test]
    fn test_scan_empty_stripe() {
        let temp = NamedTempFile::new().unwrap();
        SpanFile::create(temp.path(), SPAN_LEN).unwrap();
        let descriptor = StripeSpanDescriptor::new(2 * STORE_BLOCK_SIZE as u64, 48, 1, 1, false);
        let mut span = SpanFile::open(temp.path()).unwrap();
        let scan = span.scan_stripe(&descriptor).unwrap();
        assert!(scan.layout.is_none());
        assert_eq!(scan.copies.valid_count(), 0);
    }
}
