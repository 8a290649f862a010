//! Mounting spans into the running cache
//!
//! Mounting reads each span header, checks its directory, then locates and
//! reconciles the descriptor copies of every in-use stripe. A stripe whose
//! copies cannot be reconciled is left out; a span whose header is unusable
//! is left out entirely. Neither stops the rest of the cache from mounting.

use crate::config::CacheConfig;
use crate::core::io::{SpanFile, StripeLayout};
use crate::core::layout::{round_to_store_block, SPAN_START, STORE_BLOCK_SIZE};
use crate::core::span::{SpanHeader, StripeSpanDescriptor};
use crate::core::stripe::{Stripe, StripeId, StripeOrigin};
use crate::core::stripe_meta::{
    MetaCopy, StripeGeometry, StripeMeta, DIR_DEPTH, MAX_BUCKETS_PER_SEGMENT,
};
use crate::core::worker::StripeWorker;
use crate::error::{CacheError, FormatError, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Average object size used to size a new stripe's directory.
pub const DEFAULT_AVERAGE_OBJECT_SIZE: u64 = 8000;

/// A stripe left out of the mount, and why.
#[derive(Debug)]
pub struct ExcludedStripe {
    pub index: usize,
    pub descriptor: StripeSpanDescriptor,
    pub error: CacheError,
}

/// One mounted span.
#[derive(Debug)]
pub struct MountedSpan {
    pub path: PathBuf,
    pub header: SpanHeader,
    pub stripes: Vec<Arc<Stripe>>,
    pub excluded: Vec<ExcludedStripe>,
}

impl MountedSpan {
    /// Mount a single span.
    ///
    /// Fails only when the span itself is unusable (unreadable, bad
    /// magic or an inconsistent directory).
    pub fn mount<P: AsRef<Path>>(path: P, config: &CacheConfig) -> Result<Self> {
        let path = path.as_ref();
        let mut span = SpanFile::open(path)?;
        let header = span.read_header()?;
        header.validate()?;

        let mut stripes = Vec::new();
        let mut excluded = Vec::new();

        for (index, descriptor) in header.in_use() {
            match mount_stripe(&mut span, index, descriptor, config) {
                Ok(stripe) => {
                    debug!(
                        span = %path.display(),
                        index,
                        id = %stripe.id(),
                        volume = descriptor.number,
                        "stripe mounted"
                    );
                    stripes.push(Arc::new(stripe));
                }
                Err(error) => {
                    warn!(
                        span = %path.display(),
                        index,
                        offset = descriptor.offset,
                        %error,
                        "stripe excluded from mount"
                    );
                    excluded.push(ExcludedStripe {
                        index,
                        descriptor: *descriptor,
                        error,
                    });
                }
            }
        }

        Ok(MountedSpan {
            path: path.to_path_buf(),
            header,
            stripes,
            excluded,
        })
    }
}

fn mount_stripe(
    span: &mut SpanFile,
    index: usize,
    descriptor: &StripeSpanDescriptor,
    config: &CacheConfig,
) -> Result<Stripe> {
    let scan = span.scan_stripe(descriptor)?;
    let reconciled = scan.copies.reconcile()?;
    let layout = scan.layout.ok_or(FormatError::StripeUnreadable)?;

    if reconciled.header_copy != MetaCopy::AHeader {
        info!(
            index,
            header = %reconciled.header_copy,
            footer = %reconciled.footer_copy,
            "stripe recovered from secondary descriptor copy"
        );
    }

    let origin = StripeOrigin {
        span: span.path().to_path_buf(),
        index,
        descriptor: *descriptor,
        geometry: layout.geometry(),
    };
    Ok(Stripe::new(reconciled.header, config.max_writers).with_origin(origin))
}

/// A span that could not be mounted.
#[derive(Debug)]
pub struct FailedSpan {
    pub path: PathBuf,
    pub error: CacheError,
}

/// Every span of the cache, mounted.
#[derive(Debug)]
pub struct CacheMount {
    config: Arc<CacheConfig>,
    spans: Vec<MountedSpan>,
    failed: Vec<FailedSpan>,
}

impl CacheMount {
    pub fn mount<P: AsRef<Path>>(paths: &[P], config: Arc<CacheConfig>) -> Self {
        let mut spans = Vec::new();
        let mut failed = Vec::new();

        for path in paths {
            let path = path.as_ref();
            match MountedSpan::mount(path, &config) {
                Ok(span) => spans.push(span),
                Err(error) => {
                    warn!(span = %path.display(), %error, "span not mounted");
                    failed.push(FailedSpan {
                        path: path.to_path_buf(),
                        error,
                    });
                }
            }
        }

        let mount = CacheMount {
            config,
            spans,
            failed,
        };
        info!(
            spans = mount.spans.len(),
            stripes = mount.stripes().count(),
            failed = mount.failed.len(),
            "cache mounted"
        );
        mount
    }

    pub fn config(&self) -> &Arc<CacheConfig> {
        &self.config
    }

    pub fn spans(&self) -> &[MountedSpan] {
        &self.spans
    }

    pub fn failed(&self) -> &[FailedSpan] {
        &self.failed
    }

    pub fn stripes(&self) -> impl Iterator<Item = &Arc<Stripe>> {
        self.spans.iter().flat_map(|s| s.stripes.iter())
    }

    pub fn stripe(&self, id: StripeId) -> Option<&Arc<Stripe>> {
        self.stripes().find(|s| s.id() == id)
    }

    /// A worker for one scheduler thread, sized for every mounted stripe.
    pub fn worker(&self) -> StripeWorker {
        StripeWorker::new(Arc::clone(&self.config))
    }
}

/// Directory shape for a stripe of `len_bytes`.
pub fn plan_geometry(len_bytes: u64, average_object_size: u64) -> StripeGeometry {
    let entries = (len_bytes / average_object_size.max(1)).max(DIR_DEPTH);
    let total_buckets = entries.div_ceil(DIR_DEPTH);
    let segments = total_buckets.div_ceil(MAX_BUCKETS_PER_SEGMENT);
    let sized = StripeGeometry {
        segments,
        buckets: total_buckets.div_ceil(segments),
    };
    // What a reader will derive from the on-disk distance.
    StripeGeometry::from_delta(sized.delta())
}

/// Initialize `path` as a span holding one stripe per `(volume, blocks)`
/// entry, each `blocks` store blocks long.
///
/// Writes the span header and all four descriptor copies of every stripe.
pub fn format_span<P: AsRef<Path>>(path: P, stripes: &[(i32, u64)]) -> Result<SpanHeader> {
    let header_len = SpanHeader::encoded_len(stripes.len());
    let mut offset = SPAN_START + round_to_store_block(header_len) as u64;

    let mut descriptors = Vec::with_capacity(stripes.len());
    let mut layouts = Vec::with_capacity(stripes.len());
    for &(volume, blocks) in stripes {
        let descriptor = StripeSpanDescriptor::new(offset, blocks, volume, 1, false);
        let (Some(len_bytes), Some(end)) = (descriptor.len_bytes(), descriptor.end()) else {
            return Err(CacheError::Config(format!(
                "stripe of {} blocks does not fit in a span",
                blocks
            )));
        };
        let geometry = plan_geometry(len_bytes, DEFAULT_AVERAGE_OBJECT_SIZE);
        let layout = StripeLayout::new(offset, &geometry);
        if layout.end() > end {
            return Err(CacheError::Config(format!(
                "stripe of {} blocks is too small for its descriptor copies",
                blocks
            )));
        }
        descriptors.push(descriptor);
        layouts.push(layout);
        offset = end;
    }

    let total_blocks = offset / STORE_BLOCK_SIZE as u64;
    let header = SpanHeader::new(total_blocks, descriptors);

    let mut span = SpanFile::create(path.as_ref(), offset)?;
    span.write_header(&header)?;
    for layout in &layouts {
        let meta = StripeMeta::new(layout.geometry().segments as usize);
        span.write_stripe_copies(layout, &meta)?;
    }
    span.sync()?;

    info!(
        span = %path.as_ref().display(),
        stripes = header.n_used,
        blocks = total_blocks,
        "span formatted"
    );
    Ok(header)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_plan_geometry() {
        let g = plan_geometry(1 << 30, DEFAULT_AVERAGE_OBJECT_SIZE);
        assert!(g.entries() >= (1 << 30) / DEFAULT_AVERAGE_OBJECT_SIZE);
        assert!(g.buckets <= MAX_BUCKETS_PER_SEGMENT);
        assert_eq!(StripeGeometry::from_delta(g.delta()), g);
    }

    #[test]
    fn test_format_and_mount() {
        let temp = NamedTempFile::new().unwrap();
        let header = format_span(temp.path(), &[(1, 256), (2, 128)]).unwrap();
        assert_eq!(header.n_used, 2);
        assert_eq!(header.n_stripes, 2);

        let span = MountedSpan::mount(temp.path(), &CacheConfig::default()).unwrap();
        assert_eq!(span.stripes.len(), 2);
        assert!(span.excluded.is_empty());

        let origin = span.stripes[1].origin().unwrap();
        assert_eq!(origin.index, 1);
        assert_eq!(origin.descriptor.number, 2);
    }

    #[test]
    fn test_stripe_too_small() {
        let temp = NamedTempFile::new().unwrap();
        assert!(matches!(
            format_span(temp.path(), &[(1, 2)]),
            Err(CacheError::Config(_))
        ));
    }

    #[test]
    fn test_cache_mount_skips_bad_span() {
        let good = NamedTempFile::new().unwrap();
        format_span(good.path(), &[(1, 64)]).unwrap();
        let bad = NamedTempFile::new().unwrap();

        let mount = CacheMount::mount(
            &[good.path(), bad.path()],
            Arc::new(CacheConfig::default()),
        );
        assert_eq!(mount.spans().len(), 1);
        assert_eq!(mount.failed().len(), 1);
        assert_eq!(mount.stripes().count(), 1);

        let id = mount.stripes().next().unwrap().id();
        assert!(mount.stripe(id).is_some());
        assert!(mount.worker().trigger_consistent(id));
    }
}
