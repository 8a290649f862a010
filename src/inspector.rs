//! Read-only span inspection
//!
//! Everything here opens spans read-only and turns failures into report
//! entries instead of errors, so a damaged span can still be described.
//! The one exception is [`clear_span`], which explicitly opens read-write.

use crate::config::StorageConfig;
use crate::core::io::{SpanFile, StripeLayout};
use crate::core::layout::STORE_BLOCK_SIZE;
use crate::core::span::{SpanHeader, StripeSpanDescriptor};
use crate::core::stripe_meta::{MetaCopy, StripeGeometry, STRIPE_MAGIC};
use crate::error::{CacheError, FormatError, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// How far to look into each span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum InspectDepth {
    /// Span header and the first descriptor block of every stripe
    Span,
    /// Additionally locate and reconcile all descriptor copies
    Stripe,
}

/// What the first descriptor block of a stripe looks like.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MetaStatus {
    Valid {
        major: u16,
        minor: u16,
        generation: u32,
        sync_serial: u32,
    },
    BadMagic {
        found: u32,
    },
    Invalid {
        reason: String,
    },
    ReadFailed {
        reason: String,
    },
}

impl fmt::Display for MetaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetaStatus::Valid { major, minor, .. } => {
                write!(f, "stripe magic ok, version {}.{}", major, minor)
            }
            MetaStatus::BadMagic { found } => {
                write!(f, "bad stripe magic {:#010x} (expected {:#010x})", found, STRIPE_MAGIC)
            }
            MetaStatus::Invalid { reason } => write!(f, "invalid stripe descriptor: {}", reason),
            MetaStatus::ReadFailed { reason } => write!(f, "read failed: {}", reason),
        }
    }
}

/// One located descriptor copy.
#[derive(Debug, Clone, Serialize)]
pub struct CopyReport {
    pub copy: MetaCopy,
    pub offset: Option<u64>,
    pub valid: bool,
    pub sync_serial: Option<u32>,
}

/// Result of a deep stripe scan.
#[derive(Debug, Clone, Serialize)]
pub struct StripeScanReport {
    pub copies: Vec<CopyReport>,
    pub layout: Option<StripeLayout>,
    pub geometry: Option<StripeGeometry>,
    /// `(header, footer)` chosen by reconciliation
    pub selected: Option<(MetaCopy, MetaCopy)>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StripeReport {
    pub index: usize,
    pub descriptor: StripeSpanDescriptor,
    pub stripe_type: u8,
    pub free: bool,
    /// Not examined for free entries
    pub meta: Option<MetaStatus>,
    pub scan: Option<StripeScanReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SpanReport {
    pub path: PathBuf,
    pub header: Option<SpanHeader>,
    /// Why the header could not be used
    pub error: Option<String>,
    pub stripes: Vec<StripeReport>,
}

impl SpanReport {
    fn failed(path: &Path, error: impl fmt::Display) -> Self {
        SpanReport {
            path: path.to_path_buf(),
            header: None,
            error: Some(error.to_string()),
            stripes: Vec::new(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

impl fmt::Display for SpanReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some(header) = &self.header else {
            let reason = self.error.as_deref().unwrap_or("unknown error");
            return writeln!(f, "Span: {} unusable: {}", self.path.display(), reason);
        };

        writeln!(
            f,
            "Span: {} {} Volumes {} in use {} free {} stripes {} blocks",
            self.path.display(),
            header.n_stripes,
            header.n_used,
            header.n_free,
            header.n_stripe_spans,
            header.n_storage_blocks
        )?;
        if let Some(error) = &self.error {
            writeln!(f, "    ! {}", error)?;
        }

        for stripe in &self.stripes {
            writeln!(
                f,
                "    : SpanBlock {} @ {} blocks={} vol={} type={} {}",
                stripe.index,
                stripe.descriptor.offset,
                stripe.descriptor.len,
                stripe.descriptor.number,
                stripe.stripe_type,
                if stripe.free { "free" } else { "in-use" }
            )?;
            if let Some(meta) = &stripe.meta {
                writeln!(f, "      {}", meta)?;
            }
            if let Some(scan) = &stripe.scan {
                for copy in &scan.copies {
                    match copy.offset {
                        Some(offset) => writeln!(
                            f,
                            "      {} at {}{}",
                            copy.copy,
                            offset,
                            if copy.valid { "" } else { " (invalid)" }
                        )?,
                        None => writeln!(f, "      {} not found", copy.copy)?,
                    }
                }
                if let Some(geometry) = &scan.geometry {
                    writeln!(f, "      Stripe is {}", geometry)?;
                }
                match (&scan.selected, &scan.error) {
                    (Some((header, footer)), _) => {
                        writeln!(f, "      Using {} with {}", header, footer)?
                    }
                    (None, Some(error)) => writeln!(f, "      Invalid stripe data - {}", error)?,
                    (None, None) => {}
                }
            }
        }
        Ok(())
    }
}

/// Per-volume totals across spans.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VolumeSummary {
    pub volume: i32,
    pub stripes: usize,
    pub bytes: u64,
}

impl fmt::Display for VolumeSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Volume {} has {} stripes and {} bytes",
            self.volume, self.stripes, self.bytes
        )
    }
}

/// Describe the span at `path`. Never fails; problems end up in the report.
pub fn inspect_span<P: AsRef<Path>>(path: P, depth: InspectDepth) -> SpanReport {
    let path = path.as_ref();
    let mut span = match SpanFile::open(path) {
        Ok(span) => span,
        Err(e) => {
            warn!(span = %path.display(), error = %e, "cannot open span");
            return SpanReport::failed(path, e);
        }
    };

    let header = match span.read_header() {
        Ok(header) => header,
        Err(e) => {
            debug!(span = %path.display(), error = %e, "span header unreadable");
            return SpanReport::failed(path, e);
        }
    };
    // Inconsistent counts are reported, but the directory is still listed.
    let error = header.validate().err().map(|e| e.to_string());

    let stripes = header
        .stripes
        .iter()
        .enumerate()
        .map(|(index, descriptor)| inspect_stripe(&mut span, index, descriptor, depth))
        .collect();

    SpanReport {
        path: path.to_path_buf(),
        header: Some(header),
        error,
        stripes,
    }
}

fn inspect_stripe(
    span: &mut SpanFile,
    index: usize,
    descriptor: &StripeSpanDescriptor,
    depth: InspectDepth,
) -> StripeReport {
    let mut report = StripeReport {
        index,
        descriptor: *descriptor,
        stripe_type: descriptor.stripe_type(),
        free: descriptor.is_free(),
        meta: None,
        scan: None,
    };
    if descriptor.is_free() {
        return report;
    }

    report.meta = Some(match span.read_meta(descriptor.offset, 0) {
        Ok(Ok(meta)) => MetaStatus::Valid {
            major: meta.version_major,
            minor: meta.version_minor,
            generation: meta.generation,
            sync_serial: meta.sync_serial,
        },
        Ok(Err(FormatError::BadMagic { found, .. })) => MetaStatus::BadMagic { found },
        Ok(Err(e)) => MetaStatus::Invalid {
            reason: e.to_string(),
        },
        Err(e) => MetaStatus::ReadFailed {
            reason: e.to_string(),
        },
    });

    if depth >= InspectDepth::Stripe {
        report.scan = Some(scan_stripe(span, descriptor));
    }
    report
}

fn scan_stripe(span: &mut SpanFile, descriptor: &StripeSpanDescriptor) -> StripeScanReport {
    let scan = match span.scan_stripe(descriptor) {
        Ok(scan) => scan,
        Err(e) => {
            return StripeScanReport {
                copies: Vec::new(),
                layout: None,
                geometry: None,
                selected: None,
                error: Some(e.to_string()),
            }
        }
    };

    let copies = MetaCopy::ALL
        .into_iter()
        .map(|copy| {
            let meta = scan.copies.get(copy);
            CopyReport {
                copy,
                offset: scan.position(copy),
                valid: meta.is_some(),
                sync_serial: meta.map(|m| m.sync_serial),
            }
        })
        .collect();

    let (selected, error) = match scan.copies.reconcile() {
        Ok(r) => (Some((r.header_copy, r.footer_copy)), None),
        Err(e) => {
            let reason = if scan.copies.valid_count() > 0 {
                "candidates found but sync serial data not valid".to_string()
            } else {
                e.to_string()
            };
            (None, Some(reason))
        }
    };

    StripeScanReport {
        copies,
        layout: scan.layout,
        geometry: scan.layout.map(|l| l.geometry()),
        selected,
        error,
    }
}

/// Stripe counts and byte totals per volume over the readable spans.
pub fn volumes(reports: &[SpanReport]) -> Vec<VolumeSummary> {
    let mut totals: BTreeMap<i32, (usize, u64)> = BTreeMap::new();
    for report in reports {
        for stripe in report.stripes.iter().filter(|s| !s.free) {
            let entry = totals.entry(stripe.descriptor.number).or_default();
            entry.0 += 1;
            entry.1 = entry.1.saturating_add(stripe.descriptor.len_bytes().unwrap_or(u64::MAX));
        }
    }
    totals
        .into_iter()
        .map(|(volume, (stripes, bytes))| VolumeSummary {
            volume,
            stripes,
            bytes,
        })
        .collect()
}

/// Zero the header block of the span at `path`.
pub fn clear_span<P: AsRef<Path>>(path: P) -> Result<()> {
    let mut span = SpanFile::open_rw(path.as_ref())?;
    span.clear()?;
    info!(span = %path.as_ref().display(), bytes = STORE_BLOCK_SIZE, "span header cleared");
    Ok(())
}

/// Expand a command-line target into span paths.
///
/// A target whose leading bytes are text (no NUL byte, valid UTF-8) is read
/// as a storage list; anything else is taken to be a span.
pub fn resolve_target<P: AsRef<Path>>(target: P) -> Result<Vec<PathBuf>> {
    let target = target.as_ref();
    let mut head = Vec::with_capacity(512);
    fs::File::open(target)?.take(512).read_to_end(&mut head)?;

    let is_text = !head.is_empty() && !head.contains(&0) && std::str::from_utf8(&head).is_ok();
    if !is_text {
        return Ok(vec![target.to_path_buf()]);
    }

    let storage = StorageConfig::load(target)?;
    if storage.entries.is_empty() {
        return Err(CacheError::Config(format!(
            "{} lists no spans",
            target.display()
        )));
    }
    debug!(list = %target.display(), spans = storage.entries.len(), "storage list loaded");
    Ok(storage.paths().map(Path::to_path_buf).collect())
}
