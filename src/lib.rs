//! # span-cache - Proxy Cache Storage Engine
//!
//! `span-cache` reads and mounts the raw storage of an HTTP proxy cache and
//! admits writes to it:
//!
//! - **Spans**: raw storage regions (files, partitions, devices), each with a
//!   header describing how it is cut into stripes
//! - **Stripes**: independent cache partitions whose state is kept in four
//!   redundant descriptor copies, reconciled after an unclean shutdown
//! - **Write admission**: non-blocking per-stripe locking with FIFO wait
//!   queues, deferred retries and backlog-based refusal of new writes
//! - **Inspection**: read-only reports on span and stripe metadata, used by
//!   the `span-inspect` tool
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use span_cache::inspector::{inspect_span, InspectDepth};
//!
//! let report = inspect_span("/dev/sdb", InspectDepth::Stripe);
//! print!("{}", report);
//! ```
//!
//! All on-disk integers are in the byte order of the host that wrote them.

pub mod config;
pub mod core;
pub mod error;
pub mod inspector;

pub use crate::config::{CacheConfig, StorageConfig};
pub use crate::core::{
    CacheKey, CacheMount, Continuation, OpOutcome, Stripe, StripeEvent, StripeWorker, WriteOp,
    WriteRequest,
};
pub use crate::error::{CacheError, FormatError, Result};
