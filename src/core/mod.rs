//! Storage engine core
//!
//! ## On-disk formats
//!
//! - [`layout`] - Storage units, format version and native-order codecs
//! - [`span`] - Span header and stripe span directory
//! - [`stripe_meta`] - Stripe descriptor copies and their reconciliation
//! - [`io`] - Span file access and descriptor copy location
//! - [`mount`] - Mounting spans and formatting new ones
//!
//! ## Write admission
//!
//! - [`stripe`] - Mounted stripe state and counters
//! - [`open_dir`] - In-flight writes per stripe
//! - [`lock`] - Per-stripe wait queues and dispatch
//! - [`scheduler`] - Deferred dispatch triggers
//! - [`worker`] - Per-thread write-lock acquisition
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use span_cache::config::CacheConfig;
//! use span_cache::core::key::CacheKey;
//! use span_cache::core::lock::Continuation;
//! use span_cache::core::mount::CacheMount;
//! use span_cache::core::worker::{OpOutcome, WriteOp, WriteRequest};
//! use std::sync::Arc;
//!
//! # fn main() -> span_cache::Result<()> {
//! let mount = CacheMount::mount(&["/var/cache/span0"], Arc::new(CacheConfig::default()));
//! let mut worker = mount.worker();
//!
//! if let Some(stripe) = mount.stripes().next() {
//!     let cont = Continuation::new(|_event| { /* retry open_write */ });
//!     let mut request = WriteRequest::new(CacheKey::hash(b"http://example.com/"), WriteOp::Write, cont);
//!     match worker.open_write(stripe, &mut request)? {
//!         OpOutcome::Done => println!("write admitted"),
//!         OpOutcome::Wait(_handle) => {
//!             worker.run_until_idle(16);
//!         }
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod io;
pub mod key;
pub mod layout;
pub mod lock;
pub mod mount;
pub mod open_dir;
pub mod scheduler;
pub mod span;
pub mod stripe;
pub mod stripe_meta;
pub mod worker;

pub use key::CacheKey;
pub use lock::{Continuation, LockWaiter, StripeEvent};
pub use mount::{format_span, CacheMount, MountedSpan};
pub use span::{SpanHeader, StripeSpanDescriptor};
pub use stripe::{Stripe, StripeId, StripeState};
pub use stripe_meta::{MetaCopy, StripeCopies, StripeMeta};
pub use worker::{OpOutcome, StripeWorker, WriteOp, WriteRequest};
