//! Progress-callback trait for per-request pipeline events.
//!
//! Inject an [`Arc<dyn ConversionProgressCallback>`] via
//! [`crate::config::ConversionConfigBuilder::progress_callback`] to receive
//! events as the orchestrator moves a request through its stages.
//!
//! The trait is `Send + Sync`: a batch run drives many requests at once and
//! all of them report to the same callback.
//!
//! # Example
//!
//! ```rust
//! use docmost_convert::{ConversionProgressCallback, ConversionConfig, Stage};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct StageCounter {
//!     finished: AtomicUsize,
//! }
//!
//! impl ConversionProgressCallback for StageCounter {
//!     fn on_stage_complete(&self, filename: &str, stage: Stage) {
//!         self.finished.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("{filename}: {stage} done");
//!     }
//! }
//!
//! let counter = Arc::new(StageCounter { finished: AtomicUsize::new(0) });
//!
//! let config = ConversionConfig::builder()
//!     .progress_callback(counter as Arc<dyn ConversionProgressCallback>)
//!     .build()
//!     .unwrap();
//! ```

use crate::error::Stage;
use std::sync::Arc;

/// Called by the orchestrator as a request advances.
///
/// All methods default to no-ops so callers only override what they need.
/// Events for different requests may arrive concurrently from different
/// tasks; implementations must synchronise their own state.
pub trait ConversionProgressCallback: Send + Sync {
    /// A request entered the pipeline.
    fn on_request_start(&self, filename: &str, size_bytes: usize) {
        let _ = (filename, size_bytes);
    }

    /// A stage is about to run.
    fn on_stage_start(&self, filename: &str, stage: Stage) {
        let _ = (filename, stage);
    }

    /// A stage finished successfully.
    fn on_stage_complete(&self, filename: &str, stage: Stage) {
        let _ = (filename, stage);
    }

    /// The request moved to `Failed`.
    ///
    /// # Arguments
    /// * `stage`: the stage that failed
    /// * `error`: human-readable error description
    fn on_request_failed(&self, filename: &str, stage: Stage, error: &str) {
        let _ = (filename, stage, error);
    }

    /// The request reached `Done`.
    ///
    /// # Arguments
    /// * `archive_len`: size of the ZIP in bytes
    /// * `image_count`: number of images packaged
    fn on_request_complete(&self, filename: &str, archive_len: usize, image_count: usize) {
        let _ = (filename, archive_len, image_count);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl ConversionProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::ConversionConfig`].
pub type ProgressCallback = Arc<dyn ConversionProgressCallback>;
