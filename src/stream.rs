//! Batch API: convert many documents concurrently, emitting results as they finish.
//!
//! Each request runs its own independent pipeline through a shared
//! [`Orchestrator`]; the only thing the requests share is the backend's
//! connection pool. Results arrive in completion order, not submission
//! order, tagged with the originating filename.

use crate::config::ConversionConfig;
use crate::convert::Orchestrator;
use crate::error::{ConvertError, FailureReport};
use crate::output::{ConversionRequest, OutputArchive};
use futures::stream::{self, StreamExt};
use std::pin::Pin;
use tokio_stream::Stream;
use tracing::info;

/// One finished request: its filename and its outcome.
pub type BatchItem = (String, Result<OutputArchive, FailureReport>);

/// A boxed stream of batch results.
pub type BatchStream = Pin<Box<dyn Stream<Item = BatchItem> + Send>>;

/// Convert `requests` with at most `concurrency` pipelines in flight.
///
/// A failing request never affects the others. A `concurrency` of 0 is
/// treated as 1.
///
/// # Errors
/// Only when the backend transport cannot be constructed from `config`.
pub fn process_batch(
    requests: Vec<ConversionRequest>,
    config: &ConversionConfig,
    concurrency: usize,
) -> Result<BatchStream, ConvertError> {
    let orchestrator = Orchestrator::new(config)?;
    let concurrency = concurrency.max(1);
    info!(
        "Starting batch of {} document(s), concurrency {}",
        requests.len(),
        concurrency
    );

    let s = stream::iter(requests.into_iter().map(move |request| {
        let orchestrator = orchestrator.clone();
        async move {
            let result = orchestrator.process(&request).await;
            (request.filename, result)
        }
    }))
    .buffer_unordered(concurrency);

    Ok(Box::pin(s))
}
