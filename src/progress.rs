//! Progress reporting hooks for batch runs.
//!
//! The library reports progress through a caller-supplied callback
//! rather than printing anything itself — the CLI renders an indicatif
//! bar, tests count invocations, servers can forward events. Methods
//! have empty default bodies so implementors override only what they
//! display.

use std::sync::Arc;

/// Callbacks fired by [`crate::batch::run_all`] as submissions move
/// through the pipeline. All methods are optional.
///
/// Implementations must be `Send + Sync`: submissions complete on worker
/// tasks, out of order.
pub trait BatchProgress: Send + Sync {
    /// Fired once the work set is known.
    fn on_batch_start(&self, _total_submissions: usize) {}

    /// A submission has been picked up by a worker.
    fn on_submission_start(&self, _name: &str) {}

    /// A submission committed its manifest.
    fn on_submission_complete(&self, _name: &str, _completed: usize, _total: usize) {}

    /// A submission failed (rolled back, cancelled, or crashed).
    fn on_submission_failed(&self, _name: &str, _completed: usize, _total: usize, _reason: &str) {}

    /// Fired after the summary has been written.
    fn on_batch_complete(&self, _total: usize, _successful: usize) {}
}

/// A progress callback that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProgress;

impl BatchProgress for NoopProgress {}

/// Convenience constructor for the common "no progress display" case.
pub fn noop() -> Arc<dyn BatchProgress> {
    Arc::new(NoopProgress)
}
