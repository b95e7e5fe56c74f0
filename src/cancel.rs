//! Cooperative cancellation shared by every pipeline stage.

use thiserror::Error;
pub use tokio_util::sync::CancellationToken;

use crate::measure::MeasureError;

/// Raised when a stage observes a tripped [`CancellationToken`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation cancelled")]
pub struct Cancelled;

/// Fail fast if the run has been cancelled.
pub fn check(token: &CancellationToken) -> Result<(), Cancelled> {
    if token.is_cancelled() {
        Err(Cancelled)
    } else {
        Ok(())
    }
}

/// True when `err` (or anything in its chain) is a cancellation.
pub fn is_cancelled(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause.downcast_ref::<Cancelled>().is_some()
            || matches!(cause.downcast_ref::<MeasureError>(), Some(MeasureError::Cancelled))
            || cause
                .downcast_ref::<crate::pipeline::PipelineError>()
                .is_some_and(|e| matches!(e, crate::pipeline::PipelineError::Cancelled { .. }))
    })
}
