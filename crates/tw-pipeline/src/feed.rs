//! Producer-side handle of one query.

use crate::error::{PipelineError, PipelineResult};
use crate::orchestrator::PipelineHandle;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tw_core::{ListingBatch, SourceToken};
use tw_registry::LifecycleSummary;

/// Handle given to the poller of one query/tab.
///
/// Cancelled when the query is removed or re-homed; a poller should stop
/// once [`cancelled`](Self::cancelled) resolves.
pub struct SourceFeed<P> {
    token: SourceToken,
    handle: PipelineHandle<P>,
    cancel: CancellationToken,
}

impl<P: Send + Sync + 'static> SourceFeed<P> {
    pub(crate) fn new(token: SourceToken, handle: PipelineHandle<P>, cancel: CancellationToken) -> Self {
        Self {
            token,
            handle,
            cancel,
        }
    }

    pub fn token(&self) -> SourceToken {
        self.token
    }

    /// Deliver one refresh worth of listings.
    ///
    /// Resolves once the batch has been applied (or rejected as a whole).
    pub async fn publish_batch(&self, batch: ListingBatch<P>) -> PipelineResult<LifecycleSummary> {
        self.ensure_open()?;
        self.handle.apply_batch(self.token, batch).await
    }

    pub async fn set_busy(&self, busy: bool) -> PipelineResult<()> {
        self.ensure_open()?;
        self.handle.set_busy(self.token, busy).await
    }

    /// Record a non-fatal source error in the pipeline's error log.
    pub async fn report_error(&self, message: impl Into<String>) -> PipelineResult<()> {
        self.ensure_open()?;
        self.handle.report_error(Some(self.token), message).await
    }

    /// Signal that the marketplace wants a verification at `uri`.
    pub async fn require_verification(&self, uri: impl Into<String>) -> PipelineResult<()> {
        self.ensure_open()?;
        self.handle.require_verification(self.token, uri).await
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the query is removed, re-homed or the pipeline stops.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    fn ensure_open(&self) -> PipelineResult<()> {
        if self.cancel.is_cancelled() {
            return Err(PipelineError::SourceClosed(self.token));
        }
        Ok(())
    }
}

impl<P> Clone for SourceFeed<P> {
    fn clone(&self) -> Self {
        Self {
            token: self.token,
            handle: self.handle.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

impl<P> std::fmt::Debug for SourceFeed<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceFeed")
            .field("token", &self.token)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}
