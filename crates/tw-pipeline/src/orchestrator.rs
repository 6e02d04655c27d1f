//! Pipeline actor.
//!
//! All registry mutation, aggregation and view recomputation happen on one
//! task fed by a bounded channel. Producers and the presentation layer talk
//! to it through a cloneable [`PipelineHandle`].
//!
//! # Batch ordering
//!
//! Batches of one source are applied strictly in arrival order. A batch at
//! or above `parallel_classify_threshold` is classified on the blocking
//! pool against a snapshot of the states it touches; while that runs, later
//! batches of the same source are queued on the actor and other sources
//! keep flowing. Commands that reshape the tree (adding, removing or
//! re-homing a source, mark-all-read, clear) wait on the actor until no
//! classification is in flight, and later batches and tree commands wait
//! behind them, so every plan is applied against the state it was
//! classified from.
//!
//! # Handle caches
//!
//! Per-source status lives in a `DashMap` written by the actor and read
//! synchronously from the handle. The projection is published through a
//! `watch` channel, verification signals through a `broadcast` channel.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use tw_core::{ListingBatch, ListingItem, PageRequest, PageResponse, SortDirection, SortKeySpec, SourceToken};
use tw_feed::{FeedResult, MergeDelta, SourceKind, SourceTree};
use tw_registry::{classify, BatchRejection, LifecycleSummary, ProtocolViolation, RegistryError, TransitionPlan};
use tw_telemetry::PipelineMetrics;
use tw_view::{
    FlushOutcome, ItemPredicate, ListingView, QuickFilterMatcher, SortKeyTable, ViewError,
};

use crate::config::PipelineConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::error_log::{ErrorLog, ErrorRecord};
use crate::feed::SourceFeed;
use crate::projection::{Projection, VerificationRequired};

const VERIFICATION_CHANNEL_CAPACITY: usize = 16;

type Reply<T> = oneshot::Sender<PipelineResult<T>>;

// ============================================================================
// SourceStatus
// ============================================================================

/// Status of one registered source, readable without a round-trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceStatus {
    pub kind: SourceKind,
    pub label: String,
    pub parent: Option<SourceToken>,
    /// Mid-refresh, as reported by the producer.
    pub busy: bool,
    /// Why the source stopped accepting batches, if it did.
    pub faulted: Option<String>,
}

// ============================================================================
// PipelineMsg
// ============================================================================

/// Messages for the pipeline actor.
pub enum PipelineMsg<P> {
    /// Register an empty query or group.
    AddSource {
        parent: Option<SourceToken>,
        kind: SourceKind,
        label: String,
        reply: Reply<(SourceToken, CancellationToken)>,
    },

    /// Remove a source and its subtree. Replies with the removed tokens.
    RemoveSource {
        token: SourceToken,
        reply: Reply<Vec<SourceToken>>,
    },

    /// Replace a query with a fresh one under the same parent.
    RehomeSource {
        token: SourceToken,
        reply: Reply<(SourceToken, CancellationToken)>,
    },

    /// Classify and apply one batch.
    ApplyBatch {
        token: SourceToken,
        batch: ListingBatch<P>,
        reply: Reply<LifecycleSummary>,
    },

    SetBusy {
        token: SourceToken,
        busy: bool,
    },

    /// Non-fatal error reported by a source (or by the caller).
    SourceError {
        token: Option<SourceToken>,
        message: String,
    },

    VerificationRequired {
        token: SourceToken,
        uri: String,
    },

    MarkAllRead {
        reply: Reply<()>,
    },

    /// Delete the listings of one query, or of every query.
    Clear {
        token: Option<SourceToken>,
        reply: Reply<()>,
    },

    SetShowNew(bool),

    SetShowRemoved(bool),

    SetQuickFilter(String),

    SetCustomPredicate(Option<ItemPredicate<P>>),

    /// Activate sort keys (already validated by the handle).
    SetSortKeys(Vec<SortKeySpec>),

    /// Queue a page request. Replies with the page it resolves to now.
    RequestPage {
        request: PageRequest,
        reply: Reply<PageResponse>,
    },

    /// Recompute every pending stage now and publish.
    Flush {
        reply: oneshot::Sender<()>,
    },

    /// Stop the actor.
    Shutdown,
}

impl<P> std::fmt::Debug for PipelineMsg<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AddSource { parent, kind, label, .. } => f
                .debug_struct("AddSource")
                .field("parent", parent)
                .field("kind", kind)
                .field("label", label)
                .finish(),
            Self::RemoveSource { token, .. } => write!(f, "RemoveSource({token})"),
            Self::RehomeSource { token, .. } => write!(f, "RehomeSource({token})"),
            Self::ApplyBatch { token, batch, .. } => {
                write!(f, "ApplyBatch({token}, {} entries)", batch.len())
            }
            Self::SetBusy { token, busy } => write!(f, "SetBusy({token}, {busy})"),
            Self::SourceError { token, message } => write!(f, "SourceError({token:?}, {message})"),
            Self::VerificationRequired { token, uri } => {
                write!(f, "VerificationRequired({token}, {uri})")
            }
            Self::MarkAllRead { .. } => write!(f, "MarkAllRead"),
            Self::Clear { token, .. } => write!(f, "Clear({token:?})"),
            Self::SetShowNew(show) => write!(f, "SetShowNew({show})"),
            Self::SetShowRemoved(show) => write!(f, "SetShowRemoved({show})"),
            Self::SetQuickFilter(text) => write!(f, "SetQuickFilter({text:?})"),
            Self::SetCustomPredicate(p) => write!(f, "SetCustomPredicate({})", p.is_some()),
            Self::SetSortKeys(keys) => write!(f, "SetSortKeys({keys:?})"),
            Self::RequestPage { request, .. } => write!(f, "RequestPage({request:?})"),
            Self::Flush { .. } => write!(f, "Flush"),
            Self::Shutdown => write!(f, "Shutdown"),
        }
    }
}

impl<P> PipelineMsg<P> {
    /// Touches the source tree, so keeps its place relative to batches.
    fn is_ordered(&self) -> bool {
        matches!(
            self,
            Self::AddSource { .. }
                | Self::RemoveSource { .. }
                | Self::RehomeSource { .. }
                | Self::ApplyBatch { .. }
                | Self::MarkAllRead { .. }
                | Self::Clear { .. }
        )
    }

    /// Cannot run while any batch is being classified off the actor.
    fn is_barrier(&self) -> bool {
        self.is_ordered() && !matches!(self, Self::ApplyBatch { .. })
    }
}

// ============================================================================
// PipelineTask
// ============================================================================

struct QueuedBatch<P> {
    batch: ListingBatch<P>,
    reply: Reply<LifecycleSummary>,
}

struct SourceSlot<P> {
    busy: bool,
    faulted: Option<String>,
    /// A batch of this source is being classified off the actor.
    in_flight: bool,
    queued: VecDeque<QueuedBatch<P>>,
    cancel: CancellationToken,
}

impl<P> SourceSlot<P> {
    fn new(cancel: CancellationToken) -> Self {
        Self {
            busy: false,
            faulted: None,
            in_flight: false,
            queued: VecDeque::new(),
            cancel,
        }
    }
}

/// Result of an off-actor classification.
struct PlanOutcome<P> {
    token: SourceToken,
    batch_len: usize,
    started: Instant,
    result: Result<Result<TransitionPlan<P>, Vec<ProtocolViolation>>, JoinError>,
    reply: Reply<LifecycleSummary>,
}

/// The pipeline actor.
pub struct PipelineTask<P> {
    rx: mpsc::Receiver<PipelineMsg<P>>,
    plan_tx: mpsc::UnboundedSender<PlanOutcome<P>>,
    plan_rx: mpsc::UnboundedReceiver<PlanOutcome<P>>,
    tree: SourceTree<P>,
    view: ListingView<P>,
    slots: HashMap<SourceToken, SourceSlot<P>>,
    /// Ordered commands held back behind a tree-reshaping command.
    deferred: VecDeque<PipelineMsg<P>>,
    status: Arc<DashMap<SourceToken, SourceStatus>>,
    errors: Arc<ErrorLog>,
    projection_tx: watch::Sender<Projection<P>>,
    verification_tx: broadcast::Sender<VerificationRequired>,
    metrics: PipelineMetrics,
    parallel_threshold: usize,
    /// Parent of every feed's cancellation token.
    shutdown: CancellationToken,
    revision: u64,
    /// Projection is out of date even if no view stage ran.
    dirty: bool,
}

impl<P: Send + Sync + 'static> PipelineTask<P> {
    /// Run the actor until `Shutdown` or until every handle is dropped.
    pub async fn run(mut self) {
        info!("Pipeline started");

        loop {
            let deadline = self.view.next_deadline();
            tokio::select! {
                msg = self.rx.recv() => match msg {
                    Some(PipelineMsg::Shutdown) | None => break,
                    Some(msg) => self.handle_message(msg),
                },
                Some(outcome) = self.plan_rx.recv() => self.on_plan_ready(outcome),
                _ = wait_until(deadline) => {}
            }
            self.poll_view();
        }

        self.shutdown.cancel();
        info!(sources = self.tree.len(), "Pipeline stopped");
    }

    fn handle_message(&mut self, msg: PipelineMsg<P>) {
        trace!(?msg, "Pipeline message");
        let must_wait = !self.deferred.is_empty() || (msg.is_barrier() && self.any_in_flight());
        if msg.is_ordered() && must_wait {
            debug!(?msg, waiting = self.deferred.len(), "Command deferred behind classification");
            self.deferred.push_back(msg);
            return;
        }
        self.dispatch(msg);
    }

    /// Run deferred commands until a barrier meets a classification in flight.
    fn drain_deferred(&mut self) {
        while let Some(front) = self.deferred.front() {
            if front.is_barrier() && self.any_in_flight() {
                return;
            }
            let Some(msg) = self.deferred.pop_front() else {
                return;
            };
            self.dispatch(msg);
        }
    }

    fn any_in_flight(&self) -> bool {
        self.slots.values().any(|s| s.in_flight)
    }

    fn dispatch(&mut self, msg: PipelineMsg<P>) {
        let now = Instant::now();
        match msg {
            PipelineMsg::AddSource {
                parent,
                kind,
                label,
                reply,
            } => {
                let _ = reply.send(self.on_add_source(parent, kind, label));
            }
            PipelineMsg::RemoveSource { token, reply } => {
                let _ = reply.send(self.on_remove_source(token));
            }
            PipelineMsg::RehomeSource { token, reply } => {
                let _ = reply.send(self.on_rehome_source(token));
            }
            PipelineMsg::ApplyBatch {
                token,
                batch,
                reply,
            } => self.on_apply_batch(token, batch, reply),
            PipelineMsg::SetBusy { token, busy } => self.on_set_busy(token, busy),
            PipelineMsg::SourceError { token, message } => {
                warn!(source = ?token, %message, "Source error");
                self.metrics.source_error();
                self.errors.push(token, message);
            }
            PipelineMsg::VerificationRequired { token, uri } => {
                info!(%token, %uri, "Verification required");
                self.metrics.verification_required();
                // No subscriber is not an error.
                let _ = self.verification_tx.send(VerificationRequired { token, uri });
            }
            PipelineMsg::MarkAllRead { reply } => {
                let result = self.tree.mark_all_read(Utc::now()).map_err(PipelineError::from);
                let _ = reply.send(self.after_bulk_change(result, "read"));
            }
            PipelineMsg::Clear { token, reply } => {
                let result = self.tree.clear(token).map_err(PipelineError::from);
                let _ = reply.send(self.after_bulk_change(result, "cleared"));
            }
            PipelineMsg::SetShowNew(show) => self.view.set_show_new(show, now),
            PipelineMsg::SetShowRemoved(show) => self.view.set_show_removed(show, now),
            PipelineMsg::SetQuickFilter(text) => self.view.set_quick_filter(text, now),
            PipelineMsg::SetCustomPredicate(predicate) => {
                self.view.set_custom_predicate(predicate, now)
            }
            PipelineMsg::SetSortKeys(keys) => {
                if let Err(e) = self.view.set_sort_keys(keys, now) {
                    error!(error = %e, "Sort keys rejected after validation");
                }
            }
            PipelineMsg::RequestPage { request, reply } => {
                let _ = reply.send(self.view.request_page(request, now).map_err(PipelineError::from));
            }
            PipelineMsg::Flush { reply } => {
                let outcome = self.view.flush();
                self.record_outcome(outcome);
                self.dirty = true;
                self.poll_view();
                let _ = reply.send(());
            }
            PipelineMsg::Shutdown => {}
        }
    }

    // ========================================================================
    // Sources
    // ========================================================================

    fn on_add_source(
        &mut self,
        parent: Option<SourceToken>,
        kind: SourceKind,
        label: String,
    ) -> PipelineResult<(SourceToken, CancellationToken)> {
        let token = self.tree.add(parent, kind, label.clone())?;
        let cancel = self.shutdown.child_token();
        self.slots.insert(token, SourceSlot::new(cancel.clone()));
        self.status.insert(
            token,
            SourceStatus {
                kind,
                label,
                parent,
                busy: false,
                faulted: None,
            },
        );
        self.metrics.set_sources(self.tree.len());
        Ok((token, cancel))
    }

    fn on_remove_source(&mut self, token: SourceToken) -> PipelineResult<Vec<SourceToken>> {
        let (removed, delta) = self.tree.remove(token)?;
        for t in &removed {
            self.drop_slot(*t);
        }
        self.apply_delta(delta);
        self.metrics.set_sources(self.tree.len());
        self.refresh_busy();
        Ok(removed)
    }

    fn on_rehome_source(
        &mut self,
        token: SourceToken,
    ) -> PipelineResult<(SourceToken, CancellationToken)> {
        let status = self
            .status
            .get(&token)
            .map(|s| s.value().clone())
            .ok_or(PipelineError::UnknownSource(token))?;

        let (replacement, delta) = self.tree.rehome(token)?;
        self.drop_slot(token);
        self.apply_delta(delta);

        let cancel = self.shutdown.child_token();
        self.slots.insert(replacement, SourceSlot::new(cancel.clone()));
        self.status.insert(
            replacement,
            SourceStatus {
                busy: false,
                faulted: None,
                ..status
            },
        );
        self.refresh_busy();
        info!(old = %token, new = %replacement, "Source re-homed");
        Ok((replacement, cancel))
    }

    /// Forget a source: cancel its feed and fail its queued batches.
    fn drop_slot(&mut self, token: SourceToken) {
        self.status.remove(&token);
        if let Some(slot) = self.slots.remove(&token) {
            slot.cancel.cancel();
            for queued in slot.queued {
                let _ = queued.reply.send(Err(PipelineError::SourceClosed(token)));
            }
        }
    }

    fn on_set_busy(&mut self, token: SourceToken, busy: bool) {
        let Some(slot) = self.slots.get_mut(&token) else {
            debug!(%token, "Busy flag for unknown source ignored");
            return;
        };
        if slot.busy != busy {
            slot.busy = busy;
            if let Some(mut status) = self.status.get_mut(&token) {
                status.busy = busy;
            }
            self.refresh_busy();
        }
    }

    fn refresh_busy(&mut self) {
        let busy = self.slots.values().filter(|s| s.busy).count();
        self.metrics.set_busy_sources(busy);
        self.dirty = true;
    }

    fn fault(&mut self, token: SourceToken, reason: String) {
        if let Some(slot) = self.slots.get_mut(&token) {
            slot.faulted = Some(reason.clone());
        }
        if let Some(mut status) = self.status.get_mut(&token) {
            status.faulted = Some(reason.clone());
        }
        self.errors.push(Some(token), format!("source faulted: {reason}"));
    }

    // ========================================================================
    // Batches
    // ========================================================================

    fn on_apply_batch(
        &mut self,
        token: SourceToken,
        batch: ListingBatch<P>,
        reply: Reply<LifecycleSummary>,
    ) {
        let Some(slot) = self.slots.get_mut(&token) else {
            let _ = reply.send(Err(PipelineError::UnknownSource(token)));
            return;
        };
        if let Some(reason) = &slot.faulted {
            self.metrics.batch_rejected("faulted");
            let _ = reply.send(Err(PipelineError::SourceFaulted {
                token,
                reason: reason.clone(),
            }));
            return;
        }
        if slot.in_flight {
            trace!(%token, entries = batch.len(), "Batch queued behind classification");
            slot.queued.push_back(QueuedBatch { batch, reply });
            return;
        }
        self.start_batch(token, batch, reply);
    }

    fn start_batch(&mut self, token: SourceToken, batch: ListingBatch<P>, reply: Reply<LifecycleSummary>) {
        let started = Instant::now();
        if batch.len() < self.parallel_threshold {
            let result = self.tree.apply_batch(token, batch, Utc::now());
            self.finish_batch(token, result, reply, "inline", started);
            return;
        }

        let snapshot = match self.tree.registry(token) {
            Ok(registry) => registry.state_snapshot(&batch),
            Err(e) => {
                let _ = reply.send(Err(e.into()));
                return;
            }
        };
        let Some(slot) = self.slots.get_mut(&token) else {
            let _ = reply.send(Err(PipelineError::UnknownSource(token)));
            return;
        };
        slot.in_flight = true;
        let batch_len = batch.len();
        debug!(%token, batch_len, "Classifying batch on blocking pool");

        let plan_tx = self.plan_tx.clone();
        tokio::spawn(async move {
            let result = tokio::task::spawn_blocking(move || classify(batch, &snapshot)).await;
            let _ = plan_tx.send(PlanOutcome {
                token,
                batch_len,
                started,
                result,
                reply,
            });
        });
    }

    fn on_plan_ready(&mut self, outcome: PlanOutcome<P>) {
        let PlanOutcome {
            token,
            batch_len,
            started,
            result,
            reply,
        } = outcome;

        let Some(slot) = self.slots.get_mut(&token) else {
            let _ = reply.send(Err(PipelineError::SourceClosed(token)));
            self.drain_deferred();
            return;
        };
        slot.in_flight = false;

        let result = match result {
            Ok(Ok(plan)) => self.tree.apply_plan(token, plan, Utc::now()),
            Ok(Err(violations)) => Err(RegistryError::ProtocolViolation(BatchRejection {
                batch_len,
                violations,
            })
            .into()),
            Err(e) => {
                error!(%token, error = %e, "Classification worker failed");
                self.fault(token, format!("classification failed: {e}"));
                let _ = reply.send(Err(PipelineError::SourceFaulted {
                    token,
                    reason: e.to_string(),
                }));
                self.drain_queue(token);
                self.drain_deferred();
                return;
            }
        };
        self.finish_batch(token, result, reply, "blocking", started);
        self.drain_queue(token);
        self.drain_deferred();
    }

    /// Start queued batches until one goes off the actor again.
    fn drain_queue(&mut self, token: SourceToken) {
        loop {
            let Some(slot) = self.slots.get_mut(&token) else {
                return;
            };
            if slot.in_flight {
                return;
            }
            let Some(queued) = slot.queued.pop_front() else {
                return;
            };
            if let Some(reason) = &slot.faulted {
                self.metrics.batch_rejected("faulted");
                let _ = queued.reply.send(Err(PipelineError::SourceFaulted {
                    token,
                    reason: reason.clone(),
                }));
                continue;
            }
            self.start_batch(token, queued.batch, queued.reply);
        }
    }

    fn finish_batch(
        &mut self,
        token: SourceToken,
        result: FeedResult<(LifecycleSummary, MergeDelta<P>)>,
        reply: Reply<LifecycleSummary>,
        mode: &str,
        started: Instant,
    ) {
        self.metrics.observe_apply(mode, started.elapsed().as_secs_f64());
        match result {
            Ok((summary, delta)) => {
                self.metrics.batch_applied();
                self.metrics.transitions("created", summary.created);
                self.metrics.transitions("reappeared", summary.reappeared);
                self.metrics.transitions("removed", summary.removed);
                debug!(
                    %token,
                    created = summary.created,
                    reappeared = summary.reappeared,
                    removed = summary.removed,
                    upserts = delta.upserts.len(),
                    retractions = delta.retractions.len(),
                    "Batch applied"
                );
                self.apply_delta(delta);
                let _ = reply.send(Ok(summary));
            }
            Err(e) => {
                let e = PipelineError::from(e);
                if e.is_protocol_violation() {
                    warn!(%token, error = %e, "Batch rejected");
                    self.metrics.batch_rejected("protocol_violation");
                    self.fault(token, e.to_string());
                } else if e.is_desync() {
                    error!(%token, error = %e, "Registry desync");
                    self.metrics.batch_rejected("desync");
                    self.fault(token, e.to_string());
                }
                let _ = reply.send(Err(e));
            }
        }
    }

    fn after_bulk_change(&mut self, result: PipelineResult<MergeDelta<P>>, kind: &str) -> PipelineResult<()> {
        let delta = result?;
        self.metrics.transitions(kind, delta.len());
        self.apply_delta(delta);
        Ok(())
    }

    // ========================================================================
    // View
    // ========================================================================

    fn apply_delta(&mut self, delta: MergeDelta<P>) {
        if delta.is_empty() {
            return;
        }
        let MergeDelta {
            upserts,
            retractions,
        } = delta;
        if self.view.apply_changes(upserts, retractions, Instant::now()) {
            self.metrics.set_listings(self.view.counters());
            self.dirty = true;
        }
    }

    fn poll_view(&mut self) {
        let outcome = self.view.poll(Instant::now());
        self.record_outcome(outcome);
        if outcome.changed() || self.dirty {
            self.publish();
        }
    }

    fn record_outcome(&mut self, outcome: FlushOutcome) {
        if outcome.filtered {
            self.metrics.stage_rebuilt("filter");
        }
        if outcome.sorted {
            self.metrics.stage_rebuilt("sort");
        }
        if outcome.paged {
            self.metrics.stage_rebuilt("page");
        }
        if outcome.changed() {
            self.dirty = true;
        }
    }

    fn publish(&mut self) {
        self.revision += 1;
        self.dirty = false;
        let projection = Projection {
            page: self.view.page().to_vec(),
            page_info: self.view.page_info(),
            counters: self.view.counters(),
            is_busy: self.slots.values().any(|s| s.busy),
            revision: self.revision,
        };
        trace!(
            revision = projection.revision,
            page = projection.page.len(),
            total = projection.page_info.total_items,
            "Projection published"
        );
        self.projection_tx.send_replace(projection);
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

// ============================================================================
// PipelineHandle
// ============================================================================

/// Cloneable handle to a running pipeline.
pub struct PipelineHandle<P> {
    tx: mpsc::Sender<PipelineMsg<P>>,
    sort_table: Arc<SortKeyTable<P>>,
    status: Arc<DashMap<SourceToken, SourceStatus>>,
    errors: Arc<ErrorLog>,
    projection_rx: watch::Receiver<Projection<P>>,
    verification_tx: broadcast::Sender<VerificationRequired>,
    metrics: PipelineMetrics,
}

impl<P> Clone for PipelineHandle<P> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            sort_table: Arc::clone(&self.sort_table),
            status: Arc::clone(&self.status),
            errors: Arc::clone(&self.errors),
            projection_rx: self.projection_rx.clone(),
            verification_tx: self.verification_tx.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

impl<P: Send + Sync + 'static> PipelineHandle<P> {
    async fn send(&self, msg: PipelineMsg<P>) -> PipelineResult<()> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| PipelineError::ChannelClosed)
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> PipelineMsg<P> + Send,
    ) -> PipelineResult<T> {
        let (reply, rx) = oneshot::channel();
        self.send(build(reply)).await?;
        rx.await.map_err(|_| PipelineError::ChannelClosed)?
    }

    // === Sources ===

    /// Register a query and return the feed its poller publishes through.
    pub async fn add_query(
        &self,
        parent: Option<SourceToken>,
        label: impl Into<String>,
    ) -> PipelineResult<SourceFeed<P>> {
        let label = label.into();
        let (token, cancel) = self
            .request(|reply| PipelineMsg::AddSource {
                parent,
                kind: SourceKind::Query,
                label,
                reply,
            })
            .await?;
        Ok(SourceFeed::new(token, self.clone(), cancel))
    }

    /// Register a group that queries can be added under.
    pub async fn add_group(
        &self,
        parent: Option<SourceToken>,
        label: impl Into<String>,
    ) -> PipelineResult<SourceToken> {
        let label = label.into();
        let (token, _) = self
            .request(|reply| PipelineMsg::AddSource {
                parent,
                kind: SourceKind::Group,
                label,
                reply,
            })
            .await?;
        Ok(token)
    }

    /// Remove a source (a group with its whole subtree).
    pub async fn remove_source(&self, token: SourceToken) -> PipelineResult<Vec<SourceToken>> {
        self.request(|reply| PipelineMsg::RemoveSource { token, reply })
            .await
    }

    /// Tear down a query's contribution and attach a fresh query in its place.
    pub async fn rehome_source(&self, token: SourceToken) -> PipelineResult<SourceFeed<P>> {
        let (replacement, cancel) = self
            .request(|reply| PipelineMsg::RehomeSource { token, reply })
            .await?;
        Ok(SourceFeed::new(replacement, self.clone(), cancel))
    }

    pub async fn apply_batch(
        &self,
        token: SourceToken,
        batch: ListingBatch<P>,
    ) -> PipelineResult<LifecycleSummary> {
        self.request(|reply| PipelineMsg::ApplyBatch {
            token,
            batch,
            reply,
        })
        .await
    }

    pub async fn set_busy(&self, token: SourceToken, busy: bool) -> PipelineResult<()> {
        self.send(PipelineMsg::SetBusy { token, busy }).await
    }

    pub async fn report_error(
        &self,
        token: Option<SourceToken>,
        message: impl Into<String>,
    ) -> PipelineResult<()> {
        self.send(PipelineMsg::SourceError {
            token,
            message: message.into(),
        })
        .await
    }

    pub async fn require_verification(
        &self,
        token: SourceToken,
        uri: impl Into<String>,
    ) -> PipelineResult<()> {
        self.send(PipelineMsg::VerificationRequired {
            token,
            uri: uri.into(),
        })
        .await
    }

    // === Bulk commands ===

    /// Acknowledge every listing: all become `Normal`.
    pub async fn mark_all_read(&self) -> PipelineResult<()> {
        self.request(|reply| PipelineMsg::MarkAllRead { reply }).await
    }

    /// Delete the listings of `token`, or of every query when `None`.
    pub async fn clear(&self, token: Option<SourceToken>) -> PipelineResult<()> {
        self.request(|reply| PipelineMsg::Clear { token, reply })
            .await
    }

    // === View ===

    pub async fn set_show_new(&self, show: bool) -> PipelineResult<()> {
        self.send(PipelineMsg::SetShowNew(show)).await
    }

    pub async fn set_show_removed(&self, show: bool) -> PipelineResult<()> {
        self.send(PipelineMsg::SetShowRemoved(show)).await
    }

    pub async fn set_quick_filter(&self, text: impl Into<String>) -> PipelineResult<()> {
        self.send(PipelineMsg::SetQuickFilter(text.into())).await
    }

    pub async fn set_custom_predicate(&self, predicate: Option<ItemPredicate<P>>) -> PipelineResult<()> {
        self.send(PipelineMsg::SetCustomPredicate(predicate)).await
    }

    /// Activate sort keys. Unknown keys are rejected here, before anything
    /// is sent to the actor.
    pub async fn set_sort_keys(&self, keys: Vec<SortKeySpec>) -> PipelineResult<()> {
        if let Some(unknown) = keys.iter().find(|k| !self.sort_table.contains(k)) {
            return Err(ViewError::UnknownSortKey {
                name: unknown.name.clone(),
                direction: unknown.direction,
            }
            .into());
        }
        self.send(PipelineMsg::SetSortKeys(keys)).await
    }

    /// Request a page. A zero size is rejected here; otherwise returns the
    /// page the request resolves to against the current filtered size.
    pub async fn request_page(&self, index: usize, size: usize) -> PipelineResult<PageResponse> {
        if size == 0 {
            return Err(ViewError::InvalidPageSize(size).into());
        }
        let request = PageRequest::new(index, size);
        self.request(|reply| PipelineMsg::RequestPage { request, reply })
            .await
    }

    /// Recompute pending stages without waiting for their debounce window.
    pub async fn flush(&self) -> PipelineResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(PipelineMsg::Flush { reply }).await?;
        rx.await.map_err(|_| PipelineError::ChannelClosed)
    }

    pub async fn shutdown(&self) -> PipelineResult<()> {
        self.send(PipelineMsg::Shutdown).await
    }

    // === Sync reads ===

    /// Latest published projection.
    pub fn projection(&self) -> Projection<P> {
        self.projection_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Projection<P>> {
        self.projection_rx.clone()
    }

    pub fn subscribe_verification(&self) -> broadcast::Receiver<VerificationRequired> {
        self.verification_tx.subscribe()
    }

    pub fn source_status(&self, token: SourceToken) -> Option<SourceStatus> {
        self.status.get(&token).map(|s| s.value().clone())
    }

    /// Status of every registered source, by token.
    pub fn sources(&self) -> Vec<(SourceToken, SourceStatus)> {
        let mut sources: Vec<_> = self
            .status
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        sources.sort_by_key(|(token, _)| *token);
        sources
    }

    /// Whether any source is mid-refresh.
    pub fn is_busy(&self) -> bool {
        self.status.iter().any(|e| e.value().busy)
    }

    /// Rolling error log, oldest first.
    pub fn errors(&self) -> Vec<ErrorRecord> {
        self.errors.snapshot()
    }

    pub fn sort_keys(&self) -> Vec<SortKeySpec> {
        self.sort_table.specs()
    }

    pub fn metrics(&self) -> &PipelineMetrics {
        &self.metrics
    }
}

// ============================================================================
// PipelineBuilder
// ============================================================================

/// Configures and spawns a pipeline.
///
/// The sort key table is frozen by [`spawn`](Self::spawn).
pub struct PipelineBuilder<P> {
    config: PipelineConfig,
    sort_table: SortKeyTable<P>,
    active_sort: Vec<SortKeySpec>,
    matcher: Option<Arc<dyn QuickFilterMatcher<P>>>,
    metrics: Option<PipelineMetrics>,
}

impl<P: Send + Sync + 'static> PipelineBuilder<P> {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            sort_table: SortKeyTable::new(),
            active_sort: Vec::new(),
            matcher: None,
            metrics: None,
        }
    }

    /// Register one sort key. A duplicate `(name, direction)` is an error.
    pub fn register_sort_key<K, F>(
        &mut self,
        name: impl Into<String>,
        direction: SortDirection,
        extractor: F,
    ) -> PipelineResult<&mut Self>
    where
        K: Ord,
        F: Fn(&ListingItem<P>) -> K + Send + Sync + 'static,
    {
        self.sort_table.register_key(name, direction, extractor)?;
        Ok(self)
    }

    /// Register a sort key in both directions.
    pub fn register_sort_key_both<K, F>(
        &mut self,
        name: impl Into<String>,
        extractor: F,
    ) -> PipelineResult<&mut Self>
    where
        K: Ord,
        F: Fn(&ListingItem<P>) -> K + Send + Sync + 'static,
    {
        self.sort_table.register_both(name, extractor)?;
        Ok(self)
    }

    /// Sort keys active from the start.
    pub fn sort_keys(&mut self, keys: Vec<SortKeySpec>) -> &mut Self {
        self.active_sort = keys;
        self
    }

    pub fn quick_filter(&mut self, matcher: Arc<dyn QuickFilterMatcher<P>>) -> &mut Self {
        self.matcher = Some(matcher);
        self
    }

    /// Use existing metrics instead of a fresh registry.
    pub fn metrics(&mut self, metrics: PipelineMetrics) -> &mut Self {
        self.metrics = Some(metrics);
        self
    }

    /// Spawn the actor on the current runtime.
    pub fn spawn(self) -> PipelineResult<(PipelineHandle<P>, JoinHandle<()>)> {
        let (handle, task) = self.build()?;
        let join_handle = tokio::spawn(task.run());
        Ok((handle, join_handle))
    }

    /// Build the handle and the (not yet running) actor.
    pub fn build(self) -> PipelineResult<(PipelineHandle<P>, PipelineTask<P>)> {
        self.config.validate()?;

        let sort_table = Arc::new(self.sort_table);
        let matcher = self.matcher.unwrap_or_else(|| {
            let all: Arc<dyn QuickFilterMatcher<P>> = Arc::new(|_: &str, _: &ListingItem<P>| true);
            all
        });
        let settings = self.config.view_settings(self.active_sort);
        let view = ListingView::new(Arc::clone(&sort_table), matcher, &settings)?;
        let metrics = match self.metrics {
            Some(metrics) => metrics,
            None => PipelineMetrics::new()?,
        };

        let (tx, rx) = mpsc::channel(self.config.channel_capacity);
        let (plan_tx, plan_rx) = mpsc::unbounded_channel();
        let (projection_tx, projection_rx) = watch::channel(Projection {
            page_info: view.page_info(),
            ..Projection::default()
        });
        let (verification_tx, _) = broadcast::channel(VERIFICATION_CHANNEL_CAPACITY);
        let status = Arc::new(DashMap::new());
        let errors = Arc::new(ErrorLog::new(self.config.error_log_capacity));

        let task = PipelineTask {
            rx,
            plan_tx,
            plan_rx,
            tree: SourceTree::new(),
            view,
            slots: HashMap::new(),
            deferred: VecDeque::new(),
            status: Arc::clone(&status),
            errors: Arc::clone(&errors),
            projection_tx,
            verification_tx: verification_tx.clone(),
            metrics: metrics.clone(),
            parallel_threshold: self.config.parallel_classify_threshold.max(1),
            shutdown: CancellationToken::new(),
            revision: 0,
            dirty: false,
        };

        let handle = PipelineHandle {
            tx,
            sort_table,
            status,
            errors,
            projection_rx,
            verification_tx,
            metrics,
        };

        Ok((handle, task))
    }
}
