//! Replay driver.
//!
//! Feeds the pipeline from a JSON-lines event file, one [`ReplayEvent`] per
//! line. Tabs and groups are addressed by name; the driver keeps the
//! name -> feed mapping a real client would keep per open tab.
//!
//! Rejected batches and source faults do not stop a replay: they are
//! counted in the [`ReplayReport`] and end up in the pipeline's error log.

use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use crate::listing::{register_sort_keys, ListingRow, ListingTextMatcher, TradeListing};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::BufRead;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use tw_core::{BatchEntry, LifecycleCounters, ListingBatch, PageResponse, SortKeySpec, SourceToken};
use tw_pipeline::{
    ErrorRecord, PipelineBuilder, PipelineError, PipelineHandle, SourceFeed, VerificationRequired,
};

/// One line of a replay file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ReplayEvent {
    OpenGroup {
        name: String,
        #[serde(default)]
        parent: Option<String>,
    },
    OpenTab {
        name: String,
        #[serde(default)]
        group: Option<String>,
    },
    /// Close a tab or a group (with everything under it).
    Close { name: String },
    /// Re-create a tab in place, dropping what it contributed.
    Rehome { name: String },
    Batch {
        tab: String,
        entries: Vec<BatchEntry<TradeListing>>,
    },
    Busy { tab: String, busy: bool },
    Error {
        #[serde(default)]
        tab: Option<String>,
        message: String,
    },
    Verification { tab: String, uri: String },
    MarkAllRead,
    /// Clear one tab, or every tab when `tab` is absent.
    Clear {
        #[serde(default)]
        tab: Option<String>,
    },
    ShowNew { show: bool },
    ShowRemoved { show: bool },
    QuickFilter { text: String },
    Sort { keys: Vec<SortKeySpec> },
    Page { index: usize, size: usize },
    /// Recompute pending view stages now.
    Flush,
}

/// What a replay did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
    pub events: usize,
    pub batches_applied: usize,
    pub batches_rejected: usize,
    pub verifications: usize,
}

/// Final state of the pipeline, as printed by the binary.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub report: ReplayReport,
    pub page: Vec<ListingRow>,
    pub page_info: PageResponse,
    pub counters: LifecycleCounters,
    pub is_busy: bool,
    pub errors: Vec<ErrorRecord>,
}

/// Application driving one pipeline.
pub struct Application {
    handle: PipelineHandle<TradeListing>,
    join: JoinHandle<()>,
    tabs: HashMap<String, SourceFeed<TradeListing>>,
    groups: HashMap<String, SourceToken>,
    verifications: broadcast::Receiver<VerificationRequired>,
    report: ReplayReport,
}

impl Application {
    /// Build and spawn the pipeline. Must be called inside a Tokio runtime.
    pub fn new(config: AppConfig) -> AppResult<Self> {
        let mut builder = PipelineBuilder::new(config.pipeline);
        register_sort_keys(&mut builder)?;
        builder
            .sort_keys(config.sort_keys)
            .quick_filter(Arc::new(ListingTextMatcher));
        let (handle, join) = builder.spawn()?;
        let verifications = handle.subscribe_verification();

        info!(sort_keys = ?handle.sort_keys(), "Pipeline ready");

        Ok(Self {
            handle,
            join,
            tabs: HashMap::new(),
            groups: HashMap::new(),
            verifications,
            report: ReplayReport::default(),
        })
    }

    pub fn handle(&self) -> &PipelineHandle<TradeListing> {
        &self.handle
    }

    pub fn report(&self) -> &ReplayReport {
        &self.report
    }

    /// Replay every event from `reader`.
    ///
    /// Blank lines and lines starting with `#` are skipped. A line that does
    /// not parse, or names an unknown tab, aborts the replay.
    pub async fn replay(&mut self, reader: impl BufRead) -> AppResult<ReplayReport> {
        for (n, line) in reader.lines().enumerate() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let event: ReplayEvent = serde_json::from_str(line).map_err(|e| AppError::Replay {
                line: n + 1,
                reason: e.to_string(),
            })?;
            self.apply(event).await.map_err(|e| match e {
                AppError::Replay { .. } => e,
                other => AppError::Replay {
                    line: n + 1,
                    reason: other.to_string(),
                },
            })?;
        }

        self.handle.flush().await?;
        self.drain_verifications();
        info!(
            events = self.report.events,
            applied = self.report.batches_applied,
            rejected = self.report.batches_rejected,
            "Replay finished"
        );
        Ok(self.report.clone())
    }

    /// Apply a single event.
    pub async fn apply(&mut self, event: ReplayEvent) -> AppResult<()> {
        debug!(?event, "Replay event");
        self.report.events += 1;
        match event {
            ReplayEvent::OpenGroup { name, parent } => {
                self.ensure_free(&name)?;
                let parent = parent.map(|p| self.group(&p)).transpose()?;
                let token = self.handle.add_group(parent, name.clone()).await?;
                self.groups.insert(name, token);
            }
            ReplayEvent::OpenTab { name, group } => {
                self.ensure_free(&name)?;
                let parent = group.map(|g| self.group(&g)).transpose()?;
                let feed = self.handle.add_query(parent, name.clone()).await?;
                self.tabs.insert(name, feed);
            }
            ReplayEvent::Close { name } => {
                let token = match self.tabs.get(&name) {
                    Some(feed) => feed.token(),
                    None => self.group(&name)?,
                };
                let removed = self.handle.remove_source(token).await?;
                self.tabs.retain(|_, feed| !removed.contains(&feed.token()));
                self.groups.retain(|_, token| !removed.contains(token));
            }
            ReplayEvent::Rehome { name } => {
                let token = self.tab(&name)?.token();
                let feed = self.handle.rehome_source(token).await?;
                self.tabs.insert(name, feed);
            }
            ReplayEvent::Batch { tab, entries } => {
                let result = self
                    .tab(&tab)?
                    .publish_batch(ListingBatch::from_entries(entries))
                    .await;
                match result {
                    Ok(_) => self.report.batches_applied += 1,
                    Err(e) if is_batch_rejection(&e) => {
                        warn!(%tab, error = %e, "Batch rejected");
                        self.report.batches_rejected += 1;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            ReplayEvent::Busy { tab, busy } => self.tab(&tab)?.set_busy(busy).await?,
            ReplayEvent::Error { tab, message } => {
                let token = tab.map(|t| self.tab(&t).map(|f| f.token())).transpose()?;
                self.handle.report_error(token, message).await?;
            }
            ReplayEvent::Verification { tab, uri } => {
                self.tab(&tab)?.require_verification(uri).await?
            }
            ReplayEvent::MarkAllRead => self.handle.mark_all_read().await?,
            ReplayEvent::Clear { tab } => {
                let token = tab.map(|t| self.tab(&t).map(|f| f.token())).transpose()?;
                self.handle.clear(token).await?;
            }
            ReplayEvent::ShowNew { show } => self.handle.set_show_new(show).await?,
            ReplayEvent::ShowRemoved { show } => self.handle.set_show_removed(show).await?,
            ReplayEvent::QuickFilter { text } => self.handle.set_quick_filter(text).await?,
            ReplayEvent::Sort { keys } => self.handle.set_sort_keys(keys).await?,
            ReplayEvent::Page { index, size } => {
                let page = self.handle.request_page(index, size).await?;
                debug!(index = page.index, total_pages = page.total_pages, "Page requested");
            }
            ReplayEvent::Flush => self.handle.flush().await?,
        }
        Ok(())
    }

    /// Current projection in serializable form.
    pub fn snapshot(&self) -> Snapshot {
        let projection = self.handle.projection();
        Snapshot {
            report: self.report.clone(),
            page: projection.page.iter().map(ListingRow::from).collect(),
            page_info: projection.page_info,
            counters: projection.counters,
            is_busy: projection.is_busy,
            errors: self.handle.errors(),
        }
    }

    /// Stop the pipeline and wait for the actor to exit.
    pub async fn shutdown(self) -> AppResult<()> {
        self.handle.shutdown().await?;
        if let Err(e) = self.join.await {
            warn!(error = %e, "Pipeline task ended abnormally");
        }
        Ok(())
    }

    fn drain_verifications(&mut self) {
        loop {
            match self.verifications.try_recv() {
                Ok(signal) => {
                    info!(token = %signal.token, uri = %signal.uri, "Verification pending");
                    self.report.verifications += 1;
                }
                Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                    self.report.verifications += missed as usize;
                }
                Err(_) => break,
            }
        }
    }

    fn tab(&self, name: &str) -> AppResult<&SourceFeed<TradeListing>> {
        self.tabs
            .get(name)
            .ok_or_else(|| AppError::UnknownName(name.to_string()))
    }

    fn group(&self, name: &str) -> AppResult<SourceToken> {
        self.groups
            .get(name)
            .copied()
            .ok_or_else(|| AppError::UnknownName(name.to_string()))
    }

    fn ensure_free(&self, name: &str) -> AppResult<()> {
        if self.tabs.contains_key(name) || self.groups.contains_key(name) {
            return Err(AppError::DuplicateName(name.to_string()));
        }
        Ok(())
    }
}

fn is_batch_rejection(e: &PipelineError) -> bool {
    e.is_protocol_violation() || e.is_desync() || matches!(e, PipelineError::SourceFaulted { .. })
}
