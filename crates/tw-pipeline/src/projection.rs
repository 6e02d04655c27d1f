//! Published pipeline output.

use tw_core::{LifecycleCounters, ListingItem, PageResponse, SourceToken};

/// Current page of the pipeline, as published after every recomputation.
#[derive(Debug)]
pub struct Projection<P> {
    /// Items of the current page, in sort order.
    pub page: Vec<ListingItem<P>>,
    pub page_info: PageResponse,
    /// Counts over the whole merged collection (not only the page).
    pub counters: LifecycleCounters,
    /// Whether any source is mid-refresh.
    pub is_busy: bool,
    /// Increases with every publication.
    pub revision: u64,
}

impl<P> Clone for Projection<P> {
    fn clone(&self) -> Self {
        Self {
            page: self.page.clone(),
            page_info: self.page_info,
            counters: self.counters,
            is_busy: self.is_busy,
            revision: self.revision,
        }
    }
}

impl<P> Default for Projection<P> {
    fn default() -> Self {
        Self {
            page: Vec::new(),
            page_info: PageResponse::default(),
            counters: LifecycleCounters::default(),
            is_busy: false,
            revision: 0,
        }
    }
}

/// A source needs the user to resolve a verification challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationRequired {
    pub token: SourceToken,
    /// Where the challenge can be resolved.
    pub uri: String,
}
