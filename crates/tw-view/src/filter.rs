//! Filter stage.
//!
//! The active predicate is
//! `(show_new && New) || (show_removed && Removed)`, AND the quick-filter
//! match, AND the caller predicate when one is set. Edits go to the
//! [`FilterSpec`]; the [`ActivePredicate`] is only rebuilt when the
//! debouncer fires.

use crate::debounce::Debouncer;
use std::fmt;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::debug;
use tw_core::{ListingItem, ListingState};

/// Free-text matcher supplied by the domain layer.
pub trait QuickFilterMatcher<P>: Send + Sync {
    /// Whether `item` matches the (trimmed, non-empty) `text`.
    fn matches(&self, text: &str, item: &ListingItem<P>) -> bool;
}

impl<P, F> QuickFilterMatcher<P> for F
where
    F: Fn(&str, &ListingItem<P>) -> bool + Send + Sync,
{
    fn matches(&self, text: &str, item: &ListingItem<P>) -> bool {
        self(text, item)
    }
}

/// Caller-supplied visibility predicate.
pub type ItemPredicate<P> = Arc<dyn Fn(&ListingItem<P>) -> bool + Send + Sync>;

/// Editable filter settings.
pub struct FilterSpec<P> {
    pub show_new: bool,
    pub show_removed: bool,
    pub quick_filter_text: String,
    pub custom_predicate: Option<ItemPredicate<P>>,
}

impl<P> Default for FilterSpec<P> {
    fn default() -> Self {
        Self {
            show_new: true,
            show_removed: false,
            quick_filter_text: String::new(),
            custom_predicate: None,
        }
    }
}

impl<P> Clone for FilterSpec<P> {
    fn clone(&self) -> Self {
        Self {
            show_new: self.show_new,
            show_removed: self.show_removed,
            quick_filter_text: self.quick_filter_text.clone(),
            custom_predicate: self.custom_predicate.clone(),
        }
    }
}

impl<P> fmt::Debug for FilterSpec<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterSpec")
            .field("show_new", &self.show_new)
            .field("show_removed", &self.show_removed)
            .field("quick_filter_text", &self.quick_filter_text)
            .field("custom_predicate", &self.custom_predicate.is_some())
            .finish()
    }
}

/// Predicate frozen from a `FilterSpec` at the last rebuild.
pub struct ActivePredicate<P> {
    show_new: bool,
    show_removed: bool,
    text: Option<String>,
    matcher: Arc<dyn QuickFilterMatcher<P>>,
    custom: Option<ItemPredicate<P>>,
}

impl<P> ActivePredicate<P> {
    fn build(spec: &FilterSpec<P>, matcher: Arc<dyn QuickFilterMatcher<P>>) -> Self {
        let text = spec.quick_filter_text.trim();
        Self {
            show_new: spec.show_new,
            show_removed: spec.show_removed,
            text: (!text.is_empty()).then(|| text.to_string()),
            matcher,
            custom: spec.custom_predicate.clone(),
        }
    }

    pub fn matches(&self, item: &ListingItem<P>) -> bool {
        let visible = match item.state {
            ListingState::New => self.show_new,
            ListingState::Removed => self.show_removed,
            ListingState::Normal | ListingState::Unknown => false,
        };
        if !visible {
            return false;
        }
        if let Some(text) = &self.text {
            if !self.matcher.matches(text, item) {
                return false;
            }
        }
        self.custom.as_ref().map_or(true, |predicate| predicate(item))
    }
}

pub struct FilterEngine<P> {
    spec: FilterSpec<P>,
    matcher: Arc<dyn QuickFilterMatcher<P>>,
    active: ActivePredicate<P>,
    debouncer: Debouncer,
    rebuilds: u64,
}

impl<P> FilterEngine<P> {
    pub fn new(
        spec: FilterSpec<P>,
        matcher: Arc<dyn QuickFilterMatcher<P>>,
        debouncer: Debouncer,
    ) -> Self {
        let active = ActivePredicate::build(&spec, Arc::clone(&matcher));
        Self {
            spec,
            matcher,
            active,
            debouncer,
            rebuilds: 0,
        }
    }

    pub fn spec(&self) -> &FilterSpec<P> {
        &self.spec
    }

    pub fn set_show_new(&mut self, show: bool, now: Instant) {
        self.spec.show_new = show;
        self.request_rebuild(now);
    }

    pub fn set_show_removed(&mut self, show: bool, now: Instant) {
        self.spec.show_removed = show;
        self.request_rebuild(now);
    }

    pub fn set_quick_filter(&mut self, text: impl Into<String>, now: Instant) {
        self.spec.quick_filter_text = text.into();
        self.request_rebuild(now);
    }

    pub fn set_custom_predicate(&mut self, predicate: Option<ItemPredicate<P>>, now: Instant) {
        self.spec.custom_predicate = predicate;
        self.request_rebuild(now);
    }

    /// Request a rebuild (spec edit or item change).
    pub fn request_rebuild(&mut self, now: Instant) {
        self.debouncer.request(now);
    }

    /// Rebuild the active predicate if the debounce deadline has passed.
    pub fn take_due(&mut self, now: Instant) -> bool {
        if !self.debouncer.take_due(now) {
            return false;
        }
        self.rebuild();
        true
    }

    /// Rebuild now if a rebuild is pending.
    pub fn flush(&mut self) -> bool {
        if !self.debouncer.take_pending() {
            return false;
        }
        self.rebuild();
        true
    }

    fn rebuild(&mut self) {
        self.active = ActivePredicate::build(&self.spec, Arc::clone(&self.matcher));
        self.rebuilds += 1;
        debug!(
            show_new = self.spec.show_new,
            show_removed = self.spec.show_removed,
            quick_filter = %self.spec.quick_filter_text,
            rebuilds = self.rebuilds,
            "Filter predicate rebuilt"
        );
    }

    pub fn active(&self) -> &ActivePredicate<P> {
        &self.active
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.debouncer.deadline()
    }

    /// Number of rebuilds so far.
    pub fn rebuilds(&self) -> u64 {
        self.rebuilds
    }
}
