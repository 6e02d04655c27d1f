//! Filter -> Sort -> Page over the live collection.
//!
//! Each stage keeps its last output. A stage is recomputed when its own
//! debouncer fires or when the stage before it was recomputed; the page
//! alone is cheap to redo, a filter rebuild implies a re-sort.

use crate::collection::{LiveCollection, ViewRow};
use crate::debounce::Debouncer;
use crate::error::ViewResult;
use crate::filter::{FilterEngine, FilterSpec, ItemPredicate, QuickFilterMatcher};
use crate::paginator::{compute_page, Paginator};
use crate::sort::{SortEngine, SortKeyTable};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;
use tw_core::{LifecycleCounters, ListingId, ListingItem, PageRequest, PageResponse, SortKeySpec};

/// Construction parameters of a [`ListingView`].
#[derive(Debug, Clone)]
pub struct ViewSettings {
    pub debounce: Duration,
    pub max_debounce: Duration,
    pub page_size: usize,
    pub show_new: bool,
    pub show_removed: bool,
    pub sort_keys: Vec<SortKeySpec>,
}

impl Default for ViewSettings {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(250),
            max_debounce: Duration::from_millis(1000),
            page_size: 25,
            show_new: true,
            show_removed: false,
            sort_keys: Vec::new(),
        }
    }
}

/// Stages recomputed by one flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushOutcome {
    pub filtered: bool,
    pub sorted: bool,
    pub paged: bool,
}

impl FlushOutcome {
    pub fn changed(&self) -> bool {
        self.filtered || self.sorted || self.paged
    }
}

pub struct ListingView<P> {
    collection: LiveCollection<P>,
    filter: FilterEngine<P>,
    sort: SortEngine<P>,
    paginator: Paginator,
    /// Filtered and sorted rows.
    rows: Vec<ViewRow<P>>,
    page: Vec<ListingItem<P>>,
}

impl<P> ListingView<P> {
    pub fn new(
        table: Arc<SortKeyTable<P>>,
        matcher: Arc<dyn QuickFilterMatcher<P>>,
        settings: &ViewSettings,
    ) -> ViewResult<Self> {
        let debouncer = Debouncer::new(settings.debounce, settings.max_debounce);
        let spec = FilterSpec {
            show_new: settings.show_new,
            show_removed: settings.show_removed,
            ..FilterSpec::default()
        };
        Ok(Self {
            collection: LiveCollection::new(),
            filter: FilterEngine::new(spec, matcher, debouncer.clone()),
            sort: SortEngine::new(table, debouncer.clone()).with_active_keys(settings.sort_keys.clone())?,
            paginator: Paginator::new(settings.page_size, debouncer)?,
            rows: Vec::new(),
            page: Vec::new(),
        })
    }

    // ========================================================================
    // Collection changes
    // ========================================================================

    /// Apply a change of the merged collection and schedule a refilter.
    pub fn apply_changes(
        &mut self,
        upserts: impl IntoIterator<Item = ListingItem<P>>,
        retractions: impl IntoIterator<Item = ListingId>,
        now: Instant,
    ) -> bool {
        let mut changed = false;
        for id in retractions {
            changed |= self.collection.retract(&id);
        }
        for item in upserts {
            self.collection.upsert(item);
            changed = true;
        }
        if changed {
            self.filter.request_rebuild(now);
        }
        changed
    }

    // ========================================================================
    // Stage settings
    // ========================================================================

    pub fn set_show_new(&mut self, show: bool, now: Instant) {
        self.filter.set_show_new(show, now);
    }

    pub fn set_show_removed(&mut self, show: bool, now: Instant) {
        self.filter.set_show_removed(show, now);
    }

    pub fn set_quick_filter(&mut self, text: impl Into<String>, now: Instant) {
        self.filter.set_quick_filter(text, now);
    }

    pub fn set_custom_predicate(&mut self, predicate: Option<ItemPredicate<P>>, now: Instant) {
        self.filter.set_custom_predicate(predicate, now);
    }

    pub fn set_sort_keys(&mut self, keys: Vec<SortKeySpec>, now: Instant) -> ViewResult<()> {
        self.sort.set_active_keys(keys, now)
    }

    /// Queue a page request; returns the page it resolves to right now.
    pub fn request_page(&mut self, request: PageRequest, now: Instant) -> ViewResult<PageResponse> {
        self.paginator.request(request, self.rows.len(), now)
    }

    // ========================================================================
    // Recomputation
    // ========================================================================

    /// Earliest pending debounce deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        [
            self.filter.deadline(),
            self.sort.deadline(),
            self.paginator.deadline(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Recompute the stages whose debounce deadline has passed.
    pub fn poll(&mut self, now: Instant) -> FlushOutcome {
        let filtered = self.filter.take_due(now);
        let sorted = self.sort.take_due(now);
        let paged = self.paginator.take_due(now);
        self.recompute(filtered, sorted, paged)
    }

    /// Recompute every stage with a pending request, ignoring deadlines.
    pub fn flush(&mut self) -> FlushOutcome {
        let filtered = self.filter.flush();
        let sorted = self.sort.flush();
        let paged = self.paginator.flush();
        self.recompute(filtered, sorted, paged)
    }

    fn recompute(&mut self, filter_due: bool, sort_due: bool, page_due: bool) -> FlushOutcome {
        let mut outcome = FlushOutcome::default();

        if filter_due {
            let predicate = self.filter.active();
            self.rows = self
                .collection
                .rows()
                .filter(|row| predicate.matches(&row.item))
                .collect();
            outcome.filtered = true;
        }

        if filter_due || sort_due {
            self.sort.sort_rows(&mut self.rows);
            outcome.sorted = true;
        }

        if filter_due || sort_due || page_due {
            let page = self.paginator.recompute(self.rows.len());
            let end = (page.offset() + page.size).min(self.rows.len());
            let start = page.offset().min(end);
            self.page = self.rows[start..end].iter().map(|r| r.item.clone()).collect();
            outcome.paged = true;
        }

        if outcome.changed() {
            trace!(
                filtered = outcome.filtered,
                sorted = outcome.sorted,
                visible = self.rows.len(),
                page = self.page.len(),
                "View recomputed"
            );
        }
        outcome
    }

    // ========================================================================
    // Output
    // ========================================================================

    /// Items of the current page.
    pub fn page(&self) -> &[ListingItem<P>] {
        &self.page
    }

    pub fn page_info(&self) -> PageResponse {
        self.paginator.current()
    }

    /// Filtered and sorted item count.
    pub fn visible_len(&self) -> usize {
        self.rows.len()
    }

    /// Per-state counts over the whole merged collection.
    pub fn counters(&self) -> LifecycleCounters {
        self.collection.counters()
    }

    pub fn collection(&self) -> &LiveCollection<P> {
        &self.collection
    }

    pub fn filter_spec(&self) -> &FilterSpec<P> {
        self.filter.spec()
    }

    pub fn active_sort_keys(&self) -> Vec<SortKeySpec> {
        self.sort.active_keys()
    }

    /// Page `request` would resolve to against the current visible size.
    pub fn preview_page(&self, request: PageRequest) -> PageResponse {
        compute_page(request, self.rows.len())
    }
}
