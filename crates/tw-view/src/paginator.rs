//! Page negotiation.

use crate::debounce::Debouncer;
use crate::error::{ViewError, ViewResult};
use tokio::time::Instant;
use tracing::debug;
use tw_core::{PageRequest, PageResponse};

/// Negotiate `request` against `total_items`.
///
/// The index clamps to the last valid page; an empty set has zero pages and
/// index 0. `request.size` must be non-zero.
pub fn compute_page(request: PageRequest, total_items: usize) -> PageResponse {
    let size = request.size.max(1);
    let total_pages = total_items.div_ceil(size);
    PageResponse {
        index: request.index.min(total_pages.saturating_sub(1)),
        size,
        total_items,
        total_pages,
    }
}

#[derive(Debug, Clone)]
pub struct Paginator {
    /// Last applied request, before clamping.
    requested: PageRequest,
    pending: Option<PageRequest>,
    current: PageResponse,
    debouncer: Debouncer,
}

impl Paginator {
    pub fn new(page_size: usize, debouncer: Debouncer) -> ViewResult<Self> {
        if page_size == 0 {
            return Err(ViewError::InvalidPageSize(page_size));
        }
        let requested = PageRequest::first(page_size);
        Ok(Self {
            requested,
            pending: None,
            current: compute_page(requested, 0),
            debouncer,
        })
    }

    /// Queue a page request.
    ///
    /// Returns the page the request resolves to against `total_items`; the
    /// published page follows once the debouncer fires.
    pub fn request(
        &mut self,
        request: PageRequest,
        total_items: usize,
        now: Instant,
    ) -> ViewResult<PageResponse> {
        if request.size == 0 {
            return Err(ViewError::InvalidPageSize(request.size));
        }
        self.pending = Some(request);
        self.debouncer.request(now);
        Ok(compute_page(request, total_items))
    }

    /// Apply the pending request if the debounce deadline has passed.
    pub fn take_due(&mut self, now: Instant) -> bool {
        if !self.debouncer.take_due(now) {
            return false;
        }
        self.apply_pending();
        true
    }

    pub fn flush(&mut self) -> bool {
        if !self.debouncer.take_pending() {
            return false;
        }
        self.apply_pending();
        true
    }

    fn apply_pending(&mut self) {
        if let Some(request) = self.pending.take() {
            self.requested = request;
        }
    }

    /// Re-clamp the remembered request against a new filtered size.
    pub fn recompute(&mut self, total_items: usize) -> PageResponse {
        let page = compute_page(self.requested, total_items);
        if page.index != self.requested.index {
            debug!(
                requested = self.requested.index,
                clamped = page.index,
                total_pages = page.total_pages,
                "Page index clamped"
            );
        }
        self.current = page;
        page
    }

    pub fn current(&self) -> PageResponse {
        self.current
    }

    pub fn requested(&self) -> PageRequest {
        self.requested
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.debouncer.deadline()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_err;

    #[test]
    fn test_twenty_three_items_three_pages() {
        let page = compute_page(PageRequest::new(5, 10), 23);
        assert_eq!(page.total_pages, 3);
        assert_eq!(page.index, 2);
        assert_eq!(page.offset(), 20);
        assert!(!page.has_next());
        assert!(page.has_previous());
    }

    #[test]
    fn test_empty_set_has_no_pages() {
        let page = compute_page(PageRequest::new(3, 10), 0);
        assert_eq!(page.total_pages, 0);
        assert_eq!(page.index, 0);
        assert_eq!(page.total_items, 0);
    }

    #[test]
    fn test_exact_multiple() {
        let page = compute_page(PageRequest::new(1, 10), 20);
        assert_eq!(page.total_pages, 2);
        assert_eq!(page.index, 1);
    }

    #[test]
    fn test_zero_size_rejected() {
        assert_err!(Paginator::new(0, Debouncer::immediate()));
        let mut paginator = Paginator::new(10, Debouncer::immediate()).unwrap();
        let err = assert_err!(paginator.request(PageRequest::new(0, 0), 5, Instant::now()));
        assert_eq!(err, ViewError::InvalidPageSize(0));
        assert!(paginator.deadline().is_none());
    }

    #[test]
    fn test_requested_index_survives_shrink() {
        let mut paginator = Paginator::new(10, Debouncer::immediate()).unwrap();
        let now = Instant::now();
        let preview = paginator.request(PageRequest::new(2, 10), 25, now).unwrap();
        assert_eq!(preview.index, 2);
        assert!(paginator.take_due(now));

        assert_eq!(paginator.recompute(25).index, 2);
        assert_eq!(paginator.recompute(8).index, 0);
        assert_eq!(paginator.recompute(30).index, 2);
        assert_eq!(paginator.requested().index, 2);
    }
}
