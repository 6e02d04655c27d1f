//! Sort stage.
//!
//! Sort keys are registered once, by name and direction, as typed field
//! extractors. The table is frozen (shared behind an `Arc`) before the view
//! is built; activation only picks keys out of it.

use crate::collection::ViewRow;
use crate::debounce::Debouncer;
use crate::error::{ViewError, ViewResult};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::debug;
use tw_core::{ListingItem, SortDirection, SortKeySpec};

/// Total order on two items for one key.
pub type ItemComparator<P> = Arc<dyn Fn(&ListingItem<P>, &ListingItem<P>) -> Ordering + Send + Sync>;

/// Registered sort keys.
pub struct SortKeyTable<P> {
    keys: HashMap<SortKeySpec, ItemComparator<P>>,
}

impl<P: 'static> SortKeyTable<P> {
    pub fn new() -> Self {
        Self {
            keys: HashMap::new(),
        }
    }

    /// Register one `(name, direction)` key.
    pub fn register_key<K, F>(
        &mut self,
        name: impl Into<String>,
        direction: SortDirection,
        extractor: F,
    ) -> ViewResult<&mut Self>
    where
        K: Ord,
        F: Fn(&ListingItem<P>) -> K + Send + Sync + 'static,
    {
        self.insert(SortKeySpec::new(name, direction), Arc::new(extractor))
    }

    /// Register a key in both directions with the same extractor.
    pub fn register_both<K, F>(&mut self, name: impl Into<String>, extractor: F) -> ViewResult<&mut Self>
    where
        K: Ord,
        F: Fn(&ListingItem<P>) -> K + Send + Sync + 'static,
    {
        let name = name.into();
        let extractor = Arc::new(extractor);
        self.insert(SortKeySpec::ascending(name.clone()), Arc::clone(&extractor))?;
        self.insert(SortKeySpec::descending(name), extractor)
    }

    fn insert<K, F>(&mut self, spec: SortKeySpec, extractor: Arc<F>) -> ViewResult<&mut Self>
    where
        K: Ord,
        F: Fn(&ListingItem<P>) -> K + Send + Sync + 'static,
    {
        if self.keys.contains_key(&spec) {
            return Err(ViewError::DuplicateSortKey {
                name: spec.name,
                direction: spec.direction,
            });
        }
        let comparator: ItemComparator<P> = match spec.direction {
            SortDirection::Ascending => {
                Arc::new(move |a: &ListingItem<P>, b: &ListingItem<P>| extractor(a).cmp(&extractor(b)))
            }
            SortDirection::Descending => {
                Arc::new(move |a: &ListingItem<P>, b: &ListingItem<P>| extractor(b).cmp(&extractor(a)))
            }
        };
        self.keys.insert(spec, comparator);
        Ok(self)
    }
}

impl<P> SortKeyTable<P> {
    pub fn comparator(&self, spec: &SortKeySpec) -> Option<ItemComparator<P>> {
        self.keys.get(spec).cloned()
    }

    pub fn contains(&self, spec: &SortKeySpec) -> bool {
        self.keys.contains_key(spec)
    }

    /// Registered keys, sorted by name then direction.
    pub fn specs(&self) -> Vec<SortKeySpec> {
        let mut specs: Vec<SortKeySpec> = self.keys.keys().cloned().collect();
        specs.sort_by(|a, b| {
            a.name
                .cmp(&b.name)
                .then((a.direction == SortDirection::Descending).cmp(&(b.direction == SortDirection::Descending)))
        });
        specs
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl<P: 'static> Default for SortKeyTable<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> fmt::Debug for SortKeyTable<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SortKeyTable")
            .field("keys", &self.keys.keys().collect::<Vec<_>>())
            .finish()
    }
}

type ResolvedKeys<P> = Vec<(SortKeySpec, ItemComparator<P>)>;

pub struct SortEngine<P> {
    table: Arc<SortKeyTable<P>>,
    active: ResolvedKeys<P>,
    pending: Option<ResolvedKeys<P>>,
    debouncer: Debouncer,
    rebuilds: u64,
}

impl<P> SortEngine<P> {
    /// Engine with no active keys (arrival order).
    pub fn new(table: Arc<SortKeyTable<P>>, debouncer: Debouncer) -> Self {
        Self {
            table,
            active: Vec::new(),
            pending: None,
            debouncer,
            rebuilds: 0,
        }
    }

    fn resolve(&self, keys: Vec<SortKeySpec>) -> ViewResult<ResolvedKeys<P>> {
        keys.into_iter()
            .map(|spec| match self.table.comparator(&spec) {
                Some(comparator) => Ok((spec, comparator)),
                None => Err(ViewError::UnknownSortKey {
                    name: spec.name,
                    direction: spec.direction,
                }),
            })
            .collect()
    }

    /// Activate keys, first key deciding. Unknown keys are rejected
    /// immediately and leave the engine untouched.
    pub fn set_active_keys(&mut self, keys: Vec<SortKeySpec>, now: Instant) -> ViewResult<()> {
        let resolved = self.resolve(keys)?;
        self.pending = Some(resolved);
        self.debouncer.request(now);
        Ok(())
    }

    /// Activate keys without debouncing.
    pub fn with_active_keys(mut self, keys: Vec<SortKeySpec>) -> ViewResult<Self> {
        self.active = self.resolve(keys)?;
        Ok(self)
    }

    /// Swap in pending keys if the debounce deadline has passed.
    pub fn take_due(&mut self, now: Instant) -> bool {
        if !self.debouncer.take_due(now) {
            return false;
        }
        self.activate_pending();
        true
    }

    pub fn flush(&mut self) -> bool {
        if !self.debouncer.take_pending() {
            return false;
        }
        self.activate_pending();
        true
    }

    fn activate_pending(&mut self) {
        if let Some(keys) = self.pending.take() {
            self.active = keys;
        }
        self.rebuilds += 1;
        debug!(keys = ?self.active_keys(), rebuilds = self.rebuilds, "Sort keys activated");
    }

    pub fn active_keys(&self) -> Vec<SortKeySpec> {
        self.active.iter().map(|(spec, _)| spec.clone()).collect()
    }

    /// Compare two items by the active keys only.
    pub fn compare(&self, a: &ListingItem<P>, b: &ListingItem<P>) -> Ordering {
        self.active
            .iter()
            .map(|(_, comparator)| comparator(a, b))
            .find(|ordering| ordering.is_ne())
            .unwrap_or(Ordering::Equal)
    }

    /// Sort rows by the active keys, ties kept in arrival order.
    pub fn sort_rows(&self, rows: &mut [ViewRow<P>]) {
        rows.sort_by(|a, b| self.compare(&a.item, &b.item).then(a.seq.cmp(&b.seq)));
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.debouncer.deadline()
    }

    pub fn table(&self) -> &Arc<SortKeyTable<P>> {
        &self.table
    }

    pub fn rebuilds(&self) -> u64 {
        self.rebuilds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tokio_test::{assert_err, assert_ok};
    use tw_core::ListingId;

    #[derive(Debug)]
    struct Offer {
        price: u32,
        ts: i64,
    }

    fn row(seq: u64, key: &str, price: u32, ts: i64) -> ViewRow<Offer> {
        let at = Utc.timestamp_opt(ts, 0).unwrap();
        ViewRow {
            seq,
            item: ListingItem::new(ListingId::new(key).unwrap(), Offer { price, ts }, at),
        }
    }

    fn table() -> Arc<SortKeyTable<Offer>> {
        let mut table = SortKeyTable::new();
        table
            .register_both("price", |i: &ListingItem<Offer>| i.payload.price)
            .unwrap()
            .register_both("ts", |i: &ListingItem<Offer>| i.payload.ts)
            .unwrap();
        Arc::new(table)
    }

    fn order(rows: &[ViewRow<Offer>]) -> Vec<String> {
        rows.iter().map(|r| r.item.id.to_string()).collect()
    }

    fn sample() -> Vec<ViewRow<Offer>> {
        vec![row(0, "A", 5, 1), row(1, "B", 5, 2), row(2, "C", 3, 5)]
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut table: SortKeyTable<Offer> = SortKeyTable::new();
        assert_ok!(table.register_key("price", SortDirection::Ascending, |i: &ListingItem<Offer>| i.payload.price));
        assert_ok!(table.register_key("price", SortDirection::Descending, |i: &ListingItem<Offer>| i.payload.price));
        let err = assert_err!(table.register_key("price", SortDirection::Ascending, |i: &ListingItem<Offer>| i.payload.price));
        assert_eq!(
            err,
            ViewError::DuplicateSortKey {
                name: "price".to_string(),
                direction: SortDirection::Ascending
            }
        );
    }

    #[test]
    fn test_unknown_key_rejected_synchronously() {
        let mut engine = SortEngine::new(table(), Debouncer::immediate());
        let now = Instant::now();
        assert_err!(engine.set_active_keys(vec![SortKeySpec::ascending("seller")], now));
        assert!(engine.deadline().is_none());
        assert!(engine.active_keys().is_empty());
    }

    #[test]
    fn test_price_ascending_keeps_arrival_order_on_ties() {
        let engine = SortEngine::new(table(), Debouncer::immediate())
            .with_active_keys(vec![SortKeySpec::ascending("price")])
            .unwrap();
        let mut rows = sample();
        engine.sort_rows(&mut rows);
        assert_eq!(order(&rows), vec!["C", "A", "B"]);
    }

    #[test]
    fn test_second_key_breaks_ties() {
        let engine = SortEngine::new(table(), Debouncer::immediate())
            .with_active_keys(vec![SortKeySpec::ascending("price"), SortKeySpec::descending("ts")])
            .unwrap();
        let mut rows = sample();
        engine.sort_rows(&mut rows);
        assert_eq!(order(&rows), vec!["C", "B", "A"]);
    }

    #[test]
    fn test_no_active_keys_is_arrival_order() {
        let engine = SortEngine::new(table(), Debouncer::immediate());
        let mut rows = vec![row(2, "C", 3, 5), row(0, "A", 5, 1), row(1, "B", 5, 2)];
        engine.sort_rows(&mut rows);
        assert_eq!(order(&rows), vec!["A", "B", "C"]);
    }

    #[test]
    fn test_activation_waits_for_debounce() {
        let window = std::time::Duration::from_millis(250);
        let mut engine = SortEngine::new(table(), Debouncer::new(window, window * 4));
        let now = Instant::now();
        engine
            .set_active_keys(vec![SortKeySpec::descending("price")], now)
            .unwrap();
        assert!(engine.active_keys().is_empty());
        assert!(!engine.take_due(now));
        assert!(engine.flush());
        assert_eq!(engine.active_keys(), vec![SortKeySpec::descending("price")]);
    }

    #[test]
    fn test_specs_listing() {
        let specs = table().specs();
        assert_eq!(specs.len(), 4);
        assert_eq!(specs[0], SortKeySpec::ascending("price"));
        assert_eq!(specs[1], SortKeySpec::descending("price"));
    }
}
