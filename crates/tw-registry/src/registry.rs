//! Item registry.
//!
//! Holds one `ListingItem` per identity for a single source and applies
//! classified batches atomically. Removed entries are retained so that a
//! reappearing listing is recognized; only `clear` deletes entries.

use crate::classify::{classify, LifecycleSummary, StateLookup, TransitionKind, TransitionPlan};
use crate::error::{BatchRejection, RegistryError, RegistryResult};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, trace, warn};
use tw_core::{LifecycleCounters, ListingBatch, ListingId, ListingItem, ListingState};

/// Outcome of an applied batch.
#[derive(Debug, Clone)]
pub struct AppliedBatch<P> {
    pub summary: LifecycleSummary,
    /// Final state of every entry the batch modified, in first-touched order.
    pub changed: Vec<ListingItem<P>>,
}

/// Registry of listings contributed by one source.
#[derive(Debug)]
pub struct ItemRegistry<P> {
    entries: HashMap<ListingId, ListingItem<P>>,
    counters: LifecycleCounters,
}

impl<P> ItemRegistry<P> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            counters: LifecycleCounters::default(),
        }
    }

    /// Classify and apply a batch in one step.
    pub fn apply(&mut self, batch: ListingBatch<P>) -> RegistryResult<AppliedBatch<P>> {
        self.apply_at(batch, Utc::now())
    }

    /// Classify and apply a batch with an explicit transition time.
    pub fn apply_at(
        &mut self,
        batch: ListingBatch<P>,
        now: DateTime<Utc>,
    ) -> RegistryResult<AppliedBatch<P>> {
        let batch_len = batch.len();
        let plan = classify(batch, &*self).map_err(|violations| {
            warn!(
                batch_len,
                violations = violations.len(),
                "Rejecting batch with protocol violations"
            );
            RegistryError::ProtocolViolation(BatchRejection {
                batch_len,
                violations,
            })
        })?;
        self.apply_plan(plan, now)
    }

    /// Current states of the identities mentioned by `batch`.
    ///
    /// Enough for [`classify`] to run elsewhere; the resulting plan must be
    /// applied before any other mutation of this registry.
    pub fn state_snapshot(&self, batch: &ListingBatch<P>) -> HashMap<ListingId, ListingState> {
        batch
            .ids()
            .filter_map(|id| self.entries.get(id).map(|e| (id.clone(), e.state)))
            .collect()
    }

    /// Apply a classified plan atomically.
    ///
    /// Every step is checked against the registry before anything is
    /// mutated; a plan that no longer matches the registry is a desync and
    /// leaves the registry untouched.
    pub fn apply_plan(
        &mut self,
        plan: TransitionPlan<P>,
        now: DateTime<Utc>,
    ) -> RegistryResult<AppliedBatch<P>> {
        self.verify_plan(&plan)?;

        let (steps, summary) = plan.into_parts();
        let mut touched: Vec<ListingId> = Vec::new();
        let mut seen: HashSet<ListingId> = HashSet::new();

        for step in steps {
            if !step.kind.mutates() {
                continue;
            }
            if seen.insert(step.id.clone()) {
                touched.push(step.id.clone());
            }

            match step.kind {
                TransitionKind::Create => {
                    trace!(id = %step.id, "Listing created");
                    self.counters.increment(ListingState::New);
                    self.entries.insert(
                        step.id.clone(),
                        ListingItem::new(step.id, step.payload, now),
                    );
                }
                kind => {
                    let entry = self.entries.get_mut(&step.id).ok_or_else(|| {
                        RegistryError::Desync {
                            id: step.id.clone(),
                            reason: format!("entry vanished while applying {kind:?}"),
                        }
                    })?;
                    let target = match kind {
                        TransitionKind::Remove => ListingState::Removed,
                        _ => ListingState::New,
                    };
                    if kind != TransitionKind::Remove {
                        entry.payload = Arc::new(step.payload);
                    }
                    if entry.state != target {
                        self.counters.transition(entry.state, target);
                        entry.state = target;
                        entry.last_transition_at = now;
                    }
                }
            }
        }

        let changed: Vec<ListingItem<P>> = touched
            .iter()
            .filter_map(|id| self.entries.get(id).cloned())
            .collect();

        debug!(
            created = summary.created,
            reappeared = summary.reappeared,
            removed = summary.removed,
            refreshed = summary.refreshed,
            changed = changed.len(),
            total = self.entries.len(),
            "Batch applied"
        );

        Ok(AppliedBatch { summary, changed })
    }

    fn verify_plan(&self, plan: &TransitionPlan<P>) -> RegistryResult<()> {
        let mut created: HashSet<&ListingId> = HashSet::new();
        for step in plan.steps() {
            let exists = self.entries.contains_key(&step.id) || created.contains(&step.id);
            if step.kind.requires_existing() && !exists {
                return Err(RegistryError::Desync {
                    id: step.id.clone(),
                    reason: format!("{:?} planned for an absent entry", step.kind),
                });
            }
            if step.kind == TransitionKind::Create {
                if exists {
                    return Err(RegistryError::Desync {
                        id: step.id.clone(),
                        reason: "create planned for an existing entry".to_string(),
                    });
                }
                created.insert(&step.id);
            }
        }
        Ok(())
    }

    /// Acknowledge every entry: New and Removed become Normal.
    ///
    /// Returns the entries that changed.
    pub fn mark_all_read(&mut self, now: DateTime<Utc>) -> Vec<ListingItem<P>> {
        let mut changed = Vec::new();
        for entry in self.entries.values_mut() {
            if entry.state != ListingState::Normal {
                self.counters.transition(entry.state, ListingState::Normal);
                entry.state = ListingState::Normal;
                entry.last_transition_at = now;
                changed.push(entry.clone());
            }
        }
        debug!(changed = changed.len(), "Marked all listings as read");
        changed
    }

    /// Delete every entry. Returns the deleted identities.
    pub fn clear(&mut self) -> Vec<ListingId> {
        self.counters = LifecycleCounters::default();
        let ids: Vec<ListingId> = self.entries.drain().map(|(id, _)| id).collect();
        debug!(cleared = ids.len(), "Registry cleared");
        ids
    }

    pub fn get(&self, id: &ListingId) -> Option<&ListingItem<P>> {
        self.entries.get(id)
    }

    pub fn contains(&self, id: &ListingId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn items(&self) -> impl Iterator<Item = &ListingItem<P>> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn counters(&self) -> LifecycleCounters {
        self.counters
    }
}

impl<P> Default for ItemRegistry<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> StateLookup for ItemRegistry<P> {
    fn state_of(&self, id: &ListingId) -> Option<ListingState> {
        self.entries.get(id).map(|e| e.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tokio_test::{assert_err, assert_ok};

    fn id(key: &str) -> ListingId {
        ListingId::new(key).unwrap()
    }

    fn seeded(keys: &[&str]) -> ItemRegistry<u32> {
        let mut registry = ItemRegistry::new();
        let mut batch = ListingBatch::new();
        for key in keys {
            batch.push_new(id(key), 1);
        }
        registry.apply(batch).unwrap();
        registry
    }

    #[test]
    fn test_count_grows_by_new_identities_only() {
        let mut registry = seeded(&["a", "b", "c"]);
        let before = registry.len();

        let mut batch = ListingBatch::new();
        batch
            .push_new(id("d"), 1)
            .push_new(id("e"), 1)
            .push_removed(id("a"), 1)
            .push_removed(id("b"), 1);
        let applied = assert_ok!(registry.apply(batch));

        assert_eq!(applied.summary.created, 2);
        assert_eq!(applied.summary.removed, 2);
        assert_eq!(registry.len(), before + 2);
        assert_eq!(registry.get(&id("a")).unwrap().state, ListingState::Removed);
        assert_eq!(registry.counters().removed_count, 2);
        assert_eq!(registry.counters().new_count, 3);
    }

    #[test]
    fn test_rejected_batch_applies_nothing() {
        let mut registry = seeded(&["a"]);

        let mut batch = ListingBatch::new();
        batch
            .push_new(id("b"), 2)
            .push_removed(id("a"), 2)
            .push_removed(id("never-seen"), 2);
        let err = assert_err!(registry.apply(batch));

        match err {
            RegistryError::ProtocolViolation(rejection) => {
                assert_eq!(rejection.batch_len, 3);
                assert_eq!(rejection.violations.len(), 1);
                assert_eq!(rejection.violations[0].id, id("never-seen"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(registry.len(), 1);
        assert!(!registry.contains(&id("b")));
        assert_eq!(registry.get(&id("a")).unwrap().state, ListingState::New);
    }

    #[test]
    fn test_removed_redeclared_is_noop() {
        let mut registry = seeded(&["a"]);
        let mut batch = ListingBatch::new();
        batch.push_removed(id("a"), 1);
        registry.apply(batch.clone()).unwrap();
        let removed_at = registry.get(&id("a")).unwrap().last_transition_at;

        let applied = registry.apply(batch).unwrap();
        assert_eq!(applied.summary.unchanged, 1);
        assert!(applied.changed.is_empty());
        assert_eq!(registry.get(&id("a")).unwrap().last_transition_at, removed_at);
    }

    #[test]
    fn test_reappearance_keeps_first_seen() {
        let mut registry: ItemRegistry<u32> = ItemRegistry::new();
        let t0 = Utc::now();
        let t1 = t0 + Duration::seconds(10);
        let t2 = t0 + Duration::seconds(20);

        let mut batch = ListingBatch::new();
        batch.push_new(id("a"), 1);
        registry.apply_at(batch, t0).unwrap();

        let mut batch = ListingBatch::new();
        batch.push_removed(id("a"), 1);
        registry.apply_at(batch, t1).unwrap();

        let mut batch = ListingBatch::new();
        batch.push_new(id("a"), 7);
        let applied = registry.apply_at(batch, t2).unwrap();

        assert_eq!(applied.summary.reappeared, 1);
        let entry = registry.get(&id("a")).unwrap();
        assert_eq!(entry.state, ListingState::New);
        assert_eq!(entry.first_seen_at, t0);
        assert_eq!(entry.last_transition_at, t2);
        assert_eq!(*entry.payload, 7);
    }

    #[test]
    fn test_refresh_updates_payload_without_transition() {
        let mut registry = seeded(&["a"]);
        let before = registry.get(&id("a")).unwrap().last_transition_at;

        let mut batch = ListingBatch::new();
        batch.push_new(id("a"), 42);
        let applied = registry
            .apply_at(batch, before + Duration::seconds(5))
            .unwrap();

        assert_eq!(applied.summary.refreshed, 1);
        assert_eq!(applied.changed.len(), 1);
        let entry = registry.get(&id("a")).unwrap();
        assert_eq!(*entry.payload, 42);
        assert_eq!(entry.last_transition_at, before);
    }

    #[test]
    fn test_mark_all_read() {
        let mut registry = seeded(&["a", "b", "c"]);
        let mut batch = ListingBatch::new();
        batch.push_removed(id("c"), 1);
        registry.apply(batch).unwrap();

        let changed = registry.mark_all_read(Utc::now());
        assert_eq!(changed.len(), 3);
        assert!(registry.items().all(|i| i.state == ListingState::Normal));
        assert_eq!(registry.counters().normal_count, 3);

        assert!(registry.mark_all_read(Utc::now()).is_empty());
    }

    #[test]
    fn test_clear() {
        let mut registry = seeded(&["a", "b"]);
        let cleared = registry.clear();
        assert_eq!(cleared.len(), 2);
        assert!(registry.is_empty());
        assert_eq!(registry.counters(), LifecycleCounters::default());
    }

    #[test]
    fn test_stale_plan_is_desync() {
        let mut registry = seeded(&["a"]);
        let mut batch = ListingBatch::new();
        batch.push_removed(id("a"), 1);
        let snapshot = registry.state_snapshot(&batch);
        let plan = classify(batch, &snapshot).unwrap();

        registry.clear();
        let err = registry.apply_plan(plan, Utc::now()).unwrap_err();
        assert!(err.is_desync());
    }

    #[test]
    fn test_changed_lists_each_identity_once() {
        let mut registry: ItemRegistry<u32> = ItemRegistry::new();
        let mut batch = ListingBatch::new();
        batch
            .push_new(id("a"), 1)
            .push_removed(id("a"), 1)
            .push_new(id("b"), 1);
        let applied = registry.apply(batch).unwrap();

        let ids: Vec<_> = applied.changed.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(applied.changed[0].state, ListingState::Removed);
    }
}
