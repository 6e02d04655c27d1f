//! Lifecycle classification.
//!
//! Turns a `ListingBatch` into a `TransitionPlan` without touching the
//! registry. Classification only needs the current state of the identities
//! mentioned by the batch, so it can run on a worker thread against a
//! snapshot (see [`ItemRegistry::state_snapshot`](crate::ItemRegistry::state_snapshot)).
//!
//! Entries are classified sequentially: a batch that mentions the same
//! identity twice sees the effect of its own earlier entry.

use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use tw_core::{ListingBatch, ListingId, ListingState};

/// Read access to the current state of identities.
pub trait StateLookup {
    /// Current state, or `None` if the identity was never observed.
    fn state_of(&self, id: &ListingId) -> Option<ListingState>;
}

impl StateLookup for HashMap<ListingId, ListingState> {
    fn state_of(&self, id: &ListingId) -> Option<ListingState> {
        self.get(id).copied()
    }
}

/// Effect of one batch entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    /// (absent) -> New. Creates the entry.
    Create,
    /// Normal/Removed -> New.
    Reappear,
    /// New/Normal -> Removed.
    Remove,
    /// New -> New. State holds, payload is refreshed.
    Refresh,
    /// Removed -> Removed. No-op.
    Unchanged,
}

impl TransitionKind {
    /// Whether the entry must exist before this transition.
    pub fn requires_existing(&self) -> bool {
        !matches!(self, Self::Create)
    }

    /// Whether applying the transition modifies the entry.
    pub fn mutates(&self) -> bool {
        !matches!(self, Self::Unchanged)
    }
}

/// Why a batch entry broke the source contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    /// Declared `Normal` or `Unknown`; only `New`/`Removed` may be declared.
    UndeclarableState,
    /// Declared `Removed` for an identity that was never added.
    RemovedUnknownIdentity,
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UndeclarableState => write!(f, "undeclarable state"),
            Self::RemovedUnknownIdentity => write!(f, "removal of unknown identity"),
        }
    }
}

/// A single contract break found in a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProtocolViolation {
    /// Position of the offending entry in the batch.
    pub position: usize,
    pub id: ListingId,
    pub declared: ListingState,
    pub kind: ViolationKind,
}

impl fmt::Display for ProtocolViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} {} declared {} ({})",
            self.position, self.id, self.declared, self.kind
        )
    }
}

/// Counts of what a batch did (or will do) to the registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LifecycleSummary {
    /// Identities seen for the first time.
    pub created: usize,
    /// Known identities that became New again.
    pub reappeared: usize,
    /// Identities that became Removed.
    pub removed: usize,
    /// New identities re-declared New (payload refreshed).
    pub refreshed: usize,
    /// Removed identities re-declared Removed.
    pub unchanged: usize,
    /// Violations found. Zero for any applied batch.
    pub violations: usize,
}

impl LifecycleSummary {
    /// Listings that became New (created or reappeared).
    pub fn became_new(&self) -> usize {
        self.created + self.reappeared
    }

    /// Whether the batch changed any lifecycle state.
    pub fn has_transitions(&self) -> bool {
        self.created + self.reappeared + self.removed > 0
    }

    fn record(&mut self, kind: TransitionKind) {
        match kind {
            TransitionKind::Create => self.created += 1,
            TransitionKind::Reappear => self.reappeared += 1,
            TransitionKind::Remove => self.removed += 1,
            TransitionKind::Refresh => self.refreshed += 1,
            TransitionKind::Unchanged => self.unchanged += 1,
        }
    }
}

/// One classified batch entry.
#[derive(Debug, Clone)]
pub struct PlannedTransition<P> {
    pub id: ListingId,
    pub kind: TransitionKind,
    pub payload: P,
}

/// Classified batch, ready to be applied atomically.
#[derive(Debug, Clone)]
pub struct TransitionPlan<P> {
    steps: Vec<PlannedTransition<P>>,
    summary: LifecycleSummary,
}

impl<P> TransitionPlan<P> {
    pub fn steps(&self) -> &[PlannedTransition<P>] {
        &self.steps
    }

    pub fn summary(&self) -> LifecycleSummary {
        self.summary
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub(crate) fn into_parts(self) -> (Vec<PlannedTransition<P>>, LifecycleSummary) {
        (self.steps, self.summary)
    }
}

/// Classify a batch against the known states.
///
/// Returns every violation found (in batch order) if any entry breaks the
/// contract; a rejected batch yields no plan at all.
pub fn classify<P, L>(
    batch: ListingBatch<P>,
    known: &L,
) -> Result<TransitionPlan<P>, Vec<ProtocolViolation>>
where
    L: StateLookup + ?Sized,
{
    let mut overlay: HashMap<ListingId, ListingState> = HashMap::new();
    let mut steps = Vec::with_capacity(batch.len());
    let mut violations = Vec::new();
    let mut summary = LifecycleSummary::default();

    for (position, entry) in batch.into_entries().into_iter().enumerate() {
        let current = overlay
            .get(&entry.id)
            .copied()
            .or_else(|| known.state_of(&entry.id));

        let kind = match (current, entry.declared) {
            (_, declared) if !declared.is_declarable() => Err(ViolationKind::UndeclarableState),
            (None, ListingState::New) => Ok(TransitionKind::Create),
            (None, _) => Err(ViolationKind::RemovedUnknownIdentity),
            (Some(ListingState::New), ListingState::New) => Ok(TransitionKind::Refresh),
            (Some(_), ListingState::New) => Ok(TransitionKind::Reappear),
            (Some(ListingState::Removed), _) => Ok(TransitionKind::Unchanged),
            (Some(_), _) => Ok(TransitionKind::Remove),
        };

        match kind {
            Ok(kind) => {
                overlay.insert(entry.id.clone(), entry.declared);
                summary.record(kind);
                steps.push(PlannedTransition {
                    id: entry.id,
                    kind,
                    payload: entry.payload,
                });
            }
            Err(kind) => violations.push(ProtocolViolation {
                position,
                id: entry.id,
                declared: entry.declared,
                kind,
            }),
        }
    }

    if violations.is_empty() {
        Ok(TransitionPlan { steps, summary })
    } else {
        Err(violations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(key: &str) -> ListingId {
        ListingId::new(key).unwrap()
    }

    fn known(entries: &[(&str, ListingState)]) -> HashMap<ListingId, ListingState> {
        entries.iter().map(|(k, s)| (id(k), *s)).collect()
    }

    #[test]
    fn test_classify_transitions() {
        let states = known(&[
            ("new", ListingState::New),
            ("normal", ListingState::Normal),
            ("removed", ListingState::Removed),
            ("gone", ListingState::New),
        ]);

        let mut batch = ListingBatch::new();
        batch
            .push_new(id("fresh"), ())
            .push_new(id("new"), ())
            .push_new(id("normal"), ())
            .push_new(id("removed"), ())
            .push_removed(id("gone"), ());

        let plan = classify(batch, &states).unwrap();
        let kinds: Vec<_> = plan.steps().iter().map(|s| s.kind).collect();
        assert_eq!(
            kinds,
            vec![
                TransitionKind::Create,
                TransitionKind::Refresh,
                TransitionKind::Reappear,
                TransitionKind::Reappear,
                TransitionKind::Remove,
            ]
        );
        assert_eq!(plan.summary().became_new(), 3);
        assert_eq!(plan.summary().removed, 1);
    }

    #[test]
    fn test_removed_twice_is_noop() {
        let states = known(&[("a", ListingState::Removed)]);
        let mut batch = ListingBatch::new();
        batch.push_removed(id("a"), ());

        let plan = classify(batch, &states).unwrap();
        assert_eq!(plan.steps()[0].kind, TransitionKind::Unchanged);
        assert!(!plan.summary().has_transitions());
    }

    #[test]
    fn test_remove_unknown_rejects_whole_batch() {
        let states = known(&[]);
        let mut batch = ListingBatch::new();
        batch
            .push_new(id("a"), ())
            .push_removed(id("ghost"), ())
            .push_new(id("b"), ());

        let violations = classify(batch, &states).unwrap_err();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].position, 1);
        assert_eq!(violations[0].kind, ViolationKind::RemovedUnknownIdentity);
    }

    #[test]
    fn test_undeclarable_states_rejected() {
        let states = known(&[("a", ListingState::New)]);
        let mut batch: ListingBatch<()> = ListingBatch::new();
        batch.push(tw_core::BatchEntry {
            id: id("a"),
            declared: ListingState::Normal,
            payload: (),
        });
        batch.push(tw_core::BatchEntry {
            id: id("b"),
            declared: ListingState::Unknown,
            payload: (),
        });

        let violations = classify(batch, &states).unwrap_err();
        assert_eq!(violations.len(), 2);
        assert!(violations
            .iter()
            .all(|v| v.kind == ViolationKind::UndeclarableState));
    }

    #[test]
    fn test_sequential_classification_within_batch() {
        let states = known(&[]);
        let mut batch = ListingBatch::new();
        batch
            .push_new(id("a"), ())
            .push_removed(id("a"), ())
            .push_new(id("a"), ());

        let plan = classify(batch, &states).unwrap();
        let kinds: Vec<_> = plan.steps().iter().map(|s| s.kind).collect();
        assert_eq!(
            kinds,
            vec![
                TransitionKind::Create,
                TransitionKind::Remove,
                TransitionKind::Reappear
            ]
        );
    }

    #[test]
    fn test_empty_batch_is_noop() {
        let plan = classify(ListingBatch::<()>::new(), &known(&[])).unwrap();
        assert!(plan.is_empty());
        assert_eq!(plan.summary(), LifecycleSummary::default());
    }
}
