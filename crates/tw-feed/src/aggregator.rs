//! Identity-based set union of source collections.
//!
//! Each attached source contributes a set of listings. The merged output
//! holds one entry per identity; when several sources contribute the same
//! identity the entry with the latest `last_transition_at` is visible, ties
//! going to the earliest-attached source (lowest token).
//!
//! Every mutation returns the `MergeDelta` of the merged output, so callers
//! never have to diff the whole collection.

use crate::error::{FeedError, FeedResult};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::{debug, trace};
use tw_core::{ListingId, ListingItem, SourceToken};

/// Change of a listing collection: items inserted or updated, identities gone.
#[derive(Debug)]
pub struct MergeDelta<P> {
    pub upserts: Vec<ListingItem<P>>,
    pub retractions: Vec<ListingId>,
}

impl<P> MergeDelta<P> {
    pub fn new() -> Self {
        Self {
            upserts: Vec::new(),
            retractions: Vec::new(),
        }
    }

    /// Delta made only of upserts.
    pub fn upserts(items: Vec<ListingItem<P>>) -> Self {
        Self {
            upserts: items,
            retractions: Vec::new(),
        }
    }

    /// Delta made only of retractions.
    pub fn retractions(ids: Vec<ListingId>) -> Self {
        Self {
            upserts: Vec::new(),
            retractions: ids,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.retractions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.upserts.len() + self.retractions.len()
    }

    /// Fold a later delta into this one.
    ///
    /// The later change of an identity replaces any earlier change of it.
    pub fn absorb(&mut self, later: MergeDelta<P>) {
        if later.is_empty() {
            return;
        }
        let later_ids: HashSet<ListingId> = later
            .retractions
            .iter()
            .cloned()
            .chain(later.upserts.iter().map(|i| i.id.clone()))
            .collect();
        self.upserts.retain(|i| !later_ids.contains(&i.id));
        self.retractions.retain(|id| !later_ids.contains(id));
        self.upserts.extend(later.upserts);
        self.retractions.extend(later.retractions);
    }
}

impl<P> Default for MergeDelta<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> Clone for MergeDelta<P> {
    fn clone(&self) -> Self {
        Self {
            upserts: self.upserts.clone(),
            retractions: self.retractions.clone(),
        }
    }
}

/// Merges the contributions of attached sources.
#[derive(Debug)]
pub struct SourceAggregator<P> {
    /// Per-source contributions.
    contributions: BTreeMap<SourceToken, HashMap<ListingId, ListingItem<P>>>,
    /// Identity -> sources currently contributing it.
    contributors: HashMap<ListingId, BTreeSet<SourceToken>>,
    /// Identity -> (winning source, visible item).
    visible: HashMap<ListingId, (SourceToken, ListingItem<P>)>,
}

impl<P> SourceAggregator<P> {
    pub fn new() -> Self {
        Self {
            contributions: BTreeMap::new(),
            contributors: HashMap::new(),
            visible: HashMap::new(),
        }
    }

    /// Attach a source with its current contents.
    pub fn attach(
        &mut self,
        token: SourceToken,
        items: impl IntoIterator<Item = ListingItem<P>>,
    ) -> FeedResult<MergeDelta<P>> {
        if self.contributions.contains_key(&token) {
            return Err(FeedError::DuplicateSource(token));
        }

        let contributed: HashMap<ListingId, ListingItem<P>> =
            items.into_iter().map(|i| (i.id.clone(), i)).collect();
        let ids: Vec<ListingId> = contributed.keys().cloned().collect();
        self.contributions.insert(token, contributed);

        let mut delta = MergeDelta::new();
        for id in ids {
            self.contributors.entry(id.clone()).or_default().insert(token);
            self.resolve(&id, token, &mut delta);
        }

        debug!(%token, contributed = delta.len(), "Source attached");
        Ok(delta)
    }

    /// Apply a mutation of an attached source.
    ///
    /// Retracting an identity the source never contributed is a desync; the
    /// aggregator is left untouched in that case.
    pub fn update(
        &mut self,
        token: SourceToken,
        change: MergeDelta<P>,
    ) -> FeedResult<MergeDelta<P>> {
        let Some(contributed) = self.contributions.get_mut(&token) else {
            return Err(FeedError::UnknownSource(token));
        };
        if let Some(id) = change
            .retractions
            .iter()
            .find(|id| !contributed.contains_key(*id))
        {
            return Err(FeedError::Desync {
                token,
                id: id.clone(),
            });
        }

        let mut touched: Vec<ListingId> = Vec::with_capacity(change.len());
        let mut seen: HashSet<ListingId> = HashSet::with_capacity(change.len());
        for id in change.retractions {
            contributed.remove(&id);
            if seen.insert(id.clone()) {
                touched.push(id);
            }
        }
        for item in change.upserts {
            let id = item.id.clone();
            contributed.insert(id.clone(), item);
            if seen.insert(id.clone()) {
                touched.push(id);
            }
        }

        let presence: Vec<(ListingId, bool)> = touched
            .into_iter()
            .map(|id| {
                let present = contributed.contains_key(&id);
                (id, present)
            })
            .collect();

        let mut delta = MergeDelta::new();
        for (id, present) in presence {
            if present {
                self.contributors.entry(id.clone()).or_default().insert(token);
            } else if let Some(set) = self.contributors.get_mut(&id) {
                set.remove(&token);
            }
            self.resolve(&id, token, &mut delta);
        }

        trace!(%token, out = delta.len(), "Source update merged");
        Ok(delta)
    }

    /// Detach a source, retracting what no other source still contributes.
    pub fn detach(&mut self, token: SourceToken) -> FeedResult<MergeDelta<P>> {
        let contributed = self
            .contributions
            .remove(&token)
            .ok_or(FeedError::UnknownSource(token))?;

        let mut delta = MergeDelta::new();
        for id in contributed.into_keys() {
            if let Some(set) = self.contributors.get_mut(&id) {
                set.remove(&token);
            }
            self.resolve(&id, token, &mut delta);
        }

        debug!(%token, retracted = delta.retractions.len(), "Source detached");
        Ok(delta)
    }

    /// Re-elect the visible entry of `id` after `touched` changed it.
    fn resolve(&mut self, id: &ListingId, touched: SourceToken, delta: &mut MergeDelta<P>) {
        let best = self.contributors.get(id).and_then(|sources| {
            let mut best: Option<(SourceToken, &ListingItem<P>)> = None;
            for source in sources {
                let Some(item) = self.contributions.get(source).and_then(|c| c.get(id)) else {
                    continue;
                };
                best = match best {
                    Some((_, current)) if item.last_transition_at > current.last_transition_at => {
                        Some((*source, item))
                    }
                    None => Some((*source, item)),
                    keep => keep,
                };
            }
            best.map(|(source, item)| (source, item.clone()))
        });

        match best {
            None => {
                self.contributors.remove(id);
                if self.visible.remove(id).is_some() {
                    delta.retractions.push(id.clone());
                }
            }
            Some((winner, item)) => {
                let changed = match self.visible.get(id) {
                    None => true,
                    Some((previous, _)) => *previous != winner || winner == touched,
                };
                if changed {
                    self.visible.insert(id.clone(), (winner, item.clone()));
                    delta.upserts.push(item);
                }
            }
        }
    }

    /// Merged output.
    pub fn output(&self) -> impl Iterator<Item = &ListingItem<P>> {
        self.visible.values().map(|(_, item)| item)
    }

    /// Owned copy of the merged output.
    pub fn snapshot(&self) -> Vec<ListingItem<P>> {
        self.output().cloned().collect()
    }

    pub fn get(&self, id: &ListingId) -> Option<&ListingItem<P>> {
        self.visible.get(id).map(|(_, item)| item)
    }

    /// Sources currently contributing `id`, in attach order.
    pub fn contributors_of(&self, id: &ListingId) -> Vec<SourceToken> {
        self.contributors
            .get(id)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn contains_source(&self, token: SourceToken) -> bool {
        self.contributions.contains_key(&token)
    }

    pub fn source_count(&self) -> usize {
        self.contributions.len()
    }

    pub fn len(&self) -> usize {
        self.visible.len()
    }

    pub fn is_empty(&self) -> bool {
        self.visible.is_empty()
    }
}

impl<P> Default for SourceAggregator<P> {
    fn default() -> Self {
        Self::new()
    }
}
