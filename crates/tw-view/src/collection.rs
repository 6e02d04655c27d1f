//! Mirror of the merged collection.
//!
//! Items keep the arrival sequence they were given when they first entered
//! the collection; the sort stage uses it as the terminal tie-break. An item
//! that is retracted and later comes back gets a new sequence.

use std::collections::{BTreeMap, HashMap};
use tracing::debug;
use tw_core::{LifecycleCounters, ListingId, ListingItem};

/// An item with its arrival sequence.
#[derive(Debug)]
pub struct ViewRow<P> {
    pub seq: u64,
    pub item: ListingItem<P>,
}

impl<P> Clone for ViewRow<P> {
    fn clone(&self) -> Self {
        Self {
            seq: self.seq,
            item: self.item.clone(),
        }
    }
}

#[derive(Debug)]
pub struct LiveCollection<P> {
    by_seq: BTreeMap<u64, ListingItem<P>>,
    seq_of: HashMap<ListingId, u64>,
    counters: LifecycleCounters,
    next_seq: u64,
}

impl<P> LiveCollection<P> {
    pub fn new() -> Self {
        Self {
            by_seq: BTreeMap::new(),
            seq_of: HashMap::new(),
            counters: LifecycleCounters::default(),
            next_seq: 0,
        }
    }

    /// Insert or replace an item. Returns its arrival sequence.
    pub fn upsert(&mut self, item: ListingItem<P>) -> u64 {
        match self.seq_of.get(&item.id) {
            Some(&seq) => {
                if let Some(previous) = self.by_seq.get_mut(&seq) {
                    self.counters.transition(previous.state, item.state);
                    *previous = item;
                }
                seq
            }
            None => {
                let seq = self.next_seq;
                self.next_seq += 1;
                self.counters.increment(item.state);
                self.seq_of.insert(item.id.clone(), seq);
                self.by_seq.insert(seq, item);
                seq
            }
        }
    }

    /// Remove an item. Returns `false` if it was not present.
    pub fn retract(&mut self, id: &ListingId) -> bool {
        let Some(seq) = self.seq_of.remove(id) else {
            debug!(%id, "Retraction of absent item ignored");
            return false;
        };
        if let Some(item) = self.by_seq.remove(&seq) {
            self.counters.decrement(item.state);
        }
        true
    }

    pub fn get(&self, id: &ListingId) -> Option<&ListingItem<P>> {
        self.seq_of.get(id).and_then(|seq| self.by_seq.get(seq))
    }

    /// Items in arrival order.
    pub fn rows(&self) -> impl Iterator<Item = ViewRow<P>> + '_ {
        self.by_seq.iter().map(|(seq, item)| ViewRow {
            seq: *seq,
            item: item.clone(),
        })
    }

    pub fn counters(&self) -> LifecycleCounters {
        self.counters
    }

    pub fn len(&self) -> usize {
        self.by_seq.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_seq.is_empty()
    }
}

impl<P> Default for LiveCollection<P> {
    fn default() -> Self {
        Self::new()
    }
}
