//! Source tree: queries and groups of queries.
//!
//! ```text
//!                 root aggregator
//!                /       |       \
//!          query#1    group#2    query#5
//!                     /     \
//!               query#3   query#4
//! ```
//!
//! Query leaves own an `ItemRegistry`; groups own a `SourceAggregator` over
//! their children. Every mutation of a leaf is propagated as a `MergeDelta`
//! through the groups above it, and the delta of the root aggregator is
//! returned to the caller.
//!
//! Nodes refer to their parent by `SourceToken` only.

use crate::aggregator::{MergeDelta, SourceAggregator};
use crate::error::{FeedError, FeedResult};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::{debug, info};
use tw_core::{LifecycleCounters, ListingBatch, ListingId, ListingState, SourceToken};
use tw_registry::{AppliedBatch, ItemRegistry, LifecycleSummary, TransitionPlan};

/// Kind of a source node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    /// A single query/tab producing batches.
    Query,
    /// A group merging its child sources.
    Group,
}

#[derive(Debug)]
enum NodeBody<P> {
    Query(ItemRegistry<P>),
    Group {
        aggregator: SourceAggregator<P>,
        children: Vec<SourceToken>,
    },
}

#[derive(Debug)]
struct SourceNode<P> {
    parent: Option<SourceToken>,
    label: String,
    body: NodeBody<P>,
}

impl<P> SourceNode<P> {
    fn kind(&self) -> SourceKind {
        match self.body {
            NodeBody::Query(_) => SourceKind::Query,
            NodeBody::Group { .. } => SourceKind::Group,
        }
    }
}

/// Tree of registered sources with the root aggregator on top.
#[derive(Debug)]
pub struct SourceTree<P> {
    nodes: HashMap<SourceToken, SourceNode<P>>,
    root: SourceAggregator<P>,
    root_children: Vec<SourceToken>,
    next_token: u64,
}

impl<P> SourceTree<P> {
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
            root: SourceAggregator::new(),
            root_children: Vec::new(),
            next_token: 1,
        }
    }

    /// Register an empty source under `parent` (or the root).
    pub fn add(
        &mut self,
        parent: Option<SourceToken>,
        kind: SourceKind,
        label: impl Into<String>,
    ) -> FeedResult<SourceToken> {
        if let Some(parent) = parent {
            self.ensure_group(parent)?;
        }

        let token = SourceToken::new(self.next_token);
        self.next_token += 1;

        let body = match kind {
            SourceKind::Query => NodeBody::Query(ItemRegistry::new()),
            SourceKind::Group => NodeBody::Group {
                aggregator: SourceAggregator::new(),
                children: Vec::new(),
            },
        };
        let label = label.into();

        // A fresh source is empty, so attaching it changes nothing upstream.
        self.aggregator_mut(parent)?.attach(token, Vec::new())?;
        self.children_mut(parent)?.push(token);
        info!(%token, ?kind, ?parent, label = %label, "Source registered");
        self.nodes.insert(
            token,
            SourceNode {
                parent,
                label,
                body,
            },
        );
        Ok(token)
    }

    /// Remove a source and, for a group, its whole subtree.
    ///
    /// Returns the removed tokens (subtree included) and the root delta.
    pub fn remove(&mut self, token: SourceToken) -> FeedResult<(Vec<SourceToken>, MergeDelta<P>)> {
        let parent = self.node(token)?.parent;

        let removed = self.subtree(token);
        for t in &removed {
            self.nodes.remove(t);
        }
        self.children_mut(parent)?.retain(|c| *c != token);

        let delta = self.aggregator_mut(parent)?.detach(token)?;
        let delta = match parent {
            Some(parent) => self.propagate(parent, delta)?,
            None => delta,
        };

        info!(%token, removed = removed.len(), retracted = delta.retractions.len(), "Source removed");
        Ok((removed, delta))
    }

    /// Replace a query with a fresh, empty one under the same parent.
    ///
    /// The old contribution is fully retracted before the replacement is
    /// attached. Returns the new token and the root delta.
    pub fn rehome(&mut self, token: SourceToken) -> FeedResult<(SourceToken, MergeDelta<P>)> {
        let node = self.node(token)?;
        if node.kind() != SourceKind::Query {
            return Err(FeedError::NotAQuery(token));
        }
        let parent = node.parent;
        let label = node.label.clone();

        let (_, delta) = self.remove(token)?;
        let replacement = self.add(parent, SourceKind::Query, label)?;

        debug!(old = %token, new = %replacement, "Source re-homed");
        Ok((replacement, delta))
    }

    /// Classify and apply a batch to a query.
    pub fn apply_batch(
        &mut self,
        token: SourceToken,
        batch: ListingBatch<P>,
        now: DateTime<Utc>,
    ) -> FeedResult<(LifecycleSummary, MergeDelta<P>)> {
        let AppliedBatch { summary, changed } = self.registry_mut(token)?.apply_at(batch, now)?;
        let delta = self.propagate(token, MergeDelta::upserts(changed))?;
        Ok((summary, delta))
    }

    /// Apply a plan classified elsewhere to a query and propagate it.
    pub fn apply_plan(
        &mut self,
        token: SourceToken,
        plan: TransitionPlan<P>,
        now: DateTime<Utc>,
    ) -> FeedResult<(LifecycleSummary, MergeDelta<P>)> {
        let AppliedBatch { summary, changed } = self.registry_mut(token)?.apply_plan(plan, now)?;
        let delta = self.propagate(token, MergeDelta::upserts(changed))?;
        Ok((summary, delta))
    }

    /// Mark every listing of every query as read.
    pub fn mark_all_read(&mut self, now: DateTime<Utc>) -> FeedResult<MergeDelta<P>> {
        let mut delta = MergeDelta::new();
        for token in self.query_tokens() {
            let changed = self.registry_mut(token)?.mark_all_read(now);
            if !changed.is_empty() {
                delta.absorb(self.propagate(token, MergeDelta::upserts(changed))?);
            }
        }
        Ok(delta)
    }

    /// Delete the listings of one query, or of all queries.
    pub fn clear(&mut self, token: Option<SourceToken>) -> FeedResult<MergeDelta<P>> {
        let targets = match token {
            Some(token) => {
                self.registry(token)?;
                vec![token]
            }
            None => self.query_tokens(),
        };

        let mut delta = MergeDelta::new();
        for token in targets {
            let cleared = self.registry_mut(token)?.clear();
            if !cleared.is_empty() {
                delta.absorb(self.propagate(token, MergeDelta::retractions(cleared))?);
            }
        }
        Ok(delta)
    }

    /// Push the output delta of `from` through its ancestors.
    fn propagate(&mut self, mut from: SourceToken, mut delta: MergeDelta<P>) -> FeedResult<MergeDelta<P>> {
        loop {
            if delta.is_empty() {
                return Ok(delta);
            }
            let parent = self.node(from)?.parent;
            delta = self.aggregator_mut(parent)?.update(from, delta)?;
            match parent {
                Some(parent) => from = parent,
                None => return Ok(delta),
            }
        }
    }

    fn subtree(&self, token: SourceToken) -> Vec<SourceToken> {
        let mut out = Vec::new();
        let mut stack = vec![token];
        while let Some(t) = stack.pop() {
            if let Some(SourceNode {
                body: NodeBody::Group { children, .. },
                ..
            }) = self.nodes.get(&t)
            {
                stack.extend(children.iter().copied());
            }
            out.push(t);
        }
        out
    }

    fn query_tokens(&self) -> Vec<SourceToken> {
        let mut tokens: Vec<SourceToken> = self
            .nodes
            .iter()
            .filter(|(_, n)| n.kind() == SourceKind::Query)
            .map(|(t, _)| *t)
            .collect();
        tokens.sort();
        tokens
    }

    fn node(&self, token: SourceToken) -> FeedResult<&SourceNode<P>> {
        self.nodes.get(&token).ok_or(FeedError::UnknownSource(token))
    }

    fn ensure_group(&self, token: SourceToken) -> FeedResult<()> {
        match self.node(token)?.kind() {
            SourceKind::Group => Ok(()),
            SourceKind::Query => Err(FeedError::NotAGroup(token)),
        }
    }

    fn aggregator_mut(&mut self, group: Option<SourceToken>) -> FeedResult<&mut SourceAggregator<P>> {
        match group {
            None => Ok(&mut self.root),
            Some(token) => match self.nodes.get_mut(&token) {
                Some(SourceNode {
                    body: NodeBody::Group { aggregator, .. },
                    ..
                }) => Ok(aggregator),
                Some(_) => Err(FeedError::NotAGroup(token)),
                None => Err(FeedError::UnknownSource(token)),
            },
        }
    }

    fn children_mut(&mut self, group: Option<SourceToken>) -> FeedResult<&mut Vec<SourceToken>> {
        match group {
            None => Ok(&mut self.root_children),
            Some(token) => match self.nodes.get_mut(&token) {
                Some(SourceNode {
                    body: NodeBody::Group { children, .. },
                    ..
                }) => Ok(children),
                Some(_) => Err(FeedError::NotAGroup(token)),
                None => Err(FeedError::UnknownSource(token)),
            },
        }
    }

    /// Registry of a query.
    pub fn registry(&self, token: SourceToken) -> FeedResult<&ItemRegistry<P>> {
        match &self.node(token)?.body {
            NodeBody::Query(registry) => Ok(registry),
            NodeBody::Group { .. } => Err(FeedError::NotAQuery(token)),
        }
    }

    fn registry_mut(&mut self, token: SourceToken) -> FeedResult<&mut ItemRegistry<P>> {
        match self.nodes.get_mut(&token) {
            Some(SourceNode {
                body: NodeBody::Query(registry),
                ..
            }) => Ok(registry),
            Some(_) => Err(FeedError::NotAQuery(token)),
            None => Err(FeedError::UnknownSource(token)),
        }
    }

    /// Merged output of every registered source.
    pub fn root(&self) -> &SourceAggregator<P> {
        &self.root
    }

    /// Per-state counts of the merged output.
    pub fn counters(&self) -> LifecycleCounters {
        let mut counters = LifecycleCounters::default();
        for item in self.root.output() {
            counters.increment(item.state);
        }
        counters
    }

    pub fn kind(&self, token: SourceToken) -> Option<SourceKind> {
        self.nodes.get(&token).map(|n| n.kind())
    }

    pub fn parent(&self, token: SourceToken) -> Option<SourceToken> {
        self.nodes.get(&token).and_then(|n| n.parent)
    }

    pub fn label(&self, token: SourceToken) -> Option<&str> {
        self.nodes.get(&token).map(|n| n.label.as_str())
    }

    pub fn contains(&self, token: SourceToken) -> bool {
        self.nodes.contains_key(&token)
    }

    /// Number of registered sources (groups included).
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// State of `id` in the merged output.
    pub fn state_of(&self, id: &ListingId) -> Option<ListingState> {
        self.root.get(id).map(|i| i.state)
    }
}

impl<P> Default for SourceTree<P> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    fn id(key: &str) -> ListingId {
        ListingId::new(key).unwrap()
    }

    fn batch_new(keys: &[&str]) -> ListingBatch<u32> {
        let mut batch = ListingBatch::new();
        for key in keys {
            batch.push_new(id(key), 0);
        }
        batch
    }

    #[test]
    fn test_two_queries_share_identity() {
        let mut tree = SourceTree::new();
        let a = tree.add(None, SourceKind::Query, "tab a").unwrap();
        let b = tree.add(None, SourceKind::Query, "tab b").unwrap();

        let (_, delta) = tree.apply_batch(a, batch_new(&["x", "y"]), Utc::now()).unwrap();
        assert_eq!(delta.upserts.len(), 2);
        tree.apply_batch(b, batch_new(&["x"]), Utc::now()).unwrap();
        assert_eq!(tree.root().len(), 2);

        let (removed, delta) = assert_ok!(tree.remove(a));
        assert_eq!(removed, vec![a]);
        assert_eq!(delta.retractions, vec![id("y")]);
        assert!(tree.root().get(&id("x")).is_some());
    }

    #[test]
    fn test_nested_group_propagates_to_root() {
        let mut tree = SourceTree::new();
        let group = tree.add(None, SourceKind::Group, "group").unwrap();
        let q1 = tree.add(Some(group), SourceKind::Query, "q1").unwrap();
        let q2 = tree.add(Some(group), SourceKind::Query, "q2").unwrap();

        tree.apply_batch(q1, batch_new(&["a"]), Utc::now()).unwrap();
        let (_, delta) = tree.apply_batch(q2, batch_new(&["b"]), Utc::now()).unwrap();
        assert_eq!(delta.upserts.len(), 1);
        assert_eq!(tree.root().len(), 2);

        let (removed, delta) = tree.remove(group).unwrap();
        assert_eq!(removed.len(), 3);
        assert_eq!(delta.retractions.len(), 2);
        assert!(tree.root().is_empty());
        assert!(tree.is_empty());
    }

    #[test]
    fn test_query_cannot_parent() {
        let mut tree: SourceTree<u32> = SourceTree::new();
        let q = tree.add(None, SourceKind::Query, "q").unwrap();
        assert!(matches!(
            tree.add(Some(q), SourceKind::Query, "child"),
            Err(FeedError::NotAGroup(_))
        ));
    }

    #[test]
    fn test_rehome_retracts_before_attaching() {
        let mut tree = SourceTree::new();
        let q = tree.add(None, SourceKind::Query, "tab").unwrap();
        tree.apply_batch(q, batch_new(&["a", "b"]), Utc::now()).unwrap();

        let (replacement, delta) = tree.rehome(q).unwrap();
        assert_ne!(replacement, q);
        assert_eq!(delta.retractions.len(), 2);
        assert!(tree.root().is_empty());
        assert!(!tree.contains(q));
        assert_eq!(tree.label(replacement), Some("tab"));

        let (_, delta) = tree
            .apply_batch(replacement, batch_new(&["a"]), Utc::now())
            .unwrap();
        assert_eq!(delta.upserts.len(), 1);
        assert_eq!(tree.root().len(), 1);
    }

    #[test]
    fn test_violation_leaves_tree_untouched() {
        let mut tree = SourceTree::new();
        let q = tree.add(None, SourceKind::Query, "tab").unwrap();
        let mut batch = batch_new(&["a"]);
        batch.push_removed(id("ghost"), 0);

        let err = assert_err!(tree.apply_batch(q, batch, Utc::now()));
        assert!(matches!(err, FeedError::Registry(_)));
        assert!(tree.root().is_empty());
        assert!(tree.registry(q).unwrap().is_empty());
    }

    #[test]
    fn test_mark_all_read_and_clear() {
        let mut tree = SourceTree::new();
        let a = tree.add(None, SourceKind::Query, "a").unwrap();
        let b = tree.add(None, SourceKind::Query, "b").unwrap();
        tree.apply_batch(a, batch_new(&["x", "y"]), Utc::now()).unwrap();
        tree.apply_batch(b, batch_new(&["z"]), Utc::now()).unwrap();

        let delta = tree.mark_all_read(Utc::now()).unwrap();
        assert_eq!(delta.upserts.len(), 3);
        assert_eq!(tree.counters().normal_count, 3);
        assert_eq!(tree.state_of(&id("x")), Some(ListingState::Normal));

        let delta = tree.clear(Some(a)).unwrap();
        assert_eq!(delta.retractions.len(), 2);
        let delta = tree.clear(None).unwrap();
        assert_eq!(delta.retractions, vec![id("z")]);
        assert!(tree.root().is_empty());
    }
}
