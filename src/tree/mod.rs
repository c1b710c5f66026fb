//! Hierarchical unread/starred/deferred counters.
//!
//! [`FeedTree`] is a plain arena of nodes keyed by [`NodeKey`]; parents are
//! referenced by id only. Every mutation returns the [`CountChange`]s it
//! caused so the store-backed [`Aggregator`] can broadcast them.

mod aggregator;

pub use aggregator::{Aggregator, ImportReport, TreeError};

use serde::Serialize;
use std::collections::HashMap;

use crate::storage::{Group, PseudoCounts, Source};

/// Synthetic aggregation roots with store-computed counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PseudoRoot {
    AllUnread,
    Starred,
    Deferred,
}

impl PseudoRoot {
    pub const ALL: [PseudoRoot; 3] = [PseudoRoot::AllUnread, PseudoRoot::Starred, PseudoRoot::Deferred];

    /// Reserved negative id, never used by stored rows
    pub fn id(self) -> i64 {
        match self {
            PseudoRoot::AllUnread => -1,
            PseudoRoot::Starred => -2,
            PseudoRoot::Deferred => -3,
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            PseudoRoot::AllUnread => "All unread",
            PseudoRoot::Starred => "Starred",
            PseudoRoot::Deferred => "Read later",
        }
    }

    pub fn from_id(id: i64) -> Option<Self> {
        PseudoRoot::ALL.into_iter().find(|p| p.id() == id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum NodeKey {
    Pseudo(PseudoRoot),
    Group(i64),
    Source(i64),
}

impl NodeKey {
    pub fn id(self) -> i64 {
        match self {
            NodeKey::Pseudo(p) => p.id(),
            NodeKey::Group(id) | NodeKey::Source(id) => id,
        }
    }
}

/// One row of the tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Node {
    pub key: NodeKey,
    pub title: String,
    /// Feed URL (sources only)
    pub url: Option<String>,
    /// Site link (sources only)
    pub link: Option<String>,
    pub image_url: Option<String>,
    pub rank: i64,
    /// Leaf counter for sources, derived sum for groups, store value for pseudo-roots
    pub unread: i64,
    /// Ordered child keys (groups only)
    pub children: Vec<NodeKey>,
    /// Containing group id (sources only)
    pub parent: Option<i64>,
}

/// A top-level node with its sources inlined, for serialized dumps.
#[derive(Debug, Serialize)]
pub struct OutlineNode<'a> {
    #[serde(flatten)]
    pub node: &'a Node,
    /// Group members in rank order; empty for everything else
    pub sources: Vec<&'a Node>,
}

impl Node {
    fn pseudo(root: PseudoRoot) -> Self {
        Self {
            key: NodeKey::Pseudo(root),
            title: root.title().to_string(),
            url: None,
            link: None,
            image_url: None,
            rank: root.id(),
            unread: 0,
            children: Vec::new(),
            parent: None,
        }
    }

    fn group(group: &Group) -> Self {
        Self {
            key: NodeKey::Group(group.id),
            title: group.name.clone(),
            url: None,
            link: None,
            image_url: None,
            rank: group.rank,
            unread: 0,
            children: Vec::new(),
            parent: None,
        }
    }

    fn source(source: &Source, unread: i64) -> Self {
        Self {
            key: NodeKey::Source(source.id),
            title: source.title.clone(),
            url: Some(source.feed_url.clone()),
            link: source.link.clone(),
            image_url: source.image_url.clone(),
            rank: source.rank,
            unread,
            children: Vec::new(),
            parent: source.group_id,
        }
    }

    pub fn is_source(&self) -> bool {
        matches!(self.key, NodeKey::Source(_))
    }
}

/// A counter that changed value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CountChange {
    pub key: NodeKey,
    pub count: i64,
}

#[derive(Debug, Clone)]
pub struct FeedTree {
    nodes: HashMap<NodeKey, Node>,
    /// Groups then ungrouped sources, each by rank
    top: Vec<NodeKey>,
}

impl Default for FeedTree {
    fn default() -> Self {
        Self::new()
    }
}

impl FeedTree {
    /// Empty tree holding only the pseudo-roots
    pub fn new() -> Self {
        let nodes = PseudoRoot::ALL
            .into_iter()
            .map(|p| (NodeKey::Pseudo(p), Node::pseudo(p)))
            .collect();
        Self {
            nodes,
            top: Vec::new(),
        }
    }

    /// Build a tree from store rows. Sources whose group is unknown are
    /// treated as ungrouped.
    pub fn build(
        groups: &[Group],
        sources: &[(Source, i64)],
        counts: PseudoCounts,
    ) -> Self {
        let mut tree = Self::new();
        for group in groups {
            tree.insert_group(group);
        }
        for (source, unread) in sources {
            tree.insert_source(source, *unread);
        }
        tree.set_pseudo_counts(counts);
        tree
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn node(&self, key: NodeKey) -> Option<&Node> {
        self.nodes.get(&key)
    }

    /// Unread count of any node; 0 for unknown keys.
    ///
    /// For the Starred and Deferred roots this is their flag count.
    pub fn unread(&self, key: NodeKey) -> i64 {
        self.nodes.get(&key).map_or(0, |n| n.unread)
    }

    pub fn starred_count(&self) -> i64 {
        self.unread(NodeKey::Pseudo(PseudoRoot::Starred))
    }

    pub fn deferred_count(&self) -> i64 {
        self.unread(NodeKey::Pseudo(PseudoRoot::Deferred))
    }

    /// Pseudo-roots, then groups and ungrouped sources in display order
    pub fn top_level(&self) -> Vec<&Node> {
        PseudoRoot::ALL
            .into_iter()
            .map(NodeKey::Pseudo)
            .chain(self.top.iter().copied())
            .filter_map(|key| self.nodes.get(&key))
            .collect()
    }

    /// Sources of a group in rank order; empty for unknown groups
    pub fn children(&self, group_id: i64) -> Vec<&Node> {
        self.nodes
            .get(&NodeKey::Group(group_id))
            .map(|g| g.children.iter().filter_map(|k| self.nodes.get(k)).collect())
            .unwrap_or_default()
    }

    /// `top_level` with each group's sources attached
    pub fn outline(&self) -> Vec<OutlineNode<'_>> {
        self.top_level()
            .into_iter()
            .map(|node| OutlineNode {
                node,
                sources: match node.key {
                    NodeKey::Group(id) => self.children(id),
                    _ => Vec::new(),
                },
            })
            .collect()
    }

    /// Every source, grouped ones first, in display order
    pub fn sources(&self) -> Vec<&Node> {
        let mut out = Vec::new();
        for key in &self.top {
            match key {
                NodeKey::Group(id) => out.extend(self.children(*id)),
                NodeKey::Source(_) => out.extend(self.nodes.get(key)),
                NodeKey::Pseudo(_) => {}
            }
        }
        out
    }

    pub fn sources_in_group(&self, group_id: i64) -> Vec<&Node> {
        self.children(group_id)
    }

    pub fn contains(&self, key: NodeKey) -> bool {
        self.nodes.contains_key(&key)
    }

    // ------------------------------------------------------------------
    // Structure
    // ------------------------------------------------------------------

    pub fn insert_group(&mut self, group: &Group) {
        let key = NodeKey::Group(group.id);
        let node = Node::group(group);
        if self.nodes.insert(key, node).is_none() {
            self.top.push(key);
            self.sort_top();
        }
    }

    /// Insert (or replace) a source leaf and re-aggregate.
    pub fn insert_source(&mut self, source: &Source, unread: i64) -> Vec<CountChange> {
        let key = NodeKey::Source(source.id);
        let mut changes = Vec::new();
        if self.nodes.contains_key(&key) {
            changes.extend(self.remove_source(source.id));
        }

        let mut node = Node::source(source, unread);
        if let Some(group_id) = node.parent {
            if !self.nodes.contains_key(&NodeKey::Group(group_id)) {
                tracing::warn!(source_id = source.id, group_id = group_id, "Source references unknown group");
                node.parent = None;
            }
        }
        let parent = node.parent;
        self.nodes.insert(key, node);
        self.attach(key, parent);

        changes.extend(self.reaggregate(parent));
        dedup_changes(changes)
    }

    /// Remove a group and all its sources.
    pub fn remove_group(&mut self, group_id: i64) -> Vec<CountChange> {
        let key = NodeKey::Group(group_id);
        let Some(group) = self.nodes.remove(&key) else {
            return Vec::new();
        };
        for child in &group.children {
            self.nodes.remove(child);
        }
        self.top.retain(|k| *k != key);
        self.reaggregate(None)
    }

    pub fn remove_source(&mut self, source_id: i64) -> Vec<CountChange> {
        let key = NodeKey::Source(source_id);
        let Some(node) = self.nodes.remove(&key) else {
            return Vec::new();
        };
        self.detach(key, node.parent);
        self.reaggregate(node.parent)
    }

    /// Re-parent a source; both old and new parent are re-aggregated.
    ///
    /// Returns `None` when the source or the target group is unknown.
    pub fn move_source(&mut self, source_id: i64, group_id: Option<i64>) -> Option<Vec<CountChange>> {
        let key = NodeKey::Source(source_id);
        if let Some(gid) = group_id {
            if !self.nodes.contains_key(&NodeKey::Group(gid)) {
                return None;
            }
        }
        let old_parent = {
            let node = self.nodes.get_mut(&key)?;
            std::mem::replace(&mut node.parent, group_id)
        };

        self.detach(key, old_parent);
        self.attach(key, group_id);

        let mut changes = self.reaggregate(old_parent);
        changes.extend(self.reaggregate(group_id));
        Some(dedup_changes(changes))
    }

    /// Set a node's title. Returns false for unknown or pseudo keys.
    pub fn rename(&mut self, key: NodeKey, title: &str) -> bool {
        if matches!(key, NodeKey::Pseudo(_)) {
            return false;
        }
        match self.nodes.get_mut(&key) {
            Some(node) => {
                node.title = title.to_string();
                true
            }
            None => false,
        }
    }

    /// Refresh the display fields of a source after a metadata update.
    pub fn update_source_metadata(&mut self, source: &Source) {
        if let Some(node) = self.nodes.get_mut(&NodeKey::Source(source.id)) {
            node.title = source.title.clone();
            node.link = source.link.clone();
            node.image_url = source.image_url.clone();
        }
    }

    // ------------------------------------------------------------------
    // Counters
    // ------------------------------------------------------------------

    /// Set a leaf counter, then its group and All unread.
    pub fn set_source_unread(&mut self, source_id: i64, unread: i64) -> Vec<CountChange> {
        let key = NodeKey::Source(source_id);
        let Some(node) = self.nodes.get_mut(&key) else {
            return Vec::new();
        };
        let unread = unread.max(0);
        let parent = node.parent;
        let mut changes = Vec::new();
        if node.unread != unread {
            node.unread = unread;
            changes.push(CountChange { key, count: unread });
        }
        changes.extend(self.reaggregate(parent));
        changes
    }

    /// Zero every leaf of a group.
    pub fn zero_group(&mut self, group_id: i64) -> Vec<CountChange> {
        let children = match self.nodes.get(&NodeKey::Group(group_id)) {
            Some(group) => group.children.clone(),
            None => return Vec::new(),
        };
        let mut changes = self.zero_leaves(&children);
        changes.extend(self.reaggregate(Some(group_id)));
        changes
    }

    /// Zero every leaf in the tree.
    pub fn zero_all(&mut self) -> Vec<CountChange> {
        let leaves: Vec<NodeKey> = self.sources().iter().map(|n| n.key).collect();
        let mut changes = self.zero_leaves(&leaves);
        let groups: Vec<i64> = self
            .top
            .iter()
            .filter_map(|k| match k {
                NodeKey::Group(id) => Some(*id),
                _ => None,
            })
            .collect();
        for group_id in groups {
            changes.extend(self.recompute_group(group_id));
        }
        changes.extend(self.recompute_all_unread());
        changes
    }

    /// Overwrite the pseudo-root counters with store-computed values.
    pub fn set_pseudo_counts(&mut self, counts: PseudoCounts) -> Vec<CountChange> {
        [
            (PseudoRoot::AllUnread, counts.unread),
            (PseudoRoot::Starred, counts.starred),
            (PseudoRoot::Deferred, counts.deferred),
        ]
        .into_iter()
        .filter_map(|(root, count)| self.set_count(NodeKey::Pseudo(root), count))
        .collect()
    }

    fn zero_leaves(&mut self, keys: &[NodeKey]) -> Vec<CountChange> {
        keys.iter()
            .filter_map(|key| self.set_count(*key, 0))
            .collect()
    }

    fn set_count(&mut self, key: NodeKey, count: i64) -> Option<CountChange> {
        let node = self.nodes.get_mut(&key)?;
        if node.unread == count {
            return None;
        }
        node.unread = count;
        Some(CountChange { key, count })
    }

    fn reaggregate(&mut self, parent: Option<i64>) -> Vec<CountChange> {
        let mut changes = Vec::new();
        if let Some(group_id) = parent {
            changes.extend(self.recompute_group(group_id));
        }
        changes.extend(self.recompute_all_unread());
        changes
    }

    fn recompute_group(&mut self, group_id: i64) -> Option<CountChange> {
        let sum: i64 = self
            .children(group_id)
            .iter()
            .map(|n| n.unread)
            .sum();
        self.set_count(NodeKey::Group(group_id), sum)
    }

    fn recompute_all_unread(&mut self) -> Option<CountChange> {
        let sum: i64 = self
            .nodes
            .values()
            .filter(|n| n.is_source())
            .map(|n| n.unread)
            .sum();
        self.set_count(NodeKey::Pseudo(PseudoRoot::AllUnread), sum)
    }

    fn attach(&mut self, key: NodeKey, parent: Option<i64>) {
        match parent {
            Some(group_id) => {
                let mut siblings = match self.nodes.get(&NodeKey::Group(group_id)) {
                    Some(group) => group.children.clone(),
                    None => return,
                };
                siblings.push(key);
                self.sort_keys(&mut siblings);
                if let Some(group) = self.nodes.get_mut(&NodeKey::Group(group_id)) {
                    group.children = siblings;
                }
            }
            None => {
                self.top.push(key);
                self.sort_top();
            }
        }
    }

    fn detach(&mut self, key: NodeKey, parent: Option<i64>) {
        match parent {
            Some(group_id) => {
                if let Some(group) = self.nodes.get_mut(&NodeKey::Group(group_id)) {
                    group.children.retain(|k| *k != key);
                }
            }
            None => self.top.retain(|k| *k != key),
        }
    }

    fn sort_top(&mut self) {
        let mut top = std::mem::take(&mut self.top);
        self.sort_keys(&mut top);
        self.top = top;
    }

    /// Groups before sources, then rank, then id
    fn sort_keys(&self, keys: &mut [NodeKey]) {
        keys.sort_by_key(|key| {
            let rank = self.nodes.get(key).map_or(i64::MAX, |n| n.rank);
            let kind = u8::from(matches!(key, NodeKey::Source(_)));
            (kind, rank, key.id())
        });
    }
}

/// Keep the last change per key, preserving first-seen order
fn dedup_changes(changes: Vec<CountChange>) -> Vec<CountChange> {
    let mut out: Vec<CountChange> = Vec::with_capacity(changes.len());
    for change in changes {
        match out.iter_mut().find(|c| c.key == change.key) {
            Some(existing) => existing.count = change.count,
            None => out.push(change),
        }
    }
    out
}
