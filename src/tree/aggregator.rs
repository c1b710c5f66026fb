use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;
use tokio::sync::broadcast;

use super::{CountChange, FeedTree, Node, NodeKey};
use crate::feed::{OpmlDocument, OpmlFeed, OpmlGroup, SubscriptionTree};
use crate::storage::{Database, DatabaseError, EntryFlag, Group, NewSource, Source};
use crate::util::{host_of, sanitize_name, validate_url};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum TreeError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Already exists: {0}")]
    Duplicate(String),

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: i64 },

    #[error(transparent)]
    Storage(#[from] DatabaseError),
}

/// Outcome of [`Aggregator::import_opml`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportReport {
    pub groups_created: usize,
    pub sources_created: usize,
    /// Feeds already subscribed
    pub existing: usize,
    /// Outlines dropped by the parser or rejected on insert
    pub skipped: usize,
}

/// Store-backed owner of the [`FeedTree`].
///
/// Every mutation writes the store first, then updates the tree and
/// broadcasts the resulting [`CountChange`]s. The tree lock is never held
/// across an `.await`.
pub struct Aggregator {
    db: Database,
    tree: RwLock<FeedTree>,
    events: broadcast::Sender<CountChange>,
}

impl Aggregator {
    /// Build the tree from the store.
    pub async fn load(db: Database) -> Result<Self, TreeError> {
        let tree = build_tree(&db).await?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        tracing::debug!(sources = tree.sources().len(), "Aggregation tree loaded");
        Ok(Self {
            db,
            tree: RwLock::new(tree),
            events,
        })
    }

    /// Discard in-memory state and rebuild from the store.
    pub async fn reload(&self) -> Result<(), TreeError> {
        let tree = build_tree(&self.db).await?;
        *self.write() = tree;
        Ok(())
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Receive every counter change from now on
    pub fn subscribe(&self) -> broadcast::Receiver<CountChange> {
        self.events.subscribe()
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn unread(&self, key: NodeKey) -> i64 {
        self.read().unread(key)
    }

    pub fn starred_count(&self) -> i64 {
        self.read().starred_count()
    }

    pub fn deferred_count(&self) -> i64 {
        self.read().deferred_count()
    }

    pub fn node(&self, key: NodeKey) -> Option<Node> {
        self.read().node(key).cloned()
    }

    pub fn top_level(&self) -> Vec<Node> {
        self.read().top_level().into_iter().cloned().collect()
    }

    pub fn children(&self, group_id: i64) -> Vec<Node> {
        self.read().children(group_id).into_iter().cloned().collect()
    }

    pub fn sources(&self) -> Vec<Node> {
        self.read().sources().into_iter().cloned().collect()
    }

    pub fn sources_in_group(&self, group_id: i64) -> Vec<Node> {
        self.read()
            .sources_in_group(group_id)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Point-in-time copy of the whole tree
    pub fn snapshot(&self) -> FeedTree {
        self.read().clone()
    }

    // ========================================================================
    // Structure
    // ========================================================================

    pub async fn add_group(&self, name: &str) -> Result<Group, TreeError> {
        let name = sanitize_name(name)
            .ok_or_else(|| TreeError::InvalidArgument("group name is empty".to_string()))?;
        if self.db.get_group_by_name(&name).await?.is_some() {
            return Err(TreeError::Duplicate(format!("group '{}'", name)));
        }

        let group = self.db.create_group(&name).await?;
        self.write().insert_group(&group);

        tracing::info!(group_id = group.id, name = %group.name, "Group created");
        Ok(group)
    }

    pub async fn add_source(&self, new: NewSource) -> Result<Source, TreeError> {
        let feed_url = new.feed_url.trim().to_string();
        validate_url(&feed_url)
            .map_err(|e| TreeError::InvalidArgument(format!("feed URL '{}': {}", feed_url, e)))?;

        if self.db.get_source_by_url(&feed_url).await?.is_some() {
            return Err(TreeError::Duplicate(format!("feed '{}'", feed_url)));
        }
        if let Some(group_id) = new.group_id {
            if self.db.get_group_by_id(group_id).await?.is_none() {
                return Err(TreeError::InvalidArgument(format!("unknown group {}", group_id)));
            }
        }

        // Placeholder until the first refresh supplies the feed's own title
        let title = sanitize_name(&new.title)
            .or_else(|| host_of(&feed_url))
            .unwrap_or_else(|| feed_url.clone());
        let link = new
            .link
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty());

        let source = self
            .db
            .create_source(&NewSource {
                feed_url,
                title,
                link,
                group_id: new.group_id,
            })
            .await?;

        let changes = self.write().insert_source(&source, 0);
        self.emit(changes);

        tracing::info!(source_id = source.id, url = %source.feed_url, "Source added");
        Ok(source)
    }

    pub async fn delete_group(&self, group_id: i64) -> Result<u64, TreeError> {
        check_id("group", group_id)?;
        if self.db.get_group_by_id(group_id).await?.is_none() {
            return Err(TreeError::NotFound { kind: "group", id: group_id });
        }

        let removed = self.db.delete_group(group_id).await?;
        let changes = self.write().remove_group(group_id);
        self.emit(changes);
        self.refresh_pseudo_counts().await?;

        tracing::info!(group_id = group_id, entries_removed = removed, "Group deleted");
        Ok(removed)
    }

    pub async fn delete_source(&self, source_id: i64) -> Result<u64, TreeError> {
        check_id("source", source_id)?;
        if self.db.get_source_by_id(source_id).await?.is_none() {
            return Err(TreeError::NotFound { kind: "source", id: source_id });
        }

        let removed = self.db.delete_source(source_id).await?;
        let changes = self.write().remove_source(source_id);
        self.emit(changes);
        self.refresh_pseudo_counts().await?;

        tracing::info!(source_id = source_id, entries_removed = removed, "Source deleted");
        Ok(removed)
    }

    pub async fn rename_group(&self, group_id: i64, name: &str) -> Result<(), TreeError> {
        check_id("group", group_id)?;
        let name = sanitize_name(name)
            .ok_or_else(|| TreeError::InvalidArgument("group name is empty".to_string()))?;
        if let Some(other) = self.db.get_group_by_name(&name).await? {
            if other.id != group_id {
                return Err(TreeError::Duplicate(format!("group '{}'", name)));
            }
        }

        self.db
            .update_group_name(group_id, &name)
            .await
            .map_err(not_found_as_tree_error)?;
        self.write().rename(NodeKey::Group(group_id), &name);
        Ok(())
    }

    pub async fn rename_source(&self, source_id: i64, title: &str) -> Result<(), TreeError> {
        check_id("source", source_id)?;
        let title = sanitize_name(title)
            .ok_or_else(|| TreeError::InvalidArgument("source title is empty".to_string()))?;

        self.db
            .update_source_title(source_id, &title)
            .await
            .map_err(not_found_as_tree_error)?;
        self.write().rename(NodeKey::Source(source_id), &title);
        Ok(())
    }

    /// Move a source into `group_id`, or to the top level with `None`.
    pub async fn move_source(&self, source_id: i64, group_id: Option<i64>) -> Result<(), TreeError> {
        check_id("source", source_id)?;
        if let Some(gid) = group_id {
            if self.db.get_group_by_id(gid).await?.is_none() {
                return Err(TreeError::NotFound { kind: "group", id: gid });
            }
        }

        self.db
            .move_source_to_group(source_id, group_id)
            .await
            .map_err(not_found_as_tree_error)?;

        let changes = self.write().move_source(source_id, group_id);
        match changes {
            Some(changes) => self.emit(changes),
            None => {
                tracing::warn!(source_id = source_id, "Tree out of sync with store, reloading");
                self.reload().await?;
            }
        }
        Ok(())
    }

    // ========================================================================
    // Read state
    // ========================================================================

    pub async fn mark_source_read(&self, source_id: i64) -> Result<u64, TreeError> {
        check_id("source", source_id)?;
        let changed = self.db.set_source_flag(source_id, EntryFlag::Read, true).await?;

        let changes = self.write().set_source_unread(source_id, 0);
        self.emit(changes);
        self.refresh_pseudo_counts().await?;
        Ok(changed)
    }

    pub async fn mark_group_read(&self, group_id: i64) -> Result<u64, TreeError> {
        check_id("group", group_id)?;
        let changed = self.db.set_group_flag(group_id, EntryFlag::Read, true).await?;

        let changes = self.write().zero_group(group_id);
        self.emit(changes);
        self.refresh_pseudo_counts().await?;
        Ok(changed)
    }

    pub async fn mark_all_read(&self) -> Result<u64, TreeError> {
        let changed = self.db.set_all_flag(EntryFlag::Read, true).await?;

        let changes = self.write().zero_all();
        self.emit(changes);
        self.refresh_pseudo_counts().await?;
        Ok(changed)
    }

    /// Set one flag on one entry; counters are refreshed only if it changed.
    pub async fn mark_entry(&self, entry_id: i64, flag: EntryFlag, value: bool) -> Result<bool, TreeError> {
        check_id("entry", entry_id)?;
        let entry = self
            .db
            .get_entry(entry_id)
            .await?
            .ok_or(TreeError::NotFound { kind: "entry", id: entry_id })?;

        let changed = self.db.set_entry_flag(entry_id, flag, value).await?;
        if changed {
            self.refresh_source_count(entry.source_id).await?;
            self.refresh_pseudo_counts().await?;
        }
        Ok(changed)
    }

    // ========================================================================
    // Store-driven refresh
    // ========================================================================

    /// Recount one source's unread entries and push the value into the tree.
    pub async fn refresh_source_count(&self, source_id: i64) -> Result<i64, TreeError> {
        let unread = self.db.get_unread_count_for_source(source_id).await?;
        let changes = self.write().set_source_unread(source_id, unread);
        self.emit(changes);
        Ok(unread)
    }

    /// Re-read the three pseudo-root counts from the store.
    pub async fn refresh_pseudo_counts(&self) -> Result<(), TreeError> {
        let counts = self.db.get_pseudo_counts().await?;
        let changes = self.write().set_pseudo_counts(counts);
        self.emit(changes);
        Ok(())
    }

    /// Copy a source's stored title/link/image onto its node.
    pub async fn refresh_source_metadata(&self, source_id: i64) -> Result<(), TreeError> {
        if let Some(source) = self.db.get_source_by_id(source_id).await? {
            self.write().update_source_metadata(&source);
        }
        Ok(())
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    /// Merge an OPML document into the store and tree.
    ///
    /// Groups are matched case-insensitively and created when absent; feeds
    /// already subscribed are left alone, so re-import is a no-op.
    pub async fn import_opml(&self, doc: &OpmlDocument) -> Result<ImportReport, TreeError> {
        let mut report = ImportReport {
            skipped: doc.skipped,
            ..Default::default()
        };

        for group in &doc.groups {
            let Some(name) = sanitize_name(&group.name) else {
                for feed in &group.feeds {
                    self.import_feed(feed, None, &mut report).await?;
                }
                continue;
            };

            let group_id = match self.db.get_group_by_name(&name).await? {
                Some(existing) => existing.id,
                None => {
                    report.groups_created += 1;
                    self.add_group(&name).await?.id
                }
            };
            for feed in &group.feeds {
                self.import_feed(feed, Some(group_id), &mut report).await?;
            }
        }

        for feed in &doc.feeds {
            self.import_feed(feed, None, &mut report).await?;
        }

        tracing::info!(
            groups = report.groups_created,
            sources = report.sources_created,
            existing = report.existing,
            skipped = report.skipped,
            "OPML import finished"
        );
        Ok(report)
    }

    async fn import_feed(
        &self,
        feed: &OpmlFeed,
        group_id: Option<i64>,
        report: &mut ImportReport,
    ) -> Result<(), TreeError> {
        if feed.xml_url.trim().is_empty() || feed.title.trim().is_empty() {
            report.skipped += 1;
            return Ok(());
        }
        if self.db.get_source_by_url(&feed.xml_url).await?.is_some() {
            report.existing += 1;
            return Ok(());
        }

        let new = NewSource {
            feed_url: feed.xml_url.clone(),
            title: feed.title.clone(),
            link: feed.html_url.clone(),
            group_id,
        };
        match self.add_source(new).await {
            Ok(_) => report.sources_created += 1,
            Err(TreeError::InvalidArgument(reason)) | Err(TreeError::Duplicate(reason)) => {
                tracing::warn!(url = %feed.xml_url, reason = %reason, "Skipping OPML feed");
                report.skipped += 1;
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// Current subscriptions in export shape, read from the store.
    pub async fn subscription_tree(&self) -> Result<SubscriptionTree, TreeError> {
        let mut tree = SubscriptionTree::default();

        for group in self.db.get_groups().await? {
            let feeds = self
                .db
                .get_sources_by_group(Some(group.id))
                .await?
                .into_iter()
                .map(opml_feed)
                .collect();
            tree.groups.push(OpmlGroup {
                name: group.name,
                feeds,
            });
        }
        tree.feeds = self
            .db
            .get_sources_by_group(None)
            .await?
            .into_iter()
            .map(opml_feed)
            .collect();

        Ok(tree)
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn emit(&self, changes: Vec<CountChange>) {
        for change in changes {
            // No receivers is fine
            let _ = self.events.send(change);
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, FeedTree> {
        self.tree.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, FeedTree> {
        self.tree.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn build_tree(db: &Database) -> Result<FeedTree, TreeError> {
    let groups = db.get_groups().await?;
    let mut sources = Vec::new();
    for group in &groups {
        sources.extend(
            db.get_sources_with_unread_counts(Some(group.id))
                .await?
                .into_iter()
                .map(|s| (s.source, s.unread_count)),
        );
    }
    sources.extend(
        db.get_sources_with_unread_counts(None)
            .await?
            .into_iter()
            .map(|s| (s.source, s.unread_count)),
    );
    let counts = db.get_pseudo_counts().await?;

    Ok(FeedTree::build(&groups, &sources, counts))
}

fn opml_feed(source: Source) -> OpmlFeed {
    OpmlFeed {
        title: source.title,
        xml_url: source.feed_url,
        html_url: source.link,
    }
}

fn check_id(kind: &'static str, id: i64) -> Result<(), TreeError> {
    if id <= 0 {
        return Err(TreeError::InvalidArgument(format!("{} id must be positive, got {}", kind, id)));
    }
    Ok(())
}

fn not_found_as_tree_error(e: DatabaseError) -> TreeError {
    match e {
        DatabaseError::NotFound { kind, id } => TreeError::NotFound { kind, id },
        other => TreeError::Storage(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::NormalizedEntry;
    use crate::tree::PseudoRoot;

    async fn test_aggregator() -> Aggregator {
        let db = Database::open(":memory:").await.unwrap();
        Aggregator::load(db).await.unwrap()
    }

    fn new_source(url: &str, group_id: Option<i64>) -> NewSource {
        NewSource {
            feed_url: url.to_string(),
            title: String::new(),
            link: None,
            group_id,
        }
    }

    async fn seed_entries(agg: &Aggregator, source_id: i64, n: usize) {
        for i in 0..n {
            agg.database()
                .persist_entry(
                    source_id,
                    &NormalizedEntry {
                        item_id: format!("{}-{}", source_id, i),
                        title: format!("Entry {}", i),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
        }
        agg.refresh_source_count(source_id).await.unwrap();
        agg.refresh_pseudo_counts().await.unwrap();
    }

    #[tokio::test]
    async fn test_add_group_validates_name() {
        let agg = test_aggregator().await;

        let tech = agg.add_group("  Tech ").await.unwrap();
        assert_eq!(tech.name, "Tech");
        assert_eq!(tech.rank, 1);
        assert_eq!(agg.add_group("News").await.unwrap().rank, 2);

        assert!(matches!(agg.add_group("   ").await, Err(TreeError::InvalidArgument(_))));
        assert!(matches!(agg.add_group("TECH").await, Err(TreeError::Duplicate(_))));

        let top: Vec<String> = agg.top_level().into_iter().map(|n| n.title).collect();
        assert_eq!(top[3..], ["Tech".to_string(), "News".to_string()]);
    }

    #[tokio::test]
    async fn test_add_source_validates_and_rejects_duplicates() {
        let agg = test_aggregator().await;
        let group = agg.add_group("Tech").await.unwrap();

        let source = agg
            .add_source(new_source("https://blog.example.com/rss", Some(group.id)))
            .await
            .unwrap();
        assert_eq!(source.title, "blog.example.com");
        assert_eq!(source.group_id, Some(group.id));
        assert_eq!(agg.children(group.id).len(), 1);

        assert!(matches!(
            agg.add_source(new_source("HTTPS://BLOG.EXAMPLE.COM/RSS", None)).await,
            Err(TreeError::Duplicate(_))
        ));
        assert!(matches!(
            agg.add_source(new_source("ftp://example.com/rss", None)).await,
            Err(TreeError::InvalidArgument(_))
        ));
        assert!(matches!(
            agg.add_source(new_source("https://other.example.com/rss", Some(999))).await,
            Err(TreeError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_mark_entry_updates_counts_and_events() {
        let agg = test_aggregator().await;
        let source = agg
            .add_source(new_source("https://a.example.com/rss", None))
            .await
            .unwrap();
        seed_entries(&agg, source.id, 2).await;
        assert_eq!(agg.unread(NodeKey::Source(source.id)), 2);

        let mut events = agg.subscribe();
        let entry = agg.database().get_entries_for_source(source.id, None).await.unwrap()[0].clone();

        assert!(agg.mark_entry(entry.id, EntryFlag::Read, true).await.unwrap());
        assert!(!agg.mark_entry(entry.id, EntryFlag::Read, true).await.unwrap());
        assert!(agg.mark_entry(entry.id, EntryFlag::Favorite, true).await.unwrap());

        assert_eq!(agg.unread(NodeKey::Source(source.id)), 1);
        assert_eq!(agg.unread(NodeKey::Pseudo(PseudoRoot::AllUnread)), 1);
        assert_eq!(agg.starred_count(), 1);

        let first = events.try_recv().unwrap();
        assert_eq!(first, CountChange { key: NodeKey::Source(source.id), count: 1 });

        assert!(matches!(
            agg.mark_entry(9999, EntryFlag::Read, true).await,
            Err(TreeError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_mark_source_read_is_guarded_and_zeroes_counts() {
        let agg = test_aggregator().await;
        let group = agg.add_group("Tech").await.unwrap();
        let target = agg
            .add_source(new_source("https://a.example.com/rss", Some(group.id)))
            .await
            .unwrap();
        let sibling = agg
            .add_source(new_source("https://b.example.com/rss", Some(group.id)))
            .await
            .unwrap();
        seed_entries(&agg, target.id, 3).await;
        seed_entries(&agg, sibling.id, 2).await;

        let first = agg.database().get_entries_for_source(target.id, None).await.unwrap()[0].id;
        agg.mark_entry(first, EntryFlag::Read, true).await.unwrap();

        assert_eq!(agg.mark_source_read(target.id).await.unwrap(), 2);
        assert_eq!(agg.mark_source_read(target.id).await.unwrap(), 0);

        assert_eq!(agg.unread(NodeKey::Source(target.id)), 0);
        assert_eq!(agg.unread(NodeKey::Group(group.id)), 2);
        assert_eq!(agg.unread(NodeKey::Pseudo(PseudoRoot::AllUnread)), 2);

        // Marking the last unread source drains the group and All unread
        assert_eq!(agg.mark_source_read(sibling.id).await.unwrap(), 2);
        assert_eq!(agg.unread(NodeKey::Group(group.id)), 0);
        assert_eq!(agg.unread(NodeKey::Pseudo(PseudoRoot::AllUnread)), 0);
        assert_eq!(agg.database().get_unread_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_mark_all_read_is_guarded_and_zeroes_counts() {
        let agg = test_aggregator().await;
        let group = agg.add_group("Tech").await.unwrap();
        let grouped = agg
            .add_source(new_source("https://a.example.com/rss", Some(group.id)))
            .await
            .unwrap();
        let loose = agg
            .add_source(new_source("https://b.example.com/rss", None))
            .await
            .unwrap();
        seed_entries(&agg, grouped.id, 4).await;
        seed_entries(&agg, loose.id, 1).await;

        let first = agg.database().get_entries_for_source(grouped.id, None).await.unwrap()[0].id;
        agg.mark_entry(first, EntryFlag::Read, true).await.unwrap();

        assert_eq!(agg.mark_all_read().await.unwrap(), 4);
        assert_eq!(agg.mark_all_read().await.unwrap(), 0);

        assert_eq!(agg.unread(NodeKey::Source(grouped.id)), 0);
        assert_eq!(agg.unread(NodeKey::Source(loose.id)), 0);
        assert_eq!(agg.unread(NodeKey::Group(group.id)), 0);
        assert_eq!(agg.unread(NodeKey::Pseudo(PseudoRoot::AllUnread)), 0);
        assert_eq!(agg.database().get_unread_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_delete_group_removes_sources_and_counts() {
        let agg = test_aggregator().await;
        let group = agg.add_group("Doomed").await.unwrap();
        let source = agg
            .add_source(new_source("https://a.example.com/rss", Some(group.id)))
            .await
            .unwrap();
        seed_entries(&agg, source.id, 3).await;

        assert_eq!(agg.delete_group(group.id).await.unwrap(), 3);
        assert!(agg.node(NodeKey::Group(group.id)).is_none());
        assert!(agg.sources().is_empty());
        assert_eq!(agg.unread(NodeKey::Pseudo(PseudoRoot::AllUnread)), 0);

        assert!(matches!(agg.delete_group(group.id).await, Err(TreeError::NotFound { .. })));
        assert!(matches!(agg.delete_group(0).await, Err(TreeError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_rename_and_move() {
        let agg = test_aggregator().await;
        let a = agg.add_group("A").await.unwrap();
        let b = agg.add_group("B").await.unwrap();
        let source = agg
            .add_source(new_source("https://a.example.com/rss", Some(a.id)))
            .await
            .unwrap();
        seed_entries(&agg, source.id, 2).await;

        agg.rename_group(a.id, "Alpha").await.unwrap();
        assert!(matches!(agg.rename_group(b.id, "alpha").await, Err(TreeError::Duplicate(_))));
        agg.rename_source(source.id, "Renamed").await.unwrap();
        assert_eq!(agg.node(NodeKey::Source(source.id)).unwrap().title, "Renamed");

        agg.move_source(source.id, Some(b.id)).await.unwrap();
        assert_eq!(agg.unread(NodeKey::Group(a.id)), 0);
        assert_eq!(agg.unread(NodeKey::Group(b.id)), 2);

        // Survives a reload from the store
        agg.reload().await.unwrap();
        assert_eq!(agg.node(NodeKey::Group(a.id)).unwrap().title, "Alpha");
        assert_eq!(agg.sources_in_group(b.id).len(), 1);
    }

    #[tokio::test]
    async fn test_subscription_tree_matches_store() {
        let agg = test_aggregator().await;
        let group = agg.add_group("Tech").await.unwrap();
        agg.add_source(NewSource {
            feed_url: "https://a.example.com/rss".to_string(),
            title: "A".to_string(),
            link: Some("https://a.example.com/".to_string()),
            group_id: Some(group.id),
        })
        .await
        .unwrap();
        agg.add_source(new_source("https://b.example.com/rss", None))
            .await
            .unwrap();

        let tree = agg.subscription_tree().await.unwrap();
        assert_eq!(tree.groups.len(), 1);
        assert_eq!(tree.groups[0].feeds[0].title, "A");
        assert_eq!(tree.groups[0].feeds[0].html_url.as_deref(), Some("https://a.example.com/"));
        assert_eq!(tree.feeds[0].xml_url, "https://b.example.com/rss");
    }
}
