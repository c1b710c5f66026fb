//! Refresh orchestration: fetch, persist, then push counts into the tree.
//!
//! Bulk sweeps fan out over a bounded `buffer_unordered` stream. A source
//! that finished a sweep rests for the configured cooldown before the next
//! sweep picks it up again; explicit single-source refreshes ignore it.

use futures::stream::{self, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::fetcher::{FetchError, Fetcher};
use crate::icons::IconCache;
use crate::storage::{DatabaseError, Source};
use crate::tree::{Aggregator, TreeError};

const DEFAULT_CONCURRENCY: usize = 10;
const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("Persistence failed: {0}")]
    Persistence(#[from] DatabaseError),

    #[error(transparent)]
    Tree(#[from] TreeError),

    #[error("Refresh cancelled")]
    Cancelled,
}

/// Knobs for bulk sweeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOptions {
    /// Maximum simultaneous fetches
    pub concurrency: usize,
    /// Rest period after a source finished a bulk sweep
    pub cooldown: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            cooldown: DEFAULT_COOLDOWN,
        }
    }
}

/// Shared cancellation signal, cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Result of one successful source refresh
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    pub source_id: i64,
    pub inserted: usize,
    pub skipped: usize,
    pub metadata_updated: bool,
}

/// Per-source result of a bulk sweep
#[derive(Debug)]
pub struct SourceOutcome {
    pub source_id: i64,
    pub result: Result<SyncReport, SyncError>,
}

// ============================================================================
// Pacing
// ============================================================================

/// Cooldown table plus the set of sources currently being refreshed.
#[derive(Default)]
struct Pacer {
    cooldowns: Mutex<HashMap<i64, Instant>>,
    in_flight: Mutex<HashSet<i64>>,
}

impl Pacer {
    /// Mark every eligible source as in flight and return it.
    fn claim(&self, sources: Vec<Source>, now: Instant) -> Vec<Source> {
        let (Ok(mut cooldowns), Ok(mut in_flight)) = (self.cooldowns.lock(), self.in_flight.lock())
        else {
            return sources;
        };
        cooldowns.retain(|_, until| *until > now);

        sources
            .into_iter()
            .filter(|s| {
                if cooldowns.contains_key(&s.id) {
                    tracing::debug!(source_id = s.id, "Source cooling down, skipped");
                    return false;
                }
                if !in_flight.insert(s.id) {
                    tracing::debug!(source_id = s.id, "Source already refreshing, skipped");
                    return false;
                }
                true
            })
            .collect()
    }

    fn release(&self, source_id: i64, cooldown: Duration) {
        if let Ok(mut in_flight) = self.in_flight.lock() {
            in_flight.remove(&source_id);
        }
        if let Ok(mut cooldowns) = self.cooldowns.lock() {
            cooldowns.insert(source_id, Instant::now() + cooldown);
        }
    }
}

// ============================================================================
// Synchronizer
// ============================================================================

pub struct Synchronizer {
    aggregator: Arc<Aggregator>,
    fetcher: Arc<dyn Fetcher>,
    icons: Option<Arc<IconCache>>,
    options: SyncOptions,
    pacer: Pacer,
    /// Serializes metadata-plus-entries writes across concurrent sources
    write_lock: tokio::sync::Mutex<()>,
    progress: Option<mpsc::Sender<(usize, usize)>>,
}

impl Synchronizer {
    pub fn new(aggregator: Arc<Aggregator>, fetcher: Arc<dyn Fetcher>, options: SyncOptions) -> Self {
        Self {
            aggregator,
            fetcher,
            icons: None,
            options,
            pacer: Pacer::default(),
            write_lock: tokio::sync::Mutex::new(()),
            progress: None,
        }
    }

    /// Download favicons for sources whose metadata changed.
    pub fn with_icons(mut self, icons: Arc<IconCache>) -> Self {
        self.icons = Some(icons);
        self
    }

    /// Report `(done, total)` after each source of a bulk sweep.
    pub fn with_progress(mut self, progress: mpsc::Sender<(usize, usize)>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn options(&self) -> SyncOptions {
        self.options
    }

    /// Refresh one source now, regardless of cooldown.
    pub async fn refresh_source(
        &self,
        source: Option<&Source>,
        cancel: &CancelFlag,
    ) -> Result<SyncReport, SyncError> {
        let source = source.ok_or_else(|| SyncError::InvalidArgument("no source given".to_string()))?;
        if source.id <= 0 {
            return Err(SyncError::InvalidArgument(format!(
                "source id must be positive, got {}",
                source.id
            )));
        }
        if source.feed_url.trim().is_empty() {
            return Err(SyncError::InvalidArgument(format!(
                "source {} has no feed URL",
                source.id
            )));
        }

        self.sync_one(source, cancel).await
    }

    /// Refresh every source of one group.
    pub async fn refresh_group(&self, group_id: i64, cancel: &CancelFlag) -> Vec<SourceOutcome> {
        if group_id <= 0 {
            tracing::warn!(group_id = group_id, "Refusing to refresh invalid group id");
            return Vec::new();
        }
        match self.aggregator.database().get_sources_by_group(Some(group_id)).await {
            Ok(sources) => self.sweep(sources, cancel).await,
            Err(e) => {
                tracing::error!(group_id = group_id, error = %e, "Failed to load group sources");
                Vec::new()
            }
        }
    }

    /// Refresh every subscribed source.
    pub async fn refresh_all(&self, cancel: &CancelFlag) -> Vec<SourceOutcome> {
        match self.aggregator.database().get_sources().await {
            Ok(sources) => self.sweep(sources, cancel).await,
            Err(e) => {
                tracing::error!(error = %e, "Failed to load sources");
                Vec::new()
            }
        }
    }

    async fn sweep(&self, sources: Vec<Source>, cancel: &CancelFlag) -> Vec<SourceOutcome> {
        let sources = self.pacer.claim(sources, Instant::now());
        let total = sources.len();
        if total == 0 {
            self.report_progress(0, 0).await;
            return Vec::new();
        }

        tracing::info!(sources = total, concurrency = self.options.concurrency, "Refresh sweep started");
        let completed = AtomicUsize::new(0);

        let outcomes: Vec<SourceOutcome> = stream::iter(sources)
            .filter_map(|source| {
                // Stop scheduling once cancelled; claimed sources go back untouched
                let keep = if cancel.is_cancelled() {
                    self.pacer.release(source.id, Duration::ZERO);
                    None
                } else {
                    Some(source)
                };
                futures::future::ready(keep)
            })
            .map(|source| {
                let completed = &completed;
                async move {
                    let result = self.sync_one(&source, cancel).await;
                    let rest = match result {
                        Err(SyncError::Cancelled) => Duration::ZERO,
                        _ => self.options.cooldown,
                    };
                    self.pacer.release(source.id, rest);

                    if let Err(e) = &result {
                        tracing::warn!(
                            source_id = source.id,
                            url = %source.feed_url,
                            error = %e,
                            "Source refresh failed"
                        );
                    }

                    let done = completed.fetch_add(1, Ordering::Relaxed).saturating_add(1);
                    self.report_progress(done, total).await;

                    SourceOutcome {
                        source_id: source.id,
                        result,
                    }
                }
            })
            .buffer_unordered(self.options.concurrency.max(1))
            .collect()
            .await;

        let failed = outcomes.iter().filter(|o| o.result.is_err()).count();
        tracing::info!(
            refreshed = outcomes.len(),
            failed = failed,
            cancelled = cancel.is_cancelled(),
            "Refresh sweep finished"
        );
        outcomes
    }

    async fn sync_one(&self, source: &Source, cancel: &CancelFlag) -> Result<SyncReport, SyncError> {
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        let feed = self.fetcher.fetch_feed(&source.feed_url).await?;

        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        let persisted = {
            let _guard = self.write_lock.lock().await;
            self.aggregator
                .database()
                .persist_feed(source.id, &feed)
                .await
        };

        // A failed persist may still have committed metadata and earlier
        // entries, so the tree is brought in line with the store either way.
        let metadata_written = persisted.as_ref().map_or(true, |r| r.metadata_updated);
        let resynced = self.resync_tree(source.id, metadata_written).await;
        let persisted = match persisted {
            Ok(report) => report,
            Err(e) => {
                if let Err(tree_err) = resynced {
                    tracing::warn!(source_id = source.id, error = %tree_err, "Tree resync failed");
                }
                return Err(e.into());
            }
        };
        resynced?;

        if persisted.metadata_updated {
            if let Some(icons) = &self.icons {
                let site = Some(feed.link.trim())
                    .filter(|l| !l.is_empty())
                    .or(source.link.as_deref())
                    .unwrap_or(source.feed_url.as_str());
                if let Err(e) = icons.ensure_icon(self.fetcher.as_ref(), site).await {
                    tracing::debug!(source_id = source.id, site = %site, error = %e, "Icon not available");
                }
            }
        }

        tracing::debug!(
            source_id = source.id,
            inserted = persisted.inserted,
            skipped = persisted.skipped,
            "Source refreshed"
        );
        Ok(SyncReport {
            source_id: source.id,
            inserted: persisted.inserted,
            skipped: persisted.skipped,
            metadata_updated: persisted.metadata_updated,
        })
    }

    /// Push the stored state of one source into the tree.
    async fn resync_tree(&self, source_id: i64, metadata: bool) -> Result<(), TreeError> {
        if metadata {
            self.aggregator.refresh_source_metadata(source_id).await?;
        }
        self.aggregator.refresh_source_count(source_id).await?;
        self.aggregator.refresh_pseudo_counts().await?;
        Ok(())
    }

    async fn report_progress(&self, done: usize, total: usize) {
        if let Some(tx) = &self.progress {
            if let Err(e) = tx.send((done, total)).await {
                tracing::warn!(error = %e, done = done, total = total, "Progress receiver dropped");
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{Database, NewSource, NormalizedEntry, NormalizedFeed};
    use crate::tree::NodeKey;
    use async_trait::async_trait;

    /// Serves canned feeds by URL and counts requests.
    #[derive(Default)]
    struct CannedFetcher {
        feeds: HashMap<String, NormalizedFeed>,
        calls: AtomicUsize,
        fetched: Mutex<Vec<String>>,
        cancel_on_fetch: Option<CancelFlag>,
    }

    #[async_trait]
    impl Fetcher for CannedFetcher {
        async fn fetch_feed(&self, url: &str) -> Result<NormalizedFeed, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Ok(mut fetched) = self.fetched.lock() {
                fetched.push(url.to_string());
            }
            if let Some(flag) = &self.cancel_on_fetch {
                flag.cancel();
            }
            self.feeds.get(url).cloned().ok_or(FetchError::HttpStatus(404))
        }

        async fn fetch_bytes(&self, _url: &str) -> Result<Vec<u8>, FetchError> {
            Err(FetchError::HttpStatus(404))
        }
    }

    fn feed_with(n: usize) -> NormalizedFeed {
        NormalizedFeed {
            title: "Example".to_string(),
            link: "https://example.com/".to_string(),
            entries: (0..n)
                .map(|i| NormalizedEntry {
                    item_id: format!("item-{}", i),
                    title: format!("Item {}", i),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }

    async fn setup(fetcher: CannedFetcher, urls: &[&str]) -> (Synchronizer, Arc<CannedFetcher>, Vec<Source>) {
        let db = Database::open(":memory:").await.unwrap();
        let aggregator = Arc::new(Aggregator::load(db).await.unwrap());
        let mut sources = Vec::new();
        for url in urls {
            sources.push(
                aggregator
                    .add_source(NewSource {
                        feed_url: url.to_string(),
                        title: String::new(),
                        link: None,
                        group_id: None,
                    })
                    .await
                    .unwrap(),
            );
        }
        let fetcher = Arc::new(fetcher);
        let sync = Synchronizer::new(aggregator, fetcher.clone(), SyncOptions::default());
        (sync, fetcher, sources)
    }

    #[tokio::test]
    async fn test_invalid_arguments_fail_before_fetch() {
        let (sync, fetcher, _) = setup(CannedFetcher::default(), &[]).await;
        let cancel = CancelFlag::new();

        let bad_id = Source {
            id: 0,
            group_id: None,
            rank: 1,
            title: "x".to_string(),
            description: String::new(),
            link: None,
            feed_url: "https://example.com/rss".to_string(),
            image_url: None,
            language: None,
            last_updated: None,
        };
        let no_url = Source {
            id: 7,
            feed_url: "  ".to_string(),
            ..bad_id.clone()
        };

        for source in [None, Some(&bad_id), Some(&no_url)] {
            assert!(matches!(
                sync.refresh_source(source, &cancel).await,
                Err(SyncError::InvalidArgument(_))
            ));
        }
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_refresh_source_persists_and_counts() {
        let url = "https://example.com/rss";
        let mut fetcher = CannedFetcher::default();
        fetcher.feeds.insert(url.to_string(), feed_with(3));
        let (sync, _, sources) = setup(fetcher, &[url]).await;
        let cancel = CancelFlag::new();

        let report = sync.refresh_source(Some(&sources[0]), &cancel).await.unwrap();
        assert_eq!(report.inserted, 3);
        assert!(report.metadata_updated);
        assert_eq!(sync.aggregator.unread(NodeKey::Source(sources[0].id)), 3);
        assert_eq!(
            sync.aggregator.node(NodeKey::Source(sources[0].id)).unwrap().title,
            "Example"
        );

        let again = sync.refresh_source(Some(&sources[0]), &cancel).await.unwrap();
        assert_eq!(again.inserted, 0);
        assert_eq!(again.skipped, 3);
        assert_eq!(sync.aggregator.unread(NodeKey::Source(sources[0].id)), 3);
    }

    #[tokio::test]
    async fn test_cancel_before_fetch_and_before_persist() {
        let url = "https://example.com/rss";
        let mut fetcher = CannedFetcher::default();
        fetcher.feeds.insert(url.to_string(), feed_with(2));
        let (sync, fetcher, sources) = setup(fetcher, &[url]).await;

        let cancelled = CancelFlag::new();
        cancelled.cancel();
        assert!(matches!(
            sync.refresh_source(Some(&sources[0]), &cancelled).await,
            Err(SyncError::Cancelled)
        ));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);

        // Flag flipped while the fetch is in progress
        let mut fetcher = CannedFetcher::default();
        fetcher.feeds.insert(url.to_string(), feed_with(2));
        let flag = CancelFlag::new();
        fetcher.cancel_on_fetch = Some(flag.clone());
        let (sync, _, sources) = setup(fetcher, &[url]).await;

        assert!(matches!(
            sync.refresh_source(Some(&sources[0]), &flag).await,
            Err(SyncError::Cancelled)
        ));
        let db = sync.aggregator.database();
        assert_eq!(db.count_entries_for_source(sources[0].id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_refresh_all_isolates_failures() {
        let ok_a = "https://a.example.com/rss";
        let ok_b = "https://b.example.com/rss";
        let broken = "https://broken.example.com/rss";
        let mut fetcher = CannedFetcher::default();
        fetcher.feeds.insert(ok_a.to_string(), feed_with(2));
        fetcher.feeds.insert(ok_b.to_string(), feed_with(1));
        let (sync, _, sources) = setup(fetcher, &[ok_a, broken, ok_b]).await;

        let outcomes = sync.refresh_all(&CancelFlag::new()).await;
        assert_eq!(outcomes.len(), 3);

        let failed: Vec<i64> = outcomes
            .iter()
            .filter(|o| o.result.is_err())
            .map(|o| o.source_id)
            .collect();
        assert_eq!(failed, vec![sources[1].id]);
        assert_eq!(sync.aggregator.unread(NodeKey::Pseudo(crate::tree::PseudoRoot::AllUnread)), 3);
    }

    #[tokio::test]
    async fn test_failed_insert_still_resyncs_tree() {
        let url = "https://example.com/rss";
        let mut fetcher = CannedFetcher::default();
        fetcher.feeds.insert(url.to_string(), feed_with(3));
        let (sync, _, sources) = setup(fetcher, &[url]).await;
        let source = &sources[0];
        let db = sync.aggregator.database();

        sqlx::query(
            r#"
                CREATE TRIGGER reject_item BEFORE INSERT ON entries
                WHEN NEW.item_id = 'item-2'
                BEGIN SELECT RAISE(ABORT, 'rejected'); END
            "#,
        )
        .execute(&db.pool)
        .await
        .unwrap();

        let result = sync.refresh_source(Some(source), &CancelFlag::new()).await;
        assert!(matches!(result, Err(SyncError::Persistence(_))));

        // Metadata and the first two entries were committed before the failure
        assert_eq!(db.get_unread_count_for_source(source.id).await.unwrap(), 2);
        assert_eq!(sync.aggregator.unread(NodeKey::Source(source.id)), 2);
        assert_eq!(
            sync.aggregator.unread(NodeKey::Pseudo(crate::tree::PseudoRoot::AllUnread)),
            2
        );
        assert_eq!(
            sync.aggregator.node(NodeKey::Source(source.id)).unwrap().title,
            "Example"
        );
    }

    #[tokio::test]
    async fn test_refresh_group_only_fetches_members() {
        let member_a = "https://a.example.com/rss";
        let member_b = "https://b.example.com/rss";
        let outsider = "https://c.example.com/rss";
        let mut fetcher = CannedFetcher::default();
        for url in [member_a, member_b, outsider] {
            fetcher.feeds.insert(url.to_string(), feed_with(1));
        }
        let (sync, fetcher, sources) = setup(fetcher, &[outsider]).await;

        let group = sync.aggregator.add_group("Tech").await.unwrap();
        let mut members = Vec::new();
        for url in [member_a, member_b] {
            let source = sync
                .aggregator
                .add_source(NewSource {
                    feed_url: url.to_string(),
                    title: String::new(),
                    link: None,
                    group_id: Some(group.id),
                })
                .await
                .unwrap();
            members.push(source.id);
        }

        let cancel = CancelFlag::new();
        assert!(sync.refresh_group(0, &cancel).await.is_empty());
        assert!(sync.refresh_group(-1, &cancel).await.is_empty());
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);

        let outcomes = sync.refresh_group(group.id, &cancel).await;
        let mut refreshed: Vec<i64> = outcomes.iter().map(|o| o.source_id).collect();
        refreshed.sort_unstable();
        assert_eq!(refreshed, members);
        assert!(outcomes.iter().all(|o| o.result.is_ok()));

        let mut fetched = fetcher.fetched.lock().unwrap().clone();
        fetched.sort();
        assert_eq!(fetched, vec![member_a.to_string(), member_b.to_string()]);

        assert_eq!(sync.aggregator.unread(NodeKey::Group(group.id)), 2);
        assert_eq!(sync.aggregator.unread(NodeKey::Source(sources[0].id)), 0);
    }

    #[tokio::test]
    async fn test_second_sweep_skips_cooling_sources() {
        let url = "https://example.com/rss";
        let mut fetcher = CannedFetcher::default();
        fetcher.feeds.insert(url.to_string(), feed_with(1));
        let (sync, fetcher, sources) = setup(fetcher, &[url]).await;
        let cancel = CancelFlag::new();

        assert_eq!(sync.refresh_all(&cancel).await.len(), 1);
        assert!(sync.refresh_all(&cancel).await.is_empty());
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);

        // Explicit refresh ignores the cooldown
        sync.refresh_source(Some(&sources[0]), &cancel).await.unwrap();
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancelled_sweep_schedules_nothing() {
        let url = "https://example.com/rss";
        let mut fetcher = CannedFetcher::default();
        fetcher.feeds.insert(url.to_string(), feed_with(1));
        let (sync, fetcher, _) = setup(fetcher, &[url]).await;

        let cancel = CancelFlag::new();
        cancel.cancel();
        assert!(sync.refresh_all(&cancel).await.is_empty());
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);

        // Not put in cooldown by the cancelled sweep
        assert_eq!(sync.refresh_all(&CancelFlag::new()).await.len(), 1);
    }

    #[tokio::test]
    async fn test_progress_reported_per_source() {
        let urls = ["https://a.example.com/rss", "https://b.example.com/rss"];
        let mut fetcher = CannedFetcher::default();
        for url in urls {
            fetcher.feeds.insert(url.to_string(), feed_with(1));
        }
        let (sync, _, _) = setup(fetcher, &urls).await;
        let (tx, mut rx) = mpsc::channel(8);
        let sync = sync.with_progress(tx);

        sync.refresh_all(&CancelFlag::new()).await;

        let mut seen = Vec::new();
        while let Ok(update) = rx.try_recv() {
            seen.push(update);
        }
        assert_eq!(seen, vec![(1, 2), (2, 2)]);
    }

    fn source(id: i64) -> Source {
        Source {
            id,
            group_id: None,
            rank: id,
            title: format!("s{}", id),
            description: String::new(),
            link: None,
            feed_url: format!("https://{}.example.com/rss", id),
            image_url: None,
            language: None,
            last_updated: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_pacer_cooldown_expires() {
        let pacer = Pacer::default();
        let cooldown = Duration::from_secs(60);

        assert_eq!(pacer.claim(vec![source(1), source(2)], Instant::now()).len(), 2);
        // Both in flight
        assert!(pacer.claim(vec![source(1), source(2)], Instant::now()).is_empty());

        pacer.release(1, cooldown);
        pacer.release(2, Duration::ZERO);
        let ids: Vec<i64> = pacer
            .claim(vec![source(1), source(2)], Instant::now())
            .iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids, vec![2]);
        pacer.release(2, cooldown);

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(pacer.claim(vec![source(1)], Instant::now()).is_empty());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(pacer.claim(vec![source(1), source(2)], Instant::now()).len(), 2);
    }
}
