//! Integration tests for the source lifecycle: subscribe, group, rename,
//! move, delete.
//!
//! Each test creates its own in-memory SQLite database for isolation.
//! These tests exercise the storage layer end-to-end, verifying that
//! operations compose correctly across groups, sources, entries and
//! categories.

use rillet::storage::{Database, EntryFlag, NewSource, NormalizedEntry, NormalizedFeed};
use std::time::Duration;

async fn test_db() -> Database {
    Database::open(":memory:").await.unwrap()
}

fn new_source(url: &str, title: &str, group_id: Option<i64>) -> NewSource {
    NewSource {
        feed_url: url.to_string(),
        title: title.to_string(),
        link: None,
        group_id,
    }
}

fn test_entry(item_id: &str, categories: &[&str]) -> NormalizedEntry {
    NormalizedEntry {
        item_id: item_id.to_string(),
        title: format!("Title {}", item_id),
        link: Some(format!("https://example.com/{}", item_id)),
        published: Some(1_700_000_000),
        categories: categories.iter().map(|c| c.to_string()).collect(),
        ..Default::default()
    }
}

// ============================================================================
// Subscribe
// ============================================================================

#[tokio::test]
async fn test_subscribe_source_appears_in_list() {
    let db = test_db().await;

    let source = db
        .create_source(&new_source("https://example.com/feed.xml", "Example", None))
        .await
        .unwrap();
    assert!(source.id > 0);
    assert_eq!(source.rank, 1);

    let listed = db.get_sources_with_unread_counts(None).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].source.feed_url, "https://example.com/feed.xml");
    assert_eq!(listed[0].unread_count, 0);
}

#[tokio::test]
async fn test_ranks_increase_per_insert() {
    let db = test_db().await;

    let a = db.create_group("A").await.unwrap();
    let b = db.create_group("B").await.unwrap();
    assert_eq!((a.rank, b.rank), (1, 2));

    let s1 = db
        .create_source(&new_source("https://one.example.com/rss", "One", Some(a.id)))
        .await
        .unwrap();
    let s2 = db
        .create_source(&new_source("https://two.example.com/rss", "Two", None))
        .await
        .unwrap();
    assert!(s2.rank > s1.rank);
}

// ============================================================================
// Persist and categorize
// ============================================================================

#[tokio::test]
async fn test_persist_feed_updates_metadata_and_entries() {
    let db = test_db().await;
    let source = db
        .create_source(&new_source("https://example.com/rss", "Placeholder", None))
        .await
        .unwrap();

    let feed = NormalizedFeed {
        title: "Real Title".to_string(),
        link: "https://example.com/".to_string(),
        language: Some("en".to_string()),
        entries: vec![
            test_entry("one", &["Rust", "News"]),
            test_entry("two", &[" rust"]),
        ],
        ..Default::default()
    };

    let report = db.persist_feed(source.id, &feed).await.unwrap();
    assert!(report.metadata_updated);
    assert_eq!(report.inserted, 2);

    let stored = db.get_source_by_id(source.id).await.unwrap().unwrap();
    assert_eq!(stored.title, "Real Title");
    assert_eq!(stored.language.as_deref(), Some("en"));

    let names: Vec<String> = db
        .get_categories()
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.name)
        .collect();
    assert_eq!(names, vec!["news".to_string(), "rust".to_string()]);

    // Persisting the same feed again inserts nothing
    let again = db.persist_feed(source.id, &feed).await.unwrap();
    assert_eq!(again.inserted, 0);
    assert_eq!(again.skipped, 2);
    assert_eq!(db.count_entries_for_source(source.id).await.unwrap(), 2);
}

#[tokio::test]
async fn test_empty_feed_keeps_metadata() {
    let db = test_db().await;
    let source = db
        .create_source(&new_source("https://example.com/rss", "Known Good", None))
        .await
        .unwrap();

    let report = db
        .persist_feed(source.id, &NormalizedFeed::default())
        .await
        .unwrap();
    assert!(!report.metadata_updated);

    let stored = db.get_source_by_id(source.id).await.unwrap().unwrap();
    assert_eq!(stored.title, "Known Good");
}

// ============================================================================
// Rename and move
// ============================================================================

#[tokio::test]
async fn test_rename_and_move_source() {
    let db = test_db().await;
    let group = db.create_group("Reading").await.unwrap();
    let source = db
        .create_source(&new_source("https://example.com/rss", "Old", None))
        .await
        .unwrap();

    db.update_source_title(source.id, "New").await.unwrap();
    db.move_source_to_group(source.id, Some(group.id)).await.unwrap();

    let in_group = db.get_sources_by_group(Some(group.id)).await.unwrap();
    assert_eq!(in_group.len(), 1);
    assert_eq!(in_group[0].title, "New");
    assert!(db.get_sources_by_group(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_rename_missing_group_is_not_found() {
    let db = test_db().await;
    assert!(db.update_group_name(42, "Nope").await.is_err());
}

// ============================================================================
// Delete
// ============================================================================

#[tokio::test]
async fn test_delete_group_cascades_to_entries() {
    let db = test_db().await;
    let group = db.create_group("Doomed").await.unwrap();
    let source = db
        .create_source(&new_source("https://example.com/rss", "S", Some(group.id)))
        .await
        .unwrap();
    let survivor = db
        .create_source(&new_source("https://keep.example.com/rss", "K", None))
        .await
        .unwrap();

    db.persist_entry(source.id, &test_entry("a", &["tag"]))
        .await
        .unwrap();
    db.persist_entry(survivor.id, &test_entry("a", &["tag"]))
        .await
        .unwrap();

    assert_eq!(db.delete_group(group.id).await.unwrap(), 1);
    assert!(db.get_source_by_id(source.id).await.unwrap().is_none());
    assert_eq!(db.get_unread_count().await.unwrap(), 1);
    assert_eq!(db.count_entries_for_source(survivor.id).await.unwrap(), 1);
}

#[tokio::test]
async fn test_delete_source_removes_entries() {
    let db = test_db().await;
    let source = db
        .create_source(&new_source("https://example.com/rss", "S", None))
        .await
        .unwrap();
    db.persist_entry(source.id, &test_entry("a", &[])).await.unwrap();
    db.persist_entry(source.id, &test_entry("b", &[])).await.unwrap();

    assert_eq!(db.delete_source(source.id).await.unwrap(), 2);
    assert_eq!(db.get_unread_count().await.unwrap(), 0);
}

// ============================================================================
// Retention
// ============================================================================

#[tokio::test]
async fn test_purge_only_removes_old_deleted_entries() {
    let db = test_db().await;
    let source = db
        .create_source(&new_source("https://example.com/rss", "S", None))
        .await
        .unwrap();

    let now = chrono::Utc::now().timestamp();
    let old = NormalizedEntry {
        published: Some(now - 90 * 86_400),
        ..test_entry("old", &["x"])
    };
    let recent = NormalizedEntry {
        published: Some(now - 86_400),
        ..test_entry("recent", &[])
    };
    let kept = test_entry("kept", &[]);
    for entry in [&old, &recent, &kept] {
        db.persist_entry(source.id, entry).await.unwrap();
    }

    for entry in db.get_entries_for_source(source.id, None).await.unwrap() {
        if entry.item_id != "kept" {
            db.set_entry_flag(entry.id, EntryFlag::Deleted, true)
                .await
                .unwrap();
        }
    }

    let removed = db
        .purge_deleted_entries(Duration::from_secs(30 * 86_400))
        .await
        .unwrap();
    assert_eq!(removed, 1);
    assert_eq!(db.count_entries_for_source(source.id).await.unwrap(), 2);
}
