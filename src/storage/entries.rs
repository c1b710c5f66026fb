use std::time::Duration;

use super::categories::{link_category, normalize_categories};
use super::schema::Database;
use super::types::{
    DatabaseError, Entry, EntryFlag, NormalizedEntry, NormalizedFeed, PersistReport, PseudoCounts,
};

/// Maximum number of entries to return from any single query (OOM protection)
const MAX_ENTRIES: i64 = 2000;

const ENTRY_COLUMNS: &str = "id, source_id, item_id, title, link, description, content, published, \
     read, deleted, favorite, deferred, fetched_at";

impl Database {
    // ========================================================================
    // Dedup & Persist
    // ========================================================================

    /// Persist a freshly fetched feed for one source.
    ///
    /// Metadata is written first (only when the feed has a title and a link),
    /// then each entry in its own transaction via [`persist_entry`](Self::persist_entry).
    /// The first failing entry aborts the call; entries committed before it
    /// stay committed.
    pub async fn persist_feed(
        &self,
        source_id: i64,
        feed: &NormalizedFeed,
    ) -> Result<PersistReport, DatabaseError> {
        let mut report = PersistReport {
            metadata_updated: self.update_source_metadata(source_id, feed).await?,
            ..Default::default()
        };

        for entry in &feed.entries {
            if self.persist_entry(source_id, entry).await? {
                report.inserted += 1;
            } else {
                report.skipped += 1;
            }
        }

        tracing::debug!(
            source_id = source_id,
            inserted = report.inserted,
            skipped = report.skipped,
            "Feed persisted"
        );
        Ok(report)
    }

    /// Insert one entry with its categories, exactly once per `(source, item_id)`.
    ///
    /// Returns `Ok(false)` when the item is already known. The existence check,
    /// the insert, category lookup-or-create and the join rows share a single
    /// transaction; any failure rolls all of it back.
    pub async fn persist_entry(
        &self,
        source_id: i64,
        entry: &NormalizedEntry,
    ) -> Result<bool, DatabaseError> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        let existing: Option<(i64,)> =
            sqlx::query_as("SELECT id FROM entries WHERE source_id = ? AND item_id = ?")
                .bind(source_id)
                .bind(&entry.item_id)
                .fetch_optional(&mut *tx)
                .await?;
        if existing.is_some() {
            return Ok(false);
        }

        let (entry_id,): (i64,) = sqlx::query_as(
            r#"
                INSERT INTO entries (source_id, item_id, title, link, description, content, published, fetched_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                RETURNING id
            "#,
        )
        .bind(source_id)
        .bind(&entry.item_id)
        .bind(&entry.title)
        .bind(&entry.link)
        .bind(&entry.description)
        .bind(&entry.content)
        .bind(entry.published)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        for name in normalize_categories(&entry.categories) {
            link_category(&mut tx, entry_id, &name).await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    // ========================================================================
    // Entry Queries
    // ========================================================================

    /// Non-deleted entries of a source, newest first
    pub async fn get_entries_for_source(
        &self,
        source_id: i64,
        limit: Option<i64>,
    ) -> Result<Vec<Entry>, DatabaseError> {
        let limit = limit.unwrap_or(500).min(MAX_ENTRIES);
        let sql = format!(
            r#"
            SELECT {ENTRY_COLUMNS}
            FROM entries
            WHERE source_id = ? AND deleted = 0
            ORDER BY published DESC, fetched_at DESC, id DESC
            LIMIT ?
        "#
        );
        let entries = sqlx::query_as(&sql)
            .bind(source_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(entries)
    }

    pub async fn get_entry(&self, id: i64) -> Result<Option<Entry>, DatabaseError> {
        let sql = format!("SELECT {ENTRY_COLUMNS} FROM entries WHERE id = ?");
        let entry = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(entry)
    }

    /// Total stored entries of a source, soft-deleted ones included
    pub async fn count_entries_for_source(&self, source_id: i64) -> Result<i64, DatabaseError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM entries WHERE source_id = ?")
            .bind(source_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    // ========================================================================
    // Entry Flags
    // ========================================================================

    /// Set one flag on one entry. Returns whether the row actually changed.
    ///
    /// Uses `WHERE flag <> target` so redundant toggles never write.
    pub async fn set_entry_flag(
        &self,
        entry_id: i64,
        flag: EntryFlag,
        value: bool,
    ) -> Result<bool, DatabaseError> {
        let column = flag.column();
        let sql = format!("UPDATE entries SET {column} = ? WHERE id = ? AND {column} <> ?");
        let result = sqlx::query(&sql)
            .bind(value)
            .bind(entry_id)
            .bind(value)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_entry_read(&self, entry_id: i64, value: bool) -> Result<bool, DatabaseError> {
        self.set_entry_flag(entry_id, EntryFlag::Read, value).await
    }

    pub async fn set_entry_favorite(&self, entry_id: i64, value: bool) -> Result<bool, DatabaseError> {
        self.set_entry_flag(entry_id, EntryFlag::Favorite, value).await
    }

    pub async fn set_entry_deferred(&self, entry_id: i64, value: bool) -> Result<bool, DatabaseError> {
        self.set_entry_flag(entry_id, EntryFlag::Deferred, value).await
    }

    pub async fn set_entry_deleted(&self, entry_id: i64, value: bool) -> Result<bool, DatabaseError> {
        self.set_entry_flag(entry_id, EntryFlag::Deleted, value).await
    }

    /// Set a flag on every entry of a source; returns rows changed
    pub async fn set_source_flag(
        &self,
        source_id: i64,
        flag: EntryFlag,
        value: bool,
    ) -> Result<u64, DatabaseError> {
        let column = flag.column();
        let sql = format!("UPDATE entries SET {column} = ? WHERE source_id = ? AND {column} <> ?");
        let result = sqlx::query(&sql)
            .bind(value)
            .bind(source_id)
            .bind(value)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Set a flag on every entry of every source in a group; returns rows changed
    pub async fn set_group_flag(
        &self,
        group_id: i64,
        flag: EntryFlag,
        value: bool,
    ) -> Result<u64, DatabaseError> {
        let column = flag.column();
        let sql = format!(
            "UPDATE entries SET {column} = ? \
             WHERE source_id IN (SELECT id FROM sources WHERE group_id = ?) AND {column} <> ?"
        );
        let result = sqlx::query(&sql)
            .bind(value)
            .bind(group_id)
            .bind(value)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Set a flag on every entry; returns rows changed
    pub async fn set_all_flag(&self, flag: EntryFlag, value: bool) -> Result<u64, DatabaseError> {
        let column = flag.column();
        let sql = format!("UPDATE entries SET {column} = ? WHERE {column} <> ?");
        let result = sqlx::query(&sql)
            .bind(value)
            .bind(value)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    // ========================================================================
    // Counts
    // ========================================================================

    pub async fn get_unread_count_for_source(&self, source_id: i64) -> Result<i64, DatabaseError> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM entries WHERE source_id = ? AND read = 0 AND deleted = 0",
        )
        .bind(source_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    pub async fn get_unread_count_for_group(&self, group_id: i64) -> Result<i64, DatabaseError> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
                SELECT COUNT(*) FROM entries e
                JOIN sources s ON s.id = e.source_id
                WHERE s.group_id = ? AND e.read = 0 AND e.deleted = 0
            "#,
        )
        .bind(group_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    pub async fn get_unread_count(&self) -> Result<i64, DatabaseError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM entries WHERE read = 0 AND deleted = 0")
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    pub async fn get_starred_count(&self) -> Result<i64, DatabaseError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM entries WHERE favorite = 1 AND deleted = 0")
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    pub async fn get_deferred_count(&self) -> Result<i64, DatabaseError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM entries WHERE deferred = 1 AND deleted = 0")
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    /// All three pseudo-root counts in one round-trip
    pub async fn get_pseudo_counts(&self) -> Result<PseudoCounts, DatabaseError> {
        let (unread, starred, deferred): (i64, i64, i64) = sqlx::query_as(
            r#"
                SELECT
                    COUNT(CASE WHEN read = 0 THEN 1 END),
                    COUNT(CASE WHEN favorite = 1 THEN 1 END),
                    COUNT(CASE WHEN deferred = 1 THEN 1 END)
                FROM entries
                WHERE deleted = 0
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(PseudoCounts {
            unread,
            starred,
            deferred,
        })
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Physically remove soft-deleted entries past the retention window.
    ///
    /// Entries without a publish date qualify as soon as they are soft-deleted.
    /// Join rows go first, then entries, in one transaction. Returns the number
    /// of entries removed.
    pub async fn purge_deleted_entries(&self, retention: Duration) -> Result<u64, DatabaseError> {
        let retention_secs = i64::try_from(retention.as_secs()).unwrap_or(i64::MAX);
        let cutoff = chrono::Utc::now().timestamp().saturating_sub(retention_secs);
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
                DELETE FROM entry_categories WHERE entry_id IN (
                    SELECT id FROM entries
                    WHERE deleted = 1 AND (published IS NULL OR published < ?)
                )
            "#,
        )
        .bind(cutoff)
        .execute(&mut *tx)
        .await?;

        let result = sqlx::query(
            "DELETE FROM entries WHERE deleted = 1 AND (published IS NULL OR published < ?)",
        )
        .bind(cutoff)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        let purged = result.rows_affected();
        if purged > 0 {
            tracing::info!(purged = purged, cutoff = cutoff, "Purged soft-deleted entries");
        }
        Ok(purged)
    }
}
