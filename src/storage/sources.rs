use sqlx::{Sqlite, Transaction};

use super::schema::Database;
use super::types::{DatabaseError, NewSource, NormalizedFeed, Source, SourceWithCount};

const SOURCE_COLUMNS: &str =
    "s.id, s.group_id, s.rank, s.title, s.description, s.link, s.feed_url, s.image_url, s.language, s.last_updated";

/// Row type for source query with unread count
#[derive(sqlx::FromRow)]
struct SourceCountRow {
    #[sqlx(flatten)]
    source: Source,
    unread_count: i64,
}

impl Database {
    // ========================================================================
    // Source Operations
    // ========================================================================

    /// Subscribe to a feed, assigning the next free rank.
    pub async fn create_source(&self, new: &NewSource) -> Result<Source, DatabaseError> {
        let mut tx = self.pool.begin().await?;

        let (rank,): (i64,) = sqlx::query_as("SELECT COALESCE(MAX(rank), 0) + 1 FROM sources")
            .fetch_one(&mut *tx)
            .await?;

        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO sources (group_id, rank, title, link, feed_url) VALUES (?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(new.group_id)
        .bind(rank)
        .bind(&new.title)
        .bind(&new.link)
        .bind(&new.feed_url)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        self.get_source_by_id(id)
            .await?
            .ok_or(DatabaseError::NotFound { kind: "source", id })
    }

    /// All sources ordered by rank
    pub async fn get_sources(&self) -> Result<Vec<Source>, DatabaseError> {
        let sql = format!("SELECT {SOURCE_COLUMNS} FROM sources s ORDER BY s.rank, s.id");
        let sources = sqlx::query_as(&sql).fetch_all(&self.pool).await?;
        Ok(sources)
    }

    /// Sources belonging to `group_id`, or ungrouped sources when `None`
    pub async fn get_sources_by_group(
        &self,
        group_id: Option<i64>,
    ) -> Result<Vec<Source>, DatabaseError> {
        let sql = format!(
            "SELECT {SOURCE_COLUMNS} FROM sources s WHERE s.group_id IS ? ORDER BY s.rank, s.id"
        );
        let sources = sqlx::query_as(&sql)
            .bind(group_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(sources)
    }

    pub async fn get_source_by_id(&self, id: i64) -> Result<Option<Source>, DatabaseError> {
        let sql = format!("SELECT {SOURCE_COLUMNS} FROM sources s WHERE s.id = ?");
        let source = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(source)
    }

    /// Case-insensitive lookup by feed URL
    pub async fn get_source_by_url(&self, feed_url: &str) -> Result<Option<Source>, DatabaseError> {
        let sql = format!("SELECT {SOURCE_COLUMNS} FROM sources s WHERE s.feed_url = ? COLLATE NOCASE");
        let source = sqlx::query_as(&sql)
            .bind(feed_url.trim())
            .fetch_optional(&self.pool)
            .await?;
        Ok(source)
    }

    /// Sources of one group (or ungrouped) with their unread counts
    pub async fn get_sources_with_unread_counts(
        &self,
        group_id: Option<i64>,
    ) -> Result<Vec<SourceWithCount>, DatabaseError> {
        let sql = format!(
            r#"
                SELECT {SOURCE_COLUMNS},
                    COUNT(CASE WHEN e.read = 0 AND e.deleted = 0 THEN 1 END) AS unread_count
                FROM sources s
                LEFT JOIN entries e ON e.source_id = s.id
                WHERE s.group_id IS ?
                GROUP BY s.id
                ORDER BY s.rank, s.id
            "#
        );
        let rows: Vec<SourceCountRow> = sqlx::query_as(&sql)
            .bind(group_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| SourceWithCount {
                source: row.source,
                unread_count: row.unread_count,
            })
            .collect())
    }

    /// Rename a source. Returns `NotFound` when no row matched.
    pub async fn update_source_title(&self, id: i64, title: &str) -> Result<(), DatabaseError> {
        let result = sqlx::query("UPDATE sources SET title = ? WHERE id = ?")
            .bind(title)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound { kind: "source", id });
        }
        Ok(())
    }

    /// Move a source into a group, or out of any group when `group_id` is `None`.
    pub async fn move_source_to_group(
        &self,
        id: i64,
        group_id: Option<i64>,
    ) -> Result<(), DatabaseError> {
        let result = sqlx::query("UPDATE sources SET group_id = ? WHERE id = ?")
            .bind(group_id)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound { kind: "source", id });
        }
        Ok(())
    }

    /// Delete a source; entries and join rows cascade.
    ///
    /// Returns the number of entries removed. Deleting a missing id is a no-op.
    pub async fn delete_source(&self, id: i64) -> Result<u64, DatabaseError> {
        let mut tx = self.pool.begin().await?;

        let (entries,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM entries WHERE source_id = ?")
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM sources WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(entries as u64)
    }

    /// Copy fetched feed metadata onto the source row.
    ///
    /// Skipped (returns `false`) unless the feed carries both a title and a
    /// link, so an empty response never clobbers known-good metadata.
    pub async fn update_source_metadata(
        &self,
        id: i64,
        feed: &NormalizedFeed,
    ) -> Result<bool, DatabaseError> {
        if !feed.has_usable_metadata() {
            tracing::debug!(source_id = id, "Fetched feed lacks title or link, metadata kept");
            return Ok(false);
        }

        let mut tx = self.pool.begin().await?;
        let updated = write_metadata(&mut tx, id, feed).await?;
        tx.commit().await?;
        Ok(updated)
    }
}

pub(crate) async fn write_metadata(
    tx: &mut Transaction<'_, Sqlite>,
    id: i64,
    feed: &NormalizedFeed,
) -> Result<bool, DatabaseError> {
    let result = sqlx::query(
        r#"
            UPDATE sources
            SET title = ?, link = ?, description = ?, image_url = ?, language = ?, last_updated = ?
            WHERE id = ?
        "#,
    )
    .bind(feed.title.trim())
    .bind(feed.link.trim())
    .bind(&feed.description)
    .bind(&feed.image_url)
    .bind(&feed.language)
    .bind(feed.last_updated)
    .bind(id)
    .execute(&mut **tx)
    .await?;

    Ok(result.rows_affected() > 0)
}
