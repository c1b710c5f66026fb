use super::schema::Database;
use super::types::{DatabaseError, Group};

impl Database {
    // ========================================================================
    // Group Operations
    // ========================================================================

    /// Create a group with the next free rank, returning it.
    ///
    /// Name uniqueness is case-insensitive (`COLLATE NOCASE`); callers check
    /// with [`get_group_by_name`](Self::get_group_by_name) first to report a
    /// friendly duplicate error.
    pub async fn create_group(&self, name: &str) -> Result<Group, DatabaseError> {
        let mut tx = self.pool.begin().await?;

        let (rank,): (i64,) = sqlx::query_as("SELECT COALESCE(MAX(rank), 0) + 1 FROM groups")
            .fetch_one(&mut *tx)
            .await?;

        let group: Group =
            sqlx::query_as("INSERT INTO groups (name, rank) VALUES (?, ?) RETURNING id, name, rank")
                .bind(name)
                .bind(rank)
                .fetch_one(&mut *tx)
                .await?;

        tx.commit().await?;
        Ok(group)
    }

    /// All groups in display order
    pub async fn get_groups(&self) -> Result<Vec<Group>, DatabaseError> {
        let groups = sqlx::query_as("SELECT id, name, rank FROM groups ORDER BY rank, id")
            .fetch_all(&self.pool)
            .await?;
        Ok(groups)
    }

    pub async fn get_group_by_id(&self, id: i64) -> Result<Option<Group>, DatabaseError> {
        let group = sqlx::query_as("SELECT id, name, rank FROM groups WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(group)
    }

    /// Case-insensitive lookup by name
    pub async fn get_group_by_name(&self, name: &str) -> Result<Option<Group>, DatabaseError> {
        let group = sqlx::query_as(
            "SELECT id, name, rank FROM groups WHERE name = ? COLLATE NOCASE",
        )
        .bind(name.trim())
        .fetch_optional(&self.pool)
        .await?;
        Ok(group)
    }

    /// Rename a group. Returns `NotFound` when no row matched.
    pub async fn update_group_name(&self, id: i64, name: &str) -> Result<(), DatabaseError> {
        let result = sqlx::query("UPDATE groups SET name = ? WHERE id = ?")
            .bind(name)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound { kind: "group", id });
        }
        Ok(())
    }

    /// Delete a group; its sources, their entries and join rows cascade.
    ///
    /// Returns the number of entries removed with it.
    pub async fn delete_group(&self, id: i64) -> Result<u64, DatabaseError> {
        let mut tx = self.pool.begin().await?;

        let (entries,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM entries WHERE source_id IN (SELECT id FROM sources WHERE group_id = ?)",
        )
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM groups WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(entries as u64)
    }
}
