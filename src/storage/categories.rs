use std::collections::BTreeSet;

use sqlx::{Sqlite, Transaction};

use super::schema::Database;
use super::types::{Category, DatabaseError};
use crate::util::normalize_category;

/// Normalize raw feed categories into a sorted, duplicate-free set of labels.
///
/// Labels that are empty after trimming are dropped.
pub(crate) fn normalize_categories(raw: &[String]) -> Vec<String> {
    raw.iter()
        .filter_map(|name| normalize_category(name))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Look up or create the category `name` and link it to `entry_id`.
///
/// Runs inside the caller's transaction so a failure rolls back the entry too.
pub(crate) async fn link_category(
    tx: &mut Transaction<'_, Sqlite>,
    entry_id: i64,
    name: &str,
) -> Result<(), DatabaseError> {
    sqlx::query("INSERT INTO categories (name) VALUES (?) ON CONFLICT(name) DO NOTHING")
        .bind(name)
        .execute(&mut **tx)
        .await?;

    let (category_id,): (i64,) = sqlx::query_as("SELECT id FROM categories WHERE name = ?")
        .bind(name)
        .fetch_one(&mut **tx)
        .await?;

    sqlx::query("INSERT OR IGNORE INTO entry_categories (entry_id, category_id) VALUES (?, ?)")
        .bind(entry_id)
        .bind(category_id)
        .execute(&mut **tx)
        .await?;

    Ok(())
}

impl Database {
    // ========================================================================
    // Category Operations
    // ========================================================================

    /// All known categories, alphabetically
    pub async fn get_categories(&self) -> Result<Vec<Category>, DatabaseError> {
        let categories = sqlx::query_as("SELECT id, name FROM categories ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        Ok(categories)
    }

    /// Category labels linked to one entry, alphabetically
    pub async fn get_entry_categories(&self, entry_id: i64) -> Result<Vec<String>, DatabaseError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
                SELECT c.name FROM categories c
                JOIN entry_categories ec ON ec.category_id = c.id
                WHERE ec.entry_id = ?
                ORDER BY c.name
            "#,
        )
        .bind(entry_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(name,)| name).collect())
    }
}
