use serde::Serialize;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Database-specific errors with user-friendly messages
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another process holds the database lock
    #[error("Another instance of rillet appears to be running. Please close it and try again.")]
    InstanceLocked,

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// A row referenced by id does not exist
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: i64 },

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl DatabaseError {
    /// Map lock-related sqlx errors to [`DatabaseError::InstanceLocked`]
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        let error_string = err.to_string().to_lowercase();

        // SQLITE_BUSY (5), SQLITE_LOCKED (6), SQLITE_CANTOPEN (14)
        if error_string.contains("database is locked")
            || error_string.contains("database table is locked")
            || error_string.contains("sqlite_busy")
            || error_string.contains("sqlite_locked")
            || error_string.contains("unable to open database file")
        {
            return DatabaseError::InstanceLocked;
        }

        DatabaseError::Other(err)
    }
}

// ============================================================================
// Normalized Feed Shape
// ============================================================================

/// A feed as produced by the fetcher, independent of the wire format.
#[derive(Debug, Clone, Default)]
pub struct NormalizedFeed {
    pub title: String,
    pub description: String,
    pub image_url: Option<String>,
    /// Site link (not the feed URL)
    pub link: String,
    pub language: Option<String>,
    pub last_updated: Option<i64>,
    pub entries: Vec<NormalizedEntry>,
}

impl NormalizedFeed {
    /// Transient empty responses must not overwrite good metadata.
    pub fn has_usable_metadata(&self) -> bool {
        !self.title.trim().is_empty() && !self.link.trim().is_empty()
    }
}

/// One entry of a [`NormalizedFeed`].
#[derive(Debug, Clone, Default)]
pub struct NormalizedEntry {
    /// External identity, stable across refetches (the dedup key)
    pub item_id: String,
    pub title: String,
    pub description: String,
    /// Full content; the parser substitutes the description when the feed has none
    pub content: String,
    pub link: Option<String>,
    pub published: Option<i64>,
    /// Raw category strings as they appear in the feed
    pub categories: Vec<String>,
}

/// Outcome of [`Database::persist_feed`](super::Database::persist_feed).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistReport {
    pub metadata_updated: bool,
    pub inserted: usize,
    pub skipped: usize,
}

// ============================================================================
// Data Structures
// ============================================================================

/// User-defined folder of sources
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct Group {
    pub id: i64,
    pub name: String,
    pub rank: i64,
}

/// A subscribed feed ("channel")
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct Source {
    pub id: i64,
    pub group_id: Option<i64>,
    pub rank: i64,
    pub title: String,
    pub description: String,
    pub link: Option<String>,
    pub feed_url: String,
    pub image_url: Option<String>,
    pub language: Option<String>,
    pub last_updated: Option<i64>,
}

/// Source together with its unread entry count
#[derive(Debug, Clone)]
pub struct SourceWithCount {
    pub source: Source,
    pub unread_count: i64,
}

/// Fields needed to subscribe to a new source
#[derive(Debug, Clone)]
pub struct NewSource {
    pub feed_url: String,
    pub title: String,
    pub link: Option<String>,
    pub group_id: Option<i64>,
}

/// One ingested feed item
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Entry {
    pub id: i64,
    pub source_id: i64,
    pub item_id: String,
    pub title: String,
    pub link: Option<String>,
    pub description: String,
    pub content: String,
    pub published: Option<i64>,
    pub read: bool,
    pub deleted: bool,
    pub favorite: bool,
    pub deferred: bool,
    pub fetched_at: i64,
}

/// Normalized category label
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Category {
    pub id: i64,
    pub name: String,
}

/// The four independent per-entry flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryFlag {
    Read,
    Deleted,
    Favorite,
    Deferred,
}

impl EntryFlag {
    /// Column name; only ever interpolated from this closed set.
    pub(crate) fn column(self) -> &'static str {
        match self {
            EntryFlag::Read => "read",
            EntryFlag::Deleted => "deleted",
            EntryFlag::Favorite => "favorite",
            EntryFlag::Deferred => "deferred",
        }
    }
}

/// Store-computed counts backing the pseudo-roots
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PseudoCounts {
    pub unread: i64,
    pub starred: i64,
    pub deferred: i64,
}
