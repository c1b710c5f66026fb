mod categories;
mod entries;
mod groups;
mod schema;
mod sources;
mod types;

pub use schema::Database;
pub use types::{
    Category, DatabaseError, Entry, EntryFlag, Group, NewSource, NormalizedEntry, NormalizedFeed,
    PersistReport, PseudoCounts, Source, SourceWithCount,
};
