//! Feed retrieval, parsing and refresh orchestration.
//!
//! - [`parser`] - RSS/Atom/JSON Feed normalization on top of `feed-rs`
//! - [`fetcher`] - the [`Fetcher`] trait and its `reqwest` implementation
//! - [`opml`] - subscription import/export
//! - [`sync`] - per-source and bulk refresh with pacing and cancellation

mod fetcher;
mod opml;
mod parser;
mod sync;

pub use fetcher::{FetchError, Fetcher, HttpFetcher, DEFAULT_USER_AGENT};
pub use opml::{
    export_opml, export_to_file, parse_opml, read_opml_file, OpmlDocument, OpmlError, OpmlFeed,
    OpmlGroup, SubscriptionTree,
};
pub use parser::parse_feed;
pub use sync::{CancelFlag, SourceOutcome, SyncError, SyncOptions, SyncReport, Synchronizer};
