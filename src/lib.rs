//! Feed ingestion core.
//!
//! Fetches RSS/Atom sources, stores each entry exactly once, and keeps a
//! live tree of unread/starred/deferred counts across user groups.

pub mod config;
pub mod feed;
pub mod icons;
pub mod storage;
pub mod tree;
pub mod util;
