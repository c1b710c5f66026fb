use anyhow::Result;
use feed_rs::model::{Entry, Feed, Link};
use feed_rs::parser;
use sha2::{Digest, Sha256};

use crate::storage::{NormalizedEntry, NormalizedFeed};
use crate::util::strip_control_chars;

/// Parse RSS/Atom/JSON Feed bytes into the wire-independent feed shape.
pub fn parse_feed(bytes: &[u8]) -> Result<NormalizedFeed> {
    let feed = parser::parse(bytes)?;
    Ok(normalize(feed))
}

fn normalize(feed: Feed) -> NormalizedFeed {
    let title = feed
        .title
        .map(|t| clean_line(&t.content))
        .unwrap_or_default();
    let description = feed.description.map(|d| d.content).unwrap_or_default();
    let link = site_link(&feed.links).unwrap_or_default();
    let image_url = feed
        .logo
        .map(|i| i.uri)
        .or_else(|| feed.icon.map(|i| i.uri))
        .filter(|uri| !uri.trim().is_empty());
    let last_updated = feed.updated.or(feed.published).map(|dt| dt.timestamp());
    let language = feed.language.filter(|l| !l.trim().is_empty());

    let entries = feed.entries.into_iter().map(normalize_entry).collect();

    NormalizedFeed {
        title,
        description,
        image_url,
        link,
        language,
        last_updated,
        entries,
    }
}

fn normalize_entry(entry: Entry) -> NormalizedEntry {
    let link = entry.links.first().map(|l| l.href.trim().to_string());
    let published = entry.published.or(entry.updated).map(|dt| dt.timestamp());
    let title = entry
        .title
        .map(|t| clean_line(&t.content))
        .unwrap_or_default();
    let description = entry.summary.map(|s| s.content).unwrap_or_default();
    let content = entry
        .content
        .and_then(|c| c.body)
        .filter(|body| !body.trim().is_empty())
        .unwrap_or_else(|| description.clone());
    let categories = entry
        .categories
        .into_iter()
        .map(|c| c.label.unwrap_or(c.term))
        .collect();

    let existing_id = if entry.id.trim().is_empty() {
        None
    } else {
        Some(entry.id.as_str())
    };
    let item_id = generate_item_id(existing_id, link.as_deref(), &title, published);

    NormalizedEntry {
        item_id,
        title,
        description,
        content,
        link,
        published,
        categories,
    }
}

/// First link that is not the feed's own `rel="self"` URL
fn site_link(links: &[Link]) -> Option<String> {
    links
        .iter()
        .find(|l| l.rel.as_deref() != Some("self"))
        .map(|l| l.href.trim().to_string())
        .filter(|href| !href.is_empty())
}

fn clean_line(s: &str) -> String {
    strip_control_chars(s).trim().to_string()
}

fn generate_item_id(
    existing: Option<&str>,
    url: Option<&str>,
    title: &str,
    published: Option<i64>,
) -> String {
    if let Some(id) = existing {
        return id.trim().to_string();
    }

    let input = format!(
        "{}|{}|{}",
        url.unwrap_or(""),
        title,
        published.map(|p| p.to_string()).unwrap_or_default()
    );
    let hash = Sha256::digest(input.as_bytes());
    format!("{:x}", hash)
}
