use anyhow::{Context, Result};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use std::io::Cursor;
use std::path::Path;
use thiserror::Error;

use crate::util::{site_authority, validate_url, write_atomic};

/// Maximum allowed nesting depth for OPML outline elements.
const MAX_OPML_DEPTH: usize = 50;

const EXPORT_TITLE: &str = "rillet subscriptions";

/// Errors that can occur during OPML parsing.
#[derive(Debug, Error)]
pub enum OpmlError {
    #[error("OPML nesting depth exceeds maximum of {0} levels")]
    MaxDepthExceeded(usize),

    #[error("XML parse error: {0}")]
    XmlParse(String),

    #[error("Failed to read OPML file: {0}")]
    Io(#[from] std::io::Error),
}

/// One feed subscription outline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpmlFeed {
    /// From the `title` attribute, falling back to `text`
    pub title: String,
    pub xml_url: String,
    pub html_url: Option<String>,
}

/// A top-level folder outline and the feeds nested anywhere beneath it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpmlGroup {
    pub name: String,
    pub feeds: Vec<OpmlFeed>,
}

/// Subscription hierarchy: groups of feeds plus ungrouped feeds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpmlDocument {
    pub groups: Vec<OpmlGroup>,
    /// Feeds outside any group, in document order
    pub feeds: Vec<OpmlFeed>,
    /// Feed outlines dropped while parsing (invalid URL or blank title)
    pub skipped: usize,
}

/// The shape exported from the store is the same as the one imported.
pub type SubscriptionTree = OpmlDocument;

impl OpmlDocument {
    /// Total feeds across groups and the top level
    pub fn feed_count(&self) -> usize {
        self.feeds.len() + self.groups.iter().map(|g| g.feeds.len()).sum::<usize>()
    }
}

/// Reads and parses an OPML file from disk.
pub async fn read_opml_file(path: &Path) -> Result<OpmlDocument> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read OPML file: {}", path.display()))?;
    Ok(parse_opml(&content)?)
}

/// Parses OPML content, keeping the group hierarchy.
///
/// Top-level outlines without `xmlUrl` become groups; every feed outline
/// nested anywhere beneath one belongs to it. Feed outlines at the top level
/// are ungrouped. Feeds failing URL validation or lacking a title are skipped.
///
/// quick-xml (0.37) never expands `<!ENTITY>` declarations: only the five
/// XML builtins resolve, custom entities surface as an unescape error.
pub fn parse_opml(content: &str) -> Result<OpmlDocument, OpmlError> {
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);

    let mut doc = OpmlDocument::default();
    let mut buf = Vec::new();
    let mut depth: usize = 0;
    // Index into doc.groups of the enclosing top-level group, if any
    let mut current_group: Option<usize> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.name().as_ref() == b"outline" => {
                depth += 1;
                if depth > MAX_OPML_DEPTH {
                    return Err(OpmlError::MaxDepthExceeded(MAX_OPML_DEPTH));
                }
                let outline = read_outline(&e, &reader)?;
                if depth == 1 {
                    current_group = None;
                }
                handle_outline(&mut doc, &mut current_group, outline, depth == 1);
            }
            Ok(Event::Empty(e)) if e.name().as_ref() == b"outline" => {
                let outline = read_outline(&e, &reader)?;
                let mut group = current_group;
                handle_outline(&mut doc, &mut group, outline, depth == 0);
            }
            Ok(Event::End(e)) if e.name().as_ref() == b"outline" => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    current_group = None;
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(OpmlError::XmlParse(e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    Ok(doc)
}

/// Raw attributes of one `<outline>`
#[derive(Default)]
struct Outline {
    title: Option<String>,
    xml_url: Option<String>,
    html_url: Option<String>,
}

fn read_outline(e: &BytesStart<'_>, reader: &Reader<&[u8]>) -> Result<Outline, OpmlError> {
    let mut outline = Outline::default();
    let mut text = None;
    let decoder = reader.decoder();

    for attr_result in e.attributes() {
        let attr = match attr_result {
            Ok(attr) => attr,
            Err(e) => {
                tracing::warn!(error = %e, "Skipping malformed OPML attribute");
                continue;
            }
        };
        let value = || {
            attr.decode_and_unescape_value(decoder)
                .map(|v| v.trim().to_string())
                .map_err(|e| OpmlError::XmlParse(e.to_string()))
        };
        match attr.key.as_ref() {
            b"xmlUrl" => outline.xml_url = Some(value()?),
            b"htmlUrl" => outline.html_url = Some(value()?),
            b"title" => outline.title = Some(value()?),
            b"text" => text = Some(value()?),
            _ => {}
        }
    }

    outline.title = outline
        .title
        .filter(|t| !t.is_empty())
        .or(text)
        .filter(|t| !t.is_empty());
    Ok(outline)
}

fn handle_outline(
    doc: &mut OpmlDocument,
    current_group: &mut Option<usize>,
    outline: Outline,
    top_level: bool,
) {
    let Some(xml_url) = outline.xml_url else {
        // Folder outline: only top-level folders become groups
        if top_level {
            if let Some(name) = outline.title {
                let existing = doc
                    .groups
                    .iter()
                    .position(|g| g.name.eq_ignore_ascii_case(&name));
                *current_group = Some(existing.unwrap_or_else(|| {
                    doc.groups.push(OpmlGroup {
                        name,
                        feeds: Vec::new(),
                    });
                    doc.groups.len() - 1
                }));
            }
        }
        return;
    };

    if let Err(e) = validate_url(&xml_url) {
        tracing::warn!(url = %xml_url, error = %e, "Skipping invalid feed URL");
        doc.skipped += 1;
        return;
    }
    let Some(title) = outline.title else {
        tracing::warn!(url = %xml_url, "Skipping feed outline without title");
        doc.skipped += 1;
        return;
    };
    let html_url = outline.html_url.filter(|url| match validate_url(url) {
        Ok(_) => true,
        Err(e) => {
            tracing::warn!(url = %url, error = %e, "Ignoring invalid htmlUrl in OPML");
            false
        }
    });

    let feed = OpmlFeed {
        title,
        xml_url,
        html_url,
    };
    match current_group.and_then(|i| doc.groups.get_mut(i)) {
        Some(group) if !top_level => group.feeds.push(feed),
        _ => doc.feeds.push(feed),
    }
}

/// Exports a subscription tree as an OPML 2.0 document.
///
/// Groups become folder outlines holding their feeds; ungrouped feeds follow
/// at the top level. Feeds without a site link get the feed URL's
/// `scheme://authority` as `htmlUrl`.
pub fn export_opml(tree: &SubscriptionTree) -> Result<String> {
    let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);

    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .context("Failed to write XML declaration")?;

    let mut opml = BytesStart::new("opml");
    opml.push_attribute(("version", "2.0"));
    writer
        .write_event(Event::Start(opml))
        .context("Failed to write opml element")?;

    writer.write_event(Event::Start(BytesStart::new("head")))?;
    writer.write_event(Event::Start(BytesStart::new("title")))?;
    writer.write_event(Event::Text(BytesText::new(EXPORT_TITLE)))?;
    writer.write_event(Event::End(BytesEnd::new("title")))?;
    writer
        .write_event(Event::End(BytesEnd::new("head")))
        .context("Failed to write head")?;

    writer
        .write_event(Event::Start(BytesStart::new("body")))
        .context("Failed to write body element")?;

    for group in &tree.groups {
        let mut outline = BytesStart::new("outline");
        outline.push_attribute(("text", group.name.as_str()));
        outline.push_attribute(("title", group.name.as_str()));

        if group.feeds.is_empty() {
            writer
                .write_event(Event::Empty(outline))
                .context("Failed to write group outline")?;
            continue;
        }

        writer
            .write_event(Event::Start(outline))
            .context("Failed to write group outline")?;
        for feed in &group.feeds {
            write_feed_outline(&mut writer, feed)?;
        }
        writer
            .write_event(Event::End(BytesEnd::new("outline")))
            .context("Failed to close group outline")?;
    }

    for feed in &tree.feeds {
        write_feed_outline(&mut writer, feed)?;
    }

    writer
        .write_event(Event::End(BytesEnd::new("body")))
        .context("Failed to write body end")?;
    writer
        .write_event(Event::End(BytesEnd::new("opml")))
        .context("Failed to write opml end")?;

    let result = writer.into_inner().into_inner();
    String::from_utf8(result).context("Generated OPML contains invalid UTF-8")
}

fn write_feed_outline(writer: &mut Writer<Cursor<Vec<u8>>>, feed: &OpmlFeed) -> Result<()> {
    let html_url = feed
        .html_url
        .clone()
        .filter(|url| !url.trim().is_empty())
        .or_else(|| {
            url::Url::parse(&feed.xml_url)
                .ok()
                .and_then(|url| site_authority(&url))
        })
        .unwrap_or_default();

    let mut outline = BytesStart::new("outline");
    outline.push_attribute(("type", "rss"));
    outline.push_attribute(("text", feed.title.as_str()));
    outline.push_attribute(("title", feed.title.as_str()));
    outline.push_attribute(("xmlUrl", feed.xml_url.as_str()));
    outline.push_attribute(("htmlUrl", html_url.as_str()));
    writer
        .write_event(Event::Empty(outline))
        .with_context(|| format!("Failed to write outline for {}", feed.xml_url))?;
    Ok(())
}

/// Exports a subscription tree to an OPML file atomically.
pub fn export_to_file(tree: &SubscriptionTree, path: &Path) -> Result<()> {
    let content = export_opml(tree)?;
    write_atomic(path, content.as_bytes())
        .with_context(|| format!("Failed to write OPML to '{}'", path.display()))
}
