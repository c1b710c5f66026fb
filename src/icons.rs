//! Per-host icon resolution backed by an on-disk directory.
//!
//! Icons are files named `<host>.<ext>` (or just `<host>`). A bounded LRU
//! map fronts the directory; misses probe the disk once and fall back to a
//! built-in default without caching the miss.

use lru::LruCache;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;

use crate::feed::{FetchError, Fetcher};
use crate::tree::{Node, NodeKey, PseudoRoot};
use crate::util::{host_of, parse_http_url, site_authority, write_atomic};

const ICON_EXTENSIONS: [&str; 6] = ["ico", "png", "gif", "jpg", "jpeg", "svg"];
const DEFAULT_CAPACITY: usize = 512;

/// Reserved map keys for the pseudo-roots; never valid host names.
const KEY_ALL_UNREAD: &str = "#all-unread";
const KEY_STARRED: &str = "#starred";
const KEY_DEFERRED: &str = "#deferred";

#[derive(Debug, Error)]
pub enum IconError {
    #[error("Cannot derive a host from '{0}'")]
    InvalidUrl(String),
    #[error("Icon download failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("Icon download returned no data")]
    Empty,
    #[error("Icon storage failed: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinIcon {
    AllUnread,
    Starred,
    Deferred,
    Folder,
    Default,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Icon {
    Builtin(BuiltinIcon),
    File {
        host: String,
        path: PathBuf,
        bytes: Arc<[u8]>,
    },
}

impl Icon {
    pub fn is_file(&self) -> bool {
        matches!(self, Icon::File { .. })
    }
}

pub struct IconCache {
    dir: PathBuf,
    map: Mutex<LruCache<String, Icon>>,
}

impl IconCache {
    /// Open (creating if needed) the icon directory and seed the map from it.
    pub fn load(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        Self::with_capacity(dir, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(dir: impl Into<PathBuf>, capacity: usize) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        let mut map = LruCache::new(capacity);

        for entry in std::fs::read_dir(&dir)? {
            let path = match entry {
                Ok(entry) => entry.path(),
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping unreadable icon directory entry");
                    continue;
                }
            };
            let Some(host) = host_from_file_name(&path) else {
                continue;
            };
            match load_icon(&host, &path) {
                Ok(icon) => {
                    map.put(host, icon);
                }
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to load icon"),
            }
        }

        tracing::debug!(dir = %dir.display(), icons = map.len(), "Icon cache seeded");
        Ok(Self {
            dir,
            map: Mutex::new(map),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Number of cached entries
    pub fn len(&self) -> usize {
        self.map.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Icon for a host name or reserved pseudo-root key.
    pub fn resolve(&self, host: &str) -> Icon {
        match host {
            KEY_ALL_UNREAD => return Icon::Builtin(BuiltinIcon::AllUnread),
            KEY_STARRED => return Icon::Builtin(BuiltinIcon::Starred),
            KEY_DEFERRED => return Icon::Builtin(BuiltinIcon::Deferred),
            _ => {}
        }

        let host = host.trim().to_ascii_lowercase();
        if host.is_empty() || host.starts_with('.') || host.contains(['/', '\\']) {
            return Icon::Builtin(BuiltinIcon::Default);
        }

        if let Some(icon) = self.cached(&host) {
            return icon;
        }

        match self.probe(&host) {
            Some(icon) => self.upsert(host, icon),
            None => Icon::Builtin(BuiltinIcon::Default),
        }
    }

    /// Icon for a tree node: pseudo-roots get their built-ins, groups a
    /// folder, sources the icon of their site (or feed) host.
    pub fn resolve_node(&self, node: &Node) -> Icon {
        match node.key {
            NodeKey::Pseudo(root) => self.resolve(reserved_key(root)),
            NodeKey::Group(_) => Icon::Builtin(BuiltinIcon::Folder),
            NodeKey::Source(_) => node
                .link
                .as_deref()
                .and_then(host_of)
                .or_else(|| node.url.as_deref().and_then(host_of))
                .map(|host| self.resolve(&host))
                .unwrap_or(Icon::Builtin(BuiltinIcon::Default)),
        }
    }

    /// Make sure the host of `site_url` has an icon on disk, downloading
    /// `/favicon.ico` from its authority when it does not.
    pub async fn ensure_icon(&self, fetcher: &dyn Fetcher, site_url: &str) -> Result<Icon, IconError> {
        let url = parse_http_url(site_url).map_err(|_| IconError::InvalidUrl(site_url.to_string()))?;
        let host = host_of(url.as_str()).ok_or_else(|| IconError::InvalidUrl(site_url.to_string()))?;

        if let Some(icon) = self.cached(&host) {
            return Ok(icon);
        }
        let found = {
            let dir = self.dir.clone();
            let host = host.clone();
            tokio::task::spawn_blocking(move || probe_dir(&dir, &host))
                .await
                .map_err(std::io::Error::other)?
        };
        if let Some(icon) = found {
            return Ok(self.upsert(host, icon));
        }

        let authority =
            site_authority(&url).ok_or_else(|| IconError::InvalidUrl(site_url.to_string()))?;
        let favicon_url = format!("{}/favicon.ico", authority);
        let bytes = fetcher.fetch_bytes(&favicon_url).await?;
        if bytes.is_empty() {
            return Err(IconError::Empty);
        }

        let path = self.dir.join(format!("{}.ico", host));
        let bytes: Arc<[u8]> = Arc::from(bytes);
        {
            let path = path.clone();
            let bytes = Arc::clone(&bytes);
            tokio::task::spawn_blocking(move || write_atomic(&path, &bytes))
                .await
                .map_err(std::io::Error::other)??;
        }

        tracing::debug!(host = %host, path = %path.display(), "Icon stored");
        Ok(self.upsert(host.clone(), Icon::File { host, path, bytes }))
    }

    fn cached(&self, host: &str) -> Option<Icon> {
        self.map.lock().ok()?.get(host).cloned()
    }

    /// Insert unless another caller got there first; returns the stored icon
    fn upsert(&self, host: String, icon: Icon) -> Icon {
        let Ok(mut map) = self.map.lock() else {
            return icon;
        };
        if let Some(existing) = map.get(&host) {
            if existing.is_file() {
                return existing.clone();
            }
        }
        map.put(host, icon.clone());
        icon
    }

    fn probe(&self, host: &str) -> Option<Icon> {
        probe_dir(&self.dir, host)
    }
}

/// Blocking lookup of `<host>` and `<host>.<ext>` under `dir`
fn probe_dir(dir: &Path, host: &str) -> Option<Icon> {
    std::iter::once(dir.join(host))
        .chain(ICON_EXTENSIONS.iter().map(|ext| dir.join(format!("{host}.{ext}"))))
        .filter(|path| path.is_file())
        .find_map(|path| match load_icon(host, &path) {
            Ok(icon) => Some(icon),
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "Icon probe failed");
                None
            }
        })
}

pub fn reserved_key(root: PseudoRoot) -> &'static str {
    match root {
        PseudoRoot::AllUnread => KEY_ALL_UNREAD,
        PseudoRoot::Starred => KEY_STARRED,
        PseudoRoot::Deferred => KEY_DEFERRED,
    }
}

fn load_icon(host: &str, path: &Path) -> std::io::Result<Icon> {
    let bytes = std::fs::read(path)?;
    Ok(Icon::File {
        host: host.to_string(),
        path: path.to_path_buf(),
        bytes: Arc::from(bytes),
    })
}

/// `example.com.png` -> `example.com`; other extensions are not icons.
fn host_from_file_name(path: &Path) -> Option<String> {
    if !path.is_file() {
        return None;
    }
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    if !ICON_EXTENSIONS.contains(&ext.as_str()) {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    if stem.is_empty() || stem.starts_with('.') {
        return None;
    }
    Some(stem.to_ascii_lowercase())
}
