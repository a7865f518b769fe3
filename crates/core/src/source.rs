//! Application source tree scanning.
//!
//! The scan produces the exact, ordered file list that ends up in the source layer plus a
//! content digest over it. Timestamps and ownership are deliberately not part of either, so
//! touching files or checking them out elsewhere does not invalidate the cache.

use crate::digest::Digest;
use crate::error::BuildError;
use ignore::overrides::OverrideBuilder;
use ignore::WalkBuilder;
use serde::Serialize;
use sha2::{Digest as _, Sha256};
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// Ignore file honoured inside the source directory (gitignore syntax).
pub const IGNORE_FILE: &str = ".dockerignore";

/// Always excluded: interpreter caches and VCS metadata never belong in the image.
pub const DEFAULT_EXCLUDES: &[&str] = &["__pycache__/", "*.pyc", "*.pyo", ".git/"];

pub const FILE_MODE: u32 = 0o644;
pub const EXECUTABLE_MODE: u32 = 0o755;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum EntryKind {
    File { size: u64 },
    Symlink { target: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceEntry {
    /// `/`-separated path relative to the tree root
    pub path: String,
    pub mode: u32,
    #[serde(flatten)]
    pub kind: EntryKind,
    #[serde(skip)]
    pub absolute: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceTree {
    pub root: PathBuf,
    pub entries: Vec<SourceEntry>,
    pub digest: Digest,
}

impl SourceTree {
    /// Walk `root`, applying the default excludes, `extra_excludes` and any `.dockerignore`.
    ///
    /// A missing root or any unreadable entry is `SourceUnreadable`; a tree with nothing left
    /// after filtering is `SourceEmpty`.
    pub fn scan(root: &Path, extra_excludes: &[String]) -> Result<Self, BuildError> {
        let unreadable = |message: String| BuildError::SourceUnreadable {
            path: root.to_path_buf(),
            message,
        };

        let metadata = std::fs::metadata(root).map_err(|e| unreadable(e.to_string()))?;
        if !metadata.is_dir() {
            return Err(unreadable("not a directory".to_string()));
        }

        let mut override_builder = OverrideBuilder::new(root);
        for pattern in DEFAULT_EXCLUDES
            .iter()
            .copied()
            .chain(extra_excludes.iter().map(String::as_str))
        {
            override_builder
                .add(&format!("!{}", pattern))
                .map_err(|e| unreadable(format!("invalid exclude pattern '{}': {}", pattern, e)))?;
        }
        let overrides = override_builder
            .build()
            .map_err(|e| unreadable(e.to_string()))?;

        let mut entries = Vec::new();
        for result in WalkBuilder::new(root)
            .standard_filters(false)
            .hidden(false)
            .follow_links(false)
            .add_custom_ignore_filename(IGNORE_FILE)
            .overrides(overrides)
            .build()
        {
            let entry = result.map_err(|e| unreadable(e.to_string()))?;
            let path = entry.path();
            let file_type = match entry.file_type() {
                Some(ft) => ft,
                None => continue,
            };
            if file_type.is_dir() {
                continue;
            }

            let rel = path
                .strip_prefix(root)
                .map_err(|e| unreadable(e.to_string()))?;
            if rel.as_os_str().is_empty() || rel == Path::new(IGNORE_FILE) {
                continue;
            }
            let rel = to_slash_path(rel).ok_or_else(|| {
                unreadable(format!("{} is not valid UTF-8", rel.display()))
            })?;

            let source_entry = if file_type.is_symlink() {
                let target = std::fs::read_link(path)
                    .map_err(|e| unreadable(format!("{}: {}", rel, e)))?;
                SourceEntry {
                    path: rel,
                    mode: 0o777,
                    kind: EntryKind::Symlink {
                        target: target.to_string_lossy().into_owned(),
                    },
                    absolute: path.to_path_buf(),
                }
            } else {
                let metadata = entry
                    .metadata()
                    .map_err(|e| unreadable(format!("{}: {}", rel, e)))?;
                SourceEntry {
                    path: rel,
                    mode: normalized_mode(&metadata),
                    kind: EntryKind::File {
                        size: metadata.len(),
                    },
                    absolute: path.to_path_buf(),
                }
            };
            trace!(path = %source_entry.path, "Added source entry");
            entries.push(source_entry);
        }

        if entries.is_empty() {
            return Err(BuildError::SourceEmpty {
                path: root.to_path_buf(),
            });
        }

        entries.sort_by(|a, b| a.path.cmp(&b.path));
        let digest = content_digest(&entries).map_err(|e| unreadable(e.to_string()))?;

        debug!(
            root = %root.display(),
            files = entries.len(),
            digest = %digest,
            "Scanned source tree"
        );

        Ok(Self {
            root: root.to_path_buf(),
            entries,
            digest,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_size(&self) -> u64 {
        self.entries
            .iter()
            .map(|e| match e.kind {
                EntryKind::File { size } => size,
                EntryKind::Symlink { .. } => 0,
            })
            .sum()
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.path.as_str())
    }
}

fn to_slash_path(rel: &Path) -> Option<String> {
    let parts: Option<Vec<&str>> = rel.components().map(|c| c.as_os_str().to_str()).collect();
    parts.map(|p| p.join("/"))
}

#[cfg(unix)]
fn normalized_mode(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    if metadata.permissions().mode() & 0o111 != 0 {
        EXECUTABLE_MODE
    } else {
        FILE_MODE
    }
}

#[cfg(not(unix))]
fn normalized_mode(_metadata: &std::fs::Metadata) -> u32 {
    FILE_MODE
}

/// Digest over `(path, mode, kind, content)` of every entry, in path order.
fn content_digest(entries: &[SourceEntry]) -> std::io::Result<Digest> {
    let mut hasher = Sha256::new();
    for entry in entries {
        hasher.update(entry.path.as_bytes());
        hasher.update([0u8]);
        hasher.update(entry.mode.to_le_bytes());
        match &entry.kind {
            EntryKind::File { .. } => {
                let content = std::fs::read(&entry.absolute)?;
                hasher.update(b"f");
                hasher.update((content.len() as u64).to_le_bytes());
                hasher.update(&content);
            }
            EntryKind::Symlink { target } => {
                hasher.update(b"l");
                hasher.update(target.as_bytes());
                hasher.update([0u8]);
            }
        }
    }
    Ok(Digest::from_hasher(hasher))
}
