//! Deterministic layer and build-context archives.
//!
//! Entries are emitted in path order with zero timestamps, root ownership and normalised
//! modes, so equal inputs always produce byte-identical archives and equal digests.

use anyhow::{Context, Result};
use flate2::{Compression, GzBuilder};
use pybox_core::source::{EntryKind, SourceTree, EXECUTABLE_MODE, FILE_MODE};
use pybox_core::Digest;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

const DIR_MODE: u32 = 0o755;
const SOURCE_DATE_EPOCH: u64 = 0;

/// A finished archive and its sha256 digest.
#[derive(Debug, Clone)]
pub struct LayerArchive {
    pub bytes: Vec<u8>,
    pub digest: Digest,
    pub entries: usize,
}

impl LayerArchive {
    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }
}

#[derive(Debug, Clone)]
enum Content {
    Dir,
    File { path: PathBuf, mode: u32 },
    Bytes { data: Vec<u8>, mode: u32 },
    Symlink { target: String },
}

/// Collects entries by archive path, then writes them sorted.
#[derive(Debug, Default)]
pub struct LayerBuilder {
    entries: BTreeMap<String, Content>,
}

impl LayerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add every missing parent directory of `path`.
    fn add_parents(&mut self, path: &str) {
        let mut prefix = String::new();
        let parts: Vec<&str> = path.split('/').collect();
        for part in &parts[..parts.len().saturating_sub(1)] {
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(part);
            self.entries.entry(prefix.clone()).or_insert(Content::Dir);
        }
    }

    pub fn add_dir(&mut self, path: &str) -> &mut Self {
        let path = normalize(path);
        if !path.is_empty() {
            self.add_parents(&path);
            self.entries.insert(path, Content::Dir);
        }
        self
    }

    pub fn add_file(&mut self, path: &str, source: &Path, mode: u32) -> &mut Self {
        let path = normalize(path);
        self.add_parents(&path);
        self.entries.insert(
            path,
            Content::File {
                path: source.to_path_buf(),
                mode,
            },
        );
        self
    }

    pub fn add_bytes(&mut self, path: &str, data: Vec<u8>, mode: u32) -> &mut Self {
        let path = normalize(path);
        self.add_parents(&path);
        self.entries.insert(path, Content::Bytes { data, mode });
        self
    }

    pub fn add_symlink(&mut self, path: &str, target: &str) -> &mut Self {
        let path = normalize(path);
        self.add_parents(&path);
        self.entries.insert(
            path,
            Content::Symlink {
                target: target.to_string(),
            },
        );
        self
    }

    /// Add a scanned source tree below `dest`.
    pub fn add_tree(&mut self, dest: &str, tree: &SourceTree) -> &mut Self {
        let dest = normalize(dest);
        self.add_dir(&dest);
        for entry in &tree.entries {
            let path = if dest.is_empty() {
                entry.path.clone()
            } else {
                format!("{}/{}", dest, entry.path)
            };
            match &entry.kind {
                EntryKind::File { .. } => {
                    self.add_file(&path, &entry.absolute, entry.mode);
                }
                EntryKind::Symlink { target } => {
                    self.add_symlink(&path, target);
                }
            }
        }
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Uncompressed tar.
    pub fn finish(&self) -> Result<LayerArchive> {
        let mut builder = tar::Builder::new(Vec::new());

        for (path, content) in &self.entries {
            let mut header = tar::Header::new_gnu();
            header.set_uid(0);
            header.set_gid(0);
            header.set_mtime(SOURCE_DATE_EPOCH);

            match content {
                Content::Dir => {
                    header.set_entry_type(tar::EntryType::Directory);
                    header.set_mode(DIR_MODE);
                    header.set_size(0);
                    builder
                        .append_data(&mut header, format!("{}/", path), std::io::empty())
                        .with_context(|| format!("Failed to add directory {}", path))?;
                }
                Content::File { path: source, mode } => {
                    let data = std::fs::read(source)
                        .with_context(|| format!("Failed to read {}", source.display()))?;
                    header.set_entry_type(tar::EntryType::Regular);
                    header.set_mode(normalize_mode(*mode));
                    header.set_size(data.len() as u64);
                    builder
                        .append_data(&mut header, path, data.as_slice())
                        .with_context(|| format!("Failed to add {}", path))?;
                }
                Content::Bytes { data, mode } => {
                    header.set_entry_type(tar::EntryType::Regular);
                    header.set_mode(normalize_mode(*mode));
                    header.set_size(data.len() as u64);
                    builder
                        .append_data(&mut header, path, data.as_slice())
                        .with_context(|| format!("Failed to add {}", path))?;
                }
                Content::Symlink { target } => {
                    header.set_entry_type(tar::EntryType::Symlink);
                    header.set_mode(0o777);
                    header.set_size(0);
                    builder
                        .append_link(&mut header, path, target)
                        .with_context(|| format!("Failed to add symlink {}", path))?;
                }
            }
        }

        let bytes = builder.into_inner().context("Failed to finish tar archive")?;
        Ok(LayerArchive {
            digest: Digest::sha256(&bytes),
            bytes,
            entries: self.entries.len(),
        })
    }

    /// Gzip-compressed tar with a zeroed gzip header, as sent to the Docker build API.
    pub fn finish_gzip(&self) -> Result<LayerArchive> {
        let tar = self.finish()?;
        let mut encoder = GzBuilder::new()
            .mtime(0)
            .write(Vec::with_capacity(tar.bytes.len() / 2), Compression::default());
        encoder
            .write_all(&tar.bytes)
            .context("gzip encoding failed")?;
        let bytes = encoder.finish().context("gzip finalize failed")?;
        Ok(LayerArchive {
            digest: Digest::sha256(&bytes),
            bytes,
            entries: tar.entries,
        })
    }
}

/// Layer with the manifest alone at its absolute in-image path.
pub fn manifest_layer(manifest: &Path, dest: &str) -> Result<LayerArchive> {
    let mut builder = LayerBuilder::new();
    builder.add_file(dest, manifest, FILE_MODE);
    builder.finish()
}

/// Layer with the source tree alone below its absolute in-image directory.
pub fn source_layer(tree: &SourceTree, dest: &str) -> Result<LayerArchive> {
    let mut builder = LayerBuilder::new();
    builder.add_tree(dest, tree);
    builder.finish()
}

fn normalize(path: &str) -> String {
    path.trim_start_matches('/')
        .trim_start_matches("./")
        .trim_end_matches('/')
        .to_string()
}

fn normalize_mode(mode: u32) -> u32 {
    if mode & 0o111 != 0 {
        EXECUTABLE_MODE
    } else {
        FILE_MODE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Read;

    fn entry_names(bytes: &[u8]) -> Vec<(String, u64, u32)> {
        let mut archive = tar::Archive::new(bytes);
        archive
            .entries()
            .unwrap()
            .map(|e| {
                let e = e.unwrap();
                let header = e.header();
                (
                    e.path().unwrap().to_string_lossy().into_owned(),
                    header.mtime().unwrap(),
                    header.mode().unwrap(),
                )
            })
            .collect()
    }

    fn write_tree(root: &Path) {
        fs::create_dir_all(root.join("checks")).unwrap();
        fs::write(root.join("main.py"), "print('up')\n").unwrap();
        fs::write(root.join("checks/http.py"), "import ssl\n").unwrap();
    }

    #[test]
    fn test_source_layer_layout() {
        let dir = tempfile::tempdir().unwrap();
        write_tree(dir.path());
        let tree = SourceTree::scan(dir.path(), &[]).unwrap();

        let layer = source_layer(&tree, "/app/app").unwrap();
        let entries = entry_names(&layer.bytes);
        let paths: Vec<_> = entries.iter().map(|(p, _, _)| p.as_str()).collect();
        assert_eq!(
            paths,
            vec![
                "app/",
                "app/app/",
                "app/app/checks/",
                "app/app/checks/http.py",
                "app/app/main.py"
            ]
        );
        assert!(entries.iter().all(|(_, mtime, _)| *mtime == 0));
        assert_eq!(entries[0].2, DIR_MODE);
        assert_eq!(entries[4].2, FILE_MODE);
    }

    #[test]
    fn test_identical_inputs_give_identical_bytes() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        write_tree(a.path());
        write_tree(b.path());

        let la = source_layer(&SourceTree::scan(a.path(), &[]).unwrap(), "/app/app").unwrap();
        let lb = source_layer(&SourceTree::scan(b.path(), &[]).unwrap(), "/app/app").unwrap();
        assert_eq!(la.bytes, lb.bytes);
        assert_eq!(la.digest, lb.digest);
    }

    #[test]
    fn test_content_change_changes_digest() {
        let dir = tempfile::tempdir().unwrap();
        write_tree(dir.path());
        let before = source_layer(&SourceTree::scan(dir.path(), &[]).unwrap(), "/app/app").unwrap();

        fs::write(dir.path().join("main.py"), "print('down')\n").unwrap();
        let after = source_layer(&SourceTree::scan(dir.path(), &[]).unwrap(), "/app/app").unwrap();
        assert_ne!(before.digest, after.digest);
    }

    #[test]
    fn test_manifest_layer() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = dir.path().join("requirements.txt");
        fs::write(&manifest, "requests==2.31.0\n").unwrap();

        let layer = manifest_layer(&manifest, "/app/requirements.txt").unwrap();
        assert_eq!(layer.entries, 2);

        let mut archive = tar::Archive::new(layer.bytes.as_slice());
        let mut found = String::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            if entry.path().unwrap().ends_with("requirements.txt") {
                entry.read_to_string(&mut found).unwrap();
                assert_eq!(entry.header().uid().unwrap(), 0);
            }
        }
        assert_eq!(found, "requests==2.31.0\n");
    }

    #[test]
    fn test_gzip_is_deterministic() {
        let build = || {
            let mut builder = LayerBuilder::new();
            builder.add_bytes("Dockerfile", b"FROM scratch\n".to_vec(), 0o600);
            builder.finish_gzip().unwrap()
        };
        let (a, b) = (build(), build());
        assert_eq!(a.bytes, b.bytes);

        let mut decoder = flate2::read::GzDecoder::new(a.bytes.as_slice());
        let mut tar_bytes = Vec::new();
        decoder.read_to_end(&mut tar_bytes).unwrap();
        let entries = entry_names(&tar_bytes);
        assert_eq!(entries, vec![("Dockerfile".to_string(), 0, FILE_MODE)]);
    }

    #[test]
    fn test_long_paths() {
        let mut builder = LayerBuilder::new();
        let long = format!("app/{}/module.py", "deeply_nested_package".repeat(8));
        builder.add_bytes(&long, b"x = 1\n".to_vec(), FILE_MODE);
        let layer = builder.finish().unwrap();
        let names: Vec<_> = entry_names(&layer.bytes)
            .into_iter()
            .map(|(p, _, _)| p)
            .collect();
        assert!(names.contains(&long));
    }
}
