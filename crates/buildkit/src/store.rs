use crate::graph::Stage;
use crate::layer::LayerArchive;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use pybox_core::Digest;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const LEDGER_FILE: &str = "ledger.json";
const LOCK_FILE: &str = ".lock";

/// Content-addressed blob directory, `<cache>/blobs/sha256/<hex>`.
#[derive(Debug, Clone)]
pub struct LayerStore {
    cache_dir: PathBuf,
}

impl LayerStore {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
        }
    }

    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        digest.to_blob_path(&self.cache_dir)
    }

    pub fn contains(&self, digest: &Digest) -> bool {
        self.blob_path(digest).is_file()
    }

    /// Store a layer; returns `false` when the blob was already present.
    pub fn put(&self, layer: &LayerArchive) -> Result<bool> {
        let path = self.blob_path(&layer.digest);
        if path.is_file() {
            debug!("Blob {} already stored", layer.digest);
            return Ok(false);
        }
        write_atomic(&path, &layer.bytes)?;
        debug!(
            "Stored blob {} ({} bytes) at {}",
            layer.digest,
            layer.bytes.len(),
            path.display()
        );
        Ok(true)
    }

    pub fn read(&self, digest: &Digest) -> Result<Vec<u8>> {
        let path = self.blob_path(digest);
        fs::read(&path).with_context(|| format!("Failed to read blob {}", path.display()))
    }

    /// Layers referenced by any project ledger under the cache directory.
    pub fn referenced_layers(&self) -> Result<HashSet<Digest>> {
        let mut referenced = HashSet::new();
        if !self.cache_dir.exists() {
            return Ok(referenced);
        }
        for entry in fs::read_dir(&self.cache_dir).context("Failed to read cache directory")? {
            let path = BuildLedger::path(&entry?.path());
            if !path.is_file() {
                continue;
            }
            let content = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read ledger {}", path.display()))?;
            match serde_json::from_str::<BuildLedger>(&content) {
                Ok(ledger) => referenced.extend(ledger.referenced_layers()),
                Err(e) => warn!("Skipping corrupt ledger {}: {}", path.display(), e),
            }
        }
        Ok(referenced)
    }

    /// Delete every blob not listed in `keep`. Returns (deleted, bytes reclaimed).
    pub fn gc(&self, keep: &HashSet<Digest>) -> Result<(usize, u64)> {
        let blobs_dir = self.cache_dir.join("blobs/sha256");
        if !blobs_dir.exists() {
            return Ok((0, 0));
        }

        let mut deleted_count = 0;
        let mut deleted_size = 0;

        for entry in fs::read_dir(&blobs_dir).context("Failed to read blobs directory")? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }

            let file_name = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default();
            // In-flight temp files from a concurrent put are not blobs yet
            let Ok(digest) = Digest::parse(&format!("sha256:{}", file_name)) else {
                continue;
            };
            if keep.contains(&digest) {
                continue;
            }

            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            if let Err(e) = fs::remove_file(&path) {
                warn!("Failed to delete unreferenced blob {}: {}", path.display(), e);
            } else {
                deleted_count += 1;
                deleted_size += size;
                debug!("Deleted unreferenced blob: {}", file_name);
            }
        }

        if deleted_count > 0 {
            info!(
                "Layer GC complete: deleted {} blobs, reclaimed {} bytes",
                deleted_count, deleted_size
            );
        }
        Ok((deleted_count, deleted_size))
    }
}

/// One completed stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub cache_key: Digest,
    pub artifact: String,
    #[serde(default)]
    pub layers: Vec<Digest>,
    pub completed_at: DateTime<Utc>,
}

/// What was built for a project, stage by stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildLedger {
    pub project: String,
    #[serde(default)]
    pub stages: BTreeMap<Stage, StageRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

impl BuildLedger {
    pub fn new(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            ..Default::default()
        }
    }

    pub fn path(project_dir: &Path) -> PathBuf {
        project_dir.join(LEDGER_FILE)
    }

    /// Missing ledger means nothing built yet; an unreadable one is discarded.
    pub fn load(project_dir: &Path, project: &str) -> Result<Self> {
        let path = Self::path(project_dir);
        if !path.exists() {
            debug!("No ledger at {}, starting fresh", path.display());
            return Ok(Self::new(project));
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read ledger {}", path.display()))?;
        match serde_json::from_str::<BuildLedger>(&content) {
            Ok(ledger) if ledger.project == project => Ok(ledger),
            Ok(ledger) => {
                warn!(
                    "Ledger {} belongs to project '{}', ignoring",
                    path.display(),
                    ledger.project
                );
                Ok(Self::new(project))
            }
            Err(e) => {
                warn!("Ignoring corrupt ledger {}: {}", path.display(), e);
                Ok(Self::new(project))
            }
        }
    }

    pub fn save(&self, project_dir: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self).context("Failed to serialize ledger")?;
        let path = Self::path(project_dir);
        write_atomic(&path, content.as_bytes())?;
        debug!("Saved ledger {} ({} stages)", path.display(), self.stages.len());
        Ok(())
    }

    pub fn get(&self, stage: Stage) -> Option<&StageRecord> {
        self.stages.get(&stage)
    }

    /// The record for `stage` if it was built with exactly `key`.
    pub fn matching(&self, stage: Stage, key: &Digest) -> Option<&StageRecord> {
        self.stages.get(&stage).filter(|r| &r.cache_key == key)
    }

    pub fn record(&mut self, stage: Stage, cache_key: Digest, artifact: String, layers: Vec<Digest>) {
        self.stages.insert(
            stage,
            StageRecord {
                cache_key,
                artifact,
                layers,
                completed_at: Utc::now(),
            },
        );
    }

    /// Every layer digest the ledger still refers to.
    pub fn referenced_layers(&self) -> HashSet<Digest> {
        self.stages
            .values()
            .flat_map(|r| r.layers.iter().cloned())
            .collect()
    }
}

/// Exclusive per-project lock, released on drop.
#[derive(Debug)]
pub struct ProjectLock {
    file: fs::File,
    path: PathBuf,
}

impl ProjectLock {
    pub fn acquire(project_dir: &Path) -> Result<Self> {
        fs::create_dir_all(project_dir)
            .with_context(|| format!("Failed to create {}", project_dir.display()))?;
        let path = project_dir.join(LOCK_FILE);
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("Failed to open lock file {}", path.display()))?;

        if file.try_lock_exclusive().is_err() {
            info!("Waiting for another build of this project to finish");
            file.lock_exclusive()
                .with_context(|| format!("Failed to lock {}", path.display()))?;
        }
        Ok(Self { file, path })
    }
}

impl Drop for ProjectLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!("Failed to release {}: {}", self.path.display(), e);
        }
    }
}

/// Write via a sibling temp file and rename, so readers see all or nothing.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;
    tmp.write_all(bytes)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    tmp.as_file().sync_all().ok();
    tmp.persist(path)
        .map_err(|e| e.error)
        .with_context(|| format!("Failed to move blob into {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::LayerBuilder;
    use tempfile::TempDir;

    fn layer(content: &[u8]) -> LayerArchive {
        let mut builder = LayerBuilder::new();
        builder.add_bytes("app/requirements.txt", content.to_vec(), 0o644);
        builder.finish().unwrap()
    }

    #[test]
    fn test_put_is_content_addressed() {
        let temp = TempDir::new().unwrap();
        let store = LayerStore::new(temp.path());
        let l = layer(b"requests==2.31.0\n");

        assert!(store.put(&l).unwrap());
        assert!(!store.put(&l).unwrap());
        assert!(store.contains(&l.digest));
        assert_eq!(store.read(&l.digest).unwrap(), l.bytes);
        assert_eq!(
            store.blob_path(&l.digest),
            temp.path().join("blobs/sha256").join(l.digest.hash())
        );
    }

    #[test]
    fn test_gc_keeps_referenced() {
        let temp = TempDir::new().unwrap();
        let store = LayerStore::new(temp.path());
        let keep = layer(b"a==1\n");
        let drop = layer(b"b==2\n");
        store.put(&keep).unwrap();
        store.put(&drop).unwrap();

        let mut referenced = HashSet::new();
        referenced.insert(keep.digest.clone());
        let (count, _) = store.gc(&referenced).unwrap();

        assert_eq!(count, 1);
        assert!(store.contains(&keep.digest));
        assert!(!store.contains(&drop.digest));
    }

    #[test]
    fn test_gc_leaves_non_blob_files() {
        let temp = TempDir::new().unwrap();
        let store = LayerStore::new(temp.path());
        let stale = layer(b"c==3\n");
        store.put(&stale).unwrap();
        let in_flight = temp.path().join("blobs/sha256/.tmpA1b2C3");
        fs::write(&in_flight, b"partial").unwrap();

        let (count, _) = store.gc(&HashSet::new()).unwrap();

        assert_eq!(count, 1);
        assert!(!store.contains(&stale.digest));
        assert!(in_flight.exists());
    }

    #[test]
    fn test_referenced_layers_spans_projects() {
        let temp = TempDir::new().unwrap();
        let store = LayerStore::new(temp.path());
        let a = layer(b"a==1\n");
        let b = layer(b"b==2\n");

        let mut svc = BuildLedger::new("svc");
        svc.record(Stage::Runtime, Digest::sha256(b"k1"), "x".to_string(), vec![a.digest.clone()]);
        svc.save(&temp.path().join("svc")).unwrap();
        let mut worker = BuildLedger::new("worker");
        worker.record(Stage::Runtime, Digest::sha256(b"k2"), "y".to_string(), vec![b.digest.clone()]);
        worker.save(&temp.path().join("worker")).unwrap();
        fs::create_dir_all(temp.path().join("broken")).unwrap();
        fs::write(temp.path().join("broken").join(LEDGER_FILE), "{").unwrap();

        let referenced = store.referenced_layers().unwrap();
        assert_eq!(referenced.len(), 2);
        assert!(referenced.contains(&a.digest));
        assert!(referenced.contains(&b.digest));

        assert!(LayerStore::new(temp.path().join("missing"))
            .referenced_layers()
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_ledger_roundtrip_and_matching() {
        let temp = TempDir::new().unwrap();
        let key = Digest::sha256(b"deps");
        let mut ledger = BuildLedger::new("svc");
        ledger.record(
            Stage::Dependencies,
            key.clone(),
            "pybox-cache/svc:dependencies-abc".to_string(),
            vec![Digest::sha256(b"layer")],
        );
        ledger.save(temp.path()).unwrap();

        let loaded = BuildLedger::load(temp.path(), "svc").unwrap();
        assert_eq!(loaded, ledger);
        assert!(loaded.matching(Stage::Dependencies, &key).is_some());
        assert!(loaded
            .matching(Stage::Dependencies, &Digest::sha256(b"other"))
            .is_none());
        assert!(loaded.get(Stage::Runtime).is_none());
        assert_eq!(loaded.referenced_layers().len(), 1);
    }

    #[test]
    fn test_ledger_missing_or_corrupt() {
        let temp = TempDir::new().unwrap();
        let ledger = BuildLedger::load(temp.path(), "svc").unwrap();
        assert!(ledger.stages.is_empty());

        fs::write(BuildLedger::path(temp.path()), "{ not json").unwrap();
        let ledger = BuildLedger::load(temp.path(), "svc").unwrap();
        assert!(ledger.stages.is_empty());
        assert_eq!(ledger.project, "svc");
    }

    #[test]
    fn test_ledger_other_project_ignored() {
        let temp = TempDir::new().unwrap();
        let mut other = BuildLedger::new("other");
        other.record(
            Stage::Base,
            Digest::sha256(b"k"),
            "x".to_string(),
            Vec::new(),
        );
        other.save(temp.path()).unwrap();

        let ledger = BuildLedger::load(temp.path(), "svc").unwrap();
        assert!(ledger.stages.is_empty());
    }

    #[test]
    fn test_ledger_stage_keys_serialize_lowercase() {
        let mut ledger = BuildLedger::new("svc");
        ledger.record(
            Stage::Runtime,
            Digest::sha256(b"k"),
            "svc:latest".to_string(),
            Vec::new(),
        );
        let json = serde_json::to_value(&ledger).unwrap();
        assert!(json["stages"]["runtime"]["cache_key"]
            .as_str()
            .unwrap()
            .starts_with("sha256:"));
    }

    #[test]
    fn test_project_lock_reacquire() {
        let temp = TempDir::new().unwrap();
        {
            let _lock = ProjectLock::acquire(temp.path()).unwrap();
        }
        let _lock = ProjectLock::acquire(temp.path()).unwrap();
        assert!(temp.path().join(LOCK_FILE).exists());
    }
}
