//! Stage-by-stage image assembly.
//!
//! Stages run strictly in order (base, dependencies, runtime). Each stage's cache key comes
//! from the build graph; a stage is skipped when the ledger holds the same key and the
//! executor still has the artifact. The ledger is saved after every completed stage, so an
//! input error in a later stage never discards earlier work.

use crate::dockerfile::{self, ContextLayout, DockerfileOptions};
use crate::graph::{BuildGraph, GraphPlanner, Stage, MANIFEST, SOURCE};
use crate::image_config::ImageConfig;
use crate::layer::{self, LayerArchive, LayerBuilder};
use crate::plan;
use crate::store::{BuildLedger, LayerStore, ProjectLock};
use async_trait::async_trait;
use pybox_core::{
    BuildError, DependencyManifest, Digest, ImageReference, ProgressEvent, ProgressHandler,
    PyboxConfig, Recipe, SourceTree,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

pub const ARTIFACT_REPOSITORY: &str = "pybox-cache";
const DOCKERFILE: &str = "Dockerfile";

/// How the base image was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseResolution {
    pub pulled: bool,
    pub image_id: Option<String>,
}

/// Everything an executor needs to produce one stage artifact.
#[derive(Debug, Clone)]
pub struct StageRequest {
    pub stage: Stage,
    pub cache_key: Digest,
    /// Tag the finished stage must carry.
    pub artifact: String,
    /// Image the stage builds on: the base image or the previous stage's artifact.
    pub from: String,
    pub dockerfile: String,
    /// Gzipped build context holding the Dockerfile and the stage's inputs only.
    pub context: LayerArchive,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageOutput {
    pub image_id: Option<String>,
}

/// Backend that materialises stages.
#[async_trait]
pub trait StageExecutor: Send + Sync {
    async fn resolve_base(
        &self,
        image: &ImageReference,
        platform: &str,
    ) -> Result<BaseResolution, BuildError>;

    async fn contains(&self, artifact: &str) -> Result<bool, BuildError>;

    async fn execute(&self, request: &StageRequest) -> Result<StageOutput, BuildError>;

    /// Tag the runtime artifact as the final image and check its config.
    async fn finalize(
        &self,
        artifact: &str,
        tag: &str,
        expected: &ImageConfig,
    ) -> Result<(), BuildError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Built,
    Cached,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub stage: Stage,
    pub cache_key: Digest,
    pub artifact: String,
    pub status: StageStatus,
    pub duration_ms: u128,
}

#[derive(Debug, Clone, Serialize)]
pub struct LayerReport {
    pub node: String,
    pub digest: Digest,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    pub project: String,
    pub image: String,
    pub stages: Vec<StageReport>,
    pub layers: Vec<LayerReport>,
    pub duration_ms: u128,
}

impl BuildReport {
    pub fn executed(&self) -> usize {
        self.stages
            .iter()
            .filter(|s| s.status == StageStatus::Built)
            .count()
    }

    pub fn cached(&self) -> usize {
        self.stages
            .iter()
            .filter(|s| s.status == StageStatus::Cached)
            .count()
    }

    pub fn stage(&self, stage: Stage) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.stage == stage)
    }

    pub fn layer(&self, node: &str) -> Option<&LayerReport> {
        self.layers.iter().find(|l| l.node == node)
    }
}

#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    /// Final image tag, `<project>:latest` when unset.
    pub tag: Option<String>,
    /// Rebuild every stage regardless of the ledger.
    pub no_cache: bool,
}

pub fn artifact_tag(project: &str, stage: Stage, key: &Digest) -> String {
    format!("{}/{}:{}-{}", ARTIFACT_REPOSITORY, project, stage, key.short(12))
}

pub fn default_tag(project: &str) -> String {
    format!("{}:latest", project)
}

pub struct Assembler<E: StageExecutor> {
    executor: E,
    config: PyboxConfig,
    store: LayerStore,
    handler: Arc<dyn ProgressHandler>,
}

/// Mutable state of one build run.
struct Run {
    project: String,
    project_dir: PathBuf,
    ledger: BuildLedger,
    graph: BuildGraph,
    stages: Vec<StageReport>,
    layers: Vec<LayerReport>,
    previous: String,
    no_cache: bool,
}

impl<E: StageExecutor> Assembler<E> {
    pub fn new(executor: E, config: PyboxConfig, handler: Arc<dyn ProgressHandler>) -> Self {
        let store = LayerStore::new(&config.cache_dir);
        Self {
            executor,
            config,
            store,
            handler,
        }
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub fn store(&self) -> &LayerStore {
        &self.store
    }

    pub async fn build(
        &self,
        context_dir: &Path,
        recipe: &Recipe,
        options: &BuildOptions,
    ) -> Result<BuildReport, BuildError> {
        let project = recipe.project_name(context_dir);
        let mut current = None;
        let result = self
            .run(context_dir, recipe, options, &project, &mut current)
            .await;
        if let Err(err) = &result {
            self.handler.on_progress(&ProgressEvent::Failed {
                stage: current.map(|s: Stage| s.to_string()),
                kind: err.kind(),
                error: err.to_string(),
            });
        }
        result
    }

    async fn run(
        &self,
        context_dir: &Path,
        recipe: &Recipe,
        options: &BuildOptions,
        project: &str,
        current: &mut Option<Stage>,
    ) -> Result<BuildReport, BuildError> {
        let started = Instant::now();
        recipe.validate()?;

        self.handler.on_progress(&ProgressEvent::Started {
            project: project.to_string(),
            context: context_dir.display().to_string(),
        });

        let project_dir = self.config.project_dir(project);
        let _lock = ProjectLock::acquire(&project_dir).map_err(BuildError::backend)?;
        let ledger = BuildLedger::load(&project_dir, project).map_err(BuildError::backend)?;

        let image = recipe.base_image()?;
        let planner = GraphPlanner::new(recipe, &self.config.platform);

        *current = Some(Stage::Base);
        let resolve_started = Instant::now();
        let resolution = self
            .executor
            .resolve_base(&image, &self.config.platform)
            .await?;
        self.handler.on_progress(&ProgressEvent::BaseResolved {
            reference: image.as_written().to_string(),
            pulled: resolution.pulled,
            duration: resolve_started.elapsed(),
        });

        let mut run = Run {
            project: project.to_string(),
            project_dir,
            ledger,
            graph: BuildGraph::new(),
            stages: Vec::new(),
            layers: Vec::new(),
            previous: image.canonical(),
            no_cache: options.no_cache,
        };

        run.graph
            .extend(planner.base_nodes()?)
            .map_err(BuildError::backend)?;
        let context = stage_context(recipe, Stage::Base, &run.previous, None, None)?;
        self.run_stage(&mut run, Stage::Base, context, Vec::new())
            .await?;

        // Step A: the manifest alone, then the install
        *current = Some(Stage::Dependencies);
        let manifest_path = plan::manifest_path(context_dir, recipe);
        let manifest = DependencyManifest::load(&manifest_path)?;
        let manifest_layer = layer::manifest_layer(&manifest_path, &recipe.manifest_dest())
            .map_err(BuildError::backend)?;
        self.put_layer(&mut run, MANIFEST, &manifest_layer)?;
        run.graph
            .extend(planner.dependency_nodes(&manifest.digest))
            .map_err(BuildError::backend)?;
        let context = stage_context(
            recipe,
            Stage::Dependencies,
            &run.previous,
            Some(&manifest_path),
            None,
        )?;
        self.run_stage(
            &mut run,
            Stage::Dependencies,
            context,
            vec![manifest_layer.digest.clone()],
        )
        .await?;

        // Step B: the source tree
        *current = Some(Stage::Runtime);
        let source = SourceTree::scan(
            &plan::source_root(context_dir, recipe),
            &recipe.source.exclude,
        )?;
        let source_layer =
            layer::source_layer(&source, &recipe.source_dest()).map_err(BuildError::backend)?;
        self.put_layer(&mut run, SOURCE, &source_layer)?;
        run.graph
            .extend(planner.runtime_nodes(&source.digest))
            .map_err(BuildError::backend)?;
        let context = stage_context(recipe, Stage::Runtime, &run.previous, None, Some(&source))?;
        self.run_stage(
            &mut run,
            Stage::Runtime,
            context,
            vec![source_layer.digest.clone()],
        )
        .await?;

        *current = None;
        let tag = options
            .tag
            .clone()
            .unwrap_or_else(|| default_tag(&run.project));
        self.executor
            .finalize(&run.previous, &tag, &ImageConfig::from_recipe(recipe))
            .await?;

        run.ledger.image = Some(tag.clone());
        run.ledger
            .save(&run.project_dir)
            .map_err(BuildError::backend)?;
        self.collect_garbage(&run.ledger);

        let report = BuildReport {
            project: run.project,
            image: tag,
            stages: run.stages,
            layers: run.layers,
            duration_ms: started.elapsed().as_millis(),
        };
        self.handler.on_progress(&ProgressEvent::Completed {
            image: report.image.clone(),
            executed: report.executed(),
            cached: report.cached(),
            total_time: started.elapsed(),
        });
        Ok(report)
    }

    /// Drop blobs no project ledger refers to any more. Failures only cost disk space.
    fn collect_garbage(&self, ledger: &BuildLedger) {
        let mut keep = match self.store.referenced_layers() {
            Ok(keep) => keep,
            Err(e) => {
                warn!("Skipping layer GC: {:#}", e);
                return;
            }
        };
        keep.extend(ledger.referenced_layers());
        match self.store.gc(&keep) {
            Ok((deleted, bytes)) if deleted > 0 => {
                debug!(deleted, bytes, "Removed superseded layers")
            }
            Ok(_) => {}
            Err(e) => warn!("Layer GC failed: {:#}", e),
        }
    }

    fn put_layer(&self, run: &mut Run, node: &str, layer: &LayerArchive) -> Result<(), BuildError> {
        self.store.put(layer).map_err(BuildError::backend)?;
        self.handler.on_progress(&ProgressEvent::LayerWritten {
            node: node.to_string(),
            digest: layer.digest.to_string(),
            size: layer.size(),
        });
        run.layers.push(LayerReport {
            node: node.to_string(),
            digest: layer.digest.clone(),
            size: layer.size(),
        });
        Ok(())
    }

    async fn run_stage(
        &self,
        run: &mut Run,
        stage: Stage,
        context: StageContext,
        layers: Vec<Digest>,
    ) -> Result<(), BuildError> {
        let started = Instant::now();
        let key = run
            .graph
            .stage_key(stage)
            .cloned()
            .ok_or_else(|| BuildError::backend(format!("No cache key for stage {}", stage)))?;
        let artifact = artifact_tag(&run.project, stage, &key);

        let recorded = !run.no_cache && run.ledger.matching(stage, &key).is_some();
        if recorded && self.executor.contains(&artifact).await? {
            info!(stage = %stage, artifact = %artifact, "Reusing stage artifact");
            self.handler.on_progress(&ProgressEvent::StageCached {
                stage: stage.to_string(),
                cache_key: key.to_string(),
            });
            self.finish_stage(run, stage, key, artifact, StageStatus::Cached, started);
            return Ok(());
        }
        if recorded {
            debug!(stage = %stage, "Ledger entry present but artifact is gone, rebuilding");
        }

        self.handler.on_progress(&ProgressEvent::StageStarted {
            stage: stage.to_string(),
            cache_key: key.to_string(),
        });
        let request = StageRequest {
            stage,
            cache_key: key.clone(),
            artifact: artifact.clone(),
            from: run.previous.clone(),
            dockerfile: context.dockerfile,
            context: context.archive,
        };
        self.executor.execute(&request).await?;

        run.ledger
            .record(stage, key.clone(), artifact.clone(), layers);
        run.ledger
            .save(&run.project_dir)
            .map_err(BuildError::backend)?;

        self.handler.on_progress(&ProgressEvent::StageCompleted {
            stage: stage.to_string(),
            cache_key: key.to_string(),
            duration: started.elapsed(),
        });
        self.finish_stage(run, stage, key, artifact, StageStatus::Built, started);
        Ok(())
    }

    fn finish_stage(
        &self,
        run: &mut Run,
        stage: Stage,
        cache_key: Digest,
        artifact: String,
        status: StageStatus,
        started: Instant,
    ) {
        run.previous = artifact.clone();
        run.stages.push(StageReport {
            stage,
            cache_key,
            artifact,
            status,
            duration_ms: started.elapsed().as_millis(),
        });
    }
}

struct StageContext {
    dockerfile: String,
    archive: LayerArchive,
}

/// Dockerfile for `stage` on top of `from`, packed with only the files that stage copies.
fn stage_context(
    recipe: &Recipe,
    stage: Stage,
    from: &str,
    manifest: Option<&Path>,
    source: Option<&SourceTree>,
) -> Result<StageContext, BuildError> {
    let options = DockerfileOptions {
        layout: ContextLayout::generated(recipe),
        link: false,
    };
    let dockerfile =
        dockerfile::render_stage(recipe, stage, from, &options).map_err(BuildError::backend)?;

    let mut builder = LayerBuilder::new();
    builder.add_bytes(DOCKERFILE, dockerfile.clone().into_bytes(), 0o644);
    if let Some(path) = manifest {
        builder.add_file(&options.layout.manifest, path, 0o644);
    }
    if let Some(tree) = source {
        builder.add_tree(&options.layout.source, tree);
    }
    let archive = builder.finish_gzip().map_err(BuildError::backend)?;

    Ok(StageContext {
        dockerfile,
        archive,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::plan::tests::write_project;
    use pybox_core::{ErrorKind, NoOpHandler};
    use std::collections::HashSet;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// In-memory executor recording what it was asked to do.
    #[derive(Default)]
    pub(crate) struct FakeExecutor {
        pub executed: Mutex<Vec<StageRequest>>,
        pub artifacts: Mutex<HashSet<String>>,
        pub fail_base: bool,
        pub fail_stage: Option<Stage>,
        pub finalized: Mutex<Vec<String>>,
    }

    impl FakeExecutor {
        pub fn executed_stages(&self) -> Vec<Stage> {
            self.executed.lock().unwrap().iter().map(|r| r.stage).collect()
        }

        pub fn reset(&self) {
            self.executed.lock().unwrap().clear();
        }
    }

    #[async_trait]
    impl StageExecutor for FakeExecutor {
        async fn resolve_base(
            &self,
            image: &ImageReference,
            _platform: &str,
        ) -> Result<BaseResolution, BuildError> {
            if self.fail_base {
                return Err(BuildError::BaseImageUnresolvable {
                    reference: image.as_written().to_string(),
                    message: "manifest unknown".to_string(),
                });
            }
            Ok(BaseResolution {
                pulled: false,
                image_id: None,
            })
        }

        async fn contains(&self, artifact: &str) -> Result<bool, BuildError> {
            Ok(self.artifacts.lock().unwrap().contains(artifact))
        }

        async fn execute(&self, request: &StageRequest) -> Result<StageOutput, BuildError> {
            if self.fail_stage == Some(request.stage) {
                return Err(BuildError::DependencyInstall {
                    message: "pip exited with 1".to_string(),
                });
            }
            self.executed.lock().unwrap().push(request.clone());
            self.artifacts
                .lock()
                .unwrap()
                .insert(request.artifact.clone());
            Ok(StageOutput::default())
        }

        async fn finalize(
            &self,
            artifact: &str,
            tag: &str,
            _expected: &ImageConfig,
        ) -> Result<(), BuildError> {
            assert!(self.artifacts.lock().unwrap().contains(artifact));
            self.finalized.lock().unwrap().push(tag.to_string());
            Ok(())
        }
    }

    struct Fixture {
        _cache: TempDir,
        project: TempDir,
        assembler: Assembler<FakeExecutor>,
        recipe: Recipe,
    }

    fn fixture(executor: FakeExecutor) -> Fixture {
        let cache = TempDir::new().unwrap();
        let project = TempDir::new().unwrap();
        write_project(project.path());
        let config = PyboxConfig {
            cache_dir: cache.path().to_path_buf(),
            log_level: "info".to_string(),
            platform: "linux/amd64".to_string(),
            recipe_file: "pybox.yaml".to_string(),
            pull_timeout_secs: 300,
        };
        let recipe = Recipe {
            name: Some("svc".to_string()),
            ..Recipe::default()
        };
        Fixture {
            _cache: cache,
            project,
            assembler: Assembler::new(executor, config, Arc::new(NoOpHandler)),
            recipe,
        }
    }

    impl Fixture {
        async fn build(&self) -> Result<BuildReport, BuildError> {
            self.assembler
                .build(self.project.path(), &self.recipe, &BuildOptions::default())
                .await
        }

        fn ledger(&self) -> BuildLedger {
            BuildLedger::load(&self.assembler.config.project_dir("svc"), "svc").unwrap()
        }

        fn executor(&self) -> &FakeExecutor {
            self.assembler.executor()
        }
    }

    #[tokio::test]
    async fn test_first_build_runs_every_stage() {
        let f = fixture(FakeExecutor::default());
        let report = f.build().await.unwrap();

        assert_eq!(
            f.executor().executed_stages(),
            vec![Stage::Base, Stage::Dependencies, Stage::Runtime]
        );
        assert_eq!(report.executed(), 3);
        assert_eq!(report.image, "svc:latest");
        assert_eq!(*f.executor().finalized.lock().unwrap(), vec!["svc:latest"]);
        assert_eq!(f.ledger().stages.len(), 3);
        assert_eq!(f.ledger().image.as_deref(), Some("svc:latest"));

        let deps = report.stage(Stage::Dependencies).unwrap();
        assert!(deps.artifact.starts_with("pybox-cache/svc:dependencies-"));
        assert!(f.assembler.store().contains(&report.layer(MANIFEST).unwrap().digest));
    }

    #[tokio::test]
    async fn test_unchanged_rebuild_is_fully_cached() {
        let f = fixture(FakeExecutor::default());
        let first = f.build().await.unwrap();
        f.executor().reset();

        let second = f.build().await.unwrap();
        assert!(f.executor().executed_stages().is_empty());
        assert_eq!(second.cached(), 3);
        assert_eq!(
            first.layer(MANIFEST).unwrap().digest,
            second.layer(MANIFEST).unwrap().digest
        );
    }

    #[tokio::test]
    async fn test_source_edit_skips_dependency_install() {
        let f = fixture(FakeExecutor::default());
        let first = f.build().await.unwrap();
        f.executor().reset();

        fs::write(f.project.path().join("app/main.py"), "print('edited')\n").unwrap();
        let second = f.build().await.unwrap();

        assert_eq!(f.executor().executed_stages(), vec![Stage::Runtime]);
        assert_eq!(
            second.stage(Stage::Dependencies).unwrap().status,
            StageStatus::Cached
        );
        assert_eq!(
            first.stage(Stage::Dependencies).unwrap().cache_key,
            second.stage(Stage::Dependencies).unwrap().cache_key
        );
        assert_eq!(
            first.layer(MANIFEST).unwrap().digest,
            second.layer(MANIFEST).unwrap().digest
        );
        assert_ne!(
            first.layer(SOURCE).unwrap().digest,
            second.layer(SOURCE).unwrap().digest
        );
    }

    #[tokio::test]
    async fn test_source_edit_collects_superseded_layer() {
        let f = fixture(FakeExecutor::default());
        let first = f.build().await.unwrap();
        let old_source = first.layer(SOURCE).unwrap().digest.clone();
        let manifest = first.layer(MANIFEST).unwrap().digest.clone();

        let mut other = BuildLedger::new("worker");
        let mut builder = LayerBuilder::new();
        builder.add_bytes("worker.txt", b"worker".to_vec(), 0o644);
        let shared = builder.finish().unwrap();
        f.assembler.store().put(&shared).unwrap();
        other.record(
            Stage::Runtime,
            Digest::sha256(b"worker"),
            "pybox-cache/worker:runtime-0".to_string(),
            vec![shared.digest.clone()],
        );
        other
            .save(&f.assembler.config.project_dir("worker"))
            .unwrap();

        fs::write(f.project.path().join("app/main.py"), "print('edited')\n").unwrap();
        let second = f.build().await.unwrap();
        let new_source = &second.layer(SOURCE).unwrap().digest;

        let store = f.assembler.store();
        assert!(!store.contains(&old_source));
        assert!(store.contains(new_source));
        assert!(store.contains(&manifest));
        assert!(store.contains(&shared.digest));
    }

    #[tokio::test]
    async fn test_manifest_edit_reinstalls_and_keeps_source_layer() {
        let f = fixture(FakeExecutor::default());
        let first = f.build().await.unwrap();
        f.executor().reset();

        fs::write(
            f.project.path().join("requirements.txt"),
            "requests==2.31.0\nurllib3==2.2.1\n",
        )
        .unwrap();
        let second = f.build().await.unwrap();

        assert_eq!(
            f.executor().executed_stages(),
            vec![Stage::Dependencies, Stage::Runtime]
        );
        let (a, b) = (
            first.layer(SOURCE).unwrap(),
            second.layer(SOURCE).unwrap(),
        );
        assert_eq!(a.digest, b.digest);
        assert_eq!(
            f.assembler.store().read(&a.digest).unwrap(),
            f.assembler.store().read(&b.digest).unwrap()
        );
    }

    #[tokio::test]
    async fn test_unresolvable_base_executes_nothing() {
        let f = fixture(FakeExecutor {
            fail_base: true,
            ..Default::default()
        });
        let err = f.build().await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Resolution);
        assert!(f.executor().executed_stages().is_empty());
        assert!(f.executor().finalized.lock().unwrap().is_empty());
        assert!(f.ledger().stages.is_empty());
        assert!(f.ledger().image.is_none());
    }

    #[tokio::test]
    async fn test_empty_source_keeps_dependency_stage() {
        let f = fixture(FakeExecutor::default());
        fs::remove_dir_all(f.project.path().join("app")).unwrap();
        fs::create_dir_all(f.project.path().join("app")).unwrap();

        let err = f.build().await.unwrap_err();
        assert!(matches!(err, BuildError::SourceEmpty { .. }));
        assert_eq!(err.kind(), ErrorKind::Input);

        let ledger = f.ledger();
        assert!(ledger.get(Stage::Dependencies).is_some());
        assert!(ledger.get(Stage::Runtime).is_none());
        assert!(ledger.image.is_none());

        f.executor().reset();
        fs::write(f.project.path().join("app/main.py"), "print('back')\n").unwrap();
        f.build().await.unwrap();
        assert_eq!(f.executor().executed_stages(), vec![Stage::Runtime]);
    }

    #[tokio::test]
    async fn test_missing_manifest_is_input_error() {
        let f = fixture(FakeExecutor::default());
        fs::remove_file(f.project.path().join("requirements.txt")).unwrap();

        let err = f.build().await.unwrap_err();
        assert!(matches!(err, BuildError::ManifestMissing { .. }));
        assert_eq!(f.executor().executed_stages(), vec![Stage::Base]);
    }

    #[tokio::test]
    async fn test_install_failure_records_nothing_for_stage() {
        let f = fixture(FakeExecutor {
            fail_stage: Some(Stage::Dependencies),
            ..Default::default()
        });
        let err = f.build().await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Resolution);
        let ledger = f.ledger();
        assert!(ledger.get(Stage::Base).is_some());
        assert!(ledger.get(Stage::Dependencies).is_none());
    }

    #[tokio::test]
    async fn test_pruned_artifact_is_rebuilt() {
        let f = fixture(FakeExecutor::default());
        let report = f.build().await.unwrap();
        f.executor().reset();

        let runtime = report.stage(Stage::Runtime).unwrap().artifact.clone();
        f.executor().artifacts.lock().unwrap().remove(&runtime);

        f.build().await.unwrap();
        assert_eq!(f.executor().executed_stages(), vec![Stage::Runtime]);
    }

    #[tokio::test]
    async fn test_unpinned_base_rejected_before_anything_runs() {
        let mut f = fixture(FakeExecutor::default());
        f.recipe.base.image = "python:latest".to_string();

        let err = f.build().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(f.executor().executed_stages().is_empty());
    }

    #[tokio::test]
    async fn test_stage_requests_chain_artifacts() {
        let f = fixture(FakeExecutor::default());
        f.build().await.unwrap();

        let executed = f.executor().executed.lock().unwrap();
        assert_eq!(executed[0].from, "docker.io/library/python:3.12-slim");
        assert_eq!(executed[1].from, executed[0].artifact);
        assert_eq!(executed[2].from, executed[1].artifact);
        assert!(executed[1]
            .dockerfile
            .starts_with(&format!("FROM {} AS dependencies", executed[0].artifact)));
    }

    #[tokio::test]
    async fn test_no_cache_rebuilds_everything() {
        let f = fixture(FakeExecutor::default());
        f.build().await.unwrap();
        f.executor().reset();

        f.assembler
            .build(
                f.project.path(),
                &f.recipe,
                &BuildOptions {
                    tag: Some("svc:dev".to_string()),
                    no_cache: true,
                },
            )
            .await
            .unwrap();
        assert_eq!(f.executor().executed_stages().len(), 3);
        assert_eq!(f.ledger().image.as_deref(), Some("svc:dev"));
    }
}
