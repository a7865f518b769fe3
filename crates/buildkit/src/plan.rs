use crate::graph::{BuildGraph, GraphPlanner, Stage};
use pybox_core::{BuildError, DependencyManifest, Digest, Recipe, SourceTree};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Every input of a build, read and hashed up front.
///
/// Used by the commands that only describe a build (`plan`, `llb`, `dockerfile`); the
/// assembler reads the same inputs stage by stage instead.
#[derive(Debug, Clone)]
pub struct BuildPlan {
    pub project: String,
    pub context_dir: PathBuf,
    pub recipe: Recipe,
    pub platform: String,
    pub manifest: DependencyManifest,
    pub source: SourceTree,
    pub graph: BuildGraph,
}

impl BuildPlan {
    pub fn prepare(context_dir: &Path, recipe: Recipe, platform: &str) -> Result<Self, BuildError> {
        recipe.validate()?;
        let project = recipe.project_name(context_dir);

        let manifest = DependencyManifest::load(&manifest_path(context_dir, &recipe))?;
        let source = SourceTree::scan(&source_root(context_dir, &recipe), &recipe.source.exclude)?;
        let graph = GraphPlanner::new(&recipe, platform)
            .full_graph(&manifest.digest, &source.digest)
            .map_err(BuildError::backend)?;

        Ok(Self {
            project,
            context_dir: context_dir.to_path_buf(),
            recipe,
            platform: platform.to_string(),
            manifest,
            source,
            graph,
        })
    }

    /// Manifest path relative to the context, `/`-separated.
    pub fn manifest_rel(&self) -> String {
        context_relative(&self.recipe.dependencies.manifest)
    }

    /// Source tree path relative to the context, `/`-separated.
    pub fn source_rel(&self) -> String {
        context_relative(&self.recipe.source.path)
    }

    pub fn summary(&self) -> PlanSummary {
        PlanSummary {
            project: self.project.clone(),
            platform: self.platform.clone(),
            base_image: self
                .recipe
                .base_image()
                .map(|r| r.canonical())
                .unwrap_or_else(|_| self.recipe.base.image.clone()),
            workdir: self.recipe.workdir.clone(),
            manifest: self.manifest.digest.clone(),
            requirements: self.manifest.requirements.len(),
            unpinned: self.manifest.unpinned().map(|r| r.name.clone()).collect(),
            source: self.source.digest.clone(),
            source_files: self.source.len(),
            source_bytes: self.source.total_size(),
            entrypoint: self.recipe.entrypoint_command().argv(),
            env: self.recipe.environment().to_env_list(),
            stages: self.graph.stage_keys(),
            graph: self.graph.clone(),
        }
    }
}

/// Serializable view of a plan for `pybox plan`.
#[derive(Debug, Clone, Serialize)]
pub struct PlanSummary {
    pub project: String,
    pub platform: String,
    pub base_image: String,
    pub workdir: String,
    pub manifest: Digest,
    pub requirements: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub unpinned: Vec<String>,
    pub source: Digest,
    pub source_files: usize,
    pub source_bytes: u64,
    pub entrypoint: Vec<String>,
    pub env: Vec<String>,
    pub stages: BTreeMap<Stage, Digest>,
    pub graph: BuildGraph,
}

pub fn manifest_path(context_dir: &Path, recipe: &Recipe) -> PathBuf {
    context_dir.join(&recipe.dependencies.manifest)
}

pub fn source_root(context_dir: &Path, recipe: &Recipe) -> PathBuf {
    context_dir.join(&recipe.source.path)
}

fn context_relative(path: &str) -> String {
    let path = path.replace('\\', "/");
    let trimmed = path.trim_start_matches("./").trim_end_matches('/');
    if trimmed.is_empty() {
        ".".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::fs;

    pub(crate) fn write_project(root: &Path) {
        fs::write(root.join("requirements.txt"), "requests==2.31.0\n").unwrap();
        fs::create_dir_all(root.join("app")).unwrap();
        fs::write(root.join("app/__init__.py"), "").unwrap();
        fs::write(root.join("app/main.py"), "print('running')\n").unwrap();
    }

    #[test]
    fn test_prepare_reads_inputs() {
        let dir = tempfile::tempdir().unwrap();
        write_project(dir.path());

        let recipe = Recipe {
            name: Some("svc".to_string()),
            ..Recipe::default()
        };
        let plan = BuildPlan::prepare(dir.path(), recipe, "linux/amd64").unwrap();

        assert_eq!(plan.project, "svc");
        assert_eq!(plan.manifest.requirements.len(), 1);
        assert_eq!(plan.source.len(), 2);
        assert_eq!(plan.manifest_rel(), "requirements.txt");
        assert_eq!(plan.source_rel(), "app");
        assert_eq!(plan.graph.nodes().len(), 6);

        let summary = plan.summary();
        assert_eq!(summary.entrypoint, vec!["python", "-m", "app.main"]);
        assert_eq!(summary.stages.len(), 3);
        assert!(summary.unpinned.is_empty());
    }

    #[test]
    fn test_prepare_missing_manifest() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("app")).unwrap();
        fs::write(dir.path().join("app/main.py"), "").unwrap();

        let err = BuildPlan::prepare(dir.path(), Recipe::default(), "linux/amd64").unwrap_err();
        assert!(matches!(err, BuildError::ManifestMissing { .. }));
    }

    #[test]
    fn test_prepare_empty_source() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("requirements.txt"), "").unwrap();
        fs::create_dir_all(dir.path().join("app")).unwrap();

        let err = BuildPlan::prepare(dir.path(), Recipe::default(), "linux/amd64").unwrap_err();
        assert!(matches!(err, BuildError::SourceEmpty { .. }));
    }

    #[test]
    fn test_context_relative() {
        assert_eq!(context_relative("./app/"), "app");
        assert_eq!(context_relative("deps/requirements.txt"), "deps/requirements.txt");
        assert_eq!(context_relative("./"), ".");
    }
}
