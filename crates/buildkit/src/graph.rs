//! Build-step DAG with content-derived cache keys.
//!
//! Each node's key is derived from its own definition, its declared input and the keys of
//! its parents, nothing else. The source node has no parents at all (it is copied onto an
//! empty layer and merged later), which is what keeps application edits from reaching the
//! dependency-install key.

use pybox_core::{Digest, Recipe};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest as _, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use thiserror::Error;

const KEY_NAMESPACE: &[u8] = b"pybox.v1";

pub const BASE_IMAGE: &str = "base-image";
pub const CERTIFICATES: &str = "certificates";
pub const MANIFEST: &str = "manifest";
pub const INSTALL: &str = "install";
pub const SOURCE: &str = "source";
pub const ASSEMBLE: &str = "assemble";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("Node '{0}' is defined twice")]
    Duplicate(String),

    #[error("Node '{node}' depends on unknown node '{parent}'")]
    UnknownParent { node: String, parent: String },

    #[error("Dependency cycle involving: {}", .0.join(", "))]
    Cycle(Vec<String>),
}

/// Build stages, each producing one reusable artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Base,
    Dependencies,
    Runtime,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Base, Stage::Dependencies, Stage::Runtime];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Base => "base",
            Stage::Dependencies => "dependencies",
            Stage::Runtime => "runtime",
        }
    }

    /// Node whose key identifies the whole stage.
    pub fn head(&self) -> &'static str {
        match self {
            Stage::Base => CERTIFICATES,
            Stage::Dependencies => INSTALL,
            Stage::Runtime => ASSEMBLE,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// A node before its key is known.
#[derive(Debug, Clone)]
pub struct NodeSpec {
    pub name: String,
    pub stage: Stage,
    pub parents: Vec<String>,
    pub definition: Value,
    pub input: Option<Digest>,
}

impl NodeSpec {
    pub fn new(name: &str, stage: Stage, parents: &[&str], definition: Value) -> Self {
        Self {
            name: name.to_string(),
            stage,
            parents: parents.iter().map(|p| p.to_string()).collect(),
            definition,
            input: None,
        }
    }

    pub fn with_input(mut self, input: Digest) -> Self {
        self.input = Some(input);
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BuildNode {
    pub name: String,
    pub stage: Stage,
    pub parents: Vec<String>,
    pub definition: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<Digest>,
    pub cache_key: Digest,
}

/// Nodes in topological order with their cache keys.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BuildGraph {
    nodes: Vec<BuildNode>,
}

impl BuildGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a node whose parents are already present.
    pub fn add(&mut self, spec: NodeSpec) -> Result<&BuildNode, GraphError> {
        if self.get(&spec.name).is_some() {
            return Err(GraphError::Duplicate(spec.name));
        }
        let mut parent_keys = Vec::with_capacity(spec.parents.len());
        for parent in &spec.parents {
            let node = self.get(parent).ok_or_else(|| GraphError::UnknownParent {
                node: spec.name.clone(),
                parent: parent.clone(),
            })?;
            parent_keys.push(node.cache_key.clone());
        }

        let cache_key = cache_key(&spec, &parent_keys);
        self.nodes.push(BuildNode {
            name: spec.name,
            stage: spec.stage,
            parents: spec.parents,
            definition: spec.definition,
            input: spec.input,
            cache_key,
        });
        Ok(&self.nodes[self.nodes.len() - 1])
    }

    pub fn extend(&mut self, specs: Vec<NodeSpec>) -> Result<(), GraphError> {
        for spec in specs {
            self.add(spec)?;
        }
        Ok(())
    }

    /// Build from specs in any order; rejects duplicates, unknown parents and cycles.
    pub fn from_specs(specs: Vec<NodeSpec>) -> Result<Self, GraphError> {
        let mut index: HashMap<String, usize> = HashMap::new();
        for (i, spec) in specs.iter().enumerate() {
            if index.insert(spec.name.clone(), i).is_some() {
                return Err(GraphError::Duplicate(spec.name.clone()));
            }
        }

        let mut indegree = vec![0usize; specs.len()];
        let mut children: Vec<Vec<usize>> = vec![Vec::new(); specs.len()];
        for (i, spec) in specs.iter().enumerate() {
            for parent in &spec.parents {
                let p = *index.get(parent).ok_or_else(|| GraphError::UnknownParent {
                    node: spec.name.clone(),
                    parent: parent.clone(),
                })?;
                indegree[i] += 1;
                children[p].push(i);
            }
        }

        // Kahn's algorithm, always taking the earliest declared ready node.
        let mut ready: BTreeSet<usize> = (0..specs.len()).filter(|&i| indegree[i] == 0).collect();
        let mut order = Vec::with_capacity(specs.len());
        while let Some(i) = ready.pop_first() {
            order.push(i);
            for &child in &children[i] {
                indegree[child] -= 1;
                if indegree[child] == 0 {
                    ready.insert(child);
                }
            }
        }

        if order.len() != specs.len() {
            let mut stuck: Vec<String> = specs
                .iter()
                .enumerate()
                .filter(|(i, _)| indegree[*i] > 0)
                .map(|(_, s)| s.name.clone())
                .collect();
            stuck.sort();
            return Err(GraphError::Cycle(stuck));
        }

        let mut slots: Vec<Option<NodeSpec>> = specs.into_iter().map(Some).collect();
        let mut graph = Self::new();
        for i in order {
            if let Some(spec) = slots[i].take() {
                graph.add(spec)?;
            }
        }
        Ok(graph)
    }

    pub fn get(&self, name: &str) -> Option<&BuildNode> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn key(&self, name: &str) -> Option<&Digest> {
        self.get(name).map(|n| &n.cache_key)
    }

    pub fn nodes(&self) -> &[BuildNode] {
        &self.nodes
    }

    pub fn stage_key(&self, stage: Stage) -> Option<&Digest> {
        self.key(stage.head())
    }

    pub fn stage_keys(&self) -> BTreeMap<Stage, Digest> {
        Stage::ALL
            .iter()
            .filter_map(|s| self.stage_key(*s).map(|k| (*s, k.clone())))
            .collect()
    }
}

fn cache_key(spec: &NodeSpec, parent_keys: &[Digest]) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(KEY_NAMESPACE);
    hasher.update([0u8]);
    hasher.update(spec.name.as_bytes());
    hasher.update([0u8]);
    // serde_json maps are ordered, so this is canonical
    hasher.update(spec.definition.to_string().as_bytes());
    hasher.update([0u8]);
    for key in parent_keys {
        hasher.update(key.as_str().as_bytes());
        hasher.update([0u8]);
    }
    if let Some(input) = &spec.input {
        hasher.update(input.as_str().as_bytes());
    }
    Digest::from_hasher(hasher)
}

/// Derives the node specs of a recipe, stage by stage.
pub struct GraphPlanner<'a> {
    recipe: &'a Recipe,
    platform: &'a str,
}

impl<'a> GraphPlanner<'a> {
    pub fn new(recipe: &'a Recipe, platform: &'a str) -> Self {
        Self { recipe, platform }
    }

    pub fn base_nodes(&self) -> Result<Vec<NodeSpec>, pybox_core::RecipeError> {
        let image = self.recipe.base_image()?;
        let mut packages = self.recipe.base.packages.clone();
        packages.sort();
        packages.dedup();
        let package_manager = self.recipe.package_manager();

        Ok(vec![
            NodeSpec::new(
                BASE_IMAGE,
                Stage::Base,
                &[],
                json!({ "image": image.canonical(), "platform": self.platform }),
            ),
            NodeSpec::new(
                CERTIFICATES,
                Stage::Base,
                &[BASE_IMAGE],
                json!({
                    "packages": packages,
                    "command": package_manager.install_command(&packages),
                }),
            ),
        ])
    }

    pub fn dependency_nodes(&self, manifest_digest: &Digest) -> Vec<NodeSpec> {
        vec![
            NodeSpec::new(
                MANIFEST,
                Stage::Dependencies,
                &[CERTIFICATES],
                json!({ "dest": self.recipe.manifest_dest() }),
            )
            .with_input(manifest_digest.clone()),
            NodeSpec::new(
                INSTALL,
                Stage::Dependencies,
                &[MANIFEST],
                json!({
                    "command": self.recipe.install_command(),
                    "workdir": self.recipe.workdir,
                }),
            ),
        ]
    }

    pub fn runtime_nodes(&self, source_digest: &Digest) -> Vec<NodeSpec> {
        vec![
            NodeSpec::new(
                SOURCE,
                Stage::Runtime,
                &[],
                json!({ "dest": self.recipe.source_dest() }),
            )
            .with_input(source_digest.clone()),
            NodeSpec::new(
                ASSEMBLE,
                Stage::Runtime,
                &[INSTALL, SOURCE],
                json!({
                    "env": self.recipe.environment().to_env_list(),
                    "workdir": self.recipe.workdir,
                    "entrypoint": self.recipe.entrypoint_command().argv(),
                    "volumes": self.recipe.volumes,
                    "labels": self.recipe.labels,
                }),
            ),
        ]
    }

    pub fn full_graph(
        &self,
        manifest_digest: &Digest,
        source_digest: &Digest,
    ) -> anyhow::Result<BuildGraph> {
        let mut specs = self.base_nodes()?;
        specs.extend(self.dependency_nodes(manifest_digest));
        specs.extend(self.runtime_nodes(source_digest));
        Ok(BuildGraph::from_specs(specs)?)
    }
}
