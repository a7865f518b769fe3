pub mod assembler;
pub mod docker;
pub mod dockerfile;
pub mod graph;
pub mod image_config;
pub mod layer;
pub mod llb;
pub mod plan;
pub mod progress;
pub mod store;

pub use assembler::{
    artifact_tag, default_tag, Assembler, BaseResolution, BuildOptions, BuildReport,
    StageExecutor, StageOutput, StageReport, StageRequest, StageStatus,
};
pub use docker::{check_docker, run_container, DockerExecutor, RunOptions};
pub use dockerfile::{ContextLayout, DockerfileOptions};
pub use graph::{BuildGraph, BuildNode, GraphError, GraphPlanner, NodeSpec, Stage};
pub use image_config::ImageConfig;
pub use layer::{LayerArchive, LayerBuilder};
pub use llb::{BuildStrategy, LLBBuilder, PyboxStrategy};
pub use plan::{BuildPlan, PlanSummary};
pub use progress::{ProgressTracker, StreamSummary};
pub use store::{BuildLedger, LayerStore, ProjectLock, StageRecord};
