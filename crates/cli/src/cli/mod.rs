pub mod commands;
pub mod output;

pub use commands::{
    BuildArgs, CliArgs, Commands, ContextArgs, DockerfileArgs, ExecArgs, HealthArgs, LlbArgs,
    PlanArgs, RunArgs,
};
pub use output::{OutputFormat, OutputFormatter};
