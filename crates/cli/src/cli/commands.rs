use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Reproducible, layer-cached images for Python services
#[derive(Parser, Debug)]
#[command(
    name = "pybox",
    about = "Reproducible, layer-cached images for Python services",
    version,
    long_about = "pybox turns a recipe (pybox.yaml), a dependency manifest and an application \
                  source tree into a minimal runtime image. Dependencies are installed in a \
                  layer keyed by the manifest alone, so source edits never reinstall them. \
                  The image runs `<interpreter> -m <module>` in the working directory."
)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, global = true, value_name = "LEVEL", help = "Set logging level")]
    pub log_level: Option<String>,

    #[arg(short = 'v', long, global = true, help = "Verbose output")]
    pub verbose: bool,

    #[arg(
        short = 'q',
        long,
        global = true,
        conflicts_with = "verbose",
        help = "Quiet mode - suppress non-error output"
    )]
    pub quiet: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[command(
        about = "Show the build graph and cache keys",
        long_about = "Reads the recipe, manifest and source tree and prints every build step \
                      with its stage, parents and cache key. Nothing is built.\n\n\
                      Examples:\n  \
                      pybox plan\n  \
                      pybox plan ./service --format json"
    )]
    Plan(PlanArgs),

    #[command(
        about = "Build the image with the Docker engine",
        long_about = "Resolves the base image, then builds the base, dependencies and runtime \
                      stages in order. Stages whose cache key is unchanged are reused.\n\n\
                      Examples:\n  \
                      pybox build\n  \
                      pybox build ./service --tag svc:1.0\n  \
                      pybox build --no-cache"
    )]
    Build(BuildArgs),

    #[command(
        about = "Emit a BuildKit LLB definition",
        long_about = "Encodes the build graph as an LLB definition for buildctl.\n\n\
                      Examples:\n  \
                      pybox llb --image-config config.json > llb.pb\n  \
                      buildctl build --local context=. --output \"type=docker,name=svc,containerimage.config=$(cat config.json)\" < llb.pb\n  \
                      pybox llb --describe"
    )]
    Llb(LlbArgs),

    #[command(
        about = "Render an equivalent multi-stage Dockerfile",
        long_about = "Renders base, dependencies and runtime stages as a Dockerfile that builds \
                      from the project directory.\n\n\
                      Examples:\n  \
                      pybox dockerfile > Dockerfile\n  \
                      pybox dockerfile --link"
    )]
    Dockerfile(DockerfileArgs),

    #[command(
        about = "Run a built image in the foreground",
        long_about = "Creates a container from the image with its fixed entrypoint, streams \
                      its logs and exits with the container's status. Extra arguments are \
                      rejected.\n\n\
                      Examples:\n  \
                      pybox run\n  \
                      pybox run --config ./config.json --volume ./logs:/logs"
    )]
    Run(RunArgs),

    #[command(
        about = "Run the entrypoint locally",
        long_about = "Runs `<interpreter> -m <module>` as a foreground child with the recipe's \
                      environment applied, forwarding SIGINT and SIGTERM and exiting with the \
                      child's status. Extra arguments are rejected.\n\n\
                      Examples:\n  \
                      pybox exec\n  \
                      pybox exec ./service --workdir ./service"
    )]
    Exec(ExecArgs),

    #[command(about = "Check the Docker engine and configuration")]
    Health(HealthArgs),
}

/// Build context and recipe selection shared by every command.
#[derive(Args, Debug, Clone)]
pub struct ContextArgs {
    #[arg(value_name = "CONTEXT", help = "Build context directory (defaults to current directory)")]
    pub context: Option<PathBuf>,

    #[arg(
        short = 'r',
        long,
        value_name = "FILE",
        help = "Recipe file (defaults to PYBOX_RECIPE or pybox.yaml in the context)"
    )]
    pub recipe: Option<PathBuf>,

    #[arg(long, value_name = "OS/ARCH", help = "Target platform, e.g. linux/arm64")]
    pub platform: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct PlanArgs {
    #[command(flatten)]
    pub context: ContextArgs,

    #[arg(short = 'f', long, value_enum, default_value = "human", help = "Output format")]
    pub format: OutputFormatArg,
}

#[derive(Args, Debug, Clone)]
pub struct BuildArgs {
    #[command(flatten)]
    pub context: ContextArgs,

    #[arg(short = 't', long, value_name = "TAG", help = "Image tag (defaults to <project>:latest)")]
    pub tag: Option<String>,

    #[arg(long, help = "Rebuild every stage")]
    pub no_cache: bool,

    #[arg(short = 'f', long, value_enum, default_value = "human", help = "Output format")]
    pub format: OutputFormatArg,
}

#[derive(Args, Debug, Clone)]
pub struct LlbArgs {
    #[command(flatten)]
    pub context: ContextArgs,

    #[arg(
        short = 'o',
        long,
        value_name = "FILE",
        help = "Write the definition to a file instead of stdout"
    )]
    pub output: Option<PathBuf>,

    #[arg(
        long,
        value_name = "FILE",
        help = "Write the containerimage.config exporter attribute (entrypoint, env, workdir) to a file"
    )]
    pub image_config: Option<PathBuf>,

    #[arg(long, help = "Print a readable op listing instead of the encoded definition")]
    pub describe: bool,
}

#[derive(Args, Debug, Clone)]
pub struct DockerfileArgs {
    #[command(flatten)]
    pub context: ContextArgs,

    #[arg(long, help = "Use COPY --link for the source layer")]
    pub link: bool,

    #[arg(short = 'o', long, value_name = "FILE", help = "Write to a file instead of stdout")]
    pub output: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    #[command(flatten)]
    pub context: ContextArgs,

    #[arg(short = 't', long, value_name = "TAG", help = "Image to run (defaults to <project>:latest)")]
    pub tag: Option<String>,

    #[arg(long, value_name = "NAME", help = "Container name")]
    pub name: Option<String>,

    #[arg(
        long,
        value_name = "FILE",
        help = "Config file bound read-only into the working directory"
    )]
    pub config: Option<PathBuf>,

    #[arg(
        long = "volume",
        value_name = "HOST:CONTAINER",
        value_parser = parse_volume,
        help = "Bind a host directory onto a declared volume"
    )]
    pub volumes: Vec<(PathBuf, String)>,

    #[arg(last = true, hide = true, value_name = "ARGS")]
    pub extra: Vec<String>,
}

#[derive(Args, Debug, Clone)]
pub struct ExecArgs {
    #[command(flatten)]
    pub context: ContextArgs,

    #[arg(
        long,
        value_name = "DIR",
        help = "Working directory (defaults to the context directory laid out like the image workdir)"
    )]
    pub workdir: Option<PathBuf>,

    #[arg(last = true, hide = true, value_name = "ARGS")]
    pub extra: Vec<String>,
}

#[derive(Args, Debug, Clone)]
pub struct HealthArgs {
    #[arg(short = 'f', long, value_enum, default_value = "human", help = "Output format")]
    pub format: OutputFormatArg,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormatArg {
    Json,
    Yaml,
    Human,
}

impl From<OutputFormatArg> for super::output::OutputFormat {
    fn from(arg: OutputFormatArg) -> Self {
        match arg {
            OutputFormatArg::Json => super::output::OutputFormat::Json,
            OutputFormatArg::Yaml => super::output::OutputFormat::Yaml,
            OutputFormatArg::Human => super::output::OutputFormat::Human,
        }
    }
}

fn parse_volume(s: &str) -> Result<(PathBuf, String), String> {
    let (host, target) = s
        .rsplit_once(':')
        .ok_or_else(|| format!("Invalid volume '{}', expected HOST:CONTAINER", s))?;
    if host.is_empty() || !target.starts_with('/') {
        return Err(format!(
            "Invalid volume '{}', expected a host path and an absolute container path",
            s
        ));
    }
    Ok((PathBuf::from(host), target.to_string()))
}
