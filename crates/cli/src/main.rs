use pybox_buildkit::dockerfile::{self, ContextLayout, DockerfileOptions};
use pybox_buildkit::{
    check_docker, default_tag, run_container, Assembler, BuildOptions, BuildPlan, BuildStrategy,
    DockerExecutor, LLBBuilder, PyboxStrategy, RunOptions,
};
use pybox_cli::cli::commands::{
    BuildArgs, CliArgs, Commands, ContextArgs, DockerfileArgs, ExecArgs, HealthArgs, LlbArgs,
    PlanArgs, RunArgs,
};
use pybox_cli::cli::output::{HealthStatus, OutputFormat, OutputFormatter};
use pybox_cli::launcher::Launcher;
use pybox_cli::{NAME, VERSION};
use pybox_core::{BuildError, LoggingHandler, PyboxConfig, Recipe};

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const EXIT_FAILURE: i32 = 1;
const EXIT_USAGE: i32 = 2;

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();
    init_logging_from_args(&args);

    debug!("{} v{} starting", NAME, VERSION);
    debug!("Arguments: {:?}", args);

    let exit_code = match &args.command {
        Commands::Plan(plan_args) => handle_plan(plan_args),
        Commands::Build(build_args) => handle_build(build_args, args.quiet, args.verbose).await,
        Commands::Llb(llb_args) => handle_llb(llb_args),
        Commands::Dockerfile(dockerfile_args) => handle_dockerfile(dockerfile_args),
        Commands::Run(run_args) => handle_run(run_args).await,
        Commands::Exec(exec_args) => handle_exec(exec_args).await,
        Commands::Health(health_args) => handle_health(health_args).await,
    };

    process::exit(exit_code);
}

fn init_logging_from_args(args: &CliArgs) {
    use std::sync::Once;
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let level = if let Some(level_str) = &args.log_level {
            parse_level(level_str)
        } else if args.verbose {
            Level::DEBUG
        } else if args.quiet {
            Level::ERROR
        } else {
            let level_str = env::var("PYBOX_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
            parse_level(&level_str)
        };

        let mut filter = EnvFilter::from_default_env();

        if env::var("RUST_LOG").is_err() {
            for directive in [
                format!("pybox={}", level),
                "bollard=warn".to_string(),
                "hyper=warn".to_string(),
                "h2=warn".to_string(),
            ] {
                if let Ok(directive) = directive.parse() {
                    filter = filter.add_directive(directive);
                }
            }
        }

        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    });
}

fn parse_level(level_str: &str) -> Level {
    match level_str.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => {
            eprintln!(
                "Invalid log level '{}', defaulting to INFO. Valid levels: trace, debug, info, warn, error",
                level_str
            );
            Level::INFO
        }
    }
}

/// Resolved context directory, recipe and process config for one command.
struct Project {
    context: PathBuf,
    recipe: Recipe,
    config: PyboxConfig,
}

fn load_project(args: &ContextArgs) -> Result<Project> {
    let mut config = PyboxConfig::default();
    if let Some(platform) = &args.platform {
        config.platform = platform.clone();
    }
    config.validate()?;

    let context = args
        .context
        .clone()
        .unwrap_or_else(|| PathBuf::from("."));
    if !context.is_dir() {
        bail!("Context is not a directory: {}", context.display());
    }
    let context = context
        .canonicalize()
        .with_context(|| format!("Failed to resolve context {}", context.display()))?;
    debug!("Context: {}", context.display());

    let recipe_path = args
        .recipe
        .clone()
        .unwrap_or_else(|| config.recipe_path(&context));
    let recipe = if recipe_path.exists() {
        debug!("Loading recipe {}", recipe_path.display());
        Recipe::load(&recipe_path).map_err(BuildError::from)?
    } else if args.recipe.is_some() {
        bail!("Recipe not found: {}", recipe_path.display());
    } else {
        info!(
            "No recipe at {}, using defaults",
            recipe_path.display()
        );
        Recipe::default()
    };
    recipe.validate().map_err(BuildError::from)?;

    Ok(Project {
        context,
        recipe,
        config,
    })
}

fn fail(err: anyhow::Error) -> i32 {
    match err.downcast_ref::<BuildError>() {
        Some(build_error) => error!("{} error: {}", build_error.kind(), build_error),
        None => error!("{:#}", err),
    }
    EXIT_FAILURE
}

fn emit(output: &str, file: Option<&Path>) -> Result<()> {
    match file {
        Some(path) => {
            fs::write(path, output)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            info!("Output written to: {}", path.display());
        }
        None => println!("{}", output.trim_end()),
    }
    Ok(())
}

fn handle_plan(args: &PlanArgs) -> i32 {
    let result = (|| -> Result<String> {
        let project = load_project(&args.context)?;
        let plan = BuildPlan::prepare(&project.context, project.recipe, &project.config.platform)?;
        OutputFormatter::new(args.format.into()).format_plan(&plan.summary())
    })();

    match result.and_then(|out| emit(&out, None)) {
        Ok(()) => 0,
        Err(e) => fail(e),
    }
}

async fn handle_build(args: &BuildArgs, quiet: bool, verbose: bool) -> i32 {
    info!("Starting build");

    let project = match load_project(&args.context) {
        Ok(p) => p,
        Err(e) => return fail(e),
    };

    let executor = match DockerExecutor::connect(
        &project.config.platform,
        Duration::from_secs(project.config.pull_timeout_secs),
    ) {
        Ok(executor) => executor.with_output(quiet, verbose),
        Err(e) => {
            error!("{:#}", e);
            eprintln!("\nRun 'pybox health' to check the Docker engine.");
            return EXIT_FAILURE;
        }
    };

    let assembler = Assembler::new(executor, project.config, Arc::new(LoggingHandler));
    let options = BuildOptions {
        tag: args.tag.clone(),
        no_cache: args.no_cache,
    };

    let report = match assembler
        .build(&project.context, &project.recipe, &options)
        .await
    {
        Ok(report) => report,
        Err(e) => return fail(e.into()),
    };

    let format: OutputFormat = args.format.into();
    if quiet && format == OutputFormat::Human {
        return 0;
    }
    match OutputFormatter::new(format)
        .format_build(&report)
        .and_then(|out| emit(&out, None))
    {
        Ok(()) => 0,
        Err(e) => fail(e),
    }
}

fn handle_llb(args: &LlbArgs) -> i32 {
    let result = (|| -> Result<()> {
        let project = load_project(&args.context)?;
        let plan = BuildPlan::prepare(&project.context, project.recipe, &project.config.platform)?;

        let mut builder = LLBBuilder::new("context").with_platform(&plan.platform);
        PyboxStrategy.build_graph(&mut builder, &plan)?;
        let image_config = PyboxStrategy
            .image_config(&plan)
            .exporter_attr(&plan.platform)?;

        if let Some(path) = &args.image_config {
            fs::write(path, &image_config)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            info!("Image config written to {}", path.display());
        }

        if args.describe {
            let listing = format!("{}CONFIG {}\n", builder.describe(), image_config);
            return emit(&listing, args.output.as_deref());
        }

        let bytes = builder.to_bytes()?;
        match &args.output {
            Some(path) => {
                fs::write(path, &bytes)
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                info!("LLB definition ({} bytes) written to {}", bytes.len(), path.display());
            }
            None => {
                let mut stdout = std::io::stdout().lock();
                stdout.write_all(&bytes).context("Failed to write LLB to stdout")?;
                stdout.flush()?;
            }
        }
        Ok(())
    })();

    match result {
        Ok(()) => 0,
        Err(e) => fail(e),
    }
}

fn handle_dockerfile(args: &DockerfileArgs) -> i32 {
    let result = (|| -> Result<()> {
        let project = load_project(&args.context)?;
        let options = DockerfileOptions {
            layout: ContextLayout::project(&project.recipe),
            link: args.link,
        };
        let rendered = dockerfile::render(&project.recipe, &options)?;
        emit(&rendered, args.output.as_deref())
    })();

    match result {
        Ok(()) => 0,
        Err(e) => fail(e),
    }
}

/// The entrypoint takes no arguments; anything after `--` is a usage error.
fn reject_extra_args(context: &ContextArgs, extra: &[String]) -> i32 {
    let entrypoint = load_project(context)
        .map(|p| p.recipe.entrypoint_command().to_string())
        .unwrap_or_else(|_| "<interpreter> -m <module>".to_string());
    eprintln!(
        "error: extra arguments are not accepted ({}); the entrypoint is fixed to `{}`",
        extra.join(" "),
        entrypoint
    );
    EXIT_USAGE
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(env::current_dir()
            .context("Failed to get current directory")?
            .join(path))
    }
}

async fn handle_run(args: &RunArgs) -> i32 {
    if !args.extra.is_empty() {
        return reject_extra_args(&args.context, &args.extra);
    }

    match run_image(args).await {
        Ok(status) => {
            debug!("Container exited with {}", status);
            status as i32
        }
        Err(e) => fail(e),
    }
}

async fn run_image(args: &RunArgs) -> Result<i64> {
    let project = load_project(&args.context)?;
    let image = args
        .tag
        .clone()
        .unwrap_or_else(|| default_tag(&project.recipe.project_name(&project.context)));

    let config_file = match &args.config {
        Some(path) => Some(
            path.canonicalize()
                .with_context(|| format!("Config file not found: {}", path.display()))?,
        ),
        None => None,
    };

    let mut volume_dirs = Vec::new();
    for (host, target) in &args.volumes {
        if !project.recipe.volumes.contains(target) {
            warn!("{} is not a declared volume of the image", target);
        }
        let host = absolute(host)?;
        fs::create_dir_all(&host)
            .with_context(|| format!("Failed to create {}", host.display()))?;
        volume_dirs.push((host, target.clone()));
    }

    let executor = DockerExecutor::connect(
        &project.config.platform,
        Duration::from_secs(project.config.pull_timeout_secs),
    )?;
    let options = RunOptions {
        image,
        name: args.name.clone(),
        config_file,
        volume_dirs,
        workdir: project.recipe.workdir.clone(),
    };
    info!("Running {}", options.image);
    run_container(executor.docker(), &options).await
}

async fn handle_exec(args: &ExecArgs) -> i32 {
    if !args.extra.is_empty() {
        return reject_extra_args(&args.context, &args.extra);
    }

    let project = match load_project(&args.context) {
        Ok(p) => p,
        Err(e) => return fail(e),
    };

    let workdir = match &args.workdir {
        Some(dir) => dir.clone(),
        None => project.recipe.host_workdir(&project.context).unwrap_or_else(|| {
            warn!(
                "source.path '{}' does not end with source.dest '{}', running from the context",
                project.recipe.source.path, project.recipe.source.dest
            );
            project.context.clone()
        }),
    };
    debug!("Exec workdir: {}", workdir.display());

    let mut launcher = Launcher::from_recipe(&project.recipe, &workdir);
    match launcher.run().await {
        Ok(termination) => {
            debug!(?termination, "Entrypoint finished");
            termination.exit_code()
        }
        Err(e) => fail(e.into()),
    }
}

async fn handle_health(args: &HealthArgs) -> i32 {
    info!("Checking pybox health");
    let mut health = BTreeMap::new();

    let config = PyboxConfig::default();
    let config_status = match config.validate() {
        Ok(()) => HealthStatus::available(format!(
            "platform {}, recipe {}",
            config.platform, config.recipe_file
        )),
        Err(e) => HealthStatus::unavailable(e.to_string())
            .with_details("Check the PYBOX_* environment variables".to_string()),
    };
    health.insert("config".to_string(), config_status);

    let cache_status = match fs::create_dir_all(&config.cache_dir) {
        Ok(()) => HealthStatus::available(format!("{} is writable", config.cache_dir.display())),
        Err(e) => HealthStatus::unavailable(format!(
            "Cannot create {}: {}",
            config.cache_dir.display(),
            e
        ))
        .with_details("Set PYBOX_CACHE_DIR to a writable directory".to_string()),
    };
    health.insert("cache".to_string(), cache_status);

    let docker_status = match check_docker().await {
        Ok(Some(api_version)) => {
            HealthStatus::available(format!("Docker engine API {}", api_version))
        }
        Ok(None) | Err(_) => HealthStatus::unavailable("Docker engine not reachable".to_string())
            .with_details("Start the Docker daemon or set DOCKER_HOST".to_string()),
    };
    health.insert("docker".to_string(), docker_status);

    let format: OutputFormat = args.format.into();
    match OutputFormatter::new(format).format_health(&health) {
        Ok(out) => println!("{}", out.trim_end()),
        Err(e) => return fail(e),
    }

    if health.values().all(|status| status.available) {
        0
    } else {
        EXIT_FAILURE
    }
}
