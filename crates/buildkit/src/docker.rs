//! Docker engine backend (bollard).

use crate::assembler::{BaseResolution, StageExecutor, StageOutput, StageRequest};
use crate::graph::Stage;
use crate::image_config::ImageConfig;
use crate::progress::ProgressTracker;
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::{BuildImageOptions, CreateImageOptions, TagImageOptions};
use bollard::models::HostConfig;
use bollard::Docker;
use bytes::Bytes;
use futures_util::stream::StreamExt;
use pybox_core::{BuildError, ImageReference};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

const DOCKER_SOCKET_PATH: &str = "/var/run/docker.sock";

/// Check that a Docker daemon answers on the local socket.
pub async fn check_docker() -> anyhow::Result<Option<String>> {
    if !Path::new(DOCKER_SOCKET_PATH).exists() && std::env::var_os("DOCKER_HOST").is_none() {
        debug!("Docker socket not found at {}", DOCKER_SOCKET_PATH);
        return Ok(None);
    }

    let docker = match Docker::connect_with_local_defaults() {
        Ok(d) => d,
        Err(e) => {
            debug!("Failed to connect to Docker: {}", e);
            return Ok(None);
        }
    };

    match docker.version().await {
        Ok(v) => {
            let api_version = v.api_version.unwrap_or_else(|| "0.0".to_string());
            debug!("Docker API version: {}", api_version);
            Ok(Some(api_version))
        }
        Err(e) => {
            debug!("Failed to get Docker version: {}", e);
            Ok(None)
        }
    }
}

fn is_not_found(err: &DockerError) -> bool {
    matches!(
        err,
        DockerError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

pub struct DockerExecutor {
    docker: Docker,
    platform: String,
    pull_timeout: Duration,
    quiet: bool,
    verbose: bool,
}

impl DockerExecutor {
    pub fn connect(platform: &str, pull_timeout: Duration) -> anyhow::Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| anyhow::anyhow!("Failed to connect to Docker: {}", e))?;
        Ok(Self {
            docker,
            platform: platform.to_string(),
            pull_timeout,
            quiet: false,
            verbose: false,
        })
    }

    pub fn with_output(mut self, quiet: bool, verbose: bool) -> Self {
        self.quiet = quiet;
        self.verbose = verbose;
        self
    }

    pub fn docker(&self) -> &Docker {
        &self.docker
    }

    async fn pull(&self, image: &ImageReference, platform: &str) -> Result<(), String> {
        let options = CreateImageOptions {
            from_image: image.canonical(),
            platform: platform.to_string(),
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(item) = stream.next().await {
            let info = item.map_err(|e| e.to_string())?;
            if let Some(error) = info.error {
                return Err(error);
            }
            if let Some(status) = info.status {
                debug!("Pull {}: {}", image, status);
            }
        }
        Ok(())
    }

    /// Map an engine failure to the error the stage stands for.
    fn stage_error(stage: Stage, base: &str, message: String) -> BuildError {
        match stage {
            Stage::Base => BuildError::BaseImageUnresolvable {
                reference: base.to_string(),
                message,
            },
            Stage::Dependencies => BuildError::DependencyInstall { message },
            Stage::Runtime => BuildError::Backend(message),
        }
    }
}

#[async_trait]
impl StageExecutor for DockerExecutor {
    async fn resolve_base(
        &self,
        image: &ImageReference,
        platform: &str,
    ) -> Result<BaseResolution, BuildError> {
        let reference = image.canonical();
        match self.docker.inspect_image(&reference).await {
            Ok(inspect) => {
                debug!("Base image {} present locally", reference);
                return Ok(BaseResolution {
                    pulled: false,
                    image_id: inspect.id,
                });
            }
            Err(e) if is_not_found(&e) => {}
            Err(e) => return Err(BuildError::backend(e)),
        }

        info!("Pulling base image {}", reference);
        let unresolvable = |message: String| BuildError::BaseImageUnresolvable {
            reference: image.as_written().to_string(),
            message,
        };
        match tokio::time::timeout(self.pull_timeout, self.pull(image, platform)).await {
            Ok(Ok(())) => {}
            Ok(Err(message)) => return Err(unresolvable(message)),
            Err(_) => {
                return Err(unresolvable(format!(
                    "pull timed out after {}s",
                    self.pull_timeout.as_secs()
                )))
            }
        }

        let inspect = self
            .docker
            .inspect_image(&reference)
            .await
            .map_err(|e| unresolvable(e.to_string()))?;
        Ok(BaseResolution {
            pulled: true,
            image_id: inspect.id,
        })
    }

    async fn contains(&self, artifact: &str) -> Result<bool, BuildError> {
        match self.docker.inspect_image(artifact).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(BuildError::backend(e)),
        }
    }

    async fn execute(&self, request: &StageRequest) -> Result<StageOutput, BuildError> {
        let tracker = ProgressTracker::new(self.quiet, self.verbose);
        tracker.build_started(request.stage.as_str(), &request.artifact);

        let options = BuildImageOptions {
            dockerfile: "Dockerfile".to_string(),
            t: request.artifact.clone(),
            target: request.stage.as_str().to_string(),
            pull: false,
            rm: true,
            forcerm: true,
            platform: self.platform.clone(),
            ..Default::default()
        };
        let body = Bytes::from(request.context.bytes.clone());
        let mut stream = self.docker.build_image(options, None, Some(body));

        while let Some(item) = stream.next().await {
            match item {
                Ok(info) => tracker.process_info(&info),
                Err(e) => {
                    tracker.build_failed(&e.to_string());
                    return Err(Self::stage_error(request.stage, &request.from, e.to_string()));
                }
            }
        }

        let summary = tracker.summary();
        if let Some(error) = summary.error {
            tracker.build_failed(&error);
            let mut message = error;
            if !summary.tail.is_empty() {
                message.push('\n');
                message.push_str(&summary.tail.join("\n"));
            }
            return Err(Self::stage_error(request.stage, &request.from, message));
        }

        let inspect = self
            .docker
            .inspect_image(&request.artifact)
            .await
            .map_err(BuildError::backend)?;
        let image_id = inspect.id.or(summary.image_id);
        tracker.build_completed(
            image_id.as_deref().unwrap_or("<unknown>"),
            inspect.size.unwrap_or_default().max(0) as u64,
        );
        Ok(StageOutput { image_id })
    }

    async fn finalize(
        &self,
        artifact: &str,
        tag: &str,
        expected: &ImageConfig,
    ) -> Result<(), BuildError> {
        let (repo, tag_name) = split_tag(tag);
        self.docker
            .tag_image(
                artifact,
                Some(TagImageOptions {
                    repo: repo.to_string(),
                    tag: tag_name.to_string(),
                }),
            )
            .await
            .map_err(BuildError::backend)?;

        let inspect = self
            .docker
            .inspect_image(tag)
            .await
            .map_err(BuildError::backend)?;
        let config = inspect.config.unwrap_or_default();
        expected
            .verify(
                &config.entrypoint.unwrap_or_default(),
                &config.cmd.unwrap_or_default(),
                &config.env.unwrap_or_default(),
                config.working_dir.as_deref().unwrap_or_default(),
            )
            .map_err(BuildError::backend)?;
        info!("Tagged {} as {}", artifact, tag);
        Ok(())
    }
}

/// `repo[:tag]` split on the last colon that is not part of a registry port.
pub fn split_tag(reference: &str) -> (&str, &str) {
    match reference.rfind(':') {
        Some(i) if !reference[i + 1..].contains('/') => (&reference[..i], &reference[i + 1..]),
        _ => (reference, "latest"),
    }
}

/// Options for running a built image.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub image: String,
    pub name: Option<String>,
    /// Host file bound read-only into the working directory.
    pub config_file: Option<PathBuf>,
    /// Host directories bound onto the declared volumes, in order.
    pub volume_dirs: Vec<(PathBuf, String)>,
    pub workdir: String,
}

impl RunOptions {
    pub fn binds(&self) -> Vec<String> {
        let mut binds = Vec::new();
        if let Some(file) = &self.config_file {
            let name = file
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "config".to_string());
            binds.push(format!(
                "{}:{}/{}:ro",
                file.display(),
                self.workdir.trim_end_matches('/'),
                name
            ));
        }
        for (host, target) in &self.volume_dirs {
            binds.push(format!("{}:{}", host.display(), target));
        }
        binds
    }
}

/// Run the image in the foreground and return its exit status.
///
/// The container keeps the image's entrypoint and gets no command. Ctrl-C is forwarded as
/// SIGTERM; the container is removed once it has stopped.
pub async fn run_container(docker: &Docker, options: &RunOptions) -> anyhow::Result<i64> {
    let name = options
        .name
        .clone()
        .unwrap_or_else(|| format!("pybox-{}", uuid::Uuid::new_v4()));
    let binds = options.binds();

    let host_config = HostConfig {
        binds: (!binds.is_empty()).then_some(binds),
        ..Default::default()
    };
    let config = Config {
        image: Some(options.image.clone()),
        host_config: Some(host_config),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        ..Default::default()
    };

    let created = docker
        .create_container(
            Some(CreateContainerOptions {
                name: name.clone(),
                platform: None,
            }),
            config,
        )
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create container from {}: {}", options.image, e))?;
    let id = created.id;
    info!("Created container {} ({})", name, id);

    let result = drive_container(docker, &id).await;

    if let Err(e) = docker
        .remove_container(
            &id,
            Some(RemoveContainerOptions {
                force: true,
                ..Default::default()
            }),
        )
        .await
    {
        warn!("Failed to remove container {}: {}", id, e);
    }
    result
}

async fn drive_container(docker: &Docker, id: &str) -> anyhow::Result<i64> {
    docker
        .start_container(id, None::<StartContainerOptions<String>>)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to start container {}: {}", id, e))?;

    let logs = {
        let docker = docker.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            let mut stream = docker.logs(
                &id,
                Some(LogsOptions::<String> {
                    follow: true,
                    stdout: true,
                    stderr: true,
                    ..Default::default()
                }),
            );
            let mut stdout = tokio::io::stdout();
            let mut stderr = tokio::io::stderr();
            while let Some(item) = stream.next().await {
                let written = match item {
                    Ok(LogOutput::StdErr { message }) => stderr.write_all(&message).await,
                    Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                        stdout.write_all(&message).await
                    }
                    Ok(LogOutput::StdIn { .. }) => Ok(()),
                    Err(e) => {
                        debug!("Log stream ended: {}", e);
                        break;
                    }
                };
                if written.is_err() {
                    break;
                }
            }
            let _ = stdout.flush().await;
            let _ = stderr.flush().await;
        })
    };

    let mut wait = docker.wait_container(id, None::<WaitContainerOptions<String>>);
    let status = loop {
        tokio::select! {
            item = wait.next() => {
                break match item {
                    Some(Ok(response)) => response.status_code,
                    Some(Err(DockerError::DockerContainerWaitError { code, .. })) => code,
                    Some(Err(e)) => return Err(anyhow::anyhow!("Failed waiting for container {}: {}", id, e)),
                    None => return Err(anyhow::anyhow!("Container {} wait stream ended early", id)),
                };
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, sending SIGTERM to container {}", id);
                if let Err(e) = docker
                    .kill_container(id, Some(KillContainerOptions { signal: "SIGTERM" }))
                    .await
                {
                    warn!("Failed to signal container {}: {}", id, e);
                }
            }
        }
    };

    let _ = logs.await;
    debug!("Container {} exited with {}", id, status);
    Ok(status)
}
