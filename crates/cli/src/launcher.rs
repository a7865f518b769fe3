//! Foreground runner for the entrypoint command.
//!
//! `NotStarted -> Running -> Terminated`. The child inherits stdio, gets the recipe's
//! environment over the inherited one and starts in the working directory. SIGINT and
//! SIGTERM received while it runs are passed on to it; its exit status comes back unchanged.

use pybox_core::{EntrypointCommand, EnvironmentSet, Recipe};
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use thiserror::Error;
use tokio::process::Command;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("The entrypoint has already been started")]
    AlreadyStarted,

    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed waiting for the entrypoint: {0}")]
    Wait(#[source] std::io::Error),

    #[error("Failed to install signal handler: {0}")]
    Signal(#[source] std::io::Error),
}

/// How the entrypoint process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Exited(i32),
    Signaled(i32),
}

impl Termination {
    pub fn from_status(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => Termination::Exited(code),
            (None, Some(signal)) => Termination::Signaled(signal),
            (None, None) => Termination::Exited(1),
        }
    }

    /// Shell convention: the exit code itself, or 128 + signal number.
    pub fn exit_code(&self) -> i32 {
        match self {
            Termination::Exited(code) => *code,
            Termination::Signaled(signal) => 128 + signal,
        }
    }

    pub fn success(&self) -> bool {
        *self == Termination::Exited(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LauncherState {
    NotStarted,
    Running { pid: u32 },
    Terminated(Termination),
}

pub struct Launcher {
    command: EntrypointCommand,
    workdir: PathBuf,
    env: EnvironmentSet,
    state: LauncherState,
}

impl Launcher {
    pub fn new(command: EntrypointCommand, workdir: impl Into<PathBuf>, env: EnvironmentSet) -> Self {
        Self {
            command,
            workdir: workdir.into(),
            env,
            state: LauncherState::NotStarted,
        }
    }

    pub fn from_recipe(recipe: &Recipe, workdir: &Path) -> Self {
        Self::new(recipe.entrypoint_command(), workdir, recipe.environment())
    }

    pub fn state(&self) -> LauncherState {
        self.state
    }

    pub fn command(&self) -> &EntrypointCommand {
        &self.command
    }

    fn build_command(&self) -> Command {
        let mut cmd = Command::new(self.command.interpreter());
        cmd.arg("-m")
            .arg(self.command.module())
            .current_dir(&self.workdir)
            .envs(self.env.iter())
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        cmd
    }

    /// Start the entrypoint and wait for it. Only the first call may start it.
    pub async fn run(&mut self) -> Result<Termination, LaunchError> {
        if self.state != LauncherState::NotStarted {
            return Err(LaunchError::AlreadyStarted);
        }

        let mut sigint = signal(SignalKind::interrupt()).map_err(LaunchError::Signal)?;
        let mut sigterm = signal(SignalKind::terminate()).map_err(LaunchError::Signal)?;

        let mut child = self
            .build_command()
            .spawn()
            .map_err(|source| LaunchError::Spawn {
                program: self.command.to_string(),
                source,
            })?;
        let pid = child.id().unwrap_or_default();
        self.state = LauncherState::Running { pid };
        info!(pid, command = %self.command, workdir = %self.workdir.display(), "Entrypoint started");

        let status = loop {
            tokio::select! {
                status = child.wait() => break status.map_err(LaunchError::Wait)?,
                _ = sigint.recv() => forward(pid, libc::SIGINT),
                _ = sigterm.recv() => forward(pid, libc::SIGTERM),
            }
        };

        let termination = Termination::from_status(status);
        self.state = LauncherState::Terminated(termination);
        debug!(?termination, "Entrypoint terminated");
        Ok(termination)
    }
}

fn forward(pid: u32, signal: i32) {
    if pid == 0 {
        return;
    }
    debug!(pid, signal, "Forwarding signal to entrypoint");
    // SAFETY: kill(2) takes plain integers and touches no memory of ours.
    let rc = unsafe { libc::kill(pid as libc::pid_t, signal) };
    if rc != 0 {
        warn!(
            "Failed to forward signal {} to {}: {}",
            signal,
            pid,
            std::io::Error::last_os_error()
        );
    }
}
