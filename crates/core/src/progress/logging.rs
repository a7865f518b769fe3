//! Logging-based progress handler

use super::{ProgressEvent, ProgressHandler};
use tracing::{debug, error, info};

/// Handler that logs progress events using tracing
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHandler;

impl ProgressHandler for LoggingHandler {
    fn on_progress(&self, event: &ProgressEvent) {
        match event {
            ProgressEvent::Started { project, context } => {
                info!(project = %project, context = %context, "Starting build");
            }
            ProgressEvent::BaseResolved {
                reference,
                pulled,
                duration,
            } => {
                info!(
                    image = %reference,
                    pulled,
                    duration_ms = duration.as_millis(),
                    "Base image resolved"
                );
            }
            ProgressEvent::LayerWritten { node, digest, size } => {
                debug!(node = %node, digest = %digest, size, "Layer written");
            }
            ProgressEvent::StageStarted { stage, cache_key } => {
                info!(stage = %stage, key = %short(cache_key), "Building stage");
            }
            ProgressEvent::StageCached { stage, cache_key } => {
                info!(stage = %stage, key = %short(cache_key), "Stage cached");
            }
            ProgressEvent::StageCompleted {
                stage,
                cache_key,
                duration,
            } => {
                info!(
                    stage = %stage,
                    key = %short(cache_key),
                    duration_ms = duration.as_millis(),
                    "Stage complete"
                );
            }
            ProgressEvent::Completed {
                image,
                executed,
                cached,
                total_time,
            } => {
                info!(
                    image = %image,
                    executed,
                    cached,
                    total_time_ms = total_time.as_millis(),
                    "Build complete"
                );
            }
            ProgressEvent::Failed { stage, kind, error } => {
                error!(
                    stage = stage.as_deref().unwrap_or("-"),
                    kind = %kind,
                    error = %error,
                    "Build failed"
                );
            }
        }
    }
}

fn short(key: &str) -> &str {
    let hex = key.split_once(':').map(|(_, h)| h).unwrap_or(key);
    &hex[..hex.len().min(12)]
}
