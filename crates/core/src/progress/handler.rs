//! Progress handler trait and events

use crate::error::ErrorKind;
use std::time::Duration;

/// Events emitted while an image is assembled
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    /// Build started
    Started { project: String, context: String },

    /// Base image located (locally or after a pull)
    BaseResolved {
        reference: String,
        pulled: bool,
        duration: Duration,
    },

    /// A copy layer was materialised into the layer store
    LayerWritten {
        node: String,
        digest: String,
        size: u64,
    },

    /// Stage execution started
    StageStarted { stage: String, cache_key: String },

    /// Stage skipped because its artifact for the same key already exists
    StageCached { stage: String, cache_key: String },

    /// Stage execution completed
    StageCompleted {
        stage: String,
        cache_key: String,
        duration: Duration,
    },

    /// Build completed successfully
    Completed {
        image: String,
        executed: usize,
        cached: usize,
        total_time: Duration,
    },

    /// Build failed
    Failed {
        stage: Option<String>,
        kind: ErrorKind,
        error: String,
    },
}

/// Trait for handling progress events during a build
pub trait ProgressHandler: Send + Sync {
    /// Called when a progress event occurs
    fn on_progress(&self, event: &ProgressEvent);
}

/// No-op handler that ignores all events
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpHandler;

impl ProgressHandler for NoOpHandler {
    fn on_progress(&self, _event: &ProgressEvent) {}
}
