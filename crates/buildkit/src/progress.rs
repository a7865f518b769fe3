use bollard::models::BuildInfo;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tracing::{debug, error, info};

const TAIL_LINES: usize = 20;

struct ProgressState {
    total_steps: usize,
    total_started: usize,
    total_cached: usize,
    total_errored: usize,
    current_step: Option<String>,
    image_id: Option<String>,
    tail: VecDeque<String>,
    error: Option<String>,
}

impl ProgressState {
    fn new() -> Self {
        Self {
            total_steps: 0,
            total_started: 0,
            total_cached: 0,
            total_errored: 0,
            current_step: None,
            image_id: None,
            tail: VecDeque::with_capacity(TAIL_LINES),
            error: None,
        }
    }

    fn remember(&mut self, line: &str) {
        if self.tail.len() == TAIL_LINES {
            self.tail.pop_front();
        }
        self.tail.push_back(line.to_string());
    }
}

/// Summary of one engine build stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamSummary {
    pub steps: usize,
    pub started: usize,
    pub cached: usize,
    pub errored: usize,
    pub image_id: Option<String>,
    pub error: Option<String>,
    /// Last output lines, for error reports.
    pub tail: Vec<String>,
}

/// Follows the JSON message stream of a Docker engine build.
pub struct ProgressTracker {
    start_time: Instant,
    quiet: bool,
    verbose: bool,
    state: Arc<Mutex<ProgressState>>,
}

impl ProgressTracker {
    pub fn new(quiet: bool, verbose: bool) -> Self {
        Self {
            start_time: Instant::now(),
            quiet,
            verbose,
            state: Arc::new(Mutex::new(ProgressState::new())),
        }
    }

    fn state(&self) -> MutexGuard<'_, ProgressState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn build_started(&self, stage: &str, tag: &str) {
        if !self.quiet {
            info!("Building stage {} as {}", stage, tag);
        }
        debug!("Build started");
    }

    pub fn process_info(&self, info: &BuildInfo) {
        if let Some(stream) = &info.stream {
            for line in stream.lines() {
                self.process_line(line);
            }
        }

        if let Some(status) = &info.status {
            if self.verbose {
                info!(
                    "  {} {}",
                    status,
                    info.progress.as_deref().unwrap_or_default()
                );
            }
            debug!("Engine status {}", status);
        }

        if let Some(id) = info.aux.as_ref().and_then(|aux| aux.id.clone()) {
            self.state().image_id = Some(id);
        }

        let message = info.error.clone().or_else(|| {
            info.error_detail
                .as_ref()
                .and_then(|detail| detail.message.clone())
        });
        if let Some(message) = message {
            self.record_error(&message);
        }
    }

    /// One line of classic builder output.
    pub fn process_line(&self, line: &str) {
        let line = line.trim_end();
        if line.trim().is_empty() {
            return;
        }
        let mut state = self.state();
        let trimmed = line.trim();

        if let Some(rest) = trimmed.strip_prefix("Step ") {
            if let Some((counter, instruction)) = rest.split_once(" : ") {
                state.total_started += 1;
                if let Some((_, total)) = counter.split_once('/') {
                    if let Ok(total) = total.trim().parse::<usize>() {
                        state.total_steps = total;
                    }
                }
                state.current_step = Some(instruction.to_string());
                if !self.quiet {
                    info!("Started [{}] {}", counter, instruction);
                }
                return;
            }
        }

        if trimmed == "---> Using cache" {
            state.total_cached += 1;
            if !self.quiet {
                info!(
                    "  CACHED {}",
                    state.current_step.as_deref().unwrap_or("<unknown>")
                );
            }
            return;
        }

        if let Some(id) = trimmed.strip_prefix("Successfully built ") {
            state.image_id = Some(id.to_string());
            debug!("Engine reports image {}", id);
            return;
        }

        if trimmed.starts_with("--->") || trimmed.starts_with("Successfully tagged") {
            debug!("{}", trimmed);
            return;
        }

        state.remember(line);
        if !self.quiet {
            info!("  {}", line);
        } else {
            debug!("  {}", line);
        }
    }

    fn record_error(&self, message: &str) {
        let mut state = self.state();
        if state.error.is_none() {
            state.total_errored += 1;
            error!(
                "  ERROR {} - {}",
                state.current_step.as_deref().unwrap_or("<unknown>"),
                message.trim_end()
            );
            state.error = Some(message.trim_end().to_string());
        }
    }

    pub fn summary(&self) -> StreamSummary {
        let state = self.state();
        StreamSummary {
            steps: state.total_steps,
            started: state.total_started,
            cached: state.total_cached,
            errored: state.total_errored,
            image_id: state.image_id.clone(),
            error: state.error.clone(),
            tail: state.tail.iter().cloned().collect(),
        }
    }

    pub fn build_completed(&self, image_id: &str, size_bytes: u64) {
        let duration = self.start_time.elapsed();
        let state = self.state();

        if !self.quiet {
            info!("Stage built in {:.2}s", duration.as_secs_f64());
            info!("  Image ID {}", image_id);
            if size_bytes > 0 {
                info!("  Size {:.2} MB", size_bytes as f64 / 1024.0 / 1024.0);
            }
            info!(
                "  Steps {} started, {} cached, {} errors",
                state.total_started, state.total_cached, state.total_errored
            );

            if state.total_cached > 0 && state.total_started > 0 {
                let cache_ratio = (state.total_cached as f64 / state.total_started as f64) * 100.0;
                info!("  Cache hit ratio {:.1}%", cache_ratio);
            }
        }

        debug!(
            "Build completed in {:?} - {} ({} bytes)",
            duration, image_id, size_bytes
        );
    }

    pub fn build_failed(&self, error: &str) {
        let duration = self.start_time.elapsed();
        let state = self.state();

        error!("Build failed after {:.2}s", duration.as_secs_f64());
        error!("  Error {}", error);

        if let Some(step) = &state.current_step {
            error!("  While running {}", step);
        }

        debug!("Build failed in {:?} - {}", duration, error);
    }
}
