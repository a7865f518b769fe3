//! Output formatting for plans, build reports and health checks
//!
//! JSON and YAML render the serializable reports as-is; the human format is a short
//! aligned summary meant for terminals.

use anyhow::{Context, Result};
use pybox_buildkit::{BuildReport, PlanSummary, StageStatus};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write;

/// Output format enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// JSON format (machine-readable)
    Json,
    /// YAML format
    Yaml,
    /// Human-readable formatted text
    Human,
}

pub struct OutputFormatter {
    format: OutputFormat,
}

impl OutputFormatter {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    pub fn format_plan(&self, plan: &PlanSummary) -> Result<String> {
        match self.format {
            OutputFormat::Json => to_json(plan),
            OutputFormat::Yaml => to_yaml(plan),
            OutputFormat::Human => self.format_plan_human(plan),
        }
    }

    pub fn format_build(&self, report: &BuildReport) -> Result<String> {
        match self.format {
            OutputFormat::Json => to_json(report),
            OutputFormat::Yaml => to_yaml(report),
            OutputFormat::Human => self.format_build_human(report),
        }
    }

    pub fn format_health(&self, health: &BTreeMap<String, HealthStatus>) -> Result<String> {
        match self.format {
            OutputFormat::Json => to_json(health),
            OutputFormat::Yaml => to_yaml(health),
            OutputFormat::Human => self.format_health_human(health),
        }
    }

    fn format_plan_human(&self, plan: &PlanSummary) -> Result<String> {
        let mut out = String::new();
        writeln!(out, "Build Plan: {}", plan.project)?;
        writeln!(out, "{}\n", rule())?;
        writeln!(out, "Base image:   {}", plan.base_image)?;
        writeln!(out, "Platform:     {}", plan.platform)?;
        writeln!(out, "Workdir:      {}", plan.workdir)?;
        writeln!(out, "Entrypoint:   {}", plan.entrypoint.join(" "))?;
        writeln!(
            out,
            "Manifest:     {} requirement(s), {}",
            plan.requirements,
            plan.manifest.short(12)
        )?;
        writeln!(
            out,
            "Source:       {} file(s), {} bytes, {}",
            plan.source_files,
            plan.source_bytes,
            plan.source.short(12)
        )?;
        if !plan.env.is_empty() {
            writeln!(out, "Environment:")?;
            for var in &plan.env {
                writeln!(out, "  {}", var)?;
            }
        }
        if !plan.unpinned.is_empty() {
            writeln!(out, "\u{26A0} Unpinned requirements: {}", plan.unpinned.join(", "))?;
        }

        writeln!(out, "\nSteps:")?;
        let nodes = plan.graph.nodes();
        for (i, node) in nodes.iter().enumerate() {
            let connector = if i + 1 == nodes.len() {
                "\u{2514}\u{2500}"
            } else {
                "\u{251C}\u{2500}"
            };
            let parents = if node.parents.is_empty() {
                "-".to_string()
            } else {
                node.parents.join(", ")
            };
            writeln!(
                out,
                "{} {:<13} {:<13} {}  <- {}",
                connector,
                node.name,
                node.stage,
                node.cache_key.short(12),
                parents
            )?;
        }
        Ok(out)
    }

    fn format_build_human(&self, report: &BuildReport) -> Result<String> {
        let mut out = String::new();
        writeln!(out, "\u{2713} Built {}", report.image)?;
        writeln!(out, "{}\n", rule())?;
        for stage in &report.stages {
            let status = match stage.status {
                StageStatus::Built => "built",
                StageStatus::Cached => "cached",
            };
            writeln!(
                out,
                "{:<13} {:<7} {:>7} ms  {}",
                stage.stage.as_str(),
                status,
                stage.duration_ms,
                stage.artifact
            )?;
        }
        writeln!(
            out,
            "\n{} executed, {} cached in {:.2}s",
            report.executed(),
            report.cached(),
            report.duration_ms as f64 / 1000.0
        )?;
        Ok(out)
    }

    fn format_health_human(&self, health: &BTreeMap<String, HealthStatus>) -> Result<String> {
        let mut out = String::new();
        writeln!(out, "Health Status")?;
        writeln!(out, "{}\n", rule())?;
        for (name, status) in health {
            let symbol = if status.available { "\u{2713}" } else { "\u{2717}" };
            writeln!(out, "{} {}", symbol, name)?;
            writeln!(out, "  Message: {}", status.message)?;
            if let Some(details) = &status.details {
                writeln!(out, "  Details: {}", details)?;
            }
            out.push('\n');
        }
        Ok(out)
    }
}

fn rule() -> String {
    "\u{2501}".repeat(42)
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    serde_json::to_string_pretty(value).context("Failed to serialize output to JSON")
}

fn to_yaml<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    serde_yaml::to_string(value).context("Failed to serialize output to YAML")
}

/// Result of one health check
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub available: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl HealthStatus {
    pub fn available(message: String) -> Self {
        Self {
            available: true,
            message,
            details: None,
        }
    }

    pub fn unavailable(message: String) -> Self {
        Self {
            available: false,
            message,
            details: None,
        }
    }

    pub fn with_details(mut self, details: String) -> Self {
        self.details = Some(details);
        self
    }
}
