//! Multi-stage Dockerfile rendering.
//!
//! One Dockerfile stage per build stage (`base`, `dependencies`, `runtime`), so a stage
//! can be built on its own with `--target`. The runtime environment, volumes and labels
//! live in the last stage only, where editing them cannot invalidate the install step.

use crate::graph::Stage;
use anyhow::{Context, Result};
use pybox_core::Recipe;
use std::fmt::Write;

/// Where the manifest and the source tree sit inside the build context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextLayout {
    pub manifest: String,
    pub source: String,
}

impl ContextLayout {
    /// Paths as written in the recipe, for building straight from the project directory.
    pub fn project(recipe: &Recipe) -> Self {
        Self {
            manifest: trim_rel(&recipe.dependencies.manifest),
            source: trim_rel(&recipe.source.path),
        }
    }

    /// Fixed layout of the contexts pybox generates itself.
    pub fn generated(recipe: &Recipe) -> Self {
        Self {
            manifest: format!("manifest/{}", recipe.manifest_file_name()),
            source: "source".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DockerfileOptions {
    pub layout: ContextLayout,
    /// Emit `COPY --link` for the source layer (needs BuildKit).
    pub link: bool,
}

pub fn render(recipe: &Recipe, options: &DockerfileOptions) -> Result<String> {
    let image = recipe.base_image()?;
    let mut out = String::new();

    if options.link {
        writeln!(out, "# syntax=docker/dockerfile:1")?;
    }
    out.push_str(&render_stage(recipe, Stage::Base, &image.canonical(), options)?);
    writeln!(out)?;
    out.push_str(&render_stage(
        recipe,
        Stage::Dependencies,
        Stage::Base.as_str(),
        options,
    )?);
    writeln!(out)?;
    out.push_str(&render_stage(
        recipe,
        Stage::Runtime,
        Stage::Dependencies.as_str(),
        options,
    )?);

    Ok(out)
}

/// A single stage built on top of `from` (an image reference or an earlier stage).
pub fn render_stage(
    recipe: &Recipe,
    stage: Stage,
    from: &str,
    options: &DockerfileOptions,
) -> Result<String> {
    let mut out = String::new();
    writeln!(out, "FROM {} AS {}", from, stage)?;

    match stage {
        Stage::Base => {
            let mut packages = recipe.base.packages.clone();
            packages.sort();
            packages.dedup();
            let command = recipe.package_manager().install_command(&packages);
            writeln!(out, "RUN {}", json(&command)?)?;
        }
        Stage::Dependencies => {
            writeln!(out, "WORKDIR {}", recipe.workdir)?;
            writeln!(
                out,
                "COPY {}",
                json(&[options.layout.manifest.as_str(), recipe.manifest_dest().as_str()])?
            )?;
            writeln!(out, "RUN {}", json(&recipe.install_command())?)?;
        }
        Stage::Runtime => {
            let env = recipe.environment();
            if !env.is_empty() {
                let pairs: Vec<String> = env
                    .iter()
                    .map(|(k, v)| -> Result<String> { Ok(format!("{}={}", k, quote(v)?)) })
                    .collect::<Result<_>>()?;
                writeln!(out, "ENV {}", pairs.join(" "))?;
            }
            let source_dest = format!("{}/", recipe.source_dest().trim_end_matches('/'));
            writeln!(
                out,
                "COPY {}{}",
                if options.link { "--link " } else { "" },
                json(&[options.layout.source.as_str(), source_dest.as_str()])?
            )?;
            if !recipe.volumes.is_empty() {
                writeln!(out, "VOLUME {}", json(&recipe.volumes)?)?;
            }
            if !recipe.labels.is_empty() {
                let pairs: Vec<String> = recipe
                    .labels
                    .iter()
                    .map(|(k, v)| -> Result<String> {
                        Ok(format!("{}={}", quote(k)?, quote(v)?))
                    })
                    .collect::<Result<_>>()?;
                writeln!(out, "LABEL {}", pairs.join(" "))?;
            }
            writeln!(out, "WORKDIR {}", recipe.workdir)?;
            writeln!(out, "ENTRYPOINT {}", json(&recipe.entrypoint_command().argv())?)?;
            writeln!(out, "CMD []")?;
        }
    }

    Ok(out)
}

fn json<T: serde::Serialize + ?Sized>(value: &T) -> Result<String> {
    serde_json::to_string(value).context("Failed to encode Dockerfile argument")
}

/// Double-quoted Dockerfile word with `$` protected from substitution.
fn quote(value: &str) -> Result<String> {
    Ok(json(value)?.replace('$', "\\$"))
}

fn trim_rel(path: &str) -> String {
    let trimmed = path.trim_start_matches("./").trim_end_matches('/');
    if trimmed.is_empty() {
        ".".to_string()
    } else {
        trimmed.to_string()
    }
}
