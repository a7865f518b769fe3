use super::builder::LLBBuilder;
use super::pb;
use crate::graph::{ASSEMBLE, BASE_IMAGE, CERTIFICATES, INSTALL, MANIFEST, SOURCE};
use crate::image_config::ImageConfig;
use crate::plan::BuildPlan;
use anyhow::Result;

const SOURCE_DATE_EPOCH: &str = "0";
const DEFAULT_PATH: &str = "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

pub trait BuildStrategy {
    fn build_graph(&self, builder: &mut LLBBuilder, plan: &BuildPlan) -> Result<()>;

    /// Runtime config the exporter has to attach to the image built from the graph.
    fn image_config(&self, plan: &BuildPlan) -> ImageConfig;
}

/// base image -> certificates -> manifest copy -> install, merged with the source layer.
///
/// The source layer is copied onto scratch from a local source that only transfers the
/// scanned files, so its BuildKit cache key never involves the dependency chain and an
/// application edit never reaches `install`.
pub struct PyboxStrategy;

impl PyboxStrategy {
    fn op_name(plan: &BuildPlan, node: &str, what: &str) -> Option<String> {
        let key = plan
            .graph
            .key(node)
            .map(|k| k.short(12).to_string())
            .unwrap_or_default();
        Some(format!("[{}] {} ({})", node, what, key))
    }

    fn exec_meta(args: Vec<String>, cwd: &str) -> pb::Meta {
        pb::Meta {
            args,
            env: vec![
                DEFAULT_PATH.to_string(),
                format!("SOURCE_DATE_EPOCH={}", SOURCE_DATE_EPOCH),
            ],
            cwd: cwd.to_string(),
            user: String::new(),
        }
    }
}

impl BuildStrategy for PyboxStrategy {
    fn build_graph(&self, builder: &mut LLBBuilder, plan: &BuildPlan) -> Result<()> {
        let recipe = &plan.recipe;
        let image = recipe.base_image()?;

        let base_image_idx = builder.create_image_source(
            &image.canonical(),
            Self::op_name(plan, BASE_IMAGE, image.as_written()),
        );

        let mut packages = recipe.base.packages.clone();
        packages.sort();
        packages.dedup();
        let command = recipe.package_manager().install_command(&packages);
        let mounts = vec![builder.root_mount()];
        let base_idx = builder.create_exec(
            vec![(base_image_idx, 0)],
            mounts,
            Self::exec_meta(command, "/"),
            Self::op_name(plan, CERTIFICATES, &format!("install {}", packages.join(" "))),
        );

        let manifest_rel = plan.manifest_rel();
        let manifest_ctx_idx = builder.create_local_source(
            std::slice::from_ref(&manifest_rel),
            &[],
            "pybox-manifest",
            Some(format!("load {}", manifest_rel)),
        )?;
        let manifest_idx = builder.create_copy(
            Some(base_idx),
            manifest_ctx_idx,
            &format!("/{}", manifest_rel),
            &recipe.manifest_dest(),
            false,
            Self::op_name(plan, MANIFEST, &format!("copy {}", manifest_rel)),
        );

        let install_command = recipe.install_command();
        let mounts = vec![builder.root_mount()];
        let install_idx = builder.create_exec(
            vec![(manifest_idx, 0)],
            mounts,
            Self::exec_meta(install_command.clone(), &recipe.workdir),
            Self::op_name(plan, INSTALL, &install_command.join(" ")),
        );

        let source_rel = plan.source_rel();
        let include: Vec<String> = plan
            .source
            .paths()
            .map(|p| {
                if source_rel == "." {
                    p.to_string()
                } else {
                    format!("{}/{}", source_rel, p)
                }
            })
            .collect();
        let source_ctx_idx = builder.create_local_source(
            &include,
            &[],
            "pybox-source",
            Some(format!("load {}", source_rel)),
        )?;
        let source_src = if source_rel == "." {
            "/".to_string()
        } else {
            format!("/{}", source_rel)
        };
        let source_idx = builder.create_copy(
            None,
            source_ctx_idx,
            &source_src,
            &recipe.source_dest(),
            true,
            Self::op_name(plan, SOURCE, &format!("copy {}", source_rel)),
        );

        let final_idx = builder.create_merge(
            vec![(install_idx, 0), (source_idx, 0)],
            Self::op_name(plan, ASSEMBLE, "merge dependencies and source"),
        );

        builder.create_output_reference(final_idx);
        Ok(())
    }

    fn image_config(&self, plan: &BuildPlan) -> ImageConfig {
        ImageConfig::from_recipe(&plan.recipe)
    }
}
