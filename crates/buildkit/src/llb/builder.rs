use super::pb;
use anyhow::{Context, Result};
use prost::Message as ProstMessage;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use tracing::debug;

pub(crate) const CUSTOM_NAME: &str = "llb.customname";

/// Accumulates LLB ops in dependency order and serializes them as a `Definition`.
pub struct LLBBuilder {
    pub(crate) context_name: String,
    pub(crate) platform: pb::Platform,

    pub(crate) ops: Vec<pb::Op>,
    pub(crate) digests: Vec<String>,
    pub(crate) names: Vec<Option<String>>,
}

impl LLBBuilder {
    pub fn new(context_name: impl Into<String>) -> Self {
        Self {
            context_name: context_name.into(),
            platform: pb::Platform {
                architecture: "amd64".to_string(),
                os: "linux".to_string(),
                variant: String::new(),
            },
            ops: Vec::new(),
            digests: Vec::new(),
            names: Vec::new(),
        }
    }

    /// `os/arch[/variant]`, as in `linux/arm64/v8`.
    pub fn with_platform(mut self, platform: &str) -> Self {
        let mut parts = platform.split('/');
        if let (Some(os), Some(arch)) = (parts.next(), parts.next()) {
            self.platform = pb::Platform {
                architecture: arch.to_string(),
                os: os.to_string(),
                variant: parts.next().unwrap_or_default().to_string(),
            };
        }
        self
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn digest(&self, index: i64) -> Option<&str> {
        self.digests.get(index as usize).map(String::as_str)
    }

    pub(crate) fn add_op(&mut self, mut op: pb::Op, name: Option<String>) -> i64 {
        let index = self.ops.len() as i64;

        if op.platform.is_none() && op.op.is_some() {
            op.platform = Some(self.platform.clone());
        }

        let digest = format!("sha256:{}", hex::encode(Sha256::digest(op.encode_to_vec())));

        self.ops.push(op);
        self.digests.push(digest);
        self.names.push(name);

        index
    }

    fn inputs(&self, inputs: &[(i64, i64)]) -> Vec<pb::Input> {
        inputs
            .iter()
            .map(|&(input_idx, output_idx)| pb::Input {
                digest: self.digests[input_idx as usize].clone(),
                index: output_idx,
            })
            .collect()
    }

    pub(crate) fn create_merge(&mut self, inputs: Vec<(i64, i64)>, name: Option<String>) -> i64 {
        let merge_inputs = (0..inputs.len())
            .map(|i| pb::MergeInput { input: i as i64 })
            .collect();

        let op = pb::Op {
            inputs: self.inputs(&inputs),
            op: Some(pb::op::Op::Merge(pb::MergeOp {
                inputs: merge_inputs,
            })),
            platform: None,
        };

        self.add_op(op, name)
    }

    pub(crate) fn create_image_source(&mut self, image_ref: &str, name: Option<String>) -> i64 {
        let op = pb::Op {
            inputs: vec![],
            op: Some(pb::op::Op::Source(pb::SourceOp {
                identifier: format!("docker-image://{}", image_ref),
                attrs: BTreeMap::new(),
            })),
            platform: None,
        };
        self.add_op(op, name)
    }

    pub(crate) fn create_output_reference(&mut self, input_idx: i64) -> i64 {
        let op = pb::Op {
            inputs: self.inputs(&[(input_idx, 0)]),
            op: None,
            platform: None,
        };
        self.add_op(op, None)
    }

    /// Local context source transferring only `include` paths (minus `exclude`).
    pub(crate) fn create_local_source(
        &mut self,
        include: &[String],
        exclude: &[String],
        shared_key: &str,
        name: Option<String>,
    ) -> Result<i64> {
        let mut attrs = BTreeMap::new();
        if !include.is_empty() {
            attrs.insert(
                "local.includepattern".to_string(),
                serde_json::to_string(include).context("Failed to encode include patterns")?,
            );
        }
        if !exclude.is_empty() {
            attrs.insert(
                "local.excludepatterns".to_string(),
                serde_json::to_string(exclude).context("Failed to encode exclude patterns")?,
            );
        }
        attrs.insert("local.sharedkeyhint".to_string(), shared_key.to_string());

        let op = pb::Op {
            inputs: vec![],
            op: Some(pb::op::Op::Source(pb::SourceOp {
                identifier: format!("local://{}", self.context_name),
                attrs,
            })),
            platform: None,
        };
        Ok(self.add_op(op, name))
    }

    pub(crate) fn create_exec(
        &mut self,
        inputs: Vec<(i64, i64)>,
        mounts: Vec<pb::Mount>,
        meta: pb::Meta,
        name: Option<String>,
    ) -> i64 {
        let op = pb::Op {
            inputs: self.inputs(&inputs),
            op: Some(pb::op::Op::Exec(pb::ExecOp {
                meta: Some(meta),
                mounts,
                network: pb::NetMode::Unset as i32,
                security: pb::SecurityMode::Sandbox as i32,
            })),
            platform: None,
        };

        self.add_op(op, name)
    }

    /// Copy `src` from `from` onto `onto` (`None` = scratch) at `dest`.
    pub(crate) fn create_copy(
        &mut self,
        onto: Option<i64>,
        from: i64,
        src: &str,
        dest: &str,
        dir_contents: bool,
        name: Option<String>,
    ) -> i64 {
        let (inputs, input, secondary) = match onto {
            Some(base) => (vec![(base, 0), (from, 0)], 0, 1),
            None => (vec![(from, 0)], -1, 0),
        };

        let op = pb::Op {
            inputs: self.inputs(&inputs),
            op: Some(pb::op::Op::File(pb::FileOp {
                actions: vec![pb::FileAction {
                    input,
                    secondary_input: secondary,
                    output: 0,
                    action: Some(pb::file_action::Action::Copy(pb::FileActionCopy {
                        src: src.to_string(),
                        dest: dest.to_string(),
                        mode: -1,
                        follow_symlink: false,
                        dir_copy_contents: dir_contents,
                        create_dest_path: true,
                        allow_wildcard: false,
                        timestamp: 0,
                        include_patterns: vec![],
                        exclude_patterns: vec![],
                    })),
                }],
            })),
            platform: None,
        };
        self.add_op(op, name)
    }

    pub(crate) fn root_mount(&self) -> pb::Mount {
        pb::Mount {
            input: 0,
            selector: String::new(),
            dest: "/".to_string(),
            output: 0,
            readonly: false,
            mount_type: pb::MountType::Bind as i32,
        }
    }

    pub fn to_definition(&self) -> pb::Definition {
        self.log_graph_structure();

        let def = self.ops.iter().map(|op| op.encode_to_vec()).collect();

        let metadata = self
            .digests
            .iter()
            .zip(&self.names)
            .filter_map(|(digest, name)| {
                name.as_ref().map(|name| {
                    let mut description = BTreeMap::new();
                    description.insert(CUSTOM_NAME.to_string(), name.clone());
                    (
                        digest.clone(),
                        pb::OpMetadata {
                            ignore_cache: false,
                            description,
                        },
                    )
                })
            })
            .collect();

        pb::Definition { def, metadata }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let definition = self.to_definition();
        let mut buf = Vec::with_capacity(definition.encoded_len());
        ProstMessage::encode(&definition, &mut buf).context("Failed to encode LLB definition")?;
        Ok(buf)
    }

    /// Human-readable listing of the op graph.
    pub fn describe(&self) -> String {
        let mut output = String::new();
        for (idx, op) in self.ops.iter().enumerate() {
            output.push_str(&format!("{} ({}) -> ", idx, &self.digests[idx]));

            match &op.op {
                Some(pb::op::Op::Source(source)) => {
                    if let Some(image) = source.identifier.strip_prefix("docker-image://") {
                        output.push_str(&format!("FROM {}\n", image));
                    } else {
                        output.push_str(&format!("SOURCE {}\n", source.identifier));
                        for (key, value) in &source.attrs {
                            output.push_str(&format!("          {}={}\n", key, value));
                        }
                    }
                }
                Some(pb::op::Op::Exec(exec)) => {
                    match &exec.meta {
                        Some(meta) => {
                            output.push_str(&format!("EXEC {} (cwd {})\n", meta.args.join(" "), meta.cwd))
                        }
                        None => output.push_str("EXEC\n"),
                    }

                    for mount in &exec.mounts {
                        let mount_type = pb::MountType::try_from(mount.mount_type)
                            .map(|t| t.as_str_name())
                            .unwrap_or("UNKNOWN");
                        output.push_str(&format!(
                            "          {} ({}) -> {} -> {}\n",
                            mount.input, mount_type, mount.dest, mount.output
                        ));
                    }
                }
                Some(pb::op::Op::File(file)) => {
                    for action in &file.actions {
                        match &action.action {
                            Some(pb::file_action::Action::Copy(copy)) => output.push_str(
                                &format!("COPY {} {} (onto {})\n", copy.src, copy.dest, action.input),
                            ),
                            Some(pb::file_action::Action::Mkdir(mkdir)) => {
                                output.push_str(&format!("MKDIR {}\n", mkdir.path))
                            }
                            None => output.push_str("FILE\n"),
                        }
                    }
                }
                Some(pb::op::Op::Merge(merge)) => {
                    let inputs: Vec<String> =
                        merge.inputs.iter().map(|m| m.input.to_string()).collect();
                    output.push_str(&format!("MERGE ({})\n", inputs.join(", ")));
                }
                None => {
                    output.push_str("OUTPUT\n");
                }
            }

            for (i, input) in op.inputs.iter().enumerate() {
                output.push_str(&format!(
                    "          input[{}]: digest={}, index={}\n",
                    i, input.digest, input.index
                ));
            }
        }
        output
    }

    fn log_graph_structure(&self) {
        debug!(
            "\n=== LLB Graph Structure ===\n\n{}\n=== End of Graph ===\n",
            self.describe()
        );
    }
}
