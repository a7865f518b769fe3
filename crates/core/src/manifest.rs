//! Dependency manifest (requirements format).
//!
//! The manifest is the only input of the dependency-install step, so its content digest is
//! that step's cache input. Only the manifest file is copied before installation, which is
//! why includes (`-r`, `-c`) and local editable installs (`-e`) are rejected here instead
//! of failing later inside the build.

use crate::digest::Digest;
use crate::error::BuildError;
use regex::Regex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Requirement {
    pub name: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub extras: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub specifier: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub marker: Option<String>,
    pub line: usize,
}

impl Requirement {
    /// Exactly one version is acceptable (`==1.2.3` or `===1.2.3`, no wildcard).
    pub fn is_pinned(&self) -> bool {
        match self.specifier.as_deref() {
            Some(spec) => {
                let spec = spec.trim();
                !spec.contains(',')
                    && (spec.starts_with("===") || spec.starts_with("=="))
                    && !spec.ends_with(".*")
            }
            None => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DependencyManifest {
    pub path: PathBuf,
    pub digest: Digest,
    pub requirements: Vec<Requirement>,
    /// Global pip options (`--index-url ...`) kept verbatim
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

fn requirement_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^(?P<name>[A-Za-z0-9](?:[A-Za-z0-9._-]*[A-Za-z0-9])?)\s*(?:\[(?P<extras>[^\]]*)\])?\s*(?P<spec>(?:===|==|!=|~=|<=|>=|<|>)[^;]*)?$",
        )
        .unwrap()
    })
}

fn extra_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9](?:[A-Za-z0-9._-]*[A-Za-z0-9])?$").unwrap())
}

impl DependencyManifest {
    /// Read and parse the manifest; a missing file or a malformed line is an input error.
    pub fn load(path: &Path) -> Result<Self, BuildError> {
        if !path.exists() {
            return Err(BuildError::ManifestMissing {
                path: path.to_path_buf(),
            });
        }
        if !path.is_file() {
            return Err(BuildError::ManifestMalformed {
                path: path.to_path_buf(),
                line: 0,
                message: "not a regular file".to_string(),
            });
        }

        let bytes = std::fs::read(path).map_err(|e| BuildError::io(path, e))?;
        let content = String::from_utf8(bytes.clone()).map_err(|_| {
            BuildError::ManifestMalformed {
                path: path.to_path_buf(),
                line: 0,
                message: "manifest is not valid UTF-8".to_string(),
            }
        })?;

        let manifest = Self::parse(path, &content, Digest::sha256(&bytes))?;
        debug!(
            path = %path.display(),
            digest = %manifest.digest,
            requirements = manifest.requirements.len(),
            "Loaded dependency manifest"
        );

        if manifest.requirements.is_empty() {
            warn!("Dependency manifest {} declares no packages", path.display());
        }
        for req in manifest.requirements.iter().filter(|r| !r.is_pinned()) {
            warn!(
                package = %req.name,
                line = req.line,
                "Requirement is not pinned to an exact version; rebuilds may resolve differently"
            );
        }

        Ok(manifest)
    }

    pub fn parse(path: &Path, content: &str, digest: Digest) -> Result<Self, BuildError> {
        let malformed = |line: usize, message: String| BuildError::ManifestMalformed {
            path: path.to_path_buf(),
            line,
            message,
        };

        let mut requirements = Vec::new();
        let mut options = Vec::new();

        for (line_no, logical) in logical_lines(content) {
            let line = strip_comment(&logical);
            if line.is_empty() {
                continue;
            }

            if line.starts_with('-') {
                let flag = line.split(|c: char| c.is_whitespace() || c == '=').next().unwrap_or("");
                match flag {
                    "-r" | "--requirement" | "-c" | "--constraint" => {
                        return Err(malformed(
                            line_no,
                            format!(
                                "'{}' includes another file, which is not copied into the image",
                                flag
                            ),
                        ))
                    }
                    "-e" | "--editable" => {
                        return Err(malformed(
                            line_no,
                            "editable installs reference the source tree, which is copied after dependencies".to_string(),
                        ))
                    }
                    "-i" | "-f" => {
                        let value = line[flag.len()..]
                            .trim_start_matches(|c: char| c.is_whitespace() || c == '=');
                        if value.is_empty() {
                            return Err(malformed(line_no, format!("'{}' needs a value", flag)));
                        }
                        let long = if flag == "-i" { "--index-url" } else { "--find-links" };
                        options.push(format!("{} {}", long, value));
                    }
                    f if f.starts_with("--") => options.push(line.to_string()),
                    _ => {
                        return Err(malformed(line_no, format!("unknown option '{}'", flag)));
                    }
                }
                continue;
            }

            // Per-requirement options such as --hash follow the requirement itself.
            let (requirement_part, _) = match line.find(" --") {
                Some(i) => line.split_at(i),
                None => (line, ""),
            };

            let (spec_part, marker) = match requirement_part.split_once(';') {
                Some((spec, marker)) => (spec.trim(), Some(marker.trim().to_string())),
                None => (requirement_part.trim(), None),
            };
            if marker.as_deref() == Some("") {
                return Err(malformed(line_no, "empty environment marker".to_string()));
            }

            if spec_part.contains("://") || spec_part.contains(" @ ") {
                return Err(malformed(
                    line_no,
                    "direct URL requirements are not supported".to_string(),
                ));
            }

            let caps = requirement_regex().captures(spec_part).ok_or_else(|| {
                malformed(line_no, format!("'{}' is not a valid requirement", spec_part))
            })?;

            let extras = match caps.name("extras") {
                Some(m) => {
                    let extras: Vec<String> = m
                        .as_str()
                        .split(',')
                        .map(|e| e.trim().to_string())
                        .filter(|e| !e.is_empty())
                        .collect();
                    if let Some(bad) = extras.iter().find(|e| !extra_regex().is_match(e)) {
                        return Err(malformed(line_no, format!("invalid extra '{}'", bad)));
                    }
                    extras
                }
                None => Vec::new(),
            };

            let specifier = caps
                .name("spec")
                .map(|m| m.as_str().split_whitespace().collect::<String>())
                .filter(|s| !s.is_empty());

            requirements.push(Requirement {
                name: caps["name"].to_string(),
                extras,
                specifier,
                marker,
                line: line_no,
            });
        }

        Ok(Self {
            path: path.to_path_buf(),
            digest,
            requirements,
            options,
        })
    }

    pub fn unpinned(&self) -> impl Iterator<Item = &Requirement> {
        self.requirements.iter().filter(|r| !r.is_pinned())
    }
}

/// Joins backslash continuations; yields the 1-based line where each logical line starts.
fn logical_lines(content: &str) -> Vec<(usize, String)> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut start = 0;

    for (idx, raw) in content.lines().enumerate() {
        if current.is_empty() {
            start = idx + 1;
        }
        match raw.strip_suffix('\\') {
            Some(head) => {
                current.push_str(head);
                current.push(' ');
            }
            None => {
                current.push_str(raw);
                out.push((start, std::mem::take(&mut current)));
            }
        }
    }
    if !current.is_empty() {
        out.push((start, current));
    }
    out
}

/// `#` starts a comment at line start or after whitespace (URL fragments are left alone).
fn strip_comment(line: &str) -> &str {
    let trimmed = line.trim();
    if trimmed.starts_with('#') {
        return "";
    }
    match trimmed.find(" #").or_else(|| trimmed.find("\t#")) {
        Some(i) => trimmed[..i].trim_end(),
        None => trimmed,
    }
}
