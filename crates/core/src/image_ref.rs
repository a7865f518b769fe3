//! Base image references and the pinning rule.
//!
//! A reference follows the usual `[registry/]path[:tag][@digest]` grammar. A reference is
//! considered pinned when it carries a digest, or when its tag names at least an explicit
//! `major.minor` version (`3.12-slim`, `v1.4.2`). Bare names, `latest` and version-less
//! tags such as `slim` or `3` float and are rejected by [`ImageReference::require_pinned`].

use crate::digest::Digest;
use regex::Regex;
use std::fmt;
use std::sync::OnceLock;
use thiserror::Error;

const DEFAULT_REGISTRY: &str = "docker.io";
const OFFICIAL_NAMESPACE: &str = "library";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ImageRefError {
    #[error("Image reference is empty")]
    Empty,

    #[error("Invalid image reference '{reference}': {reason}")]
    Invalid { reference: String, reason: String },

    #[error("Image reference '{0}' is not pinned: specify an explicit version tag (e.g. python:3.12-slim) or a digest")]
    Unpinned(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    registry: String,
    path: String,
    tag: Option<String>,
    digest: Option<Digest>,
    original: String,
}

fn path_component_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*$").unwrap())
}

fn tag_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.-]{0,127}$").unwrap())
}

fn versioned_tag_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^v?[0-9]+\.[0-9]+").unwrap())
}

impl ImageReference {
    pub fn parse(reference: &str) -> Result<Self, ImageRefError> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(ImageRefError::Empty);
        }

        let invalid = |reason: &str| ImageRefError::Invalid {
            reference: reference.to_string(),
            reason: reason.to_string(),
        };

        let (name_and_tag, digest) = match reference.split_once('@') {
            Some((name, digest)) => {
                let digest = Digest::parse(digest).map_err(|e| invalid(&e.to_string()))?;
                (name, Some(digest))
            }
            None => (reference, None),
        };

        // A ':' after the last '/' separates the tag; earlier ones belong to a registry port.
        let last_slash = name_and_tag.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (name, tag) = match name_and_tag[last_slash..].rfind(':') {
            Some(i) => {
                let split = last_slash + i;
                (
                    &name_and_tag[..split],
                    Some(name_and_tag[split + 1..].to_string()),
                )
            }
            None => (name_and_tag, None),
        };

        if let Some(tag) = &tag {
            if !tag_regex().is_match(tag) {
                return Err(invalid("malformed tag"));
            }
        }

        let (registry, path) = match name.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_string(), rest.to_string())
            }
            _ => (DEFAULT_REGISTRY.to_string(), name.to_string()),
        };

        if path.is_empty() {
            return Err(invalid("missing repository name"));
        }
        for component in path.split('/') {
            if !path_component_regex().is_match(component) {
                return Err(invalid("repository names must be lowercase alphanumerics separated by '.', '_' or '-'"));
            }
        }

        let path = if registry == DEFAULT_REGISTRY && !path.contains('/') {
            format!("{}/{}", OFFICIAL_NAMESPACE, path)
        } else {
            path
        };

        Ok(Self {
            registry,
            path,
            tag,
            digest,
            original: reference.to_string(),
        })
    }

    pub fn registry(&self) -> &str {
        &self.registry
    }

    /// Repository path within the registry (`library/python`)
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn digest(&self) -> Option<&Digest> {
        self.digest.as_ref()
    }

    /// Last path component (`python` for `docker.io/library/python:3.12`)
    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    /// The reference as written in the recipe
    pub fn as_written(&self) -> &str {
        &self.original
    }

    /// Fully-qualified form used by BuildKit (`docker.io/library/python:3.12-slim`)
    pub fn canonical(&self) -> String {
        let mut out = format!("{}/{}", self.registry, self.path);
        if let Some(tag) = &self.tag {
            out.push(':');
            out.push_str(tag);
        }
        if let Some(digest) = &self.digest {
            out.push('@');
            out.push_str(&digest.as_str());
        }
        out
    }

    pub fn is_pinned(&self) -> bool {
        if self.digest.is_some() {
            return true;
        }
        match self.tag.as_deref() {
            None | Some("latest") => false,
            Some(tag) => versioned_tag_regex().is_match(tag),
        }
    }

    pub fn require_pinned(&self) -> Result<(), ImageRefError> {
        if self.is_pinned() {
            Ok(())
        } else {
            Err(ImageRefError::Unpinned(self.original.clone()))
        }
    }

    /// Whether the image is an Alpine variant (apk instead of apt)
    pub fn is_alpine(&self) -> bool {
        self.name().contains("alpine")
            || self
                .tag
                .as_deref()
                .map(|t| t.contains("alpine"))
                .unwrap_or(false)
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.original)
    }
}

impl std::str::FromStr for ImageReference {
    type Err = ImageRefError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
