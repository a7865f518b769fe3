use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};
use std::path::{Path, PathBuf};

const SHA256: &str = "sha256";
const SHA256_HEX_LEN: usize = 64;

/// Represents a content-addressable digest (e.g., "sha256:abc123...")
///
/// Only sha256 is accepted, so the hash is always 64 lowercase hex characters and is safe
/// to use as a file name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest {
    algorithm: String,
    hash: String,
}

impl Digest {
    /// Parse a digest string in format "sha256:hash"
    pub fn parse(digest: &str) -> Result<Self> {
        let (algorithm, hash) = digest.split_once(':').with_context(|| {
            format!(
                "Invalid digest format (expected 'algorithm:hash'): {}",
                digest
            )
        })?;

        if algorithm != SHA256 {
            anyhow::bail!("Unsupported digest algorithm '{}': {}", algorithm, digest);
        }

        if hash.len() != SHA256_HEX_LEN || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
            anyhow::bail!("Invalid sha256 digest (expected 64 hex chars): {}", digest);
        }

        Ok(Self {
            algorithm: algorithm.to_string(),
            hash: hash.to_ascii_lowercase(),
        })
    }

    /// sha256 of an in-memory buffer
    pub fn sha256(bytes: &[u8]) -> Self {
        Self::from_sha256(Sha256::digest(bytes).into())
    }

    /// Finalize a running sha256 hasher into a digest
    pub fn from_hasher(hasher: Sha256) -> Self {
        Self::from_sha256(hasher.finalize().into())
    }

    fn from_sha256(bytes: [u8; 32]) -> Self {
        Self {
            algorithm: SHA256.to_string(),
            hash: hex::encode(bytes),
        }
    }

    /// Get the algorithm part (e.g., "sha256")
    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    /// Get the hash part
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// First `len` hex characters, for tags and human output
    pub fn short(&self, len: usize) -> &str {
        self.hash.get(..len).unwrap_or(&self.hash)
    }

    /// Convert digest to blob storage path within a cache directory
    pub fn to_blob_path(&self, cache_dir: &Path) -> PathBuf {
        cache_dir
            .join("blobs")
            .join(&self.algorithm)
            .join(&self.hash)
    }

    /// Format as "algorithm:hash" string
    pub fn as_str(&self) -> String {
        format!("{}:{}", self.algorithm, self.hash)
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hash)
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.as_str())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Digest::parse(&raw).map_err(serde::de::Error::custom)
    }
}
