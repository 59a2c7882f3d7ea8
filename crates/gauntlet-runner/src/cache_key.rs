//! Cache key encoding
//!
//! A cache key is `(content hash, working subdirectory, command)`. The
//! command and subdirectory are folded into a single SHA-256 token; the
//! content hash becomes a path segment so all entries for one tree share a
//! prefix.

use gauntlet_core::ContentHash;
use sha2::{Digest, Sha256};

/// Top-level namespace for every note the tool writes
pub const TOOL_NAMESPACE: &str = "gauntlet";

/// Which cache a key belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheNamespace {
    /// Single-command runs
    Run,
    /// Whole pipeline results
    Validate,
}

impl CacheNamespace {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Run => "run",
            Self::Validate => "validate",
        }
    }
}

/// Encodes `(command, workdir)` into a path-safe token
pub struct CacheKeyCodec;

impl CacheKeyCodec {
    /// Deterministic lowercase-hex SHA-256 token
    ///
    /// The command is length-prefixed and followed by a NUL separator, so
    /// moving bytes between the two components always changes the token.
    pub fn encode(command: &str, workdir: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update((command.len() as u64).to_le_bytes());
        hasher.update(command.as_bytes());
        hasher.update([0u8]);
        hasher.update(normalize_workdir(workdir).as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// `""`, `"./"` and `"."` all name the repository root
fn normalize_workdir(workdir: &str) -> &str {
    let trimmed = workdir.trim_end_matches('/');
    if trimmed.is_empty() || trimmed == "." || trimmed == "./" {
        "."
    } else {
        trimmed.strip_prefix("./").unwrap_or(trimmed)
    }
}

/// Fully-specified cache key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub content_hash: ContentHash,
    pub workdir: String,
    pub command: String,
}

impl CacheKey {
    pub fn new(
        content_hash: ContentHash,
        workdir: impl Into<String>,
        command: impl Into<String>,
    ) -> Self {
        Self {
            content_hash,
            workdir: workdir.into(),
            command: command.into(),
        }
    }

    pub fn token(&self) -> String {
        CacheKeyCodec::encode(&self.command, &self.workdir)
    }

    /// `gauntlet/<namespace>/<content hash>/<token>`
    pub fn path(&self, namespace: CacheNamespace) -> String {
        format!(
            "{}/{}/{}/{}",
            TOOL_NAMESPACE,
            namespace.as_str(),
            self.content_hash,
            self.token()
        )
    }
}
