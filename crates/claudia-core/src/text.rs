//! Text normalization and content hashing.
//!
//! The dedup hash must be stable across platforms: NFC Unicode normalize,
//! lowercase, trim, collapse interior whitespace, then SHA-256. Any change
//! here requires a re-hash migration.

use sha2::{Digest, Sha256};
use std::path::Path;
use unicode_normalization::UnicodeNormalization;

/// Normalize content for hashing: NFC, lowercase, trimmed, interior
/// whitespace collapsed to single spaces.
pub fn normalize_for_hash(content: &str) -> String {
    let nfc: String = content.nfc().collect();
    let lower = nfc.to_lowercase();
    let mut out = String::with_capacity(lower.len());
    for word in lower.split_whitespace() {
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(word);
    }
    out
}

/// SHA-256 hex digest of the normalized content.
pub fn content_hash(content: &str) -> String {
    let digest = Sha256::digest(normalize_for_hash(content).as_bytes());
    format!("{:x}", digest)
}

/// Normalize an entity name for case-insensitive resolution.
pub fn normalize_name(name: &str) -> String {
    normalize_for_hash(name)
}

/// Stable per-workspace identifier: first 16 hex chars of the SHA-256 of the
/// absolute workspace path.
pub fn workspace_hash(workspace: &Path) -> String {
    let absolute = workspace
        .canonicalize()
        .unwrap_or_else(|_| workspace.to_path_buf());
    let digest = Sha256::digest(absolute.to_string_lossy().as_bytes());
    format!("{:x}", digest)[..16].to_string()
}
