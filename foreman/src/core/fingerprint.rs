//! Content hashing and escalation fingerprints.

use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 of the content.
pub fn sha256_hex(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Deduplication fingerprint for an escalation: reason plus content hash.
pub fn fingerprint(reason: &str, content: &str) -> String {
    format!("{reason}:{}", sha256_hex(content))
}
