//! Shared timestamp/identity helpers for log envelopes.

use sha2::{Digest, Sha256};
use ulid::Ulid;

/// RFC 3339 local timestamp used as the log line prefix.
pub fn now_iso() -> String {
    chrono::Local::now().to_rfc3339()
}

/// Directory-safe run id (e.g. `20261018_142301`).
pub fn run_stamp() -> String {
    chrono::Local::now().format("%Y%m%d_%H%M%S").to_string()
}

pub fn new_event_id() -> String {
    Ulid::new().to_string()
}

/// Truncated sha256 over `name || started_at`, 10 hex chars.
pub fn run_fingerprint(name: &str, started_at: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update(started_at.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..10].to_string()
}
