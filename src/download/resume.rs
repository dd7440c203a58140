use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// How to continue a partial download from a byte offset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeDescriptor {
    pub path: PathBuf,
    pub url_chain: Vec<String>,
    pub offset: u64,
    pub length: u64,
    pub last_modified: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeDecision {
    /// Nothing usable on disk, let the host download from scratch.
    Fresh,
    Resume(ResumeDescriptor),
    /// Local size already covers the server size.
    Complete,
}

/// Decides what to do with `path` given its on-disk size (`None` when the
/// file does not exist) and the server-reported total.
///
/// Only sizes are compared. An unknown server size always means `Fresh`.
pub fn decide(
    local_size: Option<u64>,
    server_size: Option<u64>,
    url: &str,
    path: PathBuf,
    last_modified: Option<String>,
) -> ResumeDecision {
    let (Some(local), Some(server)) = (local_size, server_size) else {
        return ResumeDecision::Fresh;
    };

    if local >= server {
        return ResumeDecision::Complete;
    }

    ResumeDecision::Resume(ResumeDescriptor {
        path,
        url_chain: vec![url.to_string()],
        offset: local,
        length: server,
        last_modified,
    })
}

/// Parses a `Content-Length` value, `None` when absent or malformed.
pub fn parse_content_length(value: Option<&str>) -> Option<u64> {
    value.and_then(|v| v.trim().parse().ok())
}
