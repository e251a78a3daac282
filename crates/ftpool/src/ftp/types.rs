//! Shared types for the FTP crate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ─── Control channel ─────────────────────────────────────────────────

/// Protocol state of a control channel.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ChannelState {
    Disconnected,
    /// TCP (and implicit TLS) is up, greeting consumed.
    Connected,
    /// USER/PASS accepted.
    Authenticated,
    /// Login, TLS protection and FEAT probing complete.
    Ready,
    /// A data transfer is in flight.
    Busy,
    Closed,
}

/// A single FTP reply (may be multi-line).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FtpResponse {
    pub code: u16,
    pub lines: Vec<String>,
}

impl FtpResponse {
    /// Full response text (all lines joined).
    pub fn text(&self) -> String {
        self.lines.join("\n")
    }

    /// Text of the final line with the code stripped.
    pub fn message(&self) -> &str {
        self.lines
            .last()
            .map(|l| l.get(4..).unwrap_or("").trim())
            .unwrap_or("")
    }

    /// Whether the response code indicates success (1xx–3xx).
    pub fn is_success(&self) -> bool {
        self.code < 400
    }

    /// Whether this is a positive-preliminary reply (1xx).
    pub fn is_preliminary(&self) -> bool {
        (100..200).contains(&self.code)
    }

    /// Whether this is a positive-completion reply (2xx).
    pub fn is_completion(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// Whether this is a positive-intermediate reply (3xx).
    pub fn is_intermediate(&self) -> bool {
        (300..400).contains(&self.code)
    }
}

/// Parsed FEAT response.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServerFeatures {
    pub mlsd: bool,
    pub mlst: bool,
    pub size: bool,
    pub mdtm: bool,
    pub rest_stream: bool,
    pub utf8: bool,
    pub epsv: bool,
    pub eprt: bool,
    pub raw_features: Vec<String>,
}

impl ServerFeatures {
    /// Build from the body lines of a `211-` FEAT reply.
    pub fn from_feat_lines<'a>(lines: impl IntoIterator<Item = &'a str>) -> Self {
        let raw: Vec<String> = lines
            .into_iter()
            .filter(|l| !l.starts_with("211"))
            .map(|l| l.trim().to_uppercase())
            .filter(|l| !l.is_empty())
            .collect();

        let has = |feat: &str| raw.iter().any(|l| l.starts_with(feat));

        Self {
            mlsd: has("MLSD") || has("MLST"),
            mlst: has("MLST"),
            size: has("SIZE"),
            mdtm: has("MDTM"),
            rest_stream: has("REST STREAM"),
            utf8: has("UTF8"),
            epsv: has("EPSV"),
            eprt: has("EPRT"),
            raw_features: raw,
        }
    }
}

// ─── Directory listing ───────────────────────────────────────────────

/// Type of a remote filesystem entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
    Unknown,
}

/// Metadata about one remote entry, produced by `stat` and `read_dir`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    /// Base name of the entry.
    pub name: String,
    /// Full remote path (directory joined with `name` for listings).
    pub path: String,
    pub kind: EntryKind,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    pub permissions: Option<String>,
    pub owner: Option<String>,
    pub group: Option<String>,
    pub link_target: Option<String>,
    /// MLSD/MLST facts, keys lower-cased.
    #[serde(default)]
    pub facts: HashMap<String, String>,
}

impl FileMetadata {
    pub fn new(name: impl Into<String>, kind: EntryKind) -> Self {
        let name = name.into();
        Self {
            path: name.clone(),
            name,
            kind,
            size: 0,
            modified: None,
            permissions: None,
            owner: None,
            group: None,
            link_target: None,
            facts: HashMap::new(),
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }
}

// ─── Connection pool ─────────────────────────────────────────────────

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    /// Channels currently open (idle + in use + being opened).
    pub live: usize,
    pub idle: usize,
    pub in_use: usize,
    pub max: usize,
    /// Channels opened over the pool's lifetime.
    pub opened_total: u64,
    /// Channels retired as unhealthy over the pool's lifetime.
    pub retired_total: u64,
}

// ─── Path helpers ────────────────────────────────────────────────────

/// Join a remote directory and an entry name with a single `/`.
pub fn join_remote(dir: &str, name: &str) -> String {
    if dir.is_empty() || dir == "." {
        name.to_string()
    } else if dir.ends_with('/') {
        format!("{}{}", dir, name)
    } else {
        format!("{}/{}", dir, name)
    }
}

/// Last path component of a remote path (`/a/b/` → `b`).
pub fn base_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(pos) => &trimmed[pos + 1..],
        None => trimmed,
    }
}
