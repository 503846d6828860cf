//! Cache Store. See spec §3, §4.3.
//!
//! Content-addressed on-disk store keyed by fingerprint, with a two-level
//! fan-out directory layout and a JSON metadata sidecar.

use crate::fingerprint::Fingerprint;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Entries older than this are treated as absent.
pub const TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredHeaders {
    pub content_type: String,
    pub content_length: u64,
    pub cache_control: String,
    pub last_modified: String,
    pub etag: String,
    /// Pre-transform byte length, present only when a resize was applied.
    pub original_length: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    pub headers: StoredHeaders,
    pub created_at_unix: u64,
    pub sticky_error: Option<String>,
}

pub struct CacheHit {
    pub metadata: Metadata,
    pub payload_exists: bool,
}

#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
}

impl CacheStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        CacheStore { root: root.into() }
    }

    fn payload_path(&self, fp: Fingerprint) -> PathBuf {
        let hex = fp.to_hex();
        self.root.join(&hex[0..1]).join(&hex[1..2]).join(&hex)
    }

    fn meta_path(&self, fp: Fingerprint) -> PathBuf {
        let mut path = self.payload_path(fp).into_os_string();
        path.push("-meta");
        PathBuf::from(path)
    }

    /// Returns `None` if there is no usable entry: no metadata at all, or
    /// metadata present but expired and carrying no sticky error.
    pub fn lookup(&self, fp: Fingerprint) -> Option<CacheHit> {
        let meta_path = self.meta_path(fp);
        let bytes = std::fs::read(&meta_path).ok()?;
        let metadata: Metadata = serde_json::from_slice(&bytes).ok()?;

        if self.is_expired(&metadata) {
            return None;
        }

        if metadata.sticky_error.is_some() {
            return Some(CacheHit { payload_exists: false, metadata });
        }

        let payload_exists = self.payload_path(fp).is_file();
        Some(CacheHit { metadata, payload_exists })
    }

    fn is_expired(&self, metadata: &Metadata) -> bool {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
        now.saturating_sub(metadata.created_at_unix) > TTL.as_secs()
    }

    pub fn payload_reader(&self, fp: Fingerprint) -> io::Result<std::fs::File> {
        std::fs::File::open(self.payload_path(fp))
    }

    /// Promotes a temp file into place and writes the metadata sidecar.
    /// Atomic from a reader's standpoint: the payload is renamed into place
    /// only once it's fully written, and the sidecar is written last.
    pub fn store(
        &self,
        fp: Fingerprint,
        temp_payload: &Path,
        headers: StoredHeaders,
    ) -> io::Result<()> {
        let payload_path = self.payload_path(fp);
        if let Some(dir) = payload_path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::rename(temp_payload, &payload_path).or_else(|_| {
            // Cross-device rename fallback: copy then remove the source.
            std::fs::copy(temp_payload, &payload_path)?;
            std::fs::remove_file(temp_payload)
        })?;

        let metadata = Metadata {
            headers,
            created_at_unix: now_unix(),
            sticky_error: None,
        };
        self.write_metadata(fp, &metadata)
    }

    /// Stores a metadata-only record carrying a sticky error; no payload
    /// file is written or required.
    pub fn mark_error(&self, fp: Fingerprint, error_tag: &str, headers: StoredHeaders) -> io::Result<()> {
        let metadata = Metadata {
            headers,
            created_at_unix: now_unix(),
            sticky_error: Some(error_tag.to_string()),
        };
        self.write_metadata(fp, &metadata)
    }

    fn write_metadata(&self, fp: Fingerprint, metadata: &Metadata) -> io::Result<()> {
        let meta_path = self.meta_path(fp);
        if let Some(dir) = meta_path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let bytes = serde_json::to_vec(metadata)?;
        std::fs::write(meta_path, bytes)
    }
}

fn now_unix() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}
