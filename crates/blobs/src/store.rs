use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use sibyl_domain::error::{Error, Result};

use crate::redaction::RedactionPipeline;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Refs, kinds, metadata
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A content hash identifying an immutable payload: lowercase-hex SHA-256.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlobRef(String);

impl BlobRef {
    /// Parse a ref, validating the 64-char lowercase-hex shape.
    pub fn parse(s: &str) -> Result<Self> {
        if s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()) {
            Ok(Self(s.to_owned()))
        } else {
            Err(Error::Blob(format!("malformed blob ref: {s:?}")))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn of(bytes: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(bytes)))
    }
}

impl fmt::Display for BlobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a blob holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlobKind {
    Prompt,
    Response,
    Context,
    Error,
    Summary,
    SessionSummary,
}

/// Lightweight blob info returned by `stat`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobStat {
    pub size: u64,
    pub kind: BlobKind,
    pub redacted: bool,
}

/// Full sidecar metadata persisted next to each payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobMeta {
    pub kind: BlobKind,
    pub size: u64,
    pub storage_url: String,
    #[serde(default)]
    pub redaction_applied: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preimage_hmac: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Content-addressed blob storage.
pub trait BlobStore: Send + Sync {
    /// Store a payload, returning its ref. Idempotent: identical content
    /// yields the same ref and a single stored copy.
    fn put(&self, bytes: &[u8], kind: BlobKind) -> Result<BlobRef>;

    fn get(&self, blob_ref: &BlobRef) -> Result<Vec<u8>>;

    fn stat(&self, blob_ref: &BlobRef) -> Result<BlobStat>;

    /// Convenience: store a UTF-8 payload.
    fn put_text(&self, text: &str, kind: BlobKind) -> Result<BlobRef> {
        self.put(text.as_bytes(), kind)
    }

    /// Convenience: fetch a payload as UTF-8.
    fn get_text(&self, blob_ref: &BlobRef) -> Result<String> {
        String::from_utf8(self.get(blob_ref)?)
            .map_err(|e| Error::Blob(format!("blob {blob_ref} is not UTF-8: {e}")))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Filesystem backend
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Filesystem-backed blob store: one payload file per ref plus a JSON
/// metadata sidecar, under `<state_path>/blobs/`.
pub struct FsBlobStore {
    root: PathBuf,
    redaction: RedactionPipeline,
}

impl FsBlobStore {
    pub fn new(state_path: &Path, redaction: RedactionPipeline) -> Result<Self> {
        let root = state_path.join("blobs");
        std::fs::create_dir_all(&root).map_err(Error::Io)?;
        Ok(Self { root, redaction })
    }

    fn payload_path(&self, blob_ref: &BlobRef) -> PathBuf {
        self.root.join(blob_ref.as_str())
    }

    fn meta_path(&self, blob_ref: &BlobRef) -> PathBuf {
        self.root.join(format!("{}.json", blob_ref.as_str()))
    }

    /// Write via tmp file + rename so a crash never leaves a torn payload
    /// under a valid ref. The tmp suffix is appended (not substituted) so
    /// a payload and its metadata sidecar never share a tmp path.
    fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
        let tmp = PathBuf::from(format!("{}.tmp", path.display()));
        std::fs::write(&tmp, bytes).map_err(Error::Io)?;
        std::fs::rename(&tmp, path).map_err(Error::Io)?;
        Ok(())
    }

    fn read_meta(&self, blob_ref: &BlobRef) -> Result<BlobMeta> {
        let raw = std::fs::read_to_string(self.meta_path(blob_ref))
            .map_err(|_| Error::Blob(format!("unknown blob ref {blob_ref}")))?;
        serde_json::from_str(&raw).map_err(Error::Json)
    }
}

impl BlobStore for FsBlobStore {
    fn put(&self, bytes: &[u8], kind: BlobKind) -> Result<BlobRef> {
        let outcome = self.redaction.apply(bytes);
        let blob_ref = BlobRef::of(&outcome.bytes);

        let payload_path = self.payload_path(&blob_ref);
        if payload_path.exists() {
            return Ok(blob_ref);
        }

        Self::write_atomic(&payload_path, &outcome.bytes)?;
        let meta = BlobMeta {
            kind,
            size: outcome.bytes.len() as u64,
            storage_url: format!("file://{}", payload_path.display()),
            redaction_applied: outcome.applied,
            preimage_hmac: outcome.preimage_hmac,
            created_at: Utc::now(),
        };
        Self::write_atomic(&self.meta_path(&blob_ref), serde_json::to_vec(&meta)?.as_slice())?;

        tracing::debug!(blob_ref = %blob_ref, kind = ?kind, size = meta.size, "blob stored");
        Ok(blob_ref)
    }

    fn get(&self, blob_ref: &BlobRef) -> Result<Vec<u8>> {
        std::fs::read(self.payload_path(blob_ref))
            .map_err(|_| Error::Blob(format!("unknown blob ref {blob_ref}")))
    }

    fn stat(&self, blob_ref: &BlobRef) -> Result<BlobStat> {
        let meta = self.read_meta(blob_ref)?;
        Ok(BlobStat {
            size: meta.size,
            kind: meta.kind,
            redacted: !meta.redaction_applied.is_empty(),
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// In-memory backend (tests)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// In-memory blob store for unit tests.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<BlobRef, (Vec<u8>, BlobMeta)>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }
}

impl BlobStore for MemoryBlobStore {
    fn put(&self, bytes: &[u8], kind: BlobKind) -> Result<BlobRef> {
        let blob_ref = BlobRef::of(bytes);
        let mut blobs = self.blobs.write();
        blobs.entry(blob_ref.clone()).or_insert_with(|| {
            let meta = BlobMeta {
                kind,
                size: bytes.len() as u64,
                storage_url: format!("mem://{blob_ref}"),
                redaction_applied: Vec::new(),
                preimage_hmac: None,
                created_at: Utc::now(),
            };
            (bytes.to_vec(), meta)
        });
        Ok(blob_ref)
    }

    fn get(&self, blob_ref: &BlobRef) -> Result<Vec<u8>> {
        self.blobs
            .read()
            .get(blob_ref)
            .map(|(bytes, _)| bytes.clone())
            .ok_or_else(|| Error::Blob(format!("unknown blob ref {blob_ref}")))
    }

    fn stat(&self, blob_ref: &BlobRef) -> Result<BlobStat> {
        self.blobs
            .read()
            .get(blob_ref)
            .map(|(_, meta)| BlobStat {
                size: meta.size,
                kind: meta.kind,
                redacted: !meta.redaction_applied.is_empty(),
            })
            .ok_or_else(|| Error::Blob(format!("unknown blob ref {blob_ref}")))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use sibyl_domain::config::{BlobConfig, RedactionRule};

    fn fs_store(dir: &Path) -> FsBlobStore {
        FsBlobStore::new(dir, RedactionPipeline::disabled()).unwrap()
    }

    #[test]
    fn put_is_idempotent_and_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let store = fs_store(dir.path());

        let r1 = store.put(b"hello world", BlobKind::Prompt).unwrap();
        let r2 = store.put(b"hello world", BlobKind::Prompt).unwrap();
        assert_eq!(r1, r2);
        assert_eq!(store.get(&r1).unwrap(), b"hello world");
    }

    #[test]
    fn distinct_content_distinct_refs() {
        let dir = tempfile::tempdir().unwrap();
        let store = fs_store(dir.path());

        let r1 = store.put(b"a", BlobKind::Prompt).unwrap();
        let r2 = store.put(b"b", BlobKind::Prompt).unwrap();
        assert_ne!(r1, r2);
    }

    #[test]
    fn stat_reports_size_and_kind() {
        let dir = tempfile::tempdir().unwrap();
        let store = fs_store(dir.path());

        let r = store.put_text("summary text", BlobKind::SessionSummary).unwrap();
        let stat = store.stat(&r).unwrap();
        assert_eq!(stat.size, 12);
        assert_eq!(stat.kind, BlobKind::SessionSummary);
        assert!(!stat.redacted);
    }

    #[test]
    fn get_unknown_ref_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = fs_store(dir.path());
        let bogus = BlobRef::of(b"never stored");
        assert!(store.get(&bogus).is_err());
        assert!(store.stat(&bogus).is_err());
    }

    #[test]
    fn redacted_put_hashes_post_image() {
        let dir = tempfile::tempdir().unwrap();
        let config = BlobConfig {
            redaction: vec![RedactionRule {
                name: "host".into(),
                find: "secret-host".into(),
                replace: "[redacted]".into(),
            }],
            mask_secret_tokens: false,
            hmac_key_env: "SIBYL_TEST_UNSET_KEY".into(),
        };
        let store =
            FsBlobStore::new(dir.path(), RedactionPipeline::from_config(&config)).unwrap();

        let r = store.put(b"connect secret-host now", BlobKind::Context).unwrap();
        assert_eq!(store.get(&r).unwrap(), b"connect [redacted] now");

        // The ref is the hash of the redacted bytes.
        assert_eq!(r, BlobRef::of(b"connect [redacted] now"));
        assert!(store.stat(&r).unwrap().redacted);
    }

    #[test]
    fn ref_parse_validates_shape() {
        let good = BlobRef::of(b"x").to_string();
        assert!(BlobRef::parse(&good).is_ok());
        assert!(BlobRef::parse("not-a-ref").is_err());
        assert!(BlobRef::parse(&good.to_uppercase()).is_err());
    }

    #[test]
    fn memory_store_matches_fs_semantics() {
        let store = MemoryBlobStore::new();
        let r1 = store.put(b"payload", BlobKind::Response).unwrap();
        let r2 = store.put(b"payload", BlobKind::Response).unwrap();
        assert_eq!(r1, r2);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get_text(&r1).unwrap(), "payload");
    }

    #[test]
    fn storage_url_is_file_scheme() {
        let dir = tempfile::tempdir().unwrap();
        let store = fs_store(dir.path());
        let r = store.put(b"x", BlobKind::Prompt).unwrap();
        let meta = store.read_meta(&r).unwrap();
        assert!(meta.storage_url.starts_with("file://"));
    }
}
