//! Content-addressed blob storage.
//!
//! Every payload is keyed by the lowercase-hex SHA-256 of its (possibly
//! redacted) bytes, so `put` is idempotent and dedup is O(1). Payloads are
//! immutable once stored. Two backends share the [`BlobStore`] trait: a
//! filesystem store for real runs and an in-memory store for tests.

mod redaction;
mod store;

pub use redaction::{RedactionOutcome, RedactionPipeline};
pub use store::{BlobKind, BlobMeta, BlobRef, BlobStat, BlobStore, FsBlobStore, MemoryBlobStore};
