//! Persistent peer pinning (trust-on-first-use).
//!
//! The store is a single JSON document. Every mutation rewrites the whole
//! document through a temporary sibling and a rename, so a crash leaves
//! either the previous or the new document on disk.

use async_trait::async_trait;
use thiserror::Error;

mod atomic;
mod trust;

pub use atomic::write_atomic;
pub use trust::{FileTrustStore, TrustedPeer, TRUST_FILE_NAME};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed trust store {path}: {source}")]
    Malformed {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("fingerprint must not be empty")]
    EmptyFingerprint,
}

impl StoreError {
    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// Trust store for peer fingerprints.
///
/// Callers inside one process are serialized by the implementation. Writers
/// in other processes are not coordinated with.
#[async_trait]
pub trait TrustStore: Send + Sync {
    async fn get(&self, fp: &str) -> Result<Option<TrustedPeer>, StoreError>;

    /// Pin `fp`, or refresh its label and last-seen time if already pinned.
    async fn add(&self, fp: &str, label: &str) -> Result<(), StoreError>;

    /// Remove a pin. Removing an unknown fingerprint is not an error.
    async fn remove(&self, fp: &str) -> Result<bool, StoreError>;

    async fn list(&self) -> Result<Vec<TrustedPeer>, StoreError>;
}
