use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use crate::{write_atomic, StoreError, TrustStore};

pub const TRUST_FILE_NAME: &str = "trust.json";

/// A pinned peer. Identity is the fingerprint; the label is whatever the peer
/// called itself the last time we saw it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustedPeer {
    pub fp: String,
    pub label: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct TrustDocument {
    #[serde(default)]
    peers: Vec<TrustedPeer>,
}

impl TrustDocument {
    fn find(&self, fp: &str) -> Option<&TrustedPeer> {
        self.peers.iter().find(|p| p.fp == fp)
    }

    /// Keep the last entry for each fingerprint.
    fn dedup(mut self) -> Self {
        let mut out: Vec<TrustedPeer> = Vec::with_capacity(self.peers.len());
        for peer in self.peers.drain(..) {
            if let Some(existing) = out.iter_mut().find(|p| p.fp == peer.fp) {
                *existing = peer;
            } else {
                out.push(peer);
            }
        }
        Self { peers: out }
    }
}

/// `trust.json` backed store. The whole document is cached in memory and
/// rewritten atomically on every mutation.
pub struct FileTrustStore {
    path: PathBuf,
    doc: Mutex<TrustDocument>,
}

impl FileTrustStore {
    /// Open (or start) the store in `dir`. A malformed document is an error;
    /// it is never replaced silently.
    pub async fn open(dir: &Path) -> Result<Self, StoreError> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| StoreError::io(dir, e))?;

        let path = dir.join(TRUST_FILE_NAME);
        let doc = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let doc: TrustDocument =
                    serde_json::from_slice(&bytes).map_err(|source| StoreError::Malformed {
                        path: path.display().to_string(),
                        source,
                    })?;
                doc.dedup()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => TrustDocument::default(),
            Err(e) => return Err(StoreError::io(&path, e)),
        };

        tracing::debug!(path = %path.display(), peers = doc.peers.len(), "opened trust store");
        Ok(Self {
            path,
            doc: Mutex::new(doc),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, doc: &TrustDocument) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(doc).map_err(|source| StoreError::Malformed {
            path: self.path.display().to_string(),
            source,
        })?;
        write_atomic(&self.path, &json).await
    }
}

#[async_trait]
impl TrustStore for FileTrustStore {
    async fn get(&self, fp: &str) -> Result<Option<TrustedPeer>, StoreError> {
        let doc = self.doc.lock().await;
        Ok(doc.find(fp).cloned())
    }

    async fn add(&self, fp: &str, label: &str) -> Result<(), StoreError> {
        if fp.trim().is_empty() {
            return Err(StoreError::EmptyFingerprint);
        }

        let mut doc = self.doc.lock().await;
        let now = Utc::now();
        let mut next = doc.clone();
        match next.peers.iter_mut().find(|p| p.fp == fp) {
            Some(peer) => {
                peer.label = label.to_string();
                peer.last_seen = now;
            }
            None => next.peers.push(TrustedPeer {
                fp: fp.to_string(),
                label: label.to_string(),
                first_seen: now,
                last_seen: now,
            }),
        }

        self.persist(&next).await?;
        *doc = next;
        tracing::info!(fp = %fp, label = %label, "pinned peer");
        Ok(())
    }

    async fn remove(&self, fp: &str) -> Result<bool, StoreError> {
        let mut doc = self.doc.lock().await;
        if doc.find(fp).is_none() {
            return Ok(false);
        }

        let mut next = doc.clone();
        next.peers.retain(|p| p.fp != fp);
        self.persist(&next).await?;
        *doc = next;
        tracing::info!(fp = %fp, "removed pin");
        Ok(true)
    }

    async fn list(&self) -> Result<Vec<TrustedPeer>, StoreError> {
        let doc = self.doc.lock().await;
        Ok(doc.peers.clone())
    }
}
