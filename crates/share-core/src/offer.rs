use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::io::AsyncReadExt;

use crate::error::{Result, ShareError};

/// Longest file name a data stream header may carry.
pub const MAX_NAME_LEN: usize = 4096;

/// One offered file. `name` is a bare file name, never a path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    pub name: String,
    pub size: u64,
    /// Lower-case hex digest of the content, when the sender computed it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Offer {
    pub files: Vec<FileMeta>,
    pub total: u64,
}

impl Offer {
    /// Receiver-side checks before any data stream is read.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        let mut sum: u64 = 0;
        for f in &self.files {
            validate_name(&f.name)?;
            if !seen.insert(f.name.as_str()) {
                return Err(ShareError::Protocol(format!("{:?} offered twice", f.name)));
            }
            if let Some(digest) = &f.sha256 {
                if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
                    return Err(ShareError::Protocol(format!("bad sha256 for {:?}", f.name)));
                }
            }
            sum = sum
                .checked_add(f.size)
                .ok_or_else(|| ShareError::Protocol("offer total overflows".into()))?;
        }
        if sum != self.total {
            return Err(ShareError::Protocol(format!(
                "offer total {} does not match file sizes ({})",
                self.total, sum
            )));
        }
        Ok(())
    }
}

/// Reject anything that could resolve outside the destination directory.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(ShareError::Protocol("empty file name".into()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(ShareError::Protocol(format!(
            "file name is {} bytes, limit {}",
            name.len(),
            MAX_NAME_LEN
        )));
    }
    if name.contains('/') || name.contains('\\') {
        return Err(ShareError::Protocol(format!(
            "file name {:?} contains a path separator",
            name
        )));
    }
    if name == "." || name == ".." {
        return Err(ShareError::Protocol(format!("file name {:?} is not allowed", name)));
    }
    if name.contains('\0') {
        return Err(ShareError::Protocol("file name contains NUL".into()));
    }
    Ok(())
}

/// Offer plus the local path backing each entry, in offer order.
#[derive(Debug, Clone)]
pub struct PreparedOffer {
    pub offer: Offer,
    pub sources: Vec<PathBuf>,
}

/// Build an offer from absolute paths. Directories, symlinks and other
/// non-regular files are skipped.
pub async fn build_offer(paths: &[PathBuf]) -> Result<PreparedOffer> {
    let mut offer = Offer::default();
    let mut sources = Vec::new();

    for path in paths {
        if !path.is_absolute() {
            return Err(ShareError::Config(format!(
                "{} is not an absolute path",
                path.display()
            )));
        }
        let meta = tokio::fs::symlink_metadata(path)
            .await
            .map_err(|e| ShareError::io(&format!("stat {}", path.display()), e))?;
        if !meta.file_type().is_file() {
            tracing::debug!(path = %path.display(), "skipping non-regular file");
            continue;
        }

        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                ShareError::Config(format!("{} has no UTF-8 file name", path.display()))
            })?
            .to_string();
        validate_name(&name).map_err(|e| ShareError::Config(e.to_string()))?;

        let (size, digest) = hash_file(path).await?;
        offer.total += size;
        offer.files.push(FileMeta {
            name,
            size,
            sha256: Some(digest),
        });
        sources.push(path.clone());
    }

    Ok(PreparedOffer { offer, sources })
}

async fn hash_file(path: &Path) -> Result<(u64, String)> {
    let ctx = format!("reading {}", path.display());
    let mut f = tokio::fs::File::open(path)
        .await
        .map_err(|e| ShareError::io(&ctx, e))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut size = 0u64;
    loop {
        let n = f.read(&mut buf).await.map_err(|e| ShareError::io(&ctx, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((size, hex::encode(hasher.finalize())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn hostile_names_are_rejected() {
        for bad in ["", ".", "..", "../../etc/passwd", "a/b", "a\\b", "nul\0"] {
            assert!(
                matches!(validate_name(bad), Err(ShareError::Protocol(_))),
                "{bad:?} accepted"
            );
        }
        assert!(validate_name(&"x".repeat(MAX_NAME_LEN + 1)).is_err());
        for good in ["config.toml", "clusterData.db", ".hidden", "a..b"] {
            assert!(validate_name(good).is_ok(), "{good:?} rejected");
        }
    }

    #[test]
    fn offer_total_must_match() {
        let mut offer = Offer {
            files: vec![
                FileMeta { name: "a".into(), size: 3, sha256: None },
                FileMeta { name: "b".into(), size: 4, sha256: None },
            ],
            total: 7,
        };
        assert!(offer.validate().is_ok());
        offer.total = 8;
        assert!(matches!(offer.validate(), Err(ShareError::Protocol(_))));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let offer = Offer {
            files: vec![
                FileMeta { name: "a".into(), size: 1, sha256: None },
                FileMeta { name: "a".into(), size: 1, sha256: None },
            ],
            total: 2,
        };
        assert!(offer.validate().is_err());
    }

    #[tokio::test]
    async fn build_offer_skips_dirs_and_symlinks() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.toml");
        std::fs::write(&a, b"hello=world\n").unwrap();
        let sub = dir.path().join("sub");
        std::fs::create_dir(&sub).unwrap();
        let mut paths = vec![a.clone(), sub];

        #[cfg(unix)]
        {
            let link = dir.path().join("link");
            std::os::unix::fs::symlink(&a, &link).unwrap();
            paths.push(link);
        }

        let prepared = build_offer(&paths).await.unwrap();
        assert_eq!(prepared.sources, vec![a]);
        assert_eq!(prepared.offer.total, 12);
        let meta = &prepared.offer.files[0];
        assert_eq!(meta.name, "a.toml");
        assert_eq!(meta.size, 12);
        assert_eq!(
            meta.sha256.as_deref(),
            Some(hex::encode(Sha256::digest(b"hello=world\n")).as_str())
        );
        assert!(prepared.offer.validate().is_ok());
    }

    #[tokio::test]
    async fn relative_paths_are_refused() {
        let err = build_offer(&[PathBuf::from("config.toml")]).await.unwrap_err();
        assert!(matches!(err, ShareError::Config(_)));
    }
}
