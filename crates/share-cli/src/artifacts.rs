use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};

use crate::prompt;

/// A file the CLI knows how to share, relative to the source directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Artifact {
    pub file_name: &'static str,
    pub what: &'static str,
}

pub const CONFIG: Artifact = Artifact {
    file_name: "config.toml",
    what: "cluster configuration",
};
pub const DATABASE: Artifact = Artifact {
    file_name: "clusterData.db",
    what: "cluster database",
};
pub const KEY: Artifact = Artifact {
    file_name: "gns3key",
    what: "encryption key",
};

pub const ALL: [Artifact; 3] = [CONFIG, DATABASE, KEY];

/// Which artifacts the user asked for on the command line.
#[derive(Debug, Clone, Copy, Default)]
pub struct Selection {
    pub all: bool,
    pub config: bool,
    pub db: bool,
    pub key: bool,
}

impl Selection {
    pub fn is_empty(&self) -> bool {
        !(self.all || self.config || self.db || self.key)
    }

    fn wants(&self, artifact: &Artifact) -> bool {
        self.all
            || (self.config && *artifact == CONFIG)
            || (self.db && *artifact == DATABASE)
            || (self.key && *artifact == KEY)
    }
}

/// Resolve `src_dir` to an absolute directory.
pub async fn source_dir(src_dir: &Path) -> Result<PathBuf> {
    let dir = tokio::fs::canonicalize(src_dir)
        .await
        .with_context(|| format!("source directory {} does not exist", src_dir.display()))?;
    if !tokio::fs::metadata(&dir).await?.is_dir() {
        bail!("{} is not a directory", dir.display());
    }
    Ok(dir)
}

/// Artifacts from `selection` that exist in `dir`. Without flags, every
/// existing artifact is offered to the user in turn (or taken as-is when
/// `assume_yes`).
pub async fn choose(dir: &Path, selection: Selection, assume_yes: bool) -> Result<Vec<PathBuf>> {
    let mut chosen = Vec::new();
    for artifact in ALL {
        let path = dir.join(artifact.file_name);
        let exists = tokio::fs::metadata(&path)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false);

        if !selection.is_empty() {
            if !selection.wants(&artifact) {
                continue;
            }
            if !exists {
                tracing::warn!(file = %path.display(), "{} not found, skipping", artifact.what);
                println!("  ! {} not found, skipping", artifact.file_name);
                continue;
            }
            chosen.push(path);
            continue;
        }

        if !exists {
            tracing::debug!(file = %path.display(), "artifact absent");
            continue;
        }
        let take = assume_yes
            || prompt::ask(&format!("Send {} ({})?", artifact.file_name, artifact.what)).await;
        if take {
            chosen.push(path);
        }
    }

    if chosen.is_empty() {
        bail!("nothing to send from {}", dir.display());
    }
    Ok(chosen)
}
