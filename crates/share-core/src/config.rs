use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, ShareError};

pub const CONFIG_FILE_NAME: &str = "share.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShareConfig {
    /// Holds `device_key.pem`, `trust.json` and `share.json`.
    pub app_dir: PathBuf,

    /// Where artifacts are read from when sending and written to when receiving.
    pub artifact_dir: PathBuf,

    /// mDNS service type
    pub service_type: String,

    /// Per-message deadline on the control stream.
    pub control_timeout_secs: u64,

    /// How long a receiver waits for the sender to confirm the SAS.
    pub verify_timeout_secs: u64,

    /// How long a sender waits, after the last byte, for the receiver to
    /// confirm everything is on disk.
    pub finish_timeout_secs: u64,

    /// A receiver with no inbound connection for this long exits.
    pub idle_timeout_secs: u64,

    pub discover_timeout_ms: u64,

    /// Number of SAS words, 3..=6.
    pub sas_words: usize,
}

impl Default for ShareConfig {
    fn default() -> Self {
        Self {
            app_dir: default_app_dir(),
            artifact_dir: dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".gns3"),
            service_type: mdns_core::SERVICE_TYPE.to_string(),
            control_timeout_secs: 5,
            verify_timeout_secs: 120,
            finish_timeout_secs: 30,
            idle_timeout_secs: 300,
            discover_timeout_ms: 3000,
            sas_words: transport_quic::sas::DEFAULT_WORDS,
        }
    }
}

pub fn default_app_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("gns3util")
}

impl ShareConfig {
    /// Read `share.json` from `app_dir` if it exists. Missing fields take
    /// defaults; `app_dir` is always the directory the file was looked up in.
    pub async fn load(app_dir: &Path) -> Result<Self> {
        let path = app_dir.join(CONFIG_FILE_NAME);
        let mut config = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<ShareConfig>(&bytes).map_err(|e| {
                ShareError::Config(format!("malformed {}: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ShareConfig::default(),
            Err(e) => {
                return Err(ShareError::Config(format!(
                    "reading {}: {}",
                    path.display(),
                    e
                )))
            }
        };
        config.app_dir = app_dir.to_path_buf();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let words = transport_quic::sas::MIN_WORDS..=transport_quic::sas::MAX_WORDS;
        if !words.contains(&self.sas_words) {
            return Err(ShareError::Config(format!(
                "sas_words must be between 3 and 6, got {}",
                self.sas_words
            )));
        }
        if self.control_timeout_secs == 0 {
            return Err(ShareError::Config("control_timeout_secs must be positive".into()));
        }
        if self.finish_timeout_secs == 0 {
            return Err(ShareError::Config("finish_timeout_secs must be positive".into()));
        }
        if self.service_type.trim().is_empty() {
            return Err(ShareError::Config("service_type must not be empty".into()));
        }
        Ok(())
    }

    pub fn control_timeout(&self) -> Duration {
        Duration::from_secs(self.control_timeout_secs)
    }

    pub fn verify_timeout(&self) -> Duration {
        Duration::from_secs(self.verify_timeout_secs)
    }

    pub fn finish_timeout(&self) -> Duration {
        Duration::from_secs(self.finish_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn discover_timeout(&self) -> Duration {
        Duration::from_millis(self.discover_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let cfg = ShareConfig::load(dir.path()).await.unwrap();
        assert_eq!(cfg.app_dir, dir.path());
        assert_eq!(cfg.control_timeout(), Duration::from_secs(5));
        assert_eq!(cfg.idle_timeout(), Duration::from_secs(300));
        assert_eq!(cfg.sas_words, 3);
        assert_eq!(cfg.service_type, "_gns3util-share._udp.local.");
    }

    #[tokio::test]
    async fn partial_file_overrides_some_fields() {
        let dir = TempDir::new().unwrap();
        tokio::fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            br#"{"sas_words": 5, "discover_timeout_ms": 750}"#,
        )
        .await
        .unwrap();
        let cfg = ShareConfig::load(dir.path()).await.unwrap();
        assert_eq!(cfg.sas_words, 5);
        assert_eq!(cfg.discover_timeout(), Duration::from_millis(750));
        assert_eq!(cfg.verify_timeout_secs, 120);
    }

    #[tokio::test]
    async fn malformed_or_invalid_file_is_config_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);

        tokio::fs::write(&path, b"{not json").await.unwrap();
        assert!(matches!(
            ShareConfig::load(dir.path()).await,
            Err(ShareError::Config(_))
        ));

        tokio::fs::write(&path, br#"{"sas_words": 9}"#).await.unwrap();
        assert!(matches!(
            ShareConfig::load(dir.path()).await,
            Err(ShareError::Config(_))
        ));
    }
}
