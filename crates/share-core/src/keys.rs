use chrono::{DateTime, SubsecRound, Utc};
use ed25519_dalek::{SigningKey, KEYPAIR_LENGTH};
use rand_core::OsRng;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

use crate::error::{Result, ShareError};

pub const KEY_FILE_NAME: &str = "device_key.pem";
const PEM_LABEL: &str = "ED25519 PRIVATE KEY";
const CREATED_HEADER: &str = "Created";
const LABEL_COMPONENT_MAX: usize = 32;
const LABEL_FALLBACK: &str = "device";

/// Long-lived ed25519 identity of this device.
#[derive(Clone)]
pub struct DeviceKey {
    signing_key: SigningKey,
    created: DateTime<Utc>,
}

impl DeviceKey {
    /// New random key, stamped with the current time at second precision.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
            created: Utc::now().trunc_subsecs(0),
        }
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    pub fn fingerprint(&self) -> String {
        fingerprint(&self.public_key_bytes())
    }

    /// PEM block with a `Created` header and the 64 raw keypair bytes.
    pub fn to_pem(&self) -> Result<String> {
        let raw = Zeroizing::new(self.signing_key.to_keypair_bytes());
        let mut block = pem::Pem::new(PEM_LABEL, raw.to_vec());
        block
            .headers_mut()
            .add(CREATED_HEADER, &self.created.timestamp().to_string())
            .map_err(|e| ShareError::Config(format!("encoding key: {e}")))?;
        Ok(pem::encode_config(
            &block,
            pem::EncodeConfig::new().set_line_ending(pem::LineEnding::LF),
        ))
    }

    pub fn from_pem(text: &str) -> Result<Self> {
        let block = pem::parse(text).map_err(|e| ShareError::Config(format!("malformed PEM: {e}")))?;
        if block.tag() != PEM_LABEL {
            return Err(ShareError::Config(format!(
                "unexpected PEM label {:?}, want {:?}",
                block.tag(),
                PEM_LABEL
            )));
        }

        let created = block
            .headers()
            .get(CREATED_HEADER)
            .ok_or_else(|| ShareError::Config("key file has no Created header".into()))?;
        let created = created
            .trim()
            .parse::<i64>()
            .ok()
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .ok_or_else(|| ShareError::Config(format!("bad Created header {created:?}")))?;

        let raw: Zeroizing<[u8; KEYPAIR_LENGTH]> = Zeroizing::new(
            block.contents().try_into().map_err(|_| {
                ShareError::Config(format!(
                    "key is {} bytes, want {}",
                    block.contents().len(),
                    KEYPAIR_LENGTH
                ))
            })?,
        );
        let signing_key = SigningKey::from_keypair_bytes(&raw)
            .map_err(|e| ShareError::Config(format!("inconsistent key pair: {e}")))?;

        Ok(Self {
            signing_key,
            created,
        })
    }
}

/// base32 (RFC 4648, no padding) of SHA-256 over the public key. 52 characters.
pub fn fingerprint(public_key: &[u8]) -> String {
    let digest = Sha256::digest(public_key);
    base32::encode(base32::Alphabet::Rfc4648 { padding: false }, &digest)
}

/// `ABCD-EFGH-...` for display.
pub fn short_fingerprint(fp: &str) -> String {
    let chars: Vec<char> = fp.chars().collect();
    chars
        .chunks(4)
        .map(|c| c.iter().collect::<String>())
        .collect::<Vec<_>>()
        .join("-")
}

/// Accept the display form (dashes, any case) wherever a fingerprint is typed.
pub fn normalize_fingerprint(input: &str) -> String {
    input
        .chars()
        .filter(|c| *c != '-' && !c.is_whitespace())
        .flat_map(|c| c.to_uppercase())
        .collect()
}

/// `user@host` from the environment. Advisory only.
pub fn device_label() -> String {
    let user = std::env::var("USER")
        .ok()
        .filter(|u| !u.trim().is_empty())
        .or_else(|| std::env::var("USERNAME").ok());
    let host = gethostname::gethostname().to_string_lossy().into_owned();
    device_label_from(user.as_deref(), Some(&host))
}

pub fn device_label_from(user: Option<&str>, host: Option<&str>) -> String {
    format!("{}@{}", label_component(user), label_component(host))
}

fn label_component(raw: Option<&str>) -> String {
    let cleaned: String = raw
        .unwrap_or_default()
        .trim()
        .replace(' ', "-")
        .chars()
        .take(LABEL_COMPONENT_MAX)
        .collect();
    if cleaned.is_empty() {
        LABEL_FALLBACK.to_string()
    } else {
        cleaned
    }
}

/// On-disk home of the device key.
#[derive(Debug, Clone)]
pub struct IdentityStore {
    dir: PathBuf,
}

impl IdentityStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn key_path(&self) -> PathBuf {
        self.dir.join(KEY_FILE_NAME)
    }

    /// Load the key, creating it on first use. An existing file that does
    /// not parse is an error and is left untouched.
    pub async fn load_or_create(&self) -> Result<DeviceKey> {
        let path = self.key_path();
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => {
                let key = DeviceKey::from_pem(&text).map_err(|e| match e {
                    ShareError::Config(msg) => {
                        ShareError::Config(format!("{}: {}", path.display(), msg))
                    }
                    other => other,
                })?;
                tracing::debug!(path = %path.display(), fp = %key.fingerprint(), "loaded device key");
                Ok(key)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let key = DeviceKey::generate();
                self.store(&key).await?;
                tracing::info!(path = %path.display(), fp = %key.fingerprint(), "generated device key");
                Ok(key)
            }
            Err(e) => Err(ShareError::Config(format!(
                "reading {}: {}",
                path.display(),
                e
            ))),
        }
    }

    /// Replace the key in place. Peers that pinned the old key will not
    /// recognise this device until they pin it again.
    pub async fn rotate(&self) -> Result<DeviceKey> {
        let key = DeviceKey::generate();
        self.store(&key).await?;
        tracing::warn!(fp = %key.fingerprint(), "device key rotated; peers must re-pin");
        Ok(key)
    }

    async fn store(&self, key: &DeviceKey) -> Result<()> {
        ensure_private_dir(&self.dir).await?;
        let text = Zeroizing::new(key.to_pem()?);
        storage::write_atomic(&self.key_path(), text.as_bytes()).await?;
        Ok(())
    }
}

async fn ensure_private_dir(dir: &Path) -> Result<()> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| ShareError::Config(format!("creating {}: {}", dir.display(), e)))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))
            .await
            .map_err(|e| ShareError::Config(format!("chmod {}: {}", dir.display(), e)))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn fingerprint_shape() {
        let key = DeviceKey::generate();
        let fp = key.fingerprint();
        assert_eq!(fp.len(), 52);
        assert!(fp.chars().all(|c| c.is_ascii_uppercase() || ('2'..='7').contains(&c)));
        assert_eq!(fp, fingerprint(&key.public_key_bytes()));
        assert_ne!(fp, DeviceKey::generate().fingerprint());
    }

    #[test]
    fn short_form_groups_by_four() {
        let fp = "ABCDEFGHIJ";
        assert_eq!(short_fingerprint(fp), "ABCD-EFGH-IJ");
        let full = DeviceKey::generate().fingerprint();
        let short = short_fingerprint(&full);
        assert_eq!(short.len(), 52 + 12);
        assert_eq!(normalize_fingerprint(&short.to_lowercase()), full);
    }

    #[test]
    fn pem_round_trip_keeps_key_and_time() {
        let key = DeviceKey::generate();
        let text = key.to_pem().unwrap();
        assert!(text.starts_with("-----BEGIN ED25519 PRIVATE KEY-----"));
        assert!(text.contains("Created: "));

        let back = DeviceKey::from_pem(&text).unwrap();
        assert_eq!(back.public_key_bytes(), key.public_key_bytes());
        assert_eq!(back.created(), key.created());
    }

    #[test]
    fn pem_rejects_wrong_label_and_size() {
        let key = DeviceKey::generate();
        let text = key.to_pem().unwrap().replace(PEM_LABEL, "PRIVATE KEY");
        assert!(matches!(DeviceKey::from_pem(&text), Err(ShareError::Config(_))));

        let mut short = pem::Pem::new(PEM_LABEL, vec![0u8; 32]);
        short.headers_mut().add(CREATED_HEADER, "1700000000").unwrap();
        let err = DeviceKey::from_pem(&pem::encode(&short)).err().unwrap();
        assert!(err.to_string().contains("32 bytes"));
    }

    #[test]
    fn label_is_sanitized() {
        assert_eq!(device_label_from(Some(" ann lee "), Some("lab box")), "ann-lee@lab-box");
        assert_eq!(device_label_from(None, Some("  ")), "device@device");
        let long = "x".repeat(40);
        let label = device_label_from(Some(&long), Some("h"));
        assert_eq!(label, format!("{}@h", "x".repeat(32)));
        let wide = "é".repeat(33);
        assert_eq!(device_label_from(Some(&wide), Some("h")).chars().count(), 32 + 2);
    }

    #[tokio::test]
    async fn load_or_create_persists_and_reloads() {
        let dir = TempDir::new().unwrap();
        let store = IdentityStore::new(dir.path().join("app"));
        let first = store.load_or_create().await.unwrap();
        let again = store.load_or_create().await.unwrap();
        assert_eq!(first.fingerprint(), again.fingerprint());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let file_mode = std::fs::metadata(store.key_path()).unwrap().permissions().mode();
            assert_eq!(file_mode & 0o777, 0o600);
            let dir_mode = std::fs::metadata(dir.path().join("app")).unwrap().permissions().mode();
            assert_eq!(dir_mode & 0o777, 0o700);
        }
    }

    #[tokio::test]
    async fn unparseable_key_is_not_replaced() {
        let dir = TempDir::new().unwrap();
        let store = IdentityStore::new(dir.path());
        std::fs::write(store.key_path(), "garbage").unwrap();
        assert!(matches!(store.load_or_create().await, Err(ShareError::Config(_))));
        assert_eq!(std::fs::read_to_string(store.key_path()).unwrap(), "garbage");
    }

    #[tokio::test]
    async fn rotate_replaces_key() {
        let dir = TempDir::new().unwrap();
        let store = IdentityStore::new(dir.path());
        let old = store.load_or_create().await.unwrap();
        let new = store.rotate().await.unwrap();
        assert_ne!(old.fingerprint(), new.fingerprint());
        let loaded = store.load_or_create().await.unwrap();
        assert_eq!(loaded.fingerprint(), new.fingerprint());
    }
}
