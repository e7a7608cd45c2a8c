//! Short authentication string.
//!
//! Both ends feed the server's device public key and the two session nonces
//! through HKDF-SHA256 and map the output onto the PGP word list. The nonces
//! are sorted first, so the result does not depend on which side computes it.

use hkdf::Hkdf;
use rand_core::{OsRng, RngCore};
use sha2::Sha256;
use std::fmt;

use crate::wordlist::{EVEN, ODD};
use crate::TransportError;

pub const NONCE_LEN: usize = 32;
pub const MIN_WORDS: usize = 3;
pub const MAX_WORDS: usize = 6;
pub const DEFAULT_WORDS: usize = 3;

const SAS_INFO: &[u8] = b"SAS/PGP-words v1";

/// Derived words, displayed joined by `-`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sas(Vec<&'static str>);

impl Sas {
    pub fn words(&self) -> &[&'static str] {
        &self.0
    }
}

impl fmt::Display for Sas {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("-"))
    }
}

/// 32 bytes from the OS RNG, one per side per session.
pub fn fresh_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

pub fn derive_sas(
    server_public_key: &[u8],
    client_nonce: &[u8; NONCE_LEN],
    server_nonce: &[u8; NONCE_LEN],
    words: usize,
) -> Result<Sas, TransportError> {
    if !(MIN_WORDS..=MAX_WORDS).contains(&words) {
        return Err(TransportError::SasLength(words));
    }

    let (lo, hi) = if client_nonce <= server_nonce {
        (client_nonce, server_nonce)
    } else {
        (server_nonce, client_nonce)
    };
    let mut salt = [0u8; NONCE_LEN * 2];
    salt[..NONCE_LEN].copy_from_slice(lo);
    salt[NONCE_LEN..].copy_from_slice(hi);

    let hk = Hkdf::<Sha256>::new(Some(&salt), server_public_key);
    let mut okm = [0u8; MAX_WORDS * 2];
    let okm = &mut okm[..words * 2];
    hk.expand(SAS_INFO, okm)
        .map_err(|_| TransportError::Config("HKDF expand failed".into()))?;

    let out = okm
        .chunks_exact(2)
        .enumerate()
        .map(|(i, group)| {
            let idx = group[0] as usize;
            if i % 2 == 0 {
                EVEN[idx]
            } else {
                ODD[idx]
            }
        })
        .collect();
    Ok(Sas(out))
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_A: [u8; 32] = [7u8; 32];
    const KEY_B: [u8; 32] = [9u8; 32];

    #[test]
    fn both_roles_agree() {
        let nc = fresh_nonce();
        let ns = fresh_nonce();
        let client_side = derive_sas(&KEY_A, &nc, &ns, DEFAULT_WORDS).unwrap();
        // The server passes the same values; argument order of the nonces
        // must not matter either.
        let server_side = derive_sas(&KEY_A, &ns, &nc, DEFAULT_WORDS).unwrap();
        assert_eq!(client_side, server_side);
        assert_eq!(client_side.words().len(), 3);
    }

    #[test]
    fn different_server_key_changes_words() {
        let nc = [1u8; NONCE_LEN];
        let ns = [2u8; NONCE_LEN];
        let a = derive_sas(&KEY_A, &nc, &ns, MAX_WORDS).unwrap();
        let b = derive_sas(&KEY_B, &nc, &ns, MAX_WORDS).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn word_columns_alternate() {
        let sas = derive_sas(&KEY_A, &[3u8; NONCE_LEN], &[4u8; NONCE_LEN], 6).unwrap();
        for (i, w) in sas.words().iter().enumerate() {
            if i % 2 == 0 {
                assert!(EVEN.contains(w), "{w} not in even column");
            } else {
                assert!(ODD.contains(w), "{w} not in odd column");
            }
        }
    }

    #[test]
    fn display_joins_with_dash() {
        let sas = derive_sas(&KEY_A, &[5u8; NONCE_LEN], &[6u8; NONCE_LEN], 3).unwrap();
        let shown = sas.to_string();
        assert_eq!(shown.split('-').count(), 3);
        assert_eq!(shown.split('-').collect::<Vec<_>>(), sas.words());
    }

    #[test]
    fn word_count_bounds() {
        let n = [0u8; NONCE_LEN];
        assert!(matches!(
            derive_sas(&KEY_A, &n, &n, 2),
            Err(TransportError::SasLength(2))
        ));
        assert!(derive_sas(&KEY_A, &n, &n, 7).is_err());
        assert_eq!(derive_sas(&KEY_A, &n, &n, 6).unwrap().words().len(), 6);
    }

    #[test]
    fn nonces_are_fresh() {
        assert_ne!(fresh_nonce(), fresh_nonce());
    }
}
