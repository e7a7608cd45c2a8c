//! QUIC transport for share sessions.
//!
//! Every endpoint presents a self-signed certificate over its device key and
//! accepts any ed25519 certificate from the other side. The remote identity
//! is the key in that certificate; deciding whether to trust it happens
//! above this layer, helped by the SAS derived in [`sas`].

use thiserror::Error;

pub mod codes;
mod endpoint;
pub mod sas;
mod tls;
mod wordlist;

pub use endpoint::{dial, Listener, PeerClose, PeerConnection, Role};
pub use quinn::{ConnectionError, RecvStream, SendStream};
pub use sas::{derive_sas, fresh_nonce, Sas, NONCE_LEN};
pub use tls::{peer_public_key, TlsIdentity};

/// The only application protocol either side will speak.
pub const ALPN: &[u8] = b"gns3util/1";

/// SNI and certificate subject. Never checked; there is no PKI.
pub const SERVER_NAME: &str = "gns3util";

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("certificate generation failed: {0}")]
    Certificate(String),
    #[error("tls configuration: {0}")]
    Tls(#[from] rustls::Error),
    #[error("quic configuration: {0}")]
    Config(String),
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
    #[error("connect failed: {0}")]
    Connect(#[from] quinn::ConnectError),
    #[error("connection lost: {0}")]
    Connection(#[from] quinn::ConnectionError),
    #[error("peer did not negotiate ALPN gns3util/1")]
    Alpn,
    #[error("bad peer certificate: {0}")]
    PeerKey(String),
    #[error("SAS length must be 3..=6 words, got {0}")]
    SasLength(usize),
}
