use mdns_core::DiscoveryError;
use storage::StoreError;
use thiserror::Error;
use transport_quic::{codes, PeerClose, TransportError};

/// Everything that can end a share command.
#[derive(Error, Debug)]
pub enum ShareError {
    /// Key file, trust store or `share.json` unusable.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("discovery failed: {0}")]
    Discovery(#[from] DiscoveryError),

    /// TLS failure, ALPN mismatch, wrong or missing peer key.
    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("verification rejected: {0}")]
    VerificationRejected(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    /// Local or remote file I/O, or a stream that died mid-file.
    #[error("transfer failed: {0}")]
    Transfer(String),

    #[error("cancelled")]
    Cancelled,

    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),
}

pub type Result<T> = std::result::Result<T, ShareError>;

impl ShareError {
    /// Application close code for the QUIC connection.
    pub fn close_code(&self) -> u32 {
        match self {
            ShareError::Config(_) | ShareError::Discovery(_) => codes::INTERNAL,
            ShareError::Handshake(_) => codes::HANDSHAKE,
            ShareError::VerificationRejected(_) => codes::REJECTED,
            ShareError::Protocol(_) => codes::PROTOCOL,
            ShareError::Transfer(_) => codes::TRANSFER,
            ShareError::Cancelled | ShareError::DeadlineExceeded(_) => codes::CANCELLED,
        }
    }

    /// Interpret a close frame sent by the peer.
    pub fn from_peer_close(close: &PeerClose) -> Self {
        let reason = if close.reason.is_empty() {
            codes::describe(close.code).to_string()
        } else {
            close.reason.clone()
        };
        match u32::try_from(close.code).unwrap_or(u32::MAX) {
            codes::DONE => ShareError::Protocol("peer ended the session early".into()),
            codes::PROTOCOL => ShareError::Protocol(format!("peer reported: {reason}")),
            codes::REJECTED => ShareError::VerificationRejected(format!("peer reported: {reason}")),
            codes::TRANSFER => ShareError::Transfer(format!("peer reported: {reason}")),
            codes::HANDSHAKE => ShareError::Handshake(format!("peer reported: {reason}")),
            codes::CANCELLED => ShareError::Cancelled,
            _ => ShareError::Protocol(format!("peer closed with code {}: {reason}", close.code)),
        }
    }

    pub(crate) fn io(context: &str, e: std::io::Error) -> Self {
        ShareError::Transfer(format!("{context}: {e}"))
    }
}

impl From<StoreError> for ShareError {
    fn from(e: StoreError) -> Self {
        ShareError::Config(e.to_string())
    }
}

impl From<TransportError> for ShareError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Connection(quinn_err) => match quinn_err {
                transport_quic::ConnectionError::ApplicationClosed(close) => {
                    ShareError::from_peer_close(&PeerClose {
                        code: close.error_code.into_inner(),
                        reason: String::from_utf8_lossy(&close.reason).into_owned(),
                    })
                }
                transport_quic::ConnectionError::TimedOut => {
                    ShareError::DeadlineExceeded("connection idle timeout".into())
                }
                transport_quic::ConnectionError::LocallyClosed => ShareError::Cancelled,
                other => ShareError::Handshake(other.to_string()),
            },
            TransportError::Certificate(_) | TransportError::SasLength(_) => {
                ShareError::Config(e.to_string())
            }
            TransportError::Io(io) => ShareError::Transfer(format!("socket error: {io}")),
            other => ShareError::Handshake(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(code: u32, reason: &str) -> PeerClose {
        PeerClose {
            code: code as u64,
            reason: reason.into(),
        }
    }

    #[test]
    fn close_codes_round_trip_through_peer() {
        let cases = [
            ShareError::Protocol("x".into()),
            ShareError::VerificationRejected("x".into()),
            ShareError::Transfer("x".into()),
            ShareError::Handshake("x".into()),
        ];
        for err in cases {
            let seen = ShareError::from_peer_close(&close(err.close_code(), "x"));
            assert_eq!(
                std::mem::discriminant(&seen),
                std::mem::discriminant(&err),
                "{err:?} came back as {seen:?}"
            );
        }
    }

    #[test]
    fn rejected_close_reads_as_verification_rejected() {
        let err = ShareError::from_peer_close(&close(codes::REJECTED, "user declined"));
        assert!(matches!(err, ShareError::VerificationRejected(ref m) if m.contains("user declined")));
    }

    #[test]
    fn unknown_code_is_protocol_error() {
        let err = ShareError::from_peer_close(&close(99, ""));
        assert!(matches!(err, ShareError::Protocol(_)));
    }

    #[test]
    fn store_errors_are_config_errors() {
        let err: ShareError = StoreError::EmptyFingerprint.into();
        assert!(matches!(err, ShareError::Config(_)));
        assert_eq!(err.close_code(), codes::INTERNAL);
    }
}
