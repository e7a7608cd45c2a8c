//! Control stream: length-prefixed JSON messages in a fixed order.
//!
//! Hello (both sides, client first), Sas (both sides, client first), then
//! one Offer from the sender. Each step asks for exactly one message type.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use transport_quic::NONCE_LEN;

use crate::error::{Result, ShareError};
use crate::offer::Offer;

/// Upper bound on one control frame.
pub const MAX_CONTROL_FRAME: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlMessage {
    Hello { label: String, fp: String },
    /// 32 random bytes, lower-case hex.
    Sas { nonce: String },
    Offer(Offer),
}

impl ControlMessage {
    pub fn sas(nonce: &[u8; NONCE_LEN]) -> Self {
        ControlMessage::Sas {
            nonce: hex::encode(nonce),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::Hello { .. } => "hello",
            ControlMessage::Sas { .. } => "sas",
            ControlMessage::Offer(_) => "offer",
        }
    }
}

/// Minimal length-prefixed frame helpers (u32 BE length).
pub async fn write_frame<W: AsyncWrite + Unpin + Send>(w: &mut W, data: &[u8]) -> std::io::Result<()> {
    if data.len() > MAX_CONTROL_FRAME {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "control frame too large",
        ));
    }
    w.write_all(&(data.len() as u32).to_be_bytes()).await?;
    w.write_all(data).await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_frame<R: AsyncRead + Unpin + Send>(r: &mut R) -> std::io::Result<Vec<u8>> {
    let mut lenb = [0u8; 4];
    r.read_exact(&mut lenb).await?;
    let len = u32::from_be_bytes(lenb) as usize;

    if len > MAX_CONTROL_FRAME {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "control frame too large",
        ));
    }

    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).await?;
    Ok(buf)
}

pub fn decode_nonce(hex_nonce: &str) -> Result<[u8; NONCE_LEN]> {
    let bytes = hex::decode(hex_nonce)
        .map_err(|e| ShareError::Protocol(format!("sas nonce is not hex: {e}")))?;
    bytes.try_into().map_err(|b: Vec<u8>| {
        ShareError::Protocol(format!("sas nonce is {} bytes, want {}", b.len(), NONCE_LEN))
    })
}

/// Both halves of the control stream plus the deadline and cancellation
/// every read and write observes.
pub struct ControlChannel<W, R> {
    send: W,
    recv: R,
    timeout: Duration,
    cancel: CancellationToken,
}

impl<W, R> ControlChannel<W, R>
where
    W: AsyncWrite + Unpin + Send,
    R: AsyncRead + Unpin + Send,
{
    pub fn new(send: W, recv: R, timeout: Duration, cancel: CancellationToken) -> Self {
        Self {
            send,
            recv,
            timeout,
            cancel,
        }
    }

    pub async fn send(&mut self, msg: &ControlMessage) -> Result<()> {
        let body = serde_json::to_vec(msg)
            .map_err(|e| ShareError::Protocol(format!("encoding {}: {e}", msg.kind())))?;
        let what = format!("sending {}", msg.kind());
        let timeout = self.timeout;
        let cancel = self.cancel.clone();
        guarded(&cancel, timeout, &what, async {
            write_frame(&mut self.send, &body)
                .await
                .map_err(|e| io_to_share(&what, e))
        })
        .await
    }

    /// Next message, within `timeout`.
    pub async fn recv_within(&mut self, expected: &str, timeout: Duration) -> Result<ControlMessage> {
        let what = format!("waiting for {expected}");
        let cancel = self.cancel.clone();
        let buf = guarded(&cancel, timeout, &what, async {
            read_frame(&mut self.recv)
                .await
                .map_err(|e| io_to_share(&what, e))
        })
        .await?;
        serde_json::from_slice(&buf)
            .map_err(|e| ShareError::Protocol(format!("bad control message ({what}): {e}")))
    }

    pub async fn expect_hello(&mut self) -> Result<(String, String)> {
        match self.recv_within("hello", self.timeout).await? {
            ControlMessage::Hello { label, fp } => Ok((label, fp)),
            other => Err(out_of_order("hello", &other)),
        }
    }

    pub async fn expect_sas(&mut self) -> Result<[u8; NONCE_LEN]> {
        match self.recv_within("sas", self.timeout).await? {
            ControlMessage::Sas { nonce } => decode_nonce(&nonce),
            other => Err(out_of_order("sas", &other)),
        }
    }

    /// The offer may follow a human decision on the other side, so it gets
    /// its own deadline.
    pub async fn expect_offer(&mut self, timeout: Duration) -> Result<Offer> {
        match self.recv_within("offer", timeout).await? {
            ControlMessage::Offer(offer) => Ok(offer),
            other => Err(out_of_order("offer", &other)),
        }
    }
}

fn out_of_order(expected: &str, got: &ControlMessage) -> ShareError {
    ShareError::Protocol(format!("expected {expected}, got {}", got.kind()))
}

fn io_to_share(what: &str, e: std::io::Error) -> ShareError {
    match e.kind() {
        std::io::ErrorKind::UnexpectedEof => {
            ShareError::Protocol(format!("control stream closed while {what}"))
        }
        std::io::ErrorKind::InvalidData | std::io::ErrorKind::InvalidInput => {
            ShareError::Protocol(format!("{what}: {e}"))
        }
        _ => ShareError::io(what, e),
    }
}

/// Run `fut` under a deadline and a cancellation token.
pub(crate) async fn guarded<T, F>(
    cancel: &CancellationToken,
    timeout: Duration,
    what: &str,
    fut: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(ShareError::Cancelled),
        res = tokio::time::timeout(timeout, fut) => match res {
            Ok(inner) => inner,
            Err(_) => Err(ShareError::DeadlineExceeded(format!("{what} after {}s", timeout.as_secs()))),
        },
    }
}
