//! Sender and receiver drivers over one authenticated QUIC connection.
//!
//! Both roles walk the same linear state machine up to `Verified`, then the
//! sender offers and streams files while the receiver accepts them in offer
//! order. The first failure is terminal: the side that detects it closes the
//! connection with the matching application code.

use async_trait::async_trait;
use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use storage::TrustStore;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use transport_quic::{codes, derive_sas, fresh_nonce, PeerConnection, Sas};

use crate::config::ShareConfig;
use crate::error::{Result, ShareError};
use crate::keys::{fingerprint, short_fingerprint, DeviceKey};
use crate::offer::{FileMeta, PreparedOffer};
use crate::protocol::{guarded, ControlChannel, ControlMessage};
use crate::transfer::{prepare_dest_dir, receive_file, send_file};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    Sender,
    Receiver,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    HelloSent,
    HelloOk,
    SasSent,
    SasOk,
    Verified,
    OfferSent,
    OfferReceived,
    SendingFile(usize),
    ReceivingFile(usize),
    Done,
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::SendingFile(i) => write!(f, "SENDING_FILE({i})"),
            SessionState::ReceivingFile(i) => write!(f, "RECEIVING_FILE({i})"),
            other => {
                let name = match other {
                    SessionState::Init => "INIT",
                    SessionState::HelloSent => "HELLO_SENT",
                    SessionState::HelloOk => "HELLO_OK",
                    SessionState::SasSent => "SAS_SENT",
                    SessionState::SasOk => "SAS_OK",
                    SessionState::Verified => "VERIFIED",
                    SessionState::OfferSent => "OFFER_SENT",
                    SessionState::OfferReceived => "OFFER_RECEIVED",
                    SessionState::Done => "DONE",
                    _ => "FAILED",
                };
                f.write_str(name)
            }
        }
    }
}

/// Tracks the current state and refuses transitions the protocol does not have.
#[derive(Debug)]
pub struct StateMachine {
    role: SessionRole,
    state: SessionState,
    files: usize,
}

impl StateMachine {
    pub fn new(role: SessionRole) -> Self {
        Self {
            role,
            state: SessionState::Init,
            files: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Number of files announced by the offer, once known.
    pub fn set_file_count(&mut self, files: usize) {
        self.files = files;
    }

    pub fn advance(&mut self, next: SessionState) -> Result<()> {
        use SessionRole::*;
        use SessionState::*;

        let ok = match (self.state, next) {
            (_, Failed) => self.state != Done,
            (Init, HelloSent)
            | (HelloSent, HelloOk)
            | (HelloOk, SasSent)
            | (SasSent, SasOk)
            | (SasOk, Verified) => true,
            (Verified, OfferSent) => self.role == Sender,
            (Verified, OfferReceived) => self.role == Receiver,
            (OfferSent, SendingFile(0)) | (OfferReceived, ReceivingFile(0)) => self.files > 0,
            (OfferSent, Done) | (OfferReceived, Done) => self.files == 0,
            (SendingFile(i), SendingFile(j)) | (ReceivingFile(i), ReceivingFile(j)) => {
                j == i + 1 && j < self.files
            }
            (SendingFile(i), Done) | (ReceivingFile(i), Done) => i + 1 == self.files,
            _ => false,
        };
        if !ok {
            return Err(ShareError::Protocol(format!(
                "illegal transition {} -> {}",
                self.state, next
            )));
        }
        tracing::debug!(state = %next, "session state");
        self.state = next;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Connected {
        peer_label: String,
        peer_fp: String,
        remote: SocketAddr,
    },
    /// SAS derived; `pinned` says whether the peer was already trusted.
    Verified { sas: String, pinned: bool },
    OfferReceived { files: Vec<FileMeta>, total: u64 },
    FileCompleted { name: String, bytes: u64 },
    Done { files: usize, bytes: u64 },
}

/// The peer as seen during a session; the fingerprint comes from its certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSummary {
    pub label: String,
    pub fp: String,
}

/// Out-of-band confirmation of a first-contact peer.
#[async_trait]
pub trait TrustPrompt: Send + Sync {
    /// `true` to trust (and pin) the peer.
    async fn confirm(&self, peer: &PeerSummary, sas: &Sas) -> Result<bool>;
}

/// Trusts every peer. Backs `send --yes`.
pub struct AcceptAll;

#[async_trait]
impl TrustPrompt for AcceptAll {
    async fn confirm(&self, peer: &PeerSummary, sas: &Sas) -> Result<bool> {
        tracing::info!(peer = %peer.label, sas = %sas, "accepting first-contact peer without prompt");
        Ok(true)
    }
}

/// What a session needs from its surroundings. Loaded once by the entry
/// point and passed down.
pub struct SessionContext<'a> {
    pub key: &'a DeviceKey,
    pub label: String,
    pub trust: &'a dyn TrustStore,
    pub config: &'a ShareConfig,
    pub events: Option<mpsc::UnboundedSender<SessionEvent>>,
    pub cancel: CancellationToken,
}

impl SessionContext<'_> {
    fn emit(&self, event: SessionEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub peer: PeerSummary,
    pub sas: String,
    pub files: Vec<FileMeta>,
    pub bytes: u64,
}

/// Resolve a session error into the error the user sees, closing the
/// connection if the peer has not already done so.
fn conclude(conn: &PeerConnection, sm: &mut StateMachine, err: ShareError) -> ShareError {
    let _ = sm.advance(SessionState::Failed);
    if let Some(close) = conn.peer_close() {
        let from_peer = ShareError::from_peer_close(&close);
        tracing::warn!(code = close.code, reason = %close.reason, "peer closed the session");
        return from_peer;
    }
    tracing::warn!(code = err.close_code(), "session failed: {}", err);
    conn.close(err.close_code(), &err.to_string());
    err
}

/// Hello exchange: check the peer's claimed fingerprint against its certificate.
fn check_hello(peer_fp: &str, claimed_fp: &str) -> Result<()> {
    if claimed_fp != peer_fp {
        return Err(ShareError::Protocol(format!(
            "hello fingerprint {} does not match certificate {}",
            short_fingerprint(claimed_fp),
            short_fingerprint(peer_fp)
        )));
    }
    Ok(())
}

/// Drive the sending side. `expected_fp` is the fingerprint from the
/// advertisement the peer was picked from, if any.
pub async fn run_sender(
    conn: &PeerConnection,
    ctx: &SessionContext<'_>,
    prompt: Option<&dyn TrustPrompt>,
    prepared: &PreparedOffer,
    expected_fp: Option<&str>,
) -> Result<SessionSummary> {
    let mut sm = StateMachine::new(SessionRole::Sender);
    match sender_steps(conn, ctx, prompt, prepared, expected_fp, &mut sm).await {
        Ok(summary) => Ok(summary),
        Err(e) => Err(conclude(conn, &mut sm, e)),
    }
}

async fn sender_steps(
    conn: &PeerConnection,
    ctx: &SessionContext<'_>,
    prompt: Option<&dyn TrustPrompt>,
    prepared: &PreparedOffer,
    expected_fp: Option<&str>,
    sm: &mut StateMachine,
) -> Result<SessionSummary> {
    let peer_fp = fingerprint(conn.peer_public_key());
    if let Some(advertised) = expected_fp {
        if advertised != peer_fp {
            return Err(ShareError::Handshake(format!(
                "peer certificate {} does not match advertised {}",
                short_fingerprint(&peer_fp),
                short_fingerprint(advertised)
            )));
        }
    }

    let (send, recv) = conn.open_control().await?;
    let mut control = ControlChannel::new(send, recv, ctx.config.control_timeout(), ctx.cancel.clone());

    control
        .send(&ControlMessage::Hello {
            label: ctx.label.clone(),
            fp: ctx.key.fingerprint(),
        })
        .await?;
    sm.advance(SessionState::HelloSent)?;
    let (peer_label, claimed_fp) = control.expect_hello().await?;
    check_hello(&peer_fp, &claimed_fp)?;
    sm.advance(SessionState::HelloOk)?;
    let peer = PeerSummary {
        label: peer_label,
        fp: peer_fp,
    };
    ctx.emit(SessionEvent::Connected {
        peer_label: peer.label.clone(),
        peer_fp: peer.fp.clone(),
        remote: conn.remote_address(),
    });

    let client_nonce = fresh_nonce();
    control.send(&ControlMessage::sas(&client_nonce)).await?;
    sm.advance(SessionState::SasSent)?;
    let server_nonce = control.expect_sas().await?;
    sm.advance(SessionState::SasOk)?;

    let sas = derive_sas(
        conn.server_public_key(),
        &client_nonce,
        &server_nonce,
        ctx.config.sas_words,
    )?;
    tracing::info!(peer = %peer.label, sas = %sas, "sas derived");

    let pinned = ctx.trust.get(&peer.fp).await?.is_some();
    if !pinned {
        let prompt = prompt.ok_or_else(|| {
            ShareError::VerificationRejected(format!(
                "{} is not pinned and no prompt is available",
                peer.label
            ))
        })?;
        // The prompt may wait on a human; cancellation still applies.
        let accepted = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(ShareError::Cancelled),
            res = prompt.confirm(&peer, &sas) => res?,
        };
        if !accepted {
            return Err(ShareError::VerificationRejected(format!(
                "SAS for {} was declined",
                peer.label
            )));
        }
    }
    ctx.trust.add(&peer.fp, &peer.label).await?;
    sm.advance(SessionState::Verified)?;
    ctx.emit(SessionEvent::Verified {
        sas: sas.to_string(),
        pinned,
    });

    let offer = &prepared.offer;
    control.send(&ControlMessage::Offer(offer.clone())).await?;
    sm.set_file_count(offer.files.len());
    sm.advance(SessionState::OfferSent)?;

    let mut bytes = 0u64;
    for (i, (meta, source)) in offer.files.iter().zip(&prepared.sources).enumerate() {
        sm.advance(SessionState::SendingFile(i))?;
        let mut stream = conn.open_data().await?;
        let sent = send_file(&mut stream, meta, source, &ctx.cancel).await?;
        stream
            .finish()
            .map_err(|e| ShareError::Transfer(format!("finishing {}: {e}", meta.name)))?;
        bytes += sent;
        tracing::info!(file = %meta.name, bytes = sent, "sent");
        ctx.emit(SessionEvent::FileCompleted {
            name: meta.name.clone(),
            bytes: sent,
        });
    }

    // The receiver closes with DONE once everything is on disk. Keep-alives
    // hold the connection open, so a silent receiver needs a deadline.
    guarded(
        &ctx.cancel,
        ctx.config.finish_timeout(),
        "waiting for receiver to finish",
        async {
            conn.closed().await;
            Ok::<(), ShareError>(())
        },
    )
    .await?;
    match conn.peer_close() {
        Some(close) if close.code == codes::DONE as u64 => {}
        Some(close) => return Err(ShareError::from_peer_close(&close)),
        None => {
            return Err(ShareError::Transfer(
                "connection ended before the receiver confirmed".into(),
            ))
        }
    }

    sm.advance(SessionState::Done)?;
    ctx.emit(SessionEvent::Done {
        files: offer.files.len(),
        bytes,
    });
    Ok(SessionSummary {
        peer,
        sas: sas.to_string(),
        files: offer.files.clone(),
        bytes,
    })
}

/// Drive the receiving side, writing accepted files into `dest_dir`.
pub async fn run_receiver(
    conn: &PeerConnection,
    ctx: &SessionContext<'_>,
    dest_dir: &Path,
) -> Result<SessionSummary> {
    let mut sm = StateMachine::new(SessionRole::Receiver);
    match receiver_steps(conn, ctx, dest_dir, &mut sm).await {
        Ok(summary) => {
            conn.close(codes::DONE, "done");
            Ok(summary)
        }
        Err(e) => Err(conclude(conn, &mut sm, e)),
    }
}

async fn receiver_steps(
    conn: &PeerConnection,
    ctx: &SessionContext<'_>,
    dest_dir: &Path,
    sm: &mut StateMachine,
) -> Result<SessionSummary> {
    let peer_fp = fingerprint(conn.peer_public_key());
    let control_timeout = ctx.config.control_timeout();

    let (send, recv) = guarded(
        &ctx.cancel,
        control_timeout,
        "waiting for control stream",
        async { conn.accept_control().await.map_err(ShareError::from) },
    )
    .await?;
    let mut control = ControlChannel::new(send, recv, control_timeout, ctx.cancel.clone());

    let (peer_label, claimed_fp) = control.expect_hello().await?;
    check_hello(&peer_fp, &claimed_fp)?;
    control
        .send(&ControlMessage::Hello {
            label: ctx.label.clone(),
            fp: ctx.key.fingerprint(),
        })
        .await?;
    sm.advance(SessionState::HelloSent)?;
    sm.advance(SessionState::HelloOk)?;
    let peer = PeerSummary {
        label: peer_label,
        fp: peer_fp,
    };
    ctx.emit(SessionEvent::Connected {
        peer_label: peer.label.clone(),
        peer_fp: peer.fp.clone(),
        remote: conn.remote_address(),
    });

    let client_nonce = control.expect_sas().await?;
    let server_nonce = fresh_nonce();
    control.send(&ControlMessage::sas(&server_nonce)).await?;
    sm.advance(SessionState::SasSent)?;
    sm.advance(SessionState::SasOk)?;

    let sas = derive_sas(
        conn.server_public_key(),
        &client_nonce,
        &server_nonce,
        ctx.config.sas_words,
    )?;
    let pinned = ctx.trust.get(&peer.fp).await?.is_some();
    tracing::info!(peer = %peer.label, sas = %sas, pinned, "sas derived");
    sm.advance(SessionState::Verified)?;
    ctx.emit(SessionEvent::Verified {
        sas: sas.to_string(),
        pinned,
    });

    let offer = control.expect_offer(ctx.config.verify_timeout()).await?;
    offer.validate()?;
    sm.set_file_count(offer.files.len());
    sm.advance(SessionState::OfferReceived)?;
    tracing::info!(peer = %peer.label, files = offer.files.len(), bytes = offer.total, "offer received");
    ctx.emit(SessionEvent::OfferReceived {
        files: offer.files.clone(),
        total: offer.total,
    });

    // An offer means the sender accepted the SAS; pin it in return.
    ctx.trust.add(&peer.fp, &peer.label).await?;
    prepare_dest_dir(dest_dir).await?;

    let mut bytes = 0u64;
    for (i, meta) in offer.files.iter().enumerate() {
        sm.advance(SessionState::ReceivingFile(i))?;
        let mut stream = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(ShareError::Cancelled),
            res = conn.accept_data() => res?,
        };
        let written = receive_file(&mut stream, meta, dest_dir, &ctx.cancel).await?;
        bytes += meta.size;
        tracing::info!(file = %written.display(), bytes = meta.size, "received");
        ctx.emit(SessionEvent::FileCompleted {
            name: meta.name.clone(),
            bytes: meta.size,
        });
    }

    sm.advance(SessionState::Done)?;
    ctx.emit(SessionEvent::Done {
        files: offer.files.len(),
        bytes,
    });
    Ok(SessionSummary {
        peer,
        sas: sas.to_string(),
        files: offer.files,
        bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn walk(sm: &mut StateMachine, states: &[SessionState]) {
        for s in states {
            sm.advance(*s).unwrap();
        }
    }

    const HANDSHAKE: [SessionState; 5] = [
        SessionState::HelloSent,
        SessionState::HelloOk,
        SessionState::SasSent,
        SessionState::SasOk,
        SessionState::Verified,
    ];

    #[test]
    fn sender_walks_to_done() {
        let mut sm = StateMachine::new(SessionRole::Sender);
        walk(&mut sm, &HANDSHAKE);
        sm.set_file_count(2);
        walk(
            &mut sm,
            &[
                SessionState::OfferSent,
                SessionState::SendingFile(0),
                SessionState::SendingFile(1),
                SessionState::Done,
            ],
        );
        assert_eq!(sm.state(), SessionState::Done);
    }

    #[test]
    fn skipping_a_step_is_refused() {
        let mut sm = StateMachine::new(SessionRole::Receiver);
        sm.advance(SessionState::HelloSent).unwrap();
        let err = sm.advance(SessionState::SasSent).unwrap_err();
        assert!(matches!(err, ShareError::Protocol(ref m) if m.contains("HELLO_SENT -> SAS_SENT")));
    }

    #[test]
    fn roles_cannot_swap_offer_direction() {
        let mut sm = StateMachine::new(SessionRole::Receiver);
        walk(&mut sm, &HANDSHAKE);
        assert!(sm.advance(SessionState::OfferSent).is_err());
        assert!(sm.advance(SessionState::OfferReceived).is_ok());
    }

    #[test]
    fn file_indices_follow_the_offer() {
        let mut sm = StateMachine::new(SessionRole::Receiver);
        walk(&mut sm, &HANDSHAKE);
        sm.set_file_count(2);
        sm.advance(SessionState::OfferReceived).unwrap();
        assert!(sm.advance(SessionState::ReceivingFile(1)).is_err());
        sm.advance(SessionState::ReceivingFile(0)).unwrap();
        assert!(sm.advance(SessionState::Done).is_err());
        sm.advance(SessionState::ReceivingFile(1)).unwrap();
        assert!(sm.advance(SessionState::ReceivingFile(2)).is_err());
        sm.advance(SessionState::Done).unwrap();
        assert!(sm.advance(SessionState::Failed).is_err());
    }

    #[test]
    fn hello_must_match_certificate() {
        assert!(check_hello("AAAA", "AAAA").is_ok());
        assert!(matches!(check_hello("AAAA", "BBBB"), Err(ShareError::Protocol(_))));
    }
}
