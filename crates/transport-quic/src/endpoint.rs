use quinn::crypto::rustls::{HandshakeData, QuicClientConfig, QuicServerConfig};
use quinn::{Connection, ConnectionError, Endpoint, IdleTimeout, RecvStream, SendStream, TransportConfig, VarInt};
use rustls::pki_types::CertificateDer;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use crate::tls::{peer_public_key, TlsIdentity};
use crate::{codes, TransportError, ALPN, SERVER_NAME};

// The receiver can sit on an idle control stream while a user reads the SAS;
// keep-alives hold the connection open through that.
const KEEP_ALIVE: Duration = Duration::from_secs(5);
const MAX_IDLE_MS: u32 = 30_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Dialer.
    Client,
    /// Listener.
    Server,
}

/// Close frame received from the remote side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerClose {
    pub code: u64,
    pub reason: String,
}

fn transport_config() -> Arc<TransportConfig> {
    let mut transport = TransportConfig::default();
    transport.keep_alive_interval(Some(KEEP_ALIVE));
    transport.max_idle_timeout(Some(IdleTimeout::from(VarInt::from_u32(MAX_IDLE_MS))));
    Arc::new(transport)
}

/// Bound QUIC server endpoint.
pub struct Listener {
    endpoint: Endpoint,
    public_key: [u8; 32],
}

impl Listener {
    pub fn bind(identity: &TlsIdentity, addr: SocketAddr) -> Result<Self, TransportError> {
        let crypto = QuicServerConfig::try_from(identity.server_config()?)
            .map_err(|e| TransportError::Config(e.to_string()))?;
        let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(crypto));
        server_config.transport_config(transport_config());

        let endpoint = Endpoint::server(server_config, addr)?;
        tracing::debug!(addr = %endpoint.local_addr()?, "quic listener bound");
        Ok(Self {
            endpoint,
            public_key: *identity.public_key(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.endpoint.local_addr()?)
    }

    /// Next completed handshake. `None` once the listener is closed.
    pub async fn accept(&self) -> Option<Result<PeerConnection, TransportError>> {
        let incoming = self.endpoint.accept().await?;
        let remote = incoming.remote_address();
        let result = match incoming.await {
            Ok(conn) => PeerConnection::established(conn, Role::Server, self.public_key, None),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = &result {
            tracing::warn!(%remote, "inbound handshake failed: {}", e);
        }
        Some(result)
    }

    /// Refuse further connections.
    pub fn close(&self) {
        self.endpoint.close(VarInt::from_u32(codes::DONE), b"listener closed");
    }

    /// Wait until close frames for every connection have gone out.
    pub async fn wait_idle(&self) {
        self.endpoint.wait_idle().await;
    }
}

/// Dial `addr` and complete the TLS handshake.
pub async fn dial(identity: &TlsIdentity, addr: SocketAddr) -> Result<PeerConnection, TransportError> {
    let bind: SocketAddr = if addr.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let endpoint = Endpoint::client(bind)?;

    let crypto = QuicClientConfig::try_from(identity.client_config()?)
        .map_err(|e| TransportError::Config(e.to_string()))?;
    let mut client_config = quinn::ClientConfig::new(Arc::new(crypto));
    client_config.transport_config(transport_config());

    tracing::debug!(%addr, "dialing");
    let conn = endpoint.connect_with(client_config, addr, SERVER_NAME)?.await?;
    PeerConnection::established(conn, Role::Client, *identity.public_key(), Some(endpoint))
}

/// An authenticated connection: ALPN agreed and the peer's ed25519 key known.
pub struct PeerConnection {
    conn: Connection,
    role: Role,
    local_key: [u8; 32],
    peer_key: [u8; 32],
    // Client side owns its endpoint so the socket lives as long as the session.
    endpoint: Option<Endpoint>,
}

impl PeerConnection {
    fn established(
        conn: Connection,
        role: Role,
        local_key: [u8; 32],
        endpoint: Option<Endpoint>,
    ) -> Result<Self, TransportError> {
        match Self::peer_key_of(&conn) {
            Ok(peer_key) => Ok(Self {
                conn,
                role,
                local_key,
                peer_key,
                endpoint,
            }),
            Err(e) => {
                conn.close(VarInt::from_u32(codes::HANDSHAKE), e.to_string().as_bytes());
                Err(e)
            }
        }
    }

    fn peer_key_of(conn: &Connection) -> Result<[u8; 32], TransportError> {
        let protocol = conn
            .handshake_data()
            .and_then(|data| data.downcast::<HandshakeData>().ok())
            .and_then(|data| data.protocol);
        if protocol.as_deref() != Some(ALPN) {
            return Err(TransportError::Alpn);
        }

        let certs = conn
            .peer_identity()
            .and_then(|id| id.downcast::<Vec<CertificateDer<'static>>>().ok())
            .ok_or_else(|| TransportError::PeerKey("peer presented no certificate".into()))?;
        let leaf = certs
            .first()
            .ok_or_else(|| TransportError::PeerKey("peer presented no certificate".into()))?;
        peer_public_key(leaf)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.conn.remote_address()
    }

    pub fn peer_public_key(&self) -> &[u8; 32] {
        &self.peer_key
    }

    /// The listener's device key; both ends feed this into the SAS.
    pub fn server_public_key(&self) -> &[u8; 32] {
        match self.role {
            Role::Server => &self.local_key,
            Role::Client => &self.peer_key,
        }
    }

    /// Open the control stream. Nothing reaches the peer until the first write.
    pub async fn open_control(&self) -> Result<(SendStream, RecvStream), TransportError> {
        Ok(self.conn.open_bi().await?)
    }

    pub async fn accept_control(&self) -> Result<(SendStream, RecvStream), TransportError> {
        Ok(self.conn.accept_bi().await?)
    }

    pub async fn open_data(&self) -> Result<SendStream, TransportError> {
        Ok(self.conn.open_uni().await?)
    }

    pub async fn accept_data(&self) -> Result<RecvStream, TransportError> {
        Ok(self.conn.accept_uni().await?)
    }

    pub fn close(&self, code: u32, reason: &str) {
        tracing::debug!(code, reason, "closing connection ({})", codes::describe(code as u64));
        self.conn.close(VarInt::from_u32(code), reason.as_bytes());
    }

    /// Resolve once the connection is gone, for whatever reason.
    pub async fn closed(&self) -> ConnectionError {
        self.conn.closed().await
    }

    /// The remote's application close, if that is how the connection ended.
    pub fn peer_close(&self) -> Option<PeerClose> {
        match self.conn.close_reason()? {
            ConnectionError::ApplicationClosed(close) => Some(PeerClose {
                code: close.error_code.into_inner(),
                reason: String::from_utf8_lossy(&close.reason).into_owned(),
            }),
            _ => None,
        }
    }

    /// Let the close frame go out before the client socket is dropped.
    pub async fn drain(&self, limit: Duration) {
        if let Some(endpoint) = &self.endpoint {
            let _ = tokio::time::timeout(limit, endpoint.wait_idle()).await;
        }
    }
}
