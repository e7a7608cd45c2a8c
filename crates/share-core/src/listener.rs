//! Receiver side: bind, advertise, wait for one session.

use mdns_core::{Announcer, TxtRecord, PROTOCOL_VERSION};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use transport_quic::{Listener, TlsIdentity};

use crate::error::{Result, ShareError};
use crate::keys::DeviceKey;
use crate::session::{run_receiver, SessionContext, SessionSummary};

// Bound on waiting for the final close frame to leave the socket.
const CLOSE_FLUSH: Duration = Duration::from_secs(2);

/// Bind a QUIC listener presenting the device key.
pub fn bind_listener(key: &DeviceKey, addr: SocketAddr) -> Result<Listener> {
    let tls = TlsIdentity::from_signing_key(key.signing_key())?;
    Ok(Listener::bind(&tls, addr)?)
}

/// TXT record announcing this device.
pub fn receiver_txt(key: &DeviceKey, label: &str) -> TxtRecord {
    let mut txt = TxtRecord::default();
    txt.insert(mdns_core::model::TXT_FP, &key.fingerprint());
    txt.insert(mdns_core::model::TXT_VER, PROTOCOL_VERSION);
    if let Some((user, host)) = label.split_once('@') {
        txt.insert(mdns_core::model::TXT_USER, user);
        txt.insert(mdns_core::model::TXT_HOST, host);
    }
    txt
}

/// Advertise the listener bound at `bound` under `label`. Dropping the
/// handle withdraws it.
pub fn advertise_receiver(
    service_type: &str,
    key: &DeviceKey,
    label: &str,
    bound: SocketAddr,
) -> Result<Announcer> {
    let host = gethostname::gethostname().to_string_lossy().into_owned();
    let host = if host.trim().is_empty() {
        "gns3util".to_string()
    } else {
        host.trim().replace(' ', "-")
    };
    Ok(mdns_core::advertise(
        service_type,
        label,
        &host,
        bound,
        receiver_txt(key, label),
    )?)
}

/// Serve exactly one inbound session.
///
/// Returns `Ok(None)` when nobody connected within the idle timeout. Failed
/// handshakes are logged and do not count as a session; the idle clock keeps
/// running from the start.
pub async fn serve_one(
    listener: &Listener,
    ctx: &SessionContext<'_>,
    dest_dir: &Path,
) -> Result<Option<SessionSummary>> {
    let idle = tokio::time::sleep(ctx.config.idle_timeout());
    tokio::pin!(idle);

    let conn = loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => {
                listener.close();
                return Err(ShareError::Cancelled);
            }
            _ = &mut idle => {
                tracing::info!(secs = ctx.config.idle_timeout_secs, "no peer connected; giving up");
                listener.close();
                return Ok(None);
            }
            accepted = listener.accept() => match accepted {
                Some(Ok(conn)) => break conn,
                Some(Err(e)) => {
                    tracing::debug!("ignoring failed inbound connection: {}", e);
                    continue;
                }
                None => return Err(ShareError::Cancelled),
            },
        }
    };

    tracing::info!(remote = %conn.remote_address(), "peer connected");
    let result = run_receiver(&conn, ctx, dest_dir).await;
    listener.close();
    let _ = tokio::time::timeout(CLOSE_FLUSH, listener.wait_idle()).await;
    result.map(Some)
}
