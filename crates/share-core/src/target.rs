//! Sender side: turn `--to` into a dialable peer and connect.

use mdns_core::PeerAdvertisement;
use std::net::SocketAddr;
use transport_quic::{dial, PeerConnection, TlsIdentity};

use crate::error::{Result, ShareError};
use crate::keys::DeviceKey;

/// What the user asked to send to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Literal socket address.
    Addr(SocketAddr),
    /// `host:port` needing a lookup.
    HostPort(String),
    /// Instance name or `user@host` label from discovery.
    Instance(String),
    /// Nothing given; choose from a browse.
    Pick,
}

impl Target {
    pub fn parse(raw: Option<&str>) -> Self {
        let raw = match raw.map(str::trim) {
            None | Some("") => return Target::Pick,
            Some(r) => r,
        };
        if let Ok(addr) = raw.parse::<SocketAddr>() {
            return Target::Addr(addr);
        }
        match raw.rsplit_once(':') {
            Some((host, port))
                if !host.is_empty() && !host.contains('@') && port.parse::<u16>().is_ok() =>
            {
                Target::HostPort(raw.to_string())
            }
            _ => Target::Instance(raw.to_string()),
        }
    }
}

/// Where to dial and what to expect there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPeer {
    pub addr: SocketAddr,
    pub label: String,
    /// Fingerprint from the advertisement; the certificate must match it.
    pub expected_fp: Option<String>,
}

impl ResolvedPeer {
    pub fn direct(addr: SocketAddr) -> Self {
        Self {
            addr,
            label: addr.to_string(),
            expected_fp: None,
        }
    }

    /// Refuses records without a fingerprint or with a foreign version.
    pub fn from_advertisement(adv: &PeerAdvertisement) -> Result<Self> {
        if let Some(why) = adv.refusal() {
            return Err(ShareError::Protocol(format!(
                "refusing to dial {}: {}",
                adv.instance_name, why
            )));
        }
        let addr = adv.socket_addr().ok_or_else(|| {
            ShareError::Protocol(format!("{} advertised no address", adv.instance_name))
        })?;
        Ok(Self {
            addr,
            label: adv.display_label(),
            expected_fp: adv.fingerprint().map(str::to_string),
        })
    }
}

pub async fn resolve_host_port(host_port: &str) -> Result<SocketAddr> {
    let mut addrs = tokio::net::lookup_host(host_port)
        .await
        .map_err(|e| ShareError::Config(format!("cannot resolve {host_port}: {e}")))?;
    addrs
        .next()
        .ok_or_else(|| ShareError::Config(format!("{host_port} resolved to no address")))
}

/// Stable presentation order for browse results.
pub fn sort_peers(peers: &mut [PeerAdvertisement]) {
    peers.sort_by(|a, b| {
        (&a.instance_name, &a.fullname).cmp(&(&b.instance_name, &b.fullname))
    });
}

/// Find a browse result by instance name or `user@host` label.
pub fn find_instance<'a>(
    peers: &'a [PeerAdvertisement],
    name: &str,
) -> Result<&'a PeerAdvertisement> {
    peers
        .iter()
        .find(|p| p.instance_name == name)
        .or_else(|| peers.iter().find(|p| p.display_label() == name))
        .ok_or_else(|| ShareError::Config(format!("no peer named {name:?} found on the network")))
}

/// Dial `peer` presenting the device key.
pub async fn connect(key: &DeviceKey, peer: &ResolvedPeer) -> Result<PeerConnection> {
    let tls = TlsIdentity::from_signing_key(key.signing_key())?;
    tracing::info!(peer = %peer.label, addr = %peer.addr, "connecting");
    Ok(dial(&tls, peer.addr).await?)
}
