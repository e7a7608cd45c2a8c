//! Local-link service discovery for share peers.
//!
//! A receiver advertises `_gns3util-share._udp.local.` with its fingerprint in
//! the TXT record; a sender browses for a time window and picks one.

use thiserror::Error;

pub mod announce;
pub mod discover;
pub mod model;
pub mod net;

pub use announce::{advertise, Announcer};
pub use discover::browse;
pub use model::{PeerAdvertisement, ServiceAnnouncement, TxtRecord, PROTOCOL_VERSION, SERVICE_TYPE};

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("mdns daemon error: {0}")]
    Daemon(#[from] mdns_sd::Error),
    #[error("listing network interfaces failed: {0}")]
    Interfaces(#[from] std::io::Error),
    #[error("no interface address reachable on {0}")]
    NoAddress(std::net::SocketAddr),
}
