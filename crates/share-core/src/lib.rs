//! Peer-to-peer artifact sharing.
//!
//! A device identity (ed25519 key, fingerprint, label), the control and data
//! stream protocol spoken over an authenticated QUIC connection, and the
//! sender and receiver drivers that tie discovery, trust pinning and file
//! transfer together.

pub mod config;
pub mod error;
pub mod keys;
pub mod listener;
pub mod offer;
pub mod protocol;
pub mod session;
pub mod target;
pub mod transfer;

// Re-export commonly used types
pub use config::ShareConfig;
pub use error::{Result, ShareError};
pub use keys::{
    device_label, fingerprint, normalize_fingerprint, short_fingerprint, DeviceKey, IdentityStore,
};
pub use listener::{advertise_receiver, bind_listener, serve_one};
pub use offer::{build_offer, FileMeta, Offer, PreparedOffer};
pub use session::{
    run_receiver, run_sender, AcceptAll, PeerSummary, SessionContext, SessionEvent,
    SessionSummary, TrustPrompt,
};
pub use target::{connect, ResolvedPeer, Target};
