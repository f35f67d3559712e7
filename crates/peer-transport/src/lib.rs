//! Peer registry and framed-transport base (components C2 and C3).

#[macro_use]
extern crate tracing;

mod config;
mod peer_id;
mod transport;

pub use config::TransportConfig;
pub use peer_id::{InvalidPeerId, PeerId};
pub use transport::{PeerExpiryTask, PeerSnapshot, TransportBase, TransportError, TransportObserver};
