#![warn(missing_docs)]

//! udplink: a small public API facade for the workspace.
//!
//! This crate re-exports the surface most applications need to build
//! latency-sensitive traffic over reliable UDP:
//!
//! - Manager and events (`Manager`, `Event`, `RemotePeer`)
//! - Delivery methods (`DeliveryMethod`)
//! - Configuration (`Config`)
//!
//! Example
//! ```ignore
//! use std::time::Duration;
//! use udplink::{Config, DeliveryMethod, Event, Manager};
//!
//! let mut server = Manager::new(Config::default());
//! server.start(9050)?;
//!
//! let mut client = Manager::new(Config::default());
//! client.start(0)?;
//! client.connect(server.local_addr()?, b"key");
//!
//! loop {
//!     server.run(Duration::from_millis(15));
//!     client.run(Duration::from_millis(15));
//!     while let Some(event) = client.poll_event() {
//!         if let Event::PeerConnected(peer) = event {
//!             client.send(&peer, b"hello", DeliveryMethod::ReliableOrdered, 0)?;
//!         }
//!     }
//! }
//! ```

pub use udplink_core::{Config, DecodingErrorKind, ErrorKind, Result};
pub use udplink_host::{Event, Manager, OutgoingMessage, RemotePeer, UnconnectedKind};
pub use udplink_peer::{DisconnectReason, PeerState, PeerStatistics};
pub use udplink_protocol::DeliveryMethod;

/// Convenience prelude with the most commonly used items.
pub mod prelude {
    pub use crate::{
        Config, DeliveryMethod, DisconnectReason, ErrorKind, Event, Manager, RemotePeer, Result,
    };
}
