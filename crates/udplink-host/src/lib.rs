#![warn(missing_docs)]

//! udplink-host: socket pump, peer table and event multiplexer.
//!
//! The [`Manager`] owns the datagram socket and drives every peer from a
//! single cooperative tick: it parses inbound datagrams, routes them to the
//! owning peer, executes the actions peers hand back, and publishes
//! [`Event`]s to the application over a channel.

/// Application-facing events and peer handles.
pub mod event;
/// The socket pump and tick loop.
pub mod manager;
/// Bounded, address-keyed peer storage.
pub mod peer_table;
/// Socket binding and the debug-only conditioner.
pub mod socket;
/// Clock abstraction for testable timers.
pub mod time;

pub use event::{Event, RemotePeer, UnconnectedKind};
pub use manager::{Manager, OutgoingMessage};
pub use peer_table::PeerTable;
pub use socket::ConditionedSocket;
pub use time::{Clock, SystemClock};
