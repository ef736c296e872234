#![warn(missing_docs)]

//! udplink-peer: the per-peer delivery pipeline.
//!
//! A [`Peer`] composes the four delivery channels and owns everything tied to
//! one remote endpoint: the connect/disconnect handshakes, RTT estimation and
//! keepalive, MTU discovery, fragmentation and reassembly, and the merge
//! buffer that coalesces small outbound packets into single datagrams.

/// Write-side fragmenter and read-side reassembly table.
pub mod fragment_buffer;
/// Candidate-ladder MTU probing.
pub mod mtu_discovery;
/// Per-peer traffic counters.
pub mod statistics;

mod peer;
mod peer_state;

pub use fragment_buffer::{FragmentBuffer, ReassemblyTable};
pub use mtu_discovery::MtuDiscovery;
pub use peer::{DisconnectReason, Peer, PeerAction};
pub use peer_state::PeerState;
pub use statistics::PeerStatistics;
