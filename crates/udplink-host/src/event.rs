//! Application-facing events and peer handles.

use std::{io, net::SocketAddr, time::Duration};

use udplink_peer::DisconnectReason;
use udplink_protocol::DeliveryMethod;

/// Cheap handle identifying a peer: its endpoint plus the connection id
/// chosen by the initiator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemotePeer {
    /// Remote endpoint address.
    pub addr: SocketAddr,
    /// 64-bit id echoed on accept and on every disconnect notice.
    pub connection_id: u64,
}

/// What kind of unconnected datagram was surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnconnectedKind {
    /// A plain unconnected message.
    Basic,
    /// A discovery broadcast looking for servers.
    DiscoveryRequest,
    /// A unicast answer to a discovery broadcast.
    DiscoveryResponse,
}

/// Events published by the manager, drained by the application.
#[derive(Debug)]
pub enum Event {
    /// An endpoint asked to connect and awaits `accept_connection` or
    /// `reject_connection`. Not raised when a passcode key is configured.
    ConnectionRequest {
        /// Requesting endpoint.
        addr: SocketAddr,
        /// Connection id the client generated.
        connection_id: u64,
        /// Application key bytes from the request.
        key: Vec<u8>,
    },
    /// A connection finished its handshake.
    PeerConnected(RemotePeer),
    /// A connection ended.
    PeerDisconnected {
        /// The peer that went away.
        peer: RemotePeer,
        /// Why it went away.
        reason: DisconnectReason,
        /// Additional payload carried by a remote disconnect notice.
        data: Vec<u8>,
    },
    /// A payload arrived on a connected peer.
    Receive {
        /// Originating peer.
        peer: RemotePeer,
        /// Delivery method it arrived under.
        delivery: DeliveryMethod,
        /// Sub-stream channel number.
        channel: u8,
        /// The reassembled payload.
        payload: Vec<u8>,
    },
    /// A datagram arrived from an endpoint without a connection.
    ReceiveUnconnected {
        /// Sending endpoint.
        addr: SocketAddr,
        /// Which side-channel it used.
        kind: UnconnectedKind,
        /// Raw payload bytes.
        payload: Vec<u8>,
    },
    /// A socket operation for this endpoint failed.
    NetworkError {
        /// Affected endpoint.
        addr: SocketAddr,
        /// The failing operation's error kind.
        error: io::ErrorKind,
    },
    /// A fresh RTT sample updated a peer's latency estimate.
    LatencyUpdated {
        /// The measured peer.
        peer: RemotePeer,
        /// Smoothed round-trip time.
        latency: Duration,
    },
}
