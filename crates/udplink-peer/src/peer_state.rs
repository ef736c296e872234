/// Connection state machine of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeerState {
    /// Connect request sent, waiting for the accept.
    #[default]
    InProgress,
    /// Handshake complete, traffic flows.
    Connected,
    /// Disconnect notice sent, waiting for the shutdown acknowledgment.
    ShutdownRequested,
    /// Terminal state; the manager removes the peer on its next tick.
    Disconnected,
}

impl PeerState {
    /// True once the handshake has completed.
    pub fn is_connected(self) -> bool {
        matches!(self, PeerState::Connected)
    }

    /// True while the peer is tearing down or gone.
    pub fn is_disconnecting(self) -> bool {
        matches!(self, PeerState::ShutdownRequested | PeerState::Disconnected)
    }
}
