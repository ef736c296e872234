/// Per-peer traffic counters. Loss is approximated by reliable
/// retransmissions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerStatistics {
    /// Datagrams handed to the socket for this peer.
    pub packets_sent: u64,
    /// Datagrams received and parsed from this peer.
    pub packets_received: u64,
    /// Reliable packets that had to be retransmitted.
    pub packets_lost: u64,
    /// Payload bytes sent, protocol overhead excluded.
    pub bytes_sent: u64,
    /// Payload bytes received, protocol overhead excluded.
    pub bytes_received: u64,
}

impl PeerStatistics {
    /// Fraction of reliable sends that needed a retransmission.
    pub fn loss_ratio(&self) -> f32 {
        if self.packets_sent == 0 {
            0.0
        } else {
            self.packets_lost as f32 / self.packets_sent as f32
        }
    }
}
