use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use crate::{
    channel::Channel,
    packet::NetPacket,
    sequence::{relative_sequence, SequenceNumber},
};

/// The sequenced channel: outgoing packets are stamped with a monotonically
/// increasing sequence; incoming packets older than the newest seen are
/// dropped. Each sequence surfaces at most once. No retransmission.
#[derive(Debug)]
pub struct SequencedChannel {
    next_sequence: SequenceNumber,
    last_received: SequenceNumber,
    outgoing: VecDeque<NetPacket>,
    incoming: VecDeque<NetPacket>,
}

impl SequencedChannel {
    /// Creates an empty channel. The first received sequence may be any value
    /// in the forward half-range of the initial marker.
    pub fn new() -> Self {
        Self {
            next_sequence: 0,
            last_received: SequenceNumber::MAX,
            outgoing: VecDeque::new(),
            incoming: VecDeque::new(),
        }
    }
}

impl Default for SequencedChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl Channel for SequencedChannel {
    fn add_to_queue(&mut self, packet: NetPacket) {
        self.outgoing.push_back(packet);
    }

    fn send_next_packets(
        &mut self,
        _now: Instant,
        _resend_delay: Duration,
        out: &mut Vec<NetPacket>,
    ) {
        while let Some(mut packet) = self.outgoing.pop_front() {
            packet.set_sequence(self.next_sequence);
            self.next_sequence = self.next_sequence.wrapping_add(1);
            out.push(packet);
        }
    }

    fn process_packet(&mut self, packet: NetPacket) -> bool {
        let sequence = packet.sequence();
        if relative_sequence(sequence, self.last_received) > 0 {
            self.last_received = sequence;
            self.incoming.push_back(packet);
            true
        } else {
            // Older than or equal to the newest seen: stale or duplicate.
            false
        }
    }

    fn pop_incoming(&mut self) -> Option<NetPacket> {
        self.incoming.pop_front()
    }

    fn reset(&mut self) {
        self.outgoing.clear();
        self.incoming.clear();
        self.next_sequence = 0;
        self.last_received = SequenceNumber::MAX;
    }
}
