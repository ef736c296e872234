use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use crate::{channel::Channel, packet::NetPacket};

/// The unreliable channel: no sequencing, no ACKs, every packet surfaces.
#[derive(Debug, Default)]
pub struct SimpleChannel {
    outgoing: VecDeque<NetPacket>,
    incoming: VecDeque<NetPacket>,
}

impl SimpleChannel {
    /// Creates an empty channel.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Channel for SimpleChannel {
    fn add_to_queue(&mut self, packet: NetPacket) {
        self.outgoing.push_back(packet);
    }

    fn send_next_packets(
        &mut self,
        _now: Instant,
        _resend_delay: Duration,
        out: &mut Vec<NetPacket>,
    ) {
        out.extend(self.outgoing.drain(..));
    }

    fn process_packet(&mut self, packet: NetPacket) -> bool {
        self.incoming.push_back(packet);
        true
    }

    fn pop_incoming(&mut self) -> Option<NetPacket> {
        self.incoming.pop_front()
    }

    fn reset(&mut self) {
        self.outgoing.clear();
        self.incoming.clear();
    }
}
