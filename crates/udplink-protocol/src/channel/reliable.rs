use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use byteorder::{ByteOrder, LittleEndian};
use udplink_core::constants::{ACK_BITMASK_BYTES, WINDOW_SIZE};

use crate::{
    channel::Channel,
    packet::{DeliveryMethod, NetPacket, PacketProperty},
    sequence::{relative_sequence, SequenceNumber},
};

/// A packet retained in the send window until acknowledged.
#[derive(Debug)]
struct PendingSlot {
    sequence: SequenceNumber,
    packet: NetPacket,
    last_send: Option<Instant>,
}

/// Reliable delivery over a fixed 64-packet send window with ACK bitmaps.
///
/// Both reliable variants share the ACK and retransmission machinery and
/// differ only in surfacing: unordered delivers in arrival order, ordered
/// buffers out-of-order packets and delivers in strict window order.
#[derive(Debug)]
pub struct ReliableChannel {
    ordered: bool,
    delivery: DeliveryMethod,

    // Send side.
    outgoing: VecDeque<NetPacket>,
    pending: Vec<Option<PendingSlot>>,
    local_window_start: SequenceNumber,
    next_sequence: SequenceNumber,

    // Receive side.
    remote_window_start: SequenceNumber,
    received_bits: [u8; ACK_BITMASK_BYTES],
    hold: Vec<Option<NetPacket>>,
    incoming: VecDeque<NetPacket>,
    must_send_ack: bool,

    retransmissions: u64,
}

impl ReliableChannel {
    /// Creates a reliable channel; `ordered` selects strict window-order
    /// surfacing.
    pub fn new(ordered: bool) -> Self {
        Self {
            ordered,
            delivery: if ordered {
                DeliveryMethod::ReliableOrdered
            } else {
                DeliveryMethod::ReliableUnordered
            },
            outgoing: VecDeque::new(),
            pending: (0..WINDOW_SIZE).map(|_| None).collect(),
            local_window_start: 0,
            next_sequence: 0,
            remote_window_start: 0,
            received_bits: [0; ACK_BITMASK_BYTES],
            hold: (0..WINDOW_SIZE).map(|_| None).collect(),
            incoming: VecDeque::new(),
            must_send_ack: false,
            retransmissions: 0,
        }
    }

    /// Packets sent more than once, a proxy for path loss.
    pub fn retransmissions(&self) -> u64 {
        self.retransmissions
    }

    /// Sequences retained in the window, i.e. sent but not yet acknowledged.
    pub fn packets_in_flight(&self) -> usize {
        self.pending.iter().filter(|slot| slot.is_some()).count()
    }

    /// Oldest unacknowledged outgoing sequence.
    pub fn local_window_start(&self) -> SequenceNumber {
        self.local_window_start
    }

    /// Next expected incoming window base.
    pub fn remote_window_start(&self) -> SequenceNumber {
        self.remote_window_start
    }

    fn bit(&self, sequence: SequenceNumber) -> bool {
        let idx = sequence as usize % WINDOW_SIZE;
        self.received_bits[idx / 8] & (1 << (idx % 8)) != 0
    }

    fn set_bit(&mut self, sequence: SequenceNumber, value: bool) {
        let idx = sequence as usize % WINDOW_SIZE;
        if value {
            self.received_bits[idx / 8] |= 1 << (idx % 8);
        } else {
            self.received_bits[idx / 8] &= !(1 << (idx % 8));
        }
    }

    /// Builds the ACK packet: sequence field zero, channel byte carrying the
    /// delivery class, payload `windowStart u16 | bitmask`.
    fn build_ack(&self) -> NetPacket {
        let mut ack = NetPacket::with_property(PacketProperty::Ack, 2 + ACK_BITMASK_BYTES);
        ack.set_channel(self.delivery.class_index());
        let payload = ack.payload_mut();
        LittleEndian::write_u16(&mut payload[..2], self.remote_window_start);
        for i in 0..WINDOW_SIZE {
            let sequence = self.remote_window_start.wrapping_add(i as u16);
            let idx = sequence as usize % WINDOW_SIZE;
            if self.received_bits[idx / 8] & (1 << (idx % 8)) != 0 {
                payload[2 + i / 8] |= 1 << (i % 8);
            }
        }
        ack
    }

    /// Applies an incoming ACK bitmap: releases acknowledged packets and
    /// slides the window past the contiguous acknowledged prefix.
    fn process_ack(&mut self, ack: &NetPacket) {
        let payload = ack.payload();
        if payload.len() < 2 + ACK_BITMASK_BYTES {
            return;
        }
        let ack_window_start = LittleEndian::read_u16(&payload[..2]);
        // Everything behind the remote window start was delivered: the
        // receiver only advances past a contiguous received prefix.
        let mut sequence = self.local_window_start;
        while sequence != self.next_sequence && relative_sequence(sequence, ack_window_start) < 0 {
            let idx = sequence as usize % WINDOW_SIZE;
            if self
                .pending[idx]
                .as_ref()
                .map_or(false, |slot| slot.sequence == sequence)
            {
                self.pending[idx] = None;
            }
            sequence = sequence.wrapping_add(1);
        }
        for i in 0..WINDOW_SIZE {
            if payload[2 + i / 8] & (1 << (i % 8)) == 0 {
                continue;
            }
            let sequence = ack_window_start.wrapping_add(i as u16);
            let rel = relative_sequence(sequence, self.local_window_start);
            if rel < 0 || rel >= WINDOW_SIZE as i16 {
                continue;
            }
            let idx = sequence as usize % WINDOW_SIZE;
            if self
                .pending[idx]
                .as_ref()
                .map_or(false, |slot| slot.sequence == sequence)
            {
                self.pending[idx] = None;
            }
        }
        // Strict-prefix advance.
        while self.local_window_start != self.next_sequence
            && self.pending[self.local_window_start as usize % WINDOW_SIZE].is_none()
        {
            self.local_window_start = self.local_window_start.wrapping_add(1);
        }
    }

    fn process_data(&mut self, packet: NetPacket) -> bool {
        let sequence = packet.sequence();
        let rel = relative_sequence(sequence, self.remote_window_start);

        if rel < 0 {
            // Behind the window: already delivered. Re-acknowledge when the
            // sequence is still within the ACK window behind the tail.
            if rel > -(WINDOW_SIZE as i16) {
                self.must_send_ack = true;
            }
            return false;
        }
        if rel >= WINDOW_SIZE as i16 {
            // Ahead of the window; the sender retransmits once it slides.
            return false;
        }
        if self.bit(sequence) {
            // Duplicate inside the window: ACK again, do not re-surface.
            self.must_send_ack = true;
            return false;
        }

        self.set_bit(sequence, true);
        self.must_send_ack = true;

        if self.ordered {
            self.hold[sequence as usize % WINDOW_SIZE] = Some(packet);
            let mut surfaced = false;
            while self.bit(self.remote_window_start) {
                let idx = self.remote_window_start as usize % WINDOW_SIZE;
                match self.hold[idx].take() {
                    Some(ready) => {
                        self.incoming.push_back(ready);
                        surfaced = true;
                    }
                    None => break,
                }
                self.set_bit(self.remote_window_start, false);
                self.remote_window_start = self.remote_window_start.wrapping_add(1);
            }
            surfaced
        } else {
            self.incoming.push_back(packet);
            while self.bit(self.remote_window_start) {
                self.set_bit(self.remote_window_start, false);
                self.remote_window_start = self.remote_window_start.wrapping_add(1);
            }
            true
        }
    }
}

impl Channel for ReliableChannel {
    fn add_to_queue(&mut self, packet: NetPacket) {
        self.outgoing.push_back(packet);
    }

    fn send_next_packets(
        &mut self,
        now: Instant,
        resend_delay: Duration,
        out: &mut Vec<NetPacket>,
    ) {
        if self.must_send_ack {
            out.push(self.build_ack());
            self.must_send_ack = false;
        }

        // Admit queued payloads into free window slots.
        while !self.outgoing.is_empty()
            && relative_sequence(self.next_sequence, self.local_window_start)
                < WINDOW_SIZE as i16
        {
            let mut packet = self.outgoing.pop_front().expect("checked non-empty");
            packet.set_sequence(self.next_sequence);
            packet.set_dont_recycle(true);
            self.pending[self.next_sequence as usize % WINDOW_SIZE] = Some(PendingSlot {
                sequence: self.next_sequence,
                packet,
                last_send: None,
            });
            self.next_sequence = self.next_sequence.wrapping_add(1);
        }

        // First sends and retransmissions of everything due in the window.
        let mut sequence = self.local_window_start;
        while sequence != self.next_sequence {
            let idx = sequence as usize % WINDOW_SIZE;
            if let Some(slot) = self.pending[idx].as_mut() {
                let due = slot
                    .last_send
                    .map_or(true, |sent| now.duration_since(sent) >= resend_delay);
                if due {
                    if slot.last_send.is_some() {
                        self.retransmissions += 1;
                    }
                    let mut copy = slot.packet.clone();
                    copy.set_dont_recycle(false);
                    out.push(copy);
                    slot.last_send = Some(now);
                }
            }
            sequence = sequence.wrapping_add(1);
        }
    }

    fn process_packet(&mut self, packet: NetPacket) -> bool {
        match packet.property() {
            PacketProperty::Ack => {
                self.process_ack(&packet);
                false
            }
            _ => self.process_data(packet),
        }
    }

    fn pop_incoming(&mut self) -> Option<NetPacket> {
        self.incoming.pop_front()
    }

    fn reset(&mut self) {
        self.outgoing.clear();
        for slot in self.pending.iter_mut() {
            *slot = None;
        }
        for slot in self.hold.iter_mut() {
            *slot = None;
        }
        self.incoming.clear();
        self.received_bits = [0; ACK_BITMASK_BYTES];
        self.local_window_start = 0;
        self.next_sequence = 0;
        self.remote_window_start = 0;
        self.must_send_ack = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RESEND: Duration = Duration::from_millis(50);

    fn data_packet(ordered: bool, payload: &[u8]) -> NetPacket {
        let property = if ordered {
            PacketProperty::ReliableOrdered
        } else {
            PacketProperty::ReliableUnordered
        };
        let mut packet = NetPacket::with_property(property, payload.len());
        packet.payload_mut().copy_from_slice(payload);
        packet
    }

    fn drain(channel: &mut ReliableChannel, now: Instant) -> Vec<NetPacket> {
        let mut out = Vec::new();
        channel.send_next_packets(now, RESEND, &mut out);
        out
    }

    /// Feeds every non-ACK packet from `sender` into `receiver` and routes
    /// the resulting ACK back. Returns the surfaced payload packets.
    fn exchange(
        sender: &mut ReliableChannel,
        receiver: &mut ReliableChannel,
        now: Instant,
    ) -> Vec<NetPacket> {
        let mut surfaced = Vec::new();
        for packet in drain(sender, now) {
            receiver.process_packet(packet);
        }
        while let Some(packet) = receiver.pop_incoming() {
            surfaced.push(packet);
        }
        for packet in drain(receiver, now) {
            assert_eq!(packet.property(), PacketProperty::Ack);
            sender.process_packet(packet);
        }
        surfaced
    }

    #[test]
    fn delivers_and_acknowledges() {
        let now = Instant::now();
        let mut sender = ReliableChannel::new(true);
        let mut receiver = ReliableChannel::new(true);

        sender.add_to_queue(data_packet(true, b"a"));
        sender.add_to_queue(data_packet(true, b"b"));

        let surfaced = exchange(&mut sender, &mut receiver, now);
        assert_eq!(surfaced.len(), 2);
        assert_eq!(surfaced[0].payload(), b"a");
        assert_eq!(surfaced[1].payload(), b"b");

        assert_eq!(sender.packets_in_flight(), 0);
        assert_eq!(sender.local_window_start(), 2);
        assert_eq!(receiver.remote_window_start(), 2);
    }

    #[test]
    fn ordered_buffers_out_of_order_arrivals() {
        let now = Instant::now();
        let mut sender = ReliableChannel::new(true);
        let mut receiver = ReliableChannel::new(true);

        for payload in [b"0", b"1", b"2"] {
            sender.add_to_queue(data_packet(true, payload));
        }
        let sent = drain(&mut sender, now);
        assert_eq!(sent.len(), 3);

        // Deliver 2 first: nothing surfaces yet.
        assert!(!receiver.process_packet(sent[2].clone()));
        assert!(receiver.pop_incoming().is_none());

        // 0 surfaces alone, then 1 releases 1 and 2.
        assert!(receiver.process_packet(sent[0].clone()));
        assert_eq!(receiver.pop_incoming().unwrap().payload(), b"0");
        assert!(receiver.process_packet(sent[1].clone()));
        assert_eq!(receiver.pop_incoming().unwrap().payload(), b"1");
        assert_eq!(receiver.pop_incoming().unwrap().payload(), b"2");
    }

    #[test]
    fn unordered_surfaces_in_arrival_order() {
        let now = Instant::now();
        let mut sender = ReliableChannel::new(false);
        let mut receiver = ReliableChannel::new(false);

        for payload in [b"0", b"1", b"2"] {
            sender.add_to_queue(data_packet(false, payload));
        }
        let sent = drain(&mut sender, now);

        assert!(receiver.process_packet(sent[2].clone()));
        assert!(receiver.process_packet(sent[0].clone()));
        assert_eq!(receiver.pop_incoming().unwrap().payload(), b"2");
        assert_eq!(receiver.pop_incoming().unwrap().payload(), b"0");
    }

    #[test]
    fn duplicates_are_acked_but_not_resurfaced() {
        let now = Instant::now();
        let mut sender = ReliableChannel::new(true);
        let mut receiver = ReliableChannel::new(true);

        sender.add_to_queue(data_packet(true, b"x"));
        let sent = drain(&mut sender, now);

        assert!(receiver.process_packet(sent[0].clone()));
        assert_eq!(receiver.pop_incoming().unwrap().payload(), b"x");

        // Same packet again: dropped, but an ACK is scheduled.
        assert!(!receiver.process_packet(sent[0].clone()));
        assert!(receiver.pop_incoming().is_none());
        let replies = drain(&mut receiver, now);
        assert!(replies.iter().any(|p| p.property() == PacketProperty::Ack));
    }

    #[test]
    fn retransmits_after_resend_delay_until_acked() {
        let now = Instant::now();
        let mut sender = ReliableChannel::new(true);
        sender.add_to_queue(data_packet(true, b"r"));

        assert_eq!(drain(&mut sender, now).len(), 1);
        // Not due yet.
        assert_eq!(drain(&mut sender, now + Duration::from_millis(10)).len(), 0);
        // Due again after the resend delay.
        let resent = drain(&mut sender, now + Duration::from_millis(60));
        assert_eq!(resent.len(), 1);
        assert_eq!(resent[0].sequence(), 0);
        assert_eq!(sender.packets_in_flight(), 1);
    }

    #[test]
    fn lost_then_recovered_packet_restores_window_liveness() {
        let now = Instant::now();
        let mut sender = ReliableChannel::new(true);
        let mut receiver = ReliableChannel::new(true);

        for payload in [b"0", b"1", b"2"] {
            sender.add_to_queue(data_packet(true, payload));
        }
        let mut sent = drain(&mut sender, now);
        // Lose the first packet.
        sent.remove(0);
        for packet in sent {
            receiver.process_packet(packet);
        }
        for ack in drain(&mut receiver, now) {
            sender.process_packet(ack);
        }
        // Window cannot advance past the lost head.
        assert_eq!(sender.local_window_start(), 0);
        assert_eq!(sender.packets_in_flight(), 1);

        // Retransmission arrives; everything surfaces in order.
        let later = now + Duration::from_millis(60);
        for packet in drain(&mut sender, later) {
            receiver.process_packet(packet);
        }
        assert_eq!(receiver.pop_incoming().unwrap().payload(), b"0");
        assert_eq!(receiver.pop_incoming().unwrap().payload(), b"1");
        assert_eq!(receiver.pop_incoming().unwrap().payload(), b"2");
        for ack in drain(&mut receiver, later) {
            sender.process_packet(ack);
        }
        assert_eq!(sender.local_window_start(), 3);
        assert_eq!(sender.packets_in_flight(), 0);
    }

    #[test]
    fn window_bounds_outstanding_packets() {
        let now = Instant::now();
        let mut sender = ReliableChannel::new(false);
        for _ in 0..WINDOW_SIZE + 10 {
            sender.add_to_queue(data_packet(false, b"w"));
        }
        let sent = drain(&mut sender, now);
        assert_eq!(sent.len(), WINDOW_SIZE);
        assert_eq!(sender.packets_in_flight(), WINDOW_SIZE);
    }

    #[test]
    fn window_slides_across_sequence_wraparound() {
        let now = Instant::now();
        let mut sender = ReliableChannel::new(true);
        let mut receiver = ReliableChannel::new(true);

        // Push both ends close to the wrap point.
        sender.local_window_start = 65530;
        sender.next_sequence = 65530;
        receiver.remote_window_start = 65530;

        for _ in 0..10 {
            sender.add_to_queue(data_packet(true, b"z"));
        }
        let surfaced = exchange(&mut sender, &mut receiver, now);
        assert_eq!(surfaced.len(), 10);
        assert_eq!(sender.local_window_start(), 4);
        assert_eq!(receiver.remote_window_start(), 4);
        assert_eq!(sender.packets_in_flight(), 0);
    }
}
