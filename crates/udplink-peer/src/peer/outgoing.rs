use std::time::Instant;

use byteorder::{ByteOrder, LittleEndian};
use udplink_core::{constants::MAX_CHANNELS, ErrorKind, Result};
use udplink_protocol::{
    channel::Channel,
    packet::{header_size, DeliveryMethod, NetPacket, PacketProperty},
};

use super::{Peer, PeerAction};
use crate::fragment_buffer::FragmentBuffer;

impl Peer {
    /// Queues a payload for delivery, fragmenting it when it exceeds the
    /// negotiated MTU. The packets go out on the next update or flush.
    pub fn send(&mut self, payload: &[u8], delivery: DeliveryMethod, channel: u8) -> Result<()> {
        if channel >= MAX_CHANNELS {
            return Err(ErrorKind::InvalidChannel(channel));
        }
        if self.state.is_disconnecting() {
            return Err(ErrorKind::NotConnected);
        }
        if !self.channel_enabled(delivery) {
            return Err(ErrorKind::UnsupportedDelivery);
        }

        let property = delivery.property();
        let mtu = self.mtu.mtu();
        let single_max = mtu - header_size(property, false);

        if payload.len() <= single_max {
            let packet = self.pool.get_with_data(property, channel, payload);
            self.route_outgoing(delivery, packet);
        } else {
            let part_capacity = mtu - header_size(property, true);
            let parts = (payload.len() + part_capacity - 1) / part_capacity;
            if parts > u16::MAX as usize {
                return Err(ErrorKind::PacketTooLarge(payload.len()));
            }

            let mut buffer = FragmentBuffer::new(property, channel, mtu);
            buffer.write(&mut self.pool, payload);
            let fragment_id = self.fragment_id_counter;
            self.fragment_id_counter = self.fragment_id_counter.wrapping_add(1);
            for part in buffer.finish(fragment_id) {
                self.route_outgoing(delivery, part);
            }
        }
        self.statistics.bytes_sent += payload.len() as u64;
        Ok(())
    }

    fn channel_enabled(&self, delivery: DeliveryMethod) -> bool {
        match delivery {
            DeliveryMethod::Unreliable => self.simple.is_some(),
            DeliveryMethod::ReliableUnordered => self.reliable_unordered.is_some(),
            DeliveryMethod::ReliableOrdered => self.reliable_ordered.is_some(),
            DeliveryMethod::Sequenced => self.sequenced.is_some(),
        }
    }

    fn route_outgoing(&mut self, delivery: DeliveryMethod, packet: NetPacket) {
        match delivery {
            DeliveryMethod::Unreliable => {
                if let Some(channel) = self.simple.as_mut() {
                    channel.add_to_queue(packet);
                }
            }
            DeliveryMethod::ReliableUnordered => {
                if let Some(channel) = self.reliable_unordered.as_mut() {
                    channel.add_to_queue(packet);
                }
            }
            DeliveryMethod::ReliableOrdered => {
                if let Some(channel) = self.reliable_ordered.as_mut() {
                    channel.add_to_queue(packet);
                }
            }
            DeliveryMethod::Sequenced => {
                if let Some(channel) = self.sequenced.as_mut() {
                    channel.add_to_queue(packet);
                }
            }
        }
    }

    /// Drains due packets from every channel through the merge buffer and
    /// flushes the remainder, as the end of a tick does.
    pub fn flush(&mut self, now: Instant) -> Vec<PeerAction> {
        let mut actions = Vec::new();
        self.flush_channels(now, &mut actions);
        actions
    }

    pub(super) fn flush_channels(&mut self, now: Instant, actions: &mut Vec<PeerAction>) {
        let resend_delay = self.resend_delay();
        let mut outgoing = Vec::new();
        if let Some(channel) = self.reliable_ordered.as_mut() {
            channel.send_next_packets(now, resend_delay, &mut outgoing);
        }
        if let Some(channel) = self.reliable_unordered.as_mut() {
            channel.send_next_packets(now, resend_delay, &mut outgoing);
        }
        if let Some(channel) = self.sequenced.as_mut() {
            channel.send_next_packets(now, resend_delay, &mut outgoing);
        }
        if let Some(channel) = self.simple.as_mut() {
            channel.send_next_packets(now, resend_delay, &mut outgoing);
        }
        for packet in outgoing {
            self.dispatch(packet, actions);
        }
        self.flush_merge(actions);
    }

    /// Routes one wire packet out, coalescing small packets into the merge
    /// container while merging is enabled.
    fn dispatch(&mut self, packet: NetPacket, actions: &mut Vec<PeerAction>) {
        let mtu = self.mtu.mtu();
        let bytes = packet.as_bytes();

        if self.config.merge_enabled && bytes.len() < mtu / 2 {
            if !self.merge_buffer.is_empty()
                && self.merge_buffer.len() + 2 + bytes.len() > mtu
            {
                self.flush_merge(actions);
            }
            if self.merge_buffer.is_empty() {
                self.merge_buffer.push(PacketProperty::Merged as u8);
            }
            let mut length = [0u8; 2];
            LittleEndian::write_u16(&mut length, bytes.len() as u16);
            self.merge_buffer.extend_from_slice(&length);
            self.merge_buffer.extend_from_slice(bytes);
            self.merge_count += 1;
        } else {
            actions.push(PeerAction::Send(bytes.to_vec()));
            self.statistics.packets_sent += 1;
        }
        self.pool.recycle(packet);
    }

    pub(super) fn flush_merge(&mut self, actions: &mut Vec<PeerAction>) {
        if self.merge_buffer.is_empty() {
            return;
        }
        if self.merge_count == 1 {
            // A container of one saves nothing; unwrap and send it raw.
            let length = LittleEndian::read_u16(&self.merge_buffer[1..3]) as usize;
            actions.push(PeerAction::Send(self.merge_buffer[3..3 + length].to_vec()));
        } else {
            actions.push(PeerAction::Send(self.merge_buffer.clone()));
        }
        self.statistics.packets_sent += 1;
        self.merge_buffer.clear();
        self.merge_count = 0;
    }
}
