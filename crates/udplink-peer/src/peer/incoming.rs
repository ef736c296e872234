use std::time::{Duration, Instant};

use byteorder::{ByteOrder, LittleEndian};
use udplink_core::constants::{MTU_CANDIDATES, PROTOCOL_ID};
use udplink_protocol::{
    channel::Channel,
    packet::{DeliveryMethod, NetPacket, PacketProperty},
};

use super::{DisconnectReason, Peer, PeerAction};
use crate::peer_state::PeerState;

impl Peer {
    /// Consumes one parsed datagram from this peer's remote address and
    /// returns the resulting actions.
    pub fn process_packet(&mut self, packet: NetPacket, now: Instant) -> Vec<PeerAction> {
        let mut actions = Vec::new();
        self.handle_packet(packet, now, &mut actions);
        actions
    }

    pub(super) fn handle_packet(
        &mut self,
        packet: NetPacket,
        now: Instant,
        actions: &mut Vec<PeerAction>,
    ) {
        self.last_packet_receive_time = now;
        self.statistics.packets_received += 1;

        match packet.property() {
            PacketProperty::Merged => self.handle_merged(packet, now, actions),
            PacketProperty::Ping => self.handle_ping(packet, actions),
            PacketProperty::Pong => self.handle_pong(packet, now, actions),
            PacketProperty::Ack => self.handle_ack(packet),
            PacketProperty::Unreliable
            | PacketProperty::ReliableUnordered
            | PacketProperty::ReliableOrdered
            | PacketProperty::Sequenced => self.handle_user_data(packet, now, actions),
            PacketProperty::ReliableSequenced => {
                // Reserved delivery class; decoded but never surfaced.
                tracing::trace!("dropping reserved reliable-sequenced packet");
                self.pool.recycle(packet);
            }
            PacketProperty::ConnectRequest => self.handle_connect_request(packet, actions),
            PacketProperty::ConnectAccept => self.handle_connect_accept(packet, actions),
            PacketProperty::Disconnect => self.handle_disconnect(packet, actions),
            PacketProperty::ShutdownOk => {
                if self.state == PeerState::ShutdownRequested {
                    self.state = PeerState::Disconnected;
                }
                self.pool.recycle(packet);
            }
            PacketProperty::MtuCheck => self.handle_mtu_check(packet, actions),
            PacketProperty::MtuOk => {
                if let Some(&idx) = packet.payload().first() {
                    self.mtu.on_ok(idx);
                }
                self.pool.recycle(packet);
            }
            // Unconnected side-channels and NAT traffic are the manager's
            // (or an external module's) business, never a connected peer's.
            PacketProperty::UnconnectedMessage
            | PacketProperty::DiscoveryRequest
            | PacketProperty::DiscoveryResponse
            | PacketProperty::NatIntroduction
            | PacketProperty::NatIntroductionRequest
            | PacketProperty::NatPunchMessage => {
                self.pool.recycle(packet);
            }
        }
    }

    fn handle_merged(&mut self, packet: NetPacket, now: Instant, actions: &mut Vec<PeerAction>) {
        let payload = packet.payload().to_vec();
        self.pool.recycle(packet);

        let mut offset = 0;
        while offset + 2 <= payload.len() {
            let len = LittleEndian::read_u16(&payload[offset..offset + 2]) as usize;
            offset += 2;
            if len == 0 || offset + len > payload.len() {
                tracing::debug!("merged container length overruns datagram, dropping rest");
                return;
            }
            match self.pool.get_and_read(&payload[offset..offset + len]) {
                Ok(sub) => self.handle_packet(sub, now, actions),
                Err(err) => tracing::debug!(%err, "dropping malformed merged sub-packet"),
            }
            offset += len;
        }
    }

    fn handle_ping(&mut self, packet: NetPacket, actions: &mut Vec<PeerAction>) {
        if packet.data_size() == 8 {
            let mut pong = self.pool.get(PacketProperty::Pong, 0, 8);
            pong.payload_mut().copy_from_slice(packet.payload());
            self.emit_packet(pong, actions);
        }
        self.pool.recycle(packet);
    }

    fn handle_pong(&mut self, packet: NetPacket, now: Instant, actions: &mut Vec<PeerAction>) {
        if packet.data_size() == 8 {
            let stamp = LittleEndian::read_u64(packet.payload());
            let rtt_ms = self.elapsed_ms(now).saturating_sub(stamp);
            self.apply_rtt(Duration::from_millis(rtt_ms), actions);
        }
        self.pool.recycle(packet);
    }

    fn handle_ack(&mut self, packet: NetPacket) {
        let target = match DeliveryMethod::from_class_index(packet.channel()) {
            Some(DeliveryMethod::ReliableUnordered) => {
                self.reliable_unordered.as_mut().map(|c| c as &mut dyn Channel)
            }
            Some(DeliveryMethod::ReliableOrdered) => {
                self.reliable_ordered.as_mut().map(|c| c as &mut dyn Channel)
            }
            _ => None,
        };
        if let Some(channel) = target {
            channel.process_packet(packet);
        }
    }

    fn handle_user_data(&mut self, packet: NetPacket, now: Instant, actions: &mut Vec<PeerAction>) {
        let delivery = match DeliveryMethod::from_property(packet.property()) {
            Some(delivery) => delivery,
            None => return,
        };
        let mut ready = Vec::new();
        {
            let channel: Option<&mut dyn Channel> = match delivery {
                DeliveryMethod::Unreliable => self.simple.as_mut().map(|c| c as &mut dyn Channel),
                DeliveryMethod::ReliableUnordered => {
                    self.reliable_unordered.as_mut().map(|c| c as &mut dyn Channel)
                }
                DeliveryMethod::ReliableOrdered => {
                    self.reliable_ordered.as_mut().map(|c| c as &mut dyn Channel)
                }
                DeliveryMethod::Sequenced => {
                    self.sequenced.as_mut().map(|c| c as &mut dyn Channel)
                }
            };
            match channel {
                Some(channel) => {
                    if channel.process_packet(packet) {
                        while let Some(surfaced) = channel.pop_incoming() {
                            ready.push(surfaced);
                        }
                    }
                }
                None => {
                    tracing::debug!(?delivery, "packet for disabled channel dropped");
                }
            }
        }
        for surfaced in ready {
            self.deliver(surfaced, delivery, now, actions);
        }
    }

    /// Hands one surfaced packet to the application, reassembling fragment
    /// groups first.
    fn deliver(
        &mut self,
        packet: NetPacket,
        delivery: DeliveryMethod,
        now: Instant,
        actions: &mut Vec<PeerAction>,
    ) {
        let channel = packet.channel();
        let payload = if packet.is_fragmented() {
            match self.reassembly.insert(&packet, now) {
                Some(complete) => complete,
                None => {
                    self.pool.recycle(packet);
                    return;
                }
            }
        } else {
            packet.payload().to_vec()
        };
        self.pool.recycle(packet);
        self.statistics.bytes_received += payload.len() as u64;
        actions.push(PeerAction::Receive { delivery, channel, payload });
    }

    fn handle_connect_request(&mut self, packet: NetPacket, actions: &mut Vec<PeerAction>) {
        // A repeated request means our accept was lost; answer it again.
        let payload = packet.payload();
        if payload.len() >= 12
            && LittleEndian::read_u32(&payload[..4]) == PROTOCOL_ID
            && LittleEndian::read_u64(&payload[4..12]) == self.connection_id
            && self.state == PeerState::Connected
        {
            let accept = self.make_connect_accept();
            self.emit_packet(accept, actions);
        }
        self.pool.recycle(packet);
    }

    fn handle_connect_accept(&mut self, packet: NetPacket, actions: &mut Vec<PeerAction>) {
        if packet.data_size() == 8
            && LittleEndian::read_u64(packet.payload()) == self.connection_id
            && self.state == PeerState::InProgress
        {
            self.state = PeerState::Connected;
            actions.push(PeerAction::Connected);
        }
        self.pool.recycle(packet);
    }

    fn handle_disconnect(&mut self, packet: NetPacket, actions: &mut Vec<PeerAction>) {
        let payload = packet.payload();
        if payload.len() >= 8 && LittleEndian::read_u64(&payload[..8]) == self.connection_id {
            let data = payload[8..].to_vec();
            self.pool.recycle(packet);

            let ok = self.pool.get(PacketProperty::ShutdownOk, 0, 0);
            self.emit_packet(ok, actions);
            self.state = PeerState::Disconnected;
            self.notify_disconnect(DisconnectReason::RemoteConnectionClose, data, actions);
        } else {
            // Stale id from an earlier incarnation of this endpoint.
            self.pool.recycle(packet);
        }
    }

    fn handle_mtu_check(&mut self, packet: NetPacket, actions: &mut Vec<PeerAction>) {
        if let Some(&idx) = packet.payload().first() {
            if (idx as usize) < MTU_CANDIDATES.len() {
                let mut ok = self.pool.get(PacketProperty::MtuOk, 0, 1);
                ok.payload_mut()[0] = idx;
                self.emit_packet(ok, actions);
            }
        }
        self.pool.recycle(packet);
    }
}
