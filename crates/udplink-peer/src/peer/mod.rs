use std::{
    net::SocketAddr,
    time::{Duration, Instant},
};

use byteorder::{ByteOrder, LittleEndian};
use udplink_core::{
    config::Config,
    constants::{MIN_RESEND_DELAY_MS, POOL_PACKETS_PER_CONNECTION, PROTOCOL_ID, RTT_AVG_WINDOW},
};
use udplink_protocol::{
    channel::{Channel, ReliableChannel, SequencedChannel, SimpleChannel},
    packet::{NetPacket, PacketProperty},
    PacketPool,
};

use crate::{
    fragment_buffer::ReassemblyTable, mtu_discovery::MtuDiscovery, peer_state::PeerState,
    statistics::PeerStatistics,
};

mod incoming;
mod outgoing;

/// Why a peer left the Connected state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The remote side sent a disconnect notice.
    RemoteConnectionClose,
    /// A socket send failed with a non-transient error.
    SocketSendError,
    /// No packet arrived within the disconnect timeout.
    Timeout,
    /// The local application asked for the disconnect.
    DisconnectPeerCalled,
    /// The connect handshake ran out of attempts.
    ConnectionFailed,
}

/// Instructions a peer hands back to the manager.
///
/// The peer never touches the socket or the event queue itself; it returns
/// what should happen and the manager executes it.
#[derive(Debug)]
pub enum PeerAction {
    /// Send these datagram bytes to the peer's remote address.
    Send(Vec<u8>),
    /// The handshake completed; surface a connect event.
    Connected,
    /// The connection ended; surface a disconnect event.
    Disconnected {
        /// Why the connection ended.
        reason: DisconnectReason,
        /// Additional payload from the remote disconnect notice.
        data: Vec<u8>,
    },
    /// A payload is ready for the application.
    Receive {
        /// Delivery method it arrived under.
        delivery: udplink_protocol::DeliveryMethod,
        /// Sub-stream channel number.
        channel: u8,
        /// The reassembled payload bytes.
        payload: Vec<u8>,
    },
    /// A fresh RTT sample updated the latency estimate.
    LatencyUpdated(Duration),
}

/// State for one remote endpoint: the four delivery channels plus handshake,
/// RTT, MTU, fragmentation and merge machinery.
#[derive(Debug)]
pub struct Peer {
    remote_address: SocketAddr,
    connection_id: u64,
    state: PeerState,
    config: Config,
    pool: PacketPool,

    reliable_ordered: Option<ReliableChannel>,
    reliable_unordered: Option<ReliableChannel>,
    sequenced: Option<SequencedChannel>,
    simple: Option<SimpleChannel>,

    mtu: MtuDiscovery,
    reassembly: ReassemblyTable,
    fragment_id_counter: u16,

    merge_buffer: Vec<u8>,
    merge_count: usize,

    created: Instant,
    last_packet_receive_time: Instant,
    ping_timer: Instant,
    rtt: Duration,
    avg_rtt: Duration,
    rtt_count: u32,

    connect_key: Vec<u8>,
    connect_attempts: u32,
    last_connect_send: Option<Instant>,

    shutdown_payload: Vec<u8>,
    shutdown_started: Option<Instant>,
    last_shutdown_send: Option<Instant>,
    disconnect_notified: bool,

    statistics: PeerStatistics,
}

impl Peer {
    fn new(
        remote_address: SocketAddr,
        connection_id: u64,
        state: PeerState,
        connect_key: Vec<u8>,
        config: &Config,
        now: Instant,
    ) -> Self {
        Self {
            remote_address,
            connection_id,
            state,
            config: config.clone(),
            pool: PacketPool::new(POOL_PACKETS_PER_CONNECTION),
            reliable_ordered: config.enable_reliable_ordered.then(|| ReliableChannel::new(true)),
            reliable_unordered: config
                .enable_reliable_unordered
                .then(|| ReliableChannel::new(false)),
            sequenced: config.enable_sequenced.then(SequencedChannel::new),
            simple: config.enable_simple.then(SimpleChannel::new),
            mtu: MtuDiscovery::new(config.mtu_start_idx),
            reassembly: ReassemblyTable::new(),
            fragment_id_counter: 0,
            merge_buffer: Vec::new(),
            merge_count: 0,
            created: now,
            last_packet_receive_time: now,
            ping_timer: now,
            rtt: Duration::ZERO,
            avg_rtt: Duration::ZERO,
            rtt_count: 0,
            connect_key,
            connect_attempts: 0,
            last_connect_send: None,
            shutdown_payload: Vec::new(),
            shutdown_started: None,
            last_shutdown_send: None,
            disconnect_notified: false,
            statistics: PeerStatistics::default(),
        }
    }

    /// Creates a client-side peer that will initiate the handshake on its
    /// first update. The connection id is generated locally.
    pub fn connect_to(
        remote_address: SocketAddr,
        key: Vec<u8>,
        config: &Config,
        now: Instant,
    ) -> Self {
        Self::new(
            remote_address,
            rand::random::<u64>(),
            PeerState::InProgress,
            key,
            config,
            now,
        )
    }

    /// Creates a server-side peer for an accepted connection request,
    /// echoing the client's connection id.
    pub fn accept(
        remote_address: SocketAddr,
        connection_id: u64,
        config: &Config,
        now: Instant,
    ) -> Self {
        Self::new(
            remote_address,
            connection_id,
            PeerState::Connected,
            Vec::new(),
            config,
            now,
        )
    }

    /// The remote endpoint this peer talks to.
    pub fn remote_address(&self) -> SocketAddr {
        self.remote_address
    }

    /// 64-bit id chosen by the connection initiator, echoed on accept and on
    /// every disconnect notice.
    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    /// Current connection state.
    pub fn state(&self) -> PeerState {
        self.state
    }

    /// True once the handshake completed.
    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    /// Latest RTT sample.
    pub fn rtt(&self) -> Duration {
        self.rtt
    }

    /// Moving-average RTT.
    pub fn avg_rtt(&self) -> Duration {
        self.avg_rtt
    }

    /// Currently negotiated MTU in datagram payload bytes.
    pub fn mtu(&self) -> usize {
        self.mtu.mtu()
    }

    /// Traffic counters for this peer.
    pub fn statistics(&self) -> PeerStatistics {
        let mut stats = self.statistics;
        stats.packets_lost = self
            .reliable_ordered
            .as_ref()
            .map_or(0, ReliableChannel::retransmissions)
            + self
                .reliable_unordered
                .as_ref()
                .map_or(0, ReliableChannel::retransmissions);
        stats
    }

    fn resend_delay(&self) -> Duration {
        Duration::from_millis(MIN_RESEND_DELAY_MS).max(self.avg_rtt * 2)
    }

    fn elapsed_ms(&self, now: Instant) -> u64 {
        now.duration_since(self.created).as_millis() as u64
    }

    fn apply_rtt(&mut self, sample: Duration, actions: &mut Vec<PeerAction>) {
        self.rtt = sample;
        self.rtt_count = (self.rtt_count + 1).min(RTT_AVG_WINDOW);
        let n = self.rtt_count;
        self.avg_rtt = (self.avg_rtt * (n - 1) + sample) / n;
        actions.push(PeerAction::LatencyUpdated(self.avg_rtt));
    }

    /// One tick of timers: handshake retransmits, keepalive, MTU probing,
    /// channel sends, merge flush, stale-fragment purge and the idle timeout.
    pub fn update(&mut self, now: Instant) -> Vec<PeerAction> {
        let mut actions = Vec::new();
        match self.state {
            PeerState::InProgress => self.update_connecting(now, &mut actions),
            PeerState::Connected => self.update_connected(now, &mut actions),
            PeerState::ShutdownRequested => self.update_shutting_down(now, &mut actions),
            PeerState::Disconnected => {}
        }
        actions
    }

    fn update_connecting(&mut self, now: Instant, actions: &mut Vec<PeerAction>) {
        let due = self
            .last_connect_send
            .map_or(true, |at| now.duration_since(at) >= self.config.reconnect_delay);
        if !due {
            return;
        }
        if self.connect_attempts >= self.config.max_connect_attempts {
            self.state = PeerState::Disconnected;
            self.notify_disconnect(DisconnectReason::ConnectionFailed, Vec::new(), actions);
            return;
        }
        self.connect_attempts += 1;
        self.last_connect_send = Some(now);
        let request = self.make_connect_request();
        self.emit_packet(request, actions);
    }

    fn update_connected(&mut self, now: Instant, actions: &mut Vec<PeerAction>) {
        if now.duration_since(self.last_packet_receive_time) > self.config.disconnect_timeout {
            self.state = PeerState::Disconnected;
            self.notify_disconnect(DisconnectReason::Timeout, Vec::new(), actions);
            return;
        }
        if now.duration_since(self.ping_timer) >= self.config.ping_interval {
            self.ping_timer = now;
            let mut ping = self.pool.get(PacketProperty::Ping, 0, 8);
            LittleEndian::write_u64(ping.payload_mut(), self.elapsed_ms(now));
            self.emit_packet(ping, actions);
        }
        if let Some(probe) = self.mtu.update(&mut self.pool, now) {
            self.emit_packet(probe, actions);
        }
        self.flush_channels(now, actions);
        self.reassembly.purge_stale(now, self.config.disconnect_timeout);
    }

    fn update_shutting_down(&mut self, now: Instant, actions: &mut Vec<PeerAction>) {
        let started = match self.shutdown_started {
            Some(at) => at,
            None => return,
        };
        if now.duration_since(started) > self.config.disconnect_timeout {
            // The remote never acknowledged; stop retransmitting.
            self.state = PeerState::Disconnected;
            return;
        }
        let due = self
            .last_shutdown_send
            .map_or(true, |at| now.duration_since(at) >= self.config.reconnect_delay);
        if due {
            self.last_shutdown_send = Some(now);
            let notice = self.make_disconnect();
            self.emit_packet(notice, actions);
        }
    }

    /// Starts a graceful disconnect. Idempotent: repeated calls on a peer
    /// that is already tearing down are no-ops.
    pub fn shutdown(&mut self, payload: &[u8], now: Instant) -> Vec<PeerAction> {
        let mut actions = Vec::new();
        if self.state.is_disconnecting() {
            return actions;
        }
        self.state = PeerState::ShutdownRequested;
        self.shutdown_payload = payload.to_vec();
        self.shutdown_started = Some(now);
        self.last_shutdown_send = Some(now);
        let notice = self.make_disconnect();
        self.emit_packet(notice, &mut actions);
        self.notify_disconnect(DisconnectReason::DisconnectPeerCalled, Vec::new(), &mut actions);
        actions
    }

    /// Marks the peer dead after a socket send failure.
    pub fn fail(&mut self) -> Vec<PeerAction> {
        let mut actions = Vec::new();
        if self.state != PeerState::Disconnected {
            self.state = PeerState::Disconnected;
            self.notify_disconnect(DisconnectReason::SocketSendError, Vec::new(), &mut actions);
        }
        actions
    }

    fn notify_disconnect(
        &mut self,
        reason: DisconnectReason,
        data: Vec<u8>,
        actions: &mut Vec<PeerAction>,
    ) {
        if !self.disconnect_notified {
            self.disconnect_notified = true;
            self.teardown_channels();
            actions.push(PeerAction::Disconnected { reason, data });
        }
    }

    /// Drops all retained channel state, releasing window copies and any
    /// buffered out-of-order packets.
    fn teardown_channels(&mut self) {
        if let Some(channel) = self.reliable_ordered.as_mut() {
            channel.reset();
        }
        if let Some(channel) = self.reliable_unordered.as_mut() {
            channel.reset();
        }
        if let Some(channel) = self.sequenced.as_mut() {
            channel.reset();
        }
        if let Some(channel) = self.simple.as_mut() {
            channel.reset();
        }
    }

    fn make_connect_request(&mut self) -> NetPacket {
        let mut packet = self.pool.get(
            PacketProperty::ConnectRequest,
            0,
            4 + 8 + self.connect_key.len(),
        );
        let payload = packet.payload_mut();
        LittleEndian::write_u32(&mut payload[..4], PROTOCOL_ID);
        LittleEndian::write_u64(&mut payload[4..12], self.connection_id);
        payload[12..].copy_from_slice(&self.connect_key);
        packet
    }

    /// Builds the accept packet echoing this peer's connection id. Used by
    /// the accept path and whenever the remote repeats its request.
    pub fn make_connect_accept(&mut self) -> NetPacket {
        let mut packet = self.pool.get(PacketProperty::ConnectAccept, 0, 8);
        LittleEndian::write_u64(packet.payload_mut(), self.connection_id);
        packet
    }

    fn make_disconnect(&mut self) -> NetPacket {
        let mut packet = self.pool.get(
            PacketProperty::Disconnect,
            0,
            8 + self.shutdown_payload.len(),
        );
        let payload = packet.payload_mut();
        LittleEndian::write_u64(&mut payload[..8], self.connection_id);
        payload[8..].copy_from_slice(&self.shutdown_payload);
        packet
    }

    /// Serialises a control packet straight into a send action, bypassing the
    /// merge buffer, and recycles it.
    fn emit_packet(&mut self, packet: NetPacket, actions: &mut Vec<PeerAction>) {
        actions.push(PeerAction::Send(packet.as_bytes().to_vec()));
        self.statistics.packets_sent += 1;
        self.pool.recycle(packet);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use udplink_core::Config;
    use udplink_protocol::DeliveryMethod;

    fn fake_addr() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    fn config() -> Config {
        let mut config = Config::default();
        config.enable_reliable_unordered = true;
        config.enable_simple = true;
        config
    }

    fn pump(from: &mut Peer, to: &mut Peer, now: Instant) -> Vec<PeerAction> {
        let mut surfaced = Vec::new();
        for action in from.update(now) {
            if let PeerAction::Send(bytes) = action {
                let mut pool = PacketPool::new(4);
                let packet = pool.get_and_read(&bytes).unwrap();
                surfaced.extend(to.process_packet(packet, now));
            }
        }
        surfaced
    }

    #[test]
    fn handshake_completes_and_reports_connected() {
        let now = Instant::now();
        let config = config();
        let mut client = Peer::connect_to(fake_addr(), b"key".to_vec(), &config, now);

        // First update emits the connect request.
        let actions = client.update(now);
        let request = match &actions[..] {
            [PeerAction::Send(bytes)] => bytes.clone(),
            other => panic!("expected one send, got {:?}", other),
        };
        let mut pool = PacketPool::new(4);
        let packet = pool.get_and_read(&request).unwrap();
        assert_eq!(packet.property(), PacketProperty::ConnectRequest);
        let payload = packet.payload();
        assert_eq!(LittleEndian::read_u32(&payload[..4]), PROTOCOL_ID);
        assert_eq!(&payload[12..], b"key");

        // Server accepts by echoing the connection id.
        let id = LittleEndian::read_u64(&payload[4..12]);
        let mut server = Peer::accept(fake_addr(), id, &config, now);
        let accept = server.make_connect_accept();
        let actions = client.process_packet(accept, now);
        assert!(matches!(actions.as_slice(), [PeerAction::Connected]));
        assert!(client.is_connected());
    }

    #[test]
    fn connect_gives_up_after_max_attempts() {
        let mut config = config();
        config.max_connect_attempts = 3;
        config.reconnect_delay = Duration::from_millis(100);
        let mut now = Instant::now();
        let mut client = Peer::connect_to(fake_addr(), Vec::new(), &config, now);

        let mut failed = false;
        for _ in 0..5 {
            for action in client.update(now) {
                if let PeerAction::Disconnected { reason, .. } = action {
                    assert_eq!(reason, DisconnectReason::ConnectionFailed);
                    failed = true;
                }
            }
            now += Duration::from_millis(100);
        }
        assert!(failed);
        assert_eq!(client.state(), PeerState::Disconnected);
    }

    #[test]
    fn idle_peer_times_out() {
        let config = config();
        let now = Instant::now();
        let mut peer = Peer::accept(fake_addr(), 1, &config, now);

        let later = now + config.disconnect_timeout + Duration::from_millis(1);
        let actions = peer.update(later);
        assert!(actions.iter().any(|a| matches!(
            a,
            PeerAction::Disconnected { reason: DisconnectReason::Timeout, .. }
        )));
        assert_eq!(peer.state(), PeerState::Disconnected);
    }

    #[test]
    fn ping_pong_updates_latency() {
        let config = config();
        let now = Instant::now();
        let mut a = Peer::accept(fake_addr(), 1, &config, now);
        let mut b = Peer::accept(fake_addr(), 1, &config, now);

        // After the ping interval, a pings; b answers with a pong.
        let t1 = now + config.ping_interval;
        let mut pong_bytes = None;
        for action in a.update(t1) {
            if let PeerAction::Send(bytes) = action {
                let mut pool = PacketPool::new(4);
                let packet = pool.get_and_read(&bytes).unwrap();
                if packet.property() == PacketProperty::Ping {
                    for reply in b.process_packet(packet, t1) {
                        if let PeerAction::Send(reply_bytes) = reply {
                            pong_bytes = Some(reply_bytes);
                        }
                    }
                }
            }
        }
        let pong = pong_bytes.expect("pong sent");

        // The pong arrives 40ms later; the RTT sample reflects that.
        let t2 = t1 + Duration::from_millis(40);
        let mut pool = PacketPool::new(4);
        let packet = pool.get_and_read(&pong).unwrap();
        let actions = a.process_packet(packet, t2);
        let latency = actions
            .iter()
            .find_map(|action| match action {
                PeerAction::LatencyUpdated(value) => Some(*value),
                _ => None,
            })
            .expect("latency update");
        assert_eq!(latency, Duration::from_millis(40));
        assert_eq!(a.rtt(), Duration::from_millis(40));
    }

    #[test]
    fn graceful_shutdown_is_idempotent() {
        let config = config();
        let now = Instant::now();
        let mut peer = Peer::accept(fake_addr(), 9, &config, now);

        let first = peer.shutdown(&[1, 2], now);
        assert!(first.iter().any(|a| matches!(a, PeerAction::Send(_))));
        assert!(first.iter().any(|a| matches!(
            a,
            PeerAction::Disconnected { reason: DisconnectReason::DisconnectPeerCalled, .. }
        )));
        assert_eq!(peer.state(), PeerState::ShutdownRequested);

        assert!(peer.shutdown(&[3], now).is_empty());
    }

    #[test]
    fn reliable_round_trip_between_two_peers() {
        let config = config();
        let mut now = Instant::now();
        let mut a = Peer::accept(fake_addr(), 1, &config, now);
        let mut b = Peer::accept(fake_addr(), 1, &config, now);

        a.send(b"hello", DeliveryMethod::ReliableOrdered, 0).unwrap();
        let surfaced = pump(&mut a, &mut b, now);
        let received: Vec<_> = surfaced
            .iter()
            .filter_map(|action| match action {
                PeerAction::Receive { payload, delivery, .. } => {
                    Some((payload.clone(), *delivery))
                }
                _ => None,
            })
            .collect();
        assert_eq!(received, vec![(b"hello".to_vec(), DeliveryMethod::ReliableOrdered)]);

        // The ACK flows back and clears the send window.
        now += Duration::from_millis(10);
        pump(&mut b, &mut a, now);
        now += Duration::from_millis(60);
        let resends: Vec<_> = a
            .update(now)
            .into_iter()
            .filter(|action| matches!(action, PeerAction::Send(_)))
            .collect();
        assert!(resends.is_empty(), "acked packet must not be retransmitted");
    }
}
