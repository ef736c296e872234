//! The socket pump and tick loop.
//!
//! Everything runs on the caller's thread: `run` (or `manual_poll`) drains
//! the cross-thread submission queue, pumps the socket, routes datagrams to
//! peers, executes the actions peers return, and sweeps out dead peers.
//! Events reach the application through a crossbeam channel.

use std::{
    collections::HashMap,
    io,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use udplink_core::{
    config::Config,
    constants::{MAX_PACKET_SIZE, PROTOCOL_ID},
    transport::Socket,
    ErrorKind, Result,
};
use udplink_peer::{Peer, PeerAction, PeerState};
use udplink_protocol::{
    packet::{DeliveryMethod, NetPacket, PacketProperty},
    PacketPool,
};

use crate::{
    event::{Event, RemotePeer, UnconnectedKind},
    socket::{bind_socket, ConditionedSocket},
    time::{Clock, SystemClock},
};

use byteorder::{ByteOrder, LittleEndian};

/// A payload submitted for sending, possibly from another thread.
/// `addr = None` broadcasts to every connected peer.
#[derive(Debug)]
pub struct OutgoingMessage {
    /// Target peer, or `None` for all connected peers.
    pub addr: Option<SocketAddr>,
    /// Payload bytes.
    pub payload: Vec<u8>,
    /// Delivery method to send under.
    pub delivery: DeliveryMethod,
    /// Sub-stream channel number.
    pub channel: u8,
}

/// Connection id of a request awaiting an accept/reject decision.
#[derive(Debug)]
struct PendingRequest {
    connection_id: u64,
}

/// EMSGSIZE on linux, bsd/darwin and windows respectively.
fn is_message_too_long(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(90) | Some(40) | Some(10040))
}

/// EHOSTUNREACH / ENETUNREACH on linux, bsd/darwin and windows.
fn is_unreachable(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(113) | Some(101) | Some(65) | Some(51) | Some(10065) | Some(10051)
    )
}

/// Drives all peers over one datagram socket from a single-threaded tick.
pub struct Manager {
    config: Config,
    socket: Option<ConditionedSocket>,
    peers: super::PeerTable,
    pending_requests: HashMap<SocketAddr, PendingRequest>,
    pool: PacketPool,
    receive_buffer: Vec<u8>,
    clock: Arc<dyn Clock>,

    event_sender: Sender<Event>,
    event_receiver: Receiver<Event>,
    message_sender: Sender<OutgoingMessage>,
    message_receiver: Receiver<OutgoingMessage>,
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("running", &self.socket.is_some())
            .field("peers", &self.peers.len())
            .finish()
    }
}

impl Manager {
    /// Creates a stopped manager; call [`start`](Self::start) to bind.
    pub fn new(config: Config) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Creates a stopped manager with a custom time source for tests.
    pub fn with_clock(config: Config, clock: Arc<dyn Clock>) -> Self {
        let (event_sender, event_receiver) = unbounded();
        let (message_sender, message_receiver) = unbounded();
        let pool_limit = config.pool_limit();
        let peers = super::PeerTable::new(config.max_connections);
        Self {
            config,
            socket: None,
            peers,
            pending_requests: HashMap::new(),
            pool: PacketPool::new(pool_limit),
            receive_buffer: vec![0; MAX_PACKET_SIZE],
            clock,
            event_sender,
            event_receiver,
            message_sender,
            message_receiver,
        }
    }

    /// Binds the socket on `port` and marks the manager running.
    pub fn start(&mut self, port: u16) -> Result<()> {
        self.start_with_addrs(None, None, port)
    }

    /// Binds on explicit addresses. Fails with `AlreadyRunning` when started
    /// twice; bind errors pass through.
    pub fn start_with_addrs(
        &mut self,
        ipv4: Option<Ipv4Addr>,
        ipv6: Option<Ipv6Addr>,
        port: u16,
    ) -> Result<()> {
        if self.socket.is_some() {
            return Err(ErrorKind::AlreadyRunning);
        }
        let socket = bind_socket(&self.config, ipv4, ipv6, port)?;
        self.socket = Some(ConditionedSocket::new(socket, &self.config));
        Ok(())
    }

    /// Sends one disconnect notice to every peer and releases the socket.
    pub fn stop(&mut self) {
        self.disconnect_all(&[]);
        self.socket = None;
        self.pending_requests.clear();
    }

    /// True while the socket is bound.
    pub fn is_running(&self) -> bool {
        self.socket.is_some()
    }

    /// The bound local address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        match &self.socket {
            Some(socket) => Ok(socket.local_addr()?),
            None => Err(ErrorKind::NotRunning),
        }
    }

    /// Number of peers whose handshake has completed.
    pub fn peers_count(&self) -> usize {
        self.peers.connected_count()
    }

    /// Traffic counters of a known peer.
    pub fn peer_statistics(&self, peer: &RemotePeer) -> Option<udplink_peer::PeerStatistics> {
        self.peers.get(&peer.addr).map(|entry| entry.statistics())
    }

    /// Connection state of a known peer.
    pub fn peer_state(&self, peer: &RemotePeer) -> Option<PeerState> {
        self.peers.get(&peer.addr).map(|entry| entry.state())
    }

    /// Latest smoothed round-trip time of a known peer.
    pub fn peer_rtt(&self, peer: &RemotePeer) -> Option<Duration> {
        self.peers.get(&peer.addr).map(|entry| entry.avg_rtt())
    }

    /// Handle of the first connected peer, if any.
    pub fn first_peer(&self) -> Option<RemotePeer> {
        self.peers
            .iter()
            .find(|(_, peer)| peer.is_connected())
            .map(|(addr, peer)| RemotePeer { addr: *addr, connection_id: peer.connection_id() })
    }

    /// Receiver side of the event queue.
    pub fn event_receiver(&self) -> &Receiver<Event> {
        &self.event_receiver
    }

    /// Pops the next pending event, if any.
    pub fn poll_event(&self) -> Option<Event> {
        match self.event_receiver.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Clone of the cross-thread submission queue. Messages enqueue from any
    /// thread and are drained at the start of the next tick.
    pub fn message_sender(&self) -> Sender<OutgoingMessage> {
        self.message_sender.clone()
    }

    /// Initiates a connection. Returns the existing handle when the address
    /// is already known and `None` when the table is full or the manager is
    /// stopped.
    pub fn connect(&mut self, addr: SocketAddr, key: &[u8]) -> Option<RemotePeer> {
        if self.socket.is_none() {
            tracing::warn!("connect called before start");
            return None;
        }
        if let Some(peer) = self.peers.get(&addr) {
            return Some(RemotePeer { addr, connection_id: peer.connection_id() });
        }
        if self.peers.is_full() {
            return None;
        }
        let peer = Peer::connect_to(addr, key.to_vec(), &self.config, self.clock.now());
        let handle = RemotePeer { addr, connection_id: peer.connection_id() };
        self.peers.insert(addr, peer);
        Some(handle)
    }

    /// Queues a payload to one peer.
    pub fn send(
        &mut self,
        peer: &RemotePeer,
        payload: &[u8],
        delivery: DeliveryMethod,
        channel: u8,
    ) -> Result<()> {
        self.send_to(peer.addr, payload, delivery, channel)
    }

    /// Queues a payload to the peer at `addr`.
    pub fn send_to(
        &mut self,
        addr: SocketAddr,
        payload: &[u8],
        delivery: DeliveryMethod,
        channel: u8,
    ) -> Result<()> {
        match self.peers.get_mut(&addr) {
            Some(peer) => peer.send(payload, delivery, channel),
            None => Err(ErrorKind::NotConnected),
        }
    }

    /// Queues a payload to every connected peer, optionally excluding one.
    pub fn send_to_all(
        &mut self,
        payload: &[u8],
        delivery: DeliveryMethod,
        channel: u8,
        exclude: Option<SocketAddr>,
    ) {
        for (addr, peer) in self.peers.iter_mut() {
            if Some(*addr) == exclude || !peer.is_connected() {
                continue;
            }
            if let Err(err) = peer.send(payload, delivery, channel) {
                tracing::warn!(%addr, %err, "broadcast send failed for peer");
            }
        }
    }

    /// Starts a graceful disconnect of one peer, attaching `payload` to the
    /// notice. Idempotent.
    pub fn disconnect_peer(&mut self, peer: &RemotePeer, payload: &[u8]) {
        let now = self.clock.now();
        let actions = match self.peers.get_mut(&peer.addr) {
            Some(entry) => entry.shutdown(payload, now),
            None => return,
        };
        let connection_id = peer.connection_id;
        self.execute_actions(peer.addr, connection_id, actions);
    }

    /// Disconnects every peer.
    pub fn disconnect_all(&mut self, payload: &[u8]) {
        let now = self.clock.now();
        for addr in self.peers.addresses() {
            let (connection_id, actions) = match self.peers.get_mut(&addr) {
                Some(peer) => (peer.connection_id(), peer.shutdown(payload, now)),
                None => continue,
            };
            self.execute_actions(addr, connection_id, actions);
        }
    }

    /// Accepts a pending connection request, creating the peer and answering
    /// with a connect-accept.
    pub fn accept_connection(&mut self, addr: SocketAddr) -> Option<RemotePeer> {
        let pending = self.pending_requests.remove(&addr)?;
        self.admit(addr, pending.connection_id, self.clock.now())
    }

    /// Rejects a pending connection request; the client's handshake times
    /// out on its own.
    pub fn reject_connection(&mut self, addr: SocketAddr) {
        self.pending_requests.remove(&addr);
    }

    /// Broadcasts a discovery request to `port`.
    pub fn send_discovery_request(&mut self, port: u16, payload: &[u8]) -> Result<()> {
        if !self.config.discovery_enabled {
            return Err(ErrorKind::UnsupportedDelivery);
        }
        let packet = self
            .pool
            .get_with_data(PacketProperty::DiscoveryRequest, 0, payload);
        let socket = self.socket.as_mut().ok_or(ErrorKind::NotRunning)?;
        socket.send_broadcast(port, packet.as_bytes())?;
        self.pool.recycle(packet);
        Ok(())
    }

    /// Sends a discovery request to one known endpoint instead of the
    /// broadcast address.
    pub fn send_discovery_request_to(&mut self, addr: SocketAddr, payload: &[u8]) -> Result<()> {
        if !self.config.discovery_enabled {
            return Err(ErrorKind::UnsupportedDelivery);
        }
        let packet = self
            .pool
            .get_with_data(PacketProperty::DiscoveryRequest, 0, payload);
        let bytes = packet.as_bytes().to_vec();
        self.pool.recycle(packet);
        self.send_raw(addr, &bytes);
        Ok(())
    }

    /// Answers a discovery request with a unicast response.
    pub fn send_discovery_response(&mut self, addr: SocketAddr, payload: &[u8]) -> Result<()> {
        if !self.config.discovery_enabled {
            return Err(ErrorKind::UnsupportedDelivery);
        }
        let packet = self
            .pool
            .get_with_data(PacketProperty::DiscoveryResponse, 0, payload);
        let bytes = packet.as_bytes().to_vec();
        self.pool.recycle(packet);
        self.send_raw(addr, &bytes);
        Ok(())
    }

    /// Sends a raw payload to an endpoint without a connection.
    pub fn send_unconnected_message(&mut self, addr: SocketAddr, payload: &[u8]) -> Result<()> {
        if !self.config.unconnected_messages_enabled {
            return Err(ErrorKind::UnsupportedDelivery);
        }
        let packet = self
            .pool
            .get_with_data(PacketProperty::UnconnectedMessage, 0, payload);
        let bytes = packet.as_bytes().to_vec();
        self.pool.recycle(packet);
        self.send_raw(addr, &bytes);
        Ok(())
    }

    /// Reconfigures simulated packet loss on the live socket (debug only).
    pub fn set_simulation_packet_loss(&mut self, enabled: bool, chance_percent: u8) {
        if let Some(socket) = self.socket.as_mut() {
            socket.set_packet_loss(enabled, chance_percent);
        }
    }

    /// Reconfigures simulated latency on the live socket (debug only).
    pub fn set_simulation_latency(&mut self, enabled: bool, min: Duration, max: Duration) {
        if let Some(socket) = self.socket.as_mut() {
            socket.set_latency(enabled, min, max);
        }
    }

    /// One tick using the configured update time as the budget.
    pub fn tick(&mut self) {
        let budget = self.config.update_time;
        self.run(budget);
    }

    /// One tick with a time budget: poll, then sleep the remainder.
    pub fn run(&mut self, timeout: Duration) {
        let started = self.clock.now();
        self.manual_poll(started);
        let elapsed = started.elapsed();
        if elapsed < timeout {
            thread::sleep(timeout - elapsed);
        }
    }

    /// One tick at an explicit instant: drain submissions, pump the socket,
    /// update every peer, sweep out the dead.
    pub fn manual_poll(&mut self, now: Instant) {
        if self.socket.is_none() {
            return;
        }

        while let Ok(message) = self.message_receiver.try_recv() {
            match message.addr {
                Some(addr) => {
                    if let Err(err) =
                        self.send_to(addr, &message.payload, message.delivery, message.channel)
                    {
                        tracing::warn!(%addr, %err, "queued send failed");
                    }
                }
                None => {
                    self.send_to_all(&message.payload, message.delivery, message.channel, None)
                }
            }
        }

        loop {
            let received = {
                let socket = self.socket.as_mut().expect("checked above");
                match socket.receive_packet(&mut self.receive_buffer) {
                    Ok((bytes, addr)) => Some((bytes.len(), addr)),
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => None,
                    Err(err) => {
                        tracing::error!(%err, "socket receive failed");
                        None
                    }
                }
            };
            let (len, addr) = match received {
                Some(datagram) => datagram,
                None => break,
            };
            let packet = match self.pool.get_and_read(&self.receive_buffer[..len]) {
                Ok(packet) => packet,
                Err(err) => {
                    tracing::trace!(%addr, %err, "dropping malformed datagram");
                    continue;
                }
            };
            self.handle_packet(addr, packet, now);
        }

        for addr in self.peers.addresses() {
            let (connection_id, actions) = match self.peers.get_mut(&addr) {
                Some(peer) => (peer.connection_id(), peer.update(now)),
                None => continue,
            };
            self.execute_actions(addr, connection_id, actions);
        }

        let dead: Vec<SocketAddr> = self
            .peers
            .iter()
            .filter(|(_, peer)| peer.state() == PeerState::Disconnected)
            .map(|(addr, _)| *addr)
            .collect();
        for addr in dead {
            self.peers.remove(&addr);
            self.pending_requests.remove(&addr);
        }
    }

    fn handle_packet(&mut self, addr: SocketAddr, packet: NetPacket, now: Instant) {
        if self.peers.get(&addr).is_some() {
            let (connection_id, actions) = {
                let peer = self.peers.get_mut(&addr).expect("checked above");
                (peer.connection_id(), peer.process_packet(packet, now))
            };
            self.execute_actions(addr, connection_id, actions);
            return;
        }

        match packet.property() {
            PacketProperty::ConnectRequest => self.handle_connect_request(addr, packet, now),
            PacketProperty::Disconnect => {
                // Unknown peer: acknowledge statelessly so the remote side
                // stops retransmitting.
                self.pool.recycle(packet);
                let ok = self.pool.get(PacketProperty::ShutdownOk, 0, 0);
                let bytes = ok.as_bytes().to_vec();
                self.pool.recycle(ok);
                self.send_raw(addr, &bytes);
            }
            PacketProperty::DiscoveryRequest if self.config.discovery_enabled => {
                self.emit_unconnected(addr, UnconnectedKind::DiscoveryRequest, packet);
            }
            PacketProperty::DiscoveryResponse if self.config.discovery_enabled => {
                self.emit_unconnected(addr, UnconnectedKind::DiscoveryResponse, packet);
            }
            PacketProperty::UnconnectedMessage if self.config.unconnected_messages_enabled => {
                self.emit_unconnected(addr, UnconnectedKind::Basic, packet);
            }
            _ => {
                tracing::trace!(%addr, "dropping datagram from unknown endpoint");
                self.pool.recycle(packet);
            }
        }
    }

    fn emit_unconnected(&mut self, addr: SocketAddr, kind: UnconnectedKind, packet: NetPacket) {
        let payload = packet.payload().to_vec();
        self.pool.recycle(packet);
        self.emit(Event::ReceiveUnconnected { addr, kind, payload });
    }

    fn handle_connect_request(&mut self, addr: SocketAddr, packet: NetPacket, now: Instant) {
        let payload = packet.payload();
        if payload.len() < 12 {
            self.pool.recycle(packet);
            return;
        }
        let protocol = LittleEndian::read_u32(&payload[..4]);
        if protocol != PROTOCOL_ID {
            // Wrong protocol: no response at all.
            tracing::trace!(%addr, protocol, "rejecting connect with foreign protocol id");
            self.pool.recycle(packet);
            return;
        }
        let connection_id = LittleEndian::read_u64(&payload[4..12]);
        let key = payload[12..].to_vec();
        self.pool.recycle(packet);

        if self.peers.is_full() {
            tracing::warn!(%addr, "rejecting connect, peer table full");
            return;
        }

        if !self.config.passcode_key.is_empty() {
            if key == self.config.passcode_key.as_bytes() {
                self.admit(addr, connection_id, now);
            } else {
                tracing::debug!(%addr, "rejecting connect, passcode mismatch");
            }
            return;
        }

        // Retransmitted requests refresh the pending entry without raising a
        // second event.
        if self.pending_requests.contains_key(&addr) {
            return;
        }
        self.pending_requests.insert(addr, PendingRequest { connection_id });
        self.emit(Event::ConnectionRequest { addr, connection_id, key });
    }

    /// Creates the accepted peer, answers the handshake and surfaces the
    /// connect event.
    fn admit(&mut self, addr: SocketAddr, connection_id: u64, now: Instant) -> Option<RemotePeer> {
        if self.peers.is_full() {
            return None;
        }
        let mut peer = Peer::accept(addr, connection_id, &self.config, now);
        let accept = peer.make_connect_accept();
        let bytes = accept.as_bytes().to_vec();
        self.peers.insert(addr, peer);
        self.send_raw(addr, &bytes);
        let handle = RemotePeer { addr, connection_id };
        self.emit(Event::PeerConnected(handle));
        Some(handle)
    }

    fn execute_actions(
        &mut self,
        addr: SocketAddr,
        connection_id: u64,
        actions: Vec<PeerAction>,
    ) {
        let peer = RemotePeer { addr, connection_id };
        for action in actions {
            match action {
                PeerAction::Send(bytes) => self.send_raw(addr, &bytes),
                PeerAction::Connected => self.emit(Event::PeerConnected(peer)),
                PeerAction::Disconnected { reason, data } => {
                    self.emit(Event::PeerDisconnected { peer, reason, data })
                }
                PeerAction::Receive { delivery, channel, payload } => {
                    self.emit(Event::Receive { peer, delivery, channel, payload })
                }
                PeerAction::LatencyUpdated(latency) => {
                    self.emit(Event::LatencyUpdated { peer, latency })
                }
            }
        }
    }

    /// Sends datagram bytes, applying the send-error taxonomy: transient and
    /// size/route errors drop silently, anything else kills the peer.
    fn send_raw(&mut self, addr: SocketAddr, bytes: &[u8]) {
        let socket = match self.socket.as_mut() {
            Some(socket) => socket,
            None => return,
        };
        let err = match socket.send_packet(&addr, bytes) {
            Ok(_) => return,
            Err(err) => err,
        };
        if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) {
            return;
        }
        if is_message_too_long(&err) || is_unreachable(&err) {
            tracing::debug!(%addr, %err, "dropping undeliverable datagram");
            return;
        }
        tracing::error!(%addr, %err, "socket send failed");
        self.emit(Event::NetworkError { addr, error: err.kind() });
        if let Some(peer) = self.peers.get_mut(&addr) {
            let connection_id = peer.connection_id();
            let actions = peer.fail();
            for action in actions {
                if let PeerAction::Disconnected { reason, data } = action {
                    self.emit(Event::PeerDisconnected {
                        peer: RemotePeer { addr, connection_id },
                        reason,
                        data,
                    });
                }
            }
        }
    }

    fn emit(&self, event: Event) {
        // The manager holds its own receiver, so the channel cannot close.
        let _ = self.event_sender.send(event);
    }
}
