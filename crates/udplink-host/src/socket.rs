//! Socket binding and the debug-only conditioner.
//!
//! Binding goes through `socket2` so the manager can request a dual-stack
//! IPv6 socket, `SO_REUSEADDR` and broadcast before handing the socket to
//! std. The conditioner wraps the bound socket and, when enabled, drops or
//! delays received datagrams to simulate a lossy path.

use std::{
    collections::VecDeque,
    io,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket},
    time::{Duration, Instant},
};

use rand::Rng;
use socket2::{Domain, Protocol, Socket as Socket2, Type};
use udplink_core::{config::Config, transport::Socket};

/// Binds the manager's datagram socket according to the configuration.
///
/// With IPv6 enabled the socket is bound on the v6 wildcard (or the given
/// address) and set dual-stack when IPv4 is also enabled; otherwise a plain
/// IPv4 socket is bound. The socket is always non-blocking.
pub fn bind_socket(
    config: &Config,
    ipv4: Option<Ipv4Addr>,
    ipv6: Option<Ipv6Addr>,
    port: u16,
) -> io::Result<UdpSocket> {
    let socket = if config.enable_ipv6 {
        let socket = Socket2::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_only_v6(!config.enable_ipv4)?;
        if config.reuse_address {
            socket.set_reuse_address(true)?;
        }
        let addr = SocketAddr::from((ipv6.unwrap_or(Ipv6Addr::UNSPECIFIED), port));
        socket.bind(&addr.into())?;
        socket
    } else {
        let socket = Socket2::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        if config.reuse_address {
            socket.set_reuse_address(true)?;
        }
        let addr = SocketAddr::from((ipv4.unwrap_or(Ipv4Addr::UNSPECIFIED), port));
        socket.bind(&addr.into())?;
        socket
    };

    let socket: UdpSocket = socket.into();
    socket.set_nonblocking(true)?;
    if config.discovery_enabled {
        socket.set_broadcast(true)?;
    }
    Ok(socket)
}

/// A datagram held back by the latency simulation.
#[derive(Debug)]
struct DelayedDatagram {
    release_at: Instant,
    addr: SocketAddr,
    bytes: Vec<u8>,
}

/// The manager's socket, optionally conditioned with simulated loss and
/// latency on the receive path. Both knobs are runtime-mutable; everything
/// else about the socket is frozen at bind time.
#[derive(Debug)]
pub struct ConditionedSocket {
    socket: UdpSocket,
    simulate_loss: bool,
    loss_chance: u8,
    simulate_latency: bool,
    min_latency: Duration,
    max_latency: Duration,
    delayed: VecDeque<DelayedDatagram>,
}

impl ConditionedSocket {
    /// Wraps a bound socket, taking the simulation knobs from `config`.
    pub fn new(socket: UdpSocket, config: &Config) -> Self {
        Self {
            socket,
            simulate_loss: config.simulate_packet_loss,
            loss_chance: config.simulation_packet_loss_chance,
            simulate_latency: config.simulate_latency,
            min_latency: config.simulation_min_latency,
            max_latency: config.simulation_max_latency,
            delayed: VecDeque::new(),
        }
    }

    /// Reconfigures simulated packet loss.
    pub fn set_packet_loss(&mut self, enabled: bool, chance_percent: u8) {
        self.simulate_loss = enabled;
        self.loss_chance = chance_percent.min(100);
    }

    /// Reconfigures simulated latency.
    pub fn set_latency(&mut self, enabled: bool, min: Duration, max: Duration) {
        self.simulate_latency = enabled;
        self.min_latency = min;
        self.max_latency = max.max(min);
    }

    fn pop_due_delayed(&mut self, now: Instant) -> Option<DelayedDatagram> {
        match self.delayed.front() {
            Some(head) if head.release_at <= now => self.delayed.pop_front(),
            _ => None,
        }
    }
}

impl Socket for ConditionedSocket {
    fn send_packet(&mut self, addr: &SocketAddr, payload: &[u8]) -> io::Result<usize> {
        self.socket.send_to(payload, addr)
    }

    fn send_broadcast(&mut self, port: u16, payload: &[u8]) -> io::Result<usize> {
        self.socket
            .send_to(payload, (Ipv4Addr::BROADCAST, port))
    }

    fn receive_packet<'a>(&mut self, buffer: &'a mut [u8]) -> io::Result<(&'a [u8], SocketAddr)> {
        let now = Instant::now();
        let (len, addr) = loop {
            match self.socket.recv_from(&mut *buffer) {
                Ok((len, addr)) => {
                    if self.simulate_loss
                        && rand::rng().random_range(0..100u8) < self.loss_chance
                    {
                        continue;
                    }
                    if self.simulate_latency {
                        let delay = rand::rng().random_range(
                            self.min_latency.as_millis() as u64
                                ..=self.max_latency.as_millis() as u64,
                        );
                        self.delayed.push_back(DelayedDatagram {
                            release_at: now + Duration::from_millis(delay),
                            addr,
                            bytes: buffer[..len].to_vec(),
                        });
                        continue;
                    }
                    break (len, addr);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    match self.pop_due_delayed(now) {
                        Some(held) => {
                            buffer[..held.bytes.len()].copy_from_slice(&held.bytes);
                            break (held.bytes.len(), held.addr);
                        }
                        None => return Err(err),
                    }
                }
                Err(err) => return Err(err),
            }
        };
        Ok((&buffer[..len], addr))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}
