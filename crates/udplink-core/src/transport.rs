//! Transport abstraction for pluggable datagram I/O.

use std::{io::Result, net::SocketAddr};

/// Low-level datagram socket abstraction.
///
/// Lets alternative transports (OS UDP, loopback test harness, conditioned
/// sockets) plug into the manager without coupling it to a concrete
/// implementation.
pub trait Socket {
    /// Sends a single datagram to the given address.
    fn send_packet(&mut self, addr: &SocketAddr, payload: &[u8]) -> Result<usize>;

    /// Sends a single datagram to the broadcast address on the given port.
    fn send_broadcast(&mut self, port: u16, payload: &[u8]) -> Result<usize>;

    /// Receives a single datagram into `buffer`, returning the filled slice
    /// and the sender address.
    fn receive_packet<'a>(&mut self, buffer: &'a mut [u8]) -> Result<(&'a [u8], SocketAddr)>;

    /// Returns the local address this socket is bound to.
    fn local_addr(&self) -> Result<SocketAddr>;
}
