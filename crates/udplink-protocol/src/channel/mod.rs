//! Delivery channel state machines.
//!
//! A peer owns up to four channels, one per delivery method. Channels speak
//! exclusively in [`NetPacket`]s: the peer frames payloads (fragmenting if
//! needed) before queueing them, and unwraps surfaced packets afterwards.

use std::time::{Duration, Instant};

use crate::packet::NetPacket;

mod reliable;
mod sequenced;
mod simple;

pub use reliable::ReliableChannel;
pub use sequenced::SequencedChannel;
pub use simple::SimpleChannel;

/// Common contract of the four delivery state machines.
pub trait Channel {
    /// Enqueues an already-framed outgoing packet.
    fn add_to_queue(&mut self, packet: NetPacket);

    /// Moves due packets (including scheduled ACKs and retransmissions) into
    /// `out` for the socket path. May emit several packets per tick.
    fn send_next_packets(
        &mut self,
        now: Instant,
        resend_delay: Duration,
        out: &mut Vec<NetPacket>,
    );

    /// Consumes an incoming packet. Returns whether anything became ready to
    /// surface to the application via [`pop_incoming`](Self::pop_incoming).
    fn process_packet(&mut self, packet: NetPacket) -> bool;

    /// Dequeues the next payload packet in this channel's delivery order.
    fn pop_incoming(&mut self) -> Option<NetPacket>;

    /// Drops all retained state, recycling nothing (buffers are freed).
    fn reset(&mut self);
}
