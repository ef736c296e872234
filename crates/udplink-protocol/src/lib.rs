#![warn(missing_docs)]

//! udplink-protocol: wire codec, packet pool and delivery channels.
//!
//! Everything on the wire is a [`packet::NetPacket`]: a pooled byte buffer
//! whose first bytes are the property/flag header described in the packet
//! module. The four delivery-channel state machines live under [`channel`]
//! and speak exclusively in packets.

/// Delivery channel state machines.
pub mod channel;
/// Packet properties, flags and the in-place header codec.
pub mod packet;
/// Size-class free lists of reusable packets.
pub mod packet_pool;
/// Wrapping 16-bit sequence arithmetic.
pub mod sequence;

pub use channel::{Channel, ReliableChannel, SequencedChannel, SimpleChannel};
pub use packet::{DeliveryMethod, NetPacket, PacketProperty};
pub use packet_pool::PacketPool;
pub use sequence::{relative_sequence, sequence_greater_than, sequence_less_than, SequenceNumber};
