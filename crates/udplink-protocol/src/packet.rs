//! Packet properties, flags and the in-place header codec.
//!
//! Every datagram starts with one byte `[flags:3 | property:5]`. Bit 7 is the
//! Ack flag, bit 6 the Fragmented flag, bit 5 is reserved. Sequenced
//! properties carry a little-endian u16 sequence in bytes 1-2; the four
//! user-delivery properties (and Ack) carry a channel byte right after the
//! sequence; a set Fragmented flag adds the six-byte triple
//! `(fragment_id u16, fragment_part u16, fragments_total u16)`.

use std::convert::TryFrom;

use udplink_core::{
    constants::{CHANNEL_TYPE_COUNT, FRAGMENT_HEADER_SIZE},
    DecodingErrorKind,
};

use crate::sequence::SequenceNumber;

/// Mask selecting the property bits of the first header byte.
pub const PROPERTY_MASK: u8 = 0x1F;
/// Ack flag (bit 7 of the first header byte).
pub const FLAG_ACK: u8 = 0x80;
/// Fragmented flag (bit 6 of the first header byte).
pub const FLAG_FRAGMENTED: u8 = 0x40;

/// Identifies what a packet carries and which header fields are present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketProperty {
    /// Fire-and-forget user payload.
    Unreliable = 0,
    /// Acknowledged user payload, surfaced in arrival order.
    ReliableUnordered = 1,
    /// Acknowledged user payload, surfaced in sequence order.
    ReliableOrdered = 2,
    /// Drop-old user payload.
    Sequenced = 3,
    /// Reserved delivery class; decodes but is never surfaced.
    ReliableSequenced = 4,
    /// Reliable-window acknowledgment bitmap.
    Ack = 5,
    /// Keepalive probe carrying a monotonic stamp.
    Ping = 6,
    /// Echo of a ping stamp.
    Pong = 7,
    /// Handshake initiation.
    ConnectRequest = 8,
    /// Handshake acceptance echoing the connection id.
    ConnectAccept = 9,
    /// Graceful shutdown notice.
    Disconnect = 10,
    /// Acknowledgment of a shutdown notice.
    ShutdownOk = 11,
    /// Raw payload from an endpoint without a connection.
    UnconnectedMessage = 12,
    /// Discovery broadcast.
    DiscoveryRequest = 13,
    /// Unicast answer to a discovery broadcast.
    DiscoveryResponse = 14,
    /// MTU probe padded to a candidate size.
    MtuCheck = 15,
    /// Echo of a successful MTU probe index.
    MtuOk = 16,
    /// NAT introduction (handled by an external module).
    NatIntroduction = 17,
    /// NAT introduction request (handled by an external module).
    NatIntroductionRequest = 18,
    /// NAT punch probe (handled by an external module).
    NatPunchMessage = 19,
    /// Container of concatenated small packets.
    Merged = 20,
}

impl PacketProperty {
    /// True when the header carries a sequence number.
    pub fn is_sequenced(self) -> bool {
        matches!(
            self,
            PacketProperty::ReliableUnordered
                | PacketProperty::ReliableOrdered
                | PacketProperty::Sequenced
                | PacketProperty::ReliableSequenced
                | PacketProperty::Ack
        )
    }

    /// True when the header carries a channel byte.
    pub fn is_channeled(self) -> bool {
        matches!(
            self,
            PacketProperty::Unreliable
                | PacketProperty::ReliableUnordered
                | PacketProperty::ReliableOrdered
                | PacketProperty::Sequenced
                | PacketProperty::ReliableSequenced
                | PacketProperty::Ack
        )
    }
}

impl TryFrom<u8> for PacketProperty {
    type Error = DecodingErrorKind;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PacketProperty::Unreliable),
            1 => Ok(PacketProperty::ReliableUnordered),
            2 => Ok(PacketProperty::ReliableOrdered),
            3 => Ok(PacketProperty::Sequenced),
            4 => Ok(PacketProperty::ReliableSequenced),
            5 => Ok(PacketProperty::Ack),
            6 => Ok(PacketProperty::Ping),
            7 => Ok(PacketProperty::Pong),
            8 => Ok(PacketProperty::ConnectRequest),
            9 => Ok(PacketProperty::ConnectAccept),
            10 => Ok(PacketProperty::Disconnect),
            11 => Ok(PacketProperty::ShutdownOk),
            12 => Ok(PacketProperty::UnconnectedMessage),
            13 => Ok(PacketProperty::DiscoveryRequest),
            14 => Ok(PacketProperty::DiscoveryResponse),
            15 => Ok(PacketProperty::MtuCheck),
            16 => Ok(PacketProperty::MtuOk),
            17 => Ok(PacketProperty::NatIntroduction),
            18 => Ok(PacketProperty::NatIntroductionRequest),
            19 => Ok(PacketProperty::NatPunchMessage),
            20 => Ok(PacketProperty::Merged),
            _ => Err(DecodingErrorKind::PacketProperty),
        }
    }
}

/// How the application wants a payload delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMethod {
    /// No guarantees.
    Unreliable,
    /// Guaranteed, arrival order.
    ReliableUnordered,
    /// Guaranteed, send order.
    ReliableOrdered,
    /// Newest-wins, duplicates dropped.
    Sequenced,
}

impl DeliveryMethod {
    /// The wire property user payloads of this method carry.
    pub fn property(self) -> PacketProperty {
        match self {
            DeliveryMethod::Unreliable => PacketProperty::Unreliable,
            DeliveryMethod::ReliableUnordered => PacketProperty::ReliableUnordered,
            DeliveryMethod::ReliableOrdered => PacketProperty::ReliableOrdered,
            DeliveryMethod::Sequenced => PacketProperty::Sequenced,
        }
    }

    /// Stable index of the delivery class, used to tag ACK packets.
    pub fn class_index(self) -> u8 {
        match self {
            DeliveryMethod::Unreliable => 0,
            DeliveryMethod::ReliableUnordered => 1,
            DeliveryMethod::ReliableOrdered => 2,
            DeliveryMethod::Sequenced => 3,
        }
    }

    /// Maps a user-delivery property back to its method.
    pub fn from_property(property: PacketProperty) -> Option<Self> {
        match property {
            PacketProperty::Unreliable => Some(DeliveryMethod::Unreliable),
            PacketProperty::ReliableUnordered => Some(DeliveryMethod::ReliableUnordered),
            PacketProperty::ReliableOrdered => Some(DeliveryMethod::ReliableOrdered),
            PacketProperty::Sequenced => Some(DeliveryMethod::Sequenced),
            _ => None,
        }
    }

    /// Maps an ACK channel-byte class index back to its method.
    pub fn from_class_index(index: u8) -> Option<Self> {
        if index >= CHANNEL_TYPE_COUNT {
            return None;
        }
        match index {
            0 => Some(DeliveryMethod::Unreliable),
            1 => Some(DeliveryMethod::ReliableUnordered),
            2 => Some(DeliveryMethod::ReliableOrdered),
            _ => Some(DeliveryMethod::Sequenced),
        }
    }
}

/// Header bytes a property occupies, without the fragment triple.
fn base_header_size(property: PacketProperty) -> usize {
    let mut size = 1;
    if property.is_sequenced() {
        size += 2;
    }
    if property.is_channeled() {
        size += 1;
    }
    size
}

/// Header bytes a property occupies on the wire.
pub fn header_size(property: PacketProperty, fragmented: bool) -> usize {
    base_header_size(property) + if fragmented { FRAGMENT_HEADER_SIZE } else { 0 }
}

/// A contiguous wire buffer plus metadata, owned by the pool or a caller.
///
/// All header accessors read and write the underlying bytes directly, so a
/// packet is always in wire form.
#[derive(Debug, Clone)]
pub struct NetPacket {
    data: Vec<u8>,
    size: usize,
    dont_recycle: bool,
}

impl NetPacket {
    /// Creates a zeroed packet with the header for `property` and room for
    /// `payload_size` payload bytes.
    pub fn with_property(property: PacketProperty, payload_size: usize) -> Self {
        let total = header_size(property, false) + payload_size;
        let mut data = vec![0u8; total];
        data[0] = property as u8;
        Self { data, size: total, dont_recycle: false }
    }

    /// Creates a zeroed fragment packet: the Fragmented flag is set and the
    /// header reserves the fragment triple.
    pub fn with_fragmented_property(property: PacketProperty, payload_size: usize) -> Self {
        let total = header_size(property, true) + payload_size;
        let mut data = vec![0u8; total];
        data[0] = property as u8 | FLAG_FRAGMENTED;
        Self { data, size: total, dont_recycle: false }
    }

    /// Wraps an existing buffer that already contains a verified header.
    pub(crate) fn from_parts(data: Vec<u8>, size: usize) -> Self {
        Self { data, size, dont_recycle: false }
    }

    /// Validates a raw datagram header. Returns the decoded property.
    pub fn verify(bytes: &[u8]) -> Result<PacketProperty, DecodingErrorKind> {
        let first = *bytes.first().ok_or(DecodingErrorKind::TruncatedHeader)?;
        let property = PacketProperty::try_from(first & PROPERTY_MASK)?;
        let fragmented = first & FLAG_FRAGMENTED != 0;
        let header = header_size(property, fragmented);
        if bytes.len() < header {
            return Err(DecodingErrorKind::TruncatedHeader);
        }
        if fragmented {
            let base = base_header_size(property);
            let part = u16::from_le_bytes([bytes[base + 2], bytes[base + 3]]);
            let total = u16::from_le_bytes([bytes[base + 4], bytes[base + 5]]);
            if part >= total {
                return Err(DecodingErrorKind::FragmentBounds);
            }
        }
        Ok(property)
    }

    /// The packet property encoded in the header byte.
    pub fn property(&self) -> PacketProperty {
        // The byte was validated on creation; an unknown value here is a bug.
        PacketProperty::try_from(self.data[0] & PROPERTY_MASK)
            .unwrap_or(PacketProperty::Unreliable)
    }

    /// Rewrites the property bits, keeping the flags.
    pub fn set_property(&mut self, property: PacketProperty) {
        self.data[0] = (self.data[0] & !PROPERTY_MASK) | property as u8;
    }

    /// True when the Fragmented flag is set.
    pub fn is_fragmented(&self) -> bool {
        self.data[0] & FLAG_FRAGMENTED != 0
    }

    /// True when the Ack flag (reserved bit 7) is set.
    pub fn ack_flag(&self) -> bool {
        self.data[0] & FLAG_ACK != 0
    }

    /// Total valid bytes, header included.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Payload bytes, i.e. `size - header_size(property)`.
    pub fn data_size(&self) -> usize {
        self.size - self.header_size()
    }

    /// Header bytes of this packet, fragment triple included when flagged.
    pub fn header_size(&self) -> usize {
        header_size(self.property(), self.is_fragmented())
    }

    /// Sequence number, little-endian at bytes 1-2. Zero for unsequenced
    /// properties.
    pub fn sequence(&self) -> SequenceNumber {
        if self.property().is_sequenced() {
            u16::from_le_bytes([self.data[1], self.data[2]])
        } else {
            0
        }
    }

    /// Stamps the sequence number.
    pub fn set_sequence(&mut self, sequence: SequenceNumber) {
        debug_assert!(self.property().is_sequenced());
        self.data[1..3].copy_from_slice(&sequence.to_le_bytes());
    }

    fn channel_offset(&self) -> usize {
        if self.property().is_sequenced() {
            3
        } else {
            1
        }
    }

    /// Channel byte. Zero for properties that do not carry one.
    pub fn channel(&self) -> u8 {
        if self.property().is_channeled() {
            self.data[self.channel_offset()]
        } else {
            0
        }
    }

    /// Stamps the channel byte.
    pub fn set_channel(&mut self, channel: u8) {
        debug_assert!(self.property().is_channeled());
        let offset = self.channel_offset();
        self.data[offset] = channel;
    }

    fn fragment_offset(&self) -> usize {
        base_header_size(self.property())
    }

    /// Fragment group id. Meaningless unless the Fragmented flag is set.
    pub fn fragment_id(&self) -> u16 {
        let offset = self.fragment_offset();
        u16::from_le_bytes([self.data[offset], self.data[offset + 1]])
    }

    /// Zero-based index of this part within its fragment group.
    pub fn fragment_part(&self) -> u16 {
        let offset = self.fragment_offset();
        u16::from_le_bytes([self.data[offset + 2], self.data[offset + 3]])
    }

    /// Total parts in this packet's fragment group.
    pub fn fragments_total(&self) -> u16 {
        let offset = self.fragment_offset();
        u16::from_le_bytes([self.data[offset + 4], self.data[offset + 5]])
    }

    /// Stamps the fragment triple. The packet must have been created with
    /// [`NetPacket::with_fragmented_property`].
    pub fn set_fragment_info(&mut self, id: u16, part: u16, total: u16) {
        debug_assert!(self.is_fragmented());
        let offset = self.fragment_offset();
        self.data[offset..offset + 2].copy_from_slice(&id.to_le_bytes());
        self.data[offset + 2..offset + 4].copy_from_slice(&part.to_le_bytes());
        self.data[offset + 4..offset + 6].copy_from_slice(&total.to_le_bytes());
    }

    /// Read-only view of the payload.
    pub fn payload(&self) -> &[u8] {
        &self.data[self.header_size()..self.size]
    }

    /// Mutable view of the payload.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        let header = self.header_size();
        &mut self.data[header..self.size]
    }

    /// The full wire image of the packet.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.size]
    }

    /// Shrinks the packet to `payload_len` payload bytes. The header is kept.
    pub fn shrink_payload(&mut self, payload_len: usize) {
        let total = self.header_size() + payload_len;
        debug_assert!(total <= self.size);
        self.size = total;
    }

    /// Pins the packet so `recycle` becomes a no-op while it is referenced
    /// elsewhere (e.g. retained in a reliable send window).
    pub fn set_dont_recycle(&mut self, pinned: bool) {
        self.dont_recycle = pinned;
    }

    /// True while the packet is pinned against recycling.
    pub fn dont_recycle(&self) -> bool {
        self.dont_recycle
    }

    /// Consumes the packet, handing its buffer back for pooling.
    pub(crate) fn into_buffer(self) -> Vec<u8> {
        self.data
    }

    /// Reuses `buffer` as the storage of a fresh zeroed packet, growing it in
    /// place when the requested size exceeds its capacity.
    pub(crate) fn reuse(
        buffer: Vec<u8>,
        property: PacketProperty,
        fragmented: bool,
        total: usize,
    ) -> Self {
        let mut buffer = buffer;
        buffer.clear();
        buffer.resize(total, 0);
        buffer[0] = property as u8 | if fragmented { FLAG_FRAGMENTED } else { 0 };
        Self { data: buffer, size: total, dont_recycle: false }
    }

    /// Reuses `buffer` for a verified wire image copied from `bytes`.
    pub(crate) fn reuse_from_bytes(mut buffer: Vec<u8>, bytes: &[u8]) -> Self {
        buffer.clear();
        buffer.extend_from_slice(bytes);
        Self { data: buffer, size: bytes.len(), dont_recycle: false }
    }

    /// Capacity of the underlying storage.
    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }
}
