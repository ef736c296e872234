//! Size-class free lists of reusable packets.
//!
//! Buffers are bucketed by `(size - 1) / 16`, capped at bucket 8 ("others").
//! Buckets 2 and 3 share the 64-byte class and buckets 4-7 share the 128-byte
//! class, so close size classes do not fragment the pool. Each class holds at
//! most `limit` buffers; overflow is dropped. The pool is single-threaded and
//! lives on the manager's tick thread.

use std::collections::VecDeque;

use udplink_core::{constants::MAX_PACKET_SIZE, DecodingErrorKind};

use crate::packet::{header_size, NetPacket, PacketProperty};

const CLASS_COUNT: usize = 5;

/// Nominal buffer capacity of each physical class; the last class holds
/// everything up to `MAX_PACKET_SIZE`.
const CLASS_SIZES: [usize; CLASS_COUNT] = [16, 32, 64, 128, MAX_PACKET_SIZE];

fn bucket_of(size: usize) -> usize {
    ((size.max(1) - 1) / 16).min(8)
}

fn class_of(size: usize) -> usize {
    match bucket_of(size) {
        0 => 0,
        1 => 1,
        2 | 3 => 2,
        4..=7 => 3,
        _ => 4,
    }
}

/// Free lists of reusable packet buffers, one bounded queue per size class.
#[derive(Debug)]
pub struct PacketPool {
    classes: [VecDeque<Vec<u8>>; CLASS_COUNT],
    limit: usize,
}

impl PacketPool {
    /// Creates a pool keeping at most `limit` buffers per class.
    pub fn new(limit: usize) -> Self {
        Self { classes: Default::default(), limit }
    }

    fn take_buffer(&mut self, total: usize) -> Vec<u8> {
        let class = class_of(total);
        // The "others" class has no nominal size; allocate exactly on miss.
        let nominal = if class == CLASS_COUNT - 1 { total } else { CLASS_SIZES[class] };
        self.classes[class]
            .pop_front()
            .unwrap_or_else(|| Vec::with_capacity(nominal))
    }

    /// Returns a zero-initialised packet whose buffer holds at least
    /// `payload_size` payload bytes after the header for `property`.
    pub fn get(&mut self, property: PacketProperty, channel: u8, payload_size: usize) -> NetPacket {
        self.get_inner(property, channel, payload_size, false)
    }

    /// Like [`get`](Self::get), but with the Fragmented flag set and room for
    /// the fragment triple.
    pub fn get_fragment(
        &mut self,
        property: PacketProperty,
        channel: u8,
        payload_size: usize,
    ) -> NetPacket {
        self.get_inner(property, channel, payload_size, true)
    }

    fn get_inner(
        &mut self,
        property: PacketProperty,
        channel: u8,
        payload_size: usize,
        fragmented: bool,
    ) -> NetPacket {
        let total = header_size(property, fragmented) + payload_size;
        let buffer = self.take_buffer(total);
        let mut packet = NetPacket::reuse(buffer, property, fragmented, total);
        if property.is_channeled() {
            packet.set_channel(channel);
        }
        packet
    }

    /// Parses a raw datagram into a pooled packet. Fails when the header is
    /// malformed or names an unknown property.
    pub fn get_and_read(&mut self, bytes: &[u8]) -> Result<NetPacket, DecodingErrorKind> {
        NetPacket::verify(bytes)?;
        let buffer = self.take_buffer(bytes.len());
        Ok(NetPacket::reuse_from_bytes(buffer, bytes))
    }

    /// Convenience: allocates a packet and copies `bytes` into its payload.
    pub fn get_with_data(
        &mut self,
        property: PacketProperty,
        channel: u8,
        bytes: &[u8],
    ) -> NetPacket {
        let mut packet = self.get(property, channel, bytes.len());
        packet.payload_mut().copy_from_slice(bytes);
        packet
    }

    /// Returns a packet's buffer to its size class. No-op while the packet is
    /// pinned; oversize buffers and class overflow are dropped.
    pub fn recycle(&mut self, packet: NetPacket) {
        if packet.dont_recycle() {
            return;
        }
        if packet.capacity() > MAX_PACKET_SIZE {
            return;
        }
        let class = class_of(packet.size());
        if self.classes[class].len() < self.limit {
            self.classes[class].push_back(packet.into_buffer());
        } else {
            tracing::trace!(class, "packet pool class full, dropping buffer");
        }
    }

    /// Warm-starts the class serving `size` with `count` buffers.
    pub fn prepool(&mut self, count: usize, size: usize) {
        let class = class_of(size);
        while self.classes[class].len() < self.limit.min(count) {
            self.classes[class].push_back(Vec::with_capacity(CLASS_SIZES[class].max(size)));
        }
    }

    /// Buffers currently held across all classes.
    pub fn pooled_count(&self) -> usize {
        self.classes.iter().map(VecDeque::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_size_classes() {
        // Buckets 2 and 3 land in the 64-byte class, 4-7 in the 128-byte one.
        assert_eq!(class_of(16), 0);
        assert_eq!(class_of(17), 1);
        assert_eq!(class_of(33), 2);
        assert_eq!(class_of(64), 2);
        assert_eq!(class_of(65), 3);
        assert_eq!(class_of(128), 3);
        assert_eq!(class_of(129), 4);
    }

    #[test]
    fn get_recycle_get_reuses_buffer() {
        let mut pool = PacketPool::new(8);
        let packet = pool.get(PacketProperty::ReliableOrdered, 0, 40);
        let requested = packet.size();
        pool.recycle(packet);
        assert_eq!(pool.pooled_count(), 1);

        let again = pool.get(PacketProperty::ReliableOrdered, 0, 40);
        assert!(again.capacity() >= requested);
        assert_eq!(pool.pooled_count(), 0);
    }

    #[test]
    fn reused_buffer_is_zeroed() {
        let mut pool = PacketPool::new(8);
        let mut packet = pool.get(PacketProperty::Unreliable, 0, 8);
        packet.payload_mut().copy_from_slice(&[0xFF; 8]);
        pool.recycle(packet);

        let fresh = pool.get(PacketProperty::Unreliable, 0, 8);
        assert_eq!(fresh.payload(), &[0u8; 8]);
    }

    #[test]
    fn upsizes_in_place_when_request_exceeds_class() {
        // Both sizes land in the "others" class, so the 200-byte buffer is
        // reused and grown for the 500-byte request.
        let mut pool = PacketPool::new(8);
        let small = pool.get(PacketProperty::Unreliable, 0, 200);
        pool.recycle(small);

        let big = pool.get(PacketProperty::Unreliable, 0, 500);
        assert_eq!(big.data_size(), 500);
        assert!(big.capacity() >= big.size());
        assert_eq!(pool.pooled_count(), 0);
    }

    #[test]
    fn pinned_packet_is_not_recycled() {
        let mut pool = PacketPool::new(8);
        let mut packet = pool.get(PacketProperty::Unreliable, 0, 8);
        packet.set_dont_recycle(true);
        pool.recycle(packet);
        assert_eq!(pool.pooled_count(), 0);
    }

    #[test]
    fn oversize_buffers_are_never_pooled() {
        let mut pool = PacketPool::new(8);
        let packet = pool.get(PacketProperty::Unreliable, 0, MAX_PACKET_SIZE + 100);
        pool.recycle(packet);
        assert_eq!(pool.pooled_count(), 0);
    }

    #[test]
    fn class_overflow_drops_excess() {
        let mut pool = PacketPool::new(2);
        let a = pool.get(PacketProperty::Unreliable, 0, 8);
        let b = pool.get(PacketProperty::Unreliable, 0, 8);
        let c = pool.get(PacketProperty::Unreliable, 0, 8);
        pool.recycle(a);
        pool.recycle(b);
        pool.recycle(c);
        assert_eq!(pool.pooled_count(), 2);
    }

    #[test]
    fn get_and_read_rejects_malformed() {
        let mut pool = PacketPool::new(8);
        assert!(pool.get_and_read(&[0x1F]).is_err());
        assert!(pool.get_and_read(&[]).is_err());

        let ok = pool
            .get_and_read(NetPacket::with_property(PacketProperty::Ping, 8).as_bytes())
            .unwrap();
        assert_eq!(ok.property(), PacketProperty::Ping);
    }

    #[test]
    fn prepool_warm_starts_a_class() {
        let mut pool = PacketPool::new(16);
        pool.prepool(4, 60);
        assert_eq!(pool.pooled_count(), 4);
        let packet = pool.get(PacketProperty::Unreliable, 0, 50);
        assert!(packet.capacity() >= 52);
        assert_eq!(pool.pooled_count(), 3);
    }
}
