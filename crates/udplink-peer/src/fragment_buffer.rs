//! Write-side fragmenter and read-side reassembly table.
//!
//! Outbound, a [`FragmentBuffer`] accumulates a logical message across packet
//! parts, each holding at most `mtu - fragment header` payload bytes, and
//! stamps the fragment triple when finished. Inbound, a [`ReassemblyTable`]
//! groups fragments by `(channel, fragment_id)` until a group completes or
//! goes stale.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use udplink_protocol::{
    packet::{header_size, NetPacket, PacketProperty},
    PacketPool,
};

/// Write-side fragmenter: an ordered run of packets forming one message.
#[derive(Debug)]
pub struct FragmentBuffer {
    parts: Vec<NetPacket>,
    property: PacketProperty,
    channel: u8,
    /// Payload capacity of one part: `mtu - header_size(property, fragmented)`.
    part_capacity: usize,
    total_size: usize,
    write_cursor: usize,
}

impl FragmentBuffer {
    /// Creates a fragmenter writing `property` packets sized to `mtu`.
    pub fn new(property: PacketProperty, channel: u8, mtu: usize) -> Self {
        let part_capacity = mtu - header_size(property, true);
        Self {
            parts: Vec::new(),
            property,
            channel,
            part_capacity,
            total_size: 0,
            write_cursor: 0,
        }
    }

    /// Bytes written so far.
    pub fn total_size(&self) -> usize {
        self.total_size
    }

    /// Appends `bytes`, filling the tail part before allocating a new one.
    pub fn write(&mut self, pool: &mut PacketPool, mut bytes: &[u8]) {
        while !bytes.is_empty() {
            if self.write_cursor == 0 {
                self.parts
                    .push(pool.get_fragment(self.property, self.channel, self.part_capacity));
            }
            let tail = self.parts.last_mut().expect("tail exists after push");
            let room = self.part_capacity - self.write_cursor;
            let take = room.min(bytes.len());
            tail.payload_mut()[self.write_cursor..self.write_cursor + take]
                .copy_from_slice(&bytes[..take]);
            self.write_cursor = (self.write_cursor + take) % self.part_capacity;
            self.total_size += take;
            bytes = &bytes[take..];
        }
    }

    /// Trims the tail to the written length, stamps the fragment triple on
    /// every part and returns them in order.
    pub fn finish(mut self, fragment_id: u16) -> Vec<NetPacket> {
        if self.write_cursor != 0 {
            if let Some(tail) = self.parts.last_mut() {
                tail.shrink_payload(self.write_cursor);
            }
        }
        let total = self.parts.len() as u16;
        for (part, packet) in self.parts.iter_mut().enumerate() {
            packet.set_fragment_info(fragment_id, part as u16, total);
        }
        self.parts
    }
}

#[derive(Debug)]
struct FragmentAssembly {
    parts: Vec<Option<Vec<u8>>>,
    received: usize,
    last_update: Instant,
}

/// Read-side reassembler: fragments grouped by `(channel, fragment_id)`.
#[derive(Debug, Default)]
pub struct ReassemblyTable {
    entries: HashMap<(u8, u16), FragmentAssembly>,
}

impl ReassemblyTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one fragment in. Returns the reassembled payload when the group
    /// completes; duplicates and inconsistent totals are dropped.
    pub fn insert(&mut self, packet: &NetPacket, now: Instant) -> Option<Vec<u8>> {
        let key = (packet.channel(), packet.fragment_id());
        let total = packet.fragments_total() as usize;
        let part = packet.fragment_part() as usize;

        let entry = self.entries.entry(key).or_insert_with(|| FragmentAssembly {
            parts: (0..total).map(|_| None).collect(),
            received: 0,
            last_update: now,
        });
        if entry.parts.len() != total || entry.parts[part].is_some() {
            tracing::debug!(
                channel = key.0,
                fragment_id = key.1,
                part,
                "dropping duplicate or inconsistent fragment"
            );
            return None;
        }
        entry.parts[part] = Some(packet.payload().to_vec());
        entry.received += 1;
        entry.last_update = now;

        if entry.received < total {
            return None;
        }
        let entry = self.entries.remove(&key).expect("entry present");
        let mut payload = Vec::with_capacity(entry.parts.iter().flatten().map(Vec::len).sum());
        for part in entry.parts {
            payload.extend_from_slice(&part.expect("complete group"));
        }
        Some(payload)
    }

    /// Discards groups that saw no new part for `timeout`.
    pub fn purge_stale(&mut self, now: Instant, timeout: Duration) {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| now.duration_since(entry.last_update) <= timeout);
        let purged = before - self.entries.len();
        if purged > 0 {
            tracing::warn!(purged, "discarded stale fragment groups");
        }
    }

    /// Incomplete groups currently tracked.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no group is being reassembled.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
