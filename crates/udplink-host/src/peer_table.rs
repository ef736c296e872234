//! Bounded, address-keyed peer storage.

use std::{collections::HashMap, net::SocketAddr};

use udplink_peer::Peer;

/// Address-keyed map of peers with a fixed capacity.
#[derive(Debug)]
pub struct PeerTable {
    peers: HashMap<SocketAddr, Peer>,
    capacity: usize,
}

impl PeerTable {
    /// Creates a table holding at most `capacity` peers.
    pub fn new(capacity: usize) -> Self {
        Self { peers: HashMap::with_capacity(capacity), capacity }
    }

    /// True when no further peer fits.
    pub fn is_full(&self) -> bool {
        self.peers.len() >= self.capacity
    }

    /// Inserts a peer; fails when the table is at capacity.
    pub fn insert(&mut self, addr: SocketAddr, peer: Peer) -> bool {
        if self.is_full() && !self.peers.contains_key(&addr) {
            return false;
        }
        self.peers.insert(addr, peer);
        true
    }

    /// Looks a peer up by address.
    pub fn get(&self, addr: &SocketAddr) -> Option<&Peer> {
        self.peers.get(addr)
    }

    /// Looks a peer up mutably by address.
    pub fn get_mut(&mut self, addr: &SocketAddr) -> Option<&mut Peer> {
        self.peers.get_mut(addr)
    }

    /// Removes and returns the peer at `addr`.
    pub fn remove(&mut self, addr: &SocketAddr) -> Option<Peer> {
        self.peers.remove(addr)
    }

    /// All stored peers, any state.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// True when the table holds no peers.
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Peers that completed their handshake.
    pub fn connected_count(&self) -> usize {
        self.peers.values().filter(|peer| peer.is_connected()).count()
    }

    /// Addresses of all stored peers.
    pub fn addresses(&self) -> Vec<SocketAddr> {
        self.peers.keys().copied().collect()
    }

    /// Iterates over all peers mutably.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&SocketAddr, &mut Peer)> {
        self.peers.iter_mut()
    }

    /// Iterates over all peers.
    pub fn iter(&self) -> impl Iterator<Item = (&SocketAddr, &Peer)> {
        self.peers.iter()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use udplink_core::Config;

    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    #[test]
    fn capacity_is_enforced() {
        let config = Config::default();
        let now = Instant::now();
        let mut table = PeerTable::new(2);

        assert!(table.insert(addr(1), Peer::accept(addr(1), 1, &config, now)));
        assert!(table.insert(addr(2), Peer::accept(addr(2), 2, &config, now)));
        assert!(!table.insert(addr(3), Peer::accept(addr(3), 3, &config, now)));
        assert_eq!(table.len(), 2);

        // Replacing an existing address is always allowed.
        assert!(table.insert(addr(2), Peer::accept(addr(2), 9, &config, now)));
    }

    #[test]
    fn connected_count_ignores_handshaking_peers() {
        let config = Config::default();
        let now = Instant::now();
        let mut table = PeerTable::new(4);
        table.insert(addr(1), Peer::accept(addr(1), 1, &config, now));
        table.insert(addr(2), Peer::connect_to(addr(2), Vec::new(), &config, now));

        assert_eq!(table.len(), 2);
        assert_eq!(table.connected_count(), 1);
    }
}
