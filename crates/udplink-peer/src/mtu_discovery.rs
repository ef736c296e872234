//! Candidate-ladder MTU probing.
//!
//! The peer walks the candidate list one step at a time: it sends an
//! `MtuCheck` padded to the next candidate's size and raises its negotiated
//! MTU when the matching `MtuOk` comes back. A candidate that stays
//! unacknowledged after a bounded number of probes fixes the ladder at the
//! highest confirmed step. A negative start index disables probing and pins
//! the fallback candidate.

use std::time::{Duration, Instant};

use udplink_core::constants::{
    MTU_CANDIDATES, MTU_FALLBACK_IDX, MTU_MAX_PROBE_ATTEMPTS, MTU_OVERHEAD, MTU_PROBE_DELAY_MS,
};
use udplink_protocol::{packet::PacketProperty, NetPacket, PacketPool};

/// Per-peer MTU discovery state.
#[derive(Debug)]
pub struct MtuDiscovery {
    idx: usize,
    fixed: bool,
    attempts: u32,
    last_probe: Option<Instant>,
}

impl MtuDiscovery {
    /// Creates the ladder from the configured start index.
    pub fn new(mtu_start_idx: i32) -> Self {
        if mtu_start_idx < 0 {
            Self { idx: MTU_FALLBACK_IDX, fixed: true, attempts: 0, last_probe: None }
        } else {
            let idx = (mtu_start_idx as usize).min(MTU_CANDIDATES.len() - 1);
            Self { idx, fixed: idx == MTU_CANDIDATES.len() - 1, attempts: 0, last_probe: None }
        }
    }

    /// The currently negotiated MTU in datagram payload bytes.
    pub fn mtu(&self) -> usize {
        MTU_CANDIDATES[self.idx] - MTU_OVERHEAD
    }

    /// True once probing has stopped.
    pub fn is_fixed(&self) -> bool {
        self.fixed
    }

    /// Emits the next probe when one is due. The probe is an `MtuCheck`
    /// padded to the next candidate's full size, with the candidate index in
    /// its first payload byte.
    pub fn update(&mut self, pool: &mut PacketPool, now: Instant) -> Option<NetPacket> {
        if self.fixed {
            return None;
        }
        let next = self.idx + 1;
        if next >= MTU_CANDIDATES.len() {
            self.fixed = true;
            return None;
        }
        let due = self
            .last_probe
            .map_or(true, |at| now.duration_since(at) >= Duration::from_millis(MTU_PROBE_DELAY_MS));
        if !due {
            return None;
        }
        if self.attempts >= MTU_MAX_PROBE_ATTEMPTS {
            // The path does not carry the next candidate; settle here.
            self.fixed = true;
            tracing::debug!(mtu = self.mtu(), "mtu ladder fixed");
            return None;
        }
        self.attempts += 1;
        self.last_probe = Some(now);

        let target = MTU_CANDIDATES[next] - MTU_OVERHEAD;
        let mut probe = pool.get(PacketProperty::MtuCheck, 0, target - 1);
        probe.payload_mut()[0] = next as u8;
        Some(probe)
    }

    /// Applies a received `MtuOk` echo.
    pub fn on_ok(&mut self, confirmed_idx: u8) {
        let confirmed = confirmed_idx as usize;
        if confirmed >= MTU_CANDIDATES.len() || self.fixed {
            return;
        }
        if confirmed > self.idx {
            self.idx = confirmed;
            self.attempts = 0;
            if self.idx == MTU_CANDIDATES.len() - 1 {
                self.fixed = true;
            }
            tracing::debug!(mtu = self.mtu(), "mtu raised");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROBE_DELAY: Duration = Duration::from_millis(MTU_PROBE_DELAY_MS);

    #[test]
    fn disabled_ladder_pins_the_fallback() {
        let mtu = MtuDiscovery::new(-1);
        assert!(mtu.is_fixed());
        assert_eq!(mtu.mtu(), MTU_CANDIDATES[MTU_FALLBACK_IDX] - MTU_OVERHEAD);
    }

    #[test]
    fn probes_are_padded_to_the_next_candidate() {
        let mut pool = PacketPool::new(8);
        let mut mtu = MtuDiscovery::new(0);
        let now = Instant::now();

        let probe = mtu.update(&mut pool, now).unwrap();
        assert_eq!(probe.property(), PacketProperty::MtuCheck);
        assert_eq!(probe.size(), MTU_CANDIDATES[1] - MTU_OVERHEAD);
        assert_eq!(probe.payload()[0], 1);

        // Not due again until the probe delay elapses.
        assert!(mtu.update(&mut pool, now).is_none());
        assert!(mtu.update(&mut pool, now + PROBE_DELAY).is_some());
    }

    #[test]
    fn ok_raises_the_ladder_and_resets_attempts() {
        let mut pool = PacketPool::new(8);
        let mut mtu = MtuDiscovery::new(0);
        let mut now = Instant::now();

        mtu.update(&mut pool, now).unwrap();
        mtu.on_ok(1);
        assert_eq!(mtu.mtu(), MTU_CANDIDATES[1] - MTU_OVERHEAD);
        assert!(!mtu.is_fixed());

        now += PROBE_DELAY;
        let probe = mtu.update(&mut pool, now).unwrap();
        assert_eq!(probe.payload()[0], 2);
    }

    #[test]
    fn unanswered_probes_fix_the_highest_confirmed_candidate() {
        let mut pool = PacketPool::new(8);
        let mut mtu = MtuDiscovery::new(1);
        let mut now = Instant::now();

        for _ in 0..MTU_MAX_PROBE_ATTEMPTS {
            assert!(mtu.update(&mut pool, now).is_some());
            now += PROBE_DELAY;
        }
        assert!(mtu.update(&mut pool, now).is_none());
        assert!(mtu.is_fixed());
        assert_eq!(mtu.mtu(), MTU_CANDIDATES[1] - MTU_OVERHEAD);
    }

    #[test]
    fn top_of_ladder_fixes_immediately() {
        let mut mtu = MtuDiscovery::new(5);
        assert!(mtu.is_fixed());
        let mut pool = PacketPool::new(8);
        assert!(mtu.update(&mut pool, Instant::now()).is_none());
    }

    #[test]
    fn stale_ok_is_ignored() {
        let mut mtu = MtuDiscovery::new(3);
        mtu.on_ok(2);
        assert_eq!(mtu.mtu(), MTU_CANDIDATES[3] - MTU_OVERHEAD);
        mtu.on_ok(9);
        assert_eq!(mtu.mtu(), MTU_CANDIDATES[3] - MTU_OVERHEAD);
    }
}
