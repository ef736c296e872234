#![warn(missing_docs)]

//! udplink-core: foundational types shared across all layers.
//!
//! This crate provides the minimal set of pieces the rest of the workspace
//! builds on:
//! - Configuration (`Config`)
//! - Error handling (`ErrorKind`, `Result`)
//! - Protocol constants
//! - The datagram transport abstraction (`Socket`)

/// Protocol constants shared across layers.
pub mod constants {
    /// Compile-time protocol identifier carried by every connect request.
    /// Peers with a different id are rejected without a response.
    pub const PROTOCOL_ID: u32 = 0x_75_64_6C_31; // "udl1"

    /// Candidate datagram sizes for MTU discovery, before subtracting the
    /// UDP/IP overhead. Index 1 (1492) is the fallback when probing is off.
    pub const MTU_CANDIDATES: [usize; 6] = [576, 1492, 1500, 4352, 4464, 7981];

    /// Worst-case UDP/IP header overhead subtracted from every candidate.
    pub const MTU_OVERHEAD: usize = 68;

    /// MTU index used when discovery is disabled (`mtu_start_idx < 0`).
    pub const MTU_FALLBACK_IDX: usize = 1;

    /// Largest packet the pool will ever hand out or take back.
    pub const MAX_PACKET_SIZE: usize = MTU_CANDIDATES[5] - MTU_OVERHEAD;

    /// Send/receive window of the reliable channels, in packets.
    pub const WINDOW_SIZE: usize = 64;

    /// Bytes in a reliable ACK bitmask (`WINDOW_SIZE / 8`).
    pub const ACK_BITMASK_BYTES: usize = WINDOW_SIZE / 8;

    /// Size of the fragment triple `(id, part, total)` on the wire.
    pub const FRAGMENT_HEADER_SIZE: usize = 6;

    /// Highest sub-stream channel number carried on user packets.
    pub const MAX_CHANNELS: u8 = 64;

    /// Number of delivery classes (used to tag ACK packets).
    pub const CHANNEL_TYPE_COUNT: u8 = 4;

    /// Per-connection share of the packet pool limit.
    pub const POOL_PACKETS_PER_CONNECTION: usize = 50;

    /// Retransmissions of an unanswered MTU probe before the ladder fixes.
    pub const MTU_MAX_PROBE_ATTEMPTS: u32 = 4;

    /// Delay between MTU probes.
    pub const MTU_PROBE_DELAY_MS: u64 = 1000;

    /// Samples in the RTT moving average.
    pub const RTT_AVG_WINDOW: u32 = 6;

    /// Floor for the reliable resend delay.
    pub const MIN_RESEND_DELAY_MS: u64 = 50;
}

/// Configuration options, frozen when the manager starts.
pub mod config;
/// Error types and results.
pub mod error;
/// Transport abstraction for pluggable datagram I/O.
pub mod transport;

pub use config::Config;
pub use error::{DecodingErrorKind, ErrorKind, Result};
pub use transport::Socket;
