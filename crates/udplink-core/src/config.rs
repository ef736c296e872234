use std::time::Duration;

/// Configuration options for a manager and the peers it creates.
///
/// The whole struct is frozen when the manager binds its socket; only the
/// simulation knobs may be changed on a live manager.
#[derive(Clone, Debug)]
pub struct Config {
    /// Budget of one `run` tick.
    pub update_time: Duration,
    /// Interval between keepalive pings on an established connection.
    pub ping_interval: Duration,
    /// Max idle time before a peer is considered disconnected.
    pub disconnect_timeout: Duration,
    /// Delay between connect-request (and disconnect) retransmissions.
    pub reconnect_delay: Duration,
    /// Connect-request retransmissions before giving up.
    pub max_connect_attempts: u32,
    /// Hard cap on simultaneously connected peers.
    pub max_connections: usize,

    /// Coalesce small outbound packets into one datagram.
    pub merge_enabled: bool,
    /// Answer and emit discovery broadcasts.
    pub discovery_enabled: bool,
    /// Surface raw datagrams from unconnected endpoints.
    pub unconnected_messages_enabled: bool,
    /// Accept NAT introduction traffic (handled by an external module).
    pub nat_punch_enabled: bool,

    /// Enable the reliable-ordered delivery channel.
    pub enable_reliable_ordered: bool,
    /// Enable the reliable-unordered delivery channel.
    pub enable_reliable_unordered: bool,
    /// Enable the sequenced delivery channel.
    pub enable_sequenced: bool,
    /// Enable the plain unreliable delivery channel.
    pub enable_simple: bool,

    /// Bind an IPv4 socket.
    pub enable_ipv4: bool,
    /// Bind a dual-stack IPv6 socket.
    pub enable_ipv6: bool,
    /// Set `SO_REUSEADDR` before binding.
    pub reuse_address: bool,

    /// Starting index into the MTU candidate ladder; negative disables
    /// probing and pins the fallback candidate.
    pub mtu_start_idx: i32,

    /// If non-empty, connection requests are auto-accepted on a key match
    /// and auto-rejected otherwise; no `ConnectionRequest` event is raised.
    pub passcode_key: String,

    /// Drop a percentage of received datagrams (debug only).
    pub simulate_packet_loss: bool,
    /// Loss chance in percent when simulation is on.
    pub simulation_packet_loss_chance: u8,
    /// Delay received datagrams by a random interval (debug only).
    pub simulate_latency: bool,
    /// Lower bound of the simulated latency.
    pub simulation_min_latency: Duration,
    /// Upper bound of the simulated latency.
    pub simulation_max_latency: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            update_time: Duration::from_millis(100),
            ping_interval: Duration::from_millis(1000),
            disconnect_timeout: Duration::from_millis(5000),
            reconnect_delay: Duration::from_millis(500),
            max_connect_attempts: 10,
            max_connections: 16,
            merge_enabled: true,
            discovery_enabled: false,
            unconnected_messages_enabled: false,
            nat_punch_enabled: false,
            enable_reliable_ordered: true,
            enable_reliable_unordered: false,
            enable_sequenced: true,
            enable_simple: false,
            enable_ipv4: true,
            enable_ipv6: false,
            reuse_address: false,
            mtu_start_idx: -1,
            passcode_key: String::new(),
            simulate_packet_loss: false,
            simulation_packet_loss_chance: 10,
            simulate_latency: false,
            simulation_min_latency: Duration::from_millis(30),
            simulation_max_latency: Duration::from_millis(100),
        }
    }
}

impl Config {
    /// Upper bound on pooled packets for a manager with this configuration.
    pub fn pool_limit(&self) -> usize {
        self.max_connections * crate::constants::POOL_PACKETS_PER_CONNECTION
    }
}
