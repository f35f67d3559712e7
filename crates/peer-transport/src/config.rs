use std::time::Duration;

/// Timeouts and limits governing a transport base (component C3).
///
/// Defaults match the configuration keys documented in SPEC_FULL.md §6.
#[derive(Debug, Clone, Copy)]
pub struct TransportConfig {
    /// `peer.idle_timeout_ms` — how long a peer survives with no carrier attached.
    pub idle_timeout: Duration,
    /// `peer.heartbeat_ms` — `T_heartbeat`: synthesize a keep-alive if nothing arrived.
    pub heartbeat_interval: Duration,
    /// `T_dead`: close the peer non-gracefully if nothing arrived in this long.
    pub dead_timeout: Duration,
    /// How often the background expiry sweep runs.
    pub expiry_sweep_interval: Duration,
    /// Outbound backlog high-water mark before `send` reports `BackpressureFull`.
    pub backlog_high_water: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_millis(15_000),
            heartbeat_interval: Duration::from_millis(5_000),
            dead_timeout: Duration::from_millis(30_000),
            expiry_sweep_interval: Duration::from_millis(1_000),
            backlog_high_water: 256,
        }
    }
}
