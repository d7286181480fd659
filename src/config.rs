use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

/// Network layout, packet sizing and timing for coordinator, workers and requester.
///
/// Every field has a default, so a JSON config file only needs the keys it
/// wants to override.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetConfig {
    pub host: IpAddr,
    pub coordinator_port: u16,
    pub worker_base_port: u16,
    /// Most workers a single solve may ask for
    pub max_workers: usize,

    /// Hard ceiling for one serialized datagram
    pub max_packet_size: usize,
    /// Slice length used when splitting a serialized block result
    pub max_chunk_size: usize,
    /// Bytes reserved for envelope fields when sizing payloads
    pub protocol_overhead: usize,
    pub recv_buffer_size: usize,

    pub min_block_size: usize,
    pub max_block_size: usize,
    /// Forces a block edge length instead of deriving one
    pub block_size: Option<usize>,

    pub heartbeat_interval_ms: u64,
    pub health_check_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub ack_timeout_ms: u64,
    pub unacked_check_interval_ms: u64,
    pub retry_base_delay_ms: u64,
    pub max_retries: u32,
    pub max_block_retries: u32,
    pub task_distribution_delay_ms: u64,
    pub chunk_transmission_delay_ms: u64,
    pub worker_settle_delay_ms: u64,
    pub recv_poll_interval_ms: u64,
    pub balancer_idle_window_ms: u64,
    pub solve_timeout_ms: u64,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            coordinator_port: 11000,
            worker_base_port: 11001,
            max_workers: 64,
            max_packet_size: 60_000,
            max_chunk_size: 58_000,
            protocol_overhead: 1_000,
            recv_buffer_size: 65_536,
            min_block_size: 25,
            max_block_size: 100,
            block_size: None,
            heartbeat_interval_ms: 2_000,
            health_check_interval_ms: 5_000,
            heartbeat_timeout_ms: 5_000,
            ack_timeout_ms: 3_000,
            unacked_check_interval_ms: 1_000,
            retry_base_delay_ms: 100,
            max_retries: 3,
            max_block_retries: 2,
            task_distribution_delay_ms: 100,
            chunk_transmission_delay_ms: 50,
            worker_settle_delay_ms: 200,
            recv_poll_interval_ms: 250,
            balancer_idle_window_ms: 5 * 60 * 1_000,
            solve_timeout_ms: 500_000,
        }
    }
}

impl NetConfig {
    /// Load a config file, falling back to defaults for missing keys
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .context(format!("Failed to read config file: {}", path.display()))?;
        let config = serde_json::from_str(&text)
            .context(format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Load `path` if given, otherwise use defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }

    pub fn coordinator_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.coordinator_port)
    }

    /// Callers keep `worker_id` below `worker_limit()`
    pub fn worker_addr(&self, worker_id: usize) -> SocketAddr {
        let port = usize::from(self.worker_base_port).saturating_add(worker_id);
        SocketAddr::new(self.host, u16::try_from(port).unwrap_or(u16::MAX))
    }

    /// Largest worker count a solve may request: `max_workers`, further
    /// capped so every worker port stays inside the port range
    pub fn worker_limit(&self) -> usize {
        let ports = usize::from(u16::MAX) - usize::from(self.worker_base_port) + 1;
        self.max_workers.min(ports)
    }

    /// Upper bound on the chunks of one block result. A task fits one packet
    /// and its result adds a single column, so two packets' worth is ample.
    pub fn max_result_chunks(&self) -> usize {
        (2 * self.max_packet_size).div_ceil(self.max_chunk_size.max(1))
    }

    /// Recover a worker id from the source address of a datagram
    pub fn worker_id_for(&self, addr: SocketAddr) -> Option<usize> {
        addr.port()
            .checked_sub(self.worker_base_port)
            .map(|offset| offset as usize)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn unacked_check_interval(&self) -> Duration {
        Duration::from_millis(self.unacked_check_interval_ms)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn task_distribution_delay(&self) -> Duration {
        Duration::from_millis(self.task_distribution_delay_ms)
    }

    pub fn chunk_transmission_delay(&self) -> Duration {
        Duration::from_millis(self.chunk_transmission_delay_ms)
    }

    pub fn worker_settle_delay(&self) -> Duration {
        Duration::from_millis(self.worker_settle_delay_ms)
    }

    pub fn recv_poll_interval(&self) -> Duration {
        Duration::from_millis(self.recv_poll_interval_ms)
    }

    pub fn balancer_idle_window(&self) -> Duration {
        Duration::from_millis(self.balancer_idle_window_ms)
    }

    pub fn solve_timeout(&self) -> Duration {
        Duration::from_millis(self.solve_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config: NetConfig =
            serde_json::from_str(r#"{ "coordinator_port": 12000, "max_block_retries": 5 }"#).unwrap();

        assert_eq!(config.coordinator_port, 12000);
        assert_eq!(config.max_block_retries, 5);
        assert_eq!(config.worker_base_port, 11001);
        assert_eq!(config.max_packet_size, 60_000);
        assert!(config.block_size.is_none());
    }

    #[test]
    fn test_worker_addressing() {
        let config = NetConfig::default();
        let addr = config.worker_addr(3);

        assert_eq!(addr.port(), 11004);
        assert_eq!(config.worker_id_for(addr), Some(3));
        assert_eq!(config.worker_id_for(config.coordinator_addr()), None);
    }

    #[test]
    fn test_worker_limit_fits_port_range() {
        let config = NetConfig::default();
        assert_eq!(config.worker_limit(), 64);

        let config = NetConfig {
            worker_base_port: u16::MAX - 2,
            ..NetConfig::default()
        };
        assert_eq!(config.worker_limit(), 3);
        assert_eq!(config.worker_addr(2).port(), u16::MAX);
    }

    #[test]
    fn test_result_chunk_bound() {
        let config = NetConfig::default();
        assert_eq!(config.max_result_chunks(), 3);
    }
}
