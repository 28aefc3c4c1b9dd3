//! Swarm configuration
//!
//! This module contains every tunable of the protocol: the multicast group,
//! heartbeat and tick periods, idle thresholds, the unit (piece) size and the
//! batch caps used by the transfer jobs.

use crate::error::{Result, SwarmError};
use crate::message::MAX_HEADER_LEN;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

/// Largest payload a single UDP datagram over IPv4 can carry.
pub const MAX_UDP_PAYLOAD: usize = 65_507;

/// Main configuration for the swarm engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SwarmConfig {
    /// Multicast group used for heartbeats, catalog and ownership broadcast
    pub multicast_group: Ipv4Addr,

    /// Multicast port; also the default unicast destination port of peers
    pub port: u16,

    /// Address identifying this peer (None = detect from the routing table)
    pub local_addr: Option<Ipv4Addr>,

    /// Socket receive timeout in milliseconds
    pub recv_timeout_ms: u64,

    /// HELLO broadcast / liveness accounting period in milliseconds
    pub heartbeat_interval_ms: u64,

    /// Missed heartbeat periods after which a peer is declared dead
    pub dead_after_missed: u32,

    /// Reaper tick period in milliseconds
    pub tick_interval_ms: u64,

    /// Idle ticks before a transfer job re-requests; twice this abandons it
    pub max_idle_periods: u32,

    /// Size of one piece / chunk in bytes
    pub unit_size: usize,

    /// Maximum piece requests per download batch and responses per upload tick
    pub max_in_flight: usize,

    /// Maximum queued piece requests per requesting peer
    pub max_upload_queue: usize,

    /// Largest unit count accepted for a catalog listing or descriptor
    pub max_resource_units: u32,

    /// How many times an owner probe asks about every piece
    pub probe_rounds: u32,

    /// Delay between two WHO_HAS messages of a probe, in milliseconds
    pub probe_message_delay_ms: u64,

    /// Delay between two probe rounds, in milliseconds
    pub probe_round_delay_ms: u64,

    /// Directory holding local torrent descriptors
    pub torrents_dir: PathBuf,

    /// Default destination for fetched torrents
    pub download_dir: PathBuf,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            multicast_group: Ipv4Addr::new(224, 0, 0, 1),
            port: 6789,
            local_addr: None,
            recv_timeout_ms: 500,
            heartbeat_interval_ms: 3000,
            dead_after_missed: 3,
            tick_interval_ms: 100,
            max_idle_periods: 3,
            unit_size: 60 * 1024,
            max_in_flight: 1000,
            max_upload_queue: 4096,
            max_resource_units: 4096,
            probe_rounds: 2,
            probe_message_delay_ms: 1,
            probe_round_delay_ms: 1000,
            torrents_dir: PathBuf::from("torrents"),
            download_dir: PathBuf::from("output_files"),
        }
    }
}

impl SwarmConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the multicast group and port
    pub fn multicast(mut self, group: Ipv4Addr, port: u16) -> Self {
        self.multicast_group = group;
        self.port = port;
        self
    }

    /// Pin the address this peer identifies itself with
    pub fn local_addr(mut self, addr: Ipv4Addr) -> Self {
        self.local_addr = Some(addr);
        self
    }

    /// Set the unit (piece) size
    pub fn unit_size(mut self, size: usize) -> Self {
        self.unit_size = size;
        self
    }

    /// Set the heartbeat period
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the reaper tick period
    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the idle threshold of transfer jobs
    pub fn max_idle_periods(mut self, periods: u32) -> Self {
        self.max_idle_periods = periods;
        self
    }

    /// Set the in-flight batch cap
    pub fn max_in_flight(mut self, max: usize) -> Self {
        self.max_in_flight = max;
        self
    }

    /// Set the unit cap for listings and descriptors
    pub fn max_resource_units(mut self, units: u32) -> Self {
        self.max_resource_units = units;
        self
    }

    /// Set the descriptor directory
    pub fn torrents_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.torrents_dir = path.into();
        self
    }

    /// Set the default download destination
    pub fn download_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.download_dir = path.into();
        self
    }

    /// Load a configuration from JSON text; omitted fields keep their defaults
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn recv_timeout(&self) -> Duration {
        Duration::from_millis(self.recv_timeout_ms)
    }

    pub fn heartbeat_interval_duration(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn tick_interval_duration(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn probe_message_delay(&self) -> Duration {
        Duration::from_millis(self.probe_message_delay_ms)
    }

    pub fn probe_round_delay(&self) -> Duration {
        Duration::from_millis(self.probe_round_delay_ms)
    }

    /// Largest datagram any peer may send with this configuration
    pub fn max_datagram_len(&self) -> usize {
        MAX_HEADER_LEN + self.unit_size
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if !self.multicast_group.is_multicast() {
            return Err(SwarmError::invalid_input(
                "multicast_group",
                format!("{} is not a multicast address", self.multicast_group),
            ));
        }

        if self.port == 0 {
            return Err(SwarmError::invalid_input("port", "Must be non-zero"));
        }

        if self.unit_size == 0 {
            return Err(SwarmError::invalid_input("unit_size", "Must be at least 1"));
        }

        if self.max_datagram_len() > MAX_UDP_PAYLOAD {
            return Err(SwarmError::invalid_input(
                "unit_size",
                format!(
                    "Datagrams of {} bytes exceed the UDP limit of {}",
                    self.max_datagram_len(),
                    MAX_UDP_PAYLOAD
                ),
            ));
        }

        for (field, value) in [
            ("recv_timeout_ms", self.recv_timeout_ms),
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("tick_interval_ms", self.tick_interval_ms),
        ] {
            if value == 0 {
                return Err(SwarmError::invalid_input(field, "Must be at least 1"));
            }
        }

        if self.dead_after_missed == 0 {
            return Err(SwarmError::invalid_input("dead_after_missed", "Must be at least 1"));
        }

        if self.max_idle_periods == 0 {
            return Err(SwarmError::invalid_input("max_idle_periods", "Must be at least 1"));
        }

        if self.max_in_flight == 0 {
            return Err(SwarmError::invalid_input("max_in_flight", "Must be at least 1"));
        }

        if self.max_upload_queue == 0 {
            return Err(SwarmError::invalid_input("max_upload_queue", "Must be at least 1"));
        }

        if self.max_resource_units == 0 {
            return Err(SwarmError::invalid_input("max_resource_units", "Must be at least 1"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SwarmConfig::default();
        assert_eq!(config.port, 6789);
        assert_eq!(config.unit_size, 61440);
        assert_eq!(config.max_idle_periods, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = SwarmConfig::new()
            .multicast(Ipv4Addr::new(239, 1, 2, 3), 7000)
            .unit_size(1024)
            .tick_interval(Duration::from_millis(20))
            .max_in_flight(8);

        assert_eq!(config.multicast_group, Ipv4Addr::new(239, 1, 2, 3));
        assert_eq!(config.port, 7000);
        assert_eq!(config.unit_size, 1024);
        assert_eq!(config.tick_interval_ms, 20);
        assert_eq!(config.max_in_flight, 8);
    }

    #[test]
    fn test_rejects_unicast_group() {
        let config = SwarmConfig::new().multicast(Ipv4Addr::new(192, 168, 1, 1), 6789);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_oversized_unit() {
        let config = SwarmConfig::new().unit_size(MAX_UDP_PAYLOAD);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("unit_size"));
    }

    #[test]
    fn test_rejects_zero_idle_periods() {
        let config = SwarmConfig::new().max_idle_periods(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_resource_cap() {
        let err = SwarmConfig::new().max_resource_units(0).validate().unwrap_err();
        assert!(err.to_string().contains("max_resource_units"));
    }

    #[test]
    fn test_from_json() {
        let json = serde_json::to_string(&SwarmConfig::new().unit_size(4096)).unwrap();
        let config = SwarmConfig::from_json(&json).unwrap();
        assert_eq!(config.unit_size, 4096);
        assert!(config.local_addr.is_none());
    }

    #[test]
    fn test_from_partial_json() {
        let config = SwarmConfig::from_json(r#"{"port": 7000, "unit_size": 1024}"#).unwrap();
        assert_eq!(config.port, 7000);
        assert_eq!(config.unit_size, 1024);
        assert_eq!(config.heartbeat_interval_ms, SwarmConfig::default().heartbeat_interval_ms);
    }
}
