//! `gatehouse.toml` configuration.

use anyhow::{Context, Result};
use gatehouse_core::codec::Protocol;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::Path;

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub tcp: TcpConfig,
    #[serde(default)]
    pub udp: UdpConfig,
    #[serde(default)]
    pub multicast: MulticastConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub stats: StatsConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TcpConfig {
    #[serde(default = "TcpConfig::default_port")]
    pub port: u16,
    #[serde(default = "TcpConfig::default_backlog")]
    pub backlog: i32,
    #[serde(default)]
    pub quickack: bool,
    #[serde(default)]
    pub busy_poll_us: u32,
    #[serde(default = "TcpConfig::default_max_clients")]
    pub max_clients: usize,
    #[serde(default = "TcpConfig::default_bufsz")]
    pub bufsz: usize,
}

impl TcpConfig {
    fn default_port() -> u16 { 7001 }
    fn default_backlog() -> i32 { 128 }
    fn default_max_clients() -> usize { 1024 }
    fn default_bufsz() -> usize { 65540 }
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            port: Self::default_port(),
            backlog: Self::default_backlog(),
            quickack: false,
            busy_poll_us: 0,
            max_clients: Self::default_max_clients(),
            bufsz: Self::default_bufsz(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UdpConfig {
    #[serde(default = "UdpConfig::default_port")]
    pub port: u16,
    #[serde(default = "UdpConfig::default_max_clients")]
    pub max_clients: usize,
    #[serde(default = "UdpConfig::default_client_timeout_secs")]
    pub client_timeout_secs: i64,
}

impl UdpConfig {
    fn default_port() -> u16 { 7002 }
    fn default_max_clients() -> usize { 8192 }
    fn default_client_timeout_secs() -> i64 { 300 }
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            port: Self::default_port(),
            max_clients: Self::default_max_clients(),
            client_timeout_secs: Self::default_client_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MulticastConfig {
    #[serde(default = "MulticastConfig::default_enabled")]
    pub enabled: bool,
    #[serde(default = "MulticastConfig::default_group")]
    pub group: Ipv4Addr,
    #[serde(default = "MulticastConfig::default_port")]
    pub port: u16,
    #[serde(default = "MulticastConfig::default_ttl")]
    pub ttl: u32,
    #[serde(default)]
    pub loopback: bool,
    #[serde(default = "MulticastConfig::default_interface")]
    pub interface: Ipv4Addr,
}

impl MulticastConfig {
    fn default_enabled() -> bool { true }
    fn default_group() -> Ipv4Addr { Ipv4Addr::new(239, 1, 1, 1) }
    fn default_port() -> u16 { 7003 }
    fn default_ttl() -> u32 { 1 }
    fn default_interface() -> Ipv4Addr { Ipv4Addr::UNSPECIFIED }
}

impl Default for MulticastConfig {
    fn default() -> Self {
        Self {
            enabled: Self::default_enabled(),
            group: Self::default_group(),
            port: Self::default_port(),
            ttl: Self::default_ttl(),
            loopback: false,
            interface: Self::default_interface(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DispatchConfig {
    #[serde(default = "DispatchConfig::default_outbound_codec")]
    pub outbound_codec: String,
    #[serde(default = "DispatchConfig::default_input_queue_capacity")]
    pub input_queue_capacity: usize,
    #[serde(default = "DispatchConfig::default_output_queue_capacity")]
    pub output_queue_capacity: usize,
    #[serde(default = "DispatchConfig::default_processor_batch_size")]
    pub processor_batch_size: usize,
    #[serde(default = "DispatchConfig::default_output_batch_size")]
    pub output_batch_size: usize,
}

impl DispatchConfig {
    fn default_outbound_codec() -> String { "binary".into() }
    fn default_input_queue_capacity() -> usize { 65536 }
    fn default_output_queue_capacity() -> usize { 65536 }
    fn default_processor_batch_size() -> usize { 64 }
    fn default_output_batch_size() -> usize { 32 }

    /// `"binary"` | `"csv"` per spec §6; anything else is rejected at load time.
    pub fn outbound_protocol(&self) -> Result<Protocol> {
        match self.outbound_codec.as_str() {
            "binary" => Ok(Protocol::Binary),
            "csv" => Ok(Protocol::Csv),
            other => anyhow::bail!("dispatch.outbound_codec must be \"binary\" or \"csv\", got {other:?}"),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            outbound_codec: Self::default_outbound_codec(),
            input_queue_capacity: Self::default_input_queue_capacity(),
            output_queue_capacity: Self::default_output_queue_capacity(),
            processor_batch_size: Self::default_processor_batch_size(),
            output_batch_size: Self::default_output_batch_size(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StatsConfig {
    #[serde(default = "StatsConfig::default_snapshot_interval_secs")]
    pub snapshot_interval_secs: u64,
    #[serde(default = "StatsConfig::default_log_path")]
    pub log_path: String,
}

impl StatsConfig {
    fn default_snapshot_interval_secs() -> u64 { 5 }
    fn default_log_path() -> String { "/var/log/gatehouse.jsonl".into() }
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            snapshot_interval_secs: Self::default_snapshot_interval_secs(),
            log_path: Self::default_log_path(),
        }
    }
}

impl GatewayConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let cfg: Self = toml::from_str(&text)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        Ok(cfg)
    }

    /// Returns the config this module's own defaults already describe,
    /// serialized for `gatehouse init`.
    pub fn default_example() -> Self {
        Self::default()
    }
}

