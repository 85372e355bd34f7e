use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::dcnet::cell::{MIN_CELL_SIZE, SIGMA_SIZE};
use crate::error::ProtocolError;
use crate::net::framing::{HEADER_OVERHEAD, MAX_DATAGRAM_SIZE};

/// Which DC-net codec a run uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DcNetType {
    #[default]
    Plain,
    Equivocation,
}

impl fmt::Display for DcNetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DcNetType::Plain => f.write_str("plain"),
            DcNetType::Equivocation => f.write_str("equivocation"),
        }
    }
}

impl FromStr for DcNetType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plain" => Ok(DcNetType::Plain),
            "equivocation" => Ok(DcNetType::Equivocation),
            other => Err(ProtocolError::ConfigInvalid(format!(
                "unknown DCNetType {:?}",
                other
            ))),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML deserialization error: {0}")]
    TomlDe(#[from] toml::de::Error),
    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),
    #[error("{0}")]
    Invalid(String),
}

impl From<ConfigError> for ProtocolError {
    fn from(e: ConfigError) -> Self {
        ProtocolError::ConfigInvalid(e.to_string())
    }
}

/// Protocol configuration shared by all roles.
///
/// Keys keep the PascalCase names of the deployment files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PrifiConfig {
    #[serde(default = "default_cell_size_up")]
    pub cell_size_up: usize,
    #[serde(default = "default_cell_size_down")]
    pub cell_size_down: usize,
    #[serde(default = "default_window_size")]
    pub relay_window_size: u32,
    #[serde(default)]
    pub relay_use_dummy_data_down: bool,
    #[serde(default)]
    pub relay_reporting_limit: u32,
    #[serde(default, rename = "UseUDP")]
    pub use_udp: bool,
    #[serde(default = "default_udp_port", rename = "UdpPort")]
    pub udp_port: u16,
    #[serde(default = "default_udp_broadcast_address")]
    pub udp_broadcast_address: String,
    #[serde(default)]
    pub do_latency_tests: bool,
    #[serde(default = "default_socks_server_port")]
    pub socks_server_port: u16,
    #[serde(default = "default_socks_client_port")]
    pub socks_client_port: u16,
    #[serde(default, rename = "DCNetType")]
    pub dcnet_type: DcNetType,
    /// Milliseconds
    #[serde(default = "default_round_timeout", rename = "RelayRoundTimeOut")]
    pub relay_round_timeout: u64,
    /// Milliseconds
    #[serde(default)]
    pub relay_processing_loop_sleep_time: u64,
    #[serde(default = "default_max_failed_rounds")]
    pub relay_max_number_of_consecutive_failed_rounds: u32,
    /// Milliseconds
    #[serde(default = "default_reconnect_interval")]
    pub client_reconnect_interval: u64,
    /// Milliseconds the relay waits after reaching quorum before setup,
    /// so participants connecting together join the same run
    #[serde(default = "default_setup_settle_time")]
    pub relay_setup_settle_time: u64,
    #[serde(default)]
    pub log_dir: Option<String>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_cell_size_up() -> usize {
    1000
}

fn default_cell_size_down() -> usize {
    10000
}

fn default_window_size() -> u32 {
    1
}

fn default_udp_port() -> u16 {
    10101
}

fn default_udp_broadcast_address() -> String {
    "255.255.255.255".to_string()
}

fn default_socks_server_port() -> u16 {
    8081
}

fn default_socks_client_port() -> u16 {
    8090
}

fn default_round_timeout() -> u64 {
    5000
}

fn default_max_failed_rounds() -> u32 {
    10
}

fn default_reconnect_interval() -> u64 {
    1000
}

fn default_setup_settle_time() -> u64 {
    500
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for PrifiConfig {
    fn default() -> Self {
        Self {
            cell_size_up: default_cell_size_up(),
            cell_size_down: default_cell_size_down(),
            relay_window_size: default_window_size(),
            relay_use_dummy_data_down: false,
            relay_reporting_limit: 0,
            use_udp: false,
            udp_port: default_udp_port(),
            udp_broadcast_address: default_udp_broadcast_address(),
            do_latency_tests: false,
            socks_server_port: default_socks_server_port(),
            socks_client_port: default_socks_client_port(),
            dcnet_type: DcNetType::Plain,
            relay_round_timeout: default_round_timeout(),
            relay_processing_loop_sleep_time: 0,
            relay_max_number_of_consecutive_failed_rounds: default_max_failed_rounds(),
            client_reconnect_interval: default_reconnect_interval(),
            relay_setup_settle_time: default_setup_settle_time(),
            log_dir: None,
            log_level: default_log_level(),
        }
    }
}

impl PrifiConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config: PrifiConfig = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Rejects configurations no run could use.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cell_size_up < MIN_CELL_SIZE {
            return Err(ConfigError::Invalid(format!(
                "CellSizeUp must be at least {}, got {}",
                MIN_CELL_SIZE, self.cell_size_up
            )));
        }
        let largest = self.cell_size_up.max(self.cell_size_down) + SIGMA_SIZE;
        if largest + HEADER_OVERHEAD > MAX_DATAGRAM_SIZE {
            return Err(ConfigError::Invalid(format!(
                "cells of {} bytes exceed the datagram limit of {}",
                largest, MAX_DATAGRAM_SIZE
            )));
        }
        if self.relay_window_size == 0 {
            return Err(ConfigError::Invalid(
                "RelayWindowSize must be at least 1".to_string(),
            ));
        }
        if self.relay_round_timeout == 0 {
            return Err(ConfigError::Invalid(
                "RelayRoundTimeOut must be positive".to_string(),
            ));
        }
        if self.relay_max_number_of_consecutive_failed_rounds == 0 {
            return Err(ConfigError::Invalid(
                "RelayMaxNumberOfConsecutiveFailedRounds must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn round_timeout(&self) -> Duration {
        Duration::from_millis(self.relay_round_timeout)
    }

    pub fn processing_loop_sleep(&self) -> Duration {
        Duration::from_millis(self.relay_processing_loop_sleep_time)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.client_reconnect_interval)
    }

    pub fn setup_settle_time(&self) -> Duration {
        Duration::from_millis(self.relay_setup_settle_time)
    }
}
