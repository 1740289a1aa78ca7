//! Experiment configuration, stored as RON.
//!
//! Each protocol the lab runs is one [ExperimentConfig] file; the shipped
//! ones live in `configs/`.

use crate::{block::BlockDefinition, error::FlyflixError};

use serde::{Deserialize, Serialize};
use std::{fs::File, io::Read, path::Path, time::Duration};

/// Where and how to listen for the sensor.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TelemetryConfig {
    /// Address to bind
    #[serde(default = "TelemetryConfig::default_host")]
    pub host: String,
    /// UDP port the sensor sends to
    #[serde(default = "TelemetryConfig::default_port")]
    pub port: u16,
    /// Timeout of the presence probe
    #[serde(default = "TelemetryConfig::default_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// Timeout of every later read
    #[serde(default = "TelemetryConfig::default_timeout_ms")]
    pub receive_timeout_ms: u64,
}

impl TelemetryConfig {
    fn default_host() -> String {
        "127.0.0.1".to_owned()
    }

    fn default_port() -> u16 {
        1717
    }

    fn default_timeout_ms() -> u64 {
        100
    }

    /// The probe timeout, never zero.
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms.max(1))
    }

    /// The receive timeout, never zero.
    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms.max(1))
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            host: Self::default_host(),
            port: Self::default_port(),
            probe_timeout_ms: Self::default_timeout_ms(),
            receive_timeout_ms: Self::default_timeout_ms(),
        }
    }
}

/// One experiment protocol.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ExperimentConfig {
    /// Sensor connection, `None` for open loop only
    #[serde(default = "ExperimentConfig::default_telemetry")]
    pub telemetry: Option<TelemetryConfig>,
    /// Wait step for deadlines and the sweep latch
    #[serde(default = "ExperimentConfig::default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Blank before the first repetition
    #[serde(default)]
    pub opening_delay_ms: u64,
    /// Shuffled passes over the block
    #[serde(default = "ExperimentConfig::default_repetitions")]
    pub repetitions: u32,
    /// Ping interval, `None` for no heartbeat
    #[serde(default)]
    pub heartbeat_ms: Option<u64>,
    /// Written to the data log at start
    #[serde(default)]
    pub metadata: Vec<(String, String)>,
    /// The conditions
    pub block: BlockDefinition,
}

impl ExperimentConfig {
    fn default_telemetry() -> Option<TelemetryConfig> {
        Some(TelemetryConfig::default())
    }

    fn default_poll_interval_ms() -> u64 {
        10
    }

    fn default_repetitions() -> u32 {
        1
    }

    /// Read a config from a file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, FlyflixError> {
        let mut handle = File::open(path)?;
        Self::from_file(&mut handle)
    }

    /// Read a config from anything readable.
    pub fn from_file(file: &mut impl Read) -> Result<Self, FlyflixError> {
        let mut buf = String::new();
        file.read_to_string(&mut buf)?;
        Self::parse(&buf)
    }

    /// Parse a RON document.
    pub fn parse(text: &str) -> Result<Self, FlyflixError> {
        Ok(ron::de::from_str(text)?)
    }

    /// The poll interval as a [Duration], never zero.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}
