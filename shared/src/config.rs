//! Link configuration
//!
//! All tunables of the link manager live in [`LinkConfig`]. Every field has a
//! default, so a JSON document only needs the values it changes:
//!
//! ```rust
//! use serial_link::config::LinkConfig;
//!
//! let config = LinkConfig::from_json(r#"{ "serial": { "baud_rate": 9600 } }"#).unwrap();
//! assert_eq!(config.serial.baud_rate, 9600);
//! assert_eq!(config.serial.data_bits, 8);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::LinkError;

/// Parity mode applied to the port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
    Mark,
    Space,
}

/// Stop bits applied to the port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopBits {
    #[default]
    One,
    OnePointFive,
    Two,
}

/// Line parameters pushed to the handle after opening
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialParameters {
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: StopBits,
    pub parity: Parity,
}

impl Default for SerialParameters {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            data_bits: 8,
            stop_bits: StopBits::One,
            parity: Parity::None,
        }
    }
}

/// Growth curve of the reconnect delay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    /// `base * attempt`
    Linear,
    /// `base * 2^(attempt - 1)`
    #[default]
    Exponential,
}

/// Reconnect budget and backoff
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Master switch for automatic reconnects
    pub enabled: bool,
    /// Attempts allowed inside one cooldown window
    pub max_attempts: u32,
    /// Quiet time after the last attempt that resets the counter
    #[serde(with = "millis")]
    pub cooldown: Duration,
    /// Delay before the first attempt
    #[serde(with = "millis")]
    pub base_delay: Duration,
    /// Upper bound on any single delay
    #[serde(with = "millis")]
    pub max_delay: Duration,
    pub backoff: BackoffKind,
    /// Attempts charged for an unclassified fault
    pub critical_attempt_weight: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 5,
            cooldown: Duration::from_secs(10),
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff: BackoffKind::Exponential,
            critical_attempt_weight: 2,
        }
    }
}

/// Configuration for the link manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub serial: SerialParameters,
    /// Size of the scratch buffer handed to each blocking read
    pub read_chunk_size: usize,
    /// Write timeout for outbound data
    #[serde(with = "millis")]
    pub write_timeout: Duration,
    /// How long `disconnect` waits for the read loop to finish
    #[serde(with = "millis")]
    pub join_timeout: Duration,
    /// Initial framing buffer capacity
    pub buffer_capacity: usize,
    /// Undecodable bytes tolerated before the framing buffer is cleared
    pub max_pending_bytes: usize,
    /// Packets shorter than this are dropped by the dispatcher
    pub min_packet_len: usize,
    /// Packets longer than this are dropped by the dispatcher
    pub max_packet_len: usize,
    /// Connect automatically when an attached device probes as serial
    pub auto_connect_on_attach: bool,
    pub reconnect: ReconnectConfig,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            serial: SerialParameters::default(),
            read_chunk_size: 1024,
            write_timeout: Duration::from_millis(200),
            join_timeout: Duration::from_secs(1),
            buffer_capacity: crate::buffer::DEFAULT_CAPACITY,
            max_pending_bytes: 64 * 1024,
            min_packet_len: 4,
            max_packet_len: 256,
            auto_connect_on_attach: true,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl LinkConfig {
    /// Parse a (possibly partial) JSON document
    pub fn from_json(json: &str) -> Result<Self, LinkError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Render as pretty JSON
    pub fn to_json(&self) -> Result<String, LinkError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Durations are written as integer milliseconds
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
