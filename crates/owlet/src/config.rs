//! Session and transport configuration
//!
//! All types deserialize with per-field defaults so a config file only needs
//! to name what differs from the stock owlet firmware.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default TCP port of network owlets
pub const DEFAULT_NET_PORT: u16 = 5555;

/// Default serial baud rate
pub const DEFAULT_BAUD: u32 = 115_200;

/// Per-session tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Deadline for every request
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Outstanding request limit (serial sequence space caps this at 256)
    #[serde(default = "default_max_outstanding")]
    pub max_outstanding: usize,
    /// Consecutive corrupt frames before the serial link is cycled
    #[serde(default = "default_max_codec_errors")]
    pub max_codec_errors: u32,
    /// Read every digital input once the session becomes ready
    #[serde(default = "default_true")]
    pub sync_inputs_on_ready: bool,
    /// Reconnect backoff
    #[serde(default)]
    pub backoff: BackoffConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            max_outstanding: default_max_outstanding(),
            max_codec_errors: default_max_codec_errors(),
            sync_inputs_on_ready: true,
            backoff: BackoffConfig::default(),
        }
    }
}

impl SessionConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

fn default_request_timeout_ms() -> u64 {
    2000
}

fn default_max_outstanding() -> usize {
    256
}

fn default_max_codec_errors() -> u32 {
    8
}

fn default_true() -> bool {
    true
}

/// Exponential reconnect backoff
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "default_backoff_initial_ms")]
    pub initial_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub max_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub factor: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: default_backoff_initial_ms(),
            max_ms: default_backoff_max_ms(),
            factor: default_backoff_factor(),
        }
    }
}

fn default_backoff_initial_ms() -> u64 {
    1000
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

fn default_backoff_factor() -> u32 {
    2
}

// =============================================================================
// Transport
// =============================================================================

/// Where a device lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportDescriptor {
    /// Network owlet
    Tcp(TcpConfig),
    /// Microcontroller board on a serial port
    Serial(SerialConfig),
}

impl TransportDescriptor {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp(TcpConfig {
            host: host.into(),
            port,
            connect_timeout_ms: default_connect_timeout_ms(),
        })
    }

    pub fn serial(path: impl Into<String>, baud: u32) -> Self {
        Self::Serial(SerialConfig {
            path: path.into(),
            baud,
            settle_ms: default_settle_ms(),
        })
    }

    /// Protocol spoken over this transport
    pub fn protocol(&self) -> Protocol {
        match self {
            TransportDescriptor::Tcp(_) => Protocol::Net,
            TransportDescriptor::Serial(_) => Protocol::Serial,
        }
    }
}

impl fmt::Display for TransportDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportDescriptor::Tcp(cfg) => write!(f, "tcp://{}:{}", cfg.host, cfg.port),
            TransportDescriptor::Serial(cfg) => write!(f, "serial://{}@{}", cfg.path, cfg.baud),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_port() -> u16 {
    DEFAULT_NET_PORT
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Device path, e.g. /dev/ttyUSB0
    pub path: String,
    #[serde(default = "default_baud")]
    pub baud: u32,
    /// Delay after open before the board is considered up (DTR reset)
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
}

fn default_baud() -> u32 {
    DEFAULT_BAUD
}

fn default_settle_ms() -> u64 {
    1000
}

/// Protocol variant of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Newline-delimited JSON over TCP
    Net,
    /// COBS framed binary over a serial port
    Serial,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Net => f.write_str("net"),
            Protocol::Serial => f.write_str("serial"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_session_defaults() {
        let config: SessionConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, SessionConfig::default());
        assert_eq!(config.request_timeout(), Duration::from_secs(2));
        assert_eq!(config.max_outstanding, 256);
        assert_eq!(config.backoff.max_ms, 30_000);
    }

    #[test]
    fn test_transport_descriptor_tagged() {
        let desc: TransportDescriptor =
            serde_json::from_str(r#"{"type": "tcp", "host": "10.0.0.7"}"#).unwrap();
        assert_eq!(desc, TransportDescriptor::tcp("10.0.0.7", 5555));
        assert_eq!(desc.protocol(), Protocol::Net);

        let desc: TransportDescriptor =
            serde_json::from_str(r#"{"type": "serial", "path": "/dev/ttyUSB0"}"#).unwrap();
        match &desc {
            TransportDescriptor::Serial(cfg) => {
                assert_eq!(cfg.baud, 115_200);
                assert_eq!(cfg.settle_ms, 1000);
            }
            other => panic!("Expected Serial, got {:?}", other),
        }
        assert_eq!(desc.to_string(), "serial:///dev/ttyUSB0@115200");
    }
}
