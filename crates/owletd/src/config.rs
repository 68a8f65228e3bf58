//! Daemon configuration file
//!
//! ```toml
//! settings_file = "/var/lib/owletd/settings.json"
//!
//! [session]
//! request_timeout_ms = 2000
//!
//! [[devices]]
//! id = "bench-board"
//! transport = { type = "serial", path = "/dev/ttyUSB0" }
//! pins = [
//!     { name = "pin5", mode = "digital_output" },
//!     { name = "pinA1", mode = "analog_input", refresh_rate_ms = 500 },
//! ]
//!
//! [devices.board_pins]
//! pin9 = "Servo"
//! pin10 = "PWM"
//!
//! [[devices]]
//! id = "hallway"
//! owlet_id = "a4cf12"
//! pins = [{ pin = 8, mode = "ws2812", led_count = 30, led_mode = "GRB", led_clock = "800kHz" }]
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use owlet::board::{arduino_pro_mini_pin, mode_from_setting};
use owlet::{PinConfig, PinMode, SessionConfig, TransportDescriptor};
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DaemonConfig {
    /// Where per-device settings (cached addresses) are kept; in memory if unset
    #[serde(default)]
    pub settings_file: Option<PathBuf>,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    pub id: String,
    /// Explicit endpoint
    #[serde(default)]
    pub transport: Option<TransportDescriptor>,
    /// Network owlet id, resolved through the cached address
    #[serde(default)]
    pub owlet_id: Option<String>,
    #[serde(default)]
    pub pins: Vec<PinEntry>,
    /// Board pin settings by name, e.g. `pin10 = "PWM"`
    ///
    /// Analog inputs set up this way start unpolled.
    #[serde(default)]
    pub board_pins: BTreeMap<String, String>,
}

impl DeviceConfig {
    /// Every pin to configure, in ascending pin order
    pub fn pin_configs(&self) -> anyhow::Result<Vec<(u8, PinConfig)>> {
        let mut configs = BTreeMap::new();
        for entry in &self.pins {
            let pin = entry.pin_id()?;
            if configs.insert(pin, entry.config.clone()).is_some() {
                bail!("Pin {} configured twice", pin);
            }
        }
        for (name, setting) in &self.board_pins {
            let pin = arduino_pro_mini_pin(name)
                .with_context(|| format!("Unknown board pin name: {}", name))?;
            let mode = mode_from_setting(setting);
            if mode == PinMode::Unconfigured {
                continue;
            }
            let config = PinConfig::from_mode(mode)?;
            if configs.insert(pin, config).is_some() {
                bail!("Pin {} configured twice", pin);
            }
        }
        Ok(configs.into_iter().collect())
    }
}

/// One pin: a numeric id or a board pin name plus its configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PinEntry {
    #[serde(default)]
    pub pin: Option<u8>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(flatten)]
    pub config: PinConfig,
}

impl PinEntry {
    pub fn pin_id(&self) -> anyhow::Result<u8> {
        match (self.pin, &self.name) {
            (Some(pin), None) => Ok(pin),
            (None, Some(name)) => arduino_pro_mini_pin(name)
                .with_context(|| format!("Unknown board pin name: {}", name)),
            (Some(_), Some(_)) => bail!("Pin entry has both pin and name"),
            (None, None) => bail!("Pin entry needs pin or name"),
        }
    }
}

impl DaemonConfig {
    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: DaemonConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid config {}", path.display()))
    }

    fn validate(&self) -> anyhow::Result<()> {
        let mut seen = HashSet::new();
        for device in &self.devices {
            if !seen.insert(device.id.as_str()) {
                bail!("Duplicate device id: {}", device.id);
            }
            match (&device.transport, &device.owlet_id) {
                (Some(_), None) | (None, Some(_)) => {}
                _ => bail!(
                    "Device {} needs exactly one of transport or owlet_id",
                    device.id
                ),
            }
            device
                .pin_configs()
                .with_context(|| format!("Device {}", device.id))?;
        }
        Ok(())
    }
}
