//! Pin model: modes, per-mode configuration and values
//!
//! A pin carries two things: the configuration the controller asked for
//! (replayed on every reconnect) and the mode the device last acknowledged.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::OwletError;

/// Functional mode of a pin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PinMode {
    Unconfigured,
    DigitalOutput,
    DigitalInput,
    /// PWM output
    AnalogOutput,
    /// ADC input
    AnalogInput,
    Servo,
    Ws2812,
}

impl Default for PinMode {
    fn default() -> Self {
        Self::Unconfigured
    }
}

impl fmt::Display for PinMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PinMode::Unconfigured => "Unconfigured",
            PinMode::DigitalOutput => "DigitalOutput",
            PinMode::DigitalInput => "DigitalInput",
            PinMode::AnalogOutput => "AnalogOutput",
            PinMode::AnalogInput => "AnalogInput",
            PinMode::Servo => "Servo",
            PinMode::Ws2812 => "WS2812",
        };
        f.write_str(s)
    }
}

/// WS2812 color channel order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedMode {
    #[serde(rename = "RGB")]
    Rgb,
    #[serde(rename = "GRB")]
    Grb,
    #[serde(rename = "RGBW")]
    Rgbw,
    #[serde(rename = "GRBW")]
    Grbw,
}

impl LedMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedMode::Rgb => "RGB",
            LedMode::Grb => "GRB",
            LedMode::Rgbw => "RGBW",
            LedMode::Grbw => "GRBW",
        }
    }
}

impl FromStr for LedMode {
    type Err = OwletError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RGB" => Ok(LedMode::Rgb),
            "GRB" => Ok(LedMode::Grb),
            "RGBW" => Ok(LedMode::Rgbw),
            "GRBW" => Ok(LedMode::Grbw),
            other => Err(OwletError::Config(format!("Unknown LED mode: {}", other))),
        }
    }
}

/// WS2812 data clock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedClock {
    #[serde(rename = "400kHz")]
    Khz400,
    #[serde(rename = "800kHz")]
    Khz800,
}

impl LedClock {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedClock::Khz400 => "400kHz",
            LedClock::Khz800 => "800kHz",
        }
    }
}

impl FromStr for LedClock {
    type Err = OwletError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "400kHz" => Ok(LedClock::Khz400),
            "800kHz" => Ok(LedClock::Khz800),
            other => Err(OwletError::Config(format!("Unknown LED clock: {}", other))),
        }
    }
}

/// Pin configuration: a mode plus its mode-specific parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum PinConfig {
    DigitalOutput,
    DigitalInput,
    AnalogOutput,
    AnalogInput {
        /// Poll period in milliseconds (0 = paused)
        #[serde(default, alias = "refreshRate")]
        refresh_rate_ms: u64,
    },
    Servo,
    #[serde(rename = "ws2812")]
    Ws2812 {
        #[serde(alias = "ledCount")]
        led_count: u16,
        #[serde(alias = "ledMode")]
        led_mode: LedMode,
        #[serde(alias = "ledClock")]
        led_clock: LedClock,
    },
}

impl PinConfig {
    pub fn mode(&self) -> PinMode {
        match self {
            PinConfig::DigitalOutput => PinMode::DigitalOutput,
            PinConfig::DigitalInput => PinMode::DigitalInput,
            PinConfig::AnalogOutput => PinMode::AnalogOutput,
            PinConfig::AnalogInput { .. } => PinMode::AnalogInput,
            PinConfig::Servo => PinMode::Servo,
            PinConfig::Ws2812 { .. } => PinMode::Ws2812,
        }
    }

    /// Poll period for analog inputs
    pub fn refresh_rate_ms(&self) -> Option<u64> {
        match self {
            PinConfig::AnalogInput { refresh_rate_ms } => Some(*refresh_rate_ms),
            _ => None,
        }
    }

    /// Build a parameterless configuration for a mode
    ///
    /// WS2812 needs strip parameters and Unconfigured is not a configuration,
    /// both are rejected.
    pub fn from_mode(mode: PinMode) -> Result<Self, OwletError> {
        match mode {
            PinMode::DigitalOutput => Ok(PinConfig::DigitalOutput),
            PinMode::DigitalInput => Ok(PinConfig::DigitalInput),
            PinMode::AnalogOutput => Ok(PinConfig::AnalogOutput),
            PinMode::AnalogInput => Ok(PinConfig::AnalogInput { refresh_rate_ms: 0 }),
            PinMode::Servo => Ok(PinConfig::Servo),
            PinMode::Ws2812 | PinMode::Unconfigured => Err(OwletError::Config(format!(
                "{} needs explicit parameters",
                mode
            ))),
        }
    }
}

/// Composite WS2812 state; every field is optional so partial updates merge
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brightness: Option<u8>,
    /// 24-bit RGB, red in bits 16-23
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effect: Option<u8>,
}

impl LedState {
    /// Overlay the fields present in `update`
    pub fn merge(&mut self, update: &LedState) {
        if update.power.is_some() {
            self.power = update.power;
        }
        if update.brightness.is_some() {
            self.brightness = update.brightness;
        }
        if update.color.is_some() {
            self.color = update.color.map(|c| c & 0x00FF_FFFF);
        }
        if update.effect.is_some() {
            self.effect = update.effect;
        }
    }
}

/// A pin value, shaped by the pin's mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum PinValue {
    Digital(bool),
    /// ADC reading
    Analog(u32),
    /// PWM duty cycle
    Duty(u8),
    /// Servo angle in degrees
    Angle(u8),
    Led(LedState),
}

impl PinValue {
    /// Whether this value may be written to a pin in `mode`
    pub fn writable_to(&self, mode: PinMode) -> bool {
        matches!(
            (mode, self),
            (PinMode::DigitalOutput, PinValue::Digital(_))
                | (PinMode::AnalogOutput, PinValue::Duty(_))
                | (PinMode::Servo, PinValue::Angle(_))
                | (PinMode::Ws2812, PinValue::Led(_))
        )
    }
}

/// Snapshot of one pin as seen by the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinState {
    pub id: u8,
    /// Configuration recorded by the last ConfigurePin, replayed on reconnect
    pub config: PinConfig,
    /// Mode the device last acknowledged
    pub mode: PinMode,
    /// Last observed or written value
    pub value: Option<PinValue>,
}

impl PinState {
    pub fn new(id: u8, config: PinConfig) -> Self {
        Self {
            id,
            config,
            mode: PinMode::Unconfigured,
            value: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_compatibility() {
        assert!(PinValue::Digital(true).writable_to(PinMode::DigitalOutput));
        assert!(PinValue::Duty(128).writable_to(PinMode::AnalogOutput));
        assert!(PinValue::Angle(90).writable_to(PinMode::Servo));
        assert!(PinValue::Led(LedState::default()).writable_to(PinMode::Ws2812));

        assert!(!PinValue::Digital(true).writable_to(PinMode::DigitalInput));
        assert!(!PinValue::Digital(true).writable_to(PinMode::AnalogOutput));
        assert!(!PinValue::Analog(10).writable_to(PinMode::AnalogInput));
        assert!(!PinValue::Angle(10).writable_to(PinMode::Unconfigured));
    }

    #[test]
    fn test_led_merge_keeps_missing_fields() {
        let mut state = LedState {
            power: Some(true),
            brightness: Some(40),
            color: None,
            effect: Some(1),
        };
        state.merge(&LedState {
            color: Some(0xFFFF_FFFF),
            brightness: Some(200),
            ..Default::default()
        });

        assert_eq!(state.power, Some(true));
        assert_eq!(state.brightness, Some(200));
        assert_eq!(state.color, Some(0xFF_FFFF));
        assert_eq!(state.effect, Some(1));
    }

    #[test]
    fn test_pin_config_from_toml_like_json() {
        let config: PinConfig = serde_json::from_str(
            r#"{"mode": "ws2812", "ledCount": 30, "ledMode": "GRB", "ledClock": "800kHz"}"#,
        )
        .unwrap();
        assert_eq!(
            config,
            PinConfig::Ws2812 {
                led_count: 30,
                led_mode: LedMode::Grb,
                led_clock: LedClock::Khz800,
            }
        );

        let config: PinConfig =
            serde_json::from_str(r#"{"mode": "analog_input", "refresh_rate_ms": 250}"#).unwrap();
        assert_eq!(config.refresh_rate_ms(), Some(250));
        assert_eq!(config.mode(), PinMode::AnalogInput);
    }

    #[test]
    fn test_from_mode_rejects_ws2812() {
        assert!(PinConfig::from_mode(PinMode::Ws2812).is_err());
        assert!(PinConfig::from_mode(PinMode::Unconfigured).is_err());
        assert_eq!(
            PinConfig::from_mode(PinMode::AnalogInput).unwrap(),
            PinConfig::AnalogInput { refresh_rate_ms: 0 }
        );
    }

    #[test]
    fn test_led_enum_strings() {
        assert_eq!("GRBW".parse::<LedMode>().unwrap(), LedMode::Grbw);
        assert_eq!(LedClock::Khz400.as_str(), "400kHz");
        assert!("fast".parse::<LedClock>().is_err());
    }
}
