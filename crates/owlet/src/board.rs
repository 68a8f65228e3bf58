//! Board vocabulary for serial owlets
//!
//! Hosts describe pins of an Arduino Pro Mini by setting name (`pin2`,
//! `pinA1`, ...) and pick a mode from a fixed list of setting values. This
//! module maps both onto firmware pin ids and [`PinMode`]s.

use crate::pin::PinMode;

/// Arduino Pro Mini pin settings: (setting name, firmware pin id)
pub const ARDUINO_PRO_MINI_PINS: &[(&str, u8)] = &[
    ("pin2", 2),
    ("pin3", 3),
    ("pin4", 4),
    ("pin5", 5),
    ("pin6", 6),
    ("pin7", 7),
    ("pin8", 8),
    ("pin9", 9),
    ("pin10", 10),
    ("pin11", 11),
    ("pin12", 12),
    ("pin13", 13),
    // A0 (14) is not exposed
    ("pinA1", 15),
    ("pinA2", 16),
    ("pinA3", 17),
    ("pinA4", 18),
    ("pinA5", 19),
    ("pinA6", 20),
    ("pinA7", 21),
];

/// Resolve an Arduino Pro Mini setting name to a pin id
pub fn arduino_pro_mini_pin(name: &str) -> Option<u8> {
    ARDUINO_PRO_MINI_PINS
        .iter()
        .find(|(setting, _)| setting.eq_ignore_ascii_case(name))
        .map(|(_, id)| *id)
}

/// Map a pin setting value to a mode; unknown values mean Unconfigured
pub fn mode_from_setting(value: &str) -> PinMode {
    match value {
        "Output" => PinMode::DigitalOutput,
        "Input" => PinMode::DigitalInput,
        "PWM" => PinMode::AnalogOutput,
        "Analog Input" => PinMode::AnalogInput,
        "Servo" => PinMode::Servo,
        _ => PinMode::Unconfigured,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_analog_pins_skip_a0() {
        assert_eq!(arduino_pro_mini_pin("pinA1"), Some(15));
        assert_eq!(arduino_pro_mini_pin("pinA7"), Some(21));
        assert_eq!(arduino_pro_mini_pin("pin13"), Some(13));
        assert_eq!(arduino_pro_mini_pin("pinA0"), None);
        assert_eq!(arduino_pro_mini_pin("PINA2"), Some(16));
    }

    #[test]
    fn test_mode_from_setting() {
        assert_eq!(mode_from_setting("PWM"), PinMode::AnalogOutput);
        assert_eq!(mode_from_setting("Analog Input"), PinMode::AnalogInput);
        assert_eq!(mode_from_setting("None"), PinMode::Unconfigured);
        assert_eq!(mode_from_setting("output"), PinMode::Unconfigured);
    }
}
