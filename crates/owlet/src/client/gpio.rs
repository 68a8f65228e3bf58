//! Serial firmware opcodes, mode bytes and GPIO error codes

use std::fmt;

use crate::pin::PinMode;

/// Serial protocol opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    GetFirmwareVersion,
    ConfigurePin,
    WriteDigital,
    ReadDigital,
    WriteAnalog,
    ReadAnalog,
    WriteServo,
    /// Notification: an input pin changed
    PinChanged,
}

impl Opcode {
    pub fn as_u8(self) -> u8 {
        match self {
            Opcode::GetFirmwareVersion => 0x00,
            Opcode::ConfigurePin => 0x01,
            Opcode::WriteDigital => 0x02,
            Opcode::ReadDigital => 0x03,
            Opcode::WriteAnalog => 0x04,
            Opcode::ReadAnalog => 0x05,
            Opcode::WriteServo => 0x06,
            Opcode::PinChanged => 0x80,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Opcode::GetFirmwareVersion),
            0x01 => Some(Opcode::ConfigurePin),
            0x02 => Some(Opcode::WriteDigital),
            0x03 => Some(Opcode::ReadDigital),
            0x04 => Some(Opcode::WriteAnalog),
            0x05 => Some(Opcode::ReadAnalog),
            0x06 => Some(Opcode::WriteServo),
            0x80 => Some(Opcode::PinChanged),
            _ => None,
        }
    }

    /// Opcodes with the high bit set are unsolicited
    pub fn is_notification(value: u8) -> bool {
        value & 0x80 != 0
    }
}

/// Firmware mode byte for a pin mode; WS2812 has none
pub fn mode_byte(mode: PinMode) -> Option<u8> {
    match mode {
        PinMode::Unconfigured => Some(0),
        PinMode::DigitalOutput => Some(1),
        PinMode::DigitalInput => Some(2),
        PinMode::AnalogOutput => Some(3),
        PinMode::AnalogInput => Some(4),
        PinMode::Servo => Some(5),
        PinMode::Ws2812 => None,
    }
}

/// GPIO error codes reported by the serial firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpioError {
    NoError,
    InvalidPin,
    InvalidMode,
    NotConfigured,
    HardwareFailure,
    /// Unknown error code
    Unknown(u8),
}

impl From<u8> for GpioError {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::NoError,
            1 => Self::InvalidPin,
            2 => Self::InvalidMode,
            3 => Self::NotConfigured,
            4 => Self::HardwareFailure,
            other => Self::Unknown(other),
        }
    }
}

impl From<GpioError> for u8 {
    fn from(err: GpioError) -> Self {
        match err {
            GpioError::NoError => 0,
            GpioError::InvalidPin => 1,
            GpioError::InvalidMode => 2,
            GpioError::NotConfigured => 3,
            GpioError::HardwareFailure => 4,
            GpioError::Unknown(code) => code,
        }
    }
}

impl fmt::Display for GpioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GpioError::NoError => f.write_str("no error"),
            GpioError::InvalidPin => f.write_str("invalid pin"),
            GpioError::InvalidMode => f.write_str("invalid mode"),
            GpioError::NotConfigured => f.write_str("pin not configured"),
            GpioError::HardwareFailure => f.write_str("hardware failure"),
            GpioError::Unknown(code) => write!(f, "unknown error 0x{:02X}", code),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gpio_error_codes() {
        assert_eq!(GpioError::from(4), GpioError::HardwareFailure);
        assert_eq!(GpioError::from(0x42), GpioError::Unknown(0x42));
        assert_eq!(u8::from(GpioError::Unknown(0x42)), 0x42);
        assert_eq!(GpioError::Unknown(0x42).to_string(), "unknown error 0x42");
    }

    #[test]
    fn test_opcodes() {
        for code in 0x00..=0x06 {
            assert_eq!(Opcode::from_u8(code).map(Opcode::as_u8), Some(code));
        }
        assert!(Opcode::is_notification(Opcode::PinChanged.as_u8()));
        assert!(Opcode::is_notification(0xFE));
        assert!(!Opcode::is_notification(Opcode::ReadAnalog.as_u8()));
        assert_eq!(Opcode::from_u8(0x07), None);
    }

    #[test]
    fn test_mode_bytes() {
        assert_eq!(mode_byte(PinMode::AnalogOutput), Some(3));
        assert_eq!(mode_byte(PinMode::Servo), Some(5));
        assert_eq!(mode_byte(PinMode::Ws2812), None);
    }
}
