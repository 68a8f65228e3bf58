//! Owlet errors

use thiserror::Error;

use crate::client::GpioError;
use crate::pin::PinMode;
use crate::transport::TransportError;

/// Result type for owlet operations
pub type OwletResult<T> = Result<T, OwletError>;

/// Error reported by the device for an otherwise well-formed request
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// Serial firmware returned a GPIO error code
    #[error("GPIO error: {0}")]
    Gpio(GpioError),

    /// Network owlet returned an error string
    #[error("{0}")]
    Remote(String),
}

/// Errors surfaced to callers of session and controller operations
#[derive(Debug, Error, Clone)]
pub enum OwletError {
    /// Transport error (socket or serial port)
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Frame integrity failure on the serial link
    #[error("Codec error: {0}")]
    Codec(String),

    /// No reply within the request deadline
    #[error("Timeout waiting for device response")]
    Timeout,

    /// Link dropped while the request was outstanding
    #[error("Device disconnected")]
    Disconnected,

    /// Device rejected the request
    #[error("Device error: {0}")]
    Device(DeviceError),

    /// Value shape does not match the pin's mode
    #[error("Pin {pin} is configured as {mode}, value does not match")]
    ModeMismatch { pin: u8, mode: PinMode },

    /// Session has not reached Ready yet
    #[error("Device not ready")]
    NotReady,

    /// Too many outstanding requests
    #[error("Too many outstanding requests")]
    Backpressure,

    /// Pin has never been configured on this session
    #[error("Unknown pin: {0}")]
    UnknownPin(u8),

    /// Operation or mode not available on this protocol variant
    #[error("Not supported: {0}")]
    Unsupported(String),

    /// Reply could not be interpreted
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Cached read with nothing cached yet
    #[error("No value known for pin {0}")]
    NoValue(u8),

    /// Session task has terminated
    #[error("Session closed")]
    SessionClosed,

    /// Lookup failed (session id, owlet record)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Settings persistence failed
    #[error("Storage error: {0}")]
    Storage(String),
}

impl From<GpioError> for OwletError {
    fn from(err: GpioError) -> Self {
        OwletError::Device(DeviceError::Gpio(err))
    }
}

impl OwletError {
    /// Errors that say nothing about the device's pin state
    ///
    /// A configure that fails with one of these leaves the cached mode alone.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            OwletError::Transport(_)
                | OwletError::Codec(_)
                | OwletError::Timeout
                | OwletError::Disconnected
                | OwletError::Backpressure
                | OwletError::SessionClosed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gpio_error_conversion() {
        let err: OwletError = GpioError::HardwareFailure.into();
        match err {
            OwletError::Device(DeviceError::Gpio(GpioError::HardwareFailure)) => {}
            other => panic!("Expected Device(Gpio), got {:?}", other),
        }
    }

    #[test]
    fn test_transient_classification() {
        assert!(OwletError::Timeout.is_transient());
        assert!(OwletError::Disconnected.is_transient());
        assert!(!OwletError::Device(DeviceError::Remote("GPIOErrorInvalidPin".into())).is_transient());
        assert!(!OwletError::NotReady.is_transient());
    }

    #[test]
    fn test_mode_mismatch_message() {
        let err = OwletError::ModeMismatch {
            pin: 5,
            mode: PinMode::DigitalInput,
        };
        assert_eq!(
            err.to_string(),
            "Pin 5 is configured as DigitalInput, value does not match"
        );
    }
}
