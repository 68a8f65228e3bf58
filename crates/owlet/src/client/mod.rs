//! Protocol clients
//!
//! A protocol client turns typed [`Request`]s into wire bytes and wire bytes
//! back into completions and notifications. Clients do no I/O and own no
//! timers: the session writes what [`ProtocolClient::submit`] returns, feeds
//! received bytes to [`ProtocolClient::receive`], and calls
//! [`ProtocolClient::expire`] when [`ProtocolClient::next_deadline`] passes.
//!
//! Each request carries an opaque token chosen by the caller; the client
//! hands the token back exactly once, with the request's result, with a
//! `Timeout`, or from [`ProtocolClient::disconnect`].

pub mod gpio;
pub mod net;
mod pending;
pub mod serial;

pub use gpio::{GpioError, Opcode};
pub use net::NetClient;
pub use serial::SerialClient;

use tokio::time::Instant;

use crate::config::{Protocol, SessionConfig};
use crate::error::{OwletError, OwletResult};
use crate::pin::{LedState, PinConfig};

/// Client state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// No link
    Idle,
    /// Link up, handshake outstanding
    Handshaking,
    /// Pin requests allowed
    Ready,
}

/// Protocol-neutral request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    FirmwareVersion,
    PlatformInfo,
    ConfigurePin { pin: u8, config: PinConfig },
    ReadDigital { pin: u8 },
    WriteDigital { pin: u8, value: bool },
    ReadAnalog { pin: u8 },
    WriteAnalog { pin: u8, duty: u8 },
    WriteServo { pin: u8, angle: u8 },
    ControlPin { pin: u8, state: LedState },
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Request::FirmwareVersion => "FirmwareVersion",
            Request::PlatformInfo => "PlatformInfo",
            Request::ConfigurePin { .. } => "ConfigurePin",
            Request::ReadDigital { .. } => "ReadDigital",
            Request::WriteDigital { .. } => "WriteDigital",
            Request::ReadAnalog { .. } => "ReadAnalog",
            Request::WriteAnalog { .. } => "WriteAnalog",
            Request::WriteServo { .. } => "WriteServo",
            Request::ControlPin { .. } => "ControlPin",
        }
    }
}

/// Successful reply
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Ack,
    Firmware(String),
    Digital(bool),
    Analog(u32),
    Info(serde_json::Value),
}

/// Unsolicited device message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// Serial input change, raw firmware value
    PinChanged { pin: u8, value: u8 },
    /// Network pin change, fields present in the message only
    PinStateChanged { pin: u8, state: LedState },
}

/// Output of [`ProtocolClient::receive`]
#[derive(Debug)]
pub enum ClientEvent<T> {
    Completed {
        token: T,
        result: OwletResult<Reply>,
    },
    Notification(Notification),
    /// A frame failed integrity checks; `consecutive` counts since the last good frame
    CodecError { consecutive: u32, error: OwletError },
}

/// Rejected submission; the token is handed back
#[derive(Debug)]
pub struct SubmitError<T> {
    pub token: T,
    pub error: OwletError,
}

impl<T> SubmitError<T> {
    pub fn new(token: T, error: OwletError) -> Self {
        Self { token, error }
    }
}

/// Surface the session drives both clients through
pub trait ProtocolClient<T>: Send {
    fn protocol(&self) -> Protocol;

    fn state(&self) -> ClientState;

    /// Transport came up
    fn on_transport_connected(&mut self);

    /// Encode a request and register it as pending; returns the wire bytes
    fn submit(&mut self, request: Request, token: T, now: Instant)
        -> Result<Vec<u8>, SubmitError<T>>;

    /// Feed received bytes
    fn receive(&mut self, bytes: &[u8]) -> Vec<ClientEvent<T>>;

    /// Fail requests whose deadline passed
    fn expire(&mut self, now: Instant) -> Vec<(T, OwletError)>;

    fn next_deadline(&self) -> Option<Instant>;

    /// Drop back to Idle; returns the tokens of every outstanding request
    fn disconnect(&mut self) -> Vec<T>;

    fn outstanding(&self) -> usize;

    fn firmware_version(&self) -> Option<&str>;
}

/// Create the client for a protocol variant
pub fn create_client<T: Send + 'static>(
    protocol: Protocol,
    config: &SessionConfig,
) -> Box<dyn ProtocolClient<T>> {
    match protocol {
        Protocol::Serial => Box::new(SerialClient::new(config)),
        Protocol::Net => Box::new(NetClient::new(config)),
    }
}
