//! owlet - GPIO peripherals bridge
//!
//! This crate drives small microcontroller boards ("owlets") that expose
//! their GPIO pins to a host, either over a serial line (COBS framed binary
//! protocol) or over TCP (newline delimited JSON).
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Controller                            │
//! │  sessions by device id, merged events, cachedIP settings    │
//! │                                                             │
//! │  ┌─────────────────────────────────────────────────────┐   │
//! │  │ Session (actor task)                                 │   │
//! │  │  ┌───────────┐  ┌───────────┐  ┌─────────────────┐  │   │
//! │  │  │ pin map   │  │ poll      │  │ waiters /       │  │   │
//! │  │  │ + replay  │  │ timers    │  │ pending queue   │  │   │
//! │  │  └───────────┘  └───────────┘  └─────────────────┘  │   │
//! │  │                       │                              │   │
//! │  │              ┌────────┴────────┐                     │   │
//! │  │              │ ProtocolClient  │                     │   │
//! │  │              │ (serial / net)  │                     │   │
//! │  │              └────────┬────────┘                     │   │
//! │  │              ┌────────┴────────┐                     │   │
//! │  │              │   Transport     │                     │   │
//! │  │              │ (tcp / serial)  │                     │   │
//! │  │              └─────────────────┘                     │   │
//! │  └─────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod board;
pub mod client;
pub mod codec;
pub mod config;
pub mod controller;
pub mod discovery;
pub mod error;
pub mod pin;
pub mod session;
pub mod settings;
pub mod testing;
pub mod transport;

pub use config::{
    BackoffConfig, Protocol, SerialConfig, SessionConfig, TcpConfig, TransportDescriptor,
};
pub use controller::{Controller, ControllerEvent};
pub use discovery::{resolve_owlet, ServiceEntry};
pub use error::{DeviceError, OwletError, OwletResult};
pub use pin::{LedClock, LedMode, LedState, PinConfig, PinMode, PinState, PinValue};
pub use session::{LinkState, Session, SessionEvent};
pub use settings::{JsonFileSettings, MemorySettings, SettingsStore};
pub use transport::{create_transport, Transport, TransportError, TransportEvent};
