//! Device session
//!
//! A [`Session`] is a cloneable handle to one actor task that owns the
//! device's transport, protocol client, pin map, poll timers and pending
//! requests. Operations travel to the actor over a command channel and come
//! back on oneshot replies; pin changes and link health are broadcast as
//! [`SessionEvent`]s. Cached state (link state, firmware version, pins) is
//! mirrored behind a lock so it can be read without suspending.

mod actor;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::debug;

use crate::client::create_client;
use crate::config::{Protocol, SessionConfig, TransportDescriptor};
use crate::error::{OwletError, OwletResult};
use crate::pin::{PinConfig, PinState, PinValue};
use crate::transport::{create_transport, Transport};

use actor::SessionActor;

const COMMAND_CHANNEL_CAPACITY: usize = 64;
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Link state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LinkState {
    Disconnected,
    /// Transport opening
    Connecting,
    /// Transport up, handshake or replay in progress
    Connected,
    /// Pin operations go to the wire
    Ready,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
            LinkState::Ready => "ready",
        };
        f.write_str(s)
    }
}

/// Event published by a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// `true` once the device is ready, `false` when an announced link is lost
    ConnectionChanged(bool),
    /// Input change from a notification, a poll or an input sync
    PinChanged { pin: u8, value: PinValue },
}

/// State mirrored out of the actor
#[derive(Debug, Clone)]
pub(crate) struct SessionSnapshot {
    pub link_state: LinkState,
    pub firmware_version: Option<String>,
    pub pins: BTreeMap<u8, PinState>,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            link_state: LinkState::Disconnected,
            firmware_version: None,
            pins: BTreeMap::new(),
        }
    }
}

pub(crate) enum Command {
    Configure {
        pin: u8,
        config: PinConfig,
        reply: oneshot::Sender<OwletResult<()>>,
    },
    Read {
        pin: u8,
        reply: oneshot::Sender<OwletResult<PinValue>>,
    },
    Write {
        pin: u8,
        value: PinValue,
        reply: oneshot::Sender<OwletResult<()>>,
    },
    SetPollInterval {
        pin: u8,
        interval: Duration,
        reply: oneshot::Sender<OwletResult<()>>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to a device session
///
/// Clones share the session. The session closes when [`Session::close`] is
/// called or the last handle is dropped.
#[derive(Clone)]
pub struct Session {
    device_id: String,
    protocol: Protocol,
    endpoint: String,
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<SessionEvent>,
    shared: Arc<RwLock<SessionSnapshot>>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("device_id", &self.device_id)
            .field("protocol", &self.protocol)
            .field("endpoint", &self.endpoint)
            .field("link_state", &self.link_state())
            .finish()
    }
}

impl Session {
    /// Open a session to the device described by `descriptor`
    ///
    /// The transport starts connecting immediately; the protocol follows
    /// from the transport (TCP speaks the network protocol, serial the
    /// binary one).
    pub fn open(
        device_id: impl Into<String>,
        descriptor: &TransportDescriptor,
        config: SessionConfig,
    ) -> OwletResult<Self> {
        let transport = create_transport(descriptor, &config.backoff)?;
        Ok(Self::with_transport(
            device_id,
            descriptor.protocol(),
            transport,
            config,
        ))
    }

    /// Open a session over an existing transport
    pub fn with_transport(
        device_id: impl Into<String>,
        protocol: Protocol,
        transport: Arc<dyn Transport>,
        config: SessionConfig,
    ) -> Self {
        Self::spawn(device_id.into(), protocol, transport, config).0
    }

    /// Spawn the actor; the returned receiver sees every event from the start
    pub(crate) fn spawn(
        device_id: String,
        protocol: Protocol,
        transport: Arc<dyn Transport>,
        config: SessionConfig,
    ) -> (Self, broadcast::Receiver<SessionEvent>) {
        let (commands, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (events, event_rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let shared = Arc::new(RwLock::new(SessionSnapshot::default()));
        let endpoint = transport.describe();

        debug!(%device_id, %protocol, %endpoint, "Opening session");
        let actor = SessionActor::new(
            device_id.clone(),
            config.clone(),
            transport,
            create_client(protocol, &config),
            shared.clone(),
            events.clone(),
        );
        tokio::spawn(actor.run(command_rx));

        (
            Self {
                device_id,
                protocol,
                endpoint,
                commands,
                events,
                shared,
            },
            event_rx,
        )
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Transport endpoint, e.g. `tcp://10.0.0.7:5555`
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Subscribe to session events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    async fn request<R>(
        &self,
        build: impl FnOnce(oneshot::Sender<OwletResult<R>>) -> Command,
    ) -> OwletResult<R> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .await
            .map_err(|_| OwletError::SessionClosed)?;
        // Reply sender dropped while the request was in flight
        rx.await.unwrap_or(Err(OwletError::Disconnected))
    }

    /// Record a pin configuration and apply it to the device
    pub async fn configure_pin(&self, pin: u8, config: PinConfig) -> OwletResult<()> {
        self.request(|reply| Command::Configure { pin, config, reply })
            .await
    }

    /// Read a pin, on the wire where the protocol can
    pub async fn read_pin(&self, pin: u8) -> OwletResult<PinValue> {
        self.request(|reply| Command::Read { pin, reply }).await
    }

    /// Write a value shaped for the pin's mode
    pub async fn write_pin(&self, pin: u8, value: PinValue) -> OwletResult<()> {
        self.request(|reply| Command::Write { pin, value, reply })
            .await
    }

    /// Change an analog input's poll period; zero pauses polling
    pub async fn set_poll_interval(&self, pin: u8, interval: Duration) -> OwletResult<()> {
        self.request(|reply| Command::SetPollInterval {
            pin,
            interval,
            reply,
        })
        .await
    }

    /// Close the session: stop timers, fail pending requests, close the transport
    pub async fn close(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Close { reply: tx }).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Whether the actor has stopped
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    pub fn link_state(&self) -> LinkState {
        self.shared.read().link_state
    }

    pub fn is_ready(&self) -> bool {
        self.link_state() == LinkState::Ready
    }

    /// Firmware version reported by the serial handshake
    pub fn firmware_version(&self) -> Option<String> {
        self.shared.read().firmware_version.clone()
    }

    pub fn pin(&self, pin: u8) -> Option<PinState> {
        self.shared.read().pins.get(&pin).cloned()
    }

    /// All pins in ascending id order
    pub fn pins(&self) -> Vec<PinState> {
        self.shared.read().pins.values().cloned().collect()
    }

    /// Last observed or written value of a pin
    pub fn pin_value(&self, pin: u8) -> Option<PinValue> {
        self.shared.read().pins.get(&pin).and_then(|p| p.value)
    }
}
