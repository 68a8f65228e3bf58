//! Session actor
//!
//! ```text
//!              transport.connected
//!  Connecting ─────────────────────► Connected ──(handshake ok, replay done)──► Ready
//!      ▲                                 │                                        │
//!      │                                 │ disconnected / handshake failure /     │
//!      │                                 ▼ codec desync                           │
//!      └────── reconnect loop ──── Disconnected ◄─────────────────────────────────┘
//! ```
//!
//! Every handler here is synchronous. Wire bytes produced while handling a
//! command, a transport event or a timer are queued in the outbox and
//! written, in order, before the actor looks at the next input.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use super::{Command, LinkState, SessionEvent, SessionSnapshot};
use crate::client::{
    ClientEvent, ClientState, Notification, ProtocolClient, Reply, Request, SubmitError,
};
use crate::config::{Protocol, SessionConfig};
use crate::error::{OwletError, OwletResult};
use crate::pin::{PinConfig, PinMode, PinState, PinValue};
use crate::transport::{Transport, TransportEvent};

/// Completion target of an outstanding request
pub(super) enum Waiter {
    Handshake,
    PlatformInfo,
    Replay {
        pin: u8,
        mode: PinMode,
    },
    Configure {
        pin: u8,
        mode: PinMode,
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
    Poll {
        pin: u8,
    },
    InputSync {
        pin: u8,
    },
}

struct PollTimer {
    interval: Duration,
    next: Instant,
    in_flight: bool,
}

pub(super) struct SessionActor {
    device_id: String,
    config: SessionConfig,
    transport: Arc<dyn Transport>,
    client: Box<dyn ProtocolClient<Waiter>>,
    shared: Arc<RwLock<SessionSnapshot>>,
    events: broadcast::Sender<SessionEvent>,
    /// `ConnectionChanged(true)` was published for the current link
    announced: bool,
    /// Commands held back while handshake or replay run
    queued: VecDeque<Command>,
    replay_remaining: usize,
    polls: HashMap<u8, PollTimer>,
    outbox: Vec<Vec<u8>>,
}

impl SessionActor {
    pub(super) fn new(
        device_id: String,
        config: SessionConfig,
        transport: Arc<dyn Transport>,
        client: Box<dyn ProtocolClient<Waiter>>,
        shared: Arc<RwLock<SessionSnapshot>>,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Self {
            device_id,
            config,
            transport,
            client,
            shared,
            events,
            announced: false,
            queued: VecDeque::new(),
            replay_remaining: 0,
            polls: HashMap::new(),
            outbox: Vec::new(),
        }
    }

    pub(super) async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let mut transport_events = self.transport.subscribe();
        self.transport.open();
        self.set_link(LinkState::Connecting);

        loop {
            let wakeup = self.next_wakeup();
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Close { reply }) => {
                        // Handles see the session as closed once close() returns
                        commands.close();
                        self.shutdown().await;
                        let _ = reply.send(());
                        return;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        debug!(device_id = %self.device_id, "All handles dropped");
                        self.shutdown().await;
                        return;
                    }
                },
                event = transport_events.recv() => match event {
                    Ok(event) => self.handle_transport_event(event),
                    Err(RecvError::Lagged(n)) => {
                        // A missed Disconnected would leave requests bound to a dead link
                        warn!(device_id = %self.device_id, skipped = n, "Transport events lagged");
                        self.cycle_link("transport events lagged");
                    }
                    Err(RecvError::Closed) => {
                        self.shutdown().await;
                        return;
                    }
                },
                _ = sleep_until(wakeup) => self.handle_timers(Instant::now()),
            }
            self.flush().await;
        }
    }

    // =========================================================================
    // Shared state
    // =========================================================================

    fn link(&self) -> LinkState {
        self.shared.read().link_state
    }

    fn set_link(&self, state: LinkState) {
        let previous = std::mem::replace(&mut self.shared.write().link_state, state);
        if previous != state {
            debug!(device_id = %self.device_id, from = %previous, to = %state, "Link state");
        }
    }

    fn pin_mode(&self, pin: u8) -> Option<PinMode> {
        self.shared.read().pins.get(&pin).map(|p| p.mode)
    }

    /// Mode of a pin whose recorded configuration the device has acknowledged
    ///
    /// `None` while a reconfiguration is outstanding; values read under the
    /// old mode must not land in the cache then.
    fn settled_mode(&self, pin: u8) -> Option<PinMode> {
        self.shared
            .read()
            .pins
            .get(&pin)
            .filter(|p| p.mode == p.config.mode())
            .map(|p| p.mode)
    }

    fn update_pin(&self, pin: u8, f: impl FnOnce(&mut PinState)) {
        if let Some(state) = self.shared.write().pins.get_mut(&pin) {
            f(state);
        }
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn emit_pin_changed(&self, pin: u8, value: PinValue) {
        self.update_pin(pin, |state| state.value = Some(value));
        self.emit(SessionEvent::PinChanged { pin, value });
    }

    // =========================================================================
    // Wire
    // =========================================================================

    fn submit(&mut self, request: Request, waiter: Waiter) {
        let name = request.name();
        match self.client.submit(request, waiter, Instant::now()) {
            Ok(bytes) => self.outbox.push(bytes),
            Err(SubmitError { token, error }) => {
                debug!(device_id = %self.device_id, request = name, %error, "Request rejected");
                self.complete(token, Err(error));
            }
        }
    }

    async fn flush(&mut self) {
        for bytes in std::mem::take(&mut self.outbox) {
            if let Err(e) = self.transport.write(&bytes).await {
                // The link is going down; pending requests fail on Disconnected
                warn!(device_id = %self.device_id, error = %e, "Write failed");
                break;
            }
        }
    }

    fn next_wakeup(&self) -> Option<Instant> {
        let polls = if self.link() == LinkState::Ready {
            self.polls.values().map(|t| t.next).min()
        } else {
            None
        };
        match (self.client.next_deadline(), polls) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    // =========================================================================
    // Transport events
    // =========================================================================

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => self.on_connected(),
            TransportEvent::Disconnected => {
                if self.link() >= LinkState::Connected {
                    info!(device_id = %self.device_id, "Device disconnected");
                }
                self.on_link_lost();
            }
            TransportEvent::Error(e) => {
                debug!(device_id = %self.device_id, error = %e, "Transport error");
            }
            TransportEvent::Bytes(bytes) => {
                if self.link() < LinkState::Connected {
                    trace!(device_id = %self.device_id, len = bytes.len(), "Dropping bytes from stale link");
                    return;
                }
                for event in self.client.receive(&bytes) {
                    self.handle_client_event(event);
                }
            }
        }
    }

    fn on_connected(&mut self) {
        if self.link() >= LinkState::Connected {
            debug!(device_id = %self.device_id, "Connected without a disconnect, dropping old link state");
            self.on_link_lost();
        }
        info!(device_id = %self.device_id, endpoint = %self.transport.describe(), "Device connected");
        self.set_link(LinkState::Connected);
        self.client.on_transport_connected();

        match self.client.protocol() {
            Protocol::Serial => self.submit(Request::FirmwareVersion, Waiter::Handshake),
            Protocol::Net => {
                self.submit(Request::PlatformInfo, Waiter::PlatformInfo);
                self.begin_replay();
            }
        }
    }

    /// Drop everything tied to the current link
    fn on_link_lost(&mut self) {
        if self.link() < LinkState::Connected && self.client.state() == ClientState::Idle {
            return;
        }
        self.set_link(LinkState::Disconnected);
        self.outbox.clear();
        self.replay_remaining = 0;

        let outstanding = self.client.outstanding();
        if outstanding > 0 {
            debug!(device_id = %self.device_id, outstanding, "Failing outstanding requests");
        }

        for waiter in self.client.disconnect() {
            self.fail(waiter, OwletError::Disconnected);
        }
        for command in std::mem::take(&mut self.queued) {
            reject(command, OwletError::Disconnected);
        }
        for timer in self.polls.values_mut() {
            timer.in_flight = false;
        }

        // The transport keeps retrying until the session closes
        self.set_link(LinkState::Connecting);
        if std::mem::take(&mut self.announced) {
            self.emit(SessionEvent::ConnectionChanged(false));
        }
    }

    /// Give up on the current link and let the transport open a new one
    fn cycle_link(&mut self, reason: &str) {
        warn!(device_id = %self.device_id, reason, "Resetting link");
        self.on_link_lost();
        self.transport.reconnect();
    }

    fn handle_client_event(&mut self, event: ClientEvent<Waiter>) {
        match event {
            ClientEvent::Completed { token, result } => self.complete(token, result),
            ClientEvent::Notification(notification) => self.handle_notification(notification),
            ClientEvent::CodecError { consecutive, error } => {
                debug!(device_id = %self.device_id, consecutive, %error, "Codec error");
                if consecutive >= self.config.max_codec_errors {
                    self.cycle_link("serial stream desynchronised");
                }
            }
        }
    }

    fn handle_notification(&mut self, notification: Notification) {
        let pin = match &notification {
            Notification::PinChanged { pin, .. } | Notification::PinStateChanged { pin, .. } => *pin,
        };
        let Some(mode) = self.pin_mode(pin) else {
            debug!(device_id = %self.device_id, pin, "Notification for unknown pin dropped");
            return;
        };
        if self.settled_mode(pin) != Some(mode) {
            debug!(device_id = %self.device_id, pin, "Notification during reconfiguration dropped");
            return;
        }

        let value = match (notification, mode) {
            (
                Notification::PinChanged { value, .. },
                PinMode::DigitalInput | PinMode::DigitalOutput,
            ) => Some(PinValue::Digital(value != 0)),
            (Notification::PinChanged { value, .. }, PinMode::AnalogInput) => {
                Some(PinValue::Analog(u32::from(value)))
            }
            (
                Notification::PinStateChanged { state, .. },
                PinMode::DigitalInput | PinMode::DigitalOutput,
            ) => state.power.map(PinValue::Digital),
            (Notification::PinStateChanged { state, .. }, PinMode::Ws2812) => {
                let mut merged = match self.shared.read().pins.get(&pin).and_then(|p| p.value) {
                    Some(PinValue::Led(current)) => current,
                    _ => Default::default(),
                };
                merged.merge(&state);
                Some(PinValue::Led(merged))
            }
            _ => None,
        };

        match value {
            Some(value) => self.emit_pin_changed(pin, value),
            None => debug!(device_id = %self.device_id, pin, %mode, "Notification does not fit pin mode"),
        }
    }

    // =========================================================================
    // Handshake, replay, ready
    // =========================================================================

    fn begin_replay(&mut self) {
        let configs: Vec<(u8, PinConfig)> = self
            .shared
            .read()
            .pins
            .values()
            .map(|p| (p.id, p.config.clone()))
            .collect();

        if configs.is_empty() {
            self.on_ready();
            return;
        }

        debug!(device_id = %self.device_id, pins = configs.len(), "Replaying pin configuration");
        // Count first so synchronous rejections cannot finish the replay early
        self.replay_remaining = configs.len();
        for (pin, config) in configs {
            let mode = config.mode();
            self.submit(Request::ConfigurePin { pin, config }, Waiter::Replay { pin, mode });
        }
    }

    fn on_ready(&mut self) {
        if self.client.state() != ClientState::Ready {
            return;
        }
        self.set_link(LinkState::Ready);
        self.announced = true;
        info!(
            device_id = %self.device_id,
            firmware = self.client.firmware_version().unwrap_or("-"),
            "Device ready"
        );
        self.emit(SessionEvent::ConnectionChanged(true));

        let now = Instant::now();
        for timer in self.polls.values_mut() {
            timer.next = now + timer.interval;
            timer.in_flight = false;
        }

        while let Some(command) = self.queued.pop_front() {
            self.execute(command);
        }

        if self.client.protocol() == Protocol::Serial && self.config.sync_inputs_on_ready {
            let inputs: Vec<u8> = self
                .shared
                .read()
                .pins
                .values()
                .filter(|p| p.mode == PinMode::DigitalInput)
                .map(|p| p.id)
                .collect();
            for pin in inputs {
                self.submit(Request::ReadDigital { pin }, Waiter::InputSync { pin });
            }
        }
    }

    // =========================================================================
    // Completions
    // =========================================================================

    /// Fail a waiter without any state transition
    fn fail(&mut self, waiter: Waiter, error: OwletError) {
        match waiter {
            Waiter::Configure { reply, .. } | Waiter::Write { reply, .. } => {
                let _ = reply.send(Err(error));
            }
            Waiter::Read { reply, .. } => {
                let _ = reply.send(Err(error));
            }
            Waiter::Poll { pin } => {
                if let Some(timer) = self.polls.get_mut(&pin) {
                    timer.in_flight = false;
                }
            }
            Waiter::Handshake
            | Waiter::PlatformInfo
            | Waiter::Replay { .. }
            | Waiter::InputSync { .. } => {}
        }
    }

    fn complete(&mut self, waiter: Waiter, result: OwletResult<Reply>) {
        match waiter {
            Waiter::Handshake => match result {
                Ok(Reply::Firmware(version)) => {
                    info!(device_id = %self.device_id, %version, "Firmware handshake complete");
                    self.shared.write().firmware_version = Some(version);
                    self.begin_replay();
                }
                Ok(other) => {
                    warn!(device_id = %self.device_id, reply = ?other, "Unexpected handshake reply");
                    self.cycle_link("handshake failed");
                }
                Err(e) => {
                    warn!(device_id = %self.device_id, error = %e, "Firmware handshake failed");
                    self.cycle_link("handshake failed");
                }
            },
            Waiter::PlatformInfo => match result {
                Ok(Reply::Info(info)) => {
                    debug!(device_id = %self.device_id, %info, "Platform information")
                }
                Ok(_) => {}
                Err(e) => debug!(device_id = %self.device_id, error = %e, "Platform information unavailable"),
            },
            Waiter::Replay { pin, mode } => {
                let applied = match result {
                    Ok(_) => mode,
                    Err(e) => {
                        warn!(device_id = %self.device_id, pin, %mode, error = %e, "Pin replay failed");
                        PinMode::Unconfigured
                    }
                };
                self.apply_mode(pin, applied);
                self.replay_remaining = self.replay_remaining.saturating_sub(1);
                if self.replay_remaining == 0 && self.link() == LinkState::Connected {
                    self.on_ready();
                }
            }
            Waiter::Configure { pin, mode, reply } => {
                let outcome = match result {
                    Ok(_) => {
                        debug!(device_id = %self.device_id, pin, %mode, "Pin configured");
                        self.apply_mode(pin, mode);
                        Ok(())
                    }
                    Err(e) => {
                        if !e.is_transient() {
                            warn!(device_id = %self.device_id, pin, %mode, error = %e, "Pin configuration rejected");
                            self.apply_mode(pin, PinMode::Unconfigured);
                        }
                        Err(e)
                    }
                };
                let _ = reply.send(outcome);
            }
            Waiter::Read { pin, reply } => {
                let outcome = result.and_then(reply_value).map(|value| {
                    if self.settled_mode(pin).is_some_and(|mode| holds(mode, &value)) {
                        self.update_pin(pin, |state| state.value = Some(value));
                    }
                    value
                });
                let _ = reply.send(outcome);
            }
            Waiter::Write { pin, value, reply } => {
                let settled = self.settled_mode(pin);
                let outcome = result.map(|_| {
                    if settled.is_some_and(|mode| value.writable_to(mode)) {
                        self.update_pin(pin, |state| {
                            state.value = Some(merge_value(state.value, value))
                        });
                    }
                });
                let _ = reply.send(outcome);
            }
            Waiter::Poll { pin } => {
                if let Some(timer) = self.polls.get_mut(&pin) {
                    timer.in_flight = false;
                }
                match result.and_then(reply_value) {
                    Ok(value @ PinValue::Analog(_))
                        if self.settled_mode(pin) == Some(PinMode::AnalogInput) =>
                    {
                        self.emit_pin_changed(pin, value)
                    }
                    Ok(other) => debug!(device_id = %self.device_id, pin, value = ?other, "Poll result dropped"),
                    Err(e) => debug!(device_id = %self.device_id, pin, error = %e, "Poll sample discarded"),
                }
            }
            Waiter::InputSync { pin } => match result.and_then(reply_value) {
                Ok(value @ PinValue::Digital(_))
                    if self.settled_mode(pin) == Some(PinMode::DigitalInput) =>
                {
                    self.emit_pin_changed(pin, value)
                }
                Ok(_) => {}
                Err(e) => debug!(device_id = %self.device_id, pin, error = %e, "Input sync failed"),
            },
        }
    }

    /// Record the mode the device acknowledged and (re)arm its poll timer
    fn apply_mode(&mut self, pin: u8, mode: PinMode) {
        let mut refresh = None;
        {
            let mut shared = self.shared.write();
            let Some(state) = shared.pins.get_mut(&pin) else {
                return;
            };
            if state.mode != mode {
                state.value = None;
            }
            state.mode = mode;
            if mode == PinMode::AnalogInput {
                refresh = state.config.refresh_rate_ms();
            }
        }

        match refresh {
            Some(ms) if ms > 0 => {
                let interval = Duration::from_millis(ms);
                self.polls.insert(
                    pin,
                    PollTimer {
                        interval,
                        next: Instant::now() + interval,
                        in_flight: false,
                    },
                );
            }
            _ => {
                self.polls.remove(&pin);
            }
        }
    }

    // =========================================================================
    // Commands
    // =========================================================================

    fn handle_command(&mut self, command: Command) {
        match command {
            // Protocol support does not depend on the link
            Command::Configure { pin, config, reply } => match self.check_supported(&config) {
                Ok(()) => self.admit(Command::Configure { pin, config, reply }),
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            Command::SetPollInterval {
                pin,
                interval,
                reply,
            } => {
                let _ = reply.send(self.set_poll_interval(pin, interval));
            }
            other => self.admit(other),
        }
    }

    fn admit(&mut self, command: Command) {
        match self.link() {
            LinkState::Ready => self.execute(command),
            LinkState::Connected => {
                trace!(device_id = %self.device_id, "Queueing command until ready");
                self.queued.push_back(command);
            }
            LinkState::Disconnected | LinkState::Connecting => {
                if let Command::Configure { pin, config, .. } = &command {
                    self.record_config(*pin, config.clone());
                }
                reject(command, OwletError::NotReady);
            }
        }
    }

    fn check_supported(&self, config: &PinConfig) -> OwletResult<()> {
        let mode = config.mode();
        let supported = match self.client.protocol() {
            Protocol::Serial => mode != PinMode::Ws2812,
            Protocol::Net => matches!(
                mode,
                PinMode::DigitalInput | PinMode::DigitalOutput | PinMode::Ws2812
            ),
        };
        if supported {
            Ok(())
        } else {
            Err(OwletError::Unsupported(format!(
                "{} is not available on {} owlets",
                mode,
                self.client.protocol()
            )))
        }
    }

    /// Store a configuration for replay and drop state tied to the old one
    fn record_config(&mut self, pin: u8, config: PinConfig) {
        self.polls.remove(&pin);
        let mut shared = self.shared.write();
        match shared.pins.get_mut(&pin) {
            Some(state) => {
                state.config = config;
                state.value = None;
            }
            None => {
                shared.pins.insert(pin, PinState::new(pin, config));
            }
        }
    }

    fn execute(&mut self, command: Command) {
        match command {
            Command::Configure { pin, config, reply } => {
                let mode = config.mode();
                self.record_config(pin, config.clone());
                self.submit(
                    Request::ConfigurePin { pin, config },
                    Waiter::Configure { pin, mode, reply },
                );
            }
            Command::Read { pin, reply } => self.execute_read(pin, reply),
            Command::Write { pin, value, reply } => self.execute_write(pin, value, reply),
            Command::SetPollInterval {
                pin,
                interval,
                reply,
            } => {
                let _ = reply.send(self.set_poll_interval(pin, interval));
            }
            Command::Close { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn execute_read(&mut self, pin: u8, reply: oneshot::Sender<OwletResult<PinValue>>) {
        let Some((mode, cached)) = self
            .shared
            .read()
            .pins
            .get(&pin)
            .map(|p| (p.mode, p.value))
        else {
            let _ = reply.send(Err(OwletError::UnknownPin(pin)));
            return;
        };

        let request = match (self.client.protocol(), mode) {
            (_, PinMode::Unconfigured) => {
                let _ = reply.send(Err(OwletError::ModeMismatch { pin, mode }));
                return;
            }
            (Protocol::Serial, PinMode::DigitalInput | PinMode::DigitalOutput) => {
                Request::ReadDigital { pin }
            }
            (Protocol::Serial, PinMode::AnalogInput) => Request::ReadAnalog { pin },
            // No read on the wire
            _ => {
                let _ = reply.send(cached.ok_or(OwletError::NoValue(pin)));
                return;
            }
        };
        self.submit(request, Waiter::Read { pin, reply });
    }

    fn execute_write(&mut self, pin: u8, value: PinValue, reply: oneshot::Sender<OwletResult<()>>) {
        let Some(mode) = self.pin_mode(pin) else {
            let _ = reply.send(Err(OwletError::UnknownPin(pin)));
            return;
        };
        if !value.writable_to(mode) {
            let _ = reply.send(Err(OwletError::ModeMismatch { pin, mode }));
            return;
        }

        let request = match value {
            PinValue::Digital(value) => Request::WriteDigital { pin, value },
            PinValue::Duty(duty) => Request::WriteAnalog { pin, duty },
            PinValue::Angle(angle) => Request::WriteServo { pin, angle },
            PinValue::Led(state) => Request::ControlPin { pin, state },
            PinValue::Analog(_) => {
                let _ = reply.send(Err(OwletError::ModeMismatch { pin, mode }));
                return;
            }
        };
        self.submit(request, Waiter::Write { pin, value, reply });
    }

    fn set_poll_interval(&mut self, pin: u8, interval: Duration) -> OwletResult<()> {
        let (config_mode, mode) = {
            let mut shared = self.shared.write();
            let state = shared.pins.get_mut(&pin).ok_or(OwletError::UnknownPin(pin))?;
            match &mut state.config {
                PinConfig::AnalogInput { refresh_rate_ms } => {
                    *refresh_rate_ms = interval.as_millis() as u64;
                }
                other => {
                    return Err(OwletError::ModeMismatch {
                        pin,
                        mode: other.mode(),
                    })
                }
            }
            (state.config.mode(), state.mode)
        };
        debug!(device_id = %self.device_id, pin, interval_ms = interval.as_millis() as u64, "Poll interval");

        if interval.is_zero() {
            self.polls.remove(&pin);
        } else if mode == config_mode {
            let next = Instant::now() + interval;
            let timer = self.polls.entry(pin).or_insert(PollTimer {
                interval,
                next,
                in_flight: false,
            });
            timer.interval = interval;
            timer.next = next;
        }
        Ok(())
    }

    // =========================================================================
    // Timers
    // =========================================================================

    fn handle_timers(&mut self, now: Instant) {
        for (waiter, error) in self.client.expire(now) {
            self.complete(waiter, Err(error));
        }

        if self.link() != LinkState::Ready {
            return;
        }

        let mut due: Vec<u8> = Vec::new();
        for (pin, timer) in self.polls.iter_mut() {
            if timer.next > now {
                continue;
            }
            timer.next = now + timer.interval;
            if timer.in_flight {
                trace!(device_id = %self.device_id, pin, "Poll coalesced");
                continue;
            }
            timer.in_flight = true;
            due.push(*pin);
        }
        due.sort_unstable();
        for pin in due {
            self.submit(Request::ReadAnalog { pin }, Waiter::Poll { pin });
        }
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    async fn shutdown(&mut self) {
        debug!(device_id = %self.device_id, "Closing session");
        self.polls.clear();
        self.outbox.clear();
        for waiter in self.client.disconnect() {
            self.fail(waiter, OwletError::Disconnected);
        }
        for command in std::mem::take(&mut self.queued) {
            reject(command, OwletError::Disconnected);
        }

        self.transport.close().await;
        self.set_link(LinkState::Disconnected);
        if std::mem::take(&mut self.announced) {
            self.emit(SessionEvent::ConnectionChanged(false));
        }
        info!(device_id = %self.device_id, "Session closed");
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn reject(command: Command, error: OwletError) {
    match command {
        Command::Configure { reply, .. }
        | Command::Write { reply, .. }
        | Command::SetPollInterval { reply, .. } => {
            let _ = reply.send(Err(error));
        }
        Command::Read { reply, .. } => {
            let _ = reply.send(Err(error));
        }
        Command::Close { reply } => {
            let _ = reply.send(());
        }
    }
}

fn reply_value(reply: Reply) -> OwletResult<PinValue> {
    match reply {
        Reply::Digital(value) => Ok(PinValue::Digital(value)),
        Reply::Analog(value) => Ok(PinValue::Analog(value)),
        other => Err(OwletError::InvalidResponse(format!(
            "Expected a pin value, got {:?}",
            other
        ))),
    }
}

/// Whether a read value belongs to a pin in `mode`
fn holds(mode: PinMode, value: &PinValue) -> bool {
    matches!(
        (mode, value),
        (PinMode::DigitalInput | PinMode::DigitalOutput, PinValue::Digital(_))
            | (PinMode::AnalogInput, PinValue::Analog(_))
    )
}

/// Cached value after a successful write
fn merge_value(current: Option<PinValue>, written: PinValue) -> PinValue {
    match (current, written) {
        (Some(PinValue::Led(mut state)), PinValue::Led(update)) => {
            state.merge(&update);
            PinValue::Led(state)
        }
        (_, PinValue::Led(update)) => {
            let mut state = crate::pin::LedState::default();
            state.merge(&update);
            PinValue::Led(state)
        }
        (_, value) => value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use crate::pin::LedState;
    use crate::session::Session;
    use crate::transport::TransportError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Transport whose events the test emits by hand
    struct ScriptedTransport {
        events: broadcast::Sender<TransportEvent>,
        writes: mpsc::UnboundedSender<Vec<u8>>,
        reconnects: AtomicUsize,
    }

    impl ScriptedTransport {
        fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Vec<u8>>) {
            let (events, _) = broadcast::channel(4);
            let (writes, written) = mpsc::unbounded_channel();
            let transport = Arc::new(Self {
                events,
                writes,
                reconnects: AtomicUsize::new(0),
            });
            (transport, written)
        }

        fn emit(&self, event: TransportEvent) {
            let _ = self.events.send(event);
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        fn open(&self) {}

        async fn close(&self) {}

        async fn write(&self, bytes: &[u8]) -> Result<(), TransportError> {
            let _ = self.writes.send(bytes.to_vec());
            Ok(())
        }

        fn reconnect(&self) {
            self.reconnects.fetch_add(1, Ordering::SeqCst);
        }

        fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
            self.events.subscribe()
        }

        fn is_connected(&self) -> bool {
            true
        }

        fn describe(&self) -> String {
            "scripted".to_string()
        }
    }

    /// Ready serial session with one ConfigurePin outstanding
    async fn session_with_outstanding_configure() -> (
        Arc<ScriptedTransport>,
        broadcast::Receiver<SessionEvent>,
        Session,
        tokio::task::JoinHandle<OwletResult<()>>,
        mpsc::UnboundedReceiver<Vec<u8>>,
    ) {
        let (transport, mut written) = ScriptedTransport::new();
        let (session, mut events) = Session::spawn(
            "dev".to_string(),
            Protocol::Serial,
            transport.clone(),
            SessionConfig::default(),
        );
        while transport.events.receiver_count() == 0 {
            tokio::task::yield_now().await;
        }

        transport.emit(TransportEvent::Connected);
        written.recv().await.unwrap();
        // seq 1, GetFirmwareVersion
        transport.emit(TransportEvent::Bytes(codec::encode(&[1, 0x00, b'1', b'.', b'0'])));
        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::ConnectionChanged(true)
        );

        let configure = tokio::spawn({
            let session = session.clone();
            async move { session.configure_pin(4, PinConfig::DigitalOutput).await }
        });
        written.recv().await.unwrap();
        (transport, events, session, configure, written)
    }

    #[tokio::test]
    async fn test_lagged_transport_events_reset_link() {
        let (transport, mut events, session, configure, _written) =
            session_with_outstanding_configure().await;

        // The Disconnected is pushed out of the channel before the actor sees it
        transport.emit(TransportEvent::Disconnected);
        for _ in 0..8 {
            transport.emit(TransportEvent::Bytes(Vec::new()));
        }

        assert!(matches!(
            configure.await.unwrap(),
            Err(OwletError::Disconnected)
        ));
        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::ConnectionChanged(false)
        );
        assert_eq!(transport.reconnects.load(Ordering::SeqCst), 1);
        assert_eq!(session.link_state(), LinkState::Connecting);
    }

    #[tokio::test]
    async fn test_connected_without_disconnect_starts_over() {
        let (transport, mut events, session, configure, mut written) =
            session_with_outstanding_configure().await;

        transport.emit(TransportEvent::Connected);
        assert!(matches!(
            configure.await.unwrap(),
            Err(OwletError::Disconnected)
        ));
        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::ConnectionChanged(false)
        );

        // A fresh handshake on the new link
        let handshake = written.recv().await.unwrap();
        let codec::Decoded::Frame { payload, .. } = codec::decode(&handshake) else {
            panic!("Expected a frame");
        };
        assert_eq!(payload, vec![3, 0x00]);
        assert_eq!(session.link_state(), LinkState::Connected);
        assert_eq!(session.pin(4).unwrap().config, PinConfig::DigitalOutput);
    }

    #[test]
    fn test_merge_value_masks_and_overlays() {
        let current = Some(PinValue::Led(LedState {
            power: Some(true),
            color: Some(0x0000FF),
            ..Default::default()
        }));
        let written = PinValue::Led(LedState {
            color: Some(0xAB12_3456),
            ..Default::default()
        });
        assert_eq!(
            merge_value(current, written),
            PinValue::Led(LedState {
                power: Some(true),
                color: Some(0x12_3456),
                ..Default::default()
            })
        );
        assert_eq!(
            merge_value(Some(PinValue::Digital(false)), PinValue::Digital(true)),
            PinValue::Digital(true)
        );
    }

    #[test]
    fn test_reply_value_shapes() {
        assert_eq!(reply_value(Reply::Analog(7)).unwrap(), PinValue::Analog(7));
        assert!(matches!(
            reply_value(Reply::Ack),
            Err(OwletError::InvalidResponse(_))
        ));
        assert!(holds(PinMode::DigitalOutput, &PinValue::Digital(true)));
        assert!(!holds(PinMode::AnalogOutput, &PinValue::Analog(3)));
    }
}
