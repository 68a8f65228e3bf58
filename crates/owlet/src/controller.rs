//! Controller façade
//!
//! Creates and closes sessions keyed by device id, routes pin operations to
//! them and merges their events into one stream tagged with the device id.
//! It also keeps `cachedIP` current for network owlets.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{Protocol, SessionConfig, TransportDescriptor};
use crate::discovery::{self, ServiceEntry};
use crate::error::{OwletError, OwletResult};
use crate::pin::{PinConfig, PinState, PinValue};
use crate::session::{Session, SessionEvent};
use crate::settings::{SettingsStore, CACHED_IP_KEY};
use crate::transport::{create_transport, Transport};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Session event tagged with its device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerEvent {
    pub device_id: String,
    pub event: SessionEvent,
}

struct ManagedSession {
    session: Session,
    stop: oneshot::Sender<()>,
    forwarder: JoinHandle<()>,
}

/// Owns every open session
pub struct Controller {
    config: SessionConfig,
    settings: Arc<dyn SettingsStore>,
    sessions: RwLock<HashMap<String, ManagedSession>>,
    events: broadcast::Sender<ControllerEvent>,
}

impl Controller {
    pub fn new(settings: Arc<dyn SettingsStore>, config: SessionConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            settings,
            sessions: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Subscribe to events of all sessions
    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.events.subscribe()
    }

    pub fn settings(&self) -> &Arc<dyn SettingsStore> {
        &self.settings
    }

    /// Open a session for a device
    pub fn open_session(
        &self,
        device_id: &str,
        descriptor: &TransportDescriptor,
    ) -> OwletResult<Session> {
        self.ensure_vacant(device_id)?;
        let transport = create_transport(descriptor, &self.config.backoff)?;
        let cached_host = match descriptor {
            TransportDescriptor::Tcp(cfg) => Some(cfg.host.clone()),
            TransportDescriptor::Serial(_) => None,
        };
        self.spawn_session(device_id, descriptor.protocol(), transport, cached_host)
    }

    /// Open a session over a caller-supplied transport
    ///
    /// `host` is stored as `cachedIP` whenever a network session becomes ready.
    pub fn open_session_with_transport(
        &self,
        device_id: &str,
        protocol: Protocol,
        transport: Arc<dyn Transport>,
        host: Option<String>,
    ) -> OwletResult<Session> {
        self.ensure_vacant(device_id)?;
        self.spawn_session(device_id, protocol, transport, host)
    }

    fn ensure_vacant(&self, device_id: &str) -> OwletResult<()> {
        if self.sessions.read().contains_key(device_id) {
            return Err(OwletError::Config(format!(
                "Session for {} is already open",
                device_id
            )));
        }
        Ok(())
    }

    fn spawn_session(
        &self,
        device_id: &str,
        protocol: Protocol,
        transport: Arc<dyn Transport>,
        host: Option<String>,
    ) -> OwletResult<Session> {
        let (session, session_events) =
            Session::spawn(device_id.to_string(), protocol, transport, self.config.clone());

        let cached_host = match protocol {
            Protocol::Net => host,
            Protocol::Serial => None,
        };
        let (stop, stop_rx) = oneshot::channel();
        let forwarder = tokio::spawn(forward_events(
            device_id.to_string(),
            session_events,
            stop_rx,
            self.events.clone(),
            self.settings.clone(),
            cached_host,
        ));

        let managed = ManagedSession {
            session: session.clone(),
            stop,
            forwarder,
        };

        let mut sessions = self.sessions.write();
        if sessions.contains_key(device_id) {
            // Lost a race with another open; drop ours
            drop(sessions);
            managed.forwarder.abort();
            return Err(OwletError::Config(format!(
                "Session for {} is already open",
                device_id
            )));
        }
        sessions.insert(device_id.to_string(), managed);
        info!(%device_id, %protocol, endpoint = session.endpoint(), "Session opened");
        Ok(session)
    }

    /// Close a session and wait until its transport is released
    pub async fn close_session(&self, device_id: &str) -> OwletResult<()> {
        let managed = self
            .sessions
            .write()
            .remove(device_id)
            .ok_or_else(|| OwletError::NotFound(format!("Session {}", device_id)))?;

        managed.session.close().await;
        let _ = managed.stop.send(());
        let _ = managed.forwarder.await;
        info!(%device_id, "Session removed");
        Ok(())
    }

    /// Close the device's session, if open, and forget its stored settings
    pub async fn remove_device(&self, device_id: &str) -> OwletResult<()> {
        match self.close_session(device_id).await {
            Ok(()) | Err(OwletError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        self.settings.remove_device(device_id)?;
        info!(%device_id, "Device removed");
        Ok(())
    }

    /// Close every session
    pub async fn shutdown(&self) {
        for device_id in self.device_ids() {
            let _ = self.close_session(&device_id).await;
        }
    }

    pub fn session(&self, device_id: &str) -> OwletResult<Session> {
        self.sessions
            .read()
            .get(device_id)
            .map(|managed| managed.session.clone())
            .ok_or_else(|| OwletError::NotFound(format!("Session {}", device_id)))
    }

    /// Open device ids, sorted
    pub fn device_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn configure_pin(
        &self,
        device_id: &str,
        pin: u8,
        config: PinConfig,
    ) -> OwletResult<()> {
        self.session(device_id)?.configure_pin(pin, config).await
    }

    pub async fn read_pin(&self, device_id: &str, pin: u8) -> OwletResult<PinValue> {
        self.session(device_id)?.read_pin(pin).await
    }

    pub async fn write_pin(&self, device_id: &str, pin: u8, value: PinValue) -> OwletResult<()> {
        self.session(device_id)?.write_pin(pin, value).await
    }

    pub async fn set_poll_interval(
        &self,
        device_id: &str,
        pin: u8,
        interval: Duration,
    ) -> OwletResult<()> {
        self.session(device_id)?
            .set_poll_interval(pin, interval)
            .await
    }

    /// Cached pins of a device
    pub fn pins(&self, device_id: &str) -> OwletResult<Vec<PinState>> {
        Ok(self.session(device_id)?.pins())
    }

    /// Pick the endpoint of a network owlet from discovered services or the cache
    pub fn resolve_owlet(
        &self,
        owlet_id: &str,
        device_id: &str,
        entries: &[ServiceEntry],
    ) -> OwletResult<TransportDescriptor> {
        discovery::resolve_owlet(owlet_id, device_id, entries, self.settings.as_ref())
    }
}

async fn forward_events(
    device_id: String,
    mut session_events: broadcast::Receiver<SessionEvent>,
    mut stop: oneshot::Receiver<()>,
    events: broadcast::Sender<ControllerEvent>,
    settings: Arc<dyn SettingsStore>,
    cached_host: Option<String>,
) {
    let forward = |event: SessionEvent| {
        if event == SessionEvent::ConnectionChanged(true) {
            if let Some(host) = &cached_host {
                match settings.set(&device_id, CACHED_IP_KEY, host) {
                    Ok(()) => debug!(%device_id, %host, "Cached owlet address"),
                    Err(e) => warn!(%device_id, error = %e, "Failed to cache owlet address"),
                }
            }
        }
        let _ = events.send(ControllerEvent {
            device_id: device_id.clone(),
            event,
        });
    };

    loop {
        tokio::select! {
            _ = &mut stop => {
                // Deliver what the session published before it closed
                loop {
                    match session_events.try_recv() {
                        Ok(event) => forward(event),
                        Err(TryRecvError::Lagged(_)) => continue,
                        Err(_) => return,
                    }
                }
            }
            event = session_events.recv() => match event {
                Ok(event) => forward(event),
                Err(RecvError::Lagged(n)) => {
                    warn!(%device_id, skipped = n, "Session events lagged");
                }
                Err(RecvError::Closed) => return,
            },
        }
    }
}
