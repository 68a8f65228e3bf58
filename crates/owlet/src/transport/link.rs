//! Reconnecting link transport
//!
//! A [`LinkTransport`] owns a worker task that keeps one stream open: it asks
//! its [`Connector`] for a stream, pumps received bytes into the event
//! channel until the stream fails, then waits out the backoff and tries
//! again. TCP, serial and mock transports differ only in their connector.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{Transport, TransportError, TransportEvent};
use crate::config::BackoffConfig;

const EVENT_CHANNEL_CAPACITY: usize = 1024;
const READ_BUFFER_SIZE: usize = 4096;

/// Opens one stream to the device
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    async fn connect(&self) -> Result<Self::Stream, TransportError>;

    fn describe(&self) -> String;
}

/// Exponential backoff between connect attempts
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    factor: u32,
    next: Duration,
}

impl Backoff {
    pub fn new(config: &BackoffConfig) -> Self {
        let initial = Duration::from_millis(config.initial_ms);
        Self {
            initial,
            max: Duration::from_millis(config.max_ms.max(config.initial_ms)),
            factor: config.factor.max(1),
            next: initial,
        }
    }

    /// Delay before the next attempt; grows until the cap
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * self.factor).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.next = self.initial;
    }
}

struct LinkShared<C: Connector> {
    connector: C,
    backoff: BackoffConfig,
    events: broadcast::Sender<TransportEvent>,
    writer: tokio::sync::Mutex<Option<WriteHalf<C::Stream>>>,
    connected: AtomicBool,
    /// Wakes the reader of the current link so it drops the stream
    drop_link: Mutex<Option<Arc<Notify>>>,
}

impl<C: Connector> LinkShared<C> {
    fn emit(&self, event: TransportEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn request_drop(&self) {
        if let Some(notify) = self.drop_link.lock().as_ref() {
            notify.notify_one();
        }
    }

    async fn run(self: Arc<Self>) {
        let mut backoff = Backoff::new(&self.backoff);
        let endpoint = self.connector.describe();

        loop {
            match self.connector.connect().await {
                Ok(stream) => {
                    backoff.reset();
                    let (mut reader, writer) = tokio::io::split(stream);
                    let notify = Arc::new(Notify::new());
                    *self.writer.lock().await = Some(writer);
                    *self.drop_link.lock() = Some(notify.clone());
                    self.connected.store(true, Ordering::SeqCst);

                    info!(%endpoint, "Link up");
                    self.emit(TransportEvent::Connected);

                    let failure = self.pump(&mut reader, &notify).await;

                    self.connected.store(false, Ordering::SeqCst);
                    self.drop_link.lock().take();
                    self.writer.lock().await.take();

                    if let Some(err) = failure {
                        warn!(%endpoint, error = %err, "Link failed");
                        self.emit(TransportEvent::Error(err));
                    } else {
                        info!(%endpoint, "Link dropped");
                    }
                    self.emit(TransportEvent::Disconnected);
                }
                Err(err) => {
                    debug!(%endpoint, error = %err, "Connect attempt failed");
                    self.emit(TransportEvent::Error(err));
                }
            }

            let delay = backoff.next_delay();
            debug!(%endpoint, delay_ms = delay.as_millis() as u64, "Reconnecting after backoff");
            tokio::time::sleep(delay).await;
        }
    }

    /// Forward received bytes until the stream fails or a drop is requested
    async fn pump(
        &self,
        reader: &mut ReadHalf<C::Stream>,
        drop_link: &Notify,
    ) -> Option<TransportError> {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            tokio::select! {
                _ = drop_link.notified() => return None,
                read = reader.read(&mut buf) => match read {
                    Ok(0) => return Some(TransportError::ConnectionClosed),
                    Ok(n) => self.emit(TransportEvent::Bytes(buf[..n].to_vec())),
                    Err(e) => return Some(TransportError::ReceiveFailed(e.to_string())),
                },
            }
        }
    }
}

/// Transport that keeps a connector's stream open
pub struct LinkTransport<C: Connector> {
    shared: Arc<LinkShared<C>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<C: Connector> LinkTransport<C> {
    pub fn new(connector: C, backoff: BackoffConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            shared: Arc::new(LinkShared {
                connector,
                backoff,
                events,
                writer: tokio::sync::Mutex::new(None),
                connected: AtomicBool::new(false),
                drop_link: Mutex::new(None),
            }),
            worker: Mutex::new(None),
        }
    }
}

#[async_trait]
impl<C: Connector> Transport for LinkTransport<C> {
    fn open(&self) {
        let mut worker = self.worker.lock();
        if worker.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        *worker = Some(tokio::spawn(self.shared.clone().run()));
    }

    async fn close(&self) {
        let handle = self.worker.lock().take();
        let Some(handle) = handle else {
            return;
        };
        handle.abort();
        let _ = handle.await;

        self.shared.drop_link.lock().take();
        if let Some(mut writer) = self.shared.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        if self.shared.connected.swap(false, Ordering::SeqCst) {
            self.shared.emit(TransportEvent::Disconnected);
        }
        debug!(endpoint = %self.shared.connector.describe(), "Transport closed");
    }

    async fn write(&self, bytes: &[u8]) -> Result<(), TransportError> {
        let mut guard = self.shared.writer.lock().await;
        let writer = guard.as_mut().ok_or(TransportError::NotConnected)?;

        let result = match writer.write_all(bytes).await {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            guard.take();
            drop(guard);
            let err = TransportError::SendFailed(e.to_string());
            self.shared.emit(TransportEvent::Error(err.clone()));
            self.shared.request_drop();
            return Err(err);
        }
        Ok(())
    }

    fn reconnect(&self) {
        info!(endpoint = %self.shared.connector.describe(), "Cycling link");
        self.shared.request_drop();
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.shared.events.subscribe()
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    fn describe(&self) -> String {
        self.shared.connector.describe()
    }
}

impl<C: Connector> Drop for LinkTransport<C> {
    fn drop(&mut self) {
        if let Some(handle) = self.worker.get_mut().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(&BackoffConfig::default());
        let delays: Vec<u64> = (0..7).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_backoff_degenerate_config() {
        let mut backoff = Backoff::new(&BackoffConfig {
            initial_ms: 500,
            max_ms: 100,
            factor: 0,
        });
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
    }
}
