//! Transport trait and events

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::TransportError;

/// Lifecycle and data events of a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Link is up and writable
    Connected,
    /// Link went down (always follows `Connected`)
    Disconnected,
    /// Connect attempt or established link failed
    Error(TransportError),
    /// Bytes received, in arrival order
    Bytes(Vec<u8>),
}

/// Bidirectional byte channel to one device
///
/// Implementations keep the link up on their own once opened: a dropped link
/// is reported as `Error` + `Disconnected` and reopened with backoff until
/// [`Transport::close`] is called.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start connecting; a no-op while already open
    ///
    /// Subscribe before opening, `Connected` may fire right away.
    fn open(&self);

    /// Tear the link down and stop reconnecting
    async fn close(&self);

    /// Send bytes on the current link
    ///
    /// Fails with `NotConnected` while the link is down. A failed write
    /// drops the link.
    async fn write(&self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Drop the current link and let the reconnect loop open a new one
    fn reconnect(&self);

    /// Subscribe to transport events
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;

    /// Check if a link is currently up
    fn is_connected(&self) -> bool;

    /// Human-readable endpoint, for logs
    fn describe(&self) -> String;
}
