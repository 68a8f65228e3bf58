//! In-memory connector for tests
//!
//! Every successful connect creates a `tokio::io::duplex` pipe and hands the
//! far end to the [`MockRemote`], which plays the device.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;

use super::link::{Connector, LinkTransport};
use super::{Transport, TransportError};
use crate::config::BackoffConfig;

const PIPE_CAPACITY: usize = 64 * 1024;

pub struct MockConnector {
    peers: mpsc::UnboundedSender<DuplexStream>,
    refuse: Arc<AtomicBool>,
    name: String,
}

/// Device side of a mock transport
pub struct MockRemote {
    peers: mpsc::UnboundedReceiver<DuplexStream>,
    refuse: Arc<AtomicBool>,
}

impl MockRemote {
    /// Wait for the next link the transport opens
    pub async fn accept(&mut self) -> Option<DuplexStream> {
        self.peers.recv().await
    }

    /// Make subsequent connect attempts fail
    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }
}

/// Create a connected connector/remote pair
pub fn mock_pair(name: impl Into<String>) -> (MockConnector, MockRemote) {
    let (tx, rx) = mpsc::unbounded_channel();
    let refuse = Arc::new(AtomicBool::new(false));
    (
        MockConnector {
            peers: tx,
            refuse: refuse.clone(),
            name: name.into(),
        },
        MockRemote { peers: rx, refuse },
    )
}

/// Link transport over the mock connector
pub fn mock_transport(
    name: impl Into<String>,
    backoff: BackoffConfig,
) -> (Arc<dyn Transport>, MockRemote) {
    let (connector, remote) = mock_pair(name);
    (Arc::new(LinkTransport::new(connector, backoff)), remote)
}

#[async_trait]
impl Connector for MockConnector {
    type Stream = DuplexStream;

    async fn connect(&self) -> Result<DuplexStream, TransportError> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionFailed(format!(
                "{}: connection refused",
                self.name
            )));
        }
        let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
        self.peers
            .send(remote)
            .map_err(|_| TransportError::ConnectionFailed(format!("{}: remote gone", self.name)))?;
        Ok(local)
    }

    fn describe(&self) -> String {
        format!("mock://{}", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportEvent;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test(start_paused = true)]
    async fn test_link_lifecycle_over_mock() {
        let (transport, mut remote) = mock_transport("dev", BackoffConfig::default());
        let mut events = transport.subscribe();
        assert_eq!(
            transport.write(b"x").await,
            Err(TransportError::NotConnected)
        );

        transport.open();
        let mut peer = remote.accept().await.unwrap();
        assert_eq!(events.recv().await.unwrap(), TransportEvent::Connected);
        assert!(transport.is_connected());

        transport.write(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        peer.write_all(b"world").await.unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            TransportEvent::Bytes(b"world".to_vec())
        );

        // Device hangs up: error, disconnect, then a fresh link after backoff
        drop(peer);
        assert_eq!(
            events.recv().await.unwrap(),
            TransportEvent::Error(TransportError::ConnectionClosed)
        );
        assert_eq!(events.recv().await.unwrap(), TransportEvent::Disconnected);
        let _peer = remote.accept().await.unwrap();
        assert_eq!(events.recv().await.unwrap(), TransportEvent::Connected);

        transport.close().await;
        assert_eq!(events.recv().await.unwrap(), TransportEvent::Disconnected);
        assert!(!transport.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_connect_retries() {
        let (transport, mut remote) = mock_transport("dev", BackoffConfig::default());
        let mut events = transport.subscribe();
        remote.refuse_connections(true);
        transport.open();

        match events.recv().await.unwrap() {
            TransportEvent::Error(TransportError::ConnectionFailed(_)) => {}
            other => panic!("Expected ConnectionFailed, got {:?}", other),
        }

        remote.refuse_connections(false);
        let _peer = remote.accept().await.unwrap();
        assert_eq!(events.recv().await.unwrap(), TransportEvent::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_cycles_link() {
        let (transport, mut remote) = mock_transport("dev", BackoffConfig::default());
        let mut events = transport.subscribe();
        transport.open();
        let _first = remote.accept().await.unwrap();
        assert_eq!(events.recv().await.unwrap(), TransportEvent::Connected);

        transport.reconnect();
        assert_eq!(events.recv().await.unwrap(), TransportEvent::Disconnected);
        let _second = remote.accept().await.unwrap();
        assert_eq!(events.recv().await.unwrap(), TransportEvent::Connected);
    }
}
