//! Transport layer for owlet communication
//!
//! This module provides byte channels to owlets:
//! - TCP link for network owlets
//! - Serial link for microcontroller boards (feature `serial`)
//! - Mock link over in-memory pipes for testing
//!
//! All three are a [`LinkTransport`] over a different [`Connector`]; the
//! link keeps itself up with exponential backoff once opened.

mod adapter;
pub mod error;
pub mod link;
pub mod mock;
pub mod tcp;

#[cfg(feature = "serial")]
pub mod serial;

pub use adapter::{Transport, TransportEvent};
pub use error::TransportError;
pub use link::{Backoff, Connector, LinkTransport};

use std::sync::Arc;

use crate::config::{BackoffConfig, TransportDescriptor};

/// Create a transport based on its descriptor
pub fn create_transport(
    descriptor: &TransportDescriptor,
    backoff: &BackoffConfig,
) -> Result<Arc<dyn Transport>, TransportError> {
    match descriptor {
        TransportDescriptor::Tcp(cfg) => {
            if cfg.host.is_empty() {
                return Err(TransportError::InvalidConfig("empty TCP host".to_string()));
            }
            let connector = tcp::TcpConnector::new(cfg);
            Ok(Arc::new(LinkTransport::new(connector, backoff.clone())))
        }
        #[cfg(feature = "serial")]
        TransportDescriptor::Serial(cfg) => {
            if cfg.path.is_empty() {
                return Err(TransportError::InvalidConfig("empty serial path".to_string()));
            }
            let connector = serial::SerialConnector::new(cfg);
            Ok(Arc::new(LinkTransport::new(connector, backoff.clone())))
        }
        #[cfg(not(feature = "serial"))]
        TransportDescriptor::Serial(_) => Err(TransportError::Unsupported(
            "Serial ports require the 'serial' feature".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_empty_host() {
        let desc = TransportDescriptor::tcp("", 5555);
        match create_transport(&desc, &BackoffConfig::default()) {
            Err(TransportError::InvalidConfig(_)) => {}
            Err(other) => panic!("Expected InvalidConfig, got {:?}", other),
            Ok(_) => panic!("Expected InvalidConfig, got a transport"),
        }
    }

    #[tokio::test]
    async fn test_tcp_transport_describes_endpoint() {
        let desc = TransportDescriptor::tcp("192.168.1.20", 5555);
        let transport = create_transport(&desc, &BackoffConfig::default()).unwrap();
        assert_eq!(transport.describe(), "tcp://192.168.1.20:5555");
        assert!(!transport.is_connected());
    }
}
