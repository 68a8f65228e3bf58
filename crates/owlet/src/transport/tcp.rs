//! TCP connector for network owlets

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;

use super::link::Connector;
use super::TransportError;
use crate::config::TcpConfig;

pub struct TcpConnector {
    host: String,
    port: u16,
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(config: &TcpConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&self) -> Result<TcpStream, TransportError> {
        let addr = format!("{}:{}", self.host, self.port);
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| TransportError::Timeout(format!("Connecting to {}", addr)))?
            .map_err(|e| TransportError::ConnectionFailed(format!("{}: {}", addr, e)))?;

        stream
            .set_nodelay(true)
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        Ok(stream)
    }

    fn describe(&self) -> String {
        format!("tcp://{}:{}", self.host, self.port)
    }
}
