//! Serial port connector for microcontroller owlets

use std::time::Duration;

use async_trait::async_trait;
use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt, SerialStream, StopBits};
use tracing::debug;

use super::link::Connector;
use super::TransportError;
use crate::config::SerialConfig;

pub struct SerialConnector {
    path: String,
    baud: u32,
    settle: Duration,
}

impl SerialConnector {
    pub fn new(config: &SerialConfig) -> Self {
        Self {
            path: config.path.clone(),
            baud: config.baud,
            settle: Duration::from_millis(config.settle_ms),
        }
    }
}

#[async_trait]
impl Connector for SerialConnector {
    type Stream = SerialStream;

    async fn connect(&self) -> Result<SerialStream, TransportError> {
        let port = tokio_serial::new(&self.path, self.baud)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .open_native_async()
            .map_err(|e| TransportError::ConnectionFailed(format!("{}: {}", self.path, e)))?;

        // Opening asserts DTR, which resets most Arduino boards
        debug!(path = %self.path, settle_ms = self.settle.as_millis() as u64, "Waiting for board");
        tokio::time::sleep(self.settle).await;
        Ok(port)
    }

    fn describe(&self) -> String {
        format!("serial://{}@{}", self.path, self.baud)
    }
}
