//! Scripted device peers for tests
//!
//! Pair these with [`crate::transport::mock`]: every link the mock transport
//! opens yields a `DuplexStream` that a [`SerialPeer`] or [`NetPeer`] drives
//! from the device side.

use std::io;

use serde_json::{json, Value};
use tokio::io::{
    AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf,
};

use crate::client::Opcode;
use crate::codec::{self, FrameDecoder, FrameEvent};

fn invalid(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

/// One decoded serial frame as the board sees it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialFrame {
    pub seq: u8,
    pub opcode: u8,
    pub data: Vec<u8>,
}

/// Board side of a serial link
pub struct SerialPeer {
    stream: DuplexStream,
    decoder: FrameDecoder,
}

impl SerialPeer {
    pub fn new(stream: DuplexStream) -> Self {
        Self {
            stream,
            decoder: FrameDecoder::new(),
        }
    }

    /// Next well-formed frame from the host
    pub async fn recv(&mut self) -> io::Result<SerialFrame> {
        let mut buf = [0u8; 1024];
        loop {
            while let Some(event) = self.decoder.next_frame() {
                match event {
                    FrameEvent::Frame(payload) if payload.len() >= 2 => {
                        return Ok(SerialFrame {
                            seq: payload[0],
                            opcode: payload[1],
                            data: payload[2..].to_vec(),
                        })
                    }
                    other => return Err(invalid(format!("Bad frame from host: {:?}", other))),
                }
            }
            let n = self.stream.read(&mut buf).await?;
            if n == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            self.decoder.feed(&buf[..n]);
        }
    }

    /// Next frame, which must carry `opcode`
    pub async fn expect(&mut self, opcode: Opcode) -> io::Result<SerialFrame> {
        let frame = self.recv().await?;
        if frame.opcode != opcode.as_u8() {
            return Err(invalid(format!(
                "Expected {:?}, got opcode 0x{:02X}",
                opcode, frame.opcode
            )));
        }
        Ok(frame)
    }

    /// Send a frame with an arbitrary payload
    pub async fn send(&mut self, payload: &[u8]) -> io::Result<()> {
        self.send_raw(&codec::encode(payload)).await
    }

    /// Send bytes as they are, without framing
    pub async fn send_raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await
    }

    /// Answer a request, echoing its sequence id and opcode
    pub async fn reply(&mut self, request: &SerialFrame, data: &[u8]) -> io::Result<()> {
        let mut payload = vec![request.seq, request.opcode];
        payload.extend_from_slice(data);
        self.send(&payload).await
    }

    /// Expect the firmware version request and answer it
    pub async fn handshake(&mut self, version: &str) -> io::Result<SerialFrame> {
        let request = self.expect(Opcode::GetFirmwareVersion).await?;
        self.reply(&request, version.as_bytes()).await?;
        Ok(request)
    }

    pub async fn notify_pin_changed(&mut self, pin: u8, value: u8) -> io::Result<()> {
        self.send(&[0x00, Opcode::PinChanged.as_u8(), pin, value])
            .await
    }

    /// Wait until the host closes the link
    pub async fn closed(&mut self) -> bool {
        let mut buf = [0u8; 256];
        loop {
            match self.stream.read(&mut buf).await {
                Ok(0) | Err(_) => return true,
                Ok(_) => continue,
            }
        }
    }
}

/// Device side of a network link
pub struct NetPeer {
    reader: BufReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
}

impl NetPeer {
    pub fn new(stream: DuplexStream) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }

    /// Next JSON message from the host
    pub async fn recv(&mut self) -> io::Result<Value> {
        let mut line = String::new();
        if self.reader.read_line(&mut line).await? == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        serde_json::from_str(&line).map_err(|e| invalid(format!("{}: {}", e, line)))
    }

    /// Next request, which must call `method`
    pub async fn expect(&mut self, method: &str) -> io::Result<Value> {
        let request = self.recv().await?;
        if request["method"] != method {
            return Err(invalid(format!("Expected {}, got {}", method, request)));
        }
        Ok(request)
    }

    pub async fn send(&mut self, message: &Value) -> io::Result<()> {
        self.send_line(&message.to_string()).await
    }

    /// Send one line as is
    pub async fn send_line(&mut self, line: &str) -> io::Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await
    }

    /// Reply to a request with `params`
    pub async fn reply(&mut self, request: &Value, params: Value) -> io::Result<()> {
        self.send(&json!({"id": request["id"], "params": params}))
            .await
    }

    /// Reply with a GPIO error string
    pub async fn reply_error(&mut self, request: &Value, error: &str) -> io::Result<()> {
        self.reply(request, json!({ "error": error })).await
    }

    pub async fn reply_ok(&mut self, request: &Value) -> io::Result<()> {
        self.reply_error(request, crate::client::net::GPIO_NO_ERROR)
            .await
    }

    pub async fn notify(&mut self, notification: &str, params: Value) -> io::Result<()> {
        self.send(&json!({"notification": notification, "params": params}))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_serial_peer_frames() {
        let (host, device) = tokio::io::duplex(1024);
        let mut host = SerialPeer::new(host);
        let mut device = SerialPeer::new(device);

        host.send(&[0x01, 0x00]).await.unwrap();
        let request = device.handshake("2.0.1").await.unwrap();
        assert_eq!(request.seq, 1);

        let reply = host.recv().await.unwrap();
        assert_eq!(reply.data, b"2.0.1".to_vec());
    }

    #[tokio::test]
    async fn test_net_peer_lines() {
        let (host, device) = tokio::io::duplex(1024);
        let mut host = NetPeer::new(host);
        let mut device = NetPeer::new(device);

        host.send(&json!({"id": 3, "method": "GPIO.ControlPin"}))
            .await
            .unwrap();
        let request = device.expect("GPIO.ControlPin").await.unwrap();
        device.reply_ok(&request).await.unwrap();

        assert_eq!(
            host.recv().await.unwrap(),
            json!({"id": 3, "params": {"error": "GPIOErrorNoError"}})
        );
    }
}
