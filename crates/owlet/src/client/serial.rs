//! Serial protocol client
//!
//! Frame payloads are `[sequence_id, opcode, data...]`. Replies echo the
//! request's sequence id and opcode; opcodes with the high bit set are
//! notifications and their sequence id means nothing.
//!
//! ```text
//!   host                                  board
//!    |  [01 00]            GetFirmwareVersion  |
//!    |  ------------------------------------>  |
//!    |  [01 00 "1.2.3"]                        |
//!    |  <------------------------------------  |
//!    |  [02 01 05 01]      ConfigurePin(5, DO) |
//!    |  ------------------------------------>  |
//!    |  [02 01 00]         NoError             |
//!    |  <------------------------------------  |
//!    |  [xx 80 07 01]      PinChanged(7, 1)    |
//!    |  <------------------------------------  |
//! ```

use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::gpio::{mode_byte, GpioError, Opcode};
use super::pending::PendingTable;
use super::{ClientEvent, ClientState, Notification, ProtocolClient, Reply, Request, SubmitError};
use crate::codec::{self, FrameDecoder, FrameEvent};
use crate::config::{Protocol, SessionConfig};
use crate::error::{OwletError, OwletResult};

/// Size of the sequence id space
pub const SEQUENCE_SPACE: usize = 256;

struct SerialPending<T> {
    token: T,
    opcode: Opcode,
}

pub struct SerialClient<T> {
    state: ClientState,
    decoder: FrameDecoder,
    pending: PendingTable<u8, SerialPending<T>>,
    next_seq: u8,
    firmware: Option<String>,
    codec_errors: u32,
}

impl<T> SerialClient<T> {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            state: ClientState::Idle,
            decoder: FrameDecoder::new(),
            pending: PendingTable::new(
                config.request_timeout(),
                config.max_outstanding.clamp(1, SEQUENCE_SPACE),
            ),
            next_seq: 1,
            firmware: None,
            codec_errors: 0,
        }
    }

    /// Next free sequence id at or after the cursor
    fn allocate_seq(&mut self) -> Option<u8> {
        for _ in 0..SEQUENCE_SPACE {
            let seq = self.next_seq;
            self.next_seq = self.next_seq.wrapping_add(1);
            if !self.pending.contains(&seq) {
                return Some(seq);
            }
        }
        None
    }

    fn handle_frame(&mut self, payload: Vec<u8>, events: &mut Vec<ClientEvent<T>>) {
        if payload.len() < 2 {
            warn!(len = payload.len(), "Serial frame without header");
            return;
        }
        let seq = payload[0];
        let raw_opcode = payload[1];
        let data = &payload[2..];

        if Opcode::is_notification(raw_opcode) {
            match (Opcode::from_u8(raw_opcode), data) {
                (Some(Opcode::PinChanged), [pin, value, ..]) => {
                    trace!(pin, value, "PinChanged notification");
                    events.push(ClientEvent::Notification(Notification::PinChanged {
                        pin: *pin,
                        value: *value,
                    }));
                }
                _ => warn!(
                    opcode = format_args!("0x{:02X}", raw_opcode),
                    data = %hex::encode(data),
                    "Unknown or short notification"
                ),
            }
            return;
        }

        let Some(request) = self.pending.remove(&seq) else {
            debug!(seq, opcode = raw_opcode, "Reply for unknown sequence id discarded");
            return;
        };

        let result = if request.opcode.as_u8() != raw_opcode {
            Err(OwletError::InvalidResponse(format!(
                "Expected opcode 0x{:02X}, got 0x{:02X}",
                request.opcode.as_u8(),
                raw_opcode
            )))
        } else {
            parse_reply(request.opcode, data)
        };

        if let (Opcode::GetFirmwareVersion, Ok(Reply::Firmware(version))) = (request.opcode, &result)
        {
            debug!(%version, "Firmware handshake complete");
            self.firmware = Some(version.clone());
            self.state = ClientState::Ready;
        }

        events.push(ClientEvent::Completed {
            token: request.token,
            result,
        });
    }
}

fn gpio_status(data: &[u8]) -> OwletResult<()> {
    let code = data
        .first()
        .ok_or_else(|| OwletError::InvalidResponse("Missing GPIO error byte".into()))?;
    match GpioError::from(*code) {
        GpioError::NoError => Ok(()),
        err => Err(err.into()),
    }
}

fn parse_reply(opcode: Opcode, data: &[u8]) -> OwletResult<Reply> {
    match opcode {
        Opcode::GetFirmwareVersion => {
            let version = String::from_utf8_lossy(data)
                .trim_end_matches('\0')
                .trim()
                .to_string();
            Ok(Reply::Firmware(version))
        }
        Opcode::ConfigurePin | Opcode::WriteDigital | Opcode::WriteAnalog | Opcode::WriteServo => {
            gpio_status(data).map(|()| Reply::Ack)
        }
        Opcode::ReadDigital => {
            gpio_status(data)?;
            let value = data
                .get(1)
                .ok_or_else(|| OwletError::InvalidResponse("ReadDigital reply too short".into()))?;
            Ok(Reply::Digital(*value != 0))
        }
        Opcode::ReadAnalog => {
            gpio_status(data)?;
            let bytes: [u8; 4] = data
                .get(1..5)
                .and_then(|b| b.try_into().ok())
                .ok_or_else(|| OwletError::InvalidResponse("ReadAnalog reply too short".into()))?;
            Ok(Reply::Analog(u32::from_le_bytes(bytes)))
        }
        Opcode::PinChanged => Err(OwletError::InvalidResponse(
            "Notification opcode used as reply".into(),
        )),
    }
}

/// Opcode and data bytes for a request
fn encode_request(request: &Request) -> OwletResult<(Opcode, Vec<u8>)> {
    match request {
        Request::FirmwareVersion => Ok((Opcode::GetFirmwareVersion, vec![])),
        Request::ConfigurePin { pin, config } => {
            let mode = config.mode();
            let byte = mode_byte(mode).ok_or_else(|| {
                OwletError::Unsupported(format!("{} is not available on serial owlets", mode))
            })?;
            Ok((Opcode::ConfigurePin, vec![*pin, byte]))
        }
        Request::WriteDigital { pin, value } => {
            Ok((Opcode::WriteDigital, vec![*pin, u8::from(*value)]))
        }
        Request::ReadDigital { pin } => Ok((Opcode::ReadDigital, vec![*pin])),
        Request::WriteAnalog { pin, duty } => Ok((Opcode::WriteAnalog, vec![*pin, *duty])),
        Request::ReadAnalog { pin } => Ok((Opcode::ReadAnalog, vec![*pin])),
        Request::WriteServo { pin, angle } => Ok((Opcode::WriteServo, vec![*pin, *angle])),
        Request::PlatformInfo | Request::ControlPin { .. } => Err(OwletError::Unsupported(
            format!("{} is not available on serial owlets", request.name()),
        )),
    }
}

impl<T: Send> ProtocolClient<T> for SerialClient<T> {
    fn protocol(&self) -> Protocol {
        Protocol::Serial
    }

    fn state(&self) -> ClientState {
        self.state
    }

    fn on_transport_connected(&mut self) {
        self.decoder.clear();
        self.codec_errors = 0;
        self.state = ClientState::Handshaking;
    }

    fn submit(
        &mut self,
        request: Request,
        token: T,
        now: Instant,
    ) -> Result<Vec<u8>, SubmitError<T>> {
        if self.state == ClientState::Idle {
            return Err(SubmitError::new(token, OwletError::NotReady));
        }
        let (opcode, data) = match encode_request(&request) {
            Ok(encoded) => encoded,
            Err(err) => return Err(SubmitError::new(token, err)),
        };
        if self.pending.is_full() {
            return Err(SubmitError::new(token, OwletError::Backpressure));
        }
        let Some(seq) = self.allocate_seq() else {
            return Err(SubmitError::new(token, OwletError::Backpressure));
        };

        let mut payload = Vec::with_capacity(data.len() + 2);
        payload.push(seq);
        payload.push(opcode.as_u8());
        payload.extend_from_slice(&data);
        trace!(seq, request = request.name(), payload = %hex::encode(&payload), "Serial request");

        self.pending.insert(seq, SerialPending { token, opcode }, now);
        Ok(codec::encode(&payload))
    }

    fn receive(&mut self, bytes: &[u8]) -> Vec<ClientEvent<T>> {
        let mut events = Vec::new();
        self.decoder.feed(bytes);

        while let Some(event) = self.decoder.next_frame() {
            match event {
                FrameEvent::Frame(payload) => {
                    self.codec_errors = 0;
                    self.handle_frame(payload, &mut events);
                }
                FrameEvent::Corrupt(reason) => {
                    self.codec_errors += 1;
                    warn!(%reason, consecutive = self.codec_errors, "Corrupt serial frame");
                    events.push(ClientEvent::CodecError {
                        consecutive: self.codec_errors,
                        error: OwletError::Codec(reason.to_string()),
                    });
                }
            }
        }
        events
    }

    fn expire(&mut self, now: Instant) -> Vec<(T, OwletError)> {
        self.pending
            .expire(now)
            .into_iter()
            .map(|(seq, request)| {
                debug!(seq, opcode = ?request.opcode, "Serial request timed out");
                (request.token, OwletError::Timeout)
            })
            .collect()
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.pending.next_deadline()
    }

    fn disconnect(&mut self) -> Vec<T> {
        self.state = ClientState::Idle;
        if self.decoder.pending() > 0 {
            debug!(bytes = self.decoder.pending(), "Discarding partial frame");
        }
        self.decoder.clear();
        self.codec_errors = 0;
        self.pending
            .drain()
            .into_iter()
            .map(|(_, request)| request.token)
            .collect()
    }

    fn outstanding(&self) -> usize {
        self.pending.len()
    }

    fn firmware_version(&self) -> Option<&str> {
        self.firmware.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode, Decoded};
    use crate::pin::PinConfig;
    use std::time::Duration;

    fn payload_of(wire: &[u8]) -> Vec<u8> {
        match decode(wire) {
            Decoded::Frame { payload, .. } => payload,
            other => panic!("Expected frame, got {:?}", other),
        }
    }

    fn ready_client() -> SerialClient<u32> {
        let mut client = SerialClient::new(&SessionConfig::default());
        client.on_transport_connected();
        let wire = client
            .submit(Request::FirmwareVersion, 0, Instant::now())
            .unwrap();
        assert_eq!(payload_of(&wire), vec![0x01, 0x00]);
        let events = client.receive(&codec::encode(b"\x01\x001.2.3"));
        assert!(matches!(
            events.as_slice(),
            [ClientEvent::Completed { token: 0, result: Ok(Reply::Firmware(v)) }] if v == "1.2.3"
        ));
        client
    }

    #[test]
    fn test_handshake_reaches_ready() {
        let client = ready_client();
        assert_eq!(client.state(), ClientState::Ready);
        assert_eq!(client.firmware_version(), Some("1.2.3"));
    }

    #[test]
    fn test_idle_client_rejects_requests() {
        let mut client: SerialClient<u32> = SerialClient::new(&SessionConfig::default());
        let err = client
            .submit(Request::ReadDigital { pin: 3 }, 7, Instant::now())
            .unwrap_err();
        assert_eq!(err.token, 7);
        assert!(matches!(err.error, OwletError::NotReady));
    }

    #[test]
    fn test_analog_reply_little_endian() {
        let mut client = ready_client();
        let wire = client
            .submit(Request::ReadAnalog { pin: 15 }, 1, Instant::now())
            .unwrap();
        assert_eq!(payload_of(&wire), vec![0x02, 0x05, 15]);

        let events = client.receive(&codec::encode(&[0x02, 0x05, 0x00, 0xE8, 0x03, 0x00, 0x00]));
        match events.as_slice() {
            [ClientEvent::Completed { token: 1, result: Ok(Reply::Analog(1000)) }] => {}
            other => panic!("Expected Analog(1000), got {:?}", other),
        }
    }

    #[test]
    fn test_gpio_error_and_short_reply() {
        let mut client = ready_client();
        let now = Instant::now();
        client.submit(Request::ReadAnalog { pin: 15 }, 1, now).unwrap();
        client.submit(Request::ReadDigital { pin: 4 }, 2, now).unwrap();

        let mut wire = codec::encode(&[0x02, 0x05, 0x04]);
        wire.extend(codec::encode(&[0x03, 0x03, 0x00]));
        let events = client.receive(&wire);

        match events.as_slice() {
            [ClientEvent::Completed { token: 1, result: Err(err1) }, ClientEvent::Completed { token: 2, result: Err(OwletError::InvalidResponse(_)) }] =>
            {
                assert!(matches!(
                    err1,
                    OwletError::Device(crate::error::DeviceError::Gpio(GpioError::HardwareFailure))
                ));
            }
            other => panic!("Expected HardwareFailure then InvalidResponse, got {:?}", other),
        }
    }

    #[test]
    fn test_opcode_mismatch_is_invalid_response() {
        let mut client = ready_client();
        client
            .submit(Request::WriteDigital { pin: 5, value: true }, 1, Instant::now())
            .unwrap();
        let events = client.receive(&codec::encode(&[0x02, 0x04, 0x00]));
        match events.as_slice() {
            [ClientEvent::Completed { token: 1, result: Err(OwletError::InvalidResponse(_)) }] => {}
            other => panic!("Expected InvalidResponse, got {:?}", other),
        }
        assert_eq!(client.outstanding(), 0);
    }

    #[test]
    fn test_notification_ignores_sequence() {
        let mut client = ready_client();
        let events = client.receive(&codec::encode(&[0x00, 0x80, 7, 1]));
        match events.as_slice() {
            [ClientEvent::Notification(Notification::PinChanged { pin: 7, value: 1 })] => {}
            other => panic!("Expected PinChanged, got {:?}", other),
        }
    }

    #[test]
    fn test_sequence_wraps_and_skips_outstanding() {
        let mut client = ready_client();
        let now = Instant::now();
        // Hold seq 2 open, cycle through the rest of the space
        client.submit(Request::ReadDigital { pin: 2 }, 2, now).unwrap();
        for seq in 3..=255u8 {
            let wire = client.submit(Request::ReadDigital { pin: 2 }, 0, now).unwrap();
            client.receive(&codec::encode(&[payload_of(&wire)[0], 0x03, 0x00, 0x00]));
            assert_eq!(payload_of(&wire)[0], seq);
        }
        let wrapped = client.submit(Request::ReadDigital { pin: 2 }, 0, now).unwrap();
        assert_eq!(payload_of(&wrapped)[0], 0);
        client.receive(&codec::encode(&[0x00, 0x03, 0x00, 0x00]));
        let next = client.submit(Request::ReadDigital { pin: 2 }, 0, now).unwrap();
        assert_eq!(payload_of(&next)[0], 1);
        client.receive(&codec::encode(&[0x01, 0x03, 0x00, 0x00]));

        // 2 is still outstanding
        let skipped = client.submit(Request::ReadDigital { pin: 2 }, 0, now).unwrap();
        assert_eq!(payload_of(&skipped)[0], 3);
    }

    #[test]
    fn test_backpressure_at_256() {
        let mut client = ready_client();
        let now = Instant::now();
        for token in 0..256u32 {
            client.submit(Request::ReadDigital { pin: 2 }, token, now).unwrap();
        }
        let err = client
            .submit(Request::ReadDigital { pin: 2 }, 256, now)
            .unwrap_err();
        assert!(matches!(err.error, OwletError::Backpressure));

        // Seq 2 went out first after the handshake
        client.receive(&codec::encode(&[0x02, 0x03, 0x00, 0x01]));
        assert!(client.submit(Request::ReadDigital { pin: 2 }, 257, now).is_ok());
        assert!(client.submit(Request::ReadDigital { pin: 2 }, 258, now).is_err());
    }

    #[test]
    fn test_ws2812_rejected_locally() {
        let mut client = ready_client();
        let config = PinConfig::Ws2812 {
            led_count: 8,
            led_mode: crate::pin::LedMode::Grb,
            led_clock: crate::pin::LedClock::Khz800,
        };
        let err = client
            .submit(Request::ConfigurePin { pin: 6, config }, 1, Instant::now())
            .unwrap_err();
        assert!(matches!(err.error, OwletError::Unsupported(_)));
        assert_eq!(client.outstanding(), 0);
    }

    #[test]
    fn test_timeout_then_late_reply_discarded() {
        let mut client = ready_client();
        let now = Instant::now();
        client.submit(Request::ReadDigital { pin: 9 }, 1, now).unwrap();
        assert_eq!(client.next_deadline(), Some(now + Duration::from_secs(2)));

        let expired = client.expire(now + Duration::from_secs(2));
        assert!(matches!(expired.as_slice(), [(1, OwletError::Timeout)]));
        assert!(client.receive(&codec::encode(&[0x02, 0x03, 0x00, 0x01])).is_empty());
    }

    #[test]
    fn test_disconnect_returns_tokens_in_order() {
        let mut client = ready_client();
        let now = Instant::now();
        for token in [10, 11, 12] {
            client.submit(Request::ReadDigital { pin: 2 }, token, now).unwrap();
        }
        assert_eq!(client.disconnect(), vec![10, 11, 12]);
        assert_eq!(client.state(), ClientState::Idle);
        assert_eq!(client.outstanding(), 0);
    }

    #[test]
    fn test_codec_errors_counted_until_good_frame() {
        let mut damaged = codec::encode(&[0x09, 0x03, 0x00, 0x01]);
        damaged[1] ^= 0x40;

        let mut client = ready_client();
        let events = client.receive(&[damaged.clone(), damaged.clone()].concat());
        let counts: Vec<u32> = events
            .iter()
            .map(|e| match e {
                ClientEvent::CodecError { consecutive, .. } => *consecutive,
                other => panic!("Expected CodecError, got {:?}", other),
            })
            .collect();
        assert_eq!(counts, vec![1, 2]);

        client.receive(&codec::encode(&[0x00, 0x80, 2, 0]));
        let events = client.receive(&damaged);
        assert!(matches!(
            events.as_slice(),
            [ClientEvent::CodecError {
                consecutive: 1,
                error: OwletError::Codec(_)
            }]
        ));
    }
}
