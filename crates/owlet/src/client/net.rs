//! Network protocol client
//!
//! One JSON object per line. Requests carry an integer `id` that the reply
//! echoes; notifications carry a `notification` name instead.
//!
//! ```text
//! > {"id":2,"method":"GPIO.ConfigurePin","params":{"id":4,"mode":"GPIOOutput"}}
//! < {"id":2,"params":{"error":"GPIOErrorNoError"}}
//! < {"notification":"GPIO.PinChanged","params":{"id":4,"power":true}}
//! ```

use serde_json::{json, Map, Value};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::pending::PendingTable;
use super::{ClientEvent, ClientState, Notification, ProtocolClient, Reply, Request, SubmitError};
use crate::config::{Protocol, SessionConfig};
use crate::error::{DeviceError, OwletError, OwletResult};
use crate::pin::{LedState, PinConfig};

/// Success value of the `error` reply field
pub const GPIO_NO_ERROR: &str = "GPIOErrorNoError";

const MAX_LINE_LENGTH: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Method {
    PlatformInfo,
    ConfigurePin,
    ControlPin,
}

impl Method {
    fn as_str(&self) -> &'static str {
        match self {
            Method::PlatformInfo => "Platform.GetInformation",
            Method::ConfigurePin => "GPIO.ConfigurePin",
            Method::ControlPin => "GPIO.ControlPin",
        }
    }
}

struct NetPending<T> {
    token: T,
    method: Method,
}

pub struct NetClient<T> {
    state: ClientState,
    buffer: Vec<u8>,
    pending: PendingTable<u64, NetPending<T>>,
    next_id: u64,
}

impl<T> NetClient<T> {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            state: ClientState::Idle,
            buffer: Vec::new(),
            pending: PendingTable::new(config.request_timeout(), config.max_outstanding.max(1)),
            next_id: 1,
        }
    }

    fn handle_line(&mut self, line: &[u8], events: &mut Vec<ClientEvent<T>>) {
        let message: Value = match serde_json::from_slice(line) {
            Ok(value @ Value::Object(_)) => value,
            Ok(other) => {
                warn!(message = %other, "Ignoring non-object message");
                return;
            }
            Err(e) => {
                warn!(error = %e, line = %String::from_utf8_lossy(line), "Malformed JSON line");
                return;
            }
        };

        if let Some(name) = message.get("notification").and_then(Value::as_str) {
            let params = message.get("params").unwrap_or(&Value::Null);
            match name {
                "GPIO.PinChanged" => match parse_pin_changed(params) {
                    Some(notification) => events.push(ClientEvent::Notification(notification)),
                    None => warn!(%params, "GPIO.PinChanged without valid pin id"),
                },
                other => debug!(notification = other, "Unhandled notification"),
            }
            return;
        }

        let Some(id) = message.get("id").and_then(Value::as_u64) else {
            warn!(%message, "Message without id or notification");
            return;
        };

        let Some(request) = self.pending.remove(&id) else {
            debug!(id, "Reply for unknown command id discarded");
            return;
        };

        let result = parse_reply(request.method, &message);
        trace!(id, method = request.method.as_str(), ok = result.is_ok(), "Net reply");
        events.push(ClientEvent::Completed {
            token: request.token,
            result,
        });
    }
}

/// Reply fields, top level or nested under `params`
fn reply_field<'a>(message: &'a Value, key: &str) -> Option<&'a Value> {
    message
        .get(key)
        .or_else(|| message.get("params").and_then(|p| p.get(key)))
}

fn parse_reply(method: Method, message: &Value) -> OwletResult<Reply> {
    match method {
        Method::PlatformInfo => {
            let info = message
                .get("params")
                .filter(|p| p.is_object())
                .cloned()
                .unwrap_or_else(|| {
                    let mut fields = message.as_object().cloned().unwrap_or_default();
                    fields.remove("id");
                    Value::Object(fields)
                });
            Ok(Reply::Info(info))
        }
        Method::ConfigurePin | Method::ControlPin => {
            let error = reply_field(message, "error")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    OwletError::InvalidResponse(format!("{} reply without error", method.as_str()))
                })?;
            if error == GPIO_NO_ERROR {
                Ok(Reply::Ack)
            } else {
                Err(OwletError::Device(DeviceError::Remote(error.to_string())))
            }
        }
    }
}

/// Parse a `#RRGGBB` string or an integer into a 24-bit color
pub fn parse_color(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n.as_u64().map(|c| (c & 0xFF_FFFF) as u32),
        Value::String(s) => {
            let hex = s.strip_prefix('#')?;
            if hex.len() != 6 {
                return None;
            }
            u32::from_str_radix(hex, 16).ok()
        }
        _ => None,
    }
}

fn parse_pin_changed(params: &Value) -> Option<Notification> {
    let pin = u8::try_from(params.get("id")?.as_u64()?).ok()?;
    let state = LedState {
        power: params.get("power").and_then(Value::as_bool),
        brightness: params
            .get("brightness")
            .and_then(Value::as_u64)
            .map(|b| b.min(u8::MAX as u64) as u8),
        color: params.get("color").and_then(parse_color),
        effect: params
            .get("effect")
            .and_then(Value::as_u64)
            .and_then(|e| u8::try_from(e).ok()),
    };
    Some(Notification::PinStateChanged { pin, state })
}

fn configure_params(pin: u8, config: &PinConfig) -> OwletResult<Map<String, Value>> {
    let mut params = Map::new();
    params.insert("id".into(), json!(pin));
    match config {
        PinConfig::DigitalOutput => {
            params.insert("mode".into(), json!("GPIOOutput"));
        }
        PinConfig::DigitalInput => {
            params.insert("mode".into(), json!("GPIOInput"));
        }
        PinConfig::Ws2812 {
            led_count,
            led_mode,
            led_clock,
        } => {
            params.insert("mode".into(), json!("WS2812"));
            params.insert("ledCount".into(), json!(led_count));
            params.insert("ledMode".into(), json!(format!("WS2812Mode{}", led_mode.as_str())));
            params.insert(
                "ledClock".into(),
                json!(format!("WS2812Clock{}", led_clock.as_str())),
            );
        }
        other => {
            return Err(OwletError::Unsupported(format!(
                "{} is not available on network owlets",
                other.mode()
            )))
        }
    }
    Ok(params)
}

fn control_params(pin: u8, state: &LedState) -> Map<String, Value> {
    let mut params = Map::new();
    params.insert("id".into(), json!(pin));
    if let Some(power) = state.power {
        params.insert("power".into(), json!(power));
    }
    if let Some(brightness) = state.brightness {
        params.insert("brightness".into(), json!(brightness));
    }
    if let Some(color) = state.color {
        params.insert("color".into(), json!(color & 0xFF_FFFF));
    }
    if let Some(effect) = state.effect {
        params.insert("effect".into(), json!(effect));
    }
    params
}

fn encode_request(request: &Request) -> OwletResult<(Method, Map<String, Value>)> {
    match request {
        Request::PlatformInfo => Ok((Method::PlatformInfo, Map::new())),
        Request::ConfigurePin { pin, config } => {
            Ok((Method::ConfigurePin, configure_params(*pin, config)?))
        }
        Request::ControlPin { pin, state } => Ok((Method::ControlPin, control_params(*pin, state))),
        Request::WriteDigital { pin, value } => Ok((
            Method::ControlPin,
            control_params(
                *pin,
                &LedState {
                    power: Some(*value),
                    ..Default::default()
                },
            ),
        )),
        other => Err(OwletError::Unsupported(format!(
            "{} is not available on network owlets",
            other.name()
        ))),
    }
}

impl<T: Send> ProtocolClient<T> for NetClient<T> {
    fn protocol(&self) -> Protocol {
        Protocol::Net
    }

    fn state(&self) -> ClientState {
        self.state
    }

    fn on_transport_connected(&mut self) {
        self.buffer.clear();
        self.state = ClientState::Ready;
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
        let (method, params) = match encode_request(&request) {
            Ok(encoded) => encoded,
            Err(err) => return Err(SubmitError::new(token, err)),
        };
        if self.pending.is_full() {
            return Err(SubmitError::new(token, OwletError::Backpressure));
        }

        let id = self.next_id;
        self.next_id += 1;

        let mut message = Map::new();
        message.insert("id".into(), json!(id));
        message.insert("method".into(), json!(method.as_str()));
        if !params.is_empty() {
            message.insert("params".into(), Value::Object(params));
        }
        let mut line = Value::Object(message).to_string().into_bytes();
        line.push(b'\n');
        trace!(id, method = method.as_str(), "Net request");

        self.pending.insert(id, NetPending { token, method }, now);
        Ok(line)
    }

    fn receive(&mut self, bytes: &[u8]) -> Vec<ClientEvent<T>> {
        let mut events = Vec::new();
        self.buffer.extend_from_slice(bytes);

        while let Some(end) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=end).collect();
            let line = line.trim_ascii();
            if !line.is_empty() {
                self.handle_line(line, &mut events);
            }
        }

        if self.buffer.len() > MAX_LINE_LENGTH {
            warn!(len = self.buffer.len(), "Discarding oversized line");
            self.buffer.clear();
        }
        events
    }

    fn expire(&mut self, now: Instant) -> Vec<(T, OwletError)> {
        self.pending
            .expire(now)
            .into_iter()
            .map(|(id, request)| {
                debug!(id, method = request.method.as_str(), "Net request timed out");
                (request.token, OwletError::Timeout)
            })
            .collect()
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.pending.next_deadline()
    }

    fn disconnect(&mut self) -> Vec<T> {
        self.state = ClientState::Idle;
        self.buffer.clear();
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
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pin::{LedClock, LedMode};
    use pretty_assertions::assert_eq;

    fn connected() -> NetClient<u32> {
        let mut client = NetClient::new(&SessionConfig::default());
        client.on_transport_connected();
        client
    }

    fn sent(wire: &[u8]) -> Value {
        assert_eq!(wire.last(), Some(&b'\n'));
        serde_json::from_slice(wire).unwrap()
    }

    #[test]
    fn test_ws2812_configure_params() {
        let mut client = connected();
        let config = PinConfig::Ws2812 {
            led_count: 30,
            led_mode: LedMode::Grb,
            led_clock: LedClock::Khz800,
        };
        let wire = client
            .submit(Request::ConfigurePin { pin: 4, config }, 1, Instant::now())
            .unwrap();
        assert_eq!(
            sent(&wire),
            json!({
                "id": 1,
                "method": "GPIO.ConfigurePin",
                "params": {
                    "id": 4,
                    "mode": "WS2812",
                    "ledCount": 30,
                    "ledMode": "WS2812ModeGRB",
                    "ledClock": "WS2812Clock800kHz"
                }
            })
        );
    }

    #[test]
    fn test_platform_info_omits_params() {
        let mut client = connected();
        let wire = client.submit(Request::PlatformInfo, 1, Instant::now()).unwrap();
        assert_eq!(sent(&wire), json!({"id": 1, "method": "Platform.GetInformation"}));

        let events = client.receive(b"{\"id\":1,\"params\":{\"platform\":\"esp32\"}}\n");
        match events.as_slice() {
            [ClientEvent::Completed { token: 1, result: Ok(Reply::Info(info)) }] => {
                assert_eq!(info, &json!({"platform": "esp32"}));
            }
            other => panic!("Expected Info, got {:?}", other),
        }
    }

    #[test]
    fn test_control_pin_masks_color() {
        let mut client = connected();
        let state = LedState {
            color: Some(0xFFFF_FFFF),
            brightness: Some(80),
            ..Default::default()
        };
        let wire = client
            .submit(Request::ControlPin { pin: 4, state }, 1, Instant::now())
            .unwrap();
        assert_eq!(
            sent(&wire)["params"],
            json!({"id": 4, "color": 0xFFFFFF, "brightness": 80})
        );
    }

    #[test]
    fn test_reply_error_top_level_or_params() {
        let mut client = connected();
        let now = Instant::now();
        client
            .submit(Request::WriteDigital { pin: 2, value: true }, 1, now)
            .unwrap();
        client
            .submit(Request::WriteDigital { pin: 2, value: false }, 2, now)
            .unwrap();
        client
            .submit(Request::WriteDigital { pin: 2, value: false }, 3, now)
            .unwrap();

        let events = client.receive(
            b"{\"id\":2,\"error\":\"GPIOErrorInvalidPin\"}\n{\"id\":1,\"params\":{\"error\":\"GPIOErrorNoError\"}}\n{\"id\":3}\n",
        );
        match events.as_slice() {
            [ClientEvent::Completed { token: 2, result: Err(OwletError::Device(DeviceError::Remote(e))) }, ClientEvent::Completed { token: 1, result: Ok(Reply::Ack) }, ClientEvent::Completed { token: 3, result: Err(OwletError::InvalidResponse(_)) }] =>
            {
                assert_eq!(e, "GPIOErrorInvalidPin");
            }
            other => panic!("Unexpected events: {:?}", other),
        }
    }

    #[test]
    fn test_notification_and_partial_lines() {
        let mut client = connected();
        assert!(client
            .receive(b"{\"notification\":\"GPIO.PinChanged\",\"params\":{\"id\":4,")
            .is_empty());
        let events = client.receive(b"\"power\":true,\"color\":\"#00ff80\"}}\nnot json\n");
        match events.as_slice() {
            [ClientEvent::Notification(Notification::PinStateChanged { pin: 4, state })] => {
                assert_eq!(state.power, Some(true));
                assert_eq!(state.color, Some(0x00FF80));
                assert_eq!(state.brightness, None);
            }
            other => panic!("Expected PinStateChanged, got {:?}", other),
        }
    }

    #[test]
    fn test_analog_unsupported() {
        let mut client = connected();
        let err = client
            .submit(Request::ReadAnalog { pin: 1 }, 9, Instant::now())
            .unwrap_err();
        assert!(matches!(err.error, OwletError::Unsupported(_)));

        let err = client
            .submit(
                Request::ConfigurePin {
                    pin: 1,
                    config: PinConfig::Servo,
                },
                9,
                Instant::now(),
            )
            .unwrap_err();
        assert!(matches!(err.error, OwletError::Unsupported(_)));
    }

    #[test]
    fn test_parse_color_forms() {
        assert_eq!(parse_color(&json!(0x1234_5678u64)), Some(0x34_5678));
        assert_eq!(parse_color(&json!("#FF0000")), Some(0xFF_0000));
        assert_eq!(parse_color(&json!("red")), None);
        assert_eq!(parse_color(&json!("#FFF")), None);
    }
}
