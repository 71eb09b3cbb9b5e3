//! Typed payload builders and parsers.
//!
//! Integers are big-endian. Floating-point fields are little-endian IEEE-754
//! on every host.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;

use crate::codec::MAX_PAYLOAD;
use crate::command::{Command, ErrorCode};
use crate::error::{FrameError, PayloadError, Result};

pub const PARAM_TYPE_INT: u8 = 0x01;
pub const PARAM_TYPE_DOUBLE: u8 = 0x02;
pub const PARAM_TYPE_STRING: u8 = 0x03;
pub const PARAM_TYPE_BOOL: u8 = 0x04;

pub const HEARTBEAT_PING: u8 = 0x01;
pub const HEARTBEAT_PONG: u8 = 0x02;

/// A typed parameter value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum ParamValue {
    Int(i32),
    Double(f64),
    #[serde(rename = "string")]
    Str(String),
    Bool(bool),
}

impl ParamValue {
    pub fn type_tag(&self) -> u8 {
        match self {
            ParamValue::Int(_) => PARAM_TYPE_INT,
            ParamValue::Double(_) => PARAM_TYPE_DOUBLE,
            ParamValue::Str(_) => PARAM_TYPE_STRING,
            ParamValue::Bool(_) => PARAM_TYPE_BOOL,
        }
    }
}

impl From<i32> for ParamValue {
    fn from(v: i32) -> Self {
        ParamValue::Int(v)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Double(v)
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Str(v.to_owned())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::Str(v)
    }
}

/// A named parameter.
///
/// Layout: `name_len(1) | name | type(1) | value`, where a string value is
/// itself length-prefixed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Parameter {
    pub name: String,
    pub value: ParamValue,
}

impl Parameter {
    pub fn new(name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        let name = self.name.as_bytes();
        if name.len() > u8::MAX as usize {
            return Err(FrameError::NameTooLong(name.len()));
        }
        let mut buf = BytesMut::with_capacity(2 + name.len() + 9);
        buf.put_u8(name.len() as u8);
        buf.put_slice(name);
        buf.put_u8(self.value.type_tag());
        match &self.value {
            ParamValue::Int(v) => buf.put_i32(*v),
            ParamValue::Double(v) => buf.put_f64_le(*v),
            ParamValue::Str(s) => {
                if s.len() > u8::MAX as usize {
                    return Err(FrameError::ValueTooLong(s.len()));
                }
                buf.put_u8(s.len() as u8);
                buf.put_slice(s.as_bytes());
            }
            ParamValue::Bool(v) => buf.put_u8(u8::from(*v)),
        }
        if buf.len() > MAX_PAYLOAD {
            return Err(FrameError::PayloadTooLarge {
                size: buf.len(),
                max: MAX_PAYLOAD,
            });
        }
        Ok(buf.freeze())
    }

    pub fn parse(mut data: &[u8]) -> std::result::Result<Self, PayloadError> {
        const WHAT: &str = "parameter";
        let total = data.len();
        if data.is_empty() {
            return Err(PayloadError::Empty(WHAT));
        }
        let name_len = data.get_u8() as usize;
        need(data, name_len, WHAT, total)?;
        let name = std::str::from_utf8(&data[..name_len])
            .map_err(|_| PayloadError::InvalidUtf8("parameter name"))?
            .to_owned();
        data.advance(name_len);

        need(data, 1, WHAT, total)?;
        let value = match data.get_u8() {
            PARAM_TYPE_INT => {
                need(data, 4, WHAT, total)?;
                ParamValue::Int(data.get_i32())
            }
            PARAM_TYPE_DOUBLE => {
                need(data, 8, WHAT, total)?;
                ParamValue::Double(data.get_f64_le())
            }
            PARAM_TYPE_STRING => {
                need(data, 1, WHAT, total)?;
                let len = data.get_u8() as usize;
                need(data, len, WHAT, total)?;
                let s = std::str::from_utf8(&data[..len])
                    .map_err(|_| PayloadError::InvalidUtf8("parameter value"))?;
                ParamValue::Str(s.to_owned())
            }
            PARAM_TYPE_BOOL => {
                need(data, 1, WHAT, total)?;
                ParamValue::Bool(data.get_u8() != 0)
            }
            other => return Err(PayloadError::UnknownParamType(other)),
        };
        Ok(Self { name, value })
    }
}

fn need(
    rest: &[u8],
    n: usize,
    what: &'static str,
    total: usize,
) -> std::result::Result<(), PayloadError> {
    if rest.len() < n {
        return Err(PayloadError::TooShort {
            what,
            got: total,
            need: total - rest.len() + n,
        });
    }
    Ok(())
}

fn exact(data: &[u8], what: &'static str, expected: usize) -> std::result::Result<(), PayloadError> {
    if data.len() != expected {
        return Err(PayloadError::WrongSize {
            what,
            got: data.len(),
            expected,
        });
    }
    Ok(())
}

/// Motion target: position plus feed speed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Motion {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub speed: f32,
}

impl Motion {
    pub const SIZE: usize = 16;

    pub fn new(x: f32, y: f32, z: f32, speed: f32) -> Self {
        Self { x, y, z, speed }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_f32_le(self.x);
        buf.put_f32_le(self.y);
        buf.put_f32_le(self.z);
        buf.put_f32_le(self.speed);
        buf.freeze()
    }

    pub fn parse(mut data: &[u8]) -> std::result::Result<Self, PayloadError> {
        exact(data, "motion", Self::SIZE)?;
        Ok(Self {
            x: data.get_f32_le(),
            y: data.get_f32_le(),
            z: data.get_f32_le(),
            speed: data.get_f32_le(),
        })
    }
}

/// Dispense settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DispenseParams {
    pub volume: f32,
    pub pressure: f32,
    pub temperature: f32,
    pub duration_ms: i32,
}

impl DispenseParams {
    pub const SIZE: usize = 16;

    pub fn new(volume: f32, pressure: f32, temperature: f32, duration_ms: i32) -> Self {
        Self {
            volume,
            pressure,
            temperature,
            duration_ms,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_f32_le(self.volume);
        buf.put_f32_le(self.pressure);
        buf.put_f32_le(self.temperature);
        buf.put_i32(self.duration_ms);
        buf.freeze()
    }

    pub fn parse(mut data: &[u8]) -> std::result::Result<Self, PayloadError> {
        exact(data, "dispense", Self::SIZE)?;
        Ok(Self {
            volume: data.get_f32_le(),
            pressure: data.get_f32_le(),
            temperature: data.get_f32_le(),
            duration_ms: data.get_i32(),
        })
    }
}

/// Heartbeat payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Heartbeat {
    /// Carries the sender's wall clock in milliseconds since the epoch.
    Ping { timestamp_ms: i64 },
    /// May echo the timestamp of the PING it answers.
    Pong { timestamp_ms: Option<i64> },
}

impl Heartbeat {
    pub const PING_SIZE: usize = 9;

    /// A PING stamped with the current wall clock.
    pub fn ping_now() -> Self {
        Heartbeat::Ping {
            timestamp_ms: epoch_millis(),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::PING_SIZE);
        match *self {
            Heartbeat::Ping { timestamp_ms } => {
                buf.put_u8(HEARTBEAT_PING);
                buf.put_i64(timestamp_ms);
            }
            Heartbeat::Pong { timestamp_ms } => {
                buf.put_u8(HEARTBEAT_PONG);
                if let Some(ts) = timestamp_ms {
                    buf.put_i64(ts);
                }
            }
        }
        buf.freeze()
    }

    pub fn parse(mut data: &[u8]) -> std::result::Result<Self, PayloadError> {
        if data.is_empty() {
            return Err(PayloadError::Empty("heartbeat"));
        }
        let total = data.len();
        match data.get_u8() {
            HEARTBEAT_PING => {
                if total < Self::PING_SIZE {
                    return Err(PayloadError::TooShort {
                        what: "heartbeat ping",
                        got: total,
                        need: Self::PING_SIZE,
                    });
                }
                Ok(Heartbeat::Ping {
                    timestamp_ms: data.get_i64(),
                })
            }
            HEARTBEAT_PONG => {
                let timestamp_ms = (data.len() >= 8).then(|| data.get_i64());
                Ok(Heartbeat::Pong { timestamp_ms })
            }
            other => Err(PayloadError::UnknownHeartbeatType(other)),
        }
    }

    /// The PONG answering this heartbeat, if it is a PING.
    pub fn answer(&self) -> Option<Heartbeat> {
        match *self {
            Heartbeat::Ping { timestamp_ms } => Some(Heartbeat::Pong {
                timestamp_ms: Some(timestamp_ms),
            }),
            Heartbeat::Pong { .. } => None,
        }
    }
}

/// Milliseconds since the Unix epoch; zero if the clock is before it.
pub fn epoch_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Generic response: the original command byte, then its data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Response {
    pub original: u8,
    #[serde(serialize_with = "serialize_hex")]
    pub data: Bytes,
}

impl Response {
    pub fn new(original: impl Into<u8>, data: impl Into<Bytes>) -> Self {
        Self {
            original: original.into(),
            data: data.into(),
        }
    }

    pub fn original_command(&self) -> Option<Command> {
        Command::from_code(self.original)
    }

    pub fn encode(&self) -> Result<Bytes> {
        let size = 1 + self.data.len();
        if size > MAX_PAYLOAD {
            return Err(FrameError::PayloadTooLarge {
                size,
                max: MAX_PAYLOAD,
            });
        }
        let mut buf = BytesMut::with_capacity(size);
        buf.put_u8(self.original);
        buf.put_slice(&self.data);
        Ok(buf.freeze())
    }

    pub fn parse(data: &[u8]) -> std::result::Result<Self, PayloadError> {
        let (&original, rest) = data.split_first().ok_or(PayloadError::Empty("response"))?;
        Ok(Self {
            original,
            data: Bytes::copy_from_slice(rest),
        })
    }
}

fn serialize_hex<S: serde::Serializer>(data: &Bytes, s: S) -> std::result::Result<S::Ok, S::Error> {
    let hex: String = data.iter().map(|b| format!("{b:02x}")).collect();
    s.serialize_str(&hex)
}

/// Error frame payload: a one-byte code plus an optional UTF-8 message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorReport {
    pub code: u8,
    pub message: Option<String>,
}

impl ErrorReport {
    pub fn new(code: ErrorCode, message: Option<String>) -> Self {
        Self {
            code: code.code(),
            message,
        }
    }

    pub fn kind(&self) -> ErrorCode {
        ErrorCode::from_code(self.code)
    }

    /// The message is cut at a character boundary so the payload fits.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(MAX_PAYLOAD);
        buf.put_u8(self.code);
        if let Some(msg) = &self.message {
            let mut end = msg.len().min(MAX_PAYLOAD - 1);
            while !msg.is_char_boundary(end) {
                end -= 1;
            }
            buf.put_slice(&msg.as_bytes()[..end]);
        }
        buf.freeze()
    }

    pub fn parse(data: &[u8]) -> std::result::Result<Self, PayloadError> {
        let (&code, rest) = data.split_first().ok_or(PayloadError::Empty("error"))?;
        let message = if rest.is_empty() {
            None
        } else {
            Some(
                std::str::from_utf8(rest)
                    .map_err(|_| PayloadError::InvalidUtf8("error message"))?
                    .to_owned(),
            )
        };
        Ok(Self { code, message })
    }
}

/// Check that a payload has the shape its command requires.
///
/// Commands without a fixed encoding pass through unchecked.
pub fn validate_payload(code: u8, payload: &[u8]) -> std::result::Result<(), PayloadError> {
    match Command::from_code(code) {
        Some(Command::MoveToPosition) => exact(payload, "motion", Motion::SIZE),
        Some(Command::SetGlueParameters) => exact(payload, "dispense", DispenseParams::SIZE),
        Some(Command::Heartbeat) if payload.is_empty() => Err(PayloadError::Empty("heartbeat")),
        Some(Command::ReadParameter | Command::WriteParameter) => {
            Parameter::parse(payload).map(drop)
        }
        Some(Command::Response) if payload.is_empty() => Err(PayloadError::Empty("response")),
        Some(Command::Error) if payload.is_empty() => Err(PayloadError::Empty("error")),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn motion_layout_is_little_endian_floats() {
        let bytes = Motion::new(10.0, 20.0, 5.0, 50.0).encode();
        assert_eq!(bytes.len(), 16);
        assert_eq!(&bytes[..4], &10.0f32.to_le_bytes());
        assert_eq!(&bytes[12..], &50.0f32.to_le_bytes());
        let parsed = Motion::parse(&bytes).unwrap();
        assert_eq!(parsed, Motion::new(10.0, 20.0, 5.0, 50.0));
    }

    #[test]
    fn motion_rejects_short_payload() {
        let err = Motion::parse(&[0u8; 15]).unwrap_err();
        assert_eq!(
            err,
            PayloadError::WrongSize {
                what: "motion",
                got: 15,
                expected: 16
            }
        );
    }

    #[test]
    fn dispense_duration_is_big_endian() {
        let bytes = DispenseParams::new(1.5, 0.2, 25.0, 0x0102_0304).encode();
        assert_eq!(&bytes[12..], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(DispenseParams::parse(&bytes).unwrap().duration_ms, 0x0102_0304);
    }

    #[test]
    fn parameter_int_layout() {
        let bytes = Parameter::new("speed", 300).encode().unwrap();
        assert_eq!(
            bytes.as_ref(),
            &[5, b's', b'p', b'e', b'e', b'd', PARAM_TYPE_INT, 0x00, 0x00, 0x01, 0x2C]
        );
    }

    #[test]
    fn parameter_values_parse_back() {
        for value in [
            ParamValue::Int(-7),
            ParamValue::Double(3.25),
            ParamValue::Str("nozzle-a".into()),
            ParamValue::Bool(true),
        ] {
            let param = Parameter::new("p", value);
            let bytes = param.encode().unwrap();
            assert_eq!(Parameter::parse(&bytes).unwrap(), param);
        }
    }

    #[test]
    fn parameter_unknown_tag() {
        let err = Parameter::parse(&[1, b'a', 0x09, 0]).unwrap_err();
        assert_eq!(err, PayloadError::UnknownParamType(0x09));
    }

    #[test]
    fn parameter_truncated_value() {
        let err = Parameter::parse(&[1, b'a', PARAM_TYPE_INT, 0, 0]).unwrap_err();
        assert_eq!(
            err,
            PayloadError::TooShort {
                what: "parameter",
                got: 5,
                need: 7
            }
        );
    }

    #[test]
    fn parameter_name_too_long() {
        let name = "n".repeat(256);
        assert_eq!(
            Parameter::new(name, true).encode().unwrap_err(),
            FrameError::NameTooLong(256)
        );
    }

    #[test]
    fn heartbeat_ping_is_nine_bytes() {
        let ping = Heartbeat::Ping {
            timestamp_ms: 0x0000_0102_0304_0506,
        };
        let bytes = ping.encode();
        assert_eq!(
            bytes.as_ref(),
            &[HEARTBEAT_PING, 0, 0, 1, 2, 3, 4, 5, 6]
        );
        assert_eq!(Heartbeat::parse(&bytes).unwrap(), ping);
    }

    #[test]
    fn heartbeat_pong_forms() {
        assert_eq!(
            Heartbeat::parse(&[HEARTBEAT_PONG]).unwrap(),
            Heartbeat::Pong { timestamp_ms: None }
        );
        let echoed = Heartbeat::Ping { timestamp_ms: 42 }.answer().unwrap();
        assert_eq!(Heartbeat::parse(&echoed.encode()).unwrap(), echoed);
        assert_eq!(
            Heartbeat::parse(&[0x07]).unwrap_err(),
            PayloadError::UnknownHeartbeatType(0x07)
        );
    }

    #[test]
    fn response_carries_original_command() {
        let resp = Response::new(Command::GetPosition, Bytes::from_static(b"\x01\x02"));
        let bytes = resp.encode().unwrap();
        assert_eq!(bytes.as_ref(), &[0x18, 0x01, 0x02]);
        let parsed = Response::parse(&bytes).unwrap();
        assert_eq!(parsed.original_command(), Some(Command::GetPosition));
    }

    #[test]
    fn error_report_truncates_long_message() {
        let report = ErrorReport::new(ErrorCode::NotReady, Some("é".repeat(200)));
        let bytes = report.encode();
        assert!(bytes.len() <= MAX_PAYLOAD);
        let parsed = ErrorReport::parse(&bytes).unwrap();
        assert_eq!(parsed.kind(), ErrorCode::NotReady);
        assert_eq!(parsed.message.unwrap().chars().count(), 127);
    }

    #[test]
    fn validate_by_command() {
        assert!(validate_payload(Command::MoveToPosition.code(), &[0; 16]).is_ok());
        assert!(validate_payload(Command::MoveToPosition.code(), &[0; 12]).is_err());
        assert!(validate_payload(Command::SetGlueParameters.code(), &[0; 17]).is_err());
        assert!(validate_payload(Command::Heartbeat.code(), &[]).is_err());
        assert!(validate_payload(Command::WriteParameter.code(), &[1, b'a', 0x09]).is_err());
        assert!(validate_payload(Command::DeviceStart.code(), &[]).is_ok());
        assert!(validate_payload(0x99, &[1, 2, 3]).is_ok());
    }
}
