//! The JSON wire protocol: `[cmd, serial, subject, args]` frames and the
//! stable command/error-code vocabulary (SPEC_FULL.md §4.7 / §6).

use bytes::Bytes;
use thiserror::Error;

pub const ERROR: i64 = 1;
pub const REPLY: i64 = 2;
pub const NEW_CONNECTION: i64 = 10;
pub const CLOSE_CONNECTION: i64 = 11;
pub const NEW_PROXY: i64 = 20;
pub const CLOSE_PROXY: i64 = 21;
pub const CALL_METHOD: i64 = 22;
pub const CALL_METHOD_RETURN: i64 = 23;
pub const PROXY_SIGNAL: i64 = 30;
pub const PROXY_PROPS_CHANGED: i64 = 31;
pub const REGISTER_OBJECT: i64 = 40;
pub const UNREGISTER_OBJECT: i64 = 41;
pub const OBJECT_METHOD_CALL: i64 = 42;
pub const OBJECT_METHOD_RESPONSE: i64 = 43;
pub const EMIT_SIGNAL: i64 = 44;
pub const OWN_NAME: i64 = 50;
pub const UNOWN_NAME: i64 = 51;
pub const NAME_ACQUIRED: i64 = 52;
pub const NAME_LOST: i64 = 53;

pub const INVALID_DATA: u8 = 1;
pub const INVALID_HANDLE: u8 = 2;
pub const NOT_CONNECTED: u8 = 3;
#[allow(dead_code)]
pub const BUS_ERROR: u8 = 4;
pub const TIMEOUT: u8 = 5;
#[allow(dead_code)]
pub const CANCELLED: u8 = 6;

/// A malformed frame: not a 4-element JSON array, or a non-numeric
/// cmd/serial/subject.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("malformed bridge frame")]
pub struct FrameError;

pub struct Frame {
    pub cmd: i64,
    pub serial: i64,
    pub subject: i64,
    pub args: serde_json::Value,
}

impl Frame {
    pub fn parse(bytes: &[u8]) -> Result<Self, FrameError> {
        let value: serde_json::Value = serde_json::from_slice(bytes).map_err(|_| FrameError)?;
        let items = value.as_array().ok_or(FrameError)?;
        if items.len() != 4 {
            return Err(FrameError);
        }
        let cmd = items[0].as_i64().ok_or(FrameError)?;
        let serial = items[1].as_i64().ok_or(FrameError)?;
        let subject = items[2].as_i64().ok_or(FrameError)?;
        Ok(Self {
            cmd,
            serial,
            subject,
            args: items[3].clone(),
        })
    }

    pub fn encode(cmd: i64, serial: i64, subject: i64, args: serde_json::Value) -> Bytes {
        let value = serde_json::json!([cmd, serial, subject, args]);
        Bytes::from(serde_json::to_vec(&value).unwrap_or_default())
    }
}

/// Best-effort recovery of a serial from a frame whose overall shape
/// [`Frame::parse`] rejected, so a malformed-but-serial-bearing packet still
/// gets an `ERROR` reply instead of an unconditional peer close
/// (SPEC_FULL.md §4.7 failure semantics).
pub fn salvage_serial(bytes: &[u8]) -> Option<i64> {
    let value: serde_json::Value = serde_json::from_slice(bytes).ok()?;
    value.as_array()?.get(1)?.as_i64()
}

pub fn error_frame(serial: i64, subject: i64, code: u8, message: impl Into<String>) -> Bytes {
    Frame::encode(ERROR, serial, subject, serde_json::json!([code, message.into()]))
}

pub fn reply_frame(serial: i64, subject: i64, args: serde_json::Value) -> Bytes {
    Frame::encode(REPLY, serial, subject, args)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_new_connection_frame() {
        let frame = Frame::parse(br#"[10, 42, 0, ["unix:abstract=/tmp/b", false]]"#).unwrap();
        assert_eq!(frame.cmd, NEW_CONNECTION);
        assert_eq!(frame.serial, 42);
        assert_eq!(frame.subject, 0);
        assert_eq!(frame.args[0], "unix:abstract=/tmp/b");
        assert_eq!(frame.args[1], false);
    }

    #[test]
    fn rejects_wrong_arity() {
        assert_eq!(Frame::parse(br#"[10, 42, 0]"#).unwrap_err(), FrameError);
    }

    #[test]
    fn rejects_non_array() {
        assert_eq!(Frame::parse(br#"{"cmd": 10}"#).unwrap_err(), FrameError);
    }

    #[test]
    fn salvages_serial_from_bad_arity_frame() {
        assert_eq!(salvage_serial(br#"[10, 42]"#), Some(42));
        assert_eq!(salvage_serial(b"not json"), None);
    }

    #[test]
    fn reply_and_error_frames_round_trip() {
        // Mirrors the worked example: a request [10, 42, 0, ...] gets back
        // [2, 42, 0, [1]] — the reply's subject echoes the *request's*
        // subject, not its serial.
        let reply = reply_frame(42, 0, serde_json::json!([1]));
        let parsed = Frame::parse(&reply).unwrap();
        assert_eq!((parsed.cmd, parsed.serial, parsed.subject), (REPLY, 42, 0));
        assert_eq!(parsed.args, serde_json::json!([1]));

        let error = error_frame(8, 3, INVALID_HANDLE, "bad handle");
        let parsed = Frame::parse(&error).unwrap();
        assert_eq!((parsed.cmd, parsed.serial, parsed.subject), (ERROR, 8, 3));
        assert_eq!(parsed.args, serde_json::json!([INVALID_HANDLE, "bad handle"]));
    }
}
