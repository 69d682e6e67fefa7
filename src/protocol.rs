//! Framed binary wire protocol for per-session IPC sockets.
//!
//! Every message is a 5-byte header (1 byte type + 4 bytes big-endian payload
//! length) followed by the payload. The codec tolerates arbitrary stream
//! fragmentation and coalescing; a frame is only emitted once its full payload
//! has arrived.
//!
//! | Type          | Value | Dir  | Payload                                  |
//! |---------------|-------|------|------------------------------------------|
//! | STDIN_DATA    | 0x01  | both | raw terminal bytes (stdin in, output out)|
//! | CONTROL_CMD   | 0x02  | C→S  | JSON `{"cmd": …}`                        |
//! | STATUS_UPDATE | 0x03  | both | JSON `{"app", "status", …extras}`        |
//! | HEARTBEAT     | 0x04  | both | empty                                    |
//! | ERROR         | 0x05  | S→C  | JSON `{"code", "message", "details"?}`   |
//!
//! Frames longer than the configured maximum are a fatal framing error; the
//! caller is expected to close the connection. Unknown type bytes decode
//! successfully (the raw `kind` is preserved) and are rejected at dispatch so
//! the peer gets an `INVALID_MESSAGE_TYPE` error instead of a dead socket.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::CoreError;

/// Header size: type byte + u32 length.
pub const HEADER_LEN: usize = 5;

/// Default maximum payload size (16 MiB).
pub const DEFAULT_MAX_FRAME: usize = 16 * 1024 * 1024;

/// Known frame types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    StdinData = 0x01,
    ControlCmd = 0x02,
    StatusUpdate = 0x03,
    Heartbeat = 0x04,
    Error = 0x05,
}

impl FrameType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::StdinData),
            0x02 => Some(Self::ControlCmd),
            0x03 => Some(Self::StatusUpdate),
            0x04 => Some(Self::Heartbeat),
            0x05 => Some(Self::Error),
            _ => None,
        }
    }
}

/// A single decoded frame. `kind` is kept raw so unknown types survive
/// decoding and can be reported back to the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireFrame {
    pub kind: u8,
    pub payload: Bytes,
}

impl WireFrame {
    pub fn new(frame_type: FrameType, payload: impl Into<Bytes>) -> Self {
        Self {
            kind: frame_type as u8,
            payload: payload.into(),
        }
    }

    /// Empty-payload frame (HEARTBEAT).
    pub fn empty(frame_type: FrameType) -> Self {
        Self::new(frame_type, Bytes::new())
    }

    pub fn frame_type(&self) -> Option<FrameType> {
        FrameType::from_u8(self.kind)
    }
}

/// Stateful length-prefixed codec over a byte stream.
pub struct FrameCodec {
    max_frame: usize,
}

impl FrameCodec {
    pub fn new(max_frame: usize) -> Self {
        Self { max_frame }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME)
    }
}

impl Decoder for FrameCodec {
    type Item = WireFrame;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<WireFrame>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[1], src[2], src[3], src[4]]) as usize;
        if length > self.max_frame {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("frame length {length} exceeds maximum {}", self.max_frame),
            ));
        }

        if src.len() < HEADER_LEN + length {
            // Wait for the rest of the payload.
            src.reserve(HEADER_LEN + length - src.len());
            return Ok(None);
        }

        let kind = src[0];
        src.advance(HEADER_LEN);
        let payload = src.split_to(length).freeze();
        Ok(Some(WireFrame { kind, payload }))
    }
}

impl Encoder<WireFrame> for FrameCodec {
    type Error = std::io::Error;

    fn encode(&mut self, frame: WireFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let length = frame.payload.len();
        if length > self.max_frame {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("refusing to encode {length}-byte payload"),
            ));
        }
        dst.reserve(HEADER_LEN + length);
        dst.put_u8(frame.kind);
        dst.put_u32(length as u32);
        dst.extend_from_slice(&frame.payload);
        Ok(())
    }
}

// ─── Typed payloads ──────────────────────────────────────────────────────────

/// CONTROL_CMD payload. Unknown JSON fields beyond the recognized ones are
/// discarded by deserialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "kebab-case")]
pub enum ControlCommand {
    Resize { cols: u16, rows: u16 },
    Kill {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signal: Option<String>,
    },
    ResetSize,
}

/// STATUS_UPDATE payload. `extras` carries any fields beyond `app`/`status`
/// verbatim so clients can attach arbitrary context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub app: String,
    pub status: String,
    #[serde(flatten)]
    pub extras: serde_json::Map<String, Value>,
}

/// ERROR payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorFrame {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ErrorFrame {
    pub fn from_error(err: &CoreError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Serialize into an ERROR wire frame.
    pub fn into_frame(self) -> WireFrame {
        // Serialization of a plain struct cannot fail.
        let json = serde_json::to_vec(&self).unwrap_or_default();
        WireFrame::new(FrameType::Error, json)
    }
}

/// Map a `kill` signal name to its number. Only the two documented signals
/// plus their bare forms are accepted.
pub fn parse_signal_name(name: &str) -> Option<i32> {
    match name {
        "SIGTERM" | "TERM" => Some(libc::SIGTERM),
        "SIGKILL" | "KILL" => Some(libc::SIGKILL),
        "SIGINT" | "INT" => Some(libc::SIGINT),
        "SIGHUP" | "HUP" => Some(libc::SIGHUP),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(codec: &mut FrameCodec, buf: &mut BytesMut) -> Vec<WireFrame> {
        let mut out = Vec::new();
        while let Ok(Some(frame)) = codec.decode(buf) {
            out.push(frame);
        }
        out
    }

    #[test]
    fn test_roundtrip() {
        let mut codec = FrameCodec::default();
        let frame = WireFrame::new(FrameType::StdinData, &b"hello\n"[..]);
        let mut buf = BytesMut::new();
        codec.encode(frame.clone(), &mut buf).unwrap();
        assert_eq!(buf.len(), HEADER_LEN + 6);
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_empty_payload() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        codec
            .encode(WireFrame::empty(FrameType::Heartbeat), &mut buf)
            .unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.frame_type(), Some(FrameType::Heartbeat));
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_fragmented_stream() {
        let mut codec = FrameCodec::default();
        let frame = WireFrame::new(FrameType::StatusUpdate, &b"{\"app\":\"x\"}"[..]);
        let mut encoded = BytesMut::new();
        codec.encode(frame.clone(), &mut encoded).unwrap();

        // Feed one byte at a time; the frame must appear exactly once, at the end.
        let mut buf = BytesMut::new();
        let mut decoded = Vec::new();
        for byte in &encoded[..] {
            buf.extend_from_slice(&[*byte]);
            if let Some(f) = codec.decode(&mut buf).unwrap() {
                decoded.push(f);
            }
        }
        assert_eq!(decoded, vec![frame]);
    }

    #[test]
    fn test_coalesced_frames() {
        let mut codec = FrameCodec::default();
        let a = WireFrame::new(FrameType::StdinData, &b"aa"[..]);
        let b = WireFrame::empty(FrameType::Heartbeat);
        let c = WireFrame::new(FrameType::Error, &b"{}"[..]);
        let mut buf = BytesMut::new();
        for f in [a.clone(), b.clone(), c.clone()] {
            codec.encode(f, &mut buf).unwrap();
        }
        assert_eq!(decode_all(&mut codec, &mut buf), vec![a, b, c]);
    }

    #[test]
    fn test_oversized_frame_is_fatal() {
        let mut codec = FrameCodec::new(16);
        let mut buf = BytesMut::new();
        buf.put_u8(0x01);
        buf.put_u32(17);
        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_unknown_type_survives_decoding() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        buf.put_u8(0x7f);
        buf.put_u32(3);
        buf.extend_from_slice(b"xyz");
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.kind, 0x7f);
        assert_eq!(frame.frame_type(), None);
        assert_eq!(&frame.payload[..], b"xyz");
    }

    #[test]
    fn test_partial_header_waits() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0x01, 0x00]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_control_command_shapes() {
        let resize: ControlCommand =
            serde_json::from_str(r#"{"cmd":"resize","cols":120,"rows":40}"#).unwrap();
        assert_eq!(resize, ControlCommand::Resize { cols: 120, rows: 40 });

        let kill: ControlCommand =
            serde_json::from_str(r#"{"cmd":"kill","signal":"SIGKILL"}"#).unwrap();
        assert_eq!(
            kill,
            ControlCommand::Kill {
                signal: Some("SIGKILL".to_string())
            }
        );

        let reset: ControlCommand = serde_json::from_str(r#"{"cmd":"reset-size"}"#).unwrap();
        assert_eq!(reset, ControlCommand::ResetSize);

        // Unrecognized extra fields are discarded, not an error.
        let with_extra: ControlCommand =
            serde_json::from_str(r#"{"cmd":"resize","cols":1,"rows":1,"bogus":true}"#).unwrap();
        assert_eq!(with_extra, ControlCommand::Resize { cols: 1, rows: 1 });
    }

    #[test]
    fn test_status_update_preserves_extras() {
        let raw = r#"{"app":"claude","status":"thinking","tokens":42,"nested":{"a":1}}"#;
        let update: StatusUpdate = serde_json::from_str(raw).unwrap();
        assert_eq!(update.app, "claude");
        assert_eq!(update.status, "thinking");
        assert_eq!(update.extras["tokens"], 42);
        assert_eq!(update.extras["nested"]["a"], 1);

        let back = serde_json::to_value(&update).unwrap();
        assert_eq!(back["tokens"], 42);
        assert_eq!(back["nested"]["a"], 1);
    }

    #[test]
    fn test_signal_name_parsing() {
        assert_eq!(parse_signal_name("SIGTERM"), Some(libc::SIGTERM));
        assert_eq!(parse_signal_name("SIGKILL"), Some(libc::SIGKILL));
        assert_eq!(parse_signal_name("SIGSTOP"), None);
        assert_eq!(parse_signal_name(""), None);
    }
}
