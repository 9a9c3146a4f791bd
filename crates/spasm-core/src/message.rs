//! Wire codec: typed envelopes over length-prefixed frames
//!
//! Frame layout, all integers little-endian:
//!
//! ```text
//! type (1) | id (8) | session_id (8) | payload_size (3) | payload (payload_size)
//! ```
//!
//! The payload is JSON. An empty payload decodes to "no data".
//!
//! Decoding pulls bytes from a [`ByteSource`]. Finite sources fail with
//! [`Error::InsufficientData`] when a frame is incomplete, which is not a
//! protocol violation: the owner of a growing [`ByteBuffer`] restores its
//! read cursor and retries once more bytes arrive.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::conditions::{conditions_from_struct, conditions_to_struct, Conditions};
use crate::constants::{
    DATA_SIZE_FIELDSIZE, HEADER_SIZE, ID_FIELDSIZE, MAX_PAYLOAD_SIZE, NO_SESSION,
    SESSION_ID_FIELDSIZE, TYPE_FIELDSIZE,
};
use crate::sync::{Counter, Signal};
use crate::{Error, Result};

/// Enumerated message tag (closed set, codes 0..=11)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    ResponseOk = 0,
    ResponseFailed = 1,
    Ping = 2,
    Info = 3,
    Reset = 4,
    NewSession = 5,
    EndSession = 6,
    KeyExchangeInit = 7,
    KeyExchangeStart = 8,
    DataRequest = 9,
    KeyExchangeStep = 10,
    UserDataRequest = 11,
}

impl MessageType {
    /// Number of defined message types
    pub const COUNT: u8 = 12;

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            MessageType::ResponseOk => "RESPONSE_OK",
            MessageType::ResponseFailed => "RESPONSE_FAILED",
            MessageType::Ping => "PING",
            MessageType::Info => "INFO",
            MessageType::Reset => "RESET",
            MessageType::NewSession => "NEW_SESSION",
            MessageType::EndSession => "END_SESSION",
            MessageType::KeyExchangeInit => "KEY_EXCHANGE_INIT",
            MessageType::KeyExchangeStart => "KEY_EXCHANGE_START",
            MessageType::DataRequest => "DATA_REQUEST",
            MessageType::KeyExchangeStep => "KEY_EXCHANGE_STEP",
            MessageType::UserDataRequest => "USER_DATA_REQUEST",
        }
    }

    pub fn is_response(self) -> bool {
        matches!(self, MessageType::ResponseOk | MessageType::ResponseFailed)
    }
}

impl TryFrom<u8> for MessageType {
    type Error = Error;

    fn try_from(code: u8) -> Result<Self> {
        Ok(match code {
            0 => MessageType::ResponseOk,
            1 => MessageType::ResponseFailed,
            2 => MessageType::Ping,
            3 => MessageType::Info,
            4 => MessageType::Reset,
            5 => MessageType::NewSession,
            6 => MessageType::EndSession,
            7 => MessageType::KeyExchangeInit,
            8 => MessageType::KeyExchangeStart,
            9 => MessageType::DataRequest,
            10 => MessageType::KeyExchangeStep,
            11 => MessageType::UserDataRequest,
            other => return Err(Error::protocol(format!("Invalid message type - {}.", other))),
        })
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Per-instance message id generator, starting at 1.
///
/// Ids wrap modulo 2^(8 * ID_FIELDSIZE), which for an 8-byte field is
/// plain `u64` wrapping.
#[derive(Debug, Default)]
pub struct IdGenerator {
    counter: Counter,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> u64 {
        self.counter.inc()
    }
}

/// Identity announcement sent as the first frame of a dialed connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Identity key of the dialing component
    pub component: String,
    /// Dialer-chosen connection identifier, used for the tie-break
    pub connection: u64,
}

/// Payload schema per message type, validated at decode time
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Response { success: bool, data: Option<Value> },
    Ping,
    Info(PeerInfo),
    Reset,
    NewSession,
    EndSession,
    /// Ids of the custodians taking part in the ring, in any order
    KeyExchangeInit { members: Vec<String> },
    KeyExchangeStart,
    DataRequest { ids: Vec<String> },
    /// Ring intermediate key as lowercase hex
    KeyExchangeStep { key: String },
    UserDataRequest { conditions: Conditions },
}

impl Body {
    pub fn kind(&self) -> MessageType {
        match self {
            Body::Response { success: true, .. } => MessageType::ResponseOk,
            Body::Response { success: false, .. } => MessageType::ResponseFailed,
            Body::Ping => MessageType::Ping,
            Body::Info(_) => MessageType::Info,
            Body::Reset => MessageType::Reset,
            Body::NewSession => MessageType::NewSession,
            Body::EndSession => MessageType::EndSession,
            Body::KeyExchangeInit { .. } => MessageType::KeyExchangeInit,
            Body::KeyExchangeStart => MessageType::KeyExchangeStart,
            Body::DataRequest { .. } => MessageType::DataRequest,
            Body::KeyExchangeStep { .. } => MessageType::KeyExchangeStep,
            Body::UserDataRequest { .. } => MessageType::UserDataRequest,
        }
    }

    fn into_data(self) -> Result<Option<Value>> {
        Ok(match self {
            Body::Response { data, .. } => data,
            Body::Ping
            | Body::Reset
            | Body::NewSession
            | Body::EndSession
            | Body::KeyExchangeStart => None,
            Body::Info(info) => Some(serde_json::to_value(info)?),
            Body::KeyExchangeInit { members } => Some(serde_json::to_value(members)?),
            Body::DataRequest { ids } => Some(serde_json::to_value(ids)?),
            Body::KeyExchangeStep { key } => Some(Value::String(key)),
            Body::UserDataRequest { conditions } => Some(conditions_to_struct(&conditions)),
        })
    }
}

/// Wire envelope
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub kind: MessageType,
    pub id: u64,
    pub session_id: u64,
    pub data: Option<Value>,
}

impl Message {
    /// Create a session-less message with an explicit id
    pub fn new(kind: MessageType, id: u64, data: Option<Value>) -> Self {
        Self {
            kind,
            id,
            session_id: NO_SESSION,
            data,
        }
    }

    /// Create a message with an id minted by `ids`
    pub fn request(ids: &IdGenerator, kind: MessageType, data: Option<Value>) -> Self {
        Self::new(kind, ids.next_id(), data)
    }

    /// Create a message from a typed body
    pub fn from_body(id: u64, body: Body) -> Result<Self> {
        let kind = body.kind();
        Ok(Self::new(kind, id, body.into_data()?))
    }

    pub fn with_session(mut self, session_id: u64) -> Self {
        self.session_id = session_id;
        self
    }

    /// Reply correlated by `id` and `session_id`
    pub fn generate_reply(&self, success: bool, data: Option<Value>) -> Message {
        let kind = if success {
            MessageType::ResponseOk
        } else {
            MessageType::ResponseFailed
        };
        Message {
            kind,
            id: self.id,
            session_id: self.session_id,
            data,
        }
    }

    pub fn is_response(&self) -> bool {
        self.kind.is_response()
    }

    pub fn is_ok(&self) -> bool {
        self.kind == MessageType::ResponseOk
    }

    /// Look up a payload field, failing with a protocol violation if absent
    pub fn read_field(&self, key: &str) -> Result<&Value> {
        self.data
            .as_ref()
            .and_then(|data| data.get(key))
            .ok_or_else(|| {
                Error::protocol(format!(
                    "Key '{}' not found in data of message of type '{}'.",
                    key, self.kind
                ))
            })
    }

    /// Look up a payload field, falling back to `default` if absent
    pub fn read_field_or<'a>(&'a self, key: &str, default: &'a Value) -> &'a Value {
        self.data
            .as_ref()
            .and_then(|data| data.get(key))
            .unwrap_or(default)
    }

    /// Interpret the payload according to the schema of `kind`
    pub fn body(&self) -> Result<Body> {
        let data = self.data.as_ref().filter(|v| !v.is_null());
        let schema_error = |expected: &str| {
            Error::protocol(format!(
                "Payload of message of type '{}' must be {}.",
                self.kind, expected
            ))
        };
        let no_payload = |body: Body| match data {
            None => Ok(body),
            Some(_) => Err(schema_error("empty")),
        };
        let string_list = || -> Result<Vec<String>> {
            let items = data
                .and_then(Value::as_array)
                .ok_or_else(|| schema_error("a list of ids"))?;
            items
                .iter()
                .map(|item| {
                    item.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| schema_error("a list of ids"))
                })
                .collect()
        };

        match self.kind {
            MessageType::ResponseOk | MessageType::ResponseFailed => Ok(Body::Response {
                success: self.kind == MessageType::ResponseOk,
                data: self.data.clone(),
            }),
            MessageType::Ping => no_payload(Body::Ping),
            MessageType::Reset => no_payload(Body::Reset),
            MessageType::NewSession => no_payload(Body::NewSession),
            MessageType::EndSession => no_payload(Body::EndSession),
            MessageType::KeyExchangeStart => no_payload(Body::KeyExchangeStart),
            MessageType::Info => {
                let value = data.ok_or_else(|| schema_error("a peer announcement"))?;
                let info: PeerInfo = serde_json::from_value(value.clone())
                    .map_err(|_| schema_error("a peer announcement"))?;
                Ok(Body::Info(info))
            }
            MessageType::KeyExchangeInit => Ok(Body::KeyExchangeInit {
                members: string_list()?,
            }),
            MessageType::DataRequest => Ok(Body::DataRequest { ids: string_list()? }),
            MessageType::KeyExchangeStep => {
                let key = data
                    .and_then(Value::as_str)
                    .filter(|s| !s.is_empty() && s.bytes().all(|b| b.is_ascii_hexdigit()))
                    .ok_or_else(|| schema_error("a hexadecimal intermediate key"))?;
                Ok(Body::KeyExchangeStep {
                    key: key.to_ascii_lowercase(),
                })
            }
            MessageType::UserDataRequest => {
                let value = data.ok_or_else(|| schema_error("a condition struct"))?;
                let conditions = conditions_from_struct(value)
                    .map_err(|e| Error::protocol(format!("Invalid condition struct: {}", e)))?;
                Ok(Body::UserDataRequest { conditions })
            }
        }
    }

    fn encode_payload(&self) -> Result<Vec<u8>> {
        match &self.data {
            Some(data) => Ok(serde_json::to_vec(data)?),
            None => Ok(Vec::new()),
        }
    }

    /// Serialize to a frame
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let payload = self.encode_payload()?;
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(Error::protocol(format!(
                "Header values exceeding limits: payload of {} bytes exceeds {}.",
                payload.len(),
                MAX_PAYLOAD_SIZE
            )));
        }

        let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
        frame.extend(encode_uint(self.kind.code() as u64, TYPE_FIELDSIZE)?);
        frame.extend(encode_uint(self.id, ID_FIELDSIZE)?);
        frame.extend(encode_uint(self.session_id, SESSION_ID_FIELDSIZE)?);
        frame.extend(encode_uint(payload.len() as u64, DATA_SIZE_FIELDSIZE)?);
        frame.extend(payload);
        Ok(frame)
    }

    /// Decode one frame from `source`
    pub fn decode<S: ByteSource + ?Sized>(source: &mut S) -> Result<Message> {
        Self::decode_frame(source)?.map_err(|rejected| rejected.error)
    }

    /// Decode one frame, keeping payload rejections apart from framing
    /// errors. A rejected frame has been consumed whole, so the source is
    /// still aligned on the next frame.
    pub fn decode_frame<S: ByteSource + ?Sized>(source: &mut S) -> Result<Frame> {
        let header = source.take(HEADER_SIZE)?;
        let (kind, id, session_id, size) = parse_header(&header)?;
        let payload = source.take(size)?;
        Ok(Self::assemble(kind, id, session_id, &payload).map_err(|error| RejectedFrame {
            kind,
            id,
            session_id,
            error,
        }))
    }

    /// Decode one complete frame from a byte slice
    pub fn from_bytes(bytes: &[u8]) -> Result<Message> {
        Self::decode(&mut BytesReader::from_slice(bytes))
    }

    /// Read one frame from a live stream.
    ///
    /// Blocks until the frame is complete. With a signal, gives up with
    /// [`Error::Cancelled`] or [`Error::Timeout`] once it fires.
    pub async fn read_from<R>(reader: &mut R, signal: Option<&Signal>) -> Result<Message>
    where
        R: AsyncRead + Unpin,
    {
        let header = read_exact(reader, HEADER_SIZE, signal).await?;
        let (kind, id, session_id, size) = parse_header(&header)?;
        let payload = read_exact(reader, size, signal).await?;
        Self::assemble(kind, id, session_id, &payload)
    }

    /// Write this message as one frame
    pub async fn write_to<W>(&self, writer: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let frame = self.to_bytes()?;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }

    fn assemble(kind: MessageType, id: u64, session_id: u64, payload: &[u8]) -> Result<Message> {
        let data = if payload.is_empty() {
            None
        } else {
            Some(serde_json::from_slice(payload).map_err(|e| {
                Error::protocol(format!("Malformed payload of message of type '{}': {}", kind, e))
            })?)
        };
        let message = Message {
            kind,
            id,
            session_id,
            data,
        };
        message.body()?;
        Ok(message)
    }
}

/// A decoded frame, or the header of one whose payload was rejected
pub type Frame = std::result::Result<Message, RejectedFrame>;

/// Frame with a valid header and an invalid payload
#[derive(Debug)]
pub struct RejectedFrame {
    pub kind: MessageType,
    pub id: u64,
    pub session_id: u64,
    pub error: Error,
}

impl RejectedFrame {
    /// RESPONSE_FAILED to the rejected request, carrying the reason
    pub fn reply(&self) -> Message {
        Message::new(self.kind, self.id, None)
            .with_session(self.session_id)
            .generate_reply(false, Some(Value::String(self.error.to_string())))
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "type `{}`, id `{}`, sid `{}`",
            self.kind, self.id, self.session_id
        )
    }
}

/// Encode `value` as a little-endian integer of exactly `width` bytes
pub fn encode_uint(value: u64, width: usize) -> Result<Vec<u8>> {
    if width == 0 || width > 8 || (width < 8 && value >> (8 * width) != 0) {
        return Err(Error::protocol(format!(
            "Header values exceeding limits: {} does not fit in {} bytes.",
            value, width
        )));
    }
    Ok(value.to_le_bytes()[..width].to_vec())
}

fn decode_uint(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf[..bytes.len()].copy_from_slice(bytes);
    u64::from_le_bytes(buf)
}

fn parse_header(header: &[u8]) -> Result<(MessageType, u64, u64, usize)> {
    let mut offset = 0;
    let mut field = |width: usize| {
        let value = decode_uint(&header[offset..offset + width]);
        offset += width;
        value
    };
    let code = field(TYPE_FIELDSIZE);
    let id = field(ID_FIELDSIZE);
    let session_id = field(SESSION_ID_FIELDSIZE);
    let size = field(DATA_SIZE_FIELDSIZE) as usize;
    let kind = MessageType::try_from(code as u8)?;
    Ok((kind, id, session_id, size))
}

async fn read_exact<R>(reader: &mut R, size: usize, signal: Option<&Signal>) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; size];
    match signal {
        Some(signal) => {
            signal.guard(reader.read_exact(&mut buf)).await??;
        }
        None => {
            reader.read_exact(&mut buf).await?;
        }
    }
    Ok(buf)
}

/// A finite or growing source of frame bytes
pub trait ByteSource {
    /// Take exactly `size` bytes, or fail with [`Error::InsufficientData`]
    fn take(&mut self, size: usize) -> Result<Vec<u8>>;
}

/// Growable receive buffer with a saved read position.
///
/// Call [`ByteBuffer::save`] before decoding a frame and
/// [`ByteBuffer::restore`] when decoding fails with insufficient data.
#[derive(Debug, Default)]
pub struct ByteBuffer {
    buf: Vec<u8>,
    idx: usize,
    save_idx: usize,
}

impl ByteBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn save(&mut self) {
        self.save_idx = self.idx;
    }

    pub fn restore(&mut self) {
        self.idx = self.save_idx;
    }

    /// Drop bytes before the saved position
    pub fn compact(&mut self) {
        self.buf.drain(..self.save_idx);
        self.idx -= self.save_idx;
        self.save_idx = 0;
    }

    /// Bytes available past the read cursor
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.idx
    }

    /// Decode every complete frame currently buffered.
    ///
    /// Stops at the first incomplete frame, leaving its bytes buffered.
    /// Frames with a rejected payload are returned in place; only a broken
    /// header fails the whole drain.
    pub fn drain_frames(&mut self) -> Result<Vec<Frame>> {
        let mut frames = Vec::new();
        loop {
            self.save();
            match Message::decode_frame(self) {
                Ok(frame) => frames.push(frame),
                Err(Error::InsufficientData { .. }) => {
                    self.restore();
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        self.compact();
        Ok(frames)
    }

    /// Like [`drain_frames`](Self::drain_frames), failing on any rejected
    /// payload
    pub fn drain_messages(&mut self) -> Result<Vec<Message>> {
        self.drain_frames()?
            .into_iter()
            .map(|frame| frame.map_err(|rejected| rejected.error))
            .collect()
    }
}

impl ByteSource for ByteBuffer {
    fn take(&mut self, size: usize) -> Result<Vec<u8>> {
        let available = self.remaining();
        if available < size {
            return Err(Error::InsufficientData {
                needed: size - available,
            });
        }
        let bytes = self.buf[self.idx..self.idx + size].to_vec();
        self.idx += size;
        Ok(bytes)
    }
}

/// Reader over a raw byte iterator
pub struct BytesReader<I> {
    iter: I,
}

impl<I: Iterator<Item = u8>> BytesReader<I> {
    pub fn new(iter: I) -> Self {
        Self { iter }
    }
}

impl<'a> BytesReader<std::iter::Copied<std::slice::Iter<'a, u8>>> {
    pub fn from_slice(bytes: &'a [u8]) -> Self {
        Self::new(bytes.iter().copied())
    }
}

impl<I: Iterator<Item = u8>> ByteSource for BytesReader<I> {
    fn take(&mut self, size: usize) -> Result<Vec<u8>> {
        let bytes: Vec<u8> = self.iter.by_ref().take(size).collect();
        if bytes.len() < size {
            return Err(Error::InsufficientData {
                needed: size - bytes.len(),
            });
        }
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conditions::{Bound, BoundType, Condition};
    use serde_json::json;

    fn sample_messages() -> Vec<Message> {
        vec![
            Message::new(MessageType::Ping, 1, None),
            Message::new(MessageType::DataRequest, 42, Some(json!(["p1", "p2"]))).with_session(7),
            Message::new(MessageType::KeyExchangeStep, u64::MAX, Some(json!("0abcdef")))
                .with_session(u64::MAX),
            Message::new(
                MessageType::ResponseOk,
                9,
                Some(json!([["aa", {"x": 1}], ["bb", {"y": true}]])),
            ),
        ]
    }

    #[test]
    fn test_header_layout() {
        let message = Message::new(MessageType::DataRequest, 0x0102, Some(json!(["a"])))
            .with_session(0x03);
        let bytes = message.to_bytes().unwrap();
        assert_eq!(bytes[0], 9);
        assert_eq!(&bytes[1..9], &[0x02, 0x01, 0, 0, 0, 0, 0, 0]);
        assert_eq!(&bytes[9..17], &[0x03, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(&bytes[17..20], &[5, 0, 0]);
        assert_eq!(&bytes[20..], b"[\"a\"]");
    }

    #[test]
    fn test_roundtrip() {
        for message in sample_messages() {
            let bytes = message.to_bytes().unwrap();
            assert_eq!(Message::from_bytes(&bytes).unwrap(), message);
        }
    }

    #[test]
    fn test_partial_reads_one_byte_at_a_time() {
        let messages = sample_messages();
        let stream: Vec<u8> = messages
            .iter()
            .flat_map(|m| m.to_bytes().unwrap())
            .collect();

        let mut buffer = ByteBuffer::new();
        let mut decoded = Vec::new();
        for byte in stream {
            buffer.append(&[byte]);
            decoded.extend(buffer.drain_messages().unwrap());
        }
        assert_eq!(decoded, messages);
        assert_eq!(buffer.remaining(), 0);
    }

    #[test]
    fn test_rejected_payload_keeps_stream_aligned() {
        let bad = Message::new(MessageType::DataRequest, 12, Some(json!({"not": "ids"}))).with_session(3);
        let ping = Message::new(MessageType::Ping, 13, None);
        let mut buffer = ByteBuffer::new();
        buffer.append(&bad.to_bytes().unwrap());
        buffer.append(&ping.to_bytes().unwrap());

        let frames = buffer.drain_frames().unwrap();
        assert_eq!(frames.len(), 2);
        let rejected = frames[0].as_ref().unwrap_err();
        assert_eq!((rejected.kind, rejected.id, rejected.session_id), (MessageType::DataRequest, 12, 3));
        assert!(matches!(rejected.error, Error::ProtocolViolation(_)));
        let reply = rejected.reply();
        assert_eq!(reply.kind, MessageType::ResponseFailed);
        assert_eq!((reply.id, reply.session_id), (12, 3));
        assert_eq!(frames[1].as_ref().unwrap(), &ping);
        assert_eq!(buffer.remaining(), 0);
    }

    #[test]
    fn test_insufficient_data_is_not_a_violation() {
        let bytes = Message::new(MessageType::DataRequest, 5, Some(json!(["id"])))
            .to_bytes()
            .unwrap();
        let mut buffer = ByteBuffer::new();
        buffer.append(&bytes[..HEADER_SIZE + 1]);
        buffer.save();
        let err = Message::decode(&mut buffer).unwrap_err();
        assert!(matches!(err, Error::InsufficientData { .. }));
        buffer.restore();
        buffer.append(&bytes[HEADER_SIZE + 1..]);
        let message = Message::decode(&mut buffer).unwrap();
        assert_eq!(message.id, 5);
    }

    #[test]
    fn test_bytes_reader_short_input() {
        let err = Message::from_bytes(&[2, 1, 0]).unwrap_err();
        assert!(matches!(err, Error::InsufficientData { needed: 17 }));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let mut bytes = Message::new(MessageType::Ping, 1, None).to_bytes().unwrap();
        bytes[0] = MessageType::COUNT;
        let err = Message::from_bytes(&bytes).unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation(_)));
        assert!(MessageType::try_from(255).is_err());
    }

    #[test]
    fn test_field_overflow_rejected() {
        assert!(matches!(encode_uint(256, 1), Err(Error::ProtocolViolation(_))));
        assert!(matches!(encode_uint(1 << 24, 3), Err(Error::ProtocolViolation(_))));
        assert_eq!(encode_uint((1 << 24) - 1, 3).unwrap(), vec![0xff, 0xff, 0xff]);
        assert_eq!(encode_uint(u64::MAX, 8).unwrap(), vec![0xff; 8]);
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let big = "x".repeat(MAX_PAYLOAD_SIZE);
        let message = Message::new(MessageType::ResponseOk, 1, Some(json!(big)));
        assert!(matches!(message.to_bytes(), Err(Error::ProtocolViolation(_))));
    }

    #[test]
    fn test_empty_payload_is_no_data() {
        let bytes = Message::new(MessageType::Ping, 3, None).to_bytes().unwrap();
        assert_eq!(bytes.len(), HEADER_SIZE);
        assert_eq!(Message::from_bytes(&bytes).unwrap().data, None);
    }

    #[test]
    fn test_malformed_json_payload_rejected() {
        let mut bytes = Message::new(MessageType::ResponseOk, 3, None).to_bytes().unwrap();
        bytes[17] = 3;
        bytes.extend(b"{x]");
        let err = Message::from_bytes(&bytes).unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation(_)));
    }

    #[test]
    fn test_schema_validated_on_decode() {
        let bad = Message::new(MessageType::DataRequest, 1, Some(json!([1, 2])));
        let bytes = bad.to_bytes().unwrap();
        assert!(matches!(
            Message::from_bytes(&bytes),
            Err(Error::ProtocolViolation(_))
        ));

        let bad_step = Message::new(MessageType::KeyExchangeStep, 1, Some(json!("xyz")));
        assert!(bad_step.body().is_err());

        let ping_with_data = Message::new(MessageType::Ping, 1, Some(json!({"a": 1})));
        assert!(ping_with_data.body().is_err());
    }

    #[test]
    fn test_typed_bodies() {
        let init = Message::from_body(
            4,
            Body::KeyExchangeInit {
                members: vec!["a".into(), "b".into()],
            },
        )
        .unwrap();
        assert_eq!(init.kind, MessageType::KeyExchangeInit);
        assert_eq!(
            init.body().unwrap(),
            Body::KeyExchangeInit {
                members: vec!["a".into(), "b".into()]
            }
        );

        let mut conditions = Conditions::new();
        conditions.insert(
            "age".into(),
            Condition::new(BoundType::AtLeast, Bound::Int(50)),
        );
        let request = Message::from_body(5, Body::UserDataRequest { conditions: conditions.clone() })
            .unwrap();
        assert_eq!(request.data, Some(json!({"age": [3, 50]})));
        assert_eq!(request.body().unwrap(), Body::UserDataRequest { conditions });

        let info = Message::from_body(
            6,
            Body::Info(PeerInfo {
                component: "ds-1".into(),
                connection: 77,
            }),
        )
        .unwrap();
        assert_eq!(info.read_field("connection").unwrap(), &json!(77));
    }

    #[test]
    fn test_generate_reply() {
        let request = Message::new(MessageType::DataRequest, 11, Some(json!(["x"]))).with_session(3);
        let ok = request.generate_reply(true, Some(json!([])));
        assert_eq!(ok.kind, MessageType::ResponseOk);
        assert_eq!((ok.id, ok.session_id), (11, 3));
        let failed = request.generate_reply(false, None);
        assert_eq!(failed.kind, MessageType::ResponseFailed);
        assert!(!failed.is_ok());
    }

    #[test]
    fn test_read_field() {
        let message = Message::new(MessageType::ResponseOk, 1, Some(json!({"proof": "ab"})));
        assert_eq!(message.read_field("proof").unwrap(), &json!("ab"));
        let missing = message.read_field("salt").unwrap_err();
        assert!(missing.to_string().contains("'salt'"));
        assert!(missing.to_string().contains("RESPONSE_OK"));
        let default = json!(0);
        assert_eq!(message.read_field_or("salt", &default), &json!(0));
    }

    #[test]
    fn test_id_generator_is_per_instance() {
        let a = IdGenerator::new();
        let b = IdGenerator::new();
        assert_eq!(a.next_id(), 1);
        assert_eq!(a.next_id(), 2);
        assert_eq!(b.next_id(), 1);
        let message = Message::request(&a, MessageType::Ping, None);
        assert_eq!(message.id, 3);
        assert_eq!(message.session_id, NO_SESSION);
    }

    #[tokio::test]
    async fn test_read_from_stream() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let messages = sample_messages();
        let expected = messages.clone();
        let writer = tokio::spawn(async move {
            for message in &messages {
                message.write_to(&mut client).await.unwrap();
            }
        });
        for message in expected {
            assert_eq!(Message::read_from(&mut server, None).await.unwrap(), message);
        }
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_read_from_cancelled() {
        let (_client, mut server) = tokio::io::duplex(64);
        let signal = Signal::new().derive_with_timeout(std::time::Duration::from_millis(20));
        let err = Message::read_from(&mut server, Some(&signal)).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }
}
