//! Wire protocol for remote attribute access.
//!
//! Frames are length-prefixed binary records over TCP, little-endian:
//!
//! ```text
//! u32 length | u8 kind | kind-specific body
//! ```
//!
//! Three kinds exist: client requests, server responses (matched by
//! request id) and server-initiated value updates for subscriptions.
//! Attribute values and error details travel as JSON payload bytes, so
//! the framing stays independent of the attribute value types.

use crate::error::{ScopeError, ScopeResult};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on one frame; larger frames are a protocol violation.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

const KIND_REQUEST: u8 = 1;
const KIND_RESPONSE: u8 = 2;
const KIND_UPDATE: u8 = 3;

// =============================================================================
// Enums
// =============================================================================

/// Operation requested by a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Operation {
    Get = 1,
    Set = 2,
    Subscribe = 3,
    Unsubscribe = 4,
    ListComponents = 5,
    Ping = 6,
}

impl Operation {
    pub fn from_u8(value: u8) -> ScopeResult<Self> {
        match value {
            1 => Ok(Operation::Get),
            2 => Ok(Operation::Set),
            3 => Ok(Operation::Subscribe),
            4 => Ok(Operation::Unsubscribe),
            5 => Ok(Operation::ListComponents),
            6 => Ok(Operation::Ping),
            other => Err(ScopeError::Protocol(format!("unknown operation {other}"))),
        }
    }
}

/// Outcome of a request, carried in the response header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResponseStatus {
    Success = 0,
    /// Unclassified server-side failure; payload carries the message.
    Error = 1,
    NotFound = 2,
    InvalidRequest = 3,
    Timeout = 4,
    ValidationFailed = 5,
    ReadOnly = 6,
}

impl ResponseStatus {
    pub fn from_u8(value: u8) -> ScopeResult<Self> {
        match value {
            0 => Ok(ResponseStatus::Success),
            1 => Ok(ResponseStatus::Error),
            2 => Ok(ResponseStatus::NotFound),
            3 => Ok(ResponseStatus::InvalidRequest),
            4 => Ok(ResponseStatus::Timeout),
            5 => Ok(ResponseStatus::ValidationFailed),
            6 => Ok(ResponseStatus::ReadOnly),
            other => Err(ScopeError::Protocol(format!("unknown status {other}"))),
        }
    }
}

// =============================================================================
// Frames
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: u64,
    pub op: Operation,
    /// Component name; empty for tree-level operations.
    pub component: String,
    /// Attribute name; empty when the operation has no attribute.
    pub attribute: String,
    /// JSON payload bytes (e.g. the value for `Set`).
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: u64,
    pub status: ResponseStatus,
    /// JSON payload bytes: the value on success, the message on failure.
    pub payload: Vec<u8>,
}

/// Server-initiated push for a subscribed attribute.
#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    /// Per-connection sequence number, monotonically increasing.
    pub seq: u64,
    pub component: String,
    pub attribute: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Request(Request),
    Response(Response),
    Update(Update),
}

impl Frame {
    pub fn encode(&self) -> ScopeResult<Vec<u8>> {
        let mut body = Vec::with_capacity(64);
        match self {
            Frame::Request(r) => {
                body.push(KIND_REQUEST);
                body.extend_from_slice(&r.id.to_le_bytes());
                body.push(r.op as u8);
                put_string(&mut body, &r.component)?;
                put_string(&mut body, &r.attribute)?;
                put_payload(&mut body, &r.payload);
            }
            Frame::Response(r) => {
                body.push(KIND_RESPONSE);
                body.extend_from_slice(&r.id.to_le_bytes());
                body.push(r.status as u8);
                put_payload(&mut body, &r.payload);
            }
            Frame::Update(u) => {
                body.push(KIND_UPDATE);
                body.extend_from_slice(&u.seq.to_le_bytes());
                put_string(&mut body, &u.component)?;
                put_string(&mut body, &u.attribute)?;
                put_payload(&mut body, &u.payload);
            }
        }

        if body.len() > MAX_FRAME_LEN as usize {
            return Err(ScopeError::Protocol(format!(
                "frame body of {} bytes exceeds the {MAX_FRAME_LEN} byte limit",
                body.len()
            )));
        }
        let mut frame = Vec::with_capacity(body.len() + 4);
        frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    pub fn decode(body: &[u8]) -> ScopeResult<Frame> {
        let mut r = Reader::new(body);
        match r.u8()? {
            KIND_REQUEST => {
                let id = r.u64()?;
                let op = Operation::from_u8(r.u8()?)?;
                let component = r.string()?;
                let attribute = r.string()?;
                let payload = r.payload()?;
                r.finish()?;
                Ok(Frame::Request(Request {
                    id,
                    op,
                    component,
                    attribute,
                    payload,
                }))
            }
            KIND_RESPONSE => {
                let id = r.u64()?;
                let status = ResponseStatus::from_u8(r.u8()?)?;
                let payload = r.payload()?;
                r.finish()?;
                Ok(Frame::Response(Response {
                    id,
                    status,
                    payload,
                }))
            }
            KIND_UPDATE => {
                let seq = r.u64()?;
                let component = r.string()?;
                let attribute = r.string()?;
                let payload = r.payload()?;
                r.finish()?;
                Ok(Frame::Update(Update {
                    seq,
                    component,
                    attribute,
                    payload,
                }))
            }
            other => Err(ScopeError::Protocol(format!("unknown frame kind {other}"))),
        }
    }
}

/// Read one frame from a stream.
pub async fn read_frame<S: AsyncRead + Unpin>(stream: &mut S) -> ScopeResult<Frame> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf);
    if len == 0 || len > MAX_FRAME_LEN {
        return Err(ScopeError::Protocol(format!("invalid frame length {len}")));
    }
    let mut body = vec![0u8; len as usize];
    stream.read_exact(&mut body).await?;
    Frame::decode(&body)
}

/// Write one frame to a stream.
pub async fn write_frame<S: AsyncWrite + Unpin>(stream: &mut S, frame: &Frame) -> ScopeResult<()> {
    stream.write_all(&frame.encode()?).await?;
    stream.flush().await?;
    Ok(())
}

// =============================================================================
// Introspection payloads (JSON)
// =============================================================================

/// One entry of a `ListComponents` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentSummary {
    pub name: String,
    pub role: String,
    pub attributes: Vec<AttributeSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributeSummary {
    pub name: String,
    pub unit: Option<String>,
    pub read_only: bool,
    pub constraints: serde_json::Value,
}

// =============================================================================
// Buffer plumbing
// =============================================================================

fn put_string(buf: &mut Vec<u8>, value: &str) -> ScopeResult<()> {
    let bytes = value.as_bytes();
    let len = u16::try_from(bytes.len()).map_err(|_| {
        ScopeError::Protocol(format!("string of {} bytes does not fit a frame", bytes.len()))
    })?;
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(bytes);
    Ok(())
}

fn put_payload(buf: &mut Vec<u8>, payload: &[u8]) {
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(payload);
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> ScopeResult<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(ScopeError::Protocol("truncated frame".into()));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> ScopeResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> ScopeResult<u16> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn u32(&mut self) -> ScopeResult<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn u64(&mut self) -> ScopeResult<u64> {
        let bytes = self.take(8)?;
        let mut out = [0u8; 8];
        out.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(out))
    }

    fn string(&mut self) -> ScopeResult<String> {
        let len = self.u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| ScopeError::Protocol("invalid utf-8 in frame".into()))
    }

    fn payload(&mut self) -> ScopeResult<Vec<u8>> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn finish(&self) -> ScopeResult<()> {
        if self.pos != self.buf.len() {
            return Err(ScopeError::Protocol(format!(
                "{} trailing bytes in frame",
                self.buf.len() - self.pos
            )));
        }
        Ok(())
    }
}
