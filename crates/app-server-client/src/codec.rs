//! Line framing for the app-server protocol.
//!
//! Every frame is one JSON object on one line. Outbound frames never carry a
//! `jsonrpc` member; inbound frames are classified by which of `id`, `method`,
//! `result` and `error` they carry.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicI64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    String(String),
    Integer(i64),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(value) => f.write_str(value),
            Self::Integer(value) => write!(f, "{value}"),
        }
    }
}

/// Hands out strictly increasing integer ids, starting at 1.
#[derive(Debug)]
pub struct RequestIdAllocator {
    next: AtomicI64,
}

impl RequestIdAllocator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next: AtomicI64::new(1),
        }
    }

    pub fn next_id(&self) -> RequestId {
        RequestId::Integer(self.next.fetch_add(1, Ordering::SeqCst))
    }
}

impl Default for RequestIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("app-server error {code}: {message}")]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerNotification {
    pub method: String,
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerRequest {
    pub id: RequestId,
    pub method: String,
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Response {
        id: RequestId,
        outcome: Result<Value, RpcError>,
    },
    Notification(ServerNotification),
    ServerRequest(ServerRequest),
}

#[derive(Debug, Error)]
pub enum MalformedFrame {
    #[error("frame is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame is not a JSON object")]
    NotObject,
    #[error("frame method is not a string")]
    MethodNotString,
    #[error("frame id is neither a string nor an integer: {0}")]
    InvalidId(Value),
    #[error("frame has neither a method nor an id")]
    Shapeless,
}

#[derive(Serialize)]
struct OutboundRequest<'a, T: Serialize> {
    id: &'a RequestId,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<&'a T>,
}

#[derive(Serialize)]
struct OutboundNotification<'a, T: Serialize> {
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<&'a T>,
}

#[derive(Serialize)]
struct OutboundResult<'a, T: Serialize> {
    id: &'a RequestId,
    result: &'a T,
}

#[derive(Serialize)]
struct OutboundError<'a> {
    id: &'a RequestId,
    error: &'a RpcError,
}

pub fn encode_request<T: Serialize>(
    id: &RequestId,
    method: &str,
    params: Option<&T>,
) -> Result<String, serde_json::Error> {
    line(&OutboundRequest { id, method, params })
}

pub fn encode_notification<T: Serialize>(
    method: &str,
    params: Option<&T>,
) -> Result<String, serde_json::Error> {
    line(&OutboundNotification { method, params })
}

pub fn encode_response<T: Serialize>(
    id: &RequestId,
    result: &T,
) -> Result<String, serde_json::Error> {
    line(&OutboundResult { id, result })
}

pub fn encode_error_response(
    id: &RequestId,
    error: &RpcError,
) -> Result<String, serde_json::Error> {
    line(&OutboundError { id, error })
}

fn line<T: Serialize>(frame: &T) -> Result<String, serde_json::Error> {
    let mut payload = serde_json::to_string(frame)?;
    payload.push('\n');
    Ok(payload)
}

/// Classify one inbound line. Callers skip blank lines before decoding.
pub fn decode_frame(line: &str) -> Result<InboundFrame, MalformedFrame> {
    let value: Value = serde_json::from_str(line.trim())?;
    let Value::Object(mut object) = value else {
        return Err(MalformedFrame::NotObject);
    };

    let id = match object.remove("id") {
        None | Some(Value::Null) => None,
        Some(raw) => Some(
            serde_json::from_value::<RequestId>(raw.clone())
                .map_err(|_| MalformedFrame::InvalidId(raw))?,
        ),
    };

    if let Some(method) = object.remove("method") {
        let Value::String(method) = method else {
            return Err(MalformedFrame::MethodNotString);
        };
        let params = object.remove("params");
        return Ok(match id {
            Some(id) => InboundFrame::ServerRequest(ServerRequest { id, method, params }),
            None => InboundFrame::Notification(ServerNotification { method, params }),
        });
    }

    let Some(id) = id else {
        return Err(MalformedFrame::Shapeless);
    };

    let outcome = if let Some(error) = object.remove("error") {
        Err(parse_rpc_error(error))
    } else {
        Ok(object.remove("result").unwrap_or(Value::Null))
    };
    Ok(InboundFrame::Response { id, outcome })
}

fn parse_rpc_error(error: Value) -> RpcError {
    match serde_json::from_value::<RpcError>(error.clone()) {
        Ok(parsed) => parsed,
        Err(_) => RpcError {
            code: error.get("code").and_then(Value::as_i64).unwrap_or(-1),
            message: error
                .get("message")
                .and_then(Value::as_str)
                .map_or_else(|| error.to_string(), ToString::to_string),
            data: None,
        },
    }
}

/// Read one line, replacing invalid UTF-8 rather than failing the stream.
/// The trailing `\n` or `\r\n` is stripped; `None` means end of stream.
///
/// Cancel safe as long as the next call gets the same `buf`: bytes read
/// before a cancellation stay in it and complete the next line.
pub async fn read_line_lossy<R>(reader: &mut R, buf: &mut Vec<u8>) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    let read = reader.read_until(b'\n', buf).await?;
    if read == 0 && buf.is_empty() {
        return Ok(None);
    }
    let mut end = buf.len();
    if buf.ends_with(b"\n") {
        end -= 1;
        if buf[..end].ends_with(b"\r") {
            end -= 1;
        }
    }
    let line = String::from_utf8_lossy(&buf[..end]).into_owned();
    buf.clear();
    Ok(Some(line))
}
