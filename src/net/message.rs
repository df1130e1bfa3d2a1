//! JSON-RPC wire messages and framing.
//!
//! The wallet server protocol is newline-delimited JSON-RPC 2.0 over TCP.
//! Frames are bounded by [`MAX_FRAME_SIZE`]; a line exceeding the bound is
//! a protocol error on the connection that produced it.

use crate::net::types::MAX_FRAME_SIZE;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::codec::LinesCodec;

/// Codec for one direction of a session transport.
pub fn line_codec() -> LinesCodec {
    LinesCodec::new_with_max_length(MAX_FRAME_SIZE)
}

/// Encode an outgoing request frame, without the trailing newline (the
/// codec appends it).
pub fn encode_request(id: u64, method: &str, params: &Value) -> String {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": method,
        "params": params,
    })
    .to_string()
}

/// Server-reported JSON-RPC error object.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
}

/// Any frame a server may send: a response to one of our requests, or a
/// server-initiated notification.
#[derive(Debug, Deserialize)]
struct RawFrame {
    id: Option<u64>,
    method: Option<String>,
    params: Option<Value>,
    result: Option<Value>,
    error: Option<RpcErrorObject>,
}

#[derive(Debug)]
pub enum Incoming {
    /// Response matched to a request by id.
    Response { id: u64, result: Result<Value, RpcErrorObject> },
    /// Server-initiated notification, routed by method.
    Notification { method: String, params: Value },
}

/// Decode one frame. `Err` carries a human-readable reason; the caller
/// logs and skips it rather than dropping the connection.
pub fn decode_frame(line: &str) -> Result<Incoming, String> {
    let frame: RawFrame = serde_json::from_str(line).map_err(|e| e.to_string())?;
    if let Some(id) = frame.id {
        let result = match frame.error {
            Some(err) => Err(err),
            None => Ok(frame.result.unwrap_or(Value::Null)),
        };
        return Ok(Incoming::Response { id, result });
    }
    match frame.method {
        Some(method) => Ok(Incoming::Notification {
            method,
            params: frame.params.unwrap_or(Value::Null),
        }),
        None => Err("frame has neither id nor method".into()),
    }
}
