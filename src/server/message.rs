use flate2::write::{DeflateDecoder, DeflateEncoder};
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::io::Write;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

use crate::utils::error::ServerError;

/// Body field that carries the client signature when crypto is enabled.
pub const CRYPTO_FIELD: &str = "__crypto__";

/// Method name that is never dispatchable. Requests naming it are treated as
/// an attack and the originating session is kicked.
pub const RESERVED_METHOD: &str = "constructor";

/// Represents different types of errors that can occur when processing frames.
#[derive(Error, Debug, Clone)]
pub enum MessageError {
    /// Error when the frame format is invalid.
    #[error("invalid message format")]
    InvalidFormat,

    /// Error when frame serialization or deserialization fails.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Error when the encoded result is empty.
    #[error("fail to send message for encode result is empty")]
    EncodeEmpty,

    /// Error when compression fails.
    #[error("compression error: {0}")]
    Compression(String),

    /// Error when decompression fails.
    #[error("decompression error: {0}")]
    Decompression(String),
}

/// Decoded inbound frame.
///
/// `id` present means the client expects a response; `id` absent means a
/// fire-and-forget notification that never receives one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub route: String,
    pub body: Value,
}

impl Message {
    /// A request frame that expects exactly one reply.
    pub fn request(id: u64, route: impl Into<String>, body: Value) -> Self {
        Message {
            id: Some(id),
            route: route.into(),
            body,
        }
    }

    /// A notification frame. Whatever happens server-side, no reply is sent.
    pub fn notify(route: impl Into<String>, body: Value) -> Self {
        Message {
            id: None,
            route: route.into(),
            body,
        }
    }

    pub fn is_request(&self) -> bool {
        self.id.is_some()
    }
}

/// Route string parsed once into its three segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRecord {
    pub route: String,
    pub server_type: String,
    pub handler: String,
    pub method: String,
}

impl RouteRecord {
    /// Parses `serverType.handler.method`. Any other arity, or an empty
    /// segment, is an invalid route.
    pub fn parse(route: &str) -> Option<RouteRecord> {
        let mut parts = route.split('.');
        let (server_type, handler, method) = (parts.next()?, parts.next()?, parts.next()?);
        if parts.next().is_some()
            || server_type.is_empty()
            || handler.is_empty()
            || method.is_empty()
        {
            return None;
        }
        Some(RouteRecord {
            route: route.to_string(),
            server_type: server_type.to_string(),
            handler: handler.to_string(),
            method: method.to_string(),
        })
    }
}

/// Pluggable decode hook: opaque transport payload to a frame, `None` to
/// silently discard.
pub type DecodeFn = Arc<dyn Fn(&[u8]) -> Option<Message> + Send + Sync>;

/// Pluggable encode hook for outbound responses and pushes.
pub type EncodeFn =
    Arc<dyn Fn(Option<u64>, &str, &Value) -> Result<Vec<u8>, MessageError> + Send + Sync>;

/// Connector-default decode: JSON, with a deflate-compressed fallback for
/// clients that compress their frames.
pub fn default_decode(raw: &[u8]) -> Option<Message> {
    if let Ok(msg) = serde_json::from_slice::<Message>(raw) {
        return Some(msg);
    }
    let inflated = decompress_message(raw).ok()?;
    serde_json::from_slice(&inflated).ok()
}

/// Connector-default encode: the response/push frame as JSON bytes. Pushes
/// carry no request id.
pub fn default_encode(
    request_id: Option<u64>,
    route: &str,
    body: &Value,
) -> Result<Vec<u8>, MessageError> {
    let frame = Message {
        id: request_id,
        route: route.to_string(),
        body: body.clone(),
    };
    let bytes =
        serde_json::to_vec(&frame).map_err(|e| MessageError::Serialization(e.to_string()))?;
    if bytes.is_empty() {
        return Err(MessageError::EncodeEmpty);
    }
    Ok(bytes)
}

/// Builds the outbound response body. An error that reached assembly without
/// an explicit application code yields `code = 500`.
pub fn assemble_response(err: Option<&ServerError>, resp: Option<Value>) -> Value {
    let mut resp = match resp {
        Some(Value::Null) | None => Value::Object(Default::default()),
        Some(v) => v,
    };
    if let Some(err) = err {
        let has_code = resp.get("code").map_or(false, |c| !c.is_null());
        if !has_code {
            if let Some(obj) = resp.as_object_mut() {
                obj.insert("code".into(), Value::from(err.code().unwrap_or(500)));
            }
        }
    }
    resp
}

/// Compresses a byte slice with raw deflate at the default level.
pub fn compress_message(data: &[u8]) -> Result<Vec<u8>, MessageError> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| MessageError::Compression(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| MessageError::Compression(e.to_string()))
}

/// Decompresses a raw-deflate byte slice.
pub fn decompress_message(data: &[u8]) -> Result<Vec<u8>, MessageError> {
    let mut decoder = DeflateDecoder::new(Vec::new());
    decoder
        .write_all(data)
        .map_err(|e| MessageError::Decompression(e.to_string()))?;
    decoder
        .finish()
        .map_err(|e| MessageError::Decompression(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn route_parse_accepts_three_segments() {
        let record = RouteRecord::parse("chat.room.say").unwrap();
        assert_eq!(record.server_type, "chat");
        assert_eq!(record.handler, "room");
        assert_eq!(record.method, "say");
        assert_eq!(record.route, "chat.room.say");
    }

    #[test]
    fn route_parse_rejects_wrong_arity() {
        assert!(RouteRecord::parse("").is_none());
        assert!(RouteRecord::parse("chat").is_none());
        assert!(RouteRecord::parse("chat.room").is_none());
        assert!(RouteRecord::parse("chat.room.say.loud").is_none());
    }

    #[test]
    fn route_parse_rejects_empty_segments() {
        assert!(RouteRecord::parse("chat..say").is_none());
        assert!(RouteRecord::parse(".room.say").is_none());
        assert!(RouteRecord::parse("chat.room.").is_none());
    }

    #[test]
    fn decode_handles_plain_and_compressed_json() {
        let msg = Message::request(7, "chat.room.say", json!({"content": "hi"}));
        let raw = serde_json::to_vec(&msg).unwrap();
        assert_eq!(default_decode(&raw), Some(msg.clone()));

        let deflated = compress_message(&raw).unwrap();
        assert_eq!(default_decode(&deflated), Some(msg));
    }

    #[test]
    fn compressed_frames_survive_large_and_expanding_bodies() {
        let big = "x".repeat(8 * 1024);
        let msg = Message::request(1, "chat.room.say", json!({"content": big}));
        let raw = serde_json::to_vec(&msg).unwrap();

        let deflated = compress_message(&raw).unwrap();
        assert_eq!(decompress_message(&deflated).unwrap(), raw);
        assert_eq!(default_decode(&deflated), Some(msg));

        // Incompressible input still round-trips even though deflate
        // expands it.
        let noise: Vec<u8> = (0..4096u32).map(|i| (i.wrapping_mul(2654435761) >> 13) as u8).collect();
        let deflated = compress_message(&noise).unwrap();
        assert_eq!(decompress_message(&deflated).unwrap(), noise);
    }

    #[test]
    fn decode_discards_garbage() {
        assert_eq!(default_decode(b"\x01\x02not json"), None);
    }

    #[test]
    fn notification_has_no_id_on_the_wire() {
        let bytes = default_encode(None, "chat.room.say", &json!({"x": 1})).unwrap();
        let frame: Value = serde_json::from_slice(&bytes).unwrap();
        assert!(frame.get("id").is_none());
    }

    #[test]
    fn response_assembly_defaults_error_code_to_500() {
        let err = ServerError::Handler("boom".into());
        let resp = assemble_response(Some(&err), None);
        assert_eq!(resp["code"], json!(500));
    }

    #[test]
    fn response_assembly_keeps_explicit_code() {
        let err = ServerError::Application {
            code: 403,
            message: "denied".into(),
        };
        let resp = assemble_response(Some(&err), Some(json!({"reason": "denied"})));
        assert_eq!(resp["code"], json!(403));

        let resp = assemble_response(
            Some(&ServerError::Handler("x".into())),
            Some(json!({"code": 409})),
        );
        assert_eq!(resp["code"], json!(409));
    }
}
