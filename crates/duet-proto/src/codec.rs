use serde_json::Value;
use thiserror::Error;

use crate::message::{MessageKind, SignalingMessage};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// `type` is missing, not a string, or names no known message.
    #[error("unknown message type: {}", .0.as_deref().unwrap_or("<missing>"))]
    UnknownType(Option<String>),
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
}

#[derive(Debug, Error)]
#[error("failed to encode {kind} message: {source}")]
pub struct EncodeError {
    pub kind: MessageKind,
    #[source]
    pub source: serde_json::Error,
}

pub fn encode(message: &SignalingMessage) -> Result<Vec<u8>, EncodeError> {
    serde_json::to_vec(message).map_err(|source| EncodeError {
        kind: message.kind(),
        source,
    })
}

pub fn encode_text(message: &SignalingMessage) -> Result<String, EncodeError> {
    serde_json::to_string(message).map_err(|source| EncodeError {
        kind: message.kind(),
        source,
    })
}

pub fn decode(bytes: &[u8]) -> Result<SignalingMessage, DecodeError> {
    let value: Value = serde_json::from_slice(bytes)
        .map_err(|err| DecodeError::MalformedPayload(format!("invalid json: {err}")))?;
    decode_value(value)
}

pub fn decode_text(text: &str) -> Result<SignalingMessage, DecodeError> {
    decode(text.as_bytes())
}

fn decode_value(value: Value) -> Result<SignalingMessage, DecodeError> {
    let kind = match value.as_object().map(|fields| fields.get("type")) {
        None => {
            return Err(DecodeError::MalformedPayload(
                "expected a json object".to_string(),
            ))
        }
        Some(Some(Value::String(tag))) => MessageKind::from_tag(tag)
            .ok_or_else(|| DecodeError::UnknownType(Some(tag.clone())))?,
        Some(Some(other)) => return Err(DecodeError::UnknownType(Some(other.to_string()))),
        Some(None) => return Err(DecodeError::UnknownType(None)),
    };

    serde_json::from_value(value)
        .map_err(|err| DecodeError::MalformedPayload(format!("{kind} message: {err}")))
}
