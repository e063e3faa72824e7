//! Normalises heterogeneous backend responses into a [`Payload`].
//!
//! Backends answer in one of three shapes: a raw binary body with an
//! `audio/*` or `image/*` content type, a JSON object carrying the payload
//! under one of several field names, or an OpenAI-style `choices` array.
//! Plain text bodies are accepted last for text capabilities.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::Value;

use crate::error::AttemptError;
use crate::request::Payload;

/// Field names probed in order when the body is a JSON object.
pub const KNOWN_FIELDS: &[&str] = &[
    "audio", "wav", "data", "file", "response", "text", "output", "result",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Bytes,
    Text,
}

#[derive(Debug, Clone)]
pub struct RawResponse {
    pub content_type: String,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn new(content_type: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            content_type: content_type.into(),
            body: body.into(),
        }
    }

    pub async fn read(response: reqwest::Response) -> Result<Self, AttemptError> {
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let body = response.bytes().await?.to_vec();
        Ok(Self { content_type, body })
    }

    fn json(&self) -> Option<Value> {
        serde_json::from_slice(&self.body).ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decoder {
    Binary,
    JsonField,
    Choices,
    PlainText,
}

pub const DECODERS: [Decoder; 4] = [
    Decoder::Binary,
    Decoder::JsonField,
    Decoder::Choices,
    Decoder::PlainText,
];

impl Decoder {
    pub fn try_decode(self, raw: &RawResponse, kind: PayloadKind) -> Option<Payload> {
        match self {
            Decoder::Binary => decode_binary(raw, kind),
            Decoder::JsonField => decode_json_field(&raw.json()?, kind),
            Decoder::Choices => decode_choices(&raw.json()?, kind),
            Decoder::PlainText => decode_plain_text(raw, kind),
        }
    }
}

/// Runs [`DECODERS`] in order and returns the first payload produced.
pub fn decode(raw: &RawResponse, kind: PayloadKind) -> Result<Payload, AttemptError> {
    DECODERS
        .iter()
        .find_map(|d| d.try_decode(raw, kind))
        .ok_or_else(|| {
            AttemptError::Malformed(format!(
                "no decoder matched a {} byte '{}' response",
                raw.body.len(),
                raw.content_type
            ))
        })
}

fn decode_binary(raw: &RawResponse, kind: PayloadKind) -> Option<Payload> {
    if kind != PayloadKind::Bytes || raw.body.is_empty() {
        return None;
    }
    let ct = raw.content_type.to_ascii_lowercase();
    (ct.starts_with("audio/") || ct.starts_with("image/")).then(|| Payload::Bytes(raw.body.clone()))
}

fn decode_json_field(json: &Value, kind: PayloadKind) -> Option<Payload> {
    let obj = json.as_object()?;
    KNOWN_FIELDS
        .iter()
        .filter_map(|field| obj.get(*field))
        .find_map(|value| payload_from_value(value, kind))
}

fn payload_from_value(value: &Value, kind: PayloadKind) -> Option<Payload> {
    match (value, kind) {
        (Value::String(s), PayloadKind::Bytes) => {
            let bytes = STANDARD.decode(strip_data_uri(s).trim()).ok()?;
            (!bytes.is_empty()).then_some(Payload::Bytes(bytes))
        }
        (Value::String(s), PayloadKind::Text) => {
            let s = s.trim();
            (!s.is_empty()).then(|| Payload::Text(s.to_string()))
        }
        (Value::Array(items), PayloadKind::Bytes) => {
            let bytes = items
                .iter()
                .map(|v| v.as_u64().and_then(|n| u8::try_from(n).ok()))
                .collect::<Option<Vec<u8>>>()?;
            (!bytes.is_empty()).then_some(Payload::Bytes(bytes))
        }
        _ => None,
    }
}

fn strip_data_uri(s: &str) -> &str {
    match s.split_once(";base64,") {
        Some((prefix, rest)) if prefix.starts_with("data:") => rest,
        _ => s,
    }
}

fn decode_choices(json: &Value, kind: PayloadKind) -> Option<Payload> {
    if kind != PayloadKind::Text {
        return None;
    }
    let first = json.get("choices")?.as_array()?.first()?;
    let text = first
        .get("text")
        .and_then(Value::as_str)
        .or_else(|| {
            let message = first.get("message")?;
            message
                .get("content")
                .and_then(Value::as_str)
                .or_else(|| message.as_str())
        })?
        .trim();
    (!text.is_empty()).then(|| Payload::Text(text.to_string()))
}

fn decode_plain_text(raw: &RawResponse, kind: PayloadKind) -> Option<Payload> {
    if kind != PayloadKind::Text {
        return None;
    }
    let text = std::str::from_utf8(&raw.body).ok()?.trim();
    if text.is_empty() || text.starts_with('{') || text.starts_with('[') {
        return None;
    }
    Some(Payload::Text(text.to_string()))
}
