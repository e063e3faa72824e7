//! Request and result types shared by every capability.

use std::fmt;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Story,
    Speech,
    Image,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Capability::Story => "story",
            Capability::Speech => "speech",
            Capability::Image => "image",
        };
        f.write_str(s)
    }
}

/// Optional per-request overrides. Candidates that do not understand a hint
/// ignore it.
#[derive(Debug, Clone, Default)]
pub struct BackendHints {
    pub url: Option<String>,
    pub voice: Option<String>,
    pub speed: Option<f32>,
    pub model: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub capability: Capability,
    pub input: String,
    pub hints: BackendHints,
}

impl GenerationRequest {
    pub fn new(capability: Capability, input: impl Into<String>) -> Self {
        Self {
            capability,
            input: input.into(),
            hints: BackendHints::default(),
        }
    }

    pub fn with_hints(mut self, hints: BackendHints) -> Self {
        self.hints = hints;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Bytes(Vec<u8>),
    Text(String),
}

impl Payload {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Payload::Bytes(b) => b,
            Payload::Text(t) => t.as_bytes(),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(t) => Some(t),
            Payload::Bytes(_) => None,
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Payload::Bytes(b) => b,
            Payload::Text(t) => t.into_bytes(),
        }
    }
}

/// Backend-reported auxiliary data attached to a successful attempt.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Extras {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

/// What a candidate hands back; the resolver stamps the provenance.
#[derive(Debug, Clone, PartialEq)]
pub struct Output {
    pub payload: Payload,
    pub extras: Extras,
}

impl Output {
    pub fn bytes(bytes: Vec<u8>) -> Self {
        Self {
            payload: Payload::Bytes(bytes),
            extras: Extras::default(),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self {
            payload: Payload::Text(text.into()),
            extras: Extras::default(),
        }
    }

    pub fn with_extras(mut self, extras: Extras) -> Self {
        self.extras = extras;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Provenance {
    pub backend: String,
    #[serde(flatten)]
    pub extras: Extras,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationResult {
    pub payload: Payload,
    pub provenance: Provenance,
}
