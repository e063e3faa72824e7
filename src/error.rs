use std::fmt;

use thiserror::Error;

use crate::request::Capability;

/// Why a single candidate could not satisfy a request.
///
/// Every variant is non-fatal: the resolver records it and moves on to the
/// next candidate in the chain.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AttemptError {
    /// Service not running, executable missing, connection refused or timed out.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// The backend answered but no decoder recognised the response.
    #[error("malformed response: {0}")]
    Malformed(String),

    /// The backend ran and reported a failure (non-zero exit, error status).
    #[error("failed: {0}")]
    Failed(String),
}

impl From<reqwest::Error> for AttemptError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() || e.is_timeout() {
            AttemptError::Unavailable(e.to_string())
        } else if e.is_decode() {
            AttemptError::Malformed(e.to_string())
        } else {
            AttemptError::Failed(e.to_string())
        }
    }
}

impl From<std::io::Error> for AttemptError {
    fn from(e: std::io::Error) -> Self {
        AttemptError::Failed(e.to_string())
    }
}

/// One entry of an exhausted chain: which candidate was tried and why it failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptFailure {
    pub candidate: String,
    pub error: AttemptError,
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.candidate, self.error)
    }
}

fn summarize(attempts: &[AttemptFailure]) -> String {
    if attempts.is_empty() {
        return "no candidates configured".to_string();
    }
    attempts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no {capability} backend available ({})", summarize(.attempts))]
    Exhausted {
        capability: Capability,
        attempts: Vec<AttemptFailure>,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{tool} failed: {detail}")]
    Tool { tool: String, detail: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
}

impl PipelineError {
    pub fn tool(tool: &str, detail: impl Into<String>) -> Self {
        PipelineError::Tool {
            tool: tool.to_string(),
            detail: detail.into(),
        }
    }

    /// Remediation shown to users of the control surface, when one is known.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            PipelineError::Exhausted {
                capability: Capability::Speech,
                ..
            } => Some("Install Coqui TTS, Piper, pico2wave or espeak-ng, or pass a TTS server URL"),
            PipelineError::Exhausted {
                capability: Capability::Image,
                ..
            } => Some("Run the A1111 WebUI with --api enabled"),
            PipelineError::Exhausted {
                capability: Capability::Story,
                ..
            } => Some("Install Ollama or pass an Ollama URL"),
            PipelineError::Config(_) => Some("Set POSTIZ_API_URL and POSTIZ_API_KEY to enable publishing"),
            PipelineError::Tool { tool, .. } if tool.starts_with("ff") => {
                Some("Install ffmpeg and make sure it is on PATH")
            }
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausted_message_names_every_candidate() {
        let err = PipelineError::Exhausted {
            capability: Capability::Speech,
            attempts: vec![
                AttemptFailure {
                    candidate: "http".into(),
                    error: AttemptError::Unavailable("connection refused".into()),
                },
                AttemptFailure {
                    candidate: "piper".into(),
                    error: AttemptError::Unavailable("piper not found on PATH".into()),
                },
            ],
        };
        let msg = err.to_string();
        assert!(msg.starts_with("no speech backend available"));
        assert!(msg.contains("http: unavailable: connection refused"));
        assert!(msg.contains("piper: unavailable"));
        assert!(err.hint().is_some());
    }

    #[test]
    fn empty_chain_is_described() {
        let err = PipelineError::Exhausted {
            capability: Capability::Image,
            attempts: vec![],
        };
        assert!(err.to_string().contains("no candidates configured"));
    }

    #[test]
    fn ffmpeg_failures_carry_install_hint() {
        let err = PipelineError::tool("ffmpeg", "exit status 1");
        assert_eq!(err.to_string(), "ffmpeg failed: exit status 1");
        assert!(err.hint().unwrap().contains("ffmpeg"));
    }
}
