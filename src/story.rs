//! Story text generation: remote model, local Ollama CLI, then a constant.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, error};

use crate::config::PipelineConfig;
use crate::decode::{self, PayloadKind, RawResponse};
use crate::error::AttemptError;
use crate::request::{BackendHints, Capability, Extras, GenerationRequest, GenerationResult, Output, Payload, Provenance};
use crate::resolver::{Candidate, CandidateList, resolve};
use crate::tool::run_tool;

/// Ollama `/api/generate` or any OpenAI-compatible completion endpoint.
pub struct HttpStory {
    client: reqwest::Client,
    default_url: Option<String>,
    default_model: String,
    timeout: Duration,
}

impl HttpStory {
    pub fn new(client: reqwest::Client, default_url: Option<String>, default_model: String, timeout: Duration) -> Self {
        Self {
            client,
            default_url,
            default_model,
            timeout,
        }
    }

    fn endpoints(base: &str) -> Vec<String> {
        let base = base.trim_end_matches('/');
        if base.ends_with("/api/generate") || base.ends_with("/completions") {
            vec![base.to_string()]
        } else {
            vec![format!("{base}/api/generate"), base.to_string()]
        }
    }
}

#[async_trait]
impl Candidate for HttpStory {
    fn name(&self) -> &str {
        "http"
    }

    async fn attempt(&self, request: &GenerationRequest) -> Result<Output, AttemptError> {
        let base = request
            .hints
            .url
            .as_deref()
            .or(self.default_url.as_deref())
            .ok_or_else(|| AttemptError::Unavailable("no story URL configured".into()))?;
        let model = request.hints.model.as_deref().unwrap_or(self.default_model.as_str());
        let body = json!({ "model": model, "prompt": request.input, "stream": false });

        let mut last = AttemptError::Unavailable(format!("{base} did not answer"));
        for url in Self::endpoints(base) {
            debug!("POST {}", url);
            let resp = match self.client.post(&url).json(&body).timeout(self.timeout).send().await {
                Ok(resp) => resp,
                Err(e) => {
                    last = e.into();
                    continue;
                }
            };
            if !resp.status().is_success() {
                last = AttemptError::Failed(format!("{url} returned {}", resp.status()));
                continue;
            }
            let raw = RawResponse::read(resp).await?;
            match decode::decode(&raw, PayloadKind::Text) {
                Ok(payload) => {
                    return Ok(Output {
                        payload,
                        extras: Extras {
                            prompt: Some(request.input.clone()),
                            ..Default::default()
                        },
                    });
                }
                Err(e) => last = e,
            }
        }
        Err(last)
    }
}

/// `ollama run <model> <prompt>`
pub struct OllamaCli {
    default_model: String,
}

impl OllamaCli {
    pub fn new(default_model: String) -> Self {
        Self { default_model }
    }
}

#[async_trait]
impl Candidate for OllamaCli {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn attempt(&self, request: &GenerationRequest) -> Result<Output, AttemptError> {
        let model = request.hints.model.clone().unwrap_or_else(|| self.default_model.clone());
        let out = run_tool("ollama", &["run".to_string(), model, request.input.clone()], None).await?;
        let story = out.stdout.trim();
        if story.is_empty() {
            return Err(AttemptError::Malformed("ollama printed nothing".into()));
        }
        Ok(Output::text(story))
    }
}

/// Terminal candidate; cannot fail.
pub struct StaticStory {
    text: String,
}

impl StaticStory {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

#[async_trait]
impl Candidate for StaticStory {
    fn name(&self) -> &str {
        "static"
    }

    async fn attempt(&self, _request: &GenerationRequest) -> Result<Output, AttemptError> {
        Ok(Output::text(self.text.clone()))
    }
}

pub struct StoryAdapter {
    candidates: CandidateList,
    fallback: String,
    default_prompt: String,
}

impl StoryAdapter {
    pub fn new(config: &PipelineConfig, client: reqwest::Client) -> Self {
        let candidates: CandidateList = vec![
            Box::new(HttpStory::new(
                client,
                config.story_url.clone(),
                config.story_model.clone(),
                config.story_timeout,
            )),
            Box::new(OllamaCli::new(config.story_model.clone())),
            Box::new(StaticStory::new(config.fallback_story.clone())),
        ];
        Self {
            candidates,
            fallback: config.fallback_story.clone(),
            default_prompt: config.story_prompt.clone(),
        }
    }

    /// The static fallback is appended to `candidates`, so the chain always ends
    /// in a candidate that succeeds.
    pub fn from_candidates(mut candidates: CandidateList, fallback: impl Into<String>, default_prompt: impl Into<String>) -> Self {
        let fallback = fallback.into();
        candidates.push(Box::new(StaticStory::new(fallback.clone())));
        Self {
            candidates,
            fallback,
            default_prompt: default_prompt.into(),
        }
    }

    /// Always produces a story.
    pub async fn generate(&self, prompt: Option<&str>, hints: BackendHints) -> GenerationResult {
        let prompt = prompt
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .unwrap_or(self.default_prompt.as_str());
        let request = GenerationRequest::new(Capability::Story, prompt).with_hints(hints);

        match resolve(Capability::Story, &self.candidates, &request).await {
            Ok(result) => result,
            Err(e) => {
                error!("story chain exhausted despite static fallback: {}", e);
                GenerationResult {
                    payload: Payload::Text(self.fallback.clone()),
                    provenance: Provenance {
                        backend: "static".to_string(),
                        extras: Extras::default(),
                    },
                }
            }
        }
    }
}
