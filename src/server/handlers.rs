//! Route handlers for the control surface.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use super::state::AppState;
use super::{ApiError, json_error};
use crate::pipeline::RunOptions;
use crate::probe::service_status;
use crate::image_gen::MAX_IMAGE_SIDE;
use crate::request::BackendHints;

const RECENT_OUTPUTS: usize = 20;

/// Body accepted by every function endpoint. Field names follow the web
/// client (camelCase). Clients send several spellings of the same setting at
/// once (`piperUrl` next to `coquiUrl`), so each spelling is its own field and
/// the accessors below pick the first non-empty one.
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub(crate) struct FunctionRequest {
    prompt: Option<String>,
    story_prompt: Option<String>,
    story: Option<String>,
    text: Option<String>,
    input: Option<String>,
    ollama_url: Option<String>,
    ollama_model: Option<String>,
    model: Option<String>,
    piper_url: Option<String>,
    coqui_url: Option<String>,
    tts_url: Option<String>,
    sd_url: Option<String>,
    piper_speed: Option<f32>,
    speed: Option<f32>,
    voice_name: Option<String>,
    voice: Option<String>,
    generate_story: Option<bool>,
    #[serde(rename = "generateTTS")]
    generate_tts: Option<bool>,
    #[serde(rename = "generateTts")]
    generate_tts_lower: Option<bool>,
    generate_image: Option<bool>,
    publish: Option<bool>,
    width: Option<u32>,
    height: Option<u32>,
    count: Option<usize>,
}

impl FunctionRequest {
    /// Empty or whitespace bodies are treated as `{}`.
    fn parse(body: &Bytes) -> Result<Self, ApiError> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }
        serde_json::from_slice(body).map_err(|e| ApiError::bad_request(format!("invalid JSON body: {e}")))
    }

    fn prompt(&self) -> Option<String> {
        first_of(&[&self.prompt, &self.story_prompt])
    }

    fn story(&self) -> Option<String> {
        first_of(&[&self.story])
    }

    fn text(&self) -> Option<String> {
        first_of(&[&self.text, &self.input, &self.story])
    }

    fn ollama_url(&self) -> Option<String> {
        first_of(&[&self.ollama_url])
    }

    fn model(&self) -> Option<String> {
        first_of(&[&self.ollama_model, &self.model])
    }

    fn speech_url(&self) -> Option<String> {
        first_of(&[&self.piper_url, &self.coqui_url, &self.tts_url])
    }

    fn sd_url(&self) -> Option<String> {
        first_of(&[&self.sd_url])
    }

    fn speed(&self) -> Option<f32> {
        self.piper_speed.or(self.speed)
    }

    fn voice(&self) -> Option<String> {
        first_of(&[&self.voice_name, &self.voice])
    }

    fn generate_tts(&self) -> Option<bool> {
        self.generate_tts.or(self.generate_tts_lower)
    }

    fn publish(&self) -> bool {
        self.publish.unwrap_or(false)
    }

    /// Explicit sizes must be within `1..=MAX_IMAGE_SIDE`.
    fn image_size(&self, default: (u32, u32)) -> Result<(u32, u32), ApiError> {
        let check = |name: &str, value: Option<u32>, fallback: u32| match value {
            Some(v) if v == 0 || v > MAX_IMAGE_SIDE => Err(ApiError::bad_request(format!(
                "{name} must be between 1 and {MAX_IMAGE_SIDE}, got {v}"
            ))),
            Some(v) => Ok(v),
            None => Ok(fallback),
        };
        Ok((
            check("width", self.width, default.0)?,
            check("height", self.height, default.1)?,
        ))
    }
}

fn first_of(values: &[&Option<String>]) -> Option<String> {
    values.iter().find_map(|v| non_empty(v.as_deref())).map(str::to_string)
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|s| !s.is_empty())
}

pub(crate) async fn not_found() -> impl IntoResponse {
    json_error(StatusCode::NOT_FOUND, "not found", None)
}

/// POST /generate
pub(crate) async fn generate_batch(State(state): State<Arc<AppState>>, body: Bytes) -> Result<Json<Value>, ApiError> {
    let req = FunctionRequest::parse(&body)?;
    let count = req.count.unwrap_or(1).max(1);
    let outdir = state
        .outdir
        .join(format!("web_{}", chrono::Local::now().format("%Y%m%d_%H%M%S")));

    let mut cmd = tokio::process::Command::new(&state.generator);
    cmd.arg("run")
        .arg("--count")
        .arg(count.to_string())
        .arg("--outdir")
        .arg(&outdir);
    if req.publish() {
        cmd.arg("--publish");
    }
    info!("Spawning batch of {} into {}", count, outdir.display());
    let output = cmd.output().await?;

    Ok(Json(json!({
        "success": output.status.success(),
        "stdout": String::from_utf8_lossy(&output.stdout),
        "stderr": String::from_utf8_lossy(&output.stderr),
        "outdir": outdir,
    })))
}

/// POST /functions/v1/generate-story
pub(crate) async fn generate_story(State(state): State<Arc<AppState>>, body: Bytes) -> Result<Json<Value>, ApiError> {
    let req = FunctionRequest::parse(&body)?;
    let prompt = req.prompt();
    let hints = BackendHints {
        url: req.ollama_url(),
        model: req.model(),
        ..Default::default()
    };
    let result = state.orchestrator.story().generate(prompt.as_deref(), hints).await;
    let model = req.model().unwrap_or_else(|| state.config().story_model.clone());

    Ok(Json(json!({
        "story": result.payload.as_text().unwrap_or_default(),
        "model": model,
        "backend": result.provenance.backend,
    })))
}

/// POST /functions/v1/generate-tts
pub(crate) async fn generate_tts(State(state): State<Arc<AppState>>, body: Bytes) -> Result<Json<Value>, ApiError> {
    let req = FunctionRequest::parse(&body)?;
    let text = req.text().ok_or_else(|| ApiError::bad_request("text is required"))?;
    let hints = BackendHints {
        url: req.speech_url(),
        voice: req.voice(),
        speed: req.speed(),
        ..Default::default()
    };
    let result = state.orchestrator.speech().synthesize(&text, hints).await?;
    let extras = &result.provenance.extras;

    Ok(Json(json!({
        "format": extras.format.as_deref().unwrap_or("wav"),
        "voice": extras.voice,
        "backend": result.provenance.backend,
        "audio": STANDARD.encode(result.payload.as_bytes()),
    })))
}

/// GET /functions/v1/tts-voices
pub(crate) async fn tts_voices(State(state): State<Arc<AppState>>) -> Json<Value> {
    let voices = state.orchestrator.speech().list_voices().await;
    Json(json!({ "voices": voices }))
}

/// POST /functions/v1/generate-image
pub(crate) async fn generate_image(State(state): State<Arc<AppState>>, body: Bytes) -> Result<Json<Value>, ApiError> {
    let req = FunctionRequest::parse(&body)?;
    let config = state.config();
    let (width, height) = req.image_size(config.small_size)?;
    let prompt = req
        .prompt()
        .or_else(|| req.story())
        .unwrap_or_else(|| config.story_prompt.clone());
    let prompt = prompt.as_str();
    let hints = BackendHints {
        url: req.sd_url(),
        width: Some(width),
        height: Some(height),
        ..Default::default()
    };
    let result = state.orchestrator.image().generate(prompt, hints).await?;
    let extras = &result.provenance.extras;

    let mut body = json!({
        "image": STANDARD.encode(result.payload.as_bytes()),
        "prompt": extras.prompt.as_deref().unwrap_or(prompt),
        "backend": result.provenance.backend,
        "format": extras.format.as_deref().unwrap_or("jpeg"),
    });
    if let Some(seed) = extras.seed {
        body["seed"] = seed.into();
    }
    Ok(Json(body))
}

/// GET|POST /functions/v1/pipeline-status
pub(crate) async fn pipeline_status(State(state): State<Arc<AppState>>, body: Bytes) -> Result<Json<Value>, ApiError> {
    let req = FunctionRequest::parse(&body)?;
    let config = state.config();
    let ollama_url = req.ollama_url();
    let sd_url = req.sd_url();
    let ollama = ollama_url.as_deref().or(config.story_url.as_deref());
    let a1111 = sd_url.as_deref().unwrap_or(config.a1111_host.as_str());

    let report = service_status(&state.client, ollama, a1111, config.probe_timeout).await;
    Ok(Json(serde_json::to_value(report).map_err(crate::error::PipelineError::from)?))
}

/// POST /functions/v1/run-pipeline
pub(crate) async fn run_pipeline(State(state): State<Arc<AppState>>, body: Bytes) -> Result<Json<Value>, ApiError> {
    let req = FunctionRequest::parse(&body)?;
    let options = RunOptions {
        prompt: req.prompt(),
        story: req.story.clone(),
        skip_story: req.generate_story == Some(false),
        skip_speech: req.generate_tts() == Some(false),
        skip_image: req.generate_image == Some(false),
        publish: req.publish(),
        story_url: req.ollama_url(),
        model: req.model(),
        speech_url: req.speech_url(),
        voice: req.voice(),
        speed: req.speed(),
        image_url: req.sd_url(),
    };

    let run = {
        let _guard = state.run_lock.lock().await;
        state.orchestrator.run(&options).await?
    };

    let mut summary = serde_json::to_value(&run).map_err(crate::error::PipelineError::from)?;
    summary["success"] = (!run.has_failures()).into();
    if let Some(audio) = &run.artifacts.audio {
        summary["audioBase64"] = STANDARD.encode(tokio::fs::read(audio).await?).into();
    }
    if let Some(image) = &run.artifacts.image {
        summary["imageBase64"] = STANDARD.encode(tokio::fs::read(image).await?).into();
    }
    Ok(Json(summary))
}

/// GET /functions/v1/list-outputs
pub(crate) async fn list_outputs(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let root = state.runs_dir();
    let mut runs: Vec<(PathBuf, u64)> = Vec::new();
    match tokio::fs::read_dir(root).await {
        Ok(mut entries) => {
            while let Some(entry) = entries.next_entry().await? {
                let meta = entry.metadata().await?;
                if meta.is_dir() {
                    runs.push((entry.path(), modified_secs(&meta)));
                }
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    // Newest first; run ids start with their timestamp, which breaks ties.
    runs.sort_by(|(a, at), (b, bt)| bt.cmp(at).then_with(|| b.file_name().cmp(&a.file_name())));
    runs.truncate(RECENT_OUTPUTS);

    let mut items = Vec::with_capacity(runs.len());
    for (dir, mtime) in runs {
        let mut item = describe_run(&dir).await?;
        item["mtime"] = mtime.into();
        items.push(item);
    }
    Ok(Json(json!({ "items": items })))
}

fn modified_secs(meta: &std::fs::Metadata) -> u64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_secs())
}

async fn describe_run(dir: &Path) -> Result<Value, ApiError> {
    let mut files = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            files.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    files.sort();

    let status = match tokio::fs::read_to_string(dir.join("run.json")).await {
        Ok(text) => serde_json::from_str::<Value>(&text)
            .ok()
            .and_then(|v| v.get("overallStatus").cloned())
            .unwrap_or(Value::Null),
        Err(_) => Value::Null,
    };

    Ok(json!({
        "id": dir.file_name().map(|n| n.to_string_lossy().into_owned()),
        "path": dir,
        "files": files,
        "status": status,
    }))
}

/// GET /functions/v1/get-file?path=
pub(crate) async fn get_file(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, ApiError> {
    let Some(requested) = params.get("path").map(String::as_str).filter(|p| !p.is_empty()) else {
        return Err(ApiError::bad_request("path query parameter is required"));
    };

    let not_found = || ApiError::new(StatusCode::NOT_FOUND, format!("file not found: {requested}"));
    let resolved = tokio::fs::canonicalize(requested).await.map_err(|_| not_found())?;
    let root = tokio::fs::canonicalize(&state.outdir).await.map_err(|_| not_found())?;
    if !resolved.starts_with(&root) {
        warn!("Refusing to serve {} outside {}", resolved.display(), root.display());
        return Err(ApiError::new(StatusCode::FORBIDDEN, "path is outside the output directory"));
    }
    if !tokio::fs::metadata(&resolved).await.map_err(|_| not_found())?.is_file() {
        return Err(not_found());
    }

    let bytes = tokio::fs::read(&resolved).await?;
    Ok(([(header::CONTENT_TYPE, content_type(&resolved))], bytes).into_response())
}

fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase).as_deref() {
        Some("mp4") => "video/mp4",
        Some("wav") => "audio/wav",
        Some("mp3") => "audio/mpeg",
        Some("ogg") => "audio/ogg",
        Some("flac") => "audio/flac",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        Some("json") => "application/json",
        Some("txt") => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_spellings() {
        let body = Bytes::from_static(
            br#"{"storyPrompt":"p","coquiUrl":"http://tts","piperSpeed":1.5,"voiceName":"v","generateTTS":false}"#,
        );
        let req = FunctionRequest::parse(&body).unwrap();
        assert_eq!(req.prompt().as_deref(), Some("p"));
        assert_eq!(req.speech_url().as_deref(), Some("http://tts"));
        assert_eq!(req.speed(), Some(1.5));
        assert_eq!(req.voice().as_deref(), Some("v"));
        assert_eq!(req.generate_tts(), Some(false));
        assert!(!req.publish());
    }

    #[test]
    fn web_client_run_body_parses() {
        let body = Bytes::from_static(
            br#"{"generateStory":true,"generateTTS":true,"generateImage":true,"publish":false,
                "storyPrompt":null,"piperUrl":null,"coquiUrl":null,"ollamaUrl":"http://localhost:11434",
                "sdUrl":"http://localhost:7860","voice":"piper:en_US-amy","speed":1.0}"#,
        );
        let req = FunctionRequest::parse(&body).unwrap();
        assert_eq!(req.prompt(), None);
        assert_eq!(req.speech_url(), None);
        assert_eq!(req.ollama_url().as_deref(), Some("http://localhost:11434"));
        assert_eq!(req.sd_url().as_deref(), Some("http://localhost:7860"));
        assert_eq!(req.voice().as_deref(), Some("piper:en_US-amy"));
        assert_eq!(req.speed(), Some(1.0));
        assert_eq!(req.generate_tts(), Some(true));
    }

    #[test]
    fn first_non_empty_spelling_wins() {
        let body = Bytes::from_static(
            br#"{"piperUrl":"http://piper","coquiUrl":"http://coqui","prompt":" ","storyPrompt":"fish","voiceName":"","voice":"amy"}"#,
        );
        let req = FunctionRequest::parse(&body).unwrap();
        assert_eq!(req.speech_url().as_deref(), Some("http://piper"));
        assert_eq!(req.prompt().as_deref(), Some("fish"));
        assert_eq!(req.voice().as_deref(), Some("amy"));

        let body = Bytes::from_static(br#"{"piperUrl":null,"coquiUrl":"http://coqui"}"#);
        let req = FunctionRequest::parse(&body).unwrap();
        assert_eq!(req.speech_url().as_deref(), Some("http://coqui"));
    }

    #[test]
    fn image_size_is_validated() {
        let parse = |raw: &'static [u8]| FunctionRequest::parse(&Bytes::from_static(raw)).unwrap();
        assert_eq!(parse(b"{}").image_size((720, 1280)).unwrap(), (720, 1280));
        assert_eq!(parse(br#"{"width":64}"#).image_size((720, 1280)).unwrap(), (64, 1280));
        assert!(parse(br#"{"width":200000}"#).image_size((720, 1280)).is_err());
        assert!(parse(br#"{"height":0}"#).image_size((720, 1280)).is_err());
    }

    #[test]
    fn empty_body_is_default() {
        let req = FunctionRequest::parse(&Bytes::from_static(b"  \n")).unwrap();
        assert!(req.prompt().is_none());
        assert!(FunctionRequest::parse(&Bytes::from_static(b"{not json")).is_err());
    }

    #[test]
    fn content_types() {
        assert_eq!(content_type(Path::new("a/short.mp4")), "video/mp4");
        assert_eq!(content_type(Path::new("bg.JPG")), "image/jpeg");
        assert_eq!(content_type(Path::new("blob")), "application/octet-stream");
    }
}
