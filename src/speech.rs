//! Text-to-speech. Tries a remote synthesis server, then the local engines
//! from best to crudest. There is no guaranteed terminal candidate.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use crate::config::PipelineConfig;
use crate::decode::{self, PayloadKind, RawResponse};
use crate::error::{AttemptError, Result};
use crate::request::{BackendHints, Capability, Extras, GenerationRequest, GenerationResult, Output};
use crate::resolver::{Candidate, CandidateList, resolve};
use crate::tool::{read_artifact, run_tool};

const HTTP_SUFFIXES: &[&str] = &[
    "",
    "/synthesize",
    "/api/synthesize",
    "/api/tts",
    "/generate",
    "/api/generate",
    "/tts",
];

/// Engine names as they prefix the ids returned by [`SpeechAdapter::list_voices`].
const ENGINES: &[&str] = &["http", "coqui", "piper", "pico2wave", "espeak"];

/// The part of a `backend:voice` id meant for `engine`. Unprefixed voices
/// pass through; voices addressed to another engine are dropped.
fn voice_for<'a>(voice: Option<&'a str>, engine: &str) -> Option<&'a str> {
    let voice = voice.map(str::trim).filter(|v| !v.is_empty())?;
    match voice.split_once(':') {
        Some((prefix, rest)) if ENGINES.contains(&prefix) => (prefix == engine).then_some(rest),
        _ => Some(voice),
    }
}

/// Audio container named by a response's content type, or sniffed from
/// the bytes when the type is generic.
fn audio_format(content_type: &str, bytes: &[u8]) -> &'static str {
    let ct = content_type.split(';').next().unwrap_or_default().trim().to_ascii_lowercase();
    match ct.as_str() {
        "audio/wav" | "audio/x-wav" | "audio/wave" | "audio/vnd.wave" => return "wav",
        "audio/mpeg" | "audio/mp3" => return "mp3",
        "audio/ogg" | "audio/opus" => return "ogg",
        "audio/flac" | "audio/x-flac" => return "flac",
        _ => {}
    }
    match bytes {
        [b'R', b'I', b'F', b'F', ..] => "wav",
        [b'I', b'D', b'3', ..] | [0xFF, 0xFB | 0xF3 | 0xF2, ..] => "mp3",
        [b'O', b'g', b'g', b'S', ..] => "ogg",
        [b'f', b'L', b'a', b'C', ..] => "flac",
        _ => "wav",
    }
}

fn audio_output(bytes: Vec<u8>, format: &str, voice: Option<String>) -> Output {
    Output::bytes(bytes).with_extras(Extras {
        voice,
        format: Some(format.to_string()),
        ..Default::default()
    })
}

fn wav_output(bytes: Vec<u8>, voice: Option<String>) -> Output {
    audio_output(bytes, "wav", voice)
}

fn scratch() -> std::result::Result<(tempfile::TempDir, PathBuf), AttemptError> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("speech.wav");
    Ok((dir, path))
}

/// Coqui/Piper-style HTTP server. Accepts raw `audio/*` bodies or JSON with a
/// base64 field.
pub struct HttpSpeech {
    client: reqwest::Client,
    default_url: Option<String>,
    timeout: Duration,
}

impl HttpSpeech {
    pub fn new(client: reqwest::Client, default_url: Option<String>, timeout: Duration) -> Self {
        Self {
            client,
            default_url,
            timeout,
        }
    }

    async fn post_once(&self, url: &str, request: &GenerationRequest) -> std::result::Result<Output, AttemptError> {
        let voice = voice_for(request.hints.voice.as_deref(), "http");
        let mut body = json!({ "text": request.input });
        if let Some(voice) = voice {
            body["voice"] = json!(voice);
        }
        if let Some(speed) = request.hints.speed {
            body["speed"] = json!(speed);
        }

        debug!("POST {}", url);
        let mut resp = self
            .client
            .post(url)
            .header(reqwest::header::ACCEPT, "*/*")
            .json(&body)
            .timeout(self.timeout)
            .send()
            .await?;

        if !resp.status().is_success() {
            let mut form = vec![("text", request.input.clone())];
            if let Some(voice) = voice {
                form.push(("voice", voice.to_string()));
            }
            if let Some(speed) = request.hints.speed {
                form.push(("speed", speed.to_string()));
            }
            resp = self
                .client
                .post(url)
                .header(reqwest::header::ACCEPT, "*/*")
                .form(&form)
                .timeout(self.timeout)
                .send()
                .await?;
        }
        if !resp.status().is_success() {
            return Err(AttemptError::Failed(format!("{url} returned {}", resp.status())));
        }

        let raw = RawResponse::read(resp).await?;
        let bytes = decode::decode(&raw, PayloadKind::Bytes)?.into_bytes();
        let format = audio_format(&raw.content_type, &bytes);
        Ok(audio_output(bytes, format, voice.map(str::to_string)))
    }
}

#[async_trait]
impl Candidate for HttpSpeech {
    fn name(&self) -> &str {
        "http"
    }

    async fn attempt(&self, request: &GenerationRequest) -> std::result::Result<Output, AttemptError> {
        let base = request
            .hints
            .url
            .as_deref()
            .or(self.default_url.as_deref())
            .ok_or_else(|| AttemptError::Unavailable("no TTS server URL configured".into()))?
            .trim_end_matches('/');

        let mut last = AttemptError::Unavailable(format!("{base} did not answer"));
        for suffix in HTTP_SUFFIXES {
            let url = format!("{base}{suffix}");
            match self.post_once(&url, request).await {
                Ok(output) => return Ok(output),
                Err(e) => {
                    debug!("{} failed: {}", url, e);
                    let refused = matches!(e, AttemptError::Unavailable(_));
                    last = e;
                    // a refused connection will not get better on another path
                    if refused {
                        break;
                    }
                }
            }
        }
        Err(last)
    }
}

/// Coqui TTS through its `tts` command-line entry point.
pub struct Coqui;

impl Coqui {
    /// Coqui voices are model names such as `tts_models/en/ljspeech/vits`.
    fn model(request: &GenerationRequest) -> Option<&str> {
        voice_for(request.hints.voice.as_deref(), "coqui").filter(|v| v.starts_with("tts_models/"))
    }

    fn args(request: &GenerationRequest, out: &Path) -> Vec<String> {
        let mut args = vec![
            "--text".to_string(),
            request.input.clone(),
            "--out_path".to_string(),
            out.to_string_lossy().into_owned(),
        ];
        if let Some(model) = Self::model(request) {
            args.push("--model_name".to_string());
            args.push(model.to_string());
        }
        args
    }
}

#[async_trait]
impl Candidate for Coqui {
    fn name(&self) -> &str {
        "coqui"
    }

    async fn attempt(&self, request: &GenerationRequest) -> std::result::Result<Output, AttemptError> {
        let (_dir, out) = scratch()?;
        let args = Self::args(request, &out);
        run_tool("tts", &args, None).await?;
        let bytes = read_artifact("tts", &out).await?;
        let voice = Self::model(request).unwrap_or("coqui_default");
        Ok(wav_output(bytes, Some(voice.to_string())))
    }
}

/// Piper, reading text from stdin.
pub struct Piper {
    model: String,
}

impl Piper {
    pub fn new(model: impl Into<String>) -> Self {
        Self { model: model.into() }
    }

    fn args(&self, request: &GenerationRequest, out: &Path) -> Vec<String> {
        // voices are model files for piper; anything else is ignored
        let model = voice_for(request.hints.voice.as_deref(), "piper")
            .filter(|v| v.ends_with(".onnx"))
            .unwrap_or(self.model.as_str());
        let mut args = vec![
            "--model".to_string(),
            model.to_string(),
            "--output_file".to_string(),
            out.to_string_lossy().into_owned(),
        ];
        if let Some(speed) = request.hints.speed.filter(|s| *s > 0.0) {
            args.push("--length_scale".to_string());
            args.push(format!("{:.3}", 1.0 / speed));
        }
        args
    }
}

#[async_trait]
impl Candidate for Piper {
    fn name(&self) -> &str {
        "piper"
    }

    async fn attempt(&self, request: &GenerationRequest) -> std::result::Result<Output, AttemptError> {
        let (_dir, out) = scratch()?;
        run_tool("piper", &self.args(request, &out), Some(&request.input)).await?;
        let bytes = read_artifact("piper", &out).await?;
        let voice = voice_for(request.hints.voice.as_deref(), "piper").map(str::to_string);
        Ok(wav_output(bytes, voice))
    }
}

/// SVOX Pico software synthesizer.
pub struct Pico;

fn looks_like_locale(voice: &str) -> bool {
    let mut parts = voice.split('-');
    matches!(
        (parts.next(), parts.next(), parts.next()),
        (Some(lang), Some(region), None) if lang.len() == 2 && region.len() == 2
    )
}

#[async_trait]
impl Candidate for Pico {
    fn name(&self) -> &str {
        "pico2wave"
    }

    async fn attempt(&self, request: &GenerationRequest) -> std::result::Result<Output, AttemptError> {
        let (_dir, out) = scratch()?;
        let mut args = vec!["-w".to_string(), out.to_string_lossy().into_owned()];
        let voice = voice_for(request.hints.voice.as_deref(), "pico2wave")
            .filter(|v| looks_like_locale(v))
            .map(str::to_string);
        if let Some(lang) = &voice {
            args.push("-l".to_string());
            args.push(lang.clone());
        }
        args.push(request.input.clone());
        run_tool("pico2wave", &args, None).await?;
        let bytes = read_artifact("pico2wave", &out).await?;
        Ok(wav_output(bytes, voice.or_else(|| Some("pico2wave".to_string()))))
    }
}

/// espeak or espeak-ng, whichever is installed.
pub struct Espeak;

impl Espeak {
    fn binary() -> Option<&'static str> {
        ["espeak", "espeak-ng"].into_iter().find(|b| which::which(b).is_ok())
    }

    fn words_per_minute(speed: f32) -> u32 {
        ((170.0 * speed) as i64).clamp(80, 450) as u32
    }

    fn args(request: &GenerationRequest, out: &Path) -> Vec<String> {
        let mut args = vec!["-w".to_string(), out.to_string_lossy().into_owned()];
        if let Some(speed) = request.hints.speed {
            args.push("-s".to_string());
            args.push(Self::words_per_minute(speed).to_string());
        }
        if let Some(voice) = Self::voice(request) {
            args.push("-v".to_string());
            args.push(voice.to_string());
        }
        args.push(request.input.clone());
        args
    }

    /// Language codes (`en-us`) or voice names; model paths meant for other
    /// engines are ignored.
    fn voice(request: &GenerationRequest) -> Option<&str> {
        voice_for(request.hints.voice.as_deref(), "espeak")
            .filter(|v| !v.ends_with(".onnx") && !v.contains(std::path::MAIN_SEPARATOR))
    }
}

#[async_trait]
impl Candidate for Espeak {
    fn name(&self) -> &str {
        "espeak"
    }

    async fn attempt(&self, request: &GenerationRequest) -> std::result::Result<Output, AttemptError> {
        let bin = Self::binary().ok_or_else(|| AttemptError::Unavailable("neither espeak nor espeak-ng on PATH".into()))?;
        let (_dir, out) = scratch()?;
        run_tool(bin, &Self::args(request, &out), None).await?;
        let bytes = read_artifact(bin, &out).await?;
        let voice = Self::voice(request).unwrap_or(bin);
        Ok(wav_output(bytes, Some(voice.to_string())))
    }
}

pub struct SpeechAdapter {
    candidates: CandidateList,
    voice: Option<String>,
    speed: Option<f32>,
    piper_model: String,
}

impl SpeechAdapter {
    pub fn new(config: &PipelineConfig, client: reqwest::Client) -> Self {
        let candidates: CandidateList = vec![
            Box::new(HttpSpeech::new(client, config.speech_url.clone(), config.speech_timeout)),
            Box::new(Coqui),
            Box::new(Piper::new(config.piper_model.clone())),
            Box::new(Pico),
            Box::new(Espeak),
        ];
        Self {
            candidates,
            voice: config.voice.clone(),
            speed: config.speed,
            piper_model: config.piper_model.clone(),
        }
    }

    pub fn from_candidates(candidates: CandidateList) -> Self {
        Self {
            candidates,
            voice: None,
            speed: None,
            piper_model: String::new(),
        }
    }

    /// Fails with an aggregate "no speech backend available" error when every
    /// engine is missing.
    pub async fn synthesize(&self, text: &str, mut hints: BackendHints) -> Result<GenerationResult> {
        if hints.voice.is_none() {
            hints.voice = self.voice.clone();
        }
        if hints.speed.is_none() {
            hints.speed = self.speed;
        }
        let request = GenerationRequest::new(Capability::Speech, text).with_hints(hints);
        resolve(Capability::Speech, &self.candidates, &request).await
    }

    /// `backend:voice` identifiers from every engine that can enumerate them.
    pub async fn list_voices(&self) -> Vec<String> {
        let mut voices = Vec::new();

        if let Some(bin) = Espeak::binary() {
            if let Ok(out) = run_tool(bin, &["--voices".to_string()], None).await {
                voices.extend(parse_espeak_voices(&out.stdout).into_iter().map(|v| format!("espeak:{v}")));
            }
        }

        if let Ok(out) = run_tool("tts", &["--list_models".to_string()], None).await {
            voices.extend(
                out.stdout
                    .lines()
                    .filter_map(|l| l.split_whitespace().find(|w| w.contains('/')))
                    .map(|m| format!("coqui:{m}")),
            );
        }

        if which::which("piper").is_ok() {
            voices.extend(piper_models(Path::new(&self.piper_model)).into_iter().map(|m| format!("piper:{m}")));
        }

        voices
    }
}

/// Language codes from `espeak --voices`, which `-v` accepts; the first
/// line is a header.
fn parse_espeak_voices(listing: &str) -> Vec<String> {
    let mut languages: Vec<String> = Vec::new();
    for line in listing.lines().skip(1) {
        // Pty Language Age/Gender VoiceName File Other
        if let Some(lang) = line.split_whitespace().nth(1) {
            if !languages.iter().any(|l| l == lang) {
                languages.push(lang.to_string());
            }
        }
    }
    languages
}

/// `.onnx` voice models stored next to the configured piper model.
fn piper_models(model: &Path) -> Vec<String> {
    let dir = match model.parent() {
        Some(d) if !d.as_os_str().is_empty() => d,
        _ => Path::new("."),
    };
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut models: Vec<String> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "onnx"))
        .map(|p| p.to_string_lossy().into_owned())
        .collect();
    models.sort();
    models
}
