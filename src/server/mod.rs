//! `autoshorts serve`: HTTP control surface over the pipeline.
//!
//! Endpoints:
//! - POST     /generate                        - batch run in a child process
//! - POST     /functions/v1/generate-story     - story text
//! - POST     /functions/v1/generate-tts       - base64 audio
//! - GET      /functions/v1/tts-voices         - locally installed voices
//! - POST     /functions/v1/generate-image     - base64 image
//! - GET|POST /functions/v1/pipeline-status    - liveness of external services
//! - POST     /functions/v1/run-pipeline       - one full run, summary + media
//! - GET      /functions/v1/list-outputs       - most recent runs
//! - GET      /functions/v1/get-file?path=     - artifact bytes
//!
//! Errors are `{"error": ..., "hint": ...}` with a non-2xx status.

mod handlers;
mod state;

use std::sync::Arc;

use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::config::PipelineConfig;
use crate::error::PipelineError;

pub use self::state::{AppState, FUNCTIONS_DIR};

fn json_error(status: StatusCode, message: &str, hint: Option<&str>) -> Response {
    let mut body = serde_json::json!({ "error": message });
    if let Some(hint) = hint {
        body["hint"] = hint.into();
    }
    (status, Json(body)).into_response()
}

/// Handler error carrying the HTTP status it maps to.
#[derive(Debug)]
pub(crate) struct ApiError {
    status: StatusCode,
    message: String,
    hint: Option<String>,
}

impl ApiError {
    pub(crate) fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            hint: None,
        }
    }

    pub(crate) fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            hint: None,
        }
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        let status = match err {
            PipelineError::Config(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            hint: err.hint().map(str::to_string),
            message: err.to_string(),
        }
    }
}

impl From<std::io::Error> for ApiError {
    fn from(err: std::io::Error) -> Self {
        PipelineError::from(err).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        json_error(self.status, &self.message, self.hint.as_deref())
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/generate", post(handlers::generate_batch))
        .route("/functions/v1/generate-story", post(handlers::generate_story))
        .route("/functions/v1/generate-tts", post(handlers::generate_tts))
        .route("/functions/v1/tts-voices", get(handlers::tts_voices))
        .route("/functions/v1/generate-image", post(handlers::generate_image))
        .route(
            "/functions/v1/pipeline-status",
            get(handlers::pipeline_status).post(handlers::pipeline_status),
        )
        .route("/functions/v1/run-pipeline", post(handlers::run_pipeline))
        .route("/functions/v1/list-outputs", get(handlers::list_outputs))
        .route("/functions/v1/get-file", get(handlers::get_file))
        .fallback(handlers::not_found)
        .layer(cors)
        .with_state(state)
}

/// Serve until Ctrl+C. `config.output_root` is the server's output root.
pub async fn start_server(host: &str, port: u16, config: PipelineConfig) -> std::io::Result<()> {
    tokio::fs::create_dir_all(config.output_root.join(FUNCTIONS_DIR)).await?;
    let state = Arc::new(AppState::new(config));
    let app = router(state);

    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Control surface listening on http://{}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("Server shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("could not listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal");
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde_json::{Value, json};

    use super::*;
    use crate::compositor::Compositor;
    use crate::image_gen::ImageAdapter;
    use crate::pipeline::Orchestrator;
    use crate::publisher::Publisher;
    use crate::request::Output;
    use crate::resolver::CandidateList;
    use crate::resolver::testing::FakeCandidate;
    use crate::speech::SpeechAdapter;
    use crate::story::StoryAdapter;

    async fn spawn(outdir: &Path, speech: CandidateList) -> String {
        let config = PipelineConfig {
            output_root: outdir.join(FUNCTIONS_DIR),
            ..PipelineConfig::default()
        };
        let orchestrator = Orchestrator::with_components(
            config.clone(),
            StoryAdapter::from_candidates(
                vec![Box::new(FakeCandidate::ok("http", Output::text("The toaster spoke. Nobody listened.")))],
                "fallback",
                "prompt",
            ),
            SpeechAdapter::from_candidates(speech),
            ImageAdapter::from_candidates(vec![Box::new(FakeCandidate::ok(
                "procedural",
                Output::bytes(vec![0xFF, 0xD8, 0xFF]),
            ))]),
            Compositor::new(&config),
            Publisher::new(&config, reqwest::Client::new()),
        );
        let state = Arc::new(AppState::with_orchestrator(outdir.to_path_buf(), orchestrator));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(state)).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn wav_speech() -> CandidateList {
        vec![Box::new(FakeCandidate::ok("piper", Output::bytes(b"RIFFWAVE".to_vec())))]
    }

    async fn post(url: &str, body: Value) -> (StatusCode, Value) {
        let resp = reqwest::Client::new().post(url).json(&body).send().await.unwrap();
        let status = StatusCode::from_u16(resp.status().as_u16()).unwrap();
        (status, resp.json().await.unwrap())
    }

    #[tokio::test]
    async fn story_endpoint_accepts_camel_case_aliases() {
        let dir = tempfile::tempdir().unwrap();
        let base = spawn(dir.path(), wav_speech()).await;

        let (status, body) = post(
            &format!("{base}/functions/v1/generate-story"),
            json!({ "storyPrompt": "toasters", "ollamaModel": "tiny" }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["story"], "The toaster spoke. Nobody listened.");
        assert_eq!(body["model"], "tiny");
        assert_eq!(body["backend"], "http");
    }

    #[tokio::test]
    async fn tts_endpoint_returns_base64_audio() {
        let dir = tempfile::tempdir().unwrap();
        let base = spawn(dir.path(), wav_speech()).await;

        let (status, body) = post(&format!("{base}/functions/v1/generate-tts"), json!({ "text": "hello" })).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["backend"], "piper");
        assert_eq!(body["format"], "wav");
        assert_eq!(STANDARD.decode(body["audio"].as_str().unwrap()).unwrap(), b"RIFFWAVE");

        let (status, body) = post(&format!("{base}/functions/v1/generate-tts"), json!({})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("text"));
    }

    #[tokio::test]
    async fn exhausted_speech_is_a_500_with_hint() {
        let dir = tempfile::tempdir().unwrap();
        let base = spawn(dir.path(), vec![Box::new(FakeCandidate::dead("espeak"))]).await;

        let (status, body) = post(&format!("{base}/functions/v1/generate-tts"), json!({ "input": "hi" })).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["error"].as_str().unwrap().starts_with("no speech backend available"));
        assert!(body["hint"].is_string());
    }

    #[tokio::test]
    async fn run_pipeline_summary_embeds_media_and_is_listed() {
        let dir = tempfile::tempdir().unwrap();
        let base = spawn(dir.path(), wav_speech()).await;

        let (status, body) = post(
            &format!("{base}/functions/v1/run-pipeline"),
            json!({ "generateImage": false, "publish": false }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["steps"]["story"]["status"], "completed");
        assert_eq!(body["steps"]["tts"]["status"], "completed");
        assert_eq!(body["steps"]["image"]["status"], "skipped");
        assert_eq!(body["steps"]["video"]["status"], "skipped");
        assert_eq!(body["steps"]["publish"]["status"], "skipped");
        assert_eq!(STANDARD.decode(body["audioBase64"].as_str().unwrap()).unwrap(), b"RIFFWAVE");
        assert!(body.get("imageBase64").is_none());

        let listed: Value = reqwest::get(format!("{base}/functions/v1/list-outputs"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let items = listed["items"].as_array().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["id"], body["pipelineId"]);
        assert_eq!(items[0]["status"], "completed");
        assert!(items[0]["mtime"].as_u64().unwrap() > 0);
        assert!(items[0]["files"].as_array().unwrap().contains(&json!("run.json")));
    }

    #[tokio::test]
    async fn run_pipeline_accepts_the_web_client_body() {
        let dir = tempfile::tempdir().unwrap();
        let base = spawn(dir.path(), wav_speech()).await;

        let (status, body) = post(
            &format!("{base}/functions/v1/run-pipeline"),
            json!({
                "generateStory": true,
                "generateTTS": true,
                "generateImage": true,
                "publish": false,
                "storyPrompt": null,
                "piperUrl": null,
                "coquiUrl": null,
                "ollamaUrl": "http://127.0.0.1:9",
                "sdUrl": "http://127.0.0.1:9",
                "voice": "",
                "speed": 1.0,
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["steps"]["story"]["status"], "completed");
        assert_eq!(body["steps"]["tts"]["status"], "completed");
        assert_eq!(body["steps"]["image"]["status"], "completed");
    }

    #[tokio::test]
    async fn oversized_image_request_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let base = spawn(dir.path(), wav_speech()).await;
        let url = format!("{base}/functions/v1/generate-image");

        let (status, body) = post(&url, json!({ "prompt": "wide", "width": 200000, "height": 200000 })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("width"));

        let (status, body) = post(&url, json!({ "prompt": "small", "width": 64, "height": 64 })).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["backend"], "procedural");
    }

    #[tokio::test]
    async fn get_file_is_confined_to_output_root() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let base = spawn(dir.path(), wav_speech()).await;

        let inside = dir.path().join(FUNCTIONS_DIR).join("story.txt");
        std::fs::create_dir_all(inside.parent().unwrap()).unwrap();
        std::fs::write(&inside, "inside").unwrap();
        let secret = outside.path().join("secret.txt");
        std::fs::write(&secret, "secret").unwrap();

        let client = reqwest::Client::new();
        let url = format!("{base}/functions/v1/get-file");

        let resp = client.get(&url).send().await.unwrap();
        assert_eq!(resp.status().as_u16(), 400);

        let resp = client.get(&url).query(&[("path", inside.to_str().unwrap())]).send().await.unwrap();
        assert_eq!(resp.status().as_u16(), 200);
        assert_eq!(resp.text().await.unwrap(), "inside");

        let resp = client.get(&url).query(&[("path", secret.to_str().unwrap())]).send().await.unwrap();
        assert_eq!(resp.status().as_u16(), 403);

        let traversal = dir.path().join("..").join(outside.path().file_name().unwrap()).join("secret.txt");
        let resp = client.get(&url).query(&[("path", traversal.to_str().unwrap())]).send().await.unwrap();
        assert_ne!(resp.status().as_u16(), 200);

        let missing = dir.path().join("nope.mp4");
        let resp = client.get(&url).query(&[("path", missing.to_str().unwrap())]).send().await.unwrap();
        assert_eq!(resp.status().as_u16(), 404);
    }

    #[tokio::test]
    async fn unknown_route_is_json_404() {
        let dir = tempfile::tempdir().unwrap();
        let base = spawn(dir.path(), wav_speech()).await;
        let resp = reqwest::get(format!("{base}/nope")).await.unwrap();
        assert_eq!(resp.status().as_u16(), 404);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"], "not found");
    }

    #[test]
    fn config_errors_map_to_bad_request() {
        let err = ApiError::from(PipelineError::Config("no key".into()));
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert!(err.hint.is_some());
    }
}
