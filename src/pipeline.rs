//! One end-to-end run: story -> speech -> image -> video -> publish.
//!
//! Steps run strictly in order. A failing step is recorded and the run goes
//! on; only true data dependencies turn later steps into `skipped`
//! (video needs speech and image, publish needs video). Every run writes
//! its artifacts and a `run.json` summary into its own directory.

use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{error, info, warn};

use crate::compositor::Compositor;
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::image_gen::ImageAdapter;
use crate::metadata::{Metadata, build_metadata};
use crate::publisher::Publisher;
use crate::request::BackendHints;
use crate::speech::SpeechAdapter;
use crate::story::StoryAdapter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Completed,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl StepRecord {
    fn new(status: StepStatus) -> Self {
        Self {
            status,
            data: None,
            note: None,
            error: None,
            hint: None,
        }
    }

    pub fn pending() -> Self {
        Self::new(StepStatus::Pending)
    }

    pub fn completed(data: Value) -> Self {
        Self {
            data: Some(data),
            ..Self::new(StepStatus::Completed)
        }
    }

    pub fn skipped(note: impl Into<String>) -> Self {
        Self {
            note: Some(note.into()),
            ..Self::new(StepStatus::Skipped)
        }
    }

    pub fn failed(err: &PipelineError) -> Self {
        Self {
            error: Some(err.to_string()),
            hint: err.hint().map(str::to_string),
            ..Self::new(StepStatus::Failed)
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == StepStatus::Completed
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Steps {
    pub story: StepRecord,
    #[serde(rename = "tts")]
    pub speech: StepRecord,
    pub image: StepRecord,
    pub video: StepRecord,
    pub publish: StepRecord,
}

impl Steps {
    fn all(&self) -> [&StepRecord; 5] {
        [&self.story, &self.speech, &self.image, &self.video, &self.publish]
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifacts {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub story: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub small_video: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineRun {
    pub pipeline_id: String,
    pub started_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    pub overall_status: StepStatus,
    pub output_dir: PathBuf,
    pub steps: Steps,
    pub artifacts: Artifacts,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

impl PipelineRun {
    fn new(pipeline_id: String, output_dir: PathBuf) -> Self {
        Self {
            pipeline_id,
            started_at: now(),
            completed_at: None,
            overall_status: StepStatus::Pending,
            output_dir,
            steps: Steps {
                story: StepRecord::pending(),
                speech: StepRecord::pending(),
                image: StepRecord::pending(),
                video: StepRecord::pending(),
                publish: StepRecord::pending(),
            },
            artifacts: Artifacts::default(),
            metadata: None,
        }
    }

    pub fn has_failures(&self) -> bool {
        self.steps.all().iter().any(|s| s.status == StepStatus::Failed)
    }
}

/// Caller choices for a single run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub prompt: Option<String>,
    /// Used as the story when story generation is skipped.
    pub story: Option<String>,
    pub skip_story: bool,
    pub skip_speech: bool,
    pub skip_image: bool,
    pub publish: bool,
    pub story_url: Option<String>,
    pub model: Option<String>,
    pub speech_url: Option<String>,
    pub voice: Option<String>,
    pub speed: Option<f32>,
    pub image_url: Option<String>,
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// `YYYYmmdd-HHMMSS-xxxxxxxx`, unique even for runs started in the same second.
pub fn new_run_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", Utc::now().format("%Y%m%d-%H%M%S"), &suffix[..8])
}

pub struct Orchestrator {
    config: PipelineConfig,
    story: StoryAdapter,
    speech: SpeechAdapter,
    image: ImageAdapter,
    compositor: Compositor,
    publisher: Publisher,
}

impl Orchestrator {
    pub fn new(config: PipelineConfig) -> Self {
        let client = reqwest::Client::new();
        Self {
            story: StoryAdapter::new(&config, client.clone()),
            speech: SpeechAdapter::new(&config, client.clone()),
            image: ImageAdapter::new(&config, client.clone()),
            compositor: Compositor::new(&config),
            publisher: Publisher::new(&config, client),
            config,
        }
    }

    pub fn with_components(
        config: PipelineConfig,
        story: StoryAdapter,
        speech: SpeechAdapter,
        image: ImageAdapter,
        compositor: Compositor,
        publisher: Publisher,
    ) -> Self {
        Self {
            config,
            story,
            speech,
            image,
            compositor,
            publisher,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn story(&self) -> &StoryAdapter {
        &self.story
    }

    pub fn speech(&self) -> &SpeechAdapter {
        &self.speech
    }

    pub fn image(&self) -> &ImageAdapter {
        &self.image
    }

    /// Errors only when the run directory or its summary cannot be written;
    /// step failures are recorded in the returned run.
    pub async fn run(&self, options: &RunOptions) -> Result<PipelineRun> {
        let run_id = new_run_id();
        let dir = self.config.output_root.join(&run_id);
        tokio::fs::create_dir_all(&dir).await?;
        let mut run = PipelineRun::new(run_id, dir.clone());
        info!("Starting run {} in {}", run.pipeline_id, dir.display());

        let story = self.story_step(options, &dir, &mut run).await;
        self.speech_step(options, &story, &dir, &mut run).await;
        self.image_step(options, &story, &dir, &mut run).await;
        self.video_step(&dir, &mut run).await;
        if !story.trim().is_empty() {
            run.metadata = Some(build_metadata(&story));
        }
        self.publish_step(options, &mut run).await;

        run.overall_status = if run.has_failures() {
            StepStatus::Failed
        } else {
            StepStatus::Completed
        };
        run.completed_at = Some(now());

        let summary = serde_json::to_string_pretty(&run)?;
        tokio::fs::write(dir.join("run.json"), summary).await?;
        info!("Run {} finished: {:?}", run.pipeline_id, run.overall_status);
        Ok(run)
    }

    async fn story_step(&self, options: &RunOptions, dir: &Path, run: &mut PipelineRun) -> String {
        let (story, record) = if options.skip_story {
            (
                options.story.clone().unwrap_or_default(),
                StepRecord::skipped("Skipped story generation"),
            )
        } else {
            let hints = BackendHints {
                url: options.story_url.clone(),
                model: options.model.clone(),
                ..Default::default()
            };
            let result = self.story.generate(options.prompt.as_deref(), hints).await;
            let story = result.payload.as_text().unwrap_or_default().to_string();
            info!("Story from '{}': {:.120}", result.provenance.backend, story.replace('\n', " "));
            let record = StepRecord::completed(json!({
                "story": story,
                "backend": result.provenance.backend,
            }));
            (story, record)
        };

        run.steps.story = record;
        if !story.trim().is_empty() {
            let path = dir.join("story.txt");
            match tokio::fs::write(&path, &story).await {
                Ok(()) => run.artifacts.story = Some(path),
                Err(e) => {
                    error!("Could not persist story: {}", e);
                    run.steps.story = StepRecord::failed(&PipelineError::from(e));
                }
            }
        }
        story
    }

    async fn speech_step(&self, options: &RunOptions, story: &str, dir: &Path, run: &mut PipelineRun) {
        if options.skip_speech {
            run.steps.speech = StepRecord::skipped("Skipped TTS generation");
            return;
        }
        if story.trim().is_empty() {
            run.steps.speech = StepRecord::skipped("No story text to narrate");
            return;
        }

        let hints = BackendHints {
            url: options.speech_url.clone(),
            voice: options.voice.clone(),
            speed: options.speed,
            ..Default::default()
        };
        let outcome = match self.speech.synthesize(story, hints).await {
            Ok(result) => {
                let ext = match result.provenance.extras.format.as_deref() {
                    Some(f @ ("mp3" | "ogg" | "flac")) => f,
                    _ => "wav",
                };
                let path = dir.join(format!("speech.{ext}"));
                tokio::fs::write(&path, result.payload.as_bytes())
                    .await
                    .map(|()| (path, result))
                    .map_err(PipelineError::from)
            }
            Err(e) => Err(e),
        };

        run.steps.speech = match outcome {
            Ok((path, result)) => {
                info!("Speech from '{}' written to {}", result.provenance.backend, path.display());
                run.artifacts.audio = Some(path);
                StepRecord::completed(json!({
                    "backend": result.provenance.backend,
                    "voice": result.provenance.extras.voice,
                    "format": result.provenance.extras.format.unwrap_or_else(|| "wav".to_string()),
                    "hasAudio": true,
                }))
            }
            Err(e) => {
                error!("Speech step failed: {}", e);
                StepRecord::failed(&e)
            }
        };
    }

    async fn image_step(&self, options: &RunOptions, story: &str, dir: &Path, run: &mut PipelineRun) {
        if options.skip_image {
            run.steps.image = StepRecord::skipped("Skipped image generation");
            return;
        }

        let prompt = [Some(story), options.prompt.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|p| !p.is_empty())
            .unwrap_or(self.config.story_prompt.as_str());
        let (width, height) = self.config.small_size;
        let hints = BackendHints {
            url: options.image_url.clone(),
            width: Some(width),
            height: Some(height),
            ..Default::default()
        };

        let outcome = match self.image.generate(prompt, hints).await {
            Ok(result) => {
                let ext = match result.provenance.extras.format.as_deref() {
                    Some("png") => "png",
                    Some("webp") => "webp",
                    _ => "jpg",
                };
                let path = dir.join(format!("background.{ext}"));
                tokio::fs::write(&path, result.payload.as_bytes())
                    .await
                    .map(|()| (path, result))
                    .map_err(PipelineError::from)
            }
            Err(e) => Err(e),
        };

        run.steps.image = match outcome {
            Ok((path, result)) => {
                info!("Image from '{}' written to {}", result.provenance.backend, path.display());
                run.artifacts.image = Some(path);
                StepRecord::completed(json!({
                    "backend": result.provenance.backend,
                    "seed": result.provenance.extras.seed,
                    "prompt": result.provenance.extras.prompt,
                    "hasImage": true,
                }))
            }
            Err(e) => {
                error!("Image step failed: {}", e);
                StepRecord::failed(&e)
            }
        };
    }

    async fn video_step(&self, dir: &Path, run: &mut PipelineRun) {
        let (Some(audio), Some(image)) = (run.artifacts.audio.clone(), run.artifacts.image.clone()) else {
            run.steps.video = StepRecord::skipped("Not enough assets to build video (needs completed speech and image)");
            return;
        };
        if !(run.steps.speech.is_completed() && run.steps.image.is_completed()) {
            run.steps.video = StepRecord::skipped("Not enough assets to build video (needs completed speech and image)");
            return;
        }

        let (sw, sh) = self.config.small_size;
        let (fw, fh) = self.config.final_size;
        let small = dir.join("short_small.mp4");
        let last = dir.join("short.mp4");

        let outcome = async {
            self.compositor.compose(&image, &audio, &small, sw, sh).await?;
            self.compositor.upscale(&small, &last, fw, fh).await
        }
        .await;

        run.steps.video = match outcome {
            Ok(video) => {
                run.artifacts.small_video = Some(small);
                run.artifacts.video = Some(video.clone());
                StepRecord {
                    note: Some(video.to_string_lossy().into_owned()),
                    ..StepRecord::completed(json!({ "width": fw, "height": fh }))
                }
            }
            Err(e) => {
                error!("Video step failed: {}", e);
                if small.exists() {
                    run.artifacts.small_video = Some(small);
                }
                StepRecord::failed(&e)
            }
        };
    }

    async fn publish_step(&self, options: &RunOptions, run: &mut PipelineRun) {
        if !options.publish {
            run.steps.publish = StepRecord::skipped("Publish not requested");
            return;
        }
        let Some(video) = run.artifacts.video.clone().filter(|_| run.steps.video.is_completed()) else {
            run.steps.publish = StepRecord::skipped("No video to publish");
            return;
        };
        let metadata = run.metadata.clone().unwrap_or_else(|| build_metadata(""));

        run.steps.publish = match self.publisher.publish(&video, &metadata).await {
            Ok(receipt) => {
                info!("Published {}", video.display());
                StepRecord {
                    note: Some("Published via Postiz".to_string()),
                    ..StepRecord::completed(json!({ "title": metadata.title, "response": receipt }))
                }
            }
            Err(e) => {
                warn!("Publish failed: {}", e);
                StepRecord::failed(&e)
            }
        };
    }
}
