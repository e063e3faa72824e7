use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_STORY_PROMPT: &str = "Write an absurd, brainrot-style story for YouTube Shorts \
(max 80 words) with a twist at the end.";

pub const FALLBACK_STORY: &str = "A cat found the remote control of the universe. Every button \
press changed one rule of reality. In the end the remote pressed a button by itself, and you \
woke up reading this story?";

/// Everything the pipeline needs to know about its backends, passed in
/// explicitly at construction.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub output_root: PathBuf,

    pub story_url: Option<String>,
    pub story_model: String,
    pub story_prompt: String,
    pub fallback_story: String,

    pub speech_url: Option<String>,
    pub piper_model: String,
    pub voice: Option<String>,
    pub speed: Option<f32>,

    pub a1111_host: String,
    pub negative_prompt: String,
    pub sampler: String,
    pub steps: u32,
    pub cfg_scale: f32,
    pub seed: i64,
    pub font_paths: Vec<PathBuf>,

    pub small_size: (u32, u32),
    pub final_size: (u32, u32),
    pub frame_rate: u32,
    pub fallback_duration: f64,

    pub probe_timeout: Duration,
    pub story_timeout: Duration,
    pub speech_timeout: Duration,
    pub image_timeout: Duration,

    pub publish_url: Option<String>,
    pub publish_key: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            output_root: PathBuf::from("outputs"),
            story_url: None,
            story_model: "bielik-4b-v3.0".to_string(),
            story_prompt: DEFAULT_STORY_PROMPT.to_string(),
            fallback_story: FALLBACK_STORY.to_string(),
            speech_url: None,
            piper_model: "./tts/en_US-hfc_male-medium.onnx".to_string(),
            voice: None,
            speed: None,
            a1111_host: "http://127.0.0.1:7860".to_string(),
            negative_prompt: "lowres, bad anatomy, text, watermark".to_string(),
            sampler: "Euler a".to_string(),
            steps: 20,
            cfg_scale: 7.0,
            seed: -1,
            font_paths: vec![
                PathBuf::from("/usr/share/fonts/truetype/dejavu/DejaVuSans-Bold.ttf"),
                PathBuf::from("/usr/share/fonts/TTF/DejaVuSans-Bold.ttf"),
                PathBuf::from("/usr/share/fonts/dejavu/DejaVuSans-Bold.ttf"),
                PathBuf::from("/Library/Fonts/Arial Bold.ttf"),
                PathBuf::from("C:\\Windows\\Fonts\\arialbd.ttf"),
            ],
            small_size: (720, 1280),
            final_size: (1080, 1920),
            frame_rate: 30,
            fallback_duration: 30.0,
            probe_timeout: Duration::from_secs(2),
            story_timeout: Duration::from_secs(60),
            speech_timeout: Duration::from_secs(20),
            image_timeout: Duration::from_secs(120),
            publish_url: None,
            publish_key: None,
        }
    }
}

impl PipelineConfig {
    /// Defaults overlaid with the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with whatever `lookup` returns. Empty values count
    /// as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut config = Self::default();

        if let Some(v) = get("AUTOSHORTS_OUTPUT") {
            config.output_root = PathBuf::from(v);
        }
        config.story_url = get("OLLAMA_URL");
        if let Some(v) = get("OLLAMA_MODEL") {
            config.story_model = v;
        }
        config.speech_url = get("TTS_URL");
        config.voice = get("TTS_VOICE");
        if let Some(v) = get("PIPER_MODEL") {
            config.piper_model = v;
        }
        if let Some(v) = get("A1111_HOST") {
            config.a1111_host = v;
        }
        if let Some(v) = get("AUTOSHORTS_FONT") {
            config.font_paths.insert(0, PathBuf::from(v));
        }
        config.publish_url = get("POSTIZ_API_URL");
        config.publish_key = get("POSTIZ_API_KEY");
        config
    }
}
