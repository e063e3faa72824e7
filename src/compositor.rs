//! Still image + narration -> vertical video, in two ffmpeg passes: a cheap
//! composition at generation resolution, then a lanczos upscale that copies
//! the audio stream untouched.

use std::path::{Path, PathBuf};

use tokio::process::Command;
use tracing::{info, warn};

use crate::audio::{ffprobe_duration_seconds, wav_duration_seconds};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};

#[derive(Debug, Clone)]
pub struct Compositor {
    ffmpeg: String,
    ffprobe: String,
    frame_rate: u32,
    fallback_duration: f64,
}

impl Compositor {
    pub fn new(config: &PipelineConfig) -> Self {
        Self::with_binaries(config, "ffmpeg", "ffprobe")
    }

    /// Uses the given encoder and prober instead of the ones on `PATH`.
    pub fn with_binaries(config: &PipelineConfig, ffmpeg: impl Into<String>, ffprobe: impl Into<String>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
            frame_rate: config.frame_rate,
            fallback_duration: config.fallback_duration,
        }
    }

    /// Length of the narration in seconds. Falls back to the configured
    /// default (30s) when neither the WAV header nor ffprobe can tell.
    pub async fn measure_duration(&self, audio: &Path) -> f64 {
        match wav_duration_seconds(audio) {
            Ok(d) if d > 0.0 => return d,
            Ok(_) => warn!("{} has no samples", audio.display()),
            Err(e) => info!("not a readable WAV ({}), asking ffprobe", e),
        }
        match ffprobe_duration_seconds(&self.ffprobe, audio).await {
            Ok(d) => d,
            Err(e) => {
                warn!(
                    "could not measure {} ({}); using {}s",
                    audio.display(),
                    e,
                    self.fallback_duration
                );
                self.fallback_duration
            }
        }
    }

    pub fn compose_args(&self, image: &Path, audio: &Path, out: &Path, width: u32, height: u32, duration: f64) -> Vec<String> {
        let vf = format!(
            "scale={width}:{height}:force_original_aspect_ratio=decrease,\
             pad={width}:{height}:(ow-iw)/2:(oh-ih)/2,format=yuv420p"
        );
        vec![
            "-y".into(),
            "-loop".into(),
            "1".into(),
            "-i".into(),
            path_arg(image),
            "-i".into(),
            path_arg(audio),
            "-c:v".into(),
            "libx264".into(),
            "-t".into(),
            format!("{duration:.3}"),
            "-r".into(),
            self.frame_rate.to_string(),
            "-vf".into(),
            vf,
            "-c:a".into(),
            "aac".into(),
            "-b:a".into(),
            "192k".into(),
            "-shortest".into(),
            path_arg(out),
        ]
    }

    pub fn upscale_args(&self, input: &Path, out: &Path, width: u32, height: u32) -> Vec<String> {
        vec![
            "-y".into(),
            "-i".into(),
            path_arg(input),
            "-c:v".into(),
            "libx264".into(),
            "-preset".into(),
            "slow".into(),
            "-crf".into(),
            "18".into(),
            "-vf".into(),
            format!("scale={width}:{height}:flags=lanczos,format=yuv420p"),
            "-c:a".into(),
            "copy".into(),
            path_arg(out),
        ]
    }

    pub async fn compose(&self, image: &Path, audio: &Path, out: &Path, width: u32, height: u32) -> Result<PathBuf> {
        let duration = self.measure_duration(audio).await;
        info!("Composing {}x{} video of {:.2}s into {}", width, height, duration, out.display());
        self.run_ffmpeg(&self.compose_args(image, audio, out, width, height, duration))
            .await?;
        Ok(out.to_path_buf())
    }

    pub async fn upscale(&self, input: &Path, out: &Path, width: u32, height: u32) -> Result<PathBuf> {
        info!("Upscaling {} to {}x{}", input.display(), width, height);
        self.run_ffmpeg(&self.upscale_args(input, out, width, height)).await?;
        Ok(out.to_path_buf())
    }

    async fn run_ffmpeg(&self, args: &[String]) -> Result<()> {
        let output = Command::new(&self.ffmpeg)
            .args(args)
            .output()
            .await
            .map_err(|e| PipelineError::tool("ffmpeg", format!("could not start: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: Vec<&str> = stderr.lines().rev().take(3).collect();
            return Err(PipelineError::tool(
                "ffmpeg",
                format!(
                    "exited with {}: {}",
                    output.status,
                    tail.into_iter().rev().collect::<Vec<_>>().join(" | ")
                ),
            ));
        }
        Ok(())
    }
}

fn path_arg(p: &Path) -> String {
    p.to_string_lossy().into_owned()
}
