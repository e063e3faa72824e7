use std::path::Path;

use hound::WavReader;
use serde::Deserialize;
use tokio::process::Command;

pub fn wav_duration_seconds(path: &Path) -> anyhow::Result<f64> {
    let reader = WavReader::open(path)?;
    let spec = reader.spec();
    let samples = reader.len();
    if spec.channels == 0 || spec.sample_rate == 0 {
        anyhow::bail!("WAV header of {} has no channels or sample rate", path.display());
    }
    let frames = samples as f64 / spec.channels as f64;
    let duration = frames / spec.sample_rate as f64;
    Ok(duration)
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    format: ProbeFormat,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: String,
}

pub async fn ffprobe_duration_seconds(ffprobe: &str, path: &Path) -> anyhow::Result<f64> {
    let output = Command::new(ffprobe)
        .args(["-v", "error", "-show_entries", "format=duration", "-of", "json"])
        .arg(path)
        .output()
        .await?;
    if !output.status.success() {
        anyhow::bail!("ffprobe exited with {}", output.status);
    }
    parse_ffprobe_duration(&output.stdout)
}

fn parse_ffprobe_duration(stdout: &[u8]) -> anyhow::Result<f64> {
    let parsed: ProbeOutput = serde_json::from_slice(stdout)?;
    let duration: f64 = parsed.format.duration.trim().parse()?;
    if !duration.is_finite() || duration <= 0.0 {
        anyhow::bail!("ffprobe reported a non-positive duration");
    }
    Ok(duration)
}

/// Writes `seconds` of 16-bit silence; test fixture.
#[cfg(test)]
pub(crate) fn write_wav(path: &Path, seconds: f64, sample_rate: u32, channels: u16) {
    let spec = hound::WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec).unwrap();
    let frames = (seconds * sample_rate as f64) as usize;
    for _ in 0..frames * channels as usize {
        writer.write_sample(0i16).unwrap();
    }
    writer.finalize().unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wav_duration_counts_frames_not_samples() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stereo.wav");
        write_wav(&path, 1.5, 8000, 2);
        let d = wav_duration_seconds(&path).unwrap();
        assert!((d - 1.5).abs() < 1e-6);
    }

    #[test]
    fn garbage_is_not_a_wav() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.wav");
        std::fs::write(&path, b"definitely not riff").unwrap();
        assert!(wav_duration_seconds(&path).is_err());
    }

    #[test]
    fn ffprobe_json_is_parsed() {
        let out = br#"{ "format": { "duration": "12.345000" } }"#;
        assert!((parse_ffprobe_duration(out).unwrap() - 12.345).abs() < 1e-9);
        assert!(parse_ffprobe_duration(br#"{ "format": {} }"#).is_err());
        assert!(parse_ffprobe_duration(br#"{ "format": { "duration": "N/A" } }"#).is_err());
    }
}

