//! Background image generation: a local Stable Diffusion WebUI (A1111) when
//! it answers its health check, otherwise a procedural gradient with the
//! prompt drawn on top.

use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Duration;

use ab_glyph::{Font, FontVec, GlyphId, PxScale, ScaleFont, point};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use image::codecs::jpeg::JpegEncoder;
use image::{ImageFormat, Rgb, RgbImage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::config::PipelineConfig;
use crate::error::{AttemptError, Result};
use crate::probe::{self, ProbeTarget};
use crate::request::{BackendHints, Capability, Extras, GenerationRequest, GenerationResult, Output};
use crate::resolver::{Candidate, CandidateList, resolve};
use crate::textwrap::wrap_to_width;

static LOOSE_SEED: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bseed\s*:\s*(-?\d+)").unwrap());

const FONT_SIZE: f32 = 42.0;
const TEXT_MARGIN: u32 = 40;
const TEXT_TOP: f32 = 120.0;
const LINE_GAP: f32 = 8.0;
const RINGS: usize = 30;
const JPEG_QUALITY: u8 = 85;

/// Largest width or height either generator will be asked for.
pub const MAX_IMAGE_SIDE: u32 = 4096;

/// Requested size, or `default`, with each side kept within `1..=MAX_IMAGE_SIDE`.
pub fn bounded_size(hints: &BackendHints, default: (u32, u32)) -> (u32, u32) {
    let side = |v: u32| v.clamp(1, MAX_IMAGE_SIDE);
    (
        side(hints.width.unwrap_or(default.0)),
        side(hints.height.unwrap_or(default.1)),
    )
}

#[derive(Debug, Serialize)]
struct Txt2ImgRequest<'a> {
    prompt: &'a str,
    negative_prompt: &'a str,
    width: u32,
    height: u32,
    sampler_index: &'a str,
    steps: u32,
    cfg_scale: f32,
    seed: i64,
    restore_faces: bool,
    override_settings: serde_json::Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct Txt2ImgResponse {
    #[serde(default)]
    images: Vec<String>,
    #[serde(default)]
    info: Value,
}

/// Seed and effective prompt from A1111's `info`, which is either a JSON
/// object, a JSON document encoded as a string, or free text like
/// `"Steps: 20, Sampler: Euler a, Seed: 1234"`.
fn parse_info(info: &Value) -> (Option<i64>, Option<String>) {
    match info {
        Value::Object(map) => {
            let seed = map
                .get("seed")
                .and_then(Value::as_i64)
                .or_else(|| map.get("all_seeds")?.as_array()?.first()?.as_i64());
            let prompt = map.get("prompt").and_then(Value::as_str).map(str::to_string);
            (seed, prompt)
        }
        Value::String(s) => match serde_json::from_str::<Value>(s) {
            Ok(inner @ Value::Object(_)) => parse_info(&inner),
            _ => {
                let seed = LOOSE_SEED
                    .captures(s)
                    .and_then(|c| c.get(1))
                    .and_then(|m| m.as_str().parse().ok());
                (seed, None)
            }
        },
        _ => (None, None),
    }
}

fn format_name(bytes: &[u8]) -> &'static str {
    match image::guess_format(bytes) {
        Ok(ImageFormat::Png) => "png",
        Ok(ImageFormat::WebP) => "webp",
        _ => "jpeg",
    }
}

pub struct A1111 {
    client: reqwest::Client,
    host: String,
    negative_prompt: String,
    sampler: String,
    steps: u32,
    cfg_scale: f32,
    seed: i64,
    default_size: (u32, u32),
    probe_timeout: Duration,
    timeout: Duration,
}

impl A1111 {
    pub fn new(config: &PipelineConfig, client: reqwest::Client) -> Self {
        Self {
            client,
            host: config.a1111_host.clone(),
            negative_prompt: config.negative_prompt.clone(),
            sampler: config.sampler.clone(),
            steps: config.steps,
            cfg_scale: config.cfg_scale,
            seed: config.seed,
            default_size: config.small_size,
            probe_timeout: config.probe_timeout,
            timeout: config.image_timeout,
        }
    }
}

#[async_trait]
impl Candidate for A1111 {
    fn name(&self) -> &str {
        "a1111"
    }

    async fn attempt(&self, request: &GenerationRequest) -> std::result::Result<Output, AttemptError> {
        let host = request.hints.url.as_deref().unwrap_or(self.host.as_str()).trim_end_matches('/');

        let health = ProbeTarget::http(format!("{host}/sdapi/v1/version"));
        if !probe::probe(&self.client, &health, self.probe_timeout).await.is_alive() {
            return Err(AttemptError::Unavailable(format!("A1111 not reachable at {host}")));
        }

        let (width, height) = bounded_size(&request.hints, self.default_size);
        let body = Txt2ImgRequest {
            prompt: &request.input,
            negative_prompt: &self.negative_prompt,
            width,
            height,
            sampler_index: &self.sampler,
            steps: self.steps,
            cfg_scale: self.cfg_scale,
            seed: self.seed,
            restore_faces: false,
            override_settings: serde_json::Map::new(),
        };
        info!("A1111 txt2img {}x{} at {}", body.width, body.height, host);

        let resp = self
            .client
            .post(format!("{host}/sdapi/v1/txt2img"))
            .json(&body)
            .timeout(self.timeout)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(AttemptError::Failed(format!("txt2img returned {}", resp.status())));
        }
        let parsed: Txt2ImgResponse = resp
            .json()
            .await
            .map_err(|e| AttemptError::Malformed(e.to_string()))?;

        let first = parsed
            .images
            .first()
            .ok_or_else(|| AttemptError::Malformed("no image returned from A1111".into()))?;
        let bytes = STANDARD
            .decode(first.trim())
            .map_err(|e| AttemptError::Malformed(format!("image is not base64: {e}")))?;

        let (seed, prompt) = parse_info(&parsed.info);
        Ok(Output::bytes(bytes.clone()).with_extras(Extras {
            seed,
            prompt: prompt.or_else(|| Some(request.input.clone())),
            format: Some(format_name(&bytes).to_string()),
            ..Default::default()
        }))
    }
}

/// Gradient, random rings and the wrapped prompt. Terminal candidate.
pub struct Procedural {
    font_paths: Vec<PathBuf>,
    default_size: (u32, u32),
}

impl Procedural {
    pub fn new(font_paths: Vec<PathBuf>, default_size: (u32, u32)) -> Self {
        Self {
            font_paths,
            default_size,
        }
    }

    fn load_font(&self) -> Option<FontVec> {
        self.font_paths.iter().find_map(|p| {
            let bytes = std::fs::read(p).ok()?;
            FontVec::try_from_vec(bytes).ok()
        })
    }
}

#[async_trait]
impl Candidate for Procedural {
    fn name(&self) -> &str {
        "procedural"
    }

    async fn attempt(&self, request: &GenerationRequest) -> std::result::Result<Output, AttemptError> {
        let (width, height) = bounded_size(&request.hints, self.default_size);
        let font = self.load_font();
        if font.is_none() {
            debug!("no usable font found; prompt text will not be drawn");
        }

        let img = render_background(&request.input, width, height, font.as_ref(), &mut StdRng::from_entropy());
        let bytes = encode_jpeg(&img).map_err(|e| AttemptError::Failed(e.to_string()))?;
        Ok(Output::bytes(bytes).with_extras(Extras {
            prompt: Some(request.input.clone()),
            format: Some("jpeg".to_string()),
            ..Default::default()
        }))
    }
}

pub fn encode_jpeg(img: &RgbImage) -> image::ImageResult<Vec<u8>> {
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, JPEG_QUALITY).encode_image(img)?;
    Ok(buf)
}

pub fn render_background(prompt: &str, width: u32, height: u32, font: Option<&FontVec>, rng: &mut impl Rng) -> RgbImage {
    let mut img = RgbImage::new(width, height);

    for y in 0..height {
        let t = y as f32 / height as f32;
        let color = Rgb([
            (30.0 + t * 200.0) as u8,
            (10.0 + t * 120.0) as u8,
            (40.0 + t * 160.0) as u8,
        ]);
        for x in 0..width {
            img.put_pixel(x, y, color);
        }
    }

    for _ in 0..RINGS {
        let cx = rng.gen_range(0..=width) as i64;
        let cy = rng.gen_range(0..=height) as i64;
        let r = rng.gen_range(20..=200) as i64;
        let color = Rgb([rng.gen_range(100..=255), rng.gen_range(100..=255), rng.gen_range(100..=255)]);
        draw_ring(&mut img, cx, cy, r, 2, color);
    }

    if let Some(font) = font {
        let scale = PxScale::from(FONT_SIZE);
        let max_width = width.saturating_sub(2 * TEXT_MARGIN) as f32;
        let lines = wrap_to_width(prompt, max_width, |s| Some(line_width(font, scale, s)));
        let line_height = font.as_scaled(scale).height();
        let mut y = TEXT_TOP;
        for line in lines {
            let w = line_width(font, scale, &line);
            let x = ((width as f32 - w) / 2.0).max(0.0);
            draw_text(&mut img, font, scale, &line, x, y);
            y += line_height + LINE_GAP;
        }
    }

    img
}

fn draw_ring(img: &mut RgbImage, cx: i64, cy: i64, r: i64, thickness: i64, color: Rgb<u8>) {
    let (w, h) = (img.width() as i64, img.height() as i64);
    let outer = (r * r) as f64;
    let inner = ((r - thickness).max(0) * (r - thickness).max(0)) as f64;
    for y in (cy - r).max(0)..=(cy + r).min(h - 1) {
        for x in (cx - r).max(0)..=(cx + r).min(w - 1) {
            let d = ((x - cx) * (x - cx) + (y - cy) * (y - cy)) as f64;
            if d <= outer && d >= inner {
                img.put_pixel(x as u32, y as u32, color);
            }
        }
    }
}

fn line_width(font: &FontVec, scale: PxScale, text: &str) -> f32 {
    let scaled = font.as_scaled(scale);
    let mut width = 0.0;
    let mut prev: Option<GlyphId> = None;
    for c in text.chars() {
        let id = scaled.glyph_id(c);
        if let Some(p) = prev {
            width += scaled.kern(p, id);
        }
        width += scaled.h_advance(id);
        prev = Some(id);
    }
    width
}

fn draw_text(img: &mut RgbImage, font: &FontVec, scale: PxScale, text: &str, x: f32, top: f32) {
    let scaled = font.as_scaled(scale);
    let mut caret = point(x, top + scaled.ascent());
    let mut prev: Option<GlyphId> = None;
    let (w, h) = (img.width() as i32, img.height() as i32);

    for c in text.chars() {
        let id = scaled.glyph_id(c);
        if let Some(p) = prev {
            caret.x += scaled.kern(p, id);
        }
        let glyph = id.with_scale_and_position(scale, caret);
        caret.x += scaled.h_advance(id);
        prev = Some(id);

        let Some(outlined) = font.outline_glyph(glyph) else {
            continue;
        };
        let bounds = outlined.px_bounds();
        outlined.draw(|gx, gy, coverage| {
            let px = bounds.min.x as i32 + gx as i32;
            let py = bounds.min.y as i32 + gy as i32;
            if px < 0 || py < 0 || px >= w || py >= h {
                return;
            }
            let pixel = img.get_pixel_mut(px as u32, py as u32);
            for channel in pixel.0.iter_mut() {
                let base = *channel as f32;
                *channel = (base + (255.0 - base) * coverage.clamp(0.0, 1.0)) as u8;
            }
        });
    }
}

pub struct ImageAdapter {
    candidates: CandidateList,
}

impl ImageAdapter {
    pub fn new(config: &PipelineConfig, client: reqwest::Client) -> Self {
        let candidates: CandidateList = vec![
            Box::new(A1111::new(config, client)),
            Box::new(Procedural::new(config.font_paths.clone(), config.small_size)),
        ];
        Self { candidates }
    }

    pub fn from_candidates(candidates: CandidateList) -> Self {
        Self { candidates }
    }

    pub async fn generate(&self, prompt: &str, hints: BackendHints) -> Result<GenerationResult> {
        let request = GenerationRequest::new(Capability::Image, prompt).with_hints(hints);
        resolve(Capability::Image, &self.candidates, &request).await
    }
}

#[cfg(test)]
mod tests {
    use axum::Json;
    use axum::Router;
    use axum::routing::{get, post};

    use super::*;

    async fn spawn(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn tiny_png() -> Vec<u8> {
        let img = RgbImage::from_pixel(2, 2, Rgb([255, 0, 0]));
        let mut buf = std::io::Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    #[test]
    fn info_seed_from_json_object_string_and_loose_text() {
        let obj = serde_json::json!({ "seed": 1234, "prompt": "cats" });
        assert_eq!(parse_info(&obj), (Some(1234), Some("cats".into())));

        let all_seeds = serde_json::json!({ "all_seeds": [77, 78] });
        assert_eq!(parse_info(&all_seeds).0, Some(77));

        let encoded = Value::String(r#"{"seed": 99, "prompt": "p"}"#.into());
        assert_eq!(parse_info(&encoded), (Some(99), Some("p".into())));

        let loose = Value::String("Steps: 20, Sampler: Euler a, Seed: -5, Size: 720x1280".into());
        assert_eq!(parse_info(&loose), (Some(-5), None));

        assert_eq!(parse_info(&Value::String("nothing here".into())), (None, None));
        assert_eq!(parse_info(&Value::Null), (None, None));
    }

    #[test]
    fn procedural_render_is_sized_and_seeded() {
        let a = render_background("a prompt", 72, 128, None, &mut StdRng::seed_from_u64(7));
        let b = render_background("a prompt", 72, 128, None, &mut StdRng::seed_from_u64(7));
        assert_eq!(a.dimensions(), (72, 128));
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn procedural_candidate_always_produces_a_jpeg() {
        let candidate = Procedural::new(vec![PathBuf::from("/nonexistent/font.ttf")], (90, 160));
        let request = GenerationRequest::new(Capability::Image, "surreal meme");
        let output = candidate.attempt(&request).await.unwrap();
        let bytes = output.payload.as_bytes();
        assert_eq!(image::guess_format(bytes).unwrap(), ImageFormat::Jpeg);
        let decoded = image::load_from_memory(bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (90, 160));
    }

    #[test]
    fn requested_sizes_are_bounded() {
        let hints = |width, height| BackendHints {
            width,
            height,
            ..Default::default()
        };
        assert_eq!(bounded_size(&hints(None, None), (720, 1280)), (720, 1280));
        assert_eq!(bounded_size(&hints(Some(200_000), Some(0)), (720, 1280)), (MAX_IMAGE_SIDE, 1));
        assert_eq!(bounded_size(&hints(Some(u32::MAX), None), (720, 1280)), (MAX_IMAGE_SIDE, 1280));
    }

    #[tokio::test]
    async fn procedural_candidate_caps_huge_requests() {
        let candidate = Procedural::new(Vec::new(), (90, 160));
        let request = GenerationRequest::new(Capability::Image, "wide").with_hints(BackendHints {
            width: Some(200_000),
            height: Some(2),
            ..Default::default()
        });
        let output = candidate.attempt(&request).await.unwrap();
        let decoded = image::load_from_memory(output.payload.as_bytes()).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (MAX_IMAGE_SIDE, 2));
    }

    #[tokio::test]
    async fn a1111_is_skipped_when_health_check_fails() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let config = PipelineConfig {
            a1111_host: format!("http://{addr}"),
            ..PipelineConfig::default()
        };
        let candidate = A1111::new(&config, reqwest::Client::new());
        let request = GenerationRequest::new(Capability::Image, "p");
        assert!(matches!(
            candidate.attempt(&request).await,
            Err(AttemptError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn a1111_response_is_decoded_with_seed() {
        let png = tiny_png();
        let encoded = STANDARD.encode(&png);
        let base = spawn(
            Router::new()
                .route("/sdapi/v1/version", get(|| async { Json(serde_json::json!({ "app_version": "1.9" })) }))
                .route(
                    "/sdapi/v1/txt2img",
                    post(move |Json(body): Json<Value>| {
                        let encoded = encoded.clone();
                        async move {
                            assert_eq!(body["width"], 720);
                            assert_eq!(body["height"], 1280);
                            assert_eq!(body["sampler_index"], "Euler a");
                            let info = serde_json::json!({ "seed": 31337, "prompt": body["prompt"] }).to_string();
                            Json(serde_json::json!({ "images": [encoded], "info": info }))
                        }
                    }),
                ),
        )
        .await;

        let adapter = ImageAdapter::from_candidates(vec![
            Box::new(A1111::new(&PipelineConfig::default(), reqwest::Client::new())),
            Box::new(Procedural::new(Vec::new(), (72, 128))),
        ]);
        let result = adapter
            .generate(
                "cat astronaut",
                BackendHints {
                    url: Some(base),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(result.provenance.backend, "a1111");
        assert_eq!(result.provenance.extras.seed, Some(31337));
        assert_eq!(result.provenance.extras.prompt.as_deref(), Some("cat astronaut"));
        assert_eq!(result.provenance.extras.format.as_deref(), Some("png"));
        assert_eq!(result.payload.as_bytes(), png.as_slice());
    }

    #[test]
    fn rings_stay_inside_the_canvas() {
        let mut img = RgbImage::new(10, 10);
        draw_ring(&mut img, 0, 0, 50, 2, Rgb([1, 2, 3]));
        draw_ring(&mut img, 5, 5, 3, 2, Rgb([9, 9, 9]));
        assert_eq!(*img.get_pixel(5, 2), Rgb([9, 9, 9]));
        assert_eq!(*img.get_pixel(5, 5), Rgb([0, 0, 0]));
    }
}
