//! Short vertical story videos from local generators: a story model, a TTS
//! engine and an image generator, each reached through an ordered fallback
//! chain, stitched together by ffmpeg and optionally published.

pub mod audio;
pub mod compositor;
pub mod config;
pub mod decode;
pub mod error;
pub mod image_gen;
pub mod metadata;
pub mod pipeline;
pub mod probe;
pub mod publisher;
pub mod request;
pub mod resolver;
pub mod server;
pub mod speech;
pub mod story;
pub mod textwrap;
pub mod tool;

pub use config::PipelineConfig;
pub use error::{PipelineError, Result};
pub use pipeline::{Orchestrator, PipelineRun, RunOptions, StepStatus};
