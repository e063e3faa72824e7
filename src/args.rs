use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[clap(name = "autoshorts", about = "Generate short vertical story videos")]
pub struct Args {
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Generate one or more shorts back to back.
    Run(RunArgs),
    /// Serve the HTTP control surface.
    Serve(ServeArgs),
}

#[derive(clap::Args, Debug, Clone)]
pub struct RunArgs {
    #[clap(long, default_value_t = 1)]
    pub count: usize,

    #[clap(long, default_value = "outputs")]
    pub outdir: PathBuf,

    #[clap(long)]
    pub publish: bool,

    #[clap(long)]
    pub prompt: Option<String>,

    #[clap(long)]
    pub ollama_url: Option<String>,

    #[clap(long)]
    pub model: Option<String>,

    #[clap(long)]
    pub tts_url: Option<String>,

    #[clap(long)]
    pub sd_url: Option<String>,

    #[clap(long)]
    pub voice: Option<String>,

    #[clap(long)]
    pub speed: Option<f32>,

    #[clap(long)]
    pub skip_image: bool,
}

#[derive(clap::Args, Debug, Clone)]
pub struct ServeArgs {
    #[clap(long, default_value_t = 5000)]
    pub port: u16,

    #[clap(long, default_value = "0.0.0.0")]
    pub host: String,

    #[clap(long, default_value = "outputs")]
    pub outdir: PathBuf,
}
