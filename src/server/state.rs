//! Shared state for the control surface.

use std::path::{Path, PathBuf};

use tokio::sync::Mutex;

use crate::config::PipelineConfig;
use crate::pipeline::Orchestrator;

/// Directory under the server output root that holds `run-pipeline` runs.
pub const FUNCTIONS_DIR: &str = "functions";

pub struct AppState {
    /// Output root as given on the command line; `get-file` never serves
    /// anything outside it.
    pub(crate) outdir: PathBuf,
    pub(crate) client: reqwest::Client,
    pub(crate) orchestrator: Orchestrator,
    /// Runs are sequential even when requests arrive concurrently.
    pub(crate) run_lock: Mutex<()>,
    /// Binary re-invoked by `POST /generate`.
    pub(crate) generator: PathBuf,
}

impl AppState {
    pub fn new(mut config: PipelineConfig) -> Self {
        let outdir = config.output_root.clone();
        config.output_root = outdir.join(FUNCTIONS_DIR);
        Self::with_orchestrator(outdir, Orchestrator::new(config))
    }

    pub fn with_orchestrator(outdir: PathBuf, orchestrator: Orchestrator) -> Self {
        let generator = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("autoshorts"));
        Self {
            outdir,
            client: reqwest::Client::new(),
            orchestrator,
            run_lock: Mutex::new(()),
            generator,
        }
    }

    pub(crate) fn config(&self) -> &PipelineConfig {
        self.orchestrator.config()
    }

    pub(crate) fn runs_dir(&self) -> &Path {
        &self.orchestrator.config().output_root
    }
}
