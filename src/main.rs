mod args;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use autoshorts::{Orchestrator, PipelineConfig, RunOptions, StepStatus};

use crate::args::{Args, Command, RunArgs, ServeArgs};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Ok(path) = dotenvy::dotenv() {
        info!("Loaded environment from {}", path.display());
    }

    let args = Args::parse();
    match args.command {
        Command::Run(run) => run_batch(run).await,
        Command::Serve(serve) => serve_forever(serve).await,
    }
}

fn overlay(mut config: PipelineConfig, run: &RunArgs) -> PipelineConfig {
    config.output_root = run.outdir.clone();
    if let Some(url) = &run.ollama_url {
        config.story_url = Some(url.clone());
    }
    if let Some(model) = &run.model {
        config.story_model = model.clone();
    }
    if let Some(url) = &run.tts_url {
        config.speech_url = Some(url.clone());
    }
    if let Some(host) = &run.sd_url {
        config.a1111_host = host.clone();
    }
    if run.voice.is_some() {
        config.voice = run.voice.clone();
    }
    if run.speed.is_some() {
        config.speed = run.speed;
    }
    config
}

async fn run_batch(run: RunArgs) -> anyhow::Result<()> {
    let config = overlay(PipelineConfig::from_env(), &run);
    info!(
        "Generating {} short(s) into {} (publish: {})",
        run.count,
        config.output_root.display(),
        run.publish
    );
    tokio::fs::create_dir_all(&config.output_root).await?;
    let orchestrator = Orchestrator::new(config);

    let options = RunOptions {
        prompt: run.prompt.clone(),
        skip_image: run.skip_image,
        publish: run.publish,
        ..Default::default()
    };

    let mut failed = 0;
    for i in 0..run.count {
        info!("=== Short {}/{} ===", i + 1, run.count);
        match orchestrator.run(&options).await {
            Ok(result) => {
                let steps = &result.steps;
                for (name, step) in [
                    ("story", &steps.story),
                    ("tts", &steps.speech),
                    ("image", &steps.image),
                    ("video", &steps.video),
                    ("publish", &steps.publish),
                ] {
                    let detail = step.error.as_deref().or(step.note.as_deref()).unwrap_or("");
                    let status = format!("{:?}", step.status).to_lowercase();
                    println!("[{}] {:<8} {:<10} {}", result.pipeline_id, name, status, detail);
                }
                if result.overall_status == StepStatus::Failed {
                    failed += 1;
                    warn!("Short {} finished with failures: {}", i + 1, result.output_dir.display());
                } else {
                    info!("Short {} done: {}", i + 1, result.output_dir.display());
                }
            }
            Err(e) => {
                failed += 1;
                error!("Short {} could not be recorded: {}", i + 1, e);
            }
        }
    }

    // Failed steps are recorded in each run.json; they are not process errors.
    if failed > 0 {
        warn!("{} of {} short(s) finished with failures", failed, run.count);
    } else {
        info!("All {} short(s) completed", run.count);
    }
    Ok(())
}

async fn serve_forever(serve: ServeArgs) -> anyhow::Result<()> {
    let mut config = PipelineConfig::from_env();
    config.output_root = serve.outdir.clone();
    autoshorts::server::start_server(&serve.host, serve.port, config).await?;
    Ok(())
}
