use std::sync::Arc;

use alpaca_runtime::{load_model, TinyModel, TracingTelemetry};
use alpaca_server::config::{Cli, Command, InitModelArgs, ServeArgs};
use alpaca_server::{run_server, AppState, GenerationQueue};
use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "alpaca_server=info,alpaca_runtime=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match Cli::parse().into_command() {
        Command::Serve(args) => serve(args).await,
        Command::InitModel(args) => init_model(&args),
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let model = load_model(args.backend.into(), &args.model_path)
        .with_context(|| format!("failed to load model from {}", args.model_path.display()))?;

    let queue = GenerationQueue::start(model, args.queue_config(), Arc::new(TracingTelemetry))
        .context("failed to start generation worker")?;

    let state = AppState::new(queue, args.server_config());
    run_server(state, args.addr())
        .await
        .with_context(|| format!("server on {} failed", args.addr()))
}

fn init_model(args: &InitModelArgs) -> Result<()> {
    if let Some(dir) = args.output.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }
    let model = TinyModel::random(args.model_config(), args.seed);
    model
        .save(&args.output)
        .with_context(|| format!("failed to write {}", args.output.display()))?;
    tracing::info!(path = %args.output.display(), seed = args.seed, "model written");
    Ok(())
}
