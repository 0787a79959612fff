use anyhow::Context;
use clap::Parser;
use printer_agent::cli::Args;
use printer_agent::config::{ConfigManager, LoadOutcome};
use printer_agent::context::AgentContext;
use printer_agent::logging::init_tracing;
use printer_agent::scheduler::SyncScheduler;
use printer_agent::shutdown::spawn_shutdown_handler;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let manager = match ConfigManager::load_or_create(&args.config)? {
        LoadOutcome::Loaded(manager) => manager,
        LoadOutcome::CreatedDefault(path) => {
            eprintln!(
                "created default config at {}; edit it and start the agent again",
                path.display()
            );
            return Ok(());
        }
    };
    let config = manager.into_config();

    let _file_guard = init_tracing(&args.log_dir, &config.logging, args.log_to_stderr)?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %args.config.display(),
        "starting printhub agent"
    );

    let context = AgentContext::new(config, &args.state).context("failed to set up agent")?;
    let mut scheduler = SyncScheduler::new(context);
    if let Err(err) = scheduler.startup_checks().await {
        tracing::error!(error = %format_args!("{err:#}"), "startup checks failed");
        return Err(err.context("startup checks failed"));
    }

    let shutdown = CancellationToken::new();
    let _signals = spawn_shutdown_handler(shutdown.clone());
    scheduler.run(shutdown).await;
    Ok(())
}
