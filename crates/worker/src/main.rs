use anyhow::{Context, Result};
use clap::Parser;
use rig_core::{open_store, print_summary, Config, LoadDriver, PromotionMode};
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "worker")]
#[command(about = "Ticket queue load worker - runs a slice of virtual users")]
struct Args {
    /// Path to configuration file
    #[arg(long, default_value = "config/example.local.toml")]
    config: PathBuf,

    /// Worker ID (overrides config)
    #[arg(long)]
    worker_id: Option<String>,

    /// Run ID (overrides config)
    #[arg(long)]
    run_id: Option<String>,

    /// Promotion detection mode: poll or stream (overrides config)
    #[arg(long)]
    mode: Option<String>,

    /// Print stats every N milliseconds (overrides config)
    #[arg(long)]
    print_every_ms: Option<u64>,

    /// Directory for the result file
    #[arg(long, default_value = "results")]
    results_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = Config::from_file(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    if let Some(worker_id) = args.worker_id {
        config.worker.id = worker_id;
    }
    if let Some(run_id) = args.run_id {
        config.scenario.run_id = Some(run_id);
    }
    if let Some(print_every_ms) = args.print_every_ms {
        config.scenario.print_every_ms = print_every_ms;
    }
    match args.mode.as_deref() {
        None => {}
        Some("poll") => config.promotion.mode = PromotionMode::Poll,
        Some("stream") => config.promotion.mode = PromotionMode::Stream,
        Some(other) => anyhow::bail!("Invalid mode: {}, must be 'poll' or 'stream'", other),
    }

    info!(
        "Starting worker '{}' in {:?} mode",
        config.worker.id, config.promotion.mode
    );
    info!(
        "VUs {}..={} of {}",
        config.load.vu_offset + 1,
        config.load.vu_offset + config.load.vus,
        config.load.total_vus()
    );
    info!("Events: {}", config.events.ids.join(", "));

    let store = open_store(&config.store)
        .await
        .context("Failed to open coordination store")?;
    info!("Coordination store: {}", store.name());

    let worker_id = config.worker.id.clone();
    let burst_start_ms = config.scenario.burst_start_ms.unwrap_or_else(|| {
        chrono::Utc::now().timestamp_millis() + config.scenario.burst_offset_ms as i64
    });
    let driver = LoadDriver::new(config, store).context("Failed to build load driver")?;
    info!("Run id: {}, burst start: {}", driver.run_id(), burst_start_ms);

    let abort = driver.abort_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, aborting sessions");
            abort.abort();
        }
    });

    let (report, error) = driver.run_slice(burst_start_ms, &worker_id).await;

    let output_path = args
        .results_dir
        .join(format!("worker_{}_{}.json", worker_id, driver.run_id()));
    let written = report
        .write_json(&output_path)
        .with_context(|| format!("Failed to write results to {:?}", output_path))?;
    info!("Results written to {}", written.display());
    print_summary(&report);

    if let Some(e) = error {
        return Err(e).context("Worker run failed");
    }
    Ok(())
}
