use anyhow::{Context, Result};
use clap::Parser;
use rig_core::{
    generate_run_id, open_store, print_summary, Config, LoadDriver, LoadShapeKind, QuorumSource,
    RampPlanner, RunReport, StoreBackend,
};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "controller")]
#[command(about = "Ticket queue load rig controller - gates, barrier, workers and result merging")]
struct Args {
    /// Path to configuration file
    #[arg(long, default_value = "config/example.local.toml")]
    config: PathBuf,

    /// Dry run: print what would be executed without running
    #[arg(long)]
    dry_run: bool,

    /// Spawn N local worker processes
    #[arg(long = "local-workers", alias = "local")]
    local_workers: Option<u32>,

    /// Run ID (overrides config; generated when absent)
    #[arg(long)]
    run_id: Option<String>,

    /// Run every virtual user inside this process
    #[arg(long)]
    in_process: bool,

    /// Only print the start plan without running
    #[arg(long)]
    plan_only: bool,

    /// Merge an existing run's worker result JSONs without spawning workers.
    #[arg(long)]
    merge_run_id: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = Config::from_file(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    print_load_plan(&config);
    if args.plan_only {
        return Ok(());
    }

    if let Some(run_id) = args.merge_run_id.as_deref() {
        let workers = collect_worker_results(run_id)?;
        if workers.is_empty() {
            anyhow::bail!("No worker results found for run_id={run_id}");
        }
        let merged = merge_reports(run_id, workers);
        save_merged_report(&merged)?;
        print_summary(&merged);
        return Ok(());
    }

    let run_id = args
        .run_id
        .or_else(|| config.scenario.run_id.clone())
        .unwrap_or_else(generate_run_id);
    config.scenario.run_id = Some(run_id.clone());

    let local_n = args
        .local_workers
        .or(config.controller.as_ref().and_then(|c| c.local_workers))
        .unwrap_or(0);

    if args.in_process || local_n == 0 {
        if args.dry_run {
            println!("\n=== Dry Run ===");
            println!("in-process run of {} VUs, run_id={}", config.load.total_vus(), run_id);
            println!();
            return Ok(());
        }
        return run_in_process(config).await;
    }

    let worker_bin = match config.controller.as_ref().and_then(|c| c.worker_bin.clone()) {
        Some(p) => PathBuf::from(p),
        None => infer_worker_binary().context("Failed to infer worker binary path")?,
    };

    if args.dry_run {
        print_dry_run(&worker_bin, &config, local_n, &run_id);
        return Ok(());
    }

    run_with_workers(config, worker_bin, local_n).await
}

async fn run_in_process(config: Config) -> Result<()> {
    let store = open_store(&config.store)
        .await
        .context("Failed to open coordination store")?;
    let driver = LoadDriver::new(config, store).context("Failed to build load driver")?;
    info!("Running in-process (run_id={})", driver.run_id());

    let abort = driver.abort_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, aborting run");
            abort.abort();
        }
    });

    let execution = driver.execute().await;
    save_merged_report(&execution.report)?;
    print_summary(&execution.report);

    if let Some(e) = execution.error {
        return Err(e).context("Run failed");
    }
    Ok(())
}

async fn run_with_workers(mut config: Config, worker_bin: PathBuf, local_n: u32) -> Result<()> {
    let total = config.load.total_vus();
    if config.barrier.enabled
        && config.barrier.quorum == QuorumSource::ReadyCounter
        && config.store.backend == StoreBackend::Memory
    {
        anyhow::bail!("Ready-counter barrier across worker processes needs store.backend = \"redis\"");
    }
    // the controller owns the full population; workers only get slices
    config.load.vus = total;
    config.load.vu_offset = 0;
    config.load.total = Some(total);
    validate_worker_slices(&config, local_n)?;

    let store = open_store(&config.store)
        .await
        .context("Failed to open coordination store")?;
    // no sessions run here, so the per-process cap does not apply
    let mut controller_cfg = config.clone();
    controller_cfg.target.max_in_flight = controller_cfg
        .target
        .max_in_flight
        .max(u32::try_from(total).unwrap_or(u32::MAX));
    let driver = LoadDriver::new(controller_cfg, store).context("Failed to build load driver")?;
    let run_id = driver.run_id().to_string();

    std::fs::create_dir_all("results").ok();
    std::fs::create_dir_all("runs").ok();

    let mut error = None;
    let mut barrier = None;
    match driver.setup().await {
        Ok(burst_start_ms) => {
            info!(
                "Spawning {} local workers using {:?} (run_id={}, burst_start_ms={})",
                local_n, worker_bin, run_id, burst_start_ms
            );
            let (kill_tx, kill_rx) = watch::channel(false);
            let kill_tx = Arc::new(kill_tx);
            let abort = driver.abort_handle();
            let ctrl_c_kill = kill_tx.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupt received, stopping workers");
                    abort.abort();
                    ctrl_c_kill.send_replace(true);
                }
            });

            let workers = spawn_workers(&config, &worker_bin, local_n, &run_id, burst_start_ms, kill_rx);
            let coordination = async {
                let result = driver.coordinate(burst_start_ms).await;
                if result.is_err() {
                    kill_tx.send_replace(true);
                }
                result
            };
            let (workers, coordination) = tokio::join!(workers, coordination);

            match coordination {
                Ok(report) => barrier = report,
                Err(e) => error = Some(anyhow::Error::new(e).context("Coordination failed")),
            }
            if let Err(e) = workers {
                warn!("Worker failure: {e:#}");
                error.get_or_insert(e);
            }
        }
        Err(e) => error = Some(anyhow::Error::new(e).context("Setup failed")),
    }

    if let Err(e) = driver.teardown().await {
        warn!("Teardown failed: {e}");
        error.get_or_insert(anyhow::Error::new(e).context("Teardown failed"));
    }

    let workers = collect_worker_results(&run_id)?;
    let merged = merge_reports(&run_id, workers)
        .with_barrier(barrier)
        .with_error(error.as_ref().map(|e| format!("{e:#}")));
    save_merged_report(&merged)?;
    print_summary(&merged);

    match error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

async fn spawn_workers(
    config: &Config,
    worker_bin: &Path,
    local_n: u32,
    run_id: &str,
    burst_start_ms: i64,
    kill: watch::Receiver<bool>,
) -> Result<()> {
    let mut handles = Vec::new();
    for i in 0..local_n {
        let Some(worker_cfg_path) = write_worker_config(config, local_n, i, run_id, burst_start_ms)
            .context("write worker config")?
        else {
            continue;
        };
        let worker_id = format!("worker-{}", i);

        let mut cmd = Command::new(worker_bin);
        cmd.arg("--config")
            .arg(&worker_cfg_path)
            .arg("--worker-id")
            .arg(&worker_id)
            .arg("--run-id")
            .arg(run_id)
            .arg("--print-every-ms")
            .arg(config.scenario.print_every_ms.to_string())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn worker {worker_id}"))?;

        let mut kill = kill.clone();
        handles.push(tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status?,
                _ = async { let _ = kill.wait_for(|k| *k).await; } => {
                    warn!("Stopping worker {worker_id}");
                    child.kill().await.ok();
                    child.wait().await?
                }
            };
            if !status.success() {
                anyhow::bail!("Worker {worker_id} exited with status {status}");
            }
            Ok::<(), anyhow::Error>(())
        }));
    }

    let mut first_error = None;
    for h in handles {
        if let Err(e) = h.await? {
            first_error.get_or_insert(e);
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn print_load_plan(config: &Config) {
    let planner = RampPlanner::new(&config.load);
    let total = config.load.total_vus();
    let plan = planner.plan(1..=total);

    println!("\n=== Load Plan ===");
    println!("Shape: {:?}", config.load.shape);
    println!("Total VUs: {} ({} reached by the plan)", total, plan.len());
    println!("Events: {}", config.events.ids.join(", "));
    println!("Promotion mode: {:?}", config.promotion.mode);
    if config.load.shape == LoadShapeKind::Staged {
        println!("Total duration: {}ms", planner.total_duration_ms());
        for (idx, stage) in planner.stages().iter().enumerate() {
            println!("Stage {}: to {} VUs over {}ms", idx, stage.target, stage.duration_ms);
        }
    }
    if let (Some(first), Some(last)) = (plan.first(), plan.last()) {
        println!("First start: +{}ms (vu {})", first.offset_ms, first.vu_id);
        println!("Last start: +{}ms (vu {})", last.offset_ms, last.vu_id);
    }
    let retiring = plan.iter().filter(|s| s.retire_at_ms.is_some()).count();
    if retiring > 0 {
        println!("Retired before the end: {}", retiring);
    }
    println!();
}

fn print_dry_run(worker_bin: &Path, config: &Config, local_n: u32, run_id: &str) {
    println!("\n=== Dry Run ===");
    println!("worker_bin: {:?}", worker_bin);
    println!("local workers: {}", local_n);
    println!("run_id: {}", run_id);
    println!("\nWould execute:");

    let total = config.load.total_vus();
    for i in 0..local_n {
        let (offset, count) = split_vus(total, local_n, i);
        if count == 0 {
            continue;
        }
        println!(
            "  {:?} --config runs/run_{}_worker_{}.toml --worker-id worker-{}  # vus {}..={}",
            worker_bin,
            run_id,
            i,
            i,
            offset + 1,
            offset + count
        );
    }
    println!();
}

/// Contiguous VU id range for one worker as `(offset, count)`.
fn split_vus(total: u64, workers: u32, worker_idx: u32) -> (u64, u64) {
    if workers == 0 {
        return (0, 0);
    }
    let base = total / workers as u64;
    let rem = total % workers as u64;
    let idx = worker_idx as u64;
    let count = if idx < rem { base + 1 } else { base };
    let offset = idx * base + idx.min(rem);
    (offset, count)
}

/// Config for one worker's slice, or `None` when the slice is empty.
fn worker_slice(base: &Config, workers: u32, worker_idx: u32) -> Option<Config> {
    let total = base.load.total_vus();
    let (offset, count) = split_vus(total, workers, worker_idx);
    if count == 0 {
        return None;
    }

    let mut cfg = base.clone();
    cfg.load.vus = count;
    cfg.load.vu_offset = offset;
    cfg.load.total = Some(total);
    cfg.worker.id = format!("worker-{worker_idx}");
    // gates and queue preconditions belong to the controller
    cfg.admin.manage_gates = false;
    cfg.admin.require_empty_queue = false;
    cfg.controller = None;
    Some(cfg)
}

/// Workers validate their config on load; checking here fails the run
/// before setup closes any gates.
fn validate_worker_slices(base: &Config, workers: u32) -> Result<()> {
    for i in 0..workers {
        if let Some(cfg) = worker_slice(base, workers, i) {
            cfg.validate()
                .with_context(|| format!("Invalid config for worker-{i}"))?;
        }
    }
    Ok(())
}

fn write_worker_config(
    base: &Config,
    workers: u32,
    worker_idx: u32,
    run_id: &str,
    burst_start_ms: i64,
) -> Result<Option<PathBuf>> {
    let Some(mut cfg) = worker_slice(base, workers, worker_idx) else {
        return Ok(None);
    };
    cfg.scenario.run_id = Some(run_id.to_string());
    cfg.scenario.burst_start_ms = Some(burst_start_ms);

    let out = PathBuf::from(format!("runs/run_{run_id}_worker_{worker_idx}.toml"));
    let s = toml::to_string_pretty(&cfg)?;
    std::fs::write(&out, s)?;
    Ok(Some(out))
}

fn infer_worker_binary() -> Result<PathBuf> {
    if let Ok(p) = std::env::var("WORKER_BIN") {
        return Ok(PathBuf::from(p));
    }

    let exe = std::env::current_exe()?;
    let exe_dir = exe
        .parent()
        .context("current_exe has no parent directory")?;

    let candidate = exe_dir.join("worker");
    if candidate.exists() {
        return Ok(candidate);
    }

    for p in ["target/release/worker", "target/debug/worker"] {
        let pb = PathBuf::from(p);
        if pb.exists() {
            return Ok(pb);
        }
    }

    anyhow::bail!("Could not find worker binary. Build it first (cargo build --bin worker).")
}

fn collect_worker_results(run_id: &str) -> Result<Vec<RunReport>> {
    let mut results = Vec::new();

    let results_dir = PathBuf::from("results");
    if !results_dir.exists() {
        return Ok(results);
    }

    for entry in std::fs::read_dir(&results_dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) != Some("json") {
            continue;
        }

        let name = match path.file_name().and_then(|s| s.to_str()) {
            Some(n) => n,
            None => continue,
        };

        if !name.starts_with("worker_") || !name.ends_with(&format!("_{run_id}.json")) {
            continue;
        }

        let report = RunReport::read_json(&path)
            .with_context(|| format!("Failed to parse {:?}", path))?;
        results.push(report);
    }

    results.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
    Ok(results)
}

fn merge_reports(run_id: &str, workers: Vec<RunReport>) -> RunReport {
    let (merged, rejected) = RunReport::merge(run_id, workers);
    for e in &rejected {
        warn!("Merged order record rejected: {e}");
    }
    merged
}

fn save_merged_report(merged: &RunReport) -> Result<()> {
    let output_path = format!("results/run_{}_merged.json", merged.run_id);
    let written = merged.write_json(&output_path)?;
    info!("Merged results written to {}", written.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_vus_covers_every_id_once() {
        let parts: Vec<_> = (0..3).map(|i| split_vus(10, 3, i)).collect();
        assert_eq!(parts, vec![(0, 4), (4, 3), (7, 3)]);
        assert_eq!(parts.iter().map(|p| p.1).sum::<u64>(), 10);
        assert_eq!(split_vus(2, 4, 3), (2, 0));
        assert_eq!(split_vus(5, 0, 0), (0, 0));
    }

    fn base_config(vus: u64, max_in_flight: u32) -> Config {
        Config::from_toml(&format!(
            r#"
[target]
base_url = "http://localhost:8080/api/v1"
max_in_flight = {max_in_flight}

[events]
ids = ["evt-a"]

[load]
vus = {vus}
"#
        ))
        .unwrap()
    }

    #[test]
    fn test_worker_slices_are_checked_against_the_per_process_cap() {
        // the whole population exceeds the cap, each slice does not
        let mut config = base_config(4, 4);
        config.load.vus = 10;
        config.load.total = Some(10);
        assert!(config.validate().is_err());
        assert!(validate_worker_slices(&config, 3).is_ok());

        let err = validate_worker_slices(&config, 2).unwrap_err();
        assert!(format!("{err:#}").contains("worker-0"));

        let slice = worker_slice(&config, 3, 2).unwrap();
        assert_eq!(slice.load.vu_ids(), 8..=10);
        assert!(!slice.admin.manage_gates);
        assert!(worker_slice(&base_config(2, 4), 4, 3).is_none());
    }
}
