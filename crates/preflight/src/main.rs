use anyhow::{Context, Result};
use clap::Parser;
use rig_core::admin::ensure_queues_empty;
use rig_core::{open_store, AdminClient, Config, RigKeys};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "preflight")]
#[command(about = "Preflight checks for ticket queue load runs (URLs, store, queues, admin login)")]
struct Args {
    /// Path to configuration file
    #[arg(long, default_value = "config/example.local.toml")]
    config: PathBuf,

    /// Skip the admin login check
    #[arg(long)]
    skip_admin: bool,
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
    let cfg = Config::from_file(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    info!("Validating target URLs...");
    let mut base_urls = vec![validate_base_url(&cfg.target.base_url)
        .with_context(|| format!("Invalid target.base_url: {}", cfg.target.base_url))?];
    if let Some(broker) = &cfg.target.broker_base_url {
        base_urls.push(
            validate_base_url(broker)
                .with_context(|| format!("Invalid target.broker_base_url: {broker}"))?,
        );
    }

    println!();
    println!("=== Preflight ({} endpoints, {} events) ===", base_urls.len(), cfg.events.ids.len());

    let client = reqwest::Client::builder()
        .timeout(Duration::from_millis(cfg.target.status_timeout_ms.max(1)))
        .build()
        .context("Failed to build HTTP client")?;

    let mut failures = 0u64;
    for base in &base_urls {
        println!();
        println!("Endpoint: {}", base.as_str().trim_end_matches('/'));
        check_reachable_best_effort(&client, base).await;
    }

    println!();
    match open_store(&cfg.store).await {
        Ok(store) => {
            println!("Store: {} -> OK", store.name());
            let keys = RigKeys::new(&cfg.store, "preflight");
            match ensure_queues_empty(store.as_ref(), &keys, &cfg.events.ids).await {
                Ok(()) => println!("Waiting queues: empty"),
                Err(e) if cfg.admin.require_empty_queue => {
                    println!("Waiting queues: NOT EMPTY");
                    warn!("{e}");
                    failures = failures.saturating_add(1);
                }
                Err(e) => warn!("Waiting queues not empty (not required): {e}"),
            }
        }
        Err(e) => {
            println!("Store: {:?} -> ERROR", cfg.store.backend);
            warn!("Store unreachable: {e}");
            failures = failures.saturating_add(1);
        }
    }

    if cfg.admin.manage_gates && !args.skip_admin {
        let start = Instant::now();
        let admin = AdminClient::new(&cfg).context("Failed to build admin client")?;
        match admin.login().await {
            Ok(()) => println!(
                "Admin login: OK ({}ms)",
                start.elapsed().as_millis() as u64
            ),
            Err(e) => {
                println!("Admin login: ERROR ({}ms)", start.elapsed().as_millis() as u64);
                warn!("{e}");
                failures = failures.saturating_add(1);
            }
        }
    }

    if failures > 0 {
        anyhow::bail!("Preflight failed: {failures} required check(s) failed");
    }

    println!();
    println!("Preflight OK.");
    Ok(())
}

fn validate_base_url(raw: &str) -> Result<url::Url> {
    let url = url::Url::parse(raw).with_context(|| format!("Invalid URL: {raw}"))?;

    if url.scheme() != "http" && url.scheme() != "https" {
        anyhow::bail!("Base URL must be http:// or https:// (got {raw})");
    }
    if !url.username().is_empty() || url.password().is_some() {
        anyhow::bail!("Base URL must not include credentials (got {raw})");
    }
    url.host_str().context("Base URL must include a hostname")?;
    if url.query().is_some() || url.fragment().is_some() {
        anyhow::bail!("Base URL must not include query/fragment (got {raw})");
    }

    Ok(url)
}

/// Any HTTP response counts as reachable; only transport errors warn.
async fn check_reachable_best_effort(client: &reqwest::Client, base: &url::Url) {
    const SLOW_WARN_MS: u64 = 1_000;

    let start = Instant::now();
    let resp = client.get(base.clone()).send().await;
    let latency_ms = start.elapsed().as_millis() as u64;

    match resp {
        Ok(r) => {
            println!("GET {:<30} -> {} ({}ms)", base.path(), r.status().as_u16(), latency_ms);
            if latency_ms > SLOW_WARN_MS {
                warn!(
                    "Endpoint is slow: {}ms (threshold {}ms)",
                    latency_ms, SLOW_WARN_MS
                );
            }
        }
        Err(e) => {
            println!("GET {:<30} -> ERROR ({}ms)", base.path(), latency_ms);
            warn!("Endpoint request failed (best-effort): {}", e);
        }
    }
}
