use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::barrier::BarrierReport;
use crate::error::OrderError;
use crate::order::{OrderSnapshot, OrderTracker, SeverityClass, Violation};
use crate::stats::{Counter, StatsSnapshot, StatsSummary, Trend};

/// Derived figures, recomputed whenever a report is built or merged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportSummary {
    pub total_sessions: u64,
    pub successful_logins: u64,
    pub successful_promotions: u64,
    pub throughput_per_sec: f64,
    pub violation_count: u64,
    pub violations_by_class: BTreeMap<String, u64>,
    pub max_severity: u64,
    pub order_maintained: bool,
    pub stats: StatsSummary,
}

/// Result of one process (a worker, an in-process run) or of a merged run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub scenario: String,
    /// Producing worker; `None` for merged and in-process reports.
    pub worker_id: Option<String>,
    pub workers: Vec<String>,
    pub timestamp: String,
    pub stats: StatsSnapshot,
    pub order: OrderSnapshot,
    pub barrier: Option<BarrierReport>,
    /// Run-level failure, when there was one.
    pub error: Option<String>,
    pub summary: ReportSummary,
}

fn summarize(stats: &StatsSnapshot, order: &OrderSnapshot) -> ReportSummary {
    let promotions = stats.counter(Counter::Promotions);
    let throughput_per_sec = if stats.duration_ms > 0 {
        promotions as f64 * 1000.0 / stats.duration_ms as f64
    } else {
        0.0
    };

    let mut violations_by_class = BTreeMap::new();
    for v in &order.violations {
        let class = match v.class {
            SeverityClass::Minor => "minor",
            SeverityClass::Moderate => "moderate",
            SeverityClass::Severe => "severe",
        };
        *violations_by_class.entry(class.to_string()).or_insert(0) += 1;
    }

    ReportSummary {
        total_sessions: stats.counter(Counter::TotalSessions),
        successful_logins: stats.counter(Counter::SuccessfulLogins),
        successful_promotions: promotions,
        throughput_per_sec,
        violation_count: order.violations.len() as u64,
        violations_by_class,
        max_severity: order.violations.iter().map(|v| v.severity).max().unwrap_or(0),
        order_maintained: order.order_maintained(),
        stats: stats.summary(),
    }
}

impl RunReport {
    pub fn new(
        run_id: impl Into<String>,
        scenario: impl Into<String>,
        worker_id: Option<String>,
        mut stats: StatsSnapshot,
        order: OrderSnapshot,
    ) -> Self {
        // violations live in the order record; mirror them into the counter
        stats
            .counters
            .insert(Counter::OrderViolations, order.violations.len() as u64);
        let summary = summarize(&stats, &order);
        Self {
            run_id: run_id.into(),
            scenario: scenario.into(),
            workers: worker_id.iter().cloned().collect(),
            worker_id,
            timestamp: chrono::Utc::now().to_rfc3339(),
            stats,
            order,
            barrier: None,
            error: None,
            summary,
        }
    }

    pub fn with_barrier(mut self, barrier: Option<BarrierReport>) -> Self {
        self.barrier = barrier;
        self
    }

    pub fn with_error(mut self, error: Option<String>) -> Self {
        self.error = error;
        self
    }

    /// Combines worker reports: counters are summed, trend samples pooled
    /// and the order records replayed globally by wall-clock time.
    pub fn merge(run_id: &str, reports: Vec<RunReport>) -> (RunReport, Vec<OrderError>) {
        let scenario = reports
            .first()
            .map(|r| r.scenario.clone())
            .unwrap_or_default();
        let mut stats = StatsSnapshot::default();
        let mut entries = Vec::new();
        let mut promotions = Vec::new();
        let mut workers = Vec::new();
        let mut barrier = None;
        let mut error = None;

        for report in reports {
            stats.merge(&report.stats);
            entries.extend(report.order.entries);
            promotions.extend(report.order.promotions);
            workers.extend(report.workers);
            barrier = barrier.or(report.barrier);
            error = error.or(report.error);
        }

        let (order, rejected) = OrderTracker::replay(entries, promotions);
        let mut merged = RunReport::new(run_id, scenario, None, stats, order)
            .with_barrier(barrier)
            .with_error(error);
        merged.workers = workers;
        (merged, rejected)
    }

    pub fn violations(&self) -> &[Violation] {
        &self.order.violations
    }

    pub fn write_json(&self, path: impl AsRef<Path>) -> std::io::Result<PathBuf> {
        let path = path.as_ref();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(path.to_path_buf())
    }

    pub fn read_json(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// Violations beyond this many are summarized instead of listed.
const MAX_LISTED_VIOLATIONS: usize = 20;

pub fn print_summary(report: &RunReport) {
    let s = &report.summary;
    match &report.worker_id {
        Some(worker) => println!("\n=== Worker {} Summary (run_id={}) ===", worker, report.run_id),
        None => println!(
            "\n=== Run Summary ({} workers, run_id={}) ===",
            report.workers.len().max(1),
            report.run_id
        ),
    }
    println!("Scenario: {}", report.scenario);
    println!("Duration: {}ms", s.stats.duration_ms);
    println!("Total sessions: {}", s.total_sessions);
    println!("Successful logins: {}", s.successful_logins);
    println!("Successful promotions: {}", s.successful_promotions);
    println!("Throughput: {:.2} promotions/s", s.throughput_per_sec);

    println!("\nCounters:");
    for (counter, value) in &s.stats.counters {
        println!("  {:<22} {}", counter.name(), value);
    }

    println!("\nTrends (ms):");
    for trend in Trend::ALL {
        if let Some(t) = s.stats.trends.get(&trend) {
            println!(
                "  {:<20} n={} p50={} p90={} p95={} p99={} max={}",
                trend.name(),
                t.count,
                t.p50_ms,
                t.p90_ms,
                t.p95_ms,
                t.p99_ms,
                t.max_ms
            );
        }
    }

    if let Some(barrier) = &report.barrier {
        println!(
            "\nBarrier: {:?} ready={}/{} waited={}ms",
            barrier.phase, barrier.ready, barrier.target, barrier.waited_ms
        );
    }

    println!("\nOrdering:");
    println!("  entries: {}", report.order.entries.len());
    println!("  promotions: {}", report.order.promotions.len());
    println!("  order maintained: {}", s.order_maintained);
    println!("  violations: {} (max severity {})", s.violation_count, s.max_severity);
    for (class, n) in &s.violations_by_class {
        println!("    {class}: {n}");
    }
    for v in report.order.violations.iter().take(MAX_LISTED_VIOLATIONS) {
        println!(
            "    session {} expected #{} actual #{} severity {}",
            v.session_id, v.expected_position, v.actual_position, v.severity
        );
    }
    if report.order.violations.len() > MAX_LISTED_VIOLATIONS {
        println!(
            "    ... {} more",
            report.order.violations.len() - MAX_LISTED_VIOLATIONS
        );
    }

    if let Some(error) = &report.error {
        println!("\nRun error: {error}");
    }
    println!();
}
