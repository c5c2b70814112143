use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Monotonic run counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Counter {
    TotalSessions,
    SuccessfulLogins,
    LoginFailures,
    LoginFinalFailures,
    QueueJoins,
    QueueJoinFailures,
    PollingRequests,
    PollingFailures,
    Promotions,
    EntryTokens,
    PromotionTimeouts,
    ConnectionFailures,
    DisconnectFailures,
    OrderViolations,
    Retired,
}

impl Counter {
    pub const ALL: [Counter; 15] = [
        Counter::TotalSessions,
        Counter::SuccessfulLogins,
        Counter::LoginFailures,
        Counter::LoginFinalFailures,
        Counter::QueueJoins,
        Counter::QueueJoinFailures,
        Counter::PollingRequests,
        Counter::PollingFailures,
        Counter::Promotions,
        Counter::EntryTokens,
        Counter::PromotionTimeouts,
        Counter::ConnectionFailures,
        Counter::DisconnectFailures,
        Counter::OrderViolations,
        Counter::Retired,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Counter::TotalSessions => "total_sessions",
            Counter::SuccessfulLogins => "successful_logins",
            Counter::LoginFailures => "login_failures",
            Counter::LoginFinalFailures => "login_final_failures",
            Counter::QueueJoins => "queue_joins",
            Counter::QueueJoinFailures => "queue_join_failures",
            Counter::PollingRequests => "polling_requests",
            Counter::PollingFailures => "polling_failures",
            Counter::Promotions => "promotions",
            Counter::EntryTokens => "entry_tokens",
            Counter::PromotionTimeouts => "promotion_timeouts",
            Counter::ConnectionFailures => "connection_failures",
            Counter::DisconnectFailures => "disconnect_failures",
            Counter::OrderViolations => "order_violations",
            Counter::Retired => "retired",
        }
    }
}

/// Timing distributions, all in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Login,
    QueueJoin,
    StatusFetch,
    PromotionWait,
    OpenToPromote,
    BarrierWait,
    StartDelay,
}

impl Trend {
    pub const ALL: [Trend; 7] = [
        Trend::Login,
        Trend::QueueJoin,
        Trend::StatusFetch,
        Trend::PromotionWait,
        Trend::OpenToPromote,
        Trend::BarrierWait,
        Trend::StartDelay,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Trend::Login => "login_ms",
            Trend::QueueJoin => "queue_join_ms",
            Trend::StatusFetch => "status_fetch_ms",
            Trend::PromotionWait => "promotion_wait_ms",
            Trend::OpenToPromote => "open_to_promote_ms",
            Trend::BarrierWait => "barrier_wait_ms",
            Trend::StartDelay => "start_delay_ms",
        }
    }
}

/// One observation fed into a trend.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub name: Trend,
    pub value_ms: u64,
    /// Wall-clock epoch ms.
    pub at_ms: i64,
}

impl MetricSample {
    pub fn now(name: Trend, value: Duration) -> Self {
        Self {
            name,
            value_ms: value.as_millis() as u64,
            at_ms: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Raw counters and trend samples. Serialized into worker results so the
/// controller can merge exact percentiles across processes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub counters: BTreeMap<Counter, u64>,
    pub samples: BTreeMap<Trend, Vec<u64>>,
    pub duration_ms: u64,
}

impl StatsSnapshot {
    pub fn counter(&self, counter: Counter) -> u64 {
        self.counters.get(&counter).copied().unwrap_or(0)
    }

    pub fn merge(&mut self, other: &StatsSnapshot) {
        for (counter, value) in &other.counters {
            *self.counters.entry(*counter).or_default() += value;
        }
        for (trend, values) in &other.samples {
            self.samples.entry(*trend).or_default().extend_from_slice(values);
        }
        self.duration_ms = self.duration_ms.max(other.duration_ms);
    }

    pub fn summary(&self) -> StatsSummary {
        let mut counters = BTreeMap::new();
        for counter in Counter::ALL {
            counters.insert(counter, self.counter(counter));
        }
        let trends = self
            .samples
            .iter()
            .filter(|(_, values)| !values.is_empty())
            .map(|(trend, values)| (*trend, TrendSummary::from_samples(values)))
            .collect();
        StatsSummary {
            counters,
            trends,
            duration_ms: self.duration_ms,
        }
    }
}

/// Shared counters and trends for one process.
#[derive(Debug)]
pub struct StatsCollector {
    inner: Mutex<StatsSnapshot>,
    start_time: Instant,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StatsSnapshot::default()),
            start_time: Instant::now(),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut StatsSnapshot) -> R) -> R {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    pub fn incr(&self, counter: Counter) {
        self.add(counter, 1);
    }

    pub fn add(&self, counter: Counter, n: u64) {
        self.with(|s| *s.counters.entry(counter).or_default() += n);
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.with(|s| s.counter(counter))
    }

    pub fn record(&self, sample: MetricSample) {
        self.with(|s| s.samples.entry(sample.name).or_default().push(sample.value_ms));
    }

    pub fn observe(&self, trend: Trend, value: Duration) {
        self.record(MetricSample::now(trend, value));
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start_time.elapsed().as_millis() as u64
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let elapsed = self.elapsed_ms();
        self.with(|s| {
            let mut snapshot = s.clone();
            snapshot.duration_ms = elapsed;
            snapshot
        })
    }

    pub fn summary(&self) -> StatsSummary {
        self.snapshot().summary()
    }
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Nearest-rank percentile over sorted samples.
pub fn percentile_of(sorted: &[u64], p: u64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let p = p.min(100) as usize;
    let rank = (p * sorted.len()).div_ceil(100).max(1);
    sorted[rank - 1]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendSummary {
    pub count: u64,
    pub min_ms: u64,
    pub max_ms: u64,
    pub avg_ms: f64,
    pub p50_ms: u64,
    pub p90_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
}

impl TrendSummary {
    pub fn from_samples(samples: &[u64]) -> Self {
        let mut sorted = samples.to_vec();
        sorted.sort_unstable();
        let count = sorted.len() as u64;
        let sum: u64 = sorted.iter().sum();
        Self {
            count,
            min_ms: sorted.first().copied().unwrap_or(0),
            max_ms: sorted.last().copied().unwrap_or(0),
            avg_ms: if count == 0 { 0.0 } else { sum as f64 / count as f64 },
            p50_ms: percentile_of(&sorted, 50),
            p90_ms: percentile_of(&sorted, 90),
            p95_ms: percentile_of(&sorted, 95),
            p99_ms: percentile_of(&sorted, 99),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSummary {
    pub counters: BTreeMap<Counter, u64>,
    pub trends: BTreeMap<Trend, TrendSummary>,
    pub duration_ms: u64,
}

impl StatsSummary {
    pub fn counter(&self, counter: Counter) -> u64 {
        self.counters.get(&counter).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_collector_basic() {
        let stats = StatsCollector::new();

        stats.add(Counter::TotalSessions, 100);
        stats.incr(Counter::SuccessfulLogins);
        stats.incr(Counter::SuccessfulLogins);

        assert_eq!(stats.get(Counter::TotalSessions), 100);
        assert_eq!(stats.get(Counter::SuccessfulLogins), 2);
        assert_eq!(stats.get(Counter::Promotions), 0);

        let summary = stats.summary();
        assert_eq!(summary.counters.len(), Counter::ALL.len());
        assert_eq!(summary.counter(Counter::TotalSessions), 100);
    }

    #[test]
    fn test_percentile_calculation() {
        let stats = StatsCollector::new();

        for _ in 0..50 {
            stats.observe(Trend::Login, Duration::from_millis(10));
        }
        for _ in 0..30 {
            stats.observe(Trend::Login, Duration::from_millis(20));
        }
        for _ in 0..20 {
            stats.observe(Trend::Login, Duration::from_millis(50));
        }

        let snapshot = stats.snapshot();
        let mut login = snapshot.samples[&Trend::Login].clone();
        login.sort_unstable();
        assert_eq!(percentile_of(&login, 50), 10);
        assert_eq!(percentile_of(&login, 80), 20);
        assert_eq!(percentile_of(&login, 95), 50);
        assert!(!snapshot.samples.contains_key(&Trend::QueueJoin));
        assert_eq!(percentile_of(&[], 95), 0);
    }

    #[test]
    fn test_trend_summary() {
        let samples: Vec<u64> = (1..=100).collect();
        let summary = TrendSummary::from_samples(&samples);
        assert_eq!(summary.count, 100);
        assert_eq!(summary.min_ms, 1);
        assert_eq!(summary.max_ms, 100);
        assert_eq!(summary.p50_ms, 50);
        assert_eq!(summary.p90_ms, 90);
        assert_eq!(summary.p99_ms, 99);
        assert!((summary.avg_ms - 50.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_snapshots_merge() {
        let a = StatsCollector::new();
        a.add(Counter::Promotions, 3);
        a.observe(Trend::PromotionWait, Duration::from_millis(100));
        let b = StatsCollector::new();
        b.add(Counter::Promotions, 2);
        b.observe(Trend::PromotionWait, Duration::from_millis(300));

        let mut merged = a.snapshot();
        merged.merge(&b.snapshot());
        assert_eq!(merged.counter(Counter::Promotions), 5);
        assert_eq!(merged.samples[&Trend::PromotionWait].len(), 2);

        let json = serde_json::to_string(&merged).unwrap();
        let back: StatsSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back.counter(Counter::Promotions), 5);
    }
}
