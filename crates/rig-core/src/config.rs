use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::ConfigError;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub scenario: ScenarioConfig,
    pub target: TargetConfig,
    #[serde(default)]
    pub endpoints: EndpointConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    pub events: EventsConfig,
    pub load: LoadConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub promotion: PromotionConfig,
    #[serde(default)]
    pub barrier: BarrierConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub controller: Option<ControllerConfig>,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings that would make a run meaningless before any
    /// network traffic happens.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.target.base_url.trim().is_empty() {
            return invalid("target.base_url is required".into());
        }
        if self.events.ids.is_empty() {
            return invalid("events.ids must list at least one event id".into());
        }
        if self.events.ids.iter().any(|id| id.trim().is_empty()) {
            return invalid("events.ids must not contain empty ids".into());
        }
        if self.load.vus == 0 {
            return invalid("load.vus must be greater than zero".into());
        }
        if self.load.vu_offset + self.load.vus > self.load.total_vus() {
            return invalid(format!(
                "load.vu_offset ({}) + load.vus ({}) exceeds load.total_vus ({})",
                self.load.vu_offset,
                self.load.vus,
                self.load.total_vus()
            ));
        }
        if self.load.shape == LoadShapeKind::Staged && self.load.stages.is_empty() {
            return invalid("load.stages is required for the staged shape".into());
        }
        if self.load.shape == LoadShapeKind::Batched && self.load.batch_size == 0 {
            return invalid("load.batch_size must be greater than zero".into());
        }
        if self.promotion.max_poll_after_ms > 0
            && self.promotion.min_poll_after_ms > self.promotion.max_poll_after_ms
        {
            return invalid(format!(
                "promotion.min_poll_after_ms ({}) exceeds promotion.max_poll_after_ms ({})",
                self.promotion.min_poll_after_ms, self.promotion.max_poll_after_ms
            ));
        }
        if self.promotion.promoted_statuses.is_empty() {
            return invalid("promotion.promoted_statuses must not be empty".into());
        }
        // held permits keep sessions past the cap from ever reaching the barrier
        if self.barrier.enabled
            && self.promotion.wait_for_promotion
            && u64::from(self.target.max_in_flight) < self.load.vus
        {
            return invalid(format!(
                "target.max_in_flight ({}) must be at least load.vus ({}) when the barrier waits for promotion",
                self.target.max_in_flight, self.load.vus
            ));
        }
        if self.store.backend == StoreBackend::Redis && self.store.url.is_none() {
            return invalid("store.url is required for the redis backend".into());
        }
        if self.auth.email_template.is_empty() || !self.auth.email_template.contains("{id}") {
            return invalid("auth.email_template must contain an {id} placeholder".into());
        }
        Ok(())
    }

    pub fn broker_base_url(&self) -> &str {
        self.target
            .broker_base_url
            .as_deref()
            .unwrap_or(&self.target.base_url)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioConfig {
    #[serde(default = "default_scenario_name")]
    pub name: String,
    /// Fixed run id; generated from the clock when absent.
    #[serde(default)]
    pub run_id: Option<String>,
    /// Delay between setup finishing and the first VU starting.
    #[serde(default = "default_burst_offset_ms")]
    pub burst_offset_ms: u64,
    /// Absolute burst start (epoch ms); the controller pins this for workers.
    #[serde(default)]
    pub burst_start_ms: Option<i64>,
    #[serde(default = "default_print_every_ms")]
    pub print_every_ms: u64,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            name: default_scenario_name(),
            run_id: None,
            burst_offset_ms: default_burst_offset_ms(),
            burst_start_ms: None,
            print_every_ms: default_print_every_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// API gateway base URL, e.g. `http://localhost:8080/api/v1`.
    pub base_url: String,
    /// Queue broker base URL when it is not reached through the gateway.
    #[serde(default)]
    pub broker_base_url: Option<String>,
    #[serde(default = "default_login_timeout_ms")]
    pub login_timeout_ms: u64,
    #[serde(default = "default_join_timeout_ms")]
    pub join_timeout_ms: u64,
    #[serde(default = "default_status_timeout_ms")]
    pub status_timeout_ms: u64,
    #[serde(default = "default_disconnect_timeout_ms")]
    pub disconnect_timeout_ms: u64,
    /// Maximum concurrently running virtual users in this process.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: u32,
}

/// Request paths relative to the base URLs. `{eventId}` is substituted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub login: String,
    pub poll_join: String,
    pub poll_status: String,
    pub poll_disconnect: String,
    pub stream_join: String,
    pub stream_disconnect: String,
    pub event_status: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            login: "/auth/login".into(),
            poll_join: "/broker/polling/events/{eventId}/waiting".into(),
            poll_status: "/broker/polling/events/{eventId}/current".into(),
            poll_disconnect: "/broker/polling/events/{eventId}/waiting".into(),
            stream_join: "/broker/events/{eventId}/tickets/waiting".into(),
            stream_disconnect: "/broker/events/{eventId}/tickets/disconnect".into(),
            event_status: "/events/{eventId}".into(),
        }
    }
}

impl EndpointConfig {
    pub fn resolve(template: &str, event_id: &str) -> String {
        template.replace("{eventId}", event_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Login e-mail for a virtual user; `{id}` is replaced by the VU id.
    pub email_template: String,
    pub password: String,
    pub admin_email: String,
    pub admin_password: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            email_template: "user{id}@example.com".into(),
            password: "password123".into(),
            admin_email: "admin@example.com".into(),
            admin_password: "password123".into(),
        }
    }
}

impl AuthConfig {
    pub fn email_for(&self, vu_id: u64) -> String {
        self.email_template.replace("{id}", &vu_id.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    pub ids: Vec<String>,
}

impl EventsConfig {
    /// Event a virtual user is assigned to: `(id - 1) mod len(events)`.
    pub fn event_for(&self, vu_id: u64) -> &str {
        let idx = (vu_id.max(1) - 1) as usize % self.ids.len().max(1);
        self.ids.get(idx).map(String::as_str).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoadShapeKind {
    /// Every VU starts at the burst start.
    #[default]
    Fixed,
    /// VUs start in batches separated by a fixed interval.
    Batched,
    /// VU count follows a piecewise-linear curve over time.
    Staged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EntryPolicy {
    /// Entry append and join call happen one session at a time.
    #[default]
    Serialized,
    /// Entry order is the issuance order under full concurrency.
    Concurrent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    pub duration_ms: u64,
    /// Target number of started VUs at the end of the stage.
    pub target: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadConfig {
    #[serde(default)]
    pub shape: LoadShapeKind,
    /// VUs run by this process.
    pub vus: u64,
    /// Offset of this process's first VU id (ids are `vu_offset + 1 ..= vu_offset + vus`).
    #[serde(default)]
    pub vu_offset: u64,
    /// VUs across all processes; defaults to `vus`.
    #[serde(default)]
    pub total: Option<u64>,
    #[serde(default = "default_batch_size")]
    pub batch_size: u64,
    #[serde(default = "default_batch_interval_ms")]
    pub batch_interval_ms: u64,
    #[serde(default)]
    pub jitter_ms: u64,
    #[serde(default)]
    pub stages: Vec<Stage>,
    #[serde(default)]
    pub entry_policy: EntryPolicy,
}

impl LoadConfig {
    pub fn total_vus(&self) -> u64 {
        self.total.unwrap_or(self.vus)
    }

    pub fn vu_ids(&self) -> std::ops::RangeInclusive<u64> {
        (self.vu_offset + 1)..=(self.vu_offset + self.vus)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub login: RetryPolicy,
    pub join: RetryPolicy,
    pub admin: RetryPolicy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            login: RetryPolicy::fixed(10, 0),
            join: RetryPolicy::exponential(3, 200, 2_000),
            admin: RetryPolicy::exponential(5, 500, 5_000),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PromotionMode {
    #[default]
    Poll,
    Stream,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PromotionConfig {
    pub mode: PromotionMode,
    /// When false, sessions complete right after joining (join throughput only).
    pub wait_for_promotion: bool,
    /// Hard wall-clock budget for one session's promotion wait.
    pub max_wait_ms: u64,
    pub min_poll_after_ms: u64,
    /// Upper clamp for server poll hints; 0 disables the upper clamp.
    pub max_poll_after_ms: u64,
    /// Poll-mode state that means "promoted".
    pub poll_promoted_state: String,
    /// Stream-mode `status` values that mean "promoted".
    pub promoted_statuses: Vec<String>,
}

impl Default for PromotionConfig {
    fn default() -> Self {
        Self {
            mode: PromotionMode::Poll,
            wait_for_promotion: true,
            max_wait_ms: 120_000,
            min_poll_after_ms: 200,
            max_poll_after_ms: 5_000,
            poll_promoted_state: "ENTRY".into(),
            promoted_statuses: vec!["IN_ENTRY".into()],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QuorumSource {
    /// Counter incremented by each session after a successful join.
    #[default]
    ReadyCounter,
    /// Sum of the service's waiting-queue sizes across all events.
    WaitingQueue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BarrierConfig {
    pub enabled: bool,
    pub timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub quorum: QuorumSource,
    /// Quorum target; defaults to the total VU count.
    pub target: Option<u64>,
    /// Publish the gate-open timestamp so sessions can time open→promote.
    pub write_open_at: bool,
    pub key_ttl_secs: u64,
}

impl Default for BarrierConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_ms: 300_000,
            poll_interval_ms: 200,
            quorum: QuorumSource::ReadyCounter,
            target: None,
            write_open_at: true,
            key_ttl_secs: 3_600,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub url: Option<String>,
    /// Prefix of the service's waiting sorted sets (`WAITING:{eventId}`).
    pub waiting_key_prefix: String,
    /// Prefix of the service's waiting user-id hashes.
    pub waiting_user_ids_prefix: String,
    /// Namespace for keys written by the rig itself.
    pub rig_key_prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            url: None,
            waiting_key_prefix: "WAITING:".into(),
            waiting_user_ids_prefix: "WAITING_USER_IDS:".into(),
            rig_key_prefix: "RIG".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Close gates during setup, open them at release and again at teardown.
    pub manage_gates: bool,
    /// Fail setup when a waiting queue still holds entries.
    pub require_empty_queue: bool,
    /// Pause between status changes during setup/teardown.
    pub status_change_pause_ms: u64,
    /// Pause between status changes during release.
    pub release_pause_ms: u64,
    /// How long in-flight sessions may keep running after an abort.
    pub abort_grace_ms: u64,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            manage_gates: true,
            require_empty_queue: true,
            status_change_pause_ms: 500,
            release_pause_ms: 50,
            abort_grace_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Worker identifier for logs and result files
    pub id: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            id: "worker-0".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Number of local workers to spawn (for local testing)
    pub local_workers: Option<u32>,
    /// Worker binary path; inferred from the controller location when absent.
    pub worker_bin: Option<String>,
}

fn default_scenario_name() -> String {
    "queue-order".into()
}
fn default_burst_offset_ms() -> u64 {
    3_000
}
fn default_print_every_ms() -> u64 {
    2_000
}
fn default_login_timeout_ms() -> u64 {
    10_000
}
fn default_join_timeout_ms() -> u64 {
    10_000
}
fn default_status_timeout_ms() -> u64 {
    5_000
}
fn default_disconnect_timeout_ms() -> u64 {
    2_000
}
fn default_max_in_flight() -> u32 {
    10_000
}
fn default_batch_size() -> u64 {
    100
}
fn default_batch_interval_ms() -> u64 {
    1_000
}
