pub mod admin;
pub mod barrier;
pub mod client;
pub mod config;
pub mod detector;
pub mod driver;
pub mod error;
pub mod lifecycle;
pub mod order;
pub mod ramp;
pub mod report;
pub mod retry;
pub mod session;
pub mod sse;
pub mod stats;
pub mod store;

pub use admin::{AdminClient, GateOpener, GateStatus};
pub use barrier::{BarrierCoordinator, BarrierPhase, BarrierReport};
pub use client::SessionClient;
pub use config::*;
pub use driver::{generate_run_id, AbortHandle, Execution, LoadDriver};
pub use error::*;
pub use order::{OrderRecord, OrderSnapshot, OrderTracker, SeverityClass, Violation};
pub use ramp::*;
pub use report::{print_summary, RunReport};
pub use retry::{Backoff, RetryPolicy};
pub use stats::*;
pub use store::{open_store, CoordinationStore, MemoryStore, RedisStore, RigKeys};
