//! Cherry task orchestration engine.
//!
//! A dependency-aware task graph, a concurrent bounded-worker scheduler,
//! retry/backoff policies, and a fallback-executor recovery mechanism with
//! error-rate monitoring. The engine treats task payloads as opaque and
//! routes them to pluggable [`Executor`] implementations by capability
//! matching; the concrete agents, persistence backends, and front ends
//! live outside this crate.

#![warn(missing_docs)]

pub mod executor;
pub mod graph;
pub mod metrics;
pub mod monitor;
pub mod recovery;
pub mod registry;
pub mod retry;
pub mod scheduler;

pub use executor::{ErrorKind, ExecutionContext, ExecutionError, Executor};
pub use graph::{GraphError, TaskGraph};
pub use metrics::MetricsCollector;
pub use monitor::{ErrorMonitor, ErrorRecord};
pub use recovery::{RecoveryDecision, RecoveryManager};
pub use registry::{ExecutorRegistry, NoCapableExecutor, RegistryError, Resolved};
pub use retry::RetryPolicy;
pub use scheduler::{
    HealthReport, HealthStatus, RunSummary, Scheduler, SchedulerConfig, SchedulerError,
};
