//! # Event Pipeline Service
//!
//! Real-time update-event pipeline for the TrustScore platform:
//! - Source adapters (fraud webhook, social and market pollers, chain stream)
//!   that normalize heterogeneous payloads into a uniform event model
//! - Classification, prioritization and probabilistic routing with
//!   per-entity cooldowns
//! - Multi-topic bounded queues with deduplication, conflation, partitioned
//!   drain workers, retry backoff and a dead-letter topic
//! - Handler dispatch with wildcard registrations and sync/async fan-out
//! - A monitoring and capacity control plane: threshold alerts, anomaly and
//!   trend detection, auto-scaling, load shedding and scheduled changes

pub mod adapters;
pub mod capacity;
pub mod classifier;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod monitor;
pub mod pipeline;
pub mod prioritizer;
pub mod queue;
pub mod recovery;
pub mod routing;
pub mod server;
pub mod signals;
pub mod types;

pub use config::Config;
pub use error::{ErrorCategory, ErrorSeverity, PipelineError, Result};
pub use pipeline::{EventPipeline, ManualIntervention, ProcessOutcome, SystemStatusReport};
pub use server::EventPipelineService;
pub use signals::{PipelineSignal, SignalBus};
pub use types::*;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const SERVICE_NAME: &str = "event-pipeline-service";
