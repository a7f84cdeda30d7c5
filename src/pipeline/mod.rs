//! Ingestion and serving pipeline.
//!
//! - `circuit_breaker`: per-source failure isolation
//! - `orchestrator`: one ingestion run over every source
//! - `scheduler`: timer and manual triggers, never two runs at once
//! - `feed`: cached feed document generation

pub mod circuit_breaker;
pub mod feed;
pub mod orchestrator;
pub mod scheduler;

pub use circuit_breaker::{BreakerSnapshot, BreakerState, CircuitBreaker};
pub use feed::{FeedGenerator, FeedRequest};
pub use orchestrator::UpdateOrchestrator;
pub use scheduler::{
    Scheduler, SchedulerPhase, SchedulerStatus, TriggerOutcome, UpdateRunner,
};
