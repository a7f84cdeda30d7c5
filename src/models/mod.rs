// src/models/mod.rs

//! Domain models for feedhub.
//!
//! This module contains all data structures used throughout the application,
//! organized by their primary purpose.

mod config;
mod item;
mod run;

// Re-export all public types
pub use config::{
    BreakerConfig, CacheConfig, Config, CooldownPolicy, FeedConfig, FetchConfig, LoggingConfig,
    NotifyConfig, SchedulerConfig, SourceConfig, StorageConfig,
};
pub use item::{ContentItem, RawItem, RawTimestamp};
pub use run::{SourceResult, Trigger, UpdateRun};
