// src/lib.rs

//! feedhub: pulls upstream content, deduplicates it, and serves generated feeds.

pub mod app;
pub mod error;
pub mod metrics;
pub mod models;
pub mod pipeline;
pub mod render;
pub mod services;
pub mod storage;
pub mod utils;

pub use app::{FeedService, ServiceStatus};
