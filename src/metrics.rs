//! Metric series emitted through the `metrics` facade.
//!
//! No recorder is installed by the library; embedders choose one.

use std::sync::OnceLock;

use metrics::{counter, describe_counter, describe_gauge, gauge};

/// Register descriptions once so every series shows up with help text.
pub fn ensure_described() {
    static ONCE: OnceLock<()> = OnceLock::new();
    ONCE.get_or_init(|| {
        describe_counter!(
            "feedhub_fetch_attempts_total",
            "Upstream fetches attempted, per source."
        );
        describe_counter!(
            "feedhub_fetch_success_total",
            "Upstream fetches that were stored successfully, per source."
        );
        describe_counter!(
            "feedhub_fetch_failures_total",
            "Upstream fetches that failed or were short-circuited, per source."
        );
        describe_counter!(
            "feedhub_items_new_total",
            "Items stored for the first time, per source."
        );
        describe_counter!(
            "feedhub_items_skipped_total",
            "Malformed upstream items dropped before storage, per source."
        );
        describe_gauge!(
            "feedhub_last_success_timestamp",
            "Unix time of the last successful fetch, per source."
        );
        describe_counter!("feedhub_cache_hits_total", "Cache hits, per tier.");
        describe_counter!("feedhub_cache_misses_total", "Cache misses, per tier.");
        describe_counter!(
            "feedhub_breaker_transitions_total",
            "Circuit breaker state changes, per source and target state."
        );
        describe_counter!(
            "feedhub_breaker_rejections_total",
            "Calls short-circuited by an open breaker, per source."
        );
        describe_counter!("feedhub_runs_total", "Completed ingestion runs.");
    });
}

pub(crate) fn record_fetch_attempt(source_id: &str) {
    counter!("feedhub_fetch_attempts_total", "source" => source_id.to_string()).increment(1);
}

pub(crate) fn record_fetch_success(source_id: &str, new_items: usize, skipped: usize) {
    let source = source_id.to_string();
    counter!("feedhub_fetch_success_total", "source" => source.clone()).increment(1);
    counter!("feedhub_items_new_total", "source" => source.clone()).increment(new_items as u64);
    counter!("feedhub_items_skipped_total", "source" => source.clone()).increment(skipped as u64);
    gauge!("feedhub_last_success_timestamp", "source" => source)
        .set(chrono::Utc::now().timestamp() as f64);
}

pub(crate) fn record_fetch_failure(source_id: &str) {
    counter!("feedhub_fetch_failures_total", "source" => source_id.to_string()).increment(1);
}

pub(crate) fn record_run() {
    counter!("feedhub_runs_total").increment(1);
}
