//! External collaborators of the pipeline.
//!
//! - Upstream sources (`Source`, `HttpSource`)
//! - New-content notification sinks (`NotificationSink`, `LogNotifier`,
//!   `WebhookNotifier`)

mod notify;
mod sources;

pub use notify::{LogNotifier, NotificationSink, WebhookNotifier};
pub use sources::{HttpSource, Source, http_sources, parse_items};
