//! Feed document rendering.
//!
//! Renderers are pure: identical channel, items and `generated_at` always
//! produce identical bytes.

mod json;
mod rss;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::models::ContentItem;

/// Output format of a feed document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedFormat {
    /// RSS 2.0
    #[default]
    Rss,
    /// JSON Feed 1.1
    Json,
}

impl FeedFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rss => "rss",
            Self::Json => "json",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Rss => "application/rss+xml; charset=utf-8",
            Self::Json => "application/feed+json; charset=utf-8",
        }
    }
}

impl fmt::Display for FeedFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FeedFormat {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rss" | "xml" => Ok(Self::Rss),
            "json" | "jsonfeed" => Ok(Self::Json),
            other => Err(AppError::validation(format!("unknown feed format '{other}'"))),
        }
    }
}

/// A rendered feed. Cloning shares the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedDocument {
    pub format: FeedFormat,
    pub body: Arc<str>,
}

impl FeedDocument {
    pub fn new(format: FeedFormat, body: String) -> Self {
        Self {
            format,
            body: Arc::from(body),
        }
    }

    pub fn content_type(&self) -> &'static str {
        self.format.content_type()
    }

    pub fn as_str(&self) -> &str {
        &self.body
    }
}

/// Channel-level metadata of a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    pub title: String,
    /// Home page of the feed
    pub link: String,
    pub description: String,
    pub language: Option<String>,
}

/// Render `items` in the given format.
///
/// `generated_at` only appears in RSS (`lastBuildDate`).
pub fn render(
    format: FeedFormat,
    channel: &Channel,
    items: &[ContentItem],
    generated_at: DateTime<Utc>,
) -> Result<FeedDocument> {
    let body = match format {
        FeedFormat::Rss => rss::render(channel, items, generated_at)?,
        FeedFormat::Json => json::render(channel, items)?,
    };
    Ok(FeedDocument::new(format, body))
}
