//! Content item data structures and normalization of raw upstream items.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

use crate::error::{AppError, Result};
use crate::utils::{normalize_whitespace, resolve_url};

/// One ingested unit, unique by `(source_id, guid)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContentItem {
    /// Upstream feed/locale the item came from
    pub source_id: String,

    /// Identifier assigned by the upstream, unique within the source
    pub guid: String,

    pub title: String,

    /// Absolute URL of the item
    pub link: String,

    /// Upstream-supplied publication time
    pub published_at: DateTime<Utc>,

    pub summary: String,

    /// Ordered, de-duplicated categories
    #[serde(default)]
    pub categories: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

impl ContentItem {
    /// SHA-256 over every field that ends up in a rendered feed.
    ///
    /// Two ingestions of the same guid with equal fingerprints are treated as
    /// unchanged.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for part in [
            self.title.as_str(),
            self.link.as_str(),
            self.summary.as_str(),
            self.image_url.as_deref().unwrap_or(""),
        ] {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        hasher.update(self.published_at.timestamp_millis().to_be_bytes());
        for category in &self.categories {
            hasher.update(category.as_bytes());
            hasher.update([0x1f]);
        }
        hex::encode(hasher.finalize())
    }
}

/// Upstream timestamp as it arrives on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum RawTimestamp {
    /// Unix seconds
    Unix(i64),
    /// RFC 3339 or RFC 2822 text
    Text(String),
}

impl RawTimestamp {
    /// Parse into UTC, returning None for anything unrecognised.
    pub fn parse(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Unix(secs) => Utc.timestamp_opt(*secs, 0).single(),
            Self::Text(text) => {
                let text = text.trim();
                DateTime::parse_from_rfc3339(text)
                    .or_else(|_| DateTime::parse_from_rfc2822(text))
                    .map(|dt| dt.with_timezone(&Utc))
                    .ok()
            }
        }
    }
}

/// Item as returned by a source, before validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RawItem {
    #[serde(default, alias = "id")]
    pub guid: Option<String>,

    #[serde(default)]
    pub title: Option<String>,

    #[serde(default, alias = "url")]
    pub link: Option<String>,

    #[serde(
        default,
        alias = "date_published",
        alias = "pubDate",
        alias = "published"
    )]
    pub published_at: Option<RawTimestamp>,

    #[serde(default, alias = "description", alias = "content_text")]
    pub summary: Option<String>,

    #[serde(default, alias = "tags")]
    pub categories: Vec<String>,

    #[serde(default, alias = "image")]
    pub image_url: Option<String>,
}

impl RawItem {
    /// Validate and normalize into a [`ContentItem`].
    ///
    /// Relative links are resolved against `base` when given; a link that is
    /// still not absolute afterwards makes the item malformed.
    pub fn normalize(self, source_id: &str, base: Option<&Url>) -> Result<ContentItem> {
        let title = non_empty(self.title.as_deref())
            .ok_or_else(|| AppError::validation("item has no title"))?;

        let raw_link = self
            .link
            .as_deref()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .ok_or_else(|| AppError::validation(format!("item '{title}' has no link")))?;
        let link = absolutize(raw_link, base)
            .ok_or_else(|| AppError::validation(format!("item '{title}' has a relative link")))?;

        let guid = non_empty(self.guid.as_deref()).unwrap_or_else(|| link.clone());

        let published_at = self
            .published_at
            .as_ref()
            .and_then(RawTimestamp::parse)
            .ok_or_else(|| {
                AppError::validation(format!("item '{guid}' has no valid publication date"))
            })?;

        let mut categories: Vec<String> = Vec::with_capacity(self.categories.len());
        for category in &self.categories {
            let category = normalize_whitespace(category);
            if !category.is_empty() && !categories.iter().any(|c| c.eq_ignore_ascii_case(&category))
            {
                categories.push(category);
            }
        }

        let image_url = self
            .image_url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .and_then(|u| absolutize(u, base));

        Ok(ContentItem {
            source_id: source_id.to_string(),
            guid,
            title,
            link,
            published_at,
            summary: non_empty(self.summary.as_deref()).unwrap_or_default(),
            categories,
            image_url,
        })
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value.map(normalize_whitespace).filter(|v| !v.is_empty())
}

fn absolutize(href: &str, base: Option<&Url>) -> Option<String> {
    if let Ok(url) = Url::parse(href) {
        return Some(url.to_string());
    }
    base.map(|b| resolve_url(b, href))
        .filter(|resolved| Url::parse(resolved).is_ok())
}
