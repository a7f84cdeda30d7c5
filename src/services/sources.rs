//! Upstream content sources.
//!
//! A [`Source`] knows how to pull raw items for one source id. The bundled
//! [`HttpSource`] reads a JSON document over HTTP:
//!
//! ```text
//! [ {item}, ... ]            or            { "items": [ {item}, ... ] }
//! ```
//!
//! When `version_url` is configured its body (trimmed plain text) is the
//! version token, and `{version}` in the item URL is replaced with it.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{AppError, Result};
use crate::models::{Config, RawItem, SourceConfig};
use crate::utils::http;

const VERSION_PLACEHOLDER: &str = "{version}";

/// Trait for upstream content sources.
#[async_trait]
pub trait Source: Send + Sync {
    /// Stable source id, matching the `[[sources]]` entry.
    fn id(&self) -> &str;

    /// Resolve the upstream version token, if the source is versioned.
    async fn version_token(&self) -> Result<Option<String>> {
        Ok(None)
    }

    /// Fetch raw items, using the token from [`Source::version_token`] when present.
    async fn fetch(&self, token: Option<&str>) -> Result<Vec<RawItem>>;
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ItemsDocument {
    List(Vec<RawItem>),
    Wrapped { items: Vec<RawItem> },
}

/// JSON-over-HTTP source.
#[derive(Clone)]
pub struct HttpSource {
    config: SourceConfig,
    client: reqwest::Client,
}

impl HttpSource {
    pub fn new(config: SourceConfig, client: reqwest::Client) -> Self {
        Self { config, client }
    }

    /// Item URL with the version token substituted.
    fn item_url(&self, token: Option<&str>) -> Result<String> {
        if !self.config.url.contains(VERSION_PLACEHOLDER) {
            return Ok(self.config.url.clone());
        }
        match token {
            Some(token) => Ok(self.config.url.replace(VERSION_PLACEHOLDER, token)),
            None => Err(AppError::upstream(
                &self.config.id,
                "item URL needs {version} but no version token was resolved",
            )),
        }
    }
}

/// Parse a JSON items document.
pub fn parse_items(source_id: &str, body: &str) -> Result<Vec<RawItem>> {
    match serde_json::from_str::<ItemsDocument>(body) {
        Ok(ItemsDocument::List(items)) | Ok(ItemsDocument::Wrapped { items }) => Ok(items),
        Err(e) => Err(AppError::upstream(
            source_id,
            format!("response is not an items document: {e}"),
        )),
    }
}

#[async_trait]
impl Source for HttpSource {
    fn id(&self) -> &str {
        &self.config.id
    }

    async fn version_token(&self) -> Result<Option<String>> {
        let Some(version_url) = &self.config.version_url else {
            return Ok(None);
        };
        let body = http::get_text(&self.client, version_url).await?;
        let token = body.trim();
        if token.is_empty() {
            return Err(AppError::upstream(&self.config.id, "empty version token"));
        }
        log::debug!("[{}] version token: {}", self.config.id, token);
        Ok(Some(token.to_string()))
    }

    async fn fetch(&self, token: Option<&str>) -> Result<Vec<RawItem>> {
        let url = self.item_url(token)?;
        log::debug!("[{}] fetching {}", self.config.id, url);
        let body = http::get_text(&self.client, &url).await?;
        parse_items(&self.config.id, &body)
    }
}

/// Build an [`HttpSource`] for every configured source.
pub fn http_sources(config: &Config) -> Result<Vec<Arc<dyn Source>>> {
    let client = http::create_client(&config.fetch)?;
    Ok(config
        .sources
        .iter()
        .map(|source| {
            Arc::new(HttpSource::new(source.clone(), client.clone())) as Arc<dyn Source>
        })
        .collect())
}
