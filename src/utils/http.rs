// src/utils/http.rs

//! HTTP client utilities.

use crate::error::Result;
use crate::models::FetchConfig;

/// Create a configured asynchronous HTTP client.
///
/// The per-call timeout is enforced by the orchestrator, so the client itself
/// only carries a connect timeout.
pub fn create_client(config: &FetchConfig) -> Result<reqwest::Client> {
    let client = reqwest::Client::builder()
        .user_agent(&config.user_agent)
        .connect_timeout(config.timeout())
        .build()?;
    Ok(client)
}

/// GET a URL and return the body, failing on non-success status codes.
pub async fn get_text(client: &reqwest::Client, url: &str) -> Result<String> {
    let response = client.get(url).send().await?.error_for_status()?;
    Ok(response.text().await?)
}
