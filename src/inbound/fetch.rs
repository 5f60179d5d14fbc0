//! Small HTTP helpers for pulling media referenced by gateway frames.

use anyhow::{Context, Result};
use base64::Engine;

/// Download `url` and return its bytes base64-encoded, the payload form the
/// core expects for images and stickers.
pub async fn fetch_base64(client: &reqwest::Client, url: &str) -> Result<String> {
    let response = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("fetching {url}"))?
        .error_for_status()
        .with_context(|| format!("fetching {url}"))?;
    let bytes = response
        .bytes()
        .await
        .with_context(|| format!("reading body of {url}"))?;
    Ok(base64::engine::general_purpose::STANDARD.encode(&bytes))
}
