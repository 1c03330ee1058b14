//! Text-mode page reader for JavaScript-heavy sites.
//!
//! Proxies the target URL through a Jina-style reader endpoint that renders
//! the page and returns plain text. Used when direct extraction comes back
//! nearly empty.

use askpipe_core::{Error, Result};

use crate::extract::truncate_at_sentence;

const READER_TIMEOUT_MS: u64 = 10_000;

fn reader_endpoint_from_env() -> Option<String> {
    std::env::var("ASKPIPE_READER_ENDPOINT")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

#[derive(Debug, Clone)]
pub struct ReaderClient {
    client: reqwest::Client,
}

impl ReaderClient {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn endpoint() -> String {
        reader_endpoint_from_env().unwrap_or_else(|| "https://r.jina.ai".to_string())
    }

    /// Fetch a rendered-text view of `url`, truncated to `max_chars` on a
    /// sentence boundary when possible.
    pub async fn read(&self, url: &str, max_chars: usize, timeout_ms: Option<u64>) -> Result<String> {
        let timeout_ms = timeout_ms.unwrap_or(READER_TIMEOUT_MS).clamp(1_000, 60_000);
        let base = Self::endpoint();
        let target = format!("{}/{}", base.trim_end_matches('/'), url);

        let resp = self
            .client
            .get(target)
            .header("Accept", "text/plain")
            .timeout(std::time::Duration::from_millis(timeout_ms))
            .send()
            .await
            .map_err(|e| Error::Fetch(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Fetch(format!("reader fetch HTTP {status}")));
        }

        let body = resp.text().await.map_err(|e| Error::Fetch(e.to_string()))?;
        Ok(truncate_at_sentence(body.trim(), max_chars))
    }
}
