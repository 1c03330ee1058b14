use std::time::{Duration, SystemTime, UNIX_EPOCH};

use askpipe_core::{Error, Result};

pub mod analyze;
pub mod cache;
pub mod extract;
pub mod fetch;
pub mod ollama;
pub mod reader;
pub mod sanitize;
pub mod search;
pub mod similarity;
pub mod tokens;
pub mod weather;

/// Shared HTTP client for provider calls and page scraping. A browser
/// user agent is required: several targets serve bot traffic an empty
/// shell or a block page.
pub fn default_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent("Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36")
        .redirect(reqwest::redirect::Policy::limited(10))
        // Per-request timeouts can tighten these, never extend them.
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(30))
        .build()
        .map_err(|e| Error::Fetch(e.to_string()))
}

pub(crate) fn now_epoch_s() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_secs()
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_client_builds() {
        assert!(default_client().is_ok());
    }
}
