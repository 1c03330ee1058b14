use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Instant;

use askpipe_core::{Error, Result, SearchHit, SearchKind, SearchQuery, SearchResponse, SearchSource};

const DEFAULT_RESULT_COUNT: usize = 5;

fn timeout_ms_from_query(q: &SearchQuery) -> u64 {
    // Provider requests can hang indefinitely without an explicit timeout.
    // Keep a conservative cap even if callers pass something huge.
    q.timeout_ms.unwrap_or(15_000).clamp(1_000, 60_000)
}

fn brave_api_key_from_env() -> Option<String> {
    std::env::var("ASKPIPE_BRAVE_API_KEY")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .or_else(|| {
            std::env::var("BRAVE_SEARCH_API_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty())
        })
}

fn brave_endpoint_from_env() -> Option<String> {
    std::env::var("ASKPIPE_BRAVE_ENDPOINT")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Result count requested from the engine, tuned per search kind:
/// fewer high-quality pages for encyclopedia lookups, more for
/// discussion threads where any single hit may be thin.
fn default_count(kind: SearchKind) -> usize {
    match kind {
        SearchKind::Wikipedia => 3,
        SearchKind::Reddit => 8,
        _ => DEFAULT_RESULT_COUNT,
    }
}

#[derive(Debug, Clone)]
pub struct BraveSearch {
    client: reqwest::Client,
    api_key: String,
}

impl BraveSearch {
    pub fn new(client: reqwest::Client, api_key: impl Into<String>) -> Self {
        Self {
            client,
            api_key: api_key.into(),
        }
    }

    pub fn from_env(client: reqwest::Client) -> Result<Self> {
        let api_key = brave_api_key_from_env().ok_or_else(|| {
            Error::NotConfigured(
                "missing ASKPIPE_BRAVE_API_KEY (or BRAVE_SEARCH_API_KEY)".to_string(),
            )
        })?;
        Ok(Self { client, api_key })
    }

    fn endpoint() -> String {
        // Docs: https://api.search.brave.com/res/v1/web/search
        brave_endpoint_from_env()
            .unwrap_or_else(|| "https://api.search.brave.com/res/v1/web/search".to_string())
    }
}

#[derive(Debug, Deserialize)]
struct BraveSearchPayload {
    web: Option<BraveWeb>,
    infobox: Option<BraveInfobox>,
}

#[derive(Debug, Deserialize)]
struct BraveWeb {
    results: Option<Vec<BraveWebResult>>,
}

#[derive(Debug, Deserialize)]
struct BraveWebResult {
    url: String,
    title: Option<String>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BraveInfobox {
    description: Option<String>,
}

#[async_trait::async_trait]
impl SearchSource for BraveSearch {
    fn name(&self) -> &'static str {
        "brave"
    }

    async fn search(&self, q: &SearchQuery) -> Result<SearchResponse> {
        let t0 = Instant::now();
        let timeout_ms = timeout_ms_from_query(q);
        let count = q.max_results.unwrap_or_else(|| default_count(q.kind)).min(20);

        let mut req = self
            .client
            .get(Self::endpoint())
            .header("Accept", "application/json")
            .header("X-Subscription-Token", &self.api_key)
            .query(&[("q", q.query.as_str())])
            .query(&[("count", count.to_string())]);

        match q.kind {
            SearchKind::Wikipedia => {
                req = req.query(&[("search_lang", "en")]);
            }
            SearchKind::Reddit => {
                // Discussions go stale fast; restrict to the past week.
                req = req.query(&[("freshness", "pw")]);
            }
            _ => {}
        }

        let resp = req
            .timeout(std::time::Duration::from_millis(timeout_ms))
            .send()
            .await
            .map_err(|e| Error::Search(format!("Search failed: {e}")))?;

        let status = resp.status();
        match status.as_u16() {
            200 => {}
            401 => {
                return Err(Error::Search(
                    "Invalid API key. Please check your BRAVE_SEARCH_API_KEY.".to_string(),
                ))
            }
            429 => {
                return Err(Error::Search(
                    "API rate limit exceeded. Please try again later.".to_string(),
                ))
            }
            code => return Err(Error::Search(format!("Search API error (status {code})."))),
        }

        let parsed: BraveSearchPayload = resp
            .json()
            .await
            .map_err(|e| Error::Search(format!("Search failed: {e}")))?;

        let mut hits = Vec::new();
        if let Some(web) = parsed.web {
            if let Some(results) = web.results {
                for r in results {
                    hits.push(SearchHit {
                        url: r.url,
                        title: r.title,
                        snippet: r.description,
                    });
                }
            }
        }

        let infobox = parsed
            .infobox
            .and_then(|b| b.description)
            .filter(|d| !d.trim().is_empty());

        let mut timings_ms = BTreeMap::new();
        timings_ms.insert("search".to_string(), t0.elapsed().as_millis());

        Ok(SearchResponse {
            hits,
            infobox,
            provider: "brave".to_string(),
            timings_ms,
        })
    }
}
