//! Search, scrape, compose: the retrieval pipeline behind a tool decision.
//!
//! A retrieval runs the kind's provider search, walks the result list as an
//! ordered fallback chain with bounded speculative concurrency, and folds
//! what survived into one injectable text block. Scraped pages are cached
//! by URL so repeat retrievals skip the network.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{stream, StreamExt};
use tracing::{debug, info, warn};

use askpipe_core::{Error, SearchHit, SearchKind, SearchQuery, SearchSource};

use crate::cache::{combine_text, ttl_for, ContentBlock, Namespace, SimilarityCache};
use crate::extract::extract_text;
use crate::reader::ReaderClient;
use crate::weather::{OpenWeather, WeatherOutcome};

pub const DEFAULT_FETCH_CONCURRENCY: usize = 3;
const MAX_FETCH_CONCURRENCY: usize = 8;
const FETCH_TIMEOUT_MS: u64 = 10_000;
/// Below this many extracted chars a page is retried through the reader.
const READER_FALLBACK_CHARS: usize = 200;
/// Below this many chars an extraction counts as empty and the walk advances.
const MIN_CONTENT_CHARS: usize = 50;
/// Summaries keep at least this much room even when content fills the cap.
const MIN_SUMMARY_CHARS: usize = 500;

struct KindProfile {
    query_prefix: Option<&'static str>,
    domain: Option<&'static str>,
    display_count: usize,
}

fn profile(kind: SearchKind) -> KindProfile {
    match kind {
        SearchKind::Wikipedia => KindProfile {
            query_prefix: Some("wikipedia "),
            domain: Some("wikipedia.org"),
            display_count: 3,
        },
        SearchKind::Reddit => KindProfile {
            query_prefix: Some("reddit "),
            domain: Some("reddit.com"),
            display_count: 6,
        },
        _ => KindProfile {
            query_prefix: None,
            domain: None,
            display_count: 5,
        },
    }
}

/// Per-candidate terminal state. `Pending` marks candidates the walk never
/// reached.
#[derive(Debug, Clone, PartialEq)]
pub enum CandidateOutcome {
    Pending,
    Extracted(String),
    Empty,
    Failed(String),
}

/// Ordered candidate list for one retrieval plus the walk position. The
/// task is terminal once a candidate extracts or the cursor passes the end.
#[derive(Debug)]
pub struct FetchTask {
    pub kind: SearchKind,
    pub candidates: Vec<SearchHit>,
    pub outcomes: Vec<CandidateOutcome>,
    pub cursor: usize,
}

impl FetchTask {
    pub fn new(kind: SearchKind, candidates: Vec<SearchHit>) -> Self {
        let outcomes = vec![CandidateOutcome::Pending; candidates.len()];
        Self {
            kind,
            candidates,
            outcomes,
            cursor: 0,
        }
    }

    /// Index, hit, and text of the first extracted candidate.
    pub fn winner(&self) -> Option<(usize, &SearchHit, &str)> {
        self.outcomes
            .iter()
            .enumerate()
            .find_map(|(idx, outcome)| match outcome {
                CandidateOutcome::Extracted(text) => {
                    Some((idx, &self.candidates[idx], text.as_str()))
                }
                _ => None,
            })
    }

    pub fn is_terminal(&self) -> bool {
        self.winner().is_some() || self.cursor >= self.candidates.len()
    }
}

/// What one retrieval produced. `contents` and `summaries` are the
/// cacheable pieces; `text` is their combined form, or an explanatory
/// failure text when `cacheable` is unset.
#[derive(Debug, Clone)]
pub struct Retrieval {
    pub kind: SearchKind,
    pub query: String,
    pub contents: Vec<ContentBlock>,
    pub summaries: Option<String>,
    pub text: String,
    pub source: Option<String>,
    pub cacheable: bool,
}

impl Retrieval {
    fn from_parts(
        kind: SearchKind,
        query: String,
        contents: Vec<ContentBlock>,
        summaries: Option<String>,
    ) -> Self {
        let text = combine_text(&contents, summaries.as_deref());
        let urls: Vec<&str> = contents
            .iter()
            .map(|b| b.url.as_str())
            .filter(|u| !u.is_empty())
            .collect();
        let source = if urls.is_empty() {
            None
        } else {
            Some(urls.join(", "))
        };
        Self {
            kind,
            query,
            contents,
            summaries,
            text,
            source,
            cacheable: true,
        }
    }

    fn failure(kind: SearchKind, query: String, text: String) -> Self {
        Self {
            kind,
            query,
            contents: Vec::new(),
            summaries: None,
            text,
            source: None,
            cacheable: false,
        }
    }
}

pub struct Fetcher {
    client: reqwest::Client,
    reader: ReaderClient,
    cache: Arc<SimilarityCache>,
    search: Option<Arc<dyn SearchSource>>,
    weather: Option<OpenWeather>,
    limit: usize,
}

impl Fetcher {
    pub fn new(
        client: reqwest::Client,
        cache: Arc<SimilarityCache>,
        search: Option<Arc<dyn SearchSource>>,
        weather: Option<OpenWeather>,
        limit: usize,
    ) -> Self {
        Self {
            reader: ReaderClient::new(client.clone()),
            client,
            cache,
            search,
            weather,
            limit: limit.clamp(1, MAX_FETCH_CONCURRENCY),
        }
    }

    /// Resolve one tool decision into injectable text. Never fails: provider
    /// problems come back as explanatory text with `cacheable` unset.
    pub async fn retrieve(&self, kind: SearchKind, query: &str, max_chars: usize) -> Retrieval {
        match kind {
            SearchKind::Weather => self.retrieve_weather(query, max_chars).await,
            _ => self.retrieve_search(kind, query, max_chars).await,
        }
    }

    async fn retrieve_weather(&self, city: &str, max_chars: usize) -> Retrieval {
        if let Some(provider) = &self.weather {
            match provider.current(city, None).await {
                WeatherOutcome::Report { text, source_url } => {
                    return Retrieval::from_parts(
                        SearchKind::Weather,
                        city.to_string(),
                        vec![ContentBlock::new(source_url, text)],
                        None,
                    );
                }
                // A misspelled city is an answer, not an outage.
                WeatherOutcome::CityNotFound { text } => {
                    return Retrieval::from_parts(
                        SearchKind::Weather,
                        city.to_string(),
                        vec![ContentBlock::new("", text)],
                        None,
                    );
                }
                WeatherOutcome::Unavailable { reason } => {
                    warn!(city = %city, reason = %reason, "weather provider unavailable, searching instead");
                }
            }
        } else {
            debug!("weather provider not configured, searching instead");
        }
        let fallback = format!("{city} weather today");
        self.retrieve_search(SearchKind::Web, &fallback, max_chars)
            .await
    }

    async fn retrieve_search(&self, kind: SearchKind, query: &str, max_chars: usize) -> Retrieval {
        let Some(source) = &self.search else {
            return Retrieval::failure(
                kind,
                query.to_string(),
                search_failure_text(query, &Error::NotConfigured("search".to_string())),
            );
        };

        let prof = profile(kind);
        let provider_query = match prof.query_prefix {
            Some(prefix) => format!("{prefix}{query}"),
            None => query.to_string(),
        };

        let response = match source.search(&SearchQuery::new(kind, provider_query)).await {
            Ok(r) => r,
            Err(e) => {
                warn!(kind = %kind, error = %e, "search failed");
                return Retrieval::failure(kind, query.to_string(), search_failure_text(query, &e));
            }
        };

        let candidates: Vec<SearchHit> = response
            .hits
            .into_iter()
            .filter(|h| prof.domain.map_or(true, |d| h.url.contains(d)))
            .collect();

        info!(
            kind = %kind,
            query = %query,
            candidates = candidates.len(),
            infobox = response.infobox.is_some(),
            "search complete"
        );

        if candidates.is_empty() && response.infobox.is_none() {
            return Retrieval::failure(kind, query.to_string(), "No results found.".to_string());
        }

        let mut task = FetchTask::new(kind, candidates);
        self.run(&mut task, max_chars).await;

        let (contents, summaries) = compose(
            response.infobox.as_deref(),
            &task,
            prof.display_count,
            max_chars,
        );
        Retrieval::from_parts(kind, query.to_string(), contents, summaries)
    }

    /// Drive the task to a terminal state. Candidates fetch with bounded
    /// speculative concurrency but their outcomes commit strictly in
    /// declared order, so the first extraction wins and everything past it
    /// is abandoned. At limit 1 the walk is fully sequential.
    pub async fn run(&self, task: &mut FetchTask, max_chars: usize) {
        let kind = task.kind;
        let urls: Vec<String> = task.candidates.iter().map(|h| h.url.clone()).collect();
        let mut results = stream::iter(urls.into_iter().enumerate())
            .map(|(idx, url)| async move {
                (idx, self.fetch_candidate(kind, &url, max_chars).await)
            })
            .buffered(self.limit);

        while let Some((idx, outcome)) = results.next().await {
            let extracted = matches!(outcome, CandidateOutcome::Extracted(_));
            task.outcomes[idx] = outcome;
            task.cursor = idx + 1;
            if extracted {
                break;
            }
        }
    }

    /// One candidate: URL cache, then HTTP plus type-specific extraction,
    /// then the render-aware reader when extraction comes back thin.
    async fn fetch_candidate(
        &self,
        kind: SearchKind,
        url: &str,
        max_chars: usize,
    ) -> CandidateOutcome {
        if let Some(hit) = self.cache.lookup(Namespace::Url, kind, url) {
            if !hit.text.is_empty() {
                return CandidateOutcome::Extracted(hit.text);
            }
        }

        let response = match self
            .client
            .get(url)
            .timeout(Duration::from_millis(FETCH_TIMEOUT_MS))
            .send()
            .await
        {
            Ok(r) => r,
            // A hung host reads the same as an empty page: advance the walk.
            Err(e) if e.is_timeout() => {
                debug!(url = %url, "fetch timed out");
                return CandidateOutcome::Empty;
            }
            Err(e) => return CandidateOutcome::Failed(format!("fetch failed: {e}")),
        };
        if !response.status().is_success() {
            return CandidateOutcome::Failed(format!("HTTP {}", response.status().as_u16()));
        }
        let html = match response.text().await {
            Ok(b) => b,
            Err(e) => return CandidateOutcome::Failed(format!("fetch failed: {e}")),
        };

        let mut text = extract_text(&html, max_chars, Some(url));
        if text.chars().count() < READER_FALLBACK_CHARS {
            // JavaScript-heavy pages extract to almost nothing; the reader
            // renders them remotely and returns plain text.
            match self.reader.read(url, max_chars, None).await {
                Ok(rendered) if rendered.chars().count() > text.chars().count() => {
                    debug!(url = %url, "reader fallback used");
                    text = rendered;
                }
                Ok(_) => {}
                Err(e) => debug!(url = %url, error = %e, "reader fallback failed"),
            }
        }

        if text.chars().count() < MIN_CONTENT_CHARS {
            return CandidateOutcome::Empty;
        }

        info!(url = %url, chars = text.chars().count(), "content extracted");
        self.cache
            .admit(
                Namespace::Url,
                kind,
                url,
                vec![ContentBlock::new(url, text.clone())],
                None,
                Some(ttl_for(kind)),
            )
            .await;
        CandidateOutcome::Extracted(text)
    }
}

/// Fold a terminal task into cacheable pieces: an optional quick answer,
/// the winning page's block, and numbered summaries of the remaining hits.
fn compose(
    infobox: Option<&str>,
    task: &FetchTask,
    display_count: usize,
    max_chars: usize,
) -> (Vec<ContentBlock>, Option<String>) {
    let mut contents: Vec<ContentBlock> = Vec::new();
    if let Some(answer) = infobox {
        contents.push(ContentBlock::new("", format!("Quick Answer: {answer}")));
    }

    let winner_idx = task.winner().map(|(idx, hit, text)| {
        contents.push(ContentBlock::new(
            hit.url.clone(),
            format!(
                "=== Content from: {} ===\nSource: {}\n{}",
                hit.title.as_deref().unwrap_or(&hit.url),
                hit.url,
                text
            ),
        ));
        idx
    });

    let lines: Vec<String> = task
        .candidates
        .iter()
        .enumerate()
        .filter(|(idx, _)| Some(*idx) != winner_idx)
        .take(display_count)
        .enumerate()
        .map(|(n, (_, hit))| {
            format!(
                "{}. {}\n   {}\n   URL: {}",
                n + 1,
                hit.title.as_deref().unwrap_or(&hit.url),
                hit.snippet.as_deref().unwrap_or(""),
                hit.url
            )
        })
        .collect();

    let summaries = if lines.is_empty() {
        None
    } else {
        let dedicated: usize = contents.iter().map(|b| b.text.chars().count()).sum();
        let budget = max_chars.saturating_sub(dedicated).max(MIN_SUMMARY_CHARS);
        let body = format!("Additional Search Results:\n{}", lines.join("\n"));
        Some(truncate_summaries(&body, budget))
    };

    (contents, summaries)
}

/// Cut summaries to `max_chars`, keeping a sentence end when one falls past
/// 80% of the budget.
fn truncate_summaries(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    if let Some(pos) = cut.rfind('.') {
        if cut[..pos].chars().count() as f64 > max_chars as f64 * 0.8 {
            return cut[..=pos].to_string();
        }
    }
    cut
}

/// Explanatory block injected when search cannot run, so the model can
/// tell the user exactly why.
fn search_failure_text(query: &str, err: &Error) -> String {
    let reason = match err {
        Error::Search(msg) => msg.clone(),
        Error::NotConfigured(_) => {
            "Search API key not configured. Cannot perform search.".to_string()
        }
        other => format!("Search failed: {other}"),
    };
    format!("Search query: '{query}'\n{reason}")
}
