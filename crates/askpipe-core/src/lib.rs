use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::pin::Pin;
use std::time::Duration;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("fetch failed: {0}")]
    Fetch(String),
    #[error("cache error: {0}")]
    Cache(String),
    #[error("search failed: {0}")]
    Search(String),
    #[error("generation failed: {0}")]
    Generation(String),
    #[error("context budget exceeded: {0}")]
    Budget(String),
    #[error("not configured: {0}")]
    NotConfigured(String),
}

impl Error {
    /// Stable machine-readable discriminator for error events.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidRequest(_) => "invalid_request",
            Error::Fetch(_) => "fetch",
            Error::Cache(_) => "cache",
            Error::Search(_) => "search",
            Error::Generation(_) => "generation",
            Error::Budget(_) => "budget",
            Error::NotConfigured(_) => "not_configured",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
}

impl ChatTurn {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// One inbound chat request. Immutable once accepted; history order is
/// significant (oldest first).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub prompt: String,
    #[serde(default)]
    pub history: Vec<ChatTurn>,
    pub system_prompt: Option<String>,
    pub user_memory: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchKind {
    Web,
    Reddit,
    Wikipedia,
    Weather,
    Recall,
}

impl SearchKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchKind::Web => "web",
            SearchKind::Reddit => "reddit",
            SearchKind::Wikipedia => "wikipedia",
            SearchKind::Weather => "weather",
            SearchKind::Recall => "recall",
        }
    }
}

impl std::fmt::Display for SearchKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exactly one decision is made per processing cycle; it is computed once
/// and only consumed downstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchDecision {
    None,
    CacheHit,
    Tool(SearchKind),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchQuery {
    pub kind: SearchKind,
    pub query: String,
    /// Overrides the kind's default result count when set.
    pub max_results: Option<usize>,
    pub timeout_ms: Option<u64>,
}

impl SearchQuery {
    pub fn new(kind: SearchKind, query: impl Into<String>) -> Self {
        Self {
            kind,
            query: query.into(),
            max_results: None,
            timeout_ms: None,
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub url: String,
    pub title: Option<String>,
    pub snippet: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub hits: Vec<SearchHit>,
    /// Provider infobox answer, when the engine surfaced one directly.
    pub infobox: Option<String>,
    pub provider: String,
    pub timings_ms: BTreeMap<String, u128>,
}

#[async_trait::async_trait]
pub trait SearchSource: Send + Sync {
    fn name(&self) -> &'static str;
    async fn search(&self, q: &SearchQuery) -> Result<SearchResponse>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenRequest {
    pub model: String,
    pub messages: Vec<ChatTurn>,
    pub timeout_ms: Option<u64>,
}

impl GenRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatTurn>) -> Self {
        Self {
            model: model.into(),
            messages,
            timeout_ms: None,
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// Ordered token fragments from a streaming generation call.
pub type TokenStream = Pin<Box<dyn futures_core::Stream<Item = Result<String>> + Send>>;

#[async_trait::async_trait]
pub trait GenerationBackend: Send + Sync {
    fn name(&self) -> &'static str;
    async fn chat(&self, req: &GenRequest) -> Result<String>;
    async fn chat_stream(&self, req: &GenRequest) -> Result<TokenStream>;
    async fn models(&self) -> Result<Vec<String>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub used: usize,
    /// Safety-buffered budget the request was fitted against.
    pub limit: usize,
    pub model_max: usize,
    pub usage_percent: f32,
}

impl TokenUsage {
    pub fn new(used: usize, limit: usize, model_max: usize) -> Self {
        let usage_percent = if limit == 0 {
            0.0
        } else {
            (used as f32 / limit as f32) * 100.0
        };
        Self {
            used,
            limit,
            model_max,
            usage_percent,
        }
    }
}

/// Terminal payload for one request: the answer plus retrieval provenance.
/// Serialized as the non-streaming response body and as the `done` event data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerMeta {
    pub model: String,
    pub response: String,
    pub context_messages: usize,
    pub search_performed: bool,
    #[serde(rename = "search_type", skip_serializing_if = "Option::is_none")]
    pub search_kind: Option<SearchKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search_query: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Cache id of the stored retrieval, echoed so clients can recall it later.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search_id: Option<u64>,
    pub cutoff_retries: u32,
    pub tokens: TokenUsage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StreamBody {
    Done(Box<AnswerMeta>),
    Error {
        error: String,
        message: String,
    },
    Status {
        stage: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Token {
        content: String,
    },
}

impl StreamBody {
    pub fn event_name(&self) -> &'static str {
        match self {
            StreamBody::Status { .. } => "status",
            StreamBody::Token { .. } => "token",
            StreamBody::Done(_) => "done",
            StreamBody::Error { .. } => "error",
        }
    }

    /// True for the events that close a request's sequence.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamBody::Done(_) | StreamBody::Error { .. })
    }
}

/// One externally visible event. Sequence numbers are strictly increasing
/// per request and exactly one terminal event closes the sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEvent {
    pub seq: u64,
    #[serde(flatten)]
    pub body: StreamBody,
}
