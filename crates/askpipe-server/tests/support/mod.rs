#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use askpipe_core::{Error, GenRequest, GenerationBackend, Result, TokenStream};
use askpipe_local::cache::SimilarityCache;
use askpipe_local::fetch::Fetcher;
use askpipe_local::similarity::SimilarityConfig;
use askpipe_local::tokens::ModelBudgets;
use askpipe_local::weather::OpenWeather;
use askpipe_server::orchestrate::Orchestrator;
use askpipe_server::routes::{build_router, AppState};
use axum::body::Body;
use axum::http::Request;
use axum::response::Response;
use axum::Router;
use http_body_util::BodyExt;
use tower::ServiceExt;

/// Serializes tests that mutate process environment.
pub static ENV_LOCK: Mutex<()> = Mutex::new(());

pub struct EnvGuard {
    k: &'static str,
    prev: Option<String>,
}

impl EnvGuard {
    pub fn set(k: &'static str, v: &str) -> Self {
        let prev = std::env::var(k).ok();
        std::env::set_var(k, v);
        Self { k, prev }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        if let Some(v) = self.prev.take() {
            std::env::set_var(self.k, v);
        } else {
            std::env::remove_var(self.k);
        }
    }
}

/// Generation backend that replays a scripted list of replies, one per
/// call, and records every request it saw.
pub struct ScriptedBackend {
    replies: Mutex<VecDeque<String>>,
    calls: Mutex<Vec<GenRequest>>,
}

impl ScriptedBackend {
    pub fn new(replies: &[&str]) -> Arc<Self> {
        Arc::new(ScriptedBackend {
            replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn next_reply(&self, req: &GenRequest) -> Result<String> {
        self.calls.lock().unwrap().push(req.clone());
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| Error::Generation("script exhausted".to_string()))
    }
}

#[async_trait::async_trait]
impl GenerationBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn chat(&self, req: &GenRequest) -> Result<String> {
        self.next_reply(req)
    }

    async fn chat_stream(&self, req: &GenRequest) -> Result<TokenStream> {
        let text = self.next_reply(req)?;
        let tokens: Vec<Result<String>> = text
            .split_inclusive(' ')
            .map(|t| Ok(t.to_string()))
            .collect();
        Ok(Box::pin(futures_util::stream::iter(tokens)))
    }

    async fn models(&self) -> Result<Vec<String>> {
        Ok(vec!["llama3.1:70b".to_string(), "llama3.2:1b".to_string()])
    }
}

/// In-process app over a memory-only cache, no search or weather provider.
pub fn app(
    backend: Arc<ScriptedBackend>,
    api_key: Option<&str>,
) -> (Router, Arc<SimilarityCache>) {
    app_with(backend, api_key, None)
}

pub fn app_with(
    backend: Arc<ScriptedBackend>,
    api_key: Option<&str>,
    weather: Option<OpenWeather>,
) -> (Router, Arc<SimilarityCache>) {
    let cache = Arc::new(SimilarityCache::with_config(
        None,
        64,
        SimilarityConfig::default(),
    ));
    let client = askpipe_local::default_client().unwrap();
    let fetcher = Fetcher::new(client, cache.clone(), None, weather, 2);
    let budgets = ModelBudgets::new(HashMap::new(), 8192, 0.8);
    let orchestrator = Arc::new(Orchestrator::new(
        backend.clone(),
        fetcher,
        cache.clone(),
        budgets,
        30,
        None,
    ));
    let state = AppState {
        orchestrator,
        backend,
        api_key: api_key.map(str::to_string),
    };
    (build_router(state), cache)
}

pub fn chat_body(model: &str, prompt: &str) -> serde_json::Value {
    serde_json::json!({"model": model, "prompt": prompt})
}

pub async fn request(
    app: &Router,
    method: &str,
    path: &str,
    api_key: Option<&str>,
    body: Option<serde_json::Value>,
) -> Response {
    let mut builder = Request::builder().method(method).uri(path);
    if let Some(key) = api_key {
        builder = builder.header("x-api-key", key);
    }
    let req = match body {
        Some(v) => builder
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&v).unwrap()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    app.clone().oneshot(req).await.unwrap()
}

pub async fn body_text(resp: Response) -> String {
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

pub async fn body_json(resp: Response) -> serde_json::Value {
    serde_json::from_str(&body_text(resp).await).unwrap()
}

/// Splits an SSE transcript into `(event, data)` pairs.
pub fn parse_sse(raw: &str) -> Vec<(String, serde_json::Value)> {
    raw.split("\n\n")
        .filter(|chunk| !chunk.trim().is_empty())
        .map(|chunk| {
            let mut event = None;
            let mut data = None;
            for line in chunk.lines() {
                if let Some(rest) = line.strip_prefix("event: ") {
                    event = Some(rest.to_string());
                } else if let Some(rest) = line.strip_prefix("data: ") {
                    data = Some(serde_json::from_str(rest).expect("frame data is JSON"));
                }
            }
            (
                event.expect("frame carries an event line"),
                data.expect("frame carries a data line"),
            )
        })
        .collect()
}

/// Stage names from the status events of a parsed transcript, in order.
pub fn sse_stages(frames: &[(String, serde_json::Value)]) -> Vec<String> {
    frames
        .iter()
        .filter(|(event, _)| event == "status")
        .map(|(_, data)| data["stage"].as_str().unwrap_or("").to_string())
        .collect()
}

/// Concatenated token contents of a parsed transcript.
pub fn sse_text(frames: &[(String, serde_json::Value)]) -> String {
    frames
        .iter()
        .filter(|(event, _)| event == "token")
        .map(|(_, data)| data["content"].as_str().unwrap_or("").to_string())
        .collect()
}
