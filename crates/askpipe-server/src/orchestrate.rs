//! Chat orchestration: the decision loop between the generation backend,
//! the search/fetch pipeline, and the similarity cache.
//!
//! A request takes one of three roads. A direct answer streams straight
//! from the model, but is aborted and re-routed the moment the sanitizer
//! surfaces a search marker or a knowledge-gap admission. A search pass
//! resolves content (cache first, network second) and synthesizes over it
//! in a second generation call. A recall pass replays a cached retrieval
//! by id and skips the network entirely.

use std::sync::Arc;

use askpipe_core::{
    AnswerMeta, ChatRequest, ChatTurn, GenRequest, GenerationBackend, Result, SearchKind,
    StreamBody, StreamEvent,
};
use askpipe_local::analyze::{
    admits_knowledge_gap, clean_response, content_char_cap, direct_intent, is_small_model,
    parse_marker, preflight_needs_search, MarkerCommand,
};
use askpipe_local::cache::{CacheHit, Namespace, SimilarityCache};
use askpipe_local::fetch::{Fetcher, Retrieval};
use askpipe_local::sanitize::{Signal, StreamSanitizer};
use askpipe_local::tokens::{self, FitOutcome, ModelBudgets, ReserveClass};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::prompts;

const RECALLING_MSG: &str = "Let me look at it...";
const RECALL_FAILED_MSG: &str =
    "I couldn't find the resources, It may have expired. Let me do a new search!";
const REROUTING_MSG: &str =
    "Detecting knowledge limitation, searching for current information...";

/// Resolved context for a synthesis pass, whether it came from the cache,
/// a recall, or a fresh fetch.
struct Retrieved {
    kind: SearchKind,
    query: String,
    text: String,
    source: Option<String>,
    search_id: Option<u64>,
}

impl Retrieved {
    /// Cache hit for a requested search: the reported kind and query are
    /// the ones asked for, the payload is whatever matched.
    fn from_hit(kind: SearchKind, query: &str, hit: CacheHit) -> Self {
        Retrieved {
            kind,
            query: query.to_string(),
            text: hit.text,
            source: hit.source,
            search_id: Some(hit.search_id),
        }
    }

    /// Recall by id: the stored kind and query are the story.
    fn from_recall(hit: CacheHit) -> Self {
        Retrieved {
            kind: hit.kind,
            query: hit.query,
            text: hit.text,
            source: hit.source,
            search_id: Some(hit.search_id),
        }
    }
}

fn reserve_class(kind: SearchKind) -> ReserveClass {
    match kind {
        SearchKind::Weather => ReserveClass::ShortFact,
        _ => ReserveClass::Article,
    }
}

/// Host of the first source URL, `www` and all, for the reading status line.
fn first_host(source: &str) -> Option<String> {
    let first = source.split(',').next()?.trim();
    let parsed = url::Url::parse(first).ok()?;
    parsed.host_str().map(str::to_string)
}

/// First fit of the conversation, plus the pieces later passes re-fit from.
struct Prepared {
    history: Vec<ChatTurn>,
    system_prompt: String,
    first_fit: FitOutcome,
}

/// Sequencing wrapper over the event channel. `send` returns `false` once
/// the receiver is gone; callers treat that as the client hanging up.
struct Emitter {
    tx: mpsc::Sender<StreamEvent>,
    seq: u64,
}

impl Emitter {
    fn new(tx: mpsc::Sender<StreamEvent>) -> Self {
        Emitter { tx, seq: 0 }
    }

    async fn send(&mut self, body: StreamBody) -> bool {
        self.seq += 1;
        self.tx
            .send(StreamEvent {
                seq: self.seq,
                body,
            })
            .await
            .is_ok()
    }

    async fn status(&mut self, stage: &str, message: Option<String>) -> bool {
        self.send(StreamBody::Status {
            stage: stage.to_string(),
            message,
        })
        .await
    }

    async fn token(&mut self, content: &str) -> bool {
        self.send(StreamBody::Token {
            content: content.to_string(),
        })
        .await
    }
}

pub struct Orchestrator {
    backend: Arc<dyn GenerationBackend>,
    fetcher: Fetcher,
    cache: Arc<SimilarityCache>,
    budgets: ModelBudgets,
    history_cap: usize,
    generation_timeout_ms: Option<u64>,
}

impl Orchestrator {
    pub fn new(
        backend: Arc<dyn GenerationBackend>,
        fetcher: Fetcher,
        cache: Arc<SimilarityCache>,
        budgets: ModelBudgets,
        history_cap: usize,
        generation_timeout_ms: Option<u64>,
    ) -> Self {
        Orchestrator {
            backend,
            fetcher,
            cache,
            budgets,
            history_cap,
            generation_timeout_ms,
        }
    }

    /// Non-streaming chat. Same decision tree as `stream`, with marker and
    /// cutoff checks applied to the completed text instead of mid-flight.
    pub async fn respond(&self, req: &ChatRequest) -> Result<AnswerMeta> {
        let prepared = self.prepare(req)?;

        if let Some(MarkerCommand::Recall(id)) = parse_marker(&req.prompt) {
            return self.respond_recall(req, &prepared, id).await;
        }
        if let Some((kind, query)) = direct_intent(&req.prompt) {
            let ctx = self.acquire(req, &prepared, kind, &query).await?;
            return self.synthesize_full(req, &prepared, ctx, 0).await;
        }
        if is_small_model(&req.model) && preflight_needs_search(&req.prompt) {
            let (kind, query) = self.extract_query(req).await?;
            let ctx = self.acquire(req, &prepared, kind, &query).await?;
            return self.synthesize_full(req, &prepared, ctx, 0).await;
        }

        let gen = self.gen_request(&req.model, prepared.first_fit.turns.clone());
        let raw = self.backend.chat(&gen).await?;

        match parse_marker(&raw) {
            Some(MarkerCommand::Recall(id)) => {
                return self.respond_recall(req, &prepared, id).await
            }
            Some(MarkerCommand::Tool(kind, query)) if !query.trim().is_empty() => {
                let ctx = self.acquire(req, &prepared, kind, &query).await?;
                return self.synthesize_full(req, &prepared, ctx, 0).await;
            }
            _ => {}
        }
        if admits_knowledge_gap(&raw) {
            info!(model = %req.model, "knowledge-gap admission, re-routing to search");
            let (kind, query) = self.extract_query(req).await?;
            let ctx = self.acquire(req, &prepared, kind, &query).await?;
            return self.synthesize_full(req, &prepared, ctx, 1).await;
        }

        Ok(self.meta(req, &prepared.first_fit, None, clean_response(&raw), 0))
    }

    async fn respond_recall(
        &self,
        req: &ChatRequest,
        prepared: &Prepared,
        id: u64,
    ) -> Result<AnswerMeta> {
        if let Some(hit) = self.cache.recall(id) {
            return self
                .synthesize_full(req, prepared, Retrieved::from_recall(hit), 0)
                .await;
        }
        let (kind, query) = self.extract_query(req).await?;
        let ctx = self.acquire(req, prepared, kind, &query).await?;
        self.synthesize_full(req, prepared, ctx, 0).await
    }

    /// Streaming chat. Events go out on `tx` in sequence; the call runs to
    /// a single terminal event (done or error) unless the receiver drops,
    /// in which case everything downstream is torn down quietly.
    pub async fn stream(&self, req: ChatRequest, tx: mpsc::Sender<StreamEvent>) {
        let mut em = Emitter::new(tx);
        if !em.status("initializing", None).await {
            return;
        }
        match self.drive(&req, &mut em).await {
            Ok(Some(meta)) => {
                em.send(StreamBody::Done(Box::new(meta))).await;
            }
            Ok(None) => debug!("client went away mid-stream"),
            Err(e) => {
                warn!(error = %e, "chat stream failed");
                em.send(StreamBody::Error {
                    error: e.kind().to_string(),
                    message: e.to_string(),
                })
                .await;
            }
        }
    }

    /// `Ok(None)` throughout the streaming path means the client is gone.
    async fn drive(&self, req: &ChatRequest, em: &mut Emitter) -> Result<Option<AnswerMeta>> {
        let prepared = self.prepare(req)?;
        if !em.status("thinking", None).await {
            return Ok(None);
        }

        if let Some(MarkerCommand::Recall(id)) = parse_marker(&req.prompt) {
            return self.recall_flow(req, em, &prepared, id).await;
        }
        if let Some((kind, query)) = direct_intent(&req.prompt) {
            debug!(kind = %kind, "explicit search intent in prompt");
            return self.tool_flow(req, em, &prepared, kind, query, 0).await;
        }
        if is_small_model(&req.model) && preflight_needs_search(&req.prompt) {
            debug!(model = %req.model, "pre-flight recency check routed to search");
            let (kind, query) = self.extract_query(req).await?;
            return self.tool_flow(req, em, &prepared, kind, query, 0).await;
        }

        self.direct_answer(req, em, &prepared).await
    }

    async fn direct_answer(
        &self,
        req: &ChatRequest,
        em: &mut Emitter,
        prepared: &Prepared,
    ) -> Result<Option<AnswerMeta>> {
        let gen = self.gen_request(&req.model, prepared.first_fit.turns.clone());
        let mut stream = self.backend.chat_stream(&gen).await?;
        let mut sanitizer = StreamSanitizer::new();
        let mut answer = String::new();

        while let Some(token) = stream.next().await {
            let push = sanitizer.push(&token?);
            if !push.emit.is_empty() {
                answer.push_str(&push.emit);
                if !em.token(&push.emit).await {
                    return Ok(None);
                }
            }
            if let Some(signal) = push.signal {
                drop(stream);
                return match signal {
                    Signal::Marker(line) => self.marker_flow(req, em, prepared, &line).await,
                    Signal::Cutoff => self.reroute_flow(req, em, prepared).await,
                };
            }
        }

        let tail = sanitizer.finish();
        if !tail.emit.is_empty() {
            answer.push_str(&tail.emit);
            if !em.token(&tail.emit).await {
                return Ok(None);
            }
        }
        match tail.signal {
            Some(Signal::Marker(line)) => self.marker_flow(req, em, prepared, &line).await,
            Some(Signal::Cutoff) => self.reroute_flow(req, em, prepared).await,
            None => Ok(Some(self.meta(
                req,
                &prepared.first_fit,
                None,
                answer.trim_end().to_string(),
                0,
            ))),
        }
    }

    async fn marker_flow(
        &self,
        req: &ChatRequest,
        em: &mut Emitter,
        prepared: &Prepared,
        line: &str,
    ) -> Result<Option<AnswerMeta>> {
        match parse_marker(line) {
            Some(MarkerCommand::Recall(id)) => self.recall_flow(req, em, prepared, id).await,
            Some(MarkerCommand::Tool(kind, query)) if !query.trim().is_empty() => {
                debug!(kind = %kind, query = %query, "model requested a search");
                self.tool_flow(req, em, prepared, kind, query, 0).await
            }
            _ => {
                let (kind, query) = self.extract_query(req).await?;
                self.tool_flow(req, em, prepared, kind, query, 0).await
            }
        }
    }

    async fn reroute_flow(
        &self,
        req: &ChatRequest,
        em: &mut Emitter,
        prepared: &Prepared,
    ) -> Result<Option<AnswerMeta>> {
        info!(model = %req.model, "knowledge-gap admission, re-routing to search");
        if !em
            .status("rerouting", Some(REROUTING_MSG.to_string()))
            .await
        {
            return Ok(None);
        }
        let (kind, query) = self.extract_query(req).await?;
        self.tool_flow(req, em, prepared, kind, query, 1).await
    }

    async fn recall_flow(
        &self,
        req: &ChatRequest,
        em: &mut Emitter,
        prepared: &Prepared,
        id: u64,
    ) -> Result<Option<AnswerMeta>> {
        if !em
            .status("recalling", Some(RECALLING_MSG.to_string()))
            .await
        {
            return Ok(None);
        }
        if let Some(hit) = self.cache.recall(id) {
            debug!(search_id = id, "recall hit");
            return self
                .synthesize_stream(req, em, prepared, Retrieved::from_recall(hit), 0)
                .await;
        }
        info!(search_id = id, "recall miss, falling back to a fresh search");
        if !em
            .status("recall_failed", Some(RECALL_FAILED_MSG.to_string()))
            .await
        {
            return Ok(None);
        }
        let (kind, query) = self.extract_query(req).await?;
        self.tool_flow(req, em, prepared, kind, query, 0).await
    }

    async fn tool_flow(
        &self,
        req: &ChatRequest,
        em: &mut Emitter,
        prepared: &Prepared,
        kind: SearchKind,
        query: String,
        reroutes: u32,
    ) -> Result<Option<AnswerMeta>> {
        if !em
            .status("searching", Some(format!("Searching {kind} for: {query}")))
            .await
        {
            return Ok(None);
        }
        let ctx = self.acquire(req, prepared, kind, &query).await?;
        self.synthesize_stream(req, em, prepared, ctx, reroutes).await
    }

    /// Resolves search content: cache lookup, then a reserved fetch. The
    /// feasibility fit runs before any network is spent so a conversation
    /// that cannot hold the content class fails fast.
    async fn acquire(
        &self,
        req: &ChatRequest,
        prepared: &Prepared,
        kind: SearchKind,
        query: &str,
    ) -> Result<Retrieved> {
        if let Some(hit) = self.cache.lookup(Namespace::Query, kind, query) {
            return Ok(Retrieved::from_hit(kind, query, hit));
        }

        tokens::fit(
            self.budgets.budget_for(&req.model),
            &prepared.system_prompt,
            req.user_memory.as_deref(),
            &req.prompt,
            &prepared.history,
            reserve_class(kind),
        )?;

        let _guard = self.cache.reserve(Namespace::Query, kind, query).await;
        // A racer may have populated the entry while we waited on the guard.
        if let Some(hit) = self.cache.lookup(Namespace::Query, kind, query) {
            return Ok(Retrieved::from_hit(kind, query, hit));
        }

        let retrieval = self
            .fetcher
            .retrieve(kind, query, content_char_cap(&req.model))
            .await;
        let Retrieval {
            kind,
            query,
            contents,
            summaries,
            text,
            source,
            cacheable,
        } = retrieval;

        let search_id = if cacheable {
            Some(
                self.cache
                    .admit(Namespace::Query, kind, &query, contents, summaries, None)
                    .await,
            )
        } else {
            None
        };

        Ok(Retrieved {
            kind,
            query,
            text,
            source,
            search_id,
        })
    }

    async fn synthesize_stream(
        &self,
        req: &ChatRequest,
        em: &mut Emitter,
        prepared: &Prepared,
        ctx: Retrieved,
        reroutes: u32,
    ) -> Result<Option<AnswerMeta>> {
        if let Some(host) = ctx.source.as_deref().and_then(first_host) {
            if !em
                .status(
                    "reading_content",
                    Some(format!("Reading content from {host}")),
                )
                .await
            {
                return Ok(None);
            }
        }
        if !em.status("generating", None).await {
            return Ok(None);
        }

        let results_prompt = prompts::results_prompt(&ctx.text);
        let refit = tokens::refit_with_content(
            self.budgets.budget_for(&req.model),
            &results_prompt,
            req.user_memory.as_deref(),
            &req.prompt,
            &prepared.history,
        )?;

        let gen = self.gen_request(&req.model, refit.turns.clone());
        let mut stream = self.backend.chat_stream(&gen).await?;
        // Strip-only here: a marker inside synthesis is removed from the
        // visible text but never dispatched again.
        let mut sanitizer = StreamSanitizer::strip_only();
        let mut answer = String::new();

        while let Some(token) = stream.next().await {
            let push = sanitizer.push(&token?);
            if !push.emit.is_empty() {
                answer.push_str(&push.emit);
                if !em.token(&push.emit).await {
                    return Ok(None);
                }
            }
        }
        let tail = sanitizer.finish();
        if !tail.emit.is_empty() {
            answer.push_str(&tail.emit);
            if !em.token(&tail.emit).await {
                return Ok(None);
            }
        }

        Ok(Some(self.meta(
            req,
            &refit,
            Some(&ctx),
            answer.trim_end().to_string(),
            reroutes,
        )))
    }

    async fn synthesize_full(
        &self,
        req: &ChatRequest,
        prepared: &Prepared,
        ctx: Retrieved,
        reroutes: u32,
    ) -> Result<AnswerMeta> {
        let results_prompt = prompts::results_prompt(&ctx.text);
        let refit = tokens::refit_with_content(
            self.budgets.budget_for(&req.model),
            &results_prompt,
            req.user_memory.as_deref(),
            &req.prompt,
            &prepared.history,
        )?;
        let gen = self.gen_request(&req.model, refit.turns.clone());
        let raw = self.backend.chat(&gen).await?;
        Ok(self.meta(req, &refit, Some(&ctx), clean_response(&raw), reroutes))
    }

    /// One extraction call turning the user question into a marker line.
    /// An unusable reply falls back to a web search of the prompt itself.
    async fn extract_query(&self, req: &ChatRequest) -> Result<(SearchKind, String)> {
        let gen = self.gen_request(
            &req.model,
            vec![
                ChatTurn::system(prompts::extraction_prompt()),
                ChatTurn::user(req.prompt.as_str()),
            ],
        );
        let line = self.backend.chat(&gen).await?;
        Ok(match parse_marker(&line) {
            Some(MarkerCommand::Tool(kind, query)) if !query.trim().is_empty() => (kind, query),
            _ => (SearchKind::Web, req.prompt.trim().to_string()),
        })
    }

    fn prepare(&self, req: &ChatRequest) -> Result<Prepared> {
        let start = req.history.len().saturating_sub(self.history_cap);
        let history: Vec<ChatTurn> = req.history[start..].to_vec();
        let system_prompt = prompts::system_prompt(&req.model, req.system_prompt.as_deref());
        let first_fit = tokens::fit(
            self.budgets.budget_for(&req.model),
            &system_prompt,
            req.user_memory.as_deref(),
            &req.prompt,
            &history,
            ReserveClass::None,
        )?;
        Ok(Prepared {
            history,
            system_prompt,
            first_fit,
        })
    }

    fn gen_request(&self, model: &str, messages: Vec<ChatTurn>) -> GenRequest {
        GenRequest {
            timeout_ms: self.generation_timeout_ms,
            ..GenRequest::new(model, messages)
        }
    }

    fn meta(
        &self,
        req: &ChatRequest,
        fit: &FitOutcome,
        ctx: Option<&Retrieved>,
        response: String,
        reroutes: u32,
    ) -> AnswerMeta {
        AnswerMeta {
            model: req.model.clone(),
            response,
            context_messages: fit.turns.len().saturating_sub(1),
            search_performed: ctx.is_some(),
            search_kind: ctx.map(|c| c.kind),
            search_query: ctx.map(|c| c.query.clone()),
            source: ctx.and_then(|c| c.source.clone()),
            search_id: ctx.and_then(|c| c.search_id),
            cutoff_retries: reroutes,
            tokens: fit.budget.usage(),
        }
    }
}
