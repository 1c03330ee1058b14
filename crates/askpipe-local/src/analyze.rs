//! Request and response analysis: explicit search-intent routing, the
//! recency pre-flight, marker-line parsing, and knowledge-gap detection.

use std::sync::OnceLock;

use regex::{Regex, RegexBuilder};

use askpipe_core::SearchKind;

/// Model output matching any of these admits a knowledge gap and warrants a
/// re-route to live search.
const CUTOFF_PHRASES: [&str; 20] = [
    r"knowledge cutoff",
    r"knowledge cut-off",
    r"don't have information on.*after",
    r"don't have.*up-to-date",
    r"can't provide.*current",
    r"information may be outdated",
    r"don't know.*after",
    r"real-time access",
    r"no specific",
    r"no such thing",
    r"couldn't find",
    r"not officially",
    r"not aware of",
    r"no official",
    r"available yet",
    r"not aware of.*event",
    r"don't have information",
    r"occurred after my",
    r"my training data",
    r"don't have.*recent",
];

/// Prompt keywords that flag a request as time-sensitive before any
/// generation call is spent on it.
const TEMPORAL_KEYWORDS: [&str; 15] = [
    "2025",
    "2026",
    "latest",
    "recent",
    "current",
    "today",
    "yesterday",
    "this week",
    "this month",
    "this year",
    "now",
    "right now",
    "breaking",
    "last week",
    "last month",
];

/// Models below this parameter count get the simplified system prompt.
const SMALL_MODEL_PARAM_B: f64 = 4.0;

/// A parsed marker line from generation output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkerCommand {
    /// Typed tool request, e.g. `WEATHER: Boston`.
    Tool(SearchKind, String),
    /// Reference to a previously admitted search result.
    Recall(u64),
}

fn cutoff_patterns() -> &'static Vec<Regex> {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        CUTOFF_PHRASES
            .iter()
            .map(|p| {
                RegexBuilder::new(p)
                    .case_insensitive(true)
                    .build()
                    .expect("valid cutoff pattern")
            })
            .collect()
    })
}

fn recall_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(?:RECALL:|\[search_id:)\s*(\d+)").expect("valid regex")
    })
}

fn typed_marker_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(WEATHER|GOOGLE|REDDIT|WIKI|WIKIPEDIA):\s*(.+?)(?:\n|$)")
            .expect("valid regex")
    })
}

fn bare_search_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)SEARCH:\s*(.+?)(?:\n|$)").expect("valid regex"))
}

fn tag_cleanup_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(WEATHER|GOOGLE|REDDIT|WIKI|WIKIPEDIA|SEARCH):\s*.+?(?:\n|$)")
            .expect("valid regex")
    })
}

fn param_size_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+\.?\d*)b").expect("valid regex"))
}

/// True when the text admits the model lacks current or post-training
/// information.
pub fn admits_knowledge_gap(text: &str) -> bool {
    cutoff_patterns().iter().any(|re| re.is_match(text))
}

/// Parses a marker line into a command. Recall references win over typed
/// tool markers; a bare `SEARCH:` falls back to a web search with whatever
/// query text follows it. `None` means the line carries no usable command
/// and the caller should extract a query with a dedicated generation call.
pub fn parse_marker(text: &str) -> Option<MarkerCommand> {
    if let Some(caps) = recall_re().captures(text) {
        if let Ok(id) = caps[1].parse::<u64>() {
            return Some(MarkerCommand::Recall(id));
        }
    }

    if let Some(caps) = typed_marker_re().captures(text) {
        let kind = match caps[1].to_ascii_uppercase().as_str() {
            "WEATHER" => SearchKind::Weather,
            "REDDIT" => SearchKind::Reddit,
            "WIKI" | "WIKIPEDIA" => SearchKind::Wikipedia,
            _ => SearchKind::Web,
        };
        return Some(MarkerCommand::Tool(kind, unquote(&caps[2])));
    }

    if let Some(caps) = bare_search_re().captures(text) {
        let query = unquote(&caps[1]);
        if !query.is_empty() {
            return Some(MarkerCommand::Tool(SearchKind::Web, query));
        }
    }

    None
}

fn unquote(raw: &str) -> String {
    raw.trim().trim_matches('"').trim_matches('\'').to_string()
}

/// Explicit search intent stated in the prompt itself, checked before any
/// generation call. Returns the tool kind and the query to run (the prompt
/// as given).
pub fn direct_intent(prompt: &str) -> Option<(SearchKind, String)> {
    let lower = prompt.to_lowercase();
    let reddit = ["reddit", "people think", "opinions", "people saying about", "opinion", "reviews"];
    if reddit.iter().any(|kw| lower.contains(kw)) {
        return Some((SearchKind::Reddit, prompt.to_string()));
    }
    if lower.contains("wikipedia") || lower.contains("wiki") {
        return Some((SearchKind::Wikipedia, prompt.to_string()));
    }
    let recency = ["recent", "latest", "2025", "2026", "this year"];
    if recency.iter().any(|kw| lower.contains(kw)) {
        return Some((SearchKind::Web, prompt.to_string()));
    }
    None
}

/// Recency pre-flight: does the prompt carry a temporal marker that makes a
/// stale direct answer likely useless?
pub fn preflight_needs_search(prompt: &str) -> bool {
    let lower = prompt.to_lowercase();
    TEMPORAL_KEYWORDS.iter().any(|kw| lower.contains(kw))
}

/// Strips marker lines out of a finished response. Falls back to the input
/// when stripping would leave nothing.
pub fn clean_response(text: &str) -> String {
    let cleaned = tag_cleanup_re().replace_all(text, "").trim().to_string();
    if cleaned.is_empty() {
        text.to_string()
    } else {
        cleaned
    }
}

/// Parameter count in billions parsed from a model name, e.g.
/// `llama3.2:3b` -> 3.0.
pub fn param_billions(model: &str) -> Option<f64> {
    let lower = model.to_lowercase();
    param_size_re()
        .captures(&lower)
        .and_then(|caps| caps[1].parse::<f64>().ok())
}

/// Small models get the simplified marker prompt and the pre-flight path.
pub fn is_small_model(model: &str) -> bool {
    let lower = model.to_lowercase();
    if ["tiny", "mini", "small"].iter().any(|kw| lower.contains(kw)) {
        return true;
    }
    match param_billions(model) {
        Some(size) => size < SMALL_MODEL_PARAM_B,
        None => false,
    }
}

/// How much retrieved content a model can usefully digest, in characters.
pub fn content_char_cap(model: &str) -> usize {
    match param_billions(model) {
        Some(size) if size >= 12.0 => 8000,
        _ => 4000,
    }
}
