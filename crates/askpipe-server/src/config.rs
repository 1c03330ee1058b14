//! Server settings, read once from environment at startup.
//!
//! Everything has a default that works on a laptop with a local Ollama;
//! the `ASKPIPE_*` variables exist for overriding in containers.

use std::collections::HashMap;
use std::path::PathBuf;

use askpipe_local::similarity::SimilarityConfig;
use askpipe_local::tokens::ModelBudgets;

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_usize(key: &str, default: usize) -> usize {
    env_nonempty(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env_nonempty(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    env_nonempty(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match env_nonempty(key).as_deref() {
        Some(v) => matches!(v.trim(), "1" | "true" | "yes" | "on"),
        None => default,
    }
}

pub fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("askpipe-cache")
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub cache_dir: PathBuf,
    pub cache_max_entries: usize,
    pub similarity_threshold: f64,
    pub max_hamming: u32,
    pub use_synonyms: bool,
    pub max_synonyms: usize,
    pub fetch_concurrency: usize,
    /// Per-request generation deadline; `None` waits as long as Ollama does.
    pub generation_timeout_ms: Option<u64>,
    pub context_safety: f64,
    pub default_context: usize,
    pub model_contexts: HashMap<String, usize>,
    pub history_cap: usize,
    /// When unset, the API is open and the auth layer waves everything past.
    pub api_key: Option<String>,
}

impl Settings {
    pub fn from_env() -> Self {
        let generation_timeout_ms = match env_u64("ASKPIPE_GENERATION_TIMEOUT_MS", 120_000) {
            0 => None,
            ms => Some(ms),
        };
        Settings {
            cache_dir: env_nonempty("ASKPIPE_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(default_cache_dir),
            cache_max_entries: env_usize("ASKPIPE_CACHE_MAX_ENTRIES", 500),
            similarity_threshold: env_f64("ASKPIPE_SIMILARITY_THRESHOLD", 0.80).clamp(0.0, 1.0),
            max_hamming: env_u64("ASKPIPE_SIMHASH_MAX_DISTANCE", 24) as u32,
            use_synonyms: env_bool("ASKPIPE_SYNONYMS", true),
            max_synonyms: env_usize("ASKPIPE_MAX_SYNONYMS", 5),
            fetch_concurrency: env_usize(
                "ASKPIPE_FETCH_CONCURRENCY",
                askpipe_local::fetch::DEFAULT_FETCH_CONCURRENCY,
            ),
            generation_timeout_ms,
            context_safety: env_f64("ASKPIPE_CONTEXT_SAFETY", 0.8),
            default_context: env_usize("ASKPIPE_DEFAULT_CONTEXT", 8192),
            model_contexts: env_nonempty("ASKPIPE_MODEL_CONTEXTS")
                .map(|spec| ModelBudgets::parse_table(&spec))
                .unwrap_or_default(),
            history_cap: env_usize("ASKPIPE_HISTORY_CAP", 30),
            api_key: env_nonempty("ASKPIPE_API_KEY"),
        }
    }

    pub fn similarity(&self) -> SimilarityConfig {
        SimilarityConfig {
            threshold: self.similarity_threshold,
            max_hamming: self.max_hamming,
            use_synonyms: self.use_synonyms,
            max_synonyms: self.max_synonyms,
        }
    }

    pub fn budgets(&self) -> ModelBudgets {
        ModelBudgets::new(
            self.model_contexts.clone(),
            self.default_context,
            self.context_safety,
        )
    }
}
