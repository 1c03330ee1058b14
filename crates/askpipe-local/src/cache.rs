//! Similarity-keyed result cache with TTL and an LRU capacity bound.
//!
//! Two namespaces share one store: `Query` holds composed search results
//! keyed by (kind, cleaned query) and answers fuzzy lookups through the
//! similarity scorer; `Url` holds per-page extracted text keyed by exact
//! URL only. Entries persist as one JSON file each under a sharded
//! directory; a missing or corrupt file is skipped at load, never an
//! error on the request path.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex as TokioMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use askpipe_core::SearchKind;

use crate::now_epoch_s;
use crate::similarity::{score, SimilarityConfig, SimilaritySignature};

pub const DEFAULT_MAX_ENTRIES: usize = 500;

/// Seconds a result stays servable, by search kind. Weather goes stale in
/// minutes; encyclopedia content lasts days.
pub fn ttl_for(kind: SearchKind) -> u64 {
    match kind {
        SearchKind::Weather => 30 * 60,
        SearchKind::Web => 15 * 60 * 60,
        SearchKind::Reddit => 8 * 60 * 60,
        SearchKind::Wikipedia => 5 * 24 * 60 * 60,
        SearchKind::Recall => 2 * 60 * 60,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Namespace {
    Query,
    Url,
}

impl Namespace {
    fn dir(&self) -> &'static str {
        match self {
            Namespace::Query => "query",
            Namespace::Url => "url",
        }
    }
}

fn site_filter_re() -> &'static regex::Regex {
    static RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"(?i)site:\S+\s*").expect("valid site filter pattern"))
}

/// Strip `site:` operators so the same question with and without a domain
/// filter shares one entry.
pub fn clean_query(query: &str) -> String {
    site_filter_re().replace_all(query, "").trim().to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentBlock {
    pub url: String,
    pub text: String,
}

impl ContentBlock {
    pub fn new(url: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub schema_version: u32,
    pub search_id: u64,
    pub namespace: Namespace,
    pub kind: SearchKind,
    pub query: String,
    pub contents: Vec<ContentBlock>,
    pub summaries: Option<String>,
    /// Domains the contents were drawn from.
    pub sources: Vec<String>,
    pub created_at: u64,
    pub expires_at: u64,
}

impl CacheEntry {
    fn combined_text(&self) -> String {
        combine_text(&self.contents, self.summaries.as_deref())
    }

    fn source_urls(&self) -> Option<String> {
        let urls: Vec<&str> = self
            .contents
            .iter()
            .map(|b| b.url.as_str())
            .filter(|u| !u.is_empty())
            .collect();
        if urls.is_empty() {
            None
        } else {
            Some(urls.join(", "))
        }
    }
}

/// Content blocks in admitted order, then summaries, blank-line joined.
/// A fresh retrieval and a later hit on its entry serve the same text.
pub(crate) fn combine_text(contents: &[ContentBlock], summaries: Option<&str>) -> String {
    let mut parts: Vec<&str> = contents
        .iter()
        .filter(|b| !b.text.is_empty())
        .map(|b| b.text.as_str())
        .collect();
    if let Some(s) = summaries {
        parts.push(s);
    }
    parts.join("\n\n")
}

/// A servable lookup result. `exact` is false for similarity matches.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheHit {
    pub text: String,
    pub source: Option<String>,
    pub search_id: u64,
    pub kind: SearchKind,
    pub query: String,
    pub exact: bool,
    pub score: f64,
}

struct StoredEntry {
    entry: CacheEntry,
    sig: SimilaritySignature,
    hits: u64,
    /// Monotonic per-process tick, not wall time; drives LRU deterministically.
    last_access: u64,
}

struct CacheState {
    entries: HashMap<String, StoredEntry>,
    next_search_id: u64,
    tick: u64,
}

impl CacheState {
    fn touch(&mut self, fp: &str) {
        self.tick += 1;
        let tick = self.tick;
        if let Some(stored) = self.entries.get_mut(fp) {
            stored.hits += 1;
            stored.last_access = tick;
        }
    }
}

pub struct SimilarityCache {
    cfg: SimilarityConfig,
    max_entries: usize,
    root: Option<PathBuf>,
    state: StdMutex<CacheState>,
    locks: Arc<StdMutex<HashMap<String, Arc<TokioMutex<()>>>>>,
}

/// Holder of the exclusive right to populate one cache key. Racers awaiting
/// the same key block in `reserve` until this guard drops, then re-lookup
/// and reuse the admitted entry instead of fetching again.
pub struct PopulateGuard {
    fp: String,
    lock: Arc<TokioMutex<()>>,
    permit: Option<OwnedMutexGuard<()>>,
    locks: Arc<StdMutex<HashMap<String, Arc<TokioMutex<()>>>>>,
}

impl Drop for PopulateGuard {
    fn drop(&mut self) {
        // Release the mutex before deciding whether to reap its map slot.
        drop(self.permit.take());
        let mut map = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = map.get(&self.fp) {
            // Two strong refs mean the map's and ours: nobody is waiting.
            if Arc::ptr_eq(existing, &self.lock) && Arc::strong_count(existing) <= 2 {
                map.remove(&self.fp);
            }
        }
    }
}

impl SimilarityCache {
    pub fn new(root: Option<PathBuf>) -> Self {
        Self::with_config(root, DEFAULT_MAX_ENTRIES, SimilarityConfig::default())
    }

    pub fn with_config(root: Option<PathBuf>, max_entries: usize, cfg: SimilarityConfig) -> Self {
        let mut state = CacheState {
            entries: HashMap::new(),
            next_search_id: 0,
            tick: 0,
        };
        if let Some(root) = &root {
            load_from_disk(root, &mut state);
            info!(
                root = %root.display(),
                entries = state.entries.len(),
                "cache loaded"
            );
        }
        Self {
            cfg,
            max_entries: max_entries.max(1),
            root,
            state: StdMutex::new(state),
            locks: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Population locks currently outstanding. Diagnostic only.
    pub fn pending_populations(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn normalized_key(ns: Namespace, key: &str) -> String {
        match ns {
            Namespace::Query => clean_query(key),
            Namespace::Url => key.to_string(),
        }
    }

    fn fingerprint(ns: Namespace, kind: SearchKind, key: &str) -> String {
        let mut h = Sha256::new();
        h.update(ns.dir().as_bytes());
        h.update(b":");
        match ns {
            Namespace::Query => {
                h.update(kind.as_str().as_bytes());
                h.update(b":");
                h.update(key.trim().to_lowercase().as_bytes());
            }
            Namespace::Url => h.update(key.as_bytes()),
        }
        hex::encode(h.finalize())
    }

    /// Exact fingerprint match first, then a similarity scan within the same
    /// namespace and kind. Returns `None` for misses and expired entries.
    pub fn lookup(&self, ns: Namespace, kind: SearchKind, key: &str) -> Option<CacheHit> {
        let key = Self::normalized_key(ns, key);
        let fp = Self::fingerprint(ns, kind, &key);
        let now = now_epoch_s();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(stored) = state.entries.get(&fp) {
            if stored.entry.expires_at > now {
                let hit = hit_from(&stored.entry, true, 1.0);
                state.touch(&fp);
                info!(kind = %kind, query = %truncated(&key, 50), "cache hit (exact)");
                return Some(hit);
            }
            state.entries.remove(&fp);
        }

        if ns == Namespace::Url {
            debug!(url = %truncated(&key, 80), "cache miss (url)");
            return None;
        }

        let probe = SimilaritySignature::compute(&key);
        let mut best: Option<(String, f64, u64)> = None;
        for (cand_fp, stored) in state.entries.iter() {
            if stored.entry.namespace != ns
                || stored.entry.kind != kind
                || stored.entry.expires_at <= now
            {
                continue;
            }
            let Some(s) = score(&probe, &stored.sig, &self.cfg) else {
                continue;
            };
            if s < self.cfg.threshold {
                continue;
            }
            let better = match &best {
                None => true,
                Some((_, bs, bt)) => s > *bs || (s == *bs && stored.last_access > *bt),
            };
            if better {
                best = Some((cand_fp.clone(), s, stored.last_access));
            }
        }

        if let Some((best_fp, best_score, _)) = best {
            let stored = state.entries.get(&best_fp)?;
            let hit = hit_from(&stored.entry, false, best_score);
            info!(
                kind = %kind,
                score = best_score,
                cached = %truncated(&hit.query, 40),
                query = %truncated(&key, 40),
                "cache hit (fuzzy)"
            );
            state.touch(&best_fp);
            return Some(hit);
        }

        debug!(kind = %kind, query = %truncated(&key, 50), "cache miss");
        None
    }

    /// Store a result and return its recall id. Persistence failures degrade
    /// to in-memory only.
    pub async fn admit(
        &self,
        ns: Namespace,
        kind: SearchKind,
        key: &str,
        contents: Vec<ContentBlock>,
        summaries: Option<String>,
        ttl_s: Option<u64>,
    ) -> u64 {
        let key = Self::normalized_key(ns, key);
        let fp = Self::fingerprint(ns, kind, &key);
        let now = now_epoch_s();
        let ttl = ttl_s.unwrap_or_else(|| ttl_for(kind));

        let sources = contents
            .iter()
            .filter_map(|b| url::Url::parse(&b.url).ok())
            .filter_map(|u| u.host_str().map(|h| h.to_string()))
            .collect();

        let (entry, evicted_fps) = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let evicted = evict_for_capacity(&mut state, self.max_entries);

            state.next_search_id += 1;
            state.tick += 1;
            let entry = CacheEntry {
                schema_version: 1,
                search_id: state.next_search_id,
                namespace: ns,
                kind,
                query: key.clone(),
                contents,
                summaries,
                sources,
                created_at: now,
                expires_at: now + ttl,
            };
            let stored = StoredEntry {
                entry: entry.clone(),
                sig: SimilaritySignature::compute(&key),
                hits: 0,
                last_access: state.tick,
            };
            state.entries.insert(fp.clone(), stored);
            (entry, evicted)
        };

        info!(
            search_id = entry.search_id,
            kind = %kind,
            query = %truncated(&key, 50),
            urls = entry.contents.len(),
            ttl_min = ttl / 60,
            "cache set"
        );

        if let Some(root) = &self.root {
            let path = entry_path(root, ns, &fp);
            let evicted_paths: Vec<PathBuf> = evicted_fps
                .iter()
                .map(|(e_ns, e_fp)| entry_path(root, *e_ns, e_fp))
                .collect();
            match serde_json::to_vec(&entry) {
                Ok(bytes) => {
                    let write = tokio::task::spawn_blocking(move || {
                        for p in evicted_paths {
                            let _ = std::fs::remove_file(p);
                        }
                        write_entry_file(&path, &bytes)
                    })
                    .await;
                    match write {
                        Ok(Err(e)) => warn!(error = %e, "cache persist failed"),
                        Err(e) => warn!(error = %e, "cache persist task failed"),
                        Ok(Ok(())) => {}
                    }
                }
                Err(e) => warn!(error = %e, "cache entry serialize failed"),
            }
        }

        entry.search_id
    }

    /// Fetch by recall id, any namespace.
    pub fn recall(&self, search_id: u64) -> Option<CacheHit> {
        let now = now_epoch_s();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let fp = state
            .entries
            .iter()
            .find(|(_, s)| s.entry.search_id == search_id && s.entry.expires_at > now)
            .map(|(fp, _)| fp.clone())?;
        let hit = hit_from(&state.entries[&fp].entry, true, 1.0);
        state.touch(&fp);
        info!(search_id, "cache recall");
        Some(hit)
    }

    pub fn invalidate(&self, ns: Namespace, kind: SearchKind, key: &str) -> bool {
        let key = Self::normalized_key(ns, key);
        let fp = Self::fingerprint(ns, kind, &key);
        let removed = self
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .remove(&fp)
            .is_some();
        if removed {
            if let Some(root) = &self.root {
                let _ = std::fs::remove_file(entry_path(root, ns, &fp));
            }
        }
        removed
    }

    /// Metadata of the newest entries, for diagnostics.
    pub fn recent(&self, n: usize) -> Vec<RecentSearch> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut entries: Vec<&StoredEntry> = state.entries.values().collect();
        entries.sort_by(|a, b| b.entry.created_at.cmp(&a.entry.created_at));
        entries
            .into_iter()
            .take(n)
            .map(|s| RecentSearch {
                search_id: s.entry.search_id,
                kind: s.entry.kind,
                query: s.entry.query.clone(),
                created_at: s.entry.created_at,
            })
            .collect()
    }

    /// Drop every expired entry now instead of waiting for lazy removal.
    pub fn sweep_expired(&self) -> usize {
        let now = now_epoch_s();
        let removed: Vec<(Namespace, String)> = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let dead: Vec<String> = state
                .entries
                .iter()
                .filter(|(_, s)| s.entry.expires_at <= now)
                .map(|(fp, _)| fp.clone())
                .collect();
            dead.into_iter()
                .filter_map(|fp| {
                    let ns = state.entries.get(&fp).map(|s| s.entry.namespace)?;
                    state.entries.remove(&fp);
                    Some((ns, fp))
                })
                .collect()
        };
        if let Some(root) = &self.root {
            for (ns, fp) in &removed {
                let _ = std::fs::remove_file(entry_path(root, *ns, fp));
            }
        }
        if !removed.is_empty() {
            debug!(count = removed.len(), "cache evicted expired entries");
        }
        removed.len()
    }

    pub fn clear(&self) {
        let count = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let count = state.entries.len();
            state.entries.clear();
            count
        };
        if let Some(root) = &self.root {
            for ns in [Namespace::Query, Namespace::Url] {
                let _ = std::fs::remove_dir_all(root.join(ns.dir()));
            }
        }
        info!(count, "cache cleared");
    }

    /// Acquire the exclusive right to populate `key`. The first caller gets
    /// the guard immediately; concurrent callers for the same key wait here,
    /// then should re-`lookup` before fetching anything themselves.
    pub async fn reserve(&self, ns: Namespace, kind: SearchKind, key: &str) -> PopulateGuard {
        let key = Self::normalized_key(ns, key);
        let fp = Self::fingerprint(ns, kind, &key);
        let lock = {
            let mut map = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            map.entry(fp.clone())
                .or_insert_with(|| Arc::new(TokioMutex::new(())))
                .clone()
        };
        let permit = lock.clone().lock_owned().await;
        PopulateGuard {
            fp,
            lock,
            permit: Some(permit),
            locks: self.locks.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecentSearch {
    pub search_id: u64,
    pub kind: SearchKind,
    pub query: String,
    pub created_at: u64,
}

fn hit_from(entry: &CacheEntry, exact: bool, score: f64) -> CacheHit {
    CacheHit {
        text: entry.combined_text(),
        source: entry.source_urls(),
        search_id: entry.search_id,
        kind: entry.kind,
        query: entry.query.clone(),
        exact,
        score,
    }
}

fn truncated(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// Remove ~10% of the least recently used entries once the store is full.
/// Returns (namespace, fingerprint) pairs for file cleanup.
fn evict_for_capacity(state: &mut CacheState, max_entries: usize) -> Vec<(Namespace, String)> {
    if state.entries.len() < max_entries {
        return Vec::new();
    }
    let to_remove = (max_entries / 10).max(1);
    let mut by_access: Vec<(String, u64)> = state
        .entries
        .iter()
        .map(|(fp, s)| (fp.clone(), s.last_access))
        .collect();
    by_access.sort_by_key(|(_, t)| *t);

    let mut removed = Vec::new();
    for (fp, _) in by_access.into_iter().take(to_remove) {
        if let Some(stored) = state.entries.remove(&fp) {
            removed.push((stored.entry.namespace, fp));
        }
    }
    debug!(count = removed.len(), "cache evicted lru entries");
    removed
}

fn entry_path(root: &Path, ns: Namespace, fp: &str) -> PathBuf {
    root.join(ns.dir()).join(&fp[0..2]).join(format!("{fp}.json"))
}

fn write_entry_file(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)
}

fn load_from_disk(root: &Path, state: &mut CacheState) {
    let now = now_epoch_s();
    for ns in [Namespace::Query, Namespace::Url] {
        let dir = root.join(ns.dir());
        let Ok(shards) = std::fs::read_dir(&dir) else {
            continue;
        };
        for shard in shards.flatten() {
            let Ok(files) = std::fs::read_dir(shard.path()) else {
                continue;
            };
            for file in files.flatten() {
                let path = file.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let Ok(bytes) = std::fs::read(&path) else {
                    continue;
                };
                let entry: CacheEntry = match serde_json::from_slice(&bytes) {
                    Ok(e) => e,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "skipping unreadable cache file");
                        continue;
                    }
                };
                if entry.expires_at <= now {
                    let _ = std::fs::remove_file(&path);
                    continue;
                }
                let fp = match path.file_stem().and_then(|s| s.to_str()) {
                    Some(s) => s.to_string(),
                    None => continue,
                };
                state.next_search_id = state.next_search_id.max(entry.search_id);
                state.tick += 1;
                let sig = SimilaritySignature::compute(&entry.query);
                state.entries.insert(
                    fp,
                    StoredEntry {
                        entry,
                        sig,
                        hits: 0,
                        last_access: state.tick,
                    },
                );
            }
        }
    }
}
