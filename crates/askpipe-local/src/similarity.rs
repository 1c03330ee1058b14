use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

/// Knobs for approximate query matching. The SimHash gate is conjunctive
/// with the score threshold: candidates past the Hamming bound are never
/// scored.
#[derive(Debug, Clone)]
pub struct SimilarityConfig {
    pub threshold: f64,
    /// Trigram digests of reworded queries land around distance 10-16,
    /// unrelated text around 32. The bound must sit between the two.
    pub max_hamming: u32,
    pub use_synonyms: bool,
    /// Upper bound on synonym tokens added per expanded set.
    pub max_synonyms: usize,
}

impl Default for SimilarityConfig {
    fn default() -> Self {
        Self {
            threshold: 0.80,
            max_hamming: 24,
            use_synonyms: true,
            max_synonyms: 5,
        }
    }
}

/// Fold case and punctuation and drop `site:` filters so equivalent
/// phrasings produce the same key material.
pub fn normalize(text: &str) -> String {
    let mut words: Vec<String> = Vec::new();
    for raw in text.split_whitespace() {
        if raw.to_ascii_lowercase().starts_with("site:") {
            continue;
        }
        let mut cleaned = String::new();
        for c in raw.chars() {
            if c.is_alphanumeric() {
                cleaned.extend(c.to_lowercase());
            } else {
                cleaned.push(' ');
            }
        }
        for w in cleaned.split_whitespace() {
            words.push(w.to_string());
        }
    }
    words.join(" ")
}

/// Word tokens of the normalized text. Very short words carry little
/// signal and are dropped unless nothing longer remains.
pub fn tokenize(text: &str) -> Vec<String> {
    let norm = normalize(text);
    let words: Vec<String> = norm.split_whitespace().map(|w| w.to_string()).collect();
    let long: Vec<String> = words
        .iter()
        .filter(|w| w.chars().count() > 2)
        .cloned()
        .collect();
    if long.is_empty() {
        words
    } else {
        long
    }
}

pub fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

pub fn cosine(a: &HashMap<String, f64>, b: &HashMap<String, f64>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let mut dot = 0.0;
    for (k, av) in a {
        if let Some(bv) = b.get(k) {
            dot += av * bv;
        }
    }
    let na: f64 = a.values().map(|v| v * v).sum::<f64>().sqrt();
    let nb: f64 = b.values().map(|v| v * v).sum::<f64>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

/// FNV-1a. Stable across processes, unlike `DefaultHasher`.
fn stable_hash64(bytes: &[u8]) -> u64 {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        h ^= u64::from(*b);
        h = h.wrapping_mul(0x0000_0100_0000_01b3);
    }
    h
}

fn bump(acc: &mut [i32; 64], h: u64) {
    for (i, slot) in acc.iter_mut().enumerate() {
        if (h >> i) & 1 == 1 {
            *slot += 1;
        } else {
            *slot -= 1;
        }
    }
}

/// 64-bit SimHash over character trigrams of the normalized text. Trigrams
/// give short queries enough features for the Hamming gate to be usable;
/// word-level features are too sparse there.
pub fn simhash64(text: &str) -> u64 {
    let norm = normalize(text);
    if norm.is_empty() {
        return 0;
    }
    let chars: Vec<char> = norm.chars().collect();
    let mut acc = [0i32; 64];
    if chars.len() < 3 {
        bump(&mut acc, stable_hash64(norm.as_bytes()));
    } else {
        for w in chars.windows(3) {
            let gram: String = w.iter().collect();
            bump(&mut acc, stable_hash64(gram.as_bytes()));
        }
    }
    let mut out = 0u64;
    for (i, v) in acc.iter().enumerate() {
        if *v > 0 {
            out |= 1u64 << i;
        }
    }
    out
}

pub fn hamming(a: u64, b: u64) -> u32 {
    (a ^ b).count_ones()
}

fn synonym_map() -> &'static HashMap<&'static str, &'static [&'static str]> {
    static MAP: OnceLock<HashMap<&'static str, &'static [&'static str]>> = OnceLock::new();
    MAP.get_or_init(|| {
        let entries: &[(&str, &[&str])] = &[
            ("latest", &["newest", "recent", "current"]),
            ("newest", &["latest", "new"]),
            ("recent", &["latest", "new"]),
            ("current", &["latest", "present"]),
            ("today", &["now", "currently"]),
            ("weather", &["forecast", "temperature", "conditions"]),
            ("forecast", &["weather"]),
            ("price", &["cost", "pricing"]),
            ("cost", &["price"]),
            ("news", &["headlines", "updates"]),
            ("updates", &["news", "headlines"]),
            ("buy", &["purchase"]),
            ("best", &["top", "greatest"]),
            ("fast", &["quick", "rapid"]),
            ("big", &["large", "huge"]),
            ("movie", &["film"]),
            ("film", &["movie"]),
            ("car", &["vehicle", "automobile"]),
            ("laptop", &["notebook"]),
            ("phone", &["smartphone", "mobile"]),
            ("review", &["reviews", "opinion", "rating"]),
            ("reviews", &["review", "opinions"]),
            ("opinion", &["opinions", "view"]),
            ("opinions", &["opinion", "views"]),
            ("cheap", &["affordable", "budget"]),
            ("error", &["bug", "issue", "problem"]),
            ("fix", &["repair", "solve"]),
            ("guide", &["tutorial", "howto"]),
            ("result", &["outcome", "score"]),
            ("game", &["match"]),
        ];
        entries.iter().copied().collect()
    })
}

/// Token set plus up to `cap` thesaurus synonyms of its members.
/// Expansion only ever adds match opportunities.
pub fn expand(tokens: &HashSet<String>, cap: usize) -> HashSet<String> {
    let mut out = tokens.clone();
    let mut added = 0usize;
    let mut sorted: Vec<&String> = tokens.iter().collect();
    sorted.sort();
    for t in sorted {
        if added >= cap {
            break;
        }
        if let Some(syns) = synonym_map().get(t.as_str()) {
            for s in syns.iter() {
                if added >= cap {
                    break;
                }
                if out.insert((*s).to_string()) {
                    added += 1;
                }
            }
        }
    }
    out
}

/// Precomputed match material for one cached key. Kept small enough to
/// persist alongside the entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilaritySignature {
    pub tokens: Vec<String>,
    pub simhash: u64,
}

impl SimilaritySignature {
    pub fn compute(text: &str) -> Self {
        Self {
            tokens: tokenize(text),
            simhash: simhash64(text),
        }
    }

    pub fn token_set(&self) -> HashSet<String> {
        self.tokens.iter().cloned().collect()
    }

    pub fn term_counts(&self) -> HashMap<String, f64> {
        let mut counts: HashMap<String, f64> = HashMap::new();
        for t in &self.tokens {
            *counts.entry(t.clone()).or_insert(0.0) += 1.0;
        }
        counts
    }
}

/// Composite similarity, or None when the SimHash gate rejects the pair.
/// The raw Jaccard term is always included so a pair over both gates can
/// never be scored below its plain token overlap.
pub fn score(
    a: &SimilaritySignature,
    b: &SimilaritySignature,
    cfg: &SimilarityConfig,
) -> Option<f64> {
    if hamming(a.simhash, b.simhash) > cfg.max_hamming {
        return None;
    }
    let mut s = jaccard(&a.token_set(), &b.token_set());
    s = s.max(cosine(&a.term_counts(), &b.term_counts()));
    if cfg.use_synonyms {
        s = s.max(jaccard(
            &expand(&a.token_set(), cfg.max_synonyms),
            &expand(&b.token_set(), cfg.max_synonyms),
        ));
    }
    Some(s)
}
