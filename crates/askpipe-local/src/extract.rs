//! HTML to clean text extraction tuned for feeding retrieved pages to a
//! generation model. Site-specific paths for encyclopedia articles and
//! discussion threads, a main-content heuristic for everything else.

use std::io::Cursor;
use std::sync::OnceLock;

use html_scraper::{ElementRef, Html, Selector};
use regex::Regex;

fn norm_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Prefix of `s` holding at most `max_chars` characters.
fn slice_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

fn class_or_id_lc(el: &ElementRef) -> String {
    let mut out = String::new();
    if let Some(c) = el.value().attr("class") {
        out.push_str(c);
        out.push(' ');
    }
    if let Some(i) = el.value().attr("id") {
        out.push_str(i);
    }
    out.to_ascii_lowercase()
}

fn element_text(el: &ElementRef) -> String {
    norm_ws(&el.text().collect::<Vec<_>>().join(" "))
}

fn first_text(doc: &Html, selector: &str) -> Option<String> {
    let sel = Selector::parse(selector).ok()?;
    doc.select(&sel)
        .next()
        .map(|el| element_text(&el))
        .filter(|t| !t.is_empty())
}

fn first_attr(doc: &Html, selector: &str, attr: &str) -> Option<String> {
    let sel = Selector::parse(selector).ok()?;
    doc.select(&sel)
        .next()
        .and_then(|el| el.value().attr(attr))
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn junk_text_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b(?:Jump to content|Main menu|move to sidebar|Navigation|Contents|Current events|Random article|About\s+(?:us|Wikipedia)|Contact\s+us|Donate|Skip to|Toggle.*?navigation|Sign in|Log in|Create account|Subscribe|Newsletter|Hamburger|Search|Advertisement|Cookie\s+(?:Policy|Settings|Notice)|Privacy\s+Policy|Terms\s+(?:of\s+)?(?:Service|Use)|All rights reserved|Copyright|Share|Tweet|Facebook|Twitter|LinkedIn)\b",
        )
        .expect("valid regex")
    })
}

fn spam_start_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^\s*(?:click|download|buy|subscribe|follow|sign up|register)\b")
            .expect("valid regex")
    })
}

fn url_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"https?://\S+").expect("valid regex"))
}

fn citation_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[\d+\]|\[\s*edit\s*\]").expect("valid regex"))
}

fn sentence_split_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[.!?]+").expect("valid regex"))
}

/// Extracts readable text from a page, choosing a site-specific strategy
/// when the URL identifies one. Output is bounded to `max_chars` and cut at
/// a sentence boundary where possible.
pub fn extract_text(html: &str, max_chars: usize, url: Option<&str>) -> String {
    if let Some(u) = url {
        if u.contains("wikipedia.org") {
            let text = extract_wikipedia(html, max_chars);
            if !text.is_empty() {
                return text;
            }
        } else if u.contains("reddit.com") {
            let text = extract_reddit(html, max_chars);
            if !text.is_empty() {
                return text;
            }
        }
    }
    extract_generic(html, max_chars)
}

fn inside_excluded_wiki_container(el: &ElementRef) -> bool {
    el.ancestors().filter_map(ElementRef::wrap).any(|a| {
        let s = class_or_id_lc(&a);
        ["infobox", "navbox", "reflist", "references", "toc", "catlinks"]
            .iter()
            .any(|bad| s.contains(bad))
    })
}

/// Article body only: headings become `Heading:` lines, short paragraphs,
/// citation markers, and navigation boxes are dropped.
fn extract_wikipedia(html: &str, max_chars: usize) -> String {
    let doc = Html::parse_document(html);
    let Some(root_sel) = Selector::parse("div.mw-parser-output").ok() else {
        return String::new();
    };
    let Some(root) = doc.select(&root_sel).next() else {
        return String::new();
    };
    let Some(sel) = Selector::parse("h2, h3, h4, p").ok() else {
        return String::new();
    };

    let excluded_headings = ["see also", "references", "external links", "notes"];
    let mut parts: Vec<String> = Vec::new();
    for el in root.select(&sel) {
        if inside_excluded_wiki_container(&el) {
            continue;
        }
        let text = citation_re().replace_all(&element_text(&el), "").to_string();
        let text = norm_ws(&text);
        if el.value().name().starts_with('h') {
            if char_len(&text) > 3 && !excluded_headings.contains(&text.to_lowercase().as_str()) {
                parts.push(format!("\n{text}:"));
            }
        } else if char_len(&text) > 50 {
            parts.push(text);
        }
    }

    let result = norm_ws(&parts.join(" "));
    if char_len(&result) > max_chars {
        truncate_at_sentence(&result, max_chars)
    } else {
        result
    }
}

/// Thread structure: post title, post body, then a handful of substantive
/// comments. Falls back to bare paragraphs when the markup is unfamiliar.
fn extract_reddit(html: &str, max_chars: usize) -> String {
    let doc = Html::parse_document(html);
    let mut parts: Vec<String> = Vec::new();

    let title = first_text(&doc, "h1")
        .or_else(|| first_attr(&doc, "shreddit-title", "title"))
        .or_else(|| first_attr(&doc, r#"meta[property="og:title"]"#, "content"));
    if let Some(title) = title {
        parts.push(format!("Post Title: {title}"));
    }

    if let Some(body) = reddit_post_body(&doc) {
        parts.push(format!("Post Body: {}", slice_chars(&body, 1000)));
    }

    let junk_keywords = [
        "reply",
        "share",
        "report",
        "save",
        "award",
        "upvote",
        "downvote",
        "sort by",
        "view discussions",
        "more replies",
    ];
    let mut comments = 0usize;
    for text in reddit_comment_texts(&doc).into_iter().take(10) {
        let lower = text.to_lowercase();
        if char_len(&text) > 60 && !junk_keywords.iter().any(|j| lower.contains(j)) {
            parts.push(format!("Comment: {}", slice_chars(&text, 500)));
            comments += 1;
            if comments >= 4 {
                break;
            }
        }
    }

    // Unfamiliar markup: take whatever substantive paragraphs exist.
    if parts.len() <= 1 {
        if let Ok(sel) = Selector::parse("p") {
            for el in doc.select(&sel).take(15) {
                let text = element_text(&el);
                if char_len(&text) > 60 {
                    parts.push(slice_chars(&text, 500).to_string());
                }
            }
        }
    }

    parts.truncate(8);
    let result = parts.join("\n\n");
    if char_len(&result) > max_chars {
        truncate_at_sentence(&result, max_chars)
    } else {
        result
    }
}

fn reddit_post_body(doc: &Html) -> Option<String> {
    if let Ok(sel) = Selector::parse("div") {
        for el in doc.select(&sel) {
            if class_or_id_lc(&el).contains("md") {
                let text = element_text(&el);
                if char_len(&text) > 50 {
                    return Some(text);
                }
            }
        }
    }
    for selector in ["shreddit-post", r#"div[data-test-id="post-content"]"#] {
        let Ok(sel) = Selector::parse(selector) else {
            continue;
        };
        if let Some(el) = doc.select(&sel).next() {
            let text = element_text(&el);
            if char_len(&text) > 50 {
                return Some(text);
            }
        }
    }
    None
}

fn reddit_comment_texts(doc: &Html) -> Vec<String> {
    if let Ok(sel) = Selector::parse("shreddit-comment") {
        let found: Vec<String> = doc.select(&sel).map(|el| element_text(&el)).collect();
        if !found.is_empty() {
            return found;
        }
    }
    let mut found = Vec::new();
    if let Ok(sel) = Selector::parse("div, p") {
        for el in doc.select(&sel) {
            if class_or_id_lc(&el).contains("comment") {
                found.push(element_text(&el));
            }
        }
    }
    found
}

/// Main-content pass for arbitrary pages: scope to the likeliest content
/// node, render to text, then strip navigation phrases and weak sentences.
fn extract_generic(html: &str, max_chars: usize) -> String {
    let scope = main_content_html(html).unwrap_or_else(|| html.to_string());
    let text = html2text::from_read(Cursor::new(scope.as_bytes()), 120)
        .unwrap_or_else(|_| scope.clone());

    let text = url_re().replace_all(&text, "");
    let text = junk_text_re().replace_all(&text, "");
    let text = filter_sentences(&norm_ws(&text));

    if char_len(&text) > max_chars {
        truncate_at_sentence(&text, max_chars)
    } else {
        text
    }
}

fn main_content_html(html: &str) -> Option<String> {
    let doc = Html::parse_document(html);
    for selector in ["article", "main"] {
        let sel = Selector::parse(selector).ok()?;
        if let Some(el) = doc.select(&sel).next() {
            return Some(el.html());
        }
    }
    let content_words = ["content", "article", "post", "entry"];
    let sel = Selector::parse("div").ok()?;
    for el in doc.select(&sel) {
        let s = class_or_id_lc(&el);
        if content_words.iter().any(|w| s.contains(w)) {
            return Some(el.html());
        }
    }
    None
}

/// Keeps only sentences long enough to carry information, dropping
/// promotional openers and scrollback artifacts.
fn filter_sentences(text: &str) -> String {
    let mut kept: Vec<&str> = Vec::new();
    for sentence in sentence_split_re().split(text) {
        let sentence = sentence.trim();
        if char_len(sentence) > 30
            && sentence.matches(' ').count() > 3
            && !spam_start_re().is_match(sentence)
            && !sentence.ends_with(">>>")
            && !sentence.ends_with("<<<")
        {
            kept.push(sentence);
        }
    }
    if kept.is_empty() {
        return String::new();
    }
    let mut out = kept.join(". ");
    out.push('.');
    out
}

/// Cuts to `max_chars`, preferring the last sentence end past 70% of the
/// budget, then the last word boundary.
pub(crate) fn truncate_at_sentence(text: &str, max_chars: usize) -> String {
    if char_len(text) <= max_chars {
        return text.to_string();
    }
    let cut = slice_chars(text, max_chars);
    if let Some(pos) = cut.rfind('.') {
        if char_len(&cut[..pos]) as f64 > max_chars as f64 * 0.7 {
            return cut[..=pos].to_string();
        }
    }
    match cut.rfind(' ') {
        Some(pos) if pos > 0 => format!("{}...", &cut[..pos]),
        _ => cut.to_string(),
    }
}
