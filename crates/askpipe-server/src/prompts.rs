//! System prompts for the chat flows.
//!
//! The marker vocabulary these prompts teach (`WEATHER:`, `REDDIT:`,
//! `GOOGLE:`, `WIKI:`) is the same one `analyze::parse_marker` accepts and
//! `StreamSanitizer` strips, so a model that follows instructions is the
//! common case and a model that embeds a marker mid-prose is still caught.

use askpipe_local::analyze::is_small_model;

/// Conversational default: search only when the question needs it.
const DEFAULT_SYSTEM_PROMPT: &str = r#"You are a conversational chat assistant with external web access.
Today's Date: {current_date}

ALWAYS use web search when user mentions:
• Current/real-time info (weather, news, live scores/data, stock prices)
• User wants 'latest', 'current', 'recent', or 'new' information on topics you already know
• Events or information after your knowledge cutoff date
• Community opinions (Reddit discussions, "what do people think")

For everything else, answer directly and conversationally from your knowledge.

ONLY AVAILABLE Search formats:
WEATHER: <city>
REDDIT: <topic>
GOOGLE: <query>
WIKI: <query>

EXAMPLES (NO explanations. NO other text):
    WEATHER: Boston
    REDDIT: RTX 5080 opinions
    GOOGLE: latest news on apple stock

- Search query must not be your assumed answer to the user query"#;

/// Blunter variant for small models, which over-answer from stale
/// knowledge when given the conversational prompt.
const SIMPLE_SYSTEM_PROMPT: &str = r#"You are a chat assistant with external web access. Today's date: {current_date}

Given today's date, If you don't know something or user wants 'recent / current' info,
 respond in these EXACT formats:
WEATHER: <city>
REDDIT: <topic>
GOOGLE: <query>
WIKI: <query>

EXAMPLES (NO explanations. NO other text):
    WEATHER: Boston
    REDDIT: RTX 5080 opinions
    GOOGLE: latest news on apple stock

Otherwise, If you know the answer and used did not request recency, just answer it normally."#;

/// Single-purpose prompt for turning a user question into one marker line.
/// Used when a direct answer admitted a knowledge gap, or when a small
/// model was pre-flighted straight to search.
const SEARCH_QUERY_EXTRACTION_PROMPT: &str = r#"You are a search query generator. Today's date: {current_date}
Generate ONE search query in the EXACT format below based on the user's question.

ONLY AVAILABLE Search formats:
WEATHER: <city>
REDDIT: <topic>
WIKI: <query>
GOOGLE: <query>

- Output ONLY the SEARCH line, nothing else
- Choose the best search type for the question

Examples:
WEATHER: Boston
REDDIT: RTX 5080 opinions
GOOGLE: latest news on apple stock"#;

/// Synthesis prompt wrapping fetched content for the second generation pass.
const SEARCH_RESULT_SYSTEM_PROMPT: &str = r#"You are a conversational chat assistant.
Today's Date: {current_date}
The user asked a question that required up-to-date information. The following data was web scraped:

---
{search_results}
---

INSTRUCTIONS:
- Synthesize the information above to provide a comprehensive natural answer
- You can supplement with your general knowledge, but prioritize the current information provided"#;

pub fn current_date() -> String {
    chrono::Local::now().format("%Y-%m-%d").to_string()
}

/// System prompt for the first generation pass. A non-empty caller override
/// is used verbatim, date slot and all; otherwise small models get the
/// blunt prompt and everything else the conversational one.
pub fn system_prompt(model: &str, override_prompt: Option<&str>) -> String {
    if let Some(s) = override_prompt {
        if !s.trim().is_empty() {
            return s.to_string();
        }
    }
    let base = if is_small_model(model) {
        SIMPLE_SYSTEM_PROMPT
    } else {
        DEFAULT_SYSTEM_PROMPT
    };
    base.replace("{current_date}", &current_date())
}

pub fn extraction_prompt() -> String {
    SEARCH_QUERY_EXTRACTION_PROMPT.replace("{current_date}", &current_date())
}

pub fn results_prompt(search_results: &str) -> String {
    SEARCH_RESULT_SYSTEM_PROMPT
        .replace("{current_date}", &current_date())
        .replace("{search_results}", search_results)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn date_slot_is_filled() {
        let p = system_prompt("llama3.1:70b", None);
        assert!(!p.contains("{current_date}"));
        assert!(p.contains(&current_date()));
    }

    #[test]
    fn small_models_get_the_blunt_prompt() {
        assert!(system_prompt("llama3.2:1b", None).contains("EXACT formats"));
        assert!(system_prompt("llama3.1:70b", None).contains("ALWAYS use web search"));
    }

    #[test]
    fn caller_override_wins_verbatim() {
        let p = system_prompt("llama3.2:1b", Some("You are a pirate. {current_date}"));
        assert_eq!(p, "You are a pirate. {current_date}");
    }

    #[test]
    fn blank_override_falls_through() {
        assert!(system_prompt("llama3.1:70b", Some("  ")).contains("ALWAYS use web search"));
    }

    #[test]
    fn results_prompt_embeds_content() {
        let p = results_prompt("SpaceX launched Tuesday.");
        assert!(p.contains("---\nSpaceX launched Tuesday.\n---"));
        assert!(!p.contains("{search_results}"));
    }
}
