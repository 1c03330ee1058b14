use askpipe_core::{ChatTurn, Error, Result, Role, TokenUsage};
use std::collections::HashMap;

/// Fixed cost charged per message beyond its text (role framing etc).
const PER_TURN_OVERHEAD: usize = 4;
/// Overhead for the request envelope around all messages.
const FIXED_OVERHEAD: usize = 12;
/// Space held back for the model's own reply.
const RESPONSE_RESERVE: usize = 500;

/// Characters-and-words blend. Word count alone undercounts prose with long
/// words; characters alone undercount code-like text. The blend leans
/// conservative (over-estimates) so the budget invariant holds without
/// exact tokenizer access.
pub fn estimate_text(text: &str) -> usize {
    let char_estimate = text.chars().count() as f64 / 4.0;
    let word_estimate = text.split_whitespace().count() as f64;
    (char_estimate * 0.6 + word_estimate * 0.4).round() as usize
}

pub fn estimate_turn(turn: &ChatTurn) -> usize {
    estimate_text(&turn.content) + PER_TURN_OVERHEAD
}

pub fn estimate_turns(turns: &[ChatTurn]) -> usize {
    turns.iter().map(estimate_turn).sum()
}

/// Space to reserve before a tool fetch is issued, by expected content
/// size class. Computed ahead of the fetch so truncation happens before
/// content arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveClass {
    None,
    /// Short structured fact, e.g. current weather.
    ShortFact,
    /// Article excerpts / composed search results.
    Article,
}

impl ReserveClass {
    pub fn tokens(&self) -> usize {
        match self {
            ReserveClass::None => 0,
            ReserveClass::ShortFact => 1000,
            ReserveClass::Article => 4000,
        }
    }
}

/// Per-model context capacities. Model capability detection is the
/// caller's concern; this only maps names to limits.
#[derive(Debug, Clone)]
pub struct ModelBudgets {
    table: HashMap<String, usize>,
    default_max: usize,
    safety: f64,
}

impl ModelBudgets {
    pub fn new(table: HashMap<String, usize>, default_max: usize, safety: f64) -> Self {
        Self {
            table,
            default_max: default_max.max(1),
            safety: safety.clamp(0.1, 1.0),
        }
    }

    /// Parses "name=ctx,name=ctx" lists, the shape the server reads from
    /// the environment.
    pub fn parse_table(spec: &str) -> HashMap<String, usize> {
        let mut table = HashMap::new();
        for part in spec.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            if let Some((name, ctx)) = part.split_once('=') {
                if let Ok(n) = ctx.trim().parse::<usize>() {
                    if n > 0 {
                        table.insert(name.trim().to_string(), n);
                    }
                }
            }
        }
        table
    }

    fn model_max(&self, model: &str) -> usize {
        if let Some(n) = self.table.get(model) {
            return *n;
        }
        // Ollama tags ("llama3:8b") fall back to the bare family name.
        if let Some((family, _)) = model.split_once(':') {
            if let Some(n) = self.table.get(family) {
                return *n;
            }
        }
        self.default_max
    }

    pub fn budget_for(&self, model: &str) -> TokenBudget {
        let model_max = self.model_max(model);
        TokenBudget {
            model_max,
            limit: (model_max as f64 * self.safety) as usize,
            consumed: 0,
            reserved: 0,
        }
    }
}

impl Default for ModelBudgets {
    fn default() -> Self {
        Self::new(HashMap::new(), 8192, 0.8)
    }
}

/// Budget accounting for one request cycle. `consumed + reserved <= limit`
/// holds whenever truncation logic has run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBudget {
    pub model_max: usize,
    pub limit: usize,
    pub consumed: usize,
    pub reserved: usize,
}

impl TokenBudget {
    pub fn usage(&self) -> TokenUsage {
        TokenUsage::new(self.consumed, self.limit, self.model_max)
    }
}

#[derive(Debug, Clone)]
pub struct FitOutcome {
    /// System turn, retained history, then the user prompt.
    pub turns: Vec<ChatTurn>,
    /// History turns retained (system and prompt excluded).
    pub history_included: usize,
    pub budget: TokenBudget,
}

/// Fits a conversation into `budget` with `reserve` tokens held back for
/// anticipated retrieved content. The system prompt (plus user memory) and
/// the current prompt are always retained; history is walked newest-first
/// and admitted in whole user/assistant pairs so no assistant turn survives
/// without the user turn that provoked it.
pub fn fit(
    mut budget: TokenBudget,
    system_prompt: &str,
    user_memory: Option<&str>,
    prompt: &str,
    history: &[ChatTurn],
    reserve: ReserveClass,
) -> Result<FitOutcome> {
    let system_text = match user_memory {
        Some(memory) if !memory.trim().is_empty() => {
            format!("{system_prompt}\n\nWhat you know about the user:\n{memory}")
        }
        _ => system_prompt.to_string(),
    };

    budget.reserved = reserve.tokens();
    let fixed = estimate_text(&system_text)
        + estimate_text(prompt)
        + 2 * PER_TURN_OVERHEAD
        + FIXED_OVERHEAD;

    let history_budget = budget
        .limit
        .checked_sub(fixed + RESPONSE_RESERVE + budget.reserved)
        .ok_or_else(|| {
            Error::Budget(format!(
                "context needs {} tokens before any history but the limit is {}",
                fixed + RESPONSE_RESERVE + budget.reserved,
                budget.limit
            ))
        })?;

    let mut kept: Vec<&ChatTurn> = Vec::new();
    let mut used = 0usize;
    let mut i = history.len();
    while i > 0 {
        let pair_start = if i >= 2
            && history[i - 2].role == Role::User
            && history[i - 1].role == Role::Assistant
        {
            i - 2
        } else {
            i - 1
        };
        // A lone assistant turn would orphan; stop the walk there.
        if pair_start == i - 1 && history[i - 1].role == Role::Assistant {
            break;
        }
        let chunk = &history[pair_start..i];
        let cost = estimate_turns(chunk);
        if used + cost > history_budget {
            break;
        }
        used += cost;
        for turn in chunk.iter().rev() {
            kept.push(turn);
        }
        i = pair_start;
    }

    let mut turns = Vec::with_capacity(kept.len() + 2);
    turns.push(ChatTurn::system(system_text));
    for turn in kept.iter().rev() {
        turns.push((*turn).clone());
    }
    turns.push(ChatTurn::user(prompt));

    let history_included = kept.len();
    budget.consumed = fixed + used;
    debug_assert!(budget.consumed + budget.reserved <= budget.limit);

    Ok(FitOutcome {
        turns,
        history_included,
        budget,
    })
}

/// Re-fit after retrieved content landed in the system prompt. Retrieval
/// is prioritized over older conversational turns, so the reservation is
/// released and history shrinks to whatever still fits.
pub fn refit_with_content(
    budget: TokenBudget,
    system_prompt: &str,
    user_memory: Option<&str>,
    prompt: &str,
    history: &[ChatTurn],
) -> Result<FitOutcome> {
    let fresh = TokenBudget {
        consumed: 0,
        reserved: 0,
        ..budget
    };
    fit(
        fresh,
        system_prompt,
        user_memory,
        prompt,
        history,
        ReserveClass::None,
    )
}


#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    fn arb_history() -> impl Strategy<Value = Vec<ChatTurn>> {
        proptest::collection::vec("[a-z ]{0,200}", 0..40).prop_map(|texts| {
            texts
                .into_iter()
                .enumerate()
                .map(|(i, t)| {
                    if i % 2 == 0 {
                        ChatTurn::user(t)
                    } else {
                        ChatTurn::assistant(t)
                    }
                })
                .collect()
        })
    }

    proptest! {
        #[test]
        fn consumed_plus_reserved_never_exceeds_limit(
            history in arb_history(),
            model_max in 2000usize..20000,
            reserve_article in proptest::bool::ANY,
        ) {
            let budgets = ModelBudgets::new(Default::default(), model_max, 0.8);
            let reserve = if reserve_article { ReserveClass::Article } else { ReserveClass::ShortFact };
            if let Ok(out) = fit(budgets.budget_for("m"), "system prompt", None, "the question", &history, reserve) {
                prop_assert!(out.budget.consumed + out.budget.reserved <= out.budget.limit);
                prop_assert_eq!(out.turns.first().unwrap().role, Role::System);
                prop_assert_eq!(out.turns.last().unwrap().role, Role::User);
            }
        }

        #[test]
        fn oversized_history_always_truncates_to_fit(words in 50usize..400) {
            let text = vec!["word"; words].join(" ");
            let mut history = Vec::new();
            for _ in 0..50 {
                history.push(ChatTurn::user(text.clone()));
                history.push(ChatTurn::assistant(text.clone()));
            }
            let budgets = ModelBudgets::new(Default::default(), 4096, 0.8);
            let out = fit(budgets.budget_for("m"), "sys", None, "q", &history, ReserveClass::None).unwrap();
            prop_assert!(out.budget.consumed <= out.budget.limit);
            prop_assert!(out.history_included < history.len());
        }
    }
}
