//! Agent sessions, sliding context windows and cost accounting.

use std::collections::VecDeque;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::TokenUsage;

/// Rough token estimate (about four characters per token).
pub fn estimate_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    text.chars().count().div_ceil(4).max(1)
}

/// Who produced a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One entry in a context window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    pub tokens: usize,
    /// Pinned turns are never truncated.
    #[serde(default)]
    pub pinned: bool,
    /// Number of turns this one stands in for (elision notes only).
    #[serde(default, skip_serializing_if = "is_zero")]
    pub replaces: usize,
}

fn is_zero(value: &usize) -> bool {
    *value == 0
}

impl Turn {
    /// Create a turn, estimating its token count.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        let content = content.into();
        let tokens = estimate_tokens(&content);
        Self { role, content, tokens, pinned: false, replaces: 0 }
    }

    /// Override the token count with a provider-reported figure.
    pub fn with_tokens(mut self, tokens: usize) -> Self {
        self.tokens = tokens;
        self
    }

    /// Mark as pinned.
    pub fn pinned(mut self) -> Self {
        self.pinned = true;
        self
    }
}

/// What to do with old turns once the budget is exceeded.
pub trait TruncationPolicy: Send + Sync + std::fmt::Debug {
    /// Shrink `turns` until their total is within `budget`, or until only
    /// pinned turns remain.
    fn truncate(&self, turns: &mut VecDeque<Turn>, budget: usize);
}

fn total_tokens(turns: &VecDeque<Turn>) -> usize {
    turns.iter().map(|t| t.tokens).sum()
}

/// Drop the oldest non-pinned turns.
#[derive(Debug, Default, Clone, Copy)]
pub struct DropOldest;

impl TruncationPolicy for DropOldest {
    fn truncate(&self, turns: &mut VecDeque<Turn>, budget: usize) {
        while total_tokens(turns) > budget {
            let Some(index) = turns.iter().position(|t| !t.pinned) else {
                break;
            };
            turns.remove(index);
        }
    }
}

/// Replace the oldest non-pinned turns with a single pinned note.
#[derive(Debug, Default, Clone, Copy)]
pub struct ElideOldest;

impl TruncationPolicy for ElideOldest {
    fn truncate(&self, turns: &mut VecDeque<Turn>, budget: usize) {
        if total_tokens(turns) <= budget {
            return;
        }

        // Fold any previous note into the new one.
        let mut replaced = 0;
        let mut insert_at = None;
        if let Some(index) = turns.iter().position(|t| t.replaces > 0) {
            replaced += turns[index].replaces;
            insert_at = Some(index);
            turns.remove(index);
        }

        while total_tokens(turns) > budget {
            let Some(index) = turns.iter().position(|t| !t.pinned) else {
                break;
            };
            insert_at.get_or_insert(index);
            turns.remove(index);
            replaced += 1;
        }

        if replaced > 0 {
            let mut note = Turn::new(Role::System, format!("[{replaced} earlier turns elided]"));
            note.pinned = true;
            note.replaces = replaced;
            let index = insert_at.unwrap_or(0).min(turns.len());
            turns.insert(index, note);
        }
    }
}

/// Token-bounded, ordered sequence of turns.
#[derive(Debug, Clone)]
pub struct ContextWindow {
    budget: usize,
    turns: VecDeque<Turn>,
    policy: Arc<dyn TruncationPolicy>,
}

impl ContextWindow {
    /// Window with the default drop-oldest policy.
    pub fn new(budget: usize) -> Self {
        Self::with_policy(budget, Arc::new(DropOldest))
    }

    /// Window with a custom truncation policy.
    pub fn with_policy(budget: usize, policy: Arc<dyn TruncationPolicy>) -> Self {
        Self { budget, turns: VecDeque::new(), policy }
    }

    /// Append a turn, truncating if the budget is exceeded.
    pub fn push(&mut self, turn: Turn) {
        self.turns.push_back(turn);
        if self.used() > self.budget {
            self.policy.truncate(&mut self.turns, self.budget);
        }
    }

    /// Tokens currently held.
    pub fn used(&self) -> usize {
        total_tokens(&self.turns)
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Copy of the turns, oldest first.
    pub fn turns(&self) -> Vec<Turn> {
        self.turns.iter().cloned().collect()
    }
}

/// Monotonic cost total.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CostAccumulator {
    total: f64,
}

impl CostAccumulator {
    /// Add a charge. Negative or non-finite amounts are ignored.
    pub fn add(&mut self, amount: f64) {
        if amount.is_finite() && amount > 0.0 {
            self.total += amount;
        }
    }

    pub fn total(&self) -> f64 {
        self.total
    }
}

/// A bounded conversation with one provider for one stage attempt.
#[derive(Debug, Clone)]
pub struct AgentSession {
    pub id: String,
    pub provider: String,
    pub model: String,
    pub stage_id: String,
    pub context: ContextWindow,
    pub cost: CostAccumulator,
    pub usage: TokenUsage,
    pub provider_calls: u32,
    pub cache_hits: u32,
    pub cancel: CancellationToken,
}

impl AgentSession {
    /// Roll the session up for the execution record.
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.id.clone(),
            provider: self.provider.clone(),
            cost: self.cost.total(),
            usage: self.usage,
            provider_calls: self.provider_calls,
            cache_hits: self.cache_hits,
        }
    }
}

/// Totals for a closed session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub provider: String,
    pub cost: f64,
    pub usage: TokenUsage,
    pub provider_calls: u32,
    pub cache_hits: u32,
}
