//! Segment allocations and the live usage ledger.
//!
//! A [`BudgetAllocation`] splits a model's context window into fixed
//! per-segment quotas. The `history` segment is either a fixed quota or
//! whatever is left over once the output reserve and all other segments are
//! subtracted ([`HistoryBudget::Remainder`]).
//!
//! A [`ContextLedger`] mirrors that shape with *used* token counters. It only
//! grows through [`record`](ContextLedger::record) and only shrinks through
//! [`release`](ContextLedger::release), which callers invoke when content is
//! evicted or optimized away.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ContextError;

/// Default utilization fraction at which compaction should run.
pub const DEFAULT_COMPACTION_THRESHOLD: f64 = 0.80;

/// One named category of context content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextSegment {
    SystemPrompt,
    Rules,
    Skills,
    Memory,
    ToolsSchema,
    History,
    ToolOutputs,
    Buffer,
}

impl ContextSegment {
    /// Every segment, in prompt order.
    pub const ALL: [ContextSegment; 8] = [
        ContextSegment::SystemPrompt,
        ContextSegment::Rules,
        ContextSegment::Skills,
        ContextSegment::Memory,
        ContextSegment::ToolsSchema,
        ContextSegment::History,
        ContextSegment::ToolOutputs,
        ContextSegment::Buffer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ContextSegment::SystemPrompt => "system_prompt",
            ContextSegment::Rules => "rules",
            ContextSegment::Skills => "skills",
            ContextSegment::Memory => "memory",
            ContextSegment::ToolsSchema => "tools_schema",
            ContextSegment::History => "history",
            ContextSegment::ToolOutputs => "tool_outputs",
            ContextSegment::Buffer => "buffer",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for ContextSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Quota for the history segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryBudget {
    /// A fixed number of tokens.
    Fixed(usize),
    /// Whatever the usable window leaves after all other fixed segments.
    #[default]
    Remainder,
}

/// Fixed breakdown of a model's context window into segment quotas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetAllocation {
    /// Total context window of the model, in tokens.
    pub model_limit: usize,
    /// Tokens held back for the model's response.
    pub output_reserve: usize,
    pub system_prompt: usize,
    pub rules: usize,
    pub skills: usize,
    pub memory: usize,
    pub tools_schema: usize,
    pub history: HistoryBudget,
    pub tool_outputs: usize,
    pub buffer: usize,
}

impl Default for BudgetAllocation {
    fn default() -> Self {
        Self::for_model(200_000, 8_192)
    }
}

impl BudgetAllocation {
    /// An allocation with every fixed segment at zero and a remainder history.
    pub fn for_model(model_limit: usize, output_reserve: usize) -> Self {
        Self {
            model_limit,
            output_reserve,
            system_prompt: 0,
            rules: 0,
            skills: 0,
            memory: 0,
            tools_schema: 0,
            history: HistoryBudget::Remainder,
            tool_outputs: 0,
            buffer: 0,
        }
    }

    /// Set the quota for one segment. Setting [`ContextSegment::History`]
    /// pins it to a fixed quota.
    pub fn with_segment(mut self, segment: ContextSegment, tokens: usize) -> Self {
        match segment {
            ContextSegment::SystemPrompt => self.system_prompt = tokens,
            ContextSegment::Rules => self.rules = tokens,
            ContextSegment::Skills => self.skills = tokens,
            ContextSegment::Memory => self.memory = tokens,
            ContextSegment::ToolsSchema => self.tools_schema = tokens,
            ContextSegment::History => self.history = HistoryBudget::Fixed(tokens),
            ContextSegment::ToolOutputs => self.tool_outputs = tokens,
            ContextSegment::Buffer => self.buffer = tokens,
        }
        self
    }

    /// Let history take whatever the other segments leave.
    pub fn with_remainder_history(mut self) -> Self {
        self.history = HistoryBudget::Remainder;
        self
    }

    /// Context window minus the output reserve.
    pub fn usable(&self) -> usize {
        self.model_limit.saturating_sub(self.output_reserve)
    }

    /// Sum of every segment except history. Saturates at `usize::MAX`.
    pub fn fixed_total(&self) -> usize {
        self.fixed_segments()
            .into_iter()
            .fold(0, usize::saturating_add)
    }

    fn fixed_segments(&self) -> [usize; 7] {
        [
            self.system_prompt,
            self.rules,
            self.skills,
            self.memory,
            self.tools_schema,
            self.tool_outputs,
            self.buffer,
        ]
    }

    /// The history quota after resolving [`HistoryBudget::Remainder`].
    pub fn effective_history(&self) -> usize {
        match self.history {
            HistoryBudget::Fixed(n) => n,
            HistoryBudget::Remainder => {
                let remainder = self.usable().saturating_sub(self.fixed_total());
                if remainder == 0 {
                    warn!(
                        model_limit = self.model_limit,
                        output_reserve = self.output_reserve,
                        fixed_total = self.fixed_total(),
                        "history budget resolved to zero"
                    );
                }
                remainder
            }
        }
    }

    /// The quota for a single segment.
    pub fn segment(&self, segment: ContextSegment) -> usize {
        match segment {
            ContextSegment::SystemPrompt => self.system_prompt,
            ContextSegment::Rules => self.rules,
            ContextSegment::Skills => self.skills,
            ContextSegment::Memory => self.memory,
            ContextSegment::ToolsSchema => self.tools_schema,
            ContextSegment::History => self.effective_history(),
            ContextSegment::ToolOutputs => self.tool_outputs,
            ContextSegment::Buffer => self.buffer,
        }
    }

    /// Sum of every segment quota, with history resolved.
    pub fn total(&self) -> usize {
        self.fixed_total().saturating_add(self.effective_history())
    }

    /// Check that the schema leaves room for content.
    ///
    /// Construction never fails; call this when a configuration comes from
    /// outside the program.
    pub fn validate(&self) -> Result<(), ContextError> {
        if self.output_reserve >= self.model_limit {
            return Err(ContextError::InvalidAllocation {
                reason: format!(
                    "output reserve ({}) must be smaller than the model limit ({})",
                    self.output_reserve, self.model_limit
                ),
            });
        }
        let history = match self.history {
            HistoryBudget::Fixed(n) => n,
            HistoryBudget::Remainder => 0,
        };
        let Some(fixed) = self
            .fixed_segments()
            .into_iter()
            .try_fold(history, usize::checked_add)
        else {
            return Err(ContextError::InvalidAllocation {
                reason: "segment quotas overflow".to_string(),
            });
        };
        if fixed > self.usable() {
            return Err(ContextError::InvalidAllocation {
                reason: format!(
                    "fixed segments ({fixed}) exceed the usable budget ({})",
                    self.usable()
                ),
            });
        }
        Ok(())
    }
}

/// Live per-segment token usage plus conversation counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextLedger {
    used: [usize; 8],
    pub turn_count: usize,
    pub message_count: usize,
    pub tool_call_count: usize,
}

impl ContextLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `tokens` to a segment's usage.
    pub fn record(&mut self, segment: ContextSegment, tokens: usize) {
        self.used[segment.index()] += tokens;
    }

    /// Remove `tokens` from a segment's usage (saturating at zero).
    pub fn release(&mut self, segment: ContextSegment, tokens: usize) {
        let slot = &mut self.used[segment.index()];
        *slot = slot.saturating_sub(tokens);
    }

    pub fn record_turn(&mut self) {
        self.turn_count += 1;
    }

    pub fn record_message(&mut self) {
        self.message_count += 1;
    }

    pub fn record_tool_call(&mut self) {
        self.tool_call_count += 1;
    }

    /// Tokens used by one segment.
    pub fn used(&self, segment: ContextSegment) -> usize {
        self.used[segment.index()]
    }

    /// Tokens used across all eight segments.
    pub fn total_used(&self) -> usize {
        self.used.iter().sum()
    }

    /// Tokens left in a segment's quota. Negative when the segment overflowed.
    pub fn remaining(&self, allocation: &BudgetAllocation, segment: ContextSegment) -> i64 {
        allocation.segment(segment) as i64 - self.used(segment) as i64
    }

    /// Total usage as a fraction of the usable window (0.0 to 1.0+).
    pub fn utilization(&self, allocation: &BudgetAllocation) -> f64 {
        let usable = allocation.usable();
        if usable == 0 {
            return 1.0;
        }
        self.total_used() as f64 / usable as f64
    }

    /// Whether utilization has reached `threshold`.
    pub fn needs_compaction(&self, allocation: &BudgetAllocation, threshold: f64) -> bool {
        self.utilization(allocation) >= threshold
    }

    /// Segments whose usage exceeds their quota.
    pub fn over_budget_segments(&self, allocation: &BudgetAllocation) -> Vec<ContextSegment> {
        ContextSegment::ALL
            .into_iter()
            .filter(|&s| self.used(s) > allocation.segment(s))
            .collect()
    }

    /// Snapshot the ledger against an allocation.
    pub fn usage_report(&self, allocation: &BudgetAllocation) -> LedgerUsage {
        LedgerUsage {
            segments: ContextSegment::ALL
                .into_iter()
                .map(|s| SegmentUsage {
                    segment: s,
                    used: self.used(s),
                    budget: allocation.segment(s),
                })
                .collect(),
            total_used: self.total_used(),
            usable: allocation.usable(),
            utilization: self.utilization(allocation),
        }
    }
}

/// Usage of a single segment against its quota.
#[derive(Debug, Clone, Serialize)]
pub struct SegmentUsage {
    pub segment: ContextSegment,
    pub used: usize,
    pub budget: usize,
}

/// Snapshot of a ledger measured against an allocation.
#[derive(Debug, Clone, Serialize)]
pub struct LedgerUsage {
    pub segments: Vec<SegmentUsage>,
    pub total_used: usize,
    pub usable: usize,
    /// Usage as a fraction (0.0 to 1.0+).
    pub utilization: f64,
}

impl LedgerUsage {
    /// Format as a short log-friendly string.
    pub fn to_log_string(&self) -> String {
        let busy: Vec<String> = self
            .segments
            .iter()
            .filter(|s| s.used > 0)
            .map(|s| format!("{}={}/{}", s.segment, s.used, s.budget))
            .collect();
        format!(
            "ledger: ~{} tokens ({:.0}% of {}) [{}]",
            self.total_used,
            self.utilization * 100.0,
            self.usable,
            busy.join(", "),
        )
    }
}
