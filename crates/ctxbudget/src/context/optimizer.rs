//! Multi-strategy context compaction.
//!
//! Where the [`ContextManager`](super::manager::ContextManager) evicts one
//! item at a time as content arrives, the [`ContextOptimizer`] runs a heavier
//! pass on demand: it applies a chain of strategies to a set of scored,
//! timestamped items and stops as soon as the running total fits the target.
//!
//! Strategies, in their default order:
//!
//! 1. `truncate-old`: keep the newest items that fit, drop the rest.
//! 2. `truncate-low-priority`: keep the highest-priority items that fit.
//! 3. `deduplicate`: drop items whose normalized prefix was already seen.
//!
//! Two more are opt-in: `compress` (rewrite content to squeeze whitespace and
//! repeated characters) and `summarize` (replace everything with one summary
//! item from an injected [`Summarizer`]).
//!
//! Falling short of the target is not an error. Callers that need a hard
//! guarantee compare [`OptimizationResult::optimized_tokens`] with their own
//! limit.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

use super::estimator::{DEFAULT_CHARS_PER_TOKEN, TokenEstimator};
use super::summarizer::Summarizer;
use crate::error::ContextError;

/// Characters of normalized content used as a deduplication fingerprint.
const FINGERPRINT_CHARS: usize = 100;

/// Runs of this many identical characters (or more) are squeezed by `compress`.
const REPEAT_RUN_MIN: usize = 4;

/// Length a squeezed run is reduced to.
const REPEAT_RUN_KEEP: usize = 2;

/// `kind` tag carried by items produced by the summarize strategy.
pub const SUMMARY_KIND: &str = "summary";

/// A unit of content the optimizer can keep, drop, or rewrite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizableItem {
    pub id: String,
    pub content: String,
    /// Relative importance, typically 0.0 to 1.0.
    pub priority: f64,
    /// Creation time in epoch milliseconds.
    pub timestamp: i64,
    /// Token cost. Estimated on first use when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<usize>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

impl OptimizableItem {
    pub fn new(
        id: impl Into<String>,
        content: impl Into<String>,
        priority: f64,
        timestamp: i64,
    ) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            priority,
            timestamp,
            tokens: None,
            kind: None,
        }
    }

    pub fn with_tokens(mut self, tokens: usize) -> Self {
        self.tokens = Some(tokens);
        self
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    /// Token cost; zero if it has not been estimated yet.
    pub fn token_count(&self) -> usize {
        self.tokens.unwrap_or(0)
    }

    pub fn is_summary(&self) -> bool {
        self.kind.as_deref() == Some(SUMMARY_KIND)
    }
}

/// One reduction technique in the optimizer chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OptimizationStrategy {
    TruncateOld,
    TruncateLowPriority,
    Deduplicate,
    Compress,
    Summarize,
}

impl OptimizationStrategy {
    /// The chain used when none is configured.
    pub const DEFAULT_CHAIN: [OptimizationStrategy; 3] = [
        OptimizationStrategy::TruncateOld,
        OptimizationStrategy::TruncateLowPriority,
        OptimizationStrategy::Deduplicate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OptimizationStrategy::TruncateOld => "truncate-old",
            OptimizationStrategy::TruncateLowPriority => "truncate-low-priority",
            OptimizationStrategy::Deduplicate => "deduplicate",
            OptimizationStrategy::Compress => "compress",
            OptimizationStrategy::Summarize => "summarize",
        }
    }
}

impl fmt::Display for OptimizationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OptimizationStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "truncate-old" => Ok(OptimizationStrategy::TruncateOld),
            "truncate-low-priority" => Ok(OptimizationStrategy::TruncateLowPriority),
            "deduplicate" => Ok(OptimizationStrategy::Deduplicate),
            "compress" => Ok(OptimizationStrategy::Compress),
            "summarize" => Ok(OptimizationStrategy::Summarize),
            other => Err(format!("unknown optimization strategy '{other}'")),
        }
    }
}

/// Configuration for a [`ContextOptimizer`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextOptimizerConfig {
    /// Token count the optimizer tries to get under.
    pub target_tokens: usize,
    /// Strategies applied in order until the target is met.
    #[serde(default = "default_strategies")]
    pub strategies: Vec<OptimizationStrategy>,
    #[serde(default = "default_token_ratio")]
    pub token_ratio: f64,
    /// Under `truncate-low-priority`, items below this priority are dropped
    /// before greedy fitting. Default: 0.0 (nothing dropped up front).
    #[serde(default)]
    pub min_priority: f64,
}

fn default_strategies() -> Vec<OptimizationStrategy> {
    OptimizationStrategy::DEFAULT_CHAIN.to_vec()
}

fn default_token_ratio() -> f64 {
    DEFAULT_CHARS_PER_TOKEN
}

impl ContextOptimizerConfig {
    pub fn new(target_tokens: usize) -> Self {
        Self {
            target_tokens,
            strategies: default_strategies(),
            token_ratio: DEFAULT_CHARS_PER_TOKEN,
            min_priority: 0.0,
        }
    }

    pub fn with_strategies(mut self, strategies: impl IntoIterator<Item = OptimizationStrategy>) -> Self {
        self.strategies = strategies.into_iter().collect();
        self
    }

    pub fn with_token_ratio(mut self, ratio: f64) -> Self {
        self.token_ratio = ratio;
        self
    }

    pub fn with_min_priority(mut self, min_priority: f64) -> Self {
        self.min_priority = min_priority;
        self
    }
}

/// Report of one [`ContextOptimizer::optimize`] call.
#[derive(Debug, Clone, Serialize)]
pub struct OptimizationResult {
    /// The input, with token costs filled in.
    pub original: Vec<OptimizableItem>,
    /// What survived (possibly rewritten or replaced by a summary).
    pub optimized: Vec<OptimizableItem>,
    /// Everything dropped or replaced, across all applied strategies.
    pub removed: Vec<OptimizableItem>,
    /// `original_tokens - optimized_tokens`, never negative.
    pub tokens_saved: usize,
    /// The last strategy that was applied, or the first configured one when
    /// nothing needed doing.
    pub strategy: OptimizationStrategy,
}

impl OptimizationResult {
    pub fn original_tokens(&self) -> usize {
        self.original.iter().map(OptimizableItem::token_count).sum()
    }

    pub fn optimized_tokens(&self) -> usize {
        self.optimized.iter().map(OptimizableItem::token_count).sum()
    }

    /// Whether the optimized set fits `target`.
    pub fn fits(&self, target: usize) -> bool {
        self.optimized_tokens() <= target
    }

    /// Format as a short log-friendly string.
    pub fn to_log_string(&self) -> String {
        format!(
            "optimize[{}]: {} -> {} tokens ({} saved), {} kept, {} removed",
            self.strategy,
            self.original_tokens(),
            self.optimized_tokens(),
            self.tokens_saved,
            self.optimized.len(),
            self.removed.len(),
        )
    }
}

/// Shrinks a set of items below a token target with a chain of strategies.
pub struct ContextOptimizer {
    config: ContextOptimizerConfig,
    estimator: TokenEstimator,
    summarizer: Option<Box<dyn Summarizer>>,
}

impl fmt::Debug for ContextOptimizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextOptimizer")
            .field("config", &self.config)
            .field("estimator", &self.estimator)
            .field("summarizer", &self.summarizer.is_some())
            .finish()
    }
}

impl ContextOptimizer {
    pub fn new(config: ContextOptimizerConfig) -> Self {
        let estimator = TokenEstimator::new(config.token_ratio);
        Self {
            config,
            estimator,
            summarizer: None,
        }
    }

    /// Inject the capability used by the `summarize` strategy.
    pub fn with_summarizer(mut self, summarizer: impl Summarizer + 'static) -> Self {
        self.summarizer = Some(Box::new(summarizer));
        self
    }

    pub fn config(&self) -> &ContextOptimizerConfig {
        &self.config
    }

    pub fn target_tokens(&self) -> usize {
        self.config.target_tokens
    }

    /// Run the strategy chain against `items`.
    ///
    /// The only error is a summarizer failure, which propagates unchanged.
    pub async fn optimize(
        &self,
        items: Vec<OptimizableItem>,
    ) -> Result<OptimizationResult, ContextError> {
        self.optimize_to(items, self.config.target_tokens).await
    }

    /// Run the strategy chain against an explicit target.
    pub async fn optimize_to(
        &self,
        mut items: Vec<OptimizableItem>,
        target: usize,
    ) -> Result<OptimizationResult, ContextError> {
        for item in &mut items {
            if item.tokens.is_none() {
                item.tokens = Some(self.estimator.estimate(&item.content));
            }
        }
        let original = items.clone();
        let original_tokens = total_tokens(&original);
        let first = self
            .config
            .strategies
            .first()
            .copied()
            .unwrap_or(OptimizationStrategy::TruncateOld);

        if original_tokens <= target {
            trace!(original_tokens, target, "already within target");
            return Ok(OptimizationResult {
                original,
                optimized: items,
                removed: Vec::new(),
                tokens_saved: 0,
                strategy: first,
            });
        }

        let mut retained = items;
        let mut removed = Vec::new();
        let mut last_applied = None;

        for &strategy in &self.config.strategies {
            let current = total_tokens(&retained);
            if current <= target {
                break;
            }
            let (kept, dropped) = self.apply(strategy, retained, target).await?;
            debug!(
                %strategy,
                before = current,
                after = total_tokens(&kept),
                dropped = dropped.len(),
                "strategy applied"
            );
            retained = kept;
            removed.extend(dropped);
            last_applied = Some(strategy);
        }

        let optimized_tokens = total_tokens(&retained);
        let result = OptimizationResult {
            original,
            optimized: retained,
            removed,
            tokens_saved: original_tokens.saturating_sub(optimized_tokens),
            strategy: last_applied.unwrap_or(first),
        };
        info!(
            strategy = %result.strategy,
            original_tokens,
            optimized_tokens,
            tokens_saved = result.tokens_saved,
            target,
            "context optimized"
        );
        Ok(result)
    }

    /// Apply a single strategy, returning `(kept, removed)`.
    async fn apply(
        &self,
        strategy: OptimizationStrategy,
        items: Vec<OptimizableItem>,
        target: usize,
    ) -> Result<(Vec<OptimizableItem>, Vec<OptimizableItem>), ContextError> {
        Ok(match strategy {
            OptimizationStrategy::TruncateOld => {
                let mut order: Vec<usize> = (0..items.len()).collect();
                order.sort_by(|&a, &b| items[b].timestamp.cmp(&items[a].timestamp));
                greedy_fit(items, &order, target)
            }
            OptimizationStrategy::TruncateLowPriority => {
                let (eligible, mut below): (Vec<_>, Vec<_>) = items
                    .into_iter()
                    .partition(|item| item.priority >= self.config.min_priority);
                let mut order: Vec<usize> = (0..eligible.len()).collect();
                order.sort_by(|&a, &b| eligible[b].priority.total_cmp(&eligible[a].priority));
                let (kept, dropped) = greedy_fit(eligible, &order, target);
                below.extend(dropped);
                (kept, below)
            }
            OptimizationStrategy::Deduplicate => deduplicate(items),
            OptimizationStrategy::Compress => (self.compress(items), Vec::new()),
            OptimizationStrategy::Summarize => self.summarize(items).await?,
        })
    }

    fn compress(&self, items: Vec<OptimizableItem>) -> Vec<OptimizableItem> {
        items
            .into_iter()
            .map(|mut item| {
                item.content = compress_text(&item.content);
                item.tokens = Some(self.estimator.estimate(&item.content));
                item
            })
            .collect()
    }

    async fn summarize(
        &self,
        items: Vec<OptimizableItem>,
    ) -> Result<(Vec<OptimizableItem>, Vec<OptimizableItem>), ContextError> {
        let Some(summarizer) = self.summarizer.as_deref() else {
            debug!("no summarizer configured, skipping summarize");
            return Ok((items, Vec::new()));
        };
        if items.is_empty() {
            return Ok((items, Vec::new()));
        }

        let summary = summarizer.summarize(&items).await?;
        let timestamp = items.iter().map(|i| i.timestamp).max().unwrap_or_default();
        let priority = items
            .iter()
            .map(|i| i.priority)
            .fold(f64::NEG_INFINITY, f64::max);
        let tokens = self.estimator.estimate(&summary);
        let item = OptimizableItem {
            id: format!("summary-{timestamp}"),
            content: summary,
            priority,
            timestamp,
            tokens: Some(tokens),
            kind: Some(SUMMARY_KIND.to_string()),
        };
        Ok((vec![item], items))
    }
}

fn total_tokens(items: &[OptimizableItem]) -> usize {
    items.iter().map(OptimizableItem::token_count).sum()
}

/// Walk `order` keeping items while they fit; the first item that overflows
/// and everything after it is removed. Both halves keep input order.
fn greedy_fit(
    items: Vec<OptimizableItem>,
    order: &[usize],
    target: usize,
) -> (Vec<OptimizableItem>, Vec<OptimizableItem>) {
    let mut keep = vec![false; items.len()];
    let mut running = 0;
    for &idx in order {
        let cost = items[idx].token_count();
        if running + cost > target {
            break;
        }
        running += cost;
        keep[idx] = true;
    }

    let mut kept = Vec::new();
    let mut removed = Vec::new();
    for (item, keep) in items.into_iter().zip(keep) {
        if keep {
            kept.push(item);
        } else {
            removed.push(item);
        }
    }
    (kept, removed)
}

fn deduplicate(items: Vec<OptimizableItem>) -> (Vec<OptimizableItem>, Vec<OptimizableItem>) {
    let mut seen = HashSet::new();
    let mut kept = Vec::new();
    let mut removed = Vec::new();
    for item in items {
        if seen.insert(fingerprint(&item.content)) {
            kept.push(item);
        } else {
            trace!(id = %item.id, "duplicate dropped");
            removed.push(item);
        }
    }
    (kept, removed)
}

/// Lowercased, whitespace-collapsed, trimmed prefix of `content`.
pub fn fingerprint(content: &str) -> String {
    content
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
        .chars()
        .take(FINGERPRINT_CHARS)
        .collect()
}

/// Collapse whitespace runs to one space and runs of 4+ identical
/// characters to 2. Leading and trailing whitespace is collapsed, not trimmed.
pub fn compress_text(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    let mut chars = content.chars().peekable();
    while let Some(c) = chars.next() {
        if c.is_whitespace() {
            while chars.next_if(|n| n.is_whitespace()).is_some() {}
            out.push(' ');
            continue;
        }
        let mut run = 1;
        while chars.next_if_eq(&c).is_some() {
            run += 1;
        }
        let keep = if run >= REPEAT_RUN_MIN { REPEAT_RUN_KEEP } else { run };
        out.extend(std::iter::repeat_n(c, keep));
    }
    out
}
