//! Per-turn context store with priority eviction.
//!
//! The [`ContextManager`] is the entry point callers touch every turn: add
//! system, user, assistant, and tool content; the manager estimates its cost,
//! appends it, and immediately evicts the lowest-priority non-system items
//! until the live total fits `max_tokens - reserved_tokens`.
//!
//! System content is never evicted. If only system content is left and the
//! total is still over the limit, the manager stays over and reports it
//! through a negative [`ManagerBudget::available_tokens`].
//!
//! Every insertion and removal is mirrored into a [`ContextLedger`] so the
//! per-segment view stays in sync with the item list.

use std::collections::{HashMap, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::estimator::{DEFAULT_CHARS_PER_TOKEN, TokenEstimator};
use super::ledger::{ContextLedger, ContextSegment};
use super::optimizer::{OptimizableItem, OptimizationResult};
use super::summarizer::Summarizer;
use crate::error::ContextError;

/// Default eviction threshold used by [`ContextManager::compress`].
pub const DEFAULT_EVICTION_THRESHOLD: f64 = 0.3;

/// Priority given to the item produced by a summarizing compress.
const SUMMARY_PRIORITY: f64 = 0.9;

/// Who a context item came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }

    /// Priority used when the caller does not supply one.
    pub fn default_priority(&self) -> f64 {
        match self {
            Role::System => 1.0,
            Role::User => 0.8,
            Role::Assistant => 0.7,
            Role::Tool => 0.6,
        }
    }

    /// Ledger segment used when the caller does not supply one.
    pub fn default_segment(&self) -> ContextSegment {
        match self {
            Role::System => ContextSegment::SystemPrompt,
            Role::User | Role::Assistant => ContextSegment::History,
            Role::Tool => ContextSegment::ToolOutputs,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A role-tagged piece of content owned by a [`ContextManager`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextItem {
    pub id: String,
    pub content: String,
    pub role: Role,
    /// Eviction priority in `[0, 1]`; lower goes first.
    pub priority: f64,
    /// Estimated cost of `content` at insertion time.
    pub tokens: usize,
    pub timestamp: DateTime<Utc>,
    pub segment: ContextSegment,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl ContextItem {
    /// Export as an optimizer item, tagged with the role as its kind.
    pub fn to_optimizable(&self) -> OptimizableItem {
        let kind = match self.metadata.get("type").and_then(|v| v.as_str()) {
            Some(kind) => kind.to_string(),
            None => self.role.as_str().to_string(),
        };
        OptimizableItem::new(
            self.id.clone(),
            self.content.clone(),
            self.priority,
            self.timestamp.timestamp_millis(),
        )
        .with_tokens(self.tokens)
        .with_kind(kind)
    }
}

/// Optional settings for [`ContextManager::add`].
#[derive(Debug, Clone, Default)]
pub struct AddOptions {
    pub priority: Option<f64>,
    pub segment: Option<ContextSegment>,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl AddOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn priority(mut self, priority: f64) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn segment(mut self, segment: ContextSegment) -> Self {
        self.segment = Some(segment);
        self
    }

    pub fn meta(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Configuration for a [`ContextManager`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextManagerConfig {
    /// Context window the manager works inside.
    pub max_tokens: usize,
    /// Tokens kept free (for the response). The live limit is
    /// `max_tokens - reserved_tokens`.
    pub reserved_tokens: usize,
    pub token_ratio: f64,
    /// Items below this priority are dropped by a crude [`ContextManager::compress`].
    pub eviction_threshold: f64,
}

impl Default for ContextManagerConfig {
    fn default() -> Self {
        Self {
            max_tokens: 128_000,
            reserved_tokens: 4_096,
            token_ratio: DEFAULT_CHARS_PER_TOKEN,
            eviction_threshold: DEFAULT_EVICTION_THRESHOLD,
        }
    }
}

impl ContextManagerConfig {
    pub fn with_max_tokens(mut self, max: usize) -> Self {
        self.max_tokens = max;
        self
    }

    pub fn with_reserved_tokens(mut self, tokens: usize) -> Self {
        self.reserved_tokens = tokens;
        self
    }

    pub fn with_token_ratio(mut self, ratio: f64) -> Self {
        self.token_ratio = ratio;
        self
    }

    pub fn with_eviction_threshold(mut self, threshold: f64) -> Self {
        self.eviction_threshold = threshold;
        self
    }
}

/// Token budget of a manager at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ManagerBudget {
    pub max_tokens: usize,
    pub reserved_tokens: usize,
    pub used_tokens: usize,
    /// Negative when the manager is over its limit and nothing is evictable.
    pub available_tokens: i64,
    /// `used_tokens` as a fraction of the live limit (0.0 to 1.0+).
    pub utilization: f64,
}

/// Per-role item counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RoleCounts {
    pub system: usize,
    pub user: usize,
    pub assistant: usize,
    pub tool: usize,
}

/// Summary of a manager's contents.
#[derive(Debug, Clone, Serialize)]
pub struct ContextStats {
    pub item_count: usize,
    pub total_tokens: usize,
    pub by_role: RoleCounts,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
    pub evictions: usize,
}

/// A role/content pair for chat-style prompt assembly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PromptMessage {
    pub role: Role,
    pub content: String,
}

/// Outcome of [`ContextManager::compress`].
#[derive(Debug, Clone, Serialize)]
pub struct CompressionReport {
    pub items_before: usize,
    pub items_after: usize,
    pub tokens_before: usize,
    pub tokens_after: usize,
    pub summarized: bool,
}

/// Ordered, role-tagged context with automatic priority eviction.
///
/// # Example
///
/// ```
/// use ctxbudget::context::manager::{ContextManager, ContextManagerConfig};
///
/// let mut manager = ContextManager::new(
///     ContextManagerConfig::default().with_max_tokens(50).with_reserved_tokens(10),
/// );
/// manager.add_system("You are a careful assistant.");
/// manager.add_user("Summarize the build log.");
/// manager.add_tool(&"log line ".repeat(30));
///
/// // The tool output did not fit and was evicted; the system prompt stays.
/// assert_eq!(manager.len(), 2);
/// assert!(manager.build().starts_with("system: "));
/// ```
#[derive(Debug)]
pub struct ContextManager {
    config: ContextManagerConfig,
    estimator: TokenEstimator,
    items: Vec<ContextItem>,
    ledger: ContextLedger,
    next_id: u64,
    evictions: usize,
}

impl Default for ContextManager {
    fn default() -> Self {
        Self::new(ContextManagerConfig::default())
    }
}

impl ContextManager {
    pub fn new(config: ContextManagerConfig) -> Self {
        Self {
            estimator: TokenEstimator::new(config.token_ratio),
            config,
            items: Vec::new(),
            ledger: ContextLedger::new(),
            next_id: 1,
            evictions: 0,
        }
    }

    pub fn config(&self) -> &ContextManagerConfig {
        &self.config
    }

    pub fn estimator(&self) -> &TokenEstimator {
        &self.estimator
    }

    /// The live token limit: `max_tokens - reserved_tokens`.
    pub fn limit(&self) -> usize {
        self.config
            .max_tokens
            .saturating_sub(self.config.reserved_tokens)
    }

    /// Add content and enforce the limit.
    ///
    /// The returned item reflects what was inserted; it may already have been
    /// evicted if it was the lowest-priority item.
    pub fn add(&mut self, content: impl Into<String>, role: Role, options: AddOptions) -> ContextItem {
        let content = content.into();
        let item = ContextItem {
            id: self.next_item_id(),
            tokens: self.estimator.estimate(&content),
            content,
            role,
            priority: options.priority.unwrap_or_else(|| role.default_priority()),
            timestamp: Utc::now(),
            segment: options.segment.unwrap_or_else(|| role.default_segment()),
            metadata: options.metadata,
        };
        self.insert(item.clone());
        self.enforce_limit();
        item
    }

    pub fn add_system(&mut self, content: impl Into<String>) -> ContextItem {
        self.add(content, Role::System, AddOptions::default())
    }

    pub fn add_user(&mut self, content: impl Into<String>) -> ContextItem {
        self.add(content, Role::User, AddOptions::default())
    }

    pub fn add_assistant(&mut self, content: impl Into<String>) -> ContextItem {
        self.add(content, Role::Assistant, AddOptions::default())
    }

    pub fn add_tool(&mut self, content: impl Into<String>) -> ContextItem {
        self.add(content, Role::Tool, AddOptions::default())
    }

    /// Evict lowest-priority non-system items until the total fits the limit.
    ///
    /// Runs automatically after every insertion. Returns the evicted items.
    pub fn enforce_limit(&mut self) -> Vec<ContextItem> {
        let limit = self.limit();
        let mut evicted = Vec::new();

        while self.total_tokens() > limit && self.items.len() > 1 {
            let victim = self
                .items
                .iter()
                .enumerate()
                .filter(|(_, item)| item.role != Role::System)
                .min_by(|(_, a), (_, b)| a.priority.total_cmp(&b.priority))
                .map(|(idx, _)| idx);

            let Some(idx) = victim else {
                warn!(
                    total_tokens = self.total_tokens(),
                    limit,
                    "context over limit with only system content left"
                );
                break;
            };

            let item = self.detach(idx);
            self.evictions += 1;
            debug!(
                id = %item.id,
                role = %item.role,
                priority = item.priority,
                tokens = item.tokens,
                "context item evicted"
            );
            evicted.push(item);
        }
        evicted
    }

    /// Remove one item by id.
    pub fn remove(&mut self, id: &str) -> Option<ContextItem> {
        let idx = self.items.iter().position(|item| item.id == id)?;
        Some(self.detach(idx))
    }

    /// Remove every item. Conversation counters in the ledger are kept.
    pub fn clear(&mut self) {
        for item in std::mem::take(&mut self.items) {
            self.ledger.release(item.segment, item.tokens);
        }
    }

    /// Shrink the context.
    ///
    /// Without a summarizer: drop non-system items below the eviction
    /// threshold, then keep only the most recent half of the non-system items
    /// that remain (rounded up). With a summarizer: replace every non-system
    /// item with one summary item. Summarizer errors propagate unchanged and
    /// leave the context untouched.
    pub async fn compress(
        &mut self,
        summarizer: Option<&dyn Summarizer>,
    ) -> Result<CompressionReport, ContextError> {
        let items_before = self.items.len();
        let tokens_before = self.total_tokens();

        let summarized = match summarizer {
            Some(summarizer) => self.summarize_with(summarizer).await?,
            None => {
                self.compress_by_priority();
                false
            }
        };
        self.enforce_limit();

        let report = CompressionReport {
            items_before,
            items_after: self.items.len(),
            tokens_before,
            tokens_after: self.total_tokens(),
            summarized,
        };
        info!(
            items_before,
            items_after = report.items_after,
            tokens_before,
            tokens_after = report.tokens_after,
            summarized,
            "context compressed"
        );
        Ok(report)
    }

    fn compress_by_priority(&mut self) {
        let threshold = self.config.eviction_threshold;
        let below: Vec<String> = self
            .items
            .iter()
            .filter(|item| item.role != Role::System && item.priority < threshold)
            .map(|item| item.id.clone())
            .collect();
        for id in &below {
            self.remove(id);
        }

        let rest: Vec<String> = self
            .items
            .iter()
            .filter(|item| item.role != Role::System)
            .map(|item| item.id.clone())
            .collect();
        let keep = rest.len().div_ceil(2);
        for id in &rest[..rest.len() - keep] {
            self.remove(id);
        }
    }

    async fn summarize_with(&mut self, summarizer: &dyn Summarizer) -> Result<bool, ContextError> {
        let candidates = self.to_optimizable();
        if candidates.is_empty() {
            return Ok(false);
        }
        let summary = summarizer.summarize(&candidates).await?;

        for candidate in &candidates {
            self.remove(&candidate.id);
        }
        let mut metadata = HashMap::new();
        metadata.insert("type".to_string(), serde_json::Value::from("summary"));
        metadata.insert("replaced".to_string(), serde_json::Value::from(candidates.len()));
        let item = ContextItem {
            id: self.next_item_id(),
            tokens: self.estimator.estimate(&summary),
            content: summary,
            role: Role::Assistant,
            priority: SUMMARY_PRIORITY,
            timestamp: Utc::now(),
            segment: ContextSegment::History,
            metadata,
        };
        self.insert(item);
        Ok(true)
    }

    /// Live non-system items as optimizer input.
    pub fn to_optimizable(&self) -> Vec<OptimizableItem> {
        self.items
            .iter()
            .filter(|item| item.role != Role::System)
            .map(ContextItem::to_optimizable)
            .collect()
    }

    /// Bring the item set in line with an optimizer result produced from
    /// [`to_optimizable`](Self::to_optimizable).
    ///
    /// Only items that were part of `result.original` are touched: those
    /// missing from `result.optimized` are removed and those whose content
    /// was rewritten are updated in place. Items added after the export are
    /// left alone, and exported items that have since been evicted stay
    /// evicted. Ids in `result.optimized` that were never exported (such as a
    /// summary) are appended as assistant content. Returns the number of
    /// items removed.
    pub fn apply_optimization(&mut self, result: &OptimizationResult) -> usize {
        let exported: HashSet<&str> = result.original.iter().map(|i| i.id.as_str()).collect();
        let survivors: HashMap<&str, &OptimizableItem> = result
            .optimized
            .iter()
            .map(|item| (item.id.as_str(), item))
            .collect();

        let mut removed = 0;
        let mut idx = 0;
        while idx < self.items.len() {
            let item = &self.items[idx];
            if item.role == Role::System || !exported.contains(item.id.as_str()) {
                idx += 1;
                continue;
            }
            match survivors.get(item.id.as_str()) {
                None => {
                    self.detach(idx);
                    removed += 1;
                }
                Some(updated) => {
                    if updated.content != item.content {
                        let tokens = updated
                            .tokens
                            .unwrap_or_else(|| self.estimator.estimate(&updated.content));
                        let item = &mut self.items[idx];
                        self.ledger.release(item.segment, item.tokens);
                        self.ledger.record(item.segment, tokens);
                        item.content = updated.content.clone();
                        item.tokens = tokens;
                    }
                    idx += 1;
                }
            }
        }

        let known: HashSet<String> = self.items.iter().map(|item| item.id.clone()).collect();
        let synthetic = result
            .optimized
            .iter()
            .filter(|i| !exported.contains(i.id.as_str()) && !known.contains(&i.id));
        for new_item in synthetic {
            let mut metadata = HashMap::new();
            if let Some(kind) = &new_item.kind {
                metadata.insert("type".to_string(), serde_json::Value::from(kind.as_str()));
            }
            let item = ContextItem {
                id: new_item.id.clone(),
                content: new_item.content.clone(),
                role: Role::Assistant,
                priority: new_item.priority,
                tokens: new_item
                    .tokens
                    .unwrap_or_else(|| self.estimator.estimate(&new_item.content)),
                timestamp: DateTime::from_timestamp_millis(new_item.timestamp)
                    .unwrap_or_else(Utc::now),
                segment: ContextSegment::History,
                metadata,
            };
            self.insert(item);
        }

        debug!(removed, strategy = %result.strategy, "optimization applied");
        self.enforce_limit();
        removed
    }

    /// Whether live usage has reached `threshold` of the limit.
    pub fn needs_compaction(&self, threshold: f64) -> bool {
        self.budget().utilization >= threshold
    }

    /// Items serialized as `"{role}: {content}"` lines, in insertion order.
    pub fn build(&self) -> String {
        self.items
            .iter()
            .map(|item| format!("{}: {}", item.role, item.content))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Items as role/content pairs, in insertion order.
    pub fn build_messages(&self) -> Vec<PromptMessage> {
        self.items
            .iter()
            .map(|item| PromptMessage {
                role: item.role,
                content: item.content.clone(),
            })
            .collect()
    }

    pub fn budget(&self) -> ManagerBudget {
        let used = self.total_tokens();
        let limit = self.limit();
        ManagerBudget {
            max_tokens: self.config.max_tokens,
            reserved_tokens: self.config.reserved_tokens,
            used_tokens: used,
            available_tokens: limit as i64 - used as i64,
            utilization: if limit > 0 {
                used as f64 / limit as f64
            } else {
                1.0
            },
        }
    }

    pub fn stats(&self) -> ContextStats {
        let mut by_role = RoleCounts::default();
        for item in &self.items {
            match item.role {
                Role::System => by_role.system += 1,
                Role::User => by_role.user += 1,
                Role::Assistant => by_role.assistant += 1,
                Role::Tool => by_role.tool += 1,
            }
        }
        ContextStats {
            item_count: self.items.len(),
            total_tokens: self.total_tokens(),
            by_role,
            oldest: self.items.iter().map(|i| i.timestamp).min(),
            newest: self.items.iter().map(|i| i.timestamp).max(),
            evictions: self.evictions,
        }
    }

    pub fn total_tokens(&self) -> usize {
        self.items.iter().map(|item| item.tokens).sum()
    }

    pub fn items(&self) -> &[ContextItem] {
        &self.items
    }

    pub fn get(&self, id: &str) -> Option<&ContextItem> {
        self.items.iter().find(|item| item.id == id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn ledger(&self) -> &ContextLedger {
        &self.ledger
    }

    fn next_item_id(&mut self) -> String {
        let id = format!("ctx-{}", self.next_id);
        self.next_id += 1;
        id
    }

    fn insert(&mut self, item: ContextItem) {
        self.ledger.record(item.segment, item.tokens);
        self.ledger.record_message();
        match item.role {
            Role::User => self.ledger.record_turn(),
            Role::Tool => self.ledger.record_tool_call(),
            Role::System | Role::Assistant => {}
        }
        self.items.push(item);
    }

    fn detach(&mut self, idx: usize) -> ContextItem {
        let item = self.items.remove(idx);
        self.ledger.release(item.segment, item.tokens);
        item
    }
}
