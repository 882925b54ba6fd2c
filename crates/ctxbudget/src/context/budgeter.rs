//! Named token allocations against a fixed total budget.
//!
//! A [`ContextBudgeter`] hands out quotas ("tool outputs get at most 2,000
//! tokens") before content is written into the context. A fraction of the
//! total is held back as a response reserve and is never allocatable.
//!
//! Running out of budget is expected, not exceptional: [`allocate`] returns
//! `None` and [`use_tokens`] returns `false`, and callers degrade (skip
//! caching a response, include less content).
//!
//! [`allocate`]: ContextBudgeter::allocate
//! [`use_tokens`]: ContextBudgeter::use_tokens

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::estimator::{DEFAULT_CHARS_PER_TOKEN, TokenEstimator};

/// Default fraction of the total budget held back for the model response.
pub const DEFAULT_RESPONSE_RESERVE_FRACTION: f64 = 0.20;

/// Default priority for new allocations.
pub const DEFAULT_ALLOCATION_PRIORITY: u8 = 5;

/// How the budgeter reacts when a request exceeds what is available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationStrategy {
    /// Evict strictly lower-priority allocations to make room.
    #[default]
    Priority,
    /// Never evict; clip the grant to what is available.
    FirstCome,
}

/// Configuration for a [`ContextBudgeter`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextBudgeterConfig {
    /// Total tokens this budgeter arbitrates.
    pub total_budget: usize,
    /// Tokens never allocatable to content. Default: 20% of `total_budget`.
    #[serde(default)]
    pub response_reserve: Option<usize>,
    #[serde(default)]
    pub strategy: AllocationStrategy,
    #[serde(default = "default_token_ratio")]
    pub token_ratio: f64,
}

fn default_token_ratio() -> f64 {
    DEFAULT_CHARS_PER_TOKEN
}

impl ContextBudgeterConfig {
    pub fn new(total_budget: usize) -> Self {
        Self {
            total_budget,
            response_reserve: None,
            strategy: AllocationStrategy::default(),
            token_ratio: DEFAULT_CHARS_PER_TOKEN,
        }
    }

    pub fn with_response_reserve(mut self, tokens: usize) -> Self {
        self.response_reserve = Some(tokens);
        self
    }

    pub fn with_strategy(mut self, strategy: AllocationStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_token_ratio(mut self, ratio: f64) -> Self {
        self.token_ratio = ratio;
        self
    }

    /// The reserve in tokens, resolving the 20% default. Never exceeds the
    /// total budget.
    pub fn resolved_reserve(&self) -> usize {
        self.response_reserve
            .unwrap_or_else(|| {
                (self.total_budget as f64 * DEFAULT_RESPONSE_RESERVE_FRACTION) as usize
            })
            .min(self.total_budget)
    }
}

/// Identifier of a granted allocation. Monotonic per budgeter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AllocationId(u64);

impl fmt::Display for AllocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "alloc-{}", self.0)
    }
}

/// A named claim against the budgeter's total.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Allocation {
    pub id: AllocationId,
    pub name: String,
    /// Tokens granted.
    pub allocated: usize,
    /// Tokens debited so far. Always `<= allocated`.
    pub used: usize,
    pub priority: u8,
}

impl Allocation {
    /// Tokens still available inside this allocation.
    pub fn remaining(&self) -> usize {
        self.allocated - self.used
    }
}

/// Snapshot of a budgeter's state.
#[derive(Debug, Clone, Serialize)]
pub struct BudgeterStats {
    pub total_budget: usize,
    pub response_reserve: usize,
    pub allocated: usize,
    pub used: usize,
    pub available: usize,
    pub allocation_count: usize,
    pub evictions: usize,
}

/// Arbitrates a fixed token budget among named allocations.
///
/// Scoped to one agent or session; there is no internal locking.
///
/// # Example
///
/// ```
/// use ctxbudget::context::budgeter::{ContextBudgeter, ContextBudgeterConfig};
///
/// let mut budgeter = ContextBudgeter::new(
///     ContextBudgeterConfig::new(1_000).with_response_reserve(200),
/// );
/// let tools = budgeter.allocate("tool_outputs", 500, 3).unwrap();
/// assert_eq!(tools.allocated, 500);
/// assert_eq!(budgeter.available(), 300);
///
/// // A higher-priority request evicts the lower-priority allocation.
/// let history = budgeter.allocate("history", 700, 8).unwrap();
/// assert_eq!(history.allocated, 700);
/// assert!(budgeter.get(tools.id).is_none());
/// ```
#[derive(Debug)]
pub struct ContextBudgeter {
    total_budget: usize,
    response_reserve: usize,
    strategy: AllocationStrategy,
    estimator: TokenEstimator,
    /// Kept in insertion order; ids are monotonic, so order == sequence.
    allocations: Vec<Allocation>,
    next_id: u64,
    evictions: usize,
}

impl ContextBudgeter {
    pub fn new(config: ContextBudgeterConfig) -> Self {
        Self {
            total_budget: config.total_budget,
            response_reserve: config.resolved_reserve(),
            strategy: config.strategy,
            estimator: TokenEstimator::new(config.token_ratio),
            allocations: Vec::new(),
            next_id: 1,
            evictions: 0,
        }
    }

    pub fn total_budget(&self) -> usize {
        self.total_budget
    }

    pub fn response_reserve(&self) -> usize {
        self.response_reserve
    }

    pub fn estimator(&self) -> &TokenEstimator {
        &self.estimator
    }

    /// Tokens that can still be granted to new allocations.
    pub fn available(&self) -> usize {
        self.total_budget
            .saturating_sub(self.response_reserve)
            .saturating_sub(self.total_allocated())
    }

    /// Sum of granted tokens across live allocations.
    pub fn total_allocated(&self) -> usize {
        self.allocations.iter().map(|a| a.allocated).sum()
    }

    /// Sum of debited tokens across live allocations.
    pub fn total_used(&self) -> usize {
        self.allocations.iter().map(|a| a.used).sum()
    }

    /// Request `requested` tokens under `name`.
    ///
    /// Under [`AllocationStrategy::Priority`], a request that does not fit
    /// evicts allocations with a strictly lower priority (lowest first, oldest
    /// first among equals) until it fits or no candidates remain. The grant is
    /// `min(requested, available)`. Returns `None` when nothing can be granted.
    pub fn allocate(
        &mut self,
        name: impl Into<String>,
        requested: usize,
        priority: u8,
    ) -> Option<Allocation> {
        let name = name.into();

        if requested > self.available() && self.strategy == AllocationStrategy::Priority {
            let needed = requested - self.available();
            self.evict_lower_priority(priority, needed);
        }

        let granted = requested.min(self.available());
        if granted == 0 {
            debug!(name = %name, requested, priority, "no budget available");
            return None;
        }

        let allocation = Allocation {
            id: AllocationId(self.next_id),
            name,
            allocated: granted,
            used: 0,
            priority,
        };
        self.next_id += 1;

        debug!(
            id = %allocation.id,
            name = %allocation.name,
            requested,
            granted,
            priority,
            available = self.available() - granted,
            "allocation granted"
        );
        self.allocations.push(allocation.clone());
        Some(allocation)
    }

    /// [`allocate`](Self::allocate) with the default priority.
    pub fn allocate_default(&mut self, name: impl Into<String>, requested: usize) -> Option<Allocation> {
        self.allocate(name, requested, DEFAULT_ALLOCATION_PRIORITY)
    }

    /// Debit `tokens` from an allocation.
    ///
    /// Returns `false` without changing anything if the allocation is unknown
    /// or the debit would exceed its grant.
    pub fn use_tokens(&mut self, id: AllocationId, tokens: usize) -> bool {
        let Some(allocation) = self.allocations.iter_mut().find(|a| a.id == id) else {
            return false;
        };
        if tokens > allocation.remaining() {
            trace!(%id, tokens, remaining = allocation.remaining(), "debit rejected");
            return false;
        }
        allocation.used += tokens;
        true
    }

    /// Debit the estimated token cost of `text`.
    pub fn use_text(&mut self, id: AllocationId, text: &str) -> bool {
        let tokens = self.estimator.estimate(text);
        self.use_tokens(id, tokens)
    }

    /// Credit `tokens` back to an allocation when content it paid for is
    /// dropped. Saturates at zero used.
    ///
    /// Returns `false` if the allocation is unknown (released or evicted).
    pub fn refund(&mut self, id: AllocationId, tokens: usize) -> bool {
        let Some(allocation) = self.allocations.iter_mut().find(|a| a.id == id) else {
            return false;
        };
        allocation.used = allocation.used.saturating_sub(tokens);
        trace!(%id, tokens, used = allocation.used, "tokens refunded");
        true
    }

    /// Whether `text` would fit in what remains of the allocation.
    pub fn fits(&self, id: AllocationId, text: &str) -> bool {
        self.get(id)
            .is_some_and(|a| a.used + self.estimator.estimate(text) <= a.allocated)
    }

    /// Drop an allocation and return its grant to the pool.
    pub fn release(&mut self, id: AllocationId) -> bool {
        let Some(pos) = self.allocations.iter().position(|a| a.id == id) else {
            return false;
        };
        let released = self.allocations.remove(pos);
        debug!(%id, name = %released.name, freed = released.allocated, "allocation released");
        true
    }

    pub fn get(&self, id: AllocationId) -> Option<&Allocation> {
        self.allocations.iter().find(|a| a.id == id)
    }

    /// The oldest live allocation with this name.
    pub fn find(&self, name: &str) -> Option<&Allocation> {
        self.allocations.iter().find(|a| a.name == name)
    }

    /// Live allocations in insertion order.
    pub fn allocations(&self) -> &[Allocation] {
        &self.allocations
    }

    /// Drop every allocation.
    pub fn reset(&mut self) {
        self.allocations.clear();
    }

    pub fn stats(&self) -> BudgeterStats {
        BudgeterStats {
            total_budget: self.total_budget,
            response_reserve: self.response_reserve,
            allocated: self.total_allocated(),
            used: self.total_used(),
            available: self.available(),
            allocation_count: self.allocations.len(),
            evictions: self.evictions,
        }
    }

    /// Evict allocations with `priority < min_priority` until `needed` tokens
    /// are freed or no candidates remain. Returns the tokens freed.
    ///
    /// Candidates are ordered by `(priority, insertion sequence)` so ties
    /// always resolve oldest-first.
    fn evict_lower_priority(&mut self, min_priority: u8, needed: usize) -> usize {
        let mut candidates: Vec<(u8, AllocationId)> = self
            .allocations
            .iter()
            .filter(|a| a.priority < min_priority)
            .map(|a| (a.priority, a.id))
            .collect();
        candidates.sort();

        let mut freed = 0;
        for (_, id) in candidates {
            if freed >= needed {
                break;
            }
            if let Some(pos) = self.allocations.iter().position(|a| a.id == id) {
                let evicted = self.allocations.remove(pos);
                freed += evicted.allocated;
                self.evictions += 1;
                debug!(
                    id = %evicted.id,
                    name = %evicted.name,
                    priority = evicted.priority,
                    freed = evicted.allocated,
                    "allocation evicted"
                );
            }
        }
        freed
    }
}
