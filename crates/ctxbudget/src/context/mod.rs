//! Context window budgeting, management, and optimization.
//!
//! The context window is the scarcest resource an agent has. This module
//! splits the work of keeping it under control into layers:
//!
//! 1. **[`estimator`]**: [`TokenEstimator`] turns text into a token count
//!    with a fixed chars-per-token ratio. Cheap, deterministic, tokenizer-free.
//!
//! 2. **[`ledger`]**: [`BudgetAllocation`] divides a model's window into
//!    segment quotas; [`ContextLedger`] tracks live usage per segment.
//!
//! 3. **[`budgeter`]**: [`ContextBudgeter`] grants named, prioritized token
//!    allocations and evicts lower-priority ones under pressure.
//!
//! 4. **[`manager`]**: [`ContextManager`] owns the conversation items, enforces
//!    the window limit by evicting the least valuable non-system items, and
//!    assembles the prompt.
//!
//! 5. **[`optimizer`]**: [`ContextOptimizer`] shrinks a set of items below a
//!    target with a chain of strategies (truncate, deduplicate, compress,
//!    summarize).
//!
//! Summarization is the only step that needs an LLM; it goes through the
//! injected [`Summarizer`] in [`summarizer`]. [`cache`] holds a caller-owned
//! response cache that can be bounded by a budgeter allocation.

pub mod budgeter;
pub mod cache;
pub mod estimator;
pub mod ledger;
pub mod manager;
pub mod optimizer;
pub mod summarizer;

// Re-export commonly used items at the module level.
pub use budgeter::{
    Allocation, AllocationId, AllocationStrategy, ContextBudgeter, ContextBudgeterConfig,
};
pub use cache::ResponseCache;
pub use estimator::{DEFAULT_CHARS_PER_TOKEN, TokenEstimator};
pub use ledger::{BudgetAllocation, ContextLedger, ContextSegment, HistoryBudget};
pub use manager::{AddOptions, ContextItem, ContextManager, ContextManagerConfig, Role};
pub use optimizer::{
    ContextOptimizer, ContextOptimizerConfig, OptimizableItem, OptimizationResult,
    OptimizationStrategy,
};
pub use summarizer::{FnSummarizer, Summarizer, TimeoutSummarizer};
