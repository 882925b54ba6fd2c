//! Convenience re-exports for common `ctxbudget` types.
//!
//! Meant to be glob-imported by agent loops:
//!
//! ```
//! use ctxbudget::prelude::*;
//! ```
//!
//! Specialized types (ledger usage reports, cache, free-standing strategy
//! helpers) are left out. Import those from their modules directly.

// ── Errors and config ───────────────────────────────────────────────
pub use crate::{ContextError, EngineConfig};

// ── Budgeting ───────────────────────────────────────────────────────
pub use crate::context::{
    AllocationStrategy, BudgetAllocation, ContextBudgeter, ContextBudgeterConfig, ContextLedger,
    ContextSegment, TokenEstimator,
};

// ── Conversation items ──────────────────────────────────────────────
pub use crate::context::{AddOptions, ContextManager, ContextManagerConfig, Role};

// ── Optimization ────────────────────────────────────────────────────
pub use crate::context::{
    ContextOptimizer, ContextOptimizerConfig, FnSummarizer, OptimizableItem, OptimizationResult,
    OptimizationStrategy, Summarizer, TimeoutSummarizer,
};
