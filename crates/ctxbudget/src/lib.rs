//! Token budgeting, context management, and compaction for LLM agents.
//!
//! `ctxbudget` answers one question for an agent loop: what goes into the
//! next prompt, given a finite context window? It estimates token costs,
//! hands out prioritized token quotas, keeps the conversation under the
//! model limit, and shrinks oversized context with a chain of strategies.
//!
//! Nothing here talks to a model. Summarization is injected through the
//! [`Summarizer`](context::summarizer::Summarizer) trait, so the crate runs
//! the same way in tests and in production.
//!
//! # Getting started
//!
//! ```
//! use ctxbudget::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), ContextError> {
//! // Keep the conversation inside the window.
//! let mut manager = ContextManager::new(
//!     ContextManagerConfig::default()
//!         .with_max_tokens(8_000)
//!         .with_reserved_tokens(1_000),
//! );
//! manager.add_system("You are a careful code reviewer.");
//! manager.add_user("Review src/lib.rs.");
//!
//! // Shrink the history below a target when it grows.
//! let optimizer = ContextOptimizer::new(ContextOptimizerConfig::new(2_000));
//! let result = optimizer.optimize(manager.to_optimizable()).await?;
//! manager.apply_optimization(&result);
//!
//! println!("{}", manager.build());
//! # Ok(())
//! # }
//! ```
//!
//! # Where to find things
//!
//! - **Estimate token costs:** [`TokenEstimator`](context::estimator::TokenEstimator).
//! - **Split a window into segments:** [`BudgetAllocation`](context::ledger::BudgetAllocation)
//!   and [`ContextLedger`](context::ledger::ContextLedger).
//! - **Grant named token quotas:** [`ContextBudgeter`](context::budgeter::ContextBudgeter).
//! - **Manage conversation items:** [`ContextManager`](context::manager::ContextManager).
//! - **Compact context:** [`ContextOptimizer`](context::optimizer::ContextOptimizer)
//!   and [`OptimizationStrategy`](context::optimizer::OptimizationStrategy).
//! - **Plug in an LLM summarizer:** [`FnSummarizer`](context::summarizer::FnSummarizer)
//!   and [`TimeoutSummarizer`](context::summarizer::TimeoutSummarizer).
//! - **Load settings from disk:** [`EngineConfig`](config::EngineConfig).
//!
//! # Logging
//!
//! Every component logs through [`tracing`]. The library never installs a
//! subscriber; that is the host's job.

pub mod config;
pub mod context;
pub mod error;
pub mod prelude;

pub use config::EngineConfig;
pub use error::ContextError;
