//! Engine-wide configuration loaded from JSON.
//!
//! Groups the per-component configs so a host can keep one file next to its
//! agent profile:
//!
//! ```json
//! {
//!   "budgeter": { "total_budget": 100000, "strategy": "priority" },
//!   "manager": { "max_tokens": 128000, "reserved_tokens": 4096 },
//!   "optimizer": { "target_tokens": 60000, "strategies": ["deduplicate", "compress"] },
//!   "allocation": { "model_limit": 200000, "output_reserve": 8192, "history": "remainder" }
//! }
//! ```
//!
//! Every section is optional. Missing sections fall back to the component
//! defaults, or to `None` where the component has no sensible default.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::context::budgeter::ContextBudgeterConfig;
use crate::context::ledger::BudgetAllocation;
use crate::context::manager::ContextManagerConfig;
use crate::context::optimizer::ContextOptimizerConfig;
use crate::error::ContextError;

/// Configuration for every component of the context engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub budgeter: Option<ContextBudgeterConfig>,
    pub manager: ContextManagerConfig,
    pub optimizer: Option<ContextOptimizerConfig>,
    /// Segment schema for the ledger. Validated on load.
    pub allocation: Option<BudgetAllocation>,
}

impl EngineConfig {
    /// Parse and validate a config from a JSON string.
    pub fn from_json_str(json: &str) -> Result<Self, ContextError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse, and validate a config file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ContextError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_json_str(&content)?;
        debug!(path = %path.display(), "loaded engine config");
        Ok(config)
    }

    /// Check cross-field constraints serde cannot express.
    pub fn validate(&self) -> Result<(), ContextError> {
        if let Some(allocation) = &self.allocation {
            allocation.validate()?;
        }
        if let Some(budgeter) = &self.budgeter
            && budgeter.total_budget == 0
        {
            return Err(ContextError::Config(
                "budgeter.total_budget must be positive".into(),
            ));
        }
        if self.manager.max_tokens == 0 {
            return Err(ContextError::Config(
                "manager.max_tokens must be positive".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.manager.eviction_threshold) {
            return Err(ContextError::Config(format!(
                "manager.eviction_threshold must be within [0, 1], got {}",
                self.manager.eviction_threshold
            )));
        }
        Ok(())
    }
}
