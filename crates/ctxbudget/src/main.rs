//! Run the context optimizer over a JSON file of items and report the result.
//!
//! Logs go to stderr; set `RUST_LOG=ctxbudget=debug` to see every strategy
//! step and eviction.
//!
//! # Examples
//!
//! ```sh
//! # Default strategy chain, target from the config file
//! ctxbudget items.json --config engine.json
//!
//! # Pipe items from stdin with an explicit target and chain
//! cat items.json | ctxbudget --target 2000 \
//!   --strategy deduplicate --strategy truncate-low-priority
//!
//! # Machine-readable report
//! ctxbudget items.json --target 500 --json
//! ```

use std::io::{self, Read};
use std::path::PathBuf;
use std::process;

use clap::Parser;
use ctxbudget::EngineConfig;
use ctxbudget::context::optimizer::{
    ContextOptimizer, ContextOptimizerConfig, OptimizableItem, OptimizationResult,
    OptimizationStrategy,
};
use tracing_subscriber::EnvFilter;

/// Shrink a set of context items below a token target and report what was
/// kept and what was dropped.
#[derive(Parser)]
#[command(name = "ctxbudget")]
struct Cli {
    // ── Input ──────────────────────────────────────────────────
    /// JSON array of items (`id`, `content`, `priority`, `timestamp`).
    /// Reads stdin when omitted or `-`.
    items: Option<PathBuf>,

    /// Engine config JSON file
    #[arg(long)]
    config: Option<PathBuf>,

    // ── Optimizer overrides ────────────────────────────────────
    /// Token target (overrides the config)
    #[arg(long)]
    target: Option<usize>,

    /// Strategy to apply, in order; repeatable (overrides the config)
    #[arg(long = "strategy")]
    strategies: Vec<OptimizationStrategy>,

    /// Drop items below this priority under truncate-low-priority
    #[arg(long)]
    min_priority: Option<f64>,

    /// Characters per token for estimation
    #[arg(long)]
    token_ratio: Option<f64>,

    // ── Output mode ────────────────────────────────────────────
    /// Print the full result as JSON
    #[arg(long)]
    json: bool,
}

// ── Helpers ────────────────────────────────────────────────────────

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn read_items(path: Option<&PathBuf>) -> Result<Vec<OptimizableItem>, String> {
    let content = match path {
        Some(path) if path.as_os_str() != "-" => std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read items file '{}': {e}", path.display()))?,
        _ => {
            let mut buf = String::new();
            io::stdin()
                .read_to_string(&mut buf)
                .map_err(|e| format!("failed to read stdin: {e}"))?;
            buf
        }
    };
    serde_json::from_str(&content).map_err(|e| format!("failed to parse items: {e}"))
}

fn load_config(path: Option<&PathBuf>) -> Result<EngineConfig, String> {
    match path {
        Some(path) => EngineConfig::from_json_file(path)
            .map_err(|e| format!("failed to load config '{}': {e}", path.display())),
        None => Ok(EngineConfig::default()),
    }
}

/// Merge the config file's optimizer section with command-line overrides.
/// Falls back to the manager's live limit when no target is given anywhere.
fn optimizer_config(cli: &Cli, engine: &EngineConfig) -> ContextOptimizerConfig {
    let fallback_target = engine
        .manager
        .max_tokens
        .saturating_sub(engine.manager.reserved_tokens);
    let mut config = engine
        .optimizer
        .clone()
        .unwrap_or_else(|| ContextOptimizerConfig::new(fallback_target));

    if let Some(target) = cli.target {
        config.target_tokens = target;
    }
    if !cli.strategies.is_empty() {
        config = config.with_strategies(cli.strategies.iter().copied());
    }
    if let Some(min_priority) = cli.min_priority {
        config = config.with_min_priority(min_priority);
    }
    if let Some(ratio) = cli.token_ratio {
        config = config.with_token_ratio(ratio);
    }
    config
}

fn text_report(result: &OptimizationResult, target: usize) -> String {
    let mut out = String::new();
    out.push_str(&result.to_log_string());
    out.push('\n');
    out.push_str(&format!(
        "target: {target} tokens ({})\n",
        if result.fits(target) { "met" } else { "NOT met" }
    ));

    out.push_str("\nkept:\n");
    for item in &result.optimized {
        out.push_str(&format!(
            "  {:<24} {:>7} tokens  p={:.2}\n",
            item.id,
            item.token_count(),
            item.priority
        ));
    }
    if !result.removed.is_empty() {
        out.push_str("\nremoved:\n");
        for item in &result.removed {
            out.push_str(&format!(
                "  {:<24} {:>7} tokens  p={:.2}\n",
                item.id,
                item.token_count(),
                item.priority
            ));
        }
    }
    out
}

async fn run(cli: &Cli) -> Result<String, String> {
    let engine = load_config(cli.config.as_ref())?;
    let items = read_items(cli.items.as_ref())?;
    let config = optimizer_config(cli, &engine);
    let target = config.target_tokens;

    let optimizer = ContextOptimizer::new(config);
    let result = optimizer
        .optimize(items)
        .await
        .map_err(|e| format!("optimization failed: {e}"))?;

    if cli.json {
        serde_json::to_string_pretty(&result)
            .map(|json| format!("{json}\n"))
            .map_err(|e| format!("failed to serialize result: {e}"))
    } else {
        Ok(text_report(&result, target))
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing();

    match run(&cli).await {
        Ok(report) => print!("{report}"),
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    }
}
