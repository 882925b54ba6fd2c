//! End-to-end tests for the context engine.
//!
//! These exercise the public API only: budgeter, manager, optimizer, and
//! config loading working together the way an agent loop drives them.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use ctxbudget::context::cache::ResponseCache;
use ctxbudget::prelude::*;

/// Helper: a budgeter with an explicit reserve.
fn budgeter(total: usize, reserve: usize) -> ContextBudgeter {
    ContextBudgeter::new(ContextBudgeterConfig::new(total).with_response_reserve(reserve))
}

/// Helper: an item with a fixed token cost.
fn item(id: &str, content: &str, priority: f64, timestamp: i64, tokens: usize) -> OptimizableItem {
    OptimizableItem::new(id, content, priority, timestamp).with_tokens(tokens)
}

fn ids(items: &[OptimizableItem]) -> Vec<&str> {
    items.iter().map(|i| i.id.as_str()).collect()
}

// ── Budgeter ─────────────────────────────────────────────────────────

#[test]
fn grants_never_eat_into_the_reserve() {
    let mut b = budgeter(1_000, 200);
    let mut live = Vec::new();
    // Deterministic pseudo-random walk over allocate/release.
    let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
    for step in 0..500 {
        seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        let roll = (seed >> 33) as usize;
        if roll % 3 == 0 && !live.is_empty() {
            let id = live.remove(roll % live.len());
            b.release(id);
        } else {
            let requested = roll % 600 + 1;
            let priority = (roll % 10) as u8;
            if let Some(a) = b.allocate(format!("a{step}"), requested, priority) {
                assert!(a.allocated <= requested);
                live.push(a.id);
            }
            live.retain(|id| b.get(*id).is_some());
        }
        assert!(
            b.total_allocated() + b.response_reserve() <= b.total_budget(),
            "reserve violated at step {step}"
        );
    }
}

#[test]
fn use_never_exceeds_grant() {
    let mut b = budgeter(1_000, 200);
    let a = b.allocate("tool_outputs", 100, 5).unwrap();

    assert!(b.use_tokens(a.id, 60));
    assert!(b.use_tokens(a.id, 40));
    assert_eq!(b.get(a.id).unwrap().used, 100);

    // Full: any further debit is rejected and changes nothing.
    assert!(!b.use_tokens(a.id, 1));
    assert_eq!(b.get(a.id).unwrap().used, 100);
    assert!(!b.fits(a.id, "x"));
    assert!(b.fits(a.id, ""));
}

#[test]
fn higher_priority_request_evicts_lower_priority_allocation() {
    let mut b = budgeter(1_000, 200);

    let tools = b.allocate("toolOutputs", 500, 3).unwrap();
    assert_eq!(tools.allocated, 500);
    assert_eq!(b.available(), 300);

    let history = b.allocate("history", 700, 8).unwrap();
    assert_eq!(history.allocated, 700);
    assert!(b.get(tools.id).is_none());
    assert!(b.find("toolOutputs").is_none());
    assert_eq!(b.available(), 100);
    assert_eq!(b.stats().evictions, 1);
}

#[test]
fn exhausted_budget_degrades_to_none() {
    let mut b = budgeter(1_000, 200);
    b.allocate("history", 800, 9).unwrap();
    assert!(b.allocate("memory", 10, 9).is_none());
    assert!(b.allocate("memory", 10, 1).is_none());
}

#[test]
fn tool_output_gated_by_allocation_before_entering_manager() {
    let mut b = budgeter(1_000, 200);
    let quota = b.allocate("tool_outputs", 20, 4).unwrap();
    let mut manager = ContextManager::default();

    let small = "ok: 3 files changed";
    let large = "x".repeat(400);
    for output in [small, large.as_str()] {
        if b.fits(quota.id, output) {
            assert!(b.use_text(quota.id, output));
            manager.add_tool(output);
        }
    }

    assert_eq!(manager.len(), 1);
    assert_eq!(manager.items()[0].content, small);
    assert_eq!(b.get(quota.id).unwrap().used, 5);
}

#[test]
fn response_cache_skips_when_allocation_is_full() {
    let mut b = budgeter(1_000, 200);
    let quota = b.allocate("cache", 10, 2).unwrap();
    let mut cache = ResponseCache::new(8);

    assert!(cache.put_within(&mut b, quota.id, "list files", "a.rs b.rs".into(), 1));
    assert!(!cache.put_within(&mut b, quota.id, "read a.rs", "y".repeat(100), 1));

    assert_eq!(cache.get("list   files"), Some("a.rs b.rs"));
    assert_eq!(cache.get("read a.rs"), None);
}

// ── Manager ──────────────────────────────────────────────────────────

#[test]
fn system_content_survives_even_with_lowest_priority() {
    let mut manager = ContextManager::new(
        ContextManagerConfig::default()
            .with_max_tokens(50)
            .with_reserved_tokens(10),
    );
    let system = manager.add("s".repeat(100), Role::System, AddOptions::new().priority(0.1));
    manager.add("u".repeat(100), Role::User, AddOptions::new().priority(0.9));

    assert_eq!(manager.len(), 1);
    assert_eq!(manager.items()[0].id, system.id);
    assert_eq!(manager.budget().available_tokens, 15);
}

#[test]
fn over_limit_system_content_shows_as_negative_availability() {
    let mut manager = ContextManager::new(
        ContextManagerConfig::default()
            .with_max_tokens(50)
            .with_reserved_tokens(10),
    );
    manager.add_system("s".repeat(200));
    manager.add_user("hi");

    assert_eq!(manager.len(), 1);
    let budget = manager.budget();
    assert_eq!(budget.used_tokens, 50);
    assert_eq!(budget.available_tokens, -10);
    assert!(budget.utilization > 1.0);
}

// ── Optimizer ────────────────────────────────────────────────────────

#[tokio::test]
async fn fitting_input_is_returned_untouched() {
    let items = vec![
        item("a", "first", 0.5, 1, 10),
        item("b", "second", 0.5, 2, 10),
    ];
    let optimizer = ContextOptimizer::new(ContextOptimizerConfig::new(20));
    let result = optimizer.optimize(items.clone()).await.unwrap();

    assert_eq!(result.optimized, items);
    assert_eq!(result.original, items);
    assert!(result.removed.is_empty());
    assert_eq!(result.tokens_saved, 0);
    assert_eq!(result.strategy, OptimizationStrategy::TruncateOld);
}

#[tokio::test]
async fn every_strategy_accounts_for_every_item() {
    let items = vec![
        item("a", "alpha", 0.2, 1, 10),
        item("b", "ALPHA  ", 0.9, 2, 10),
        item("c", "gamma    gamma", 0.5, 3, 10),
        item("d", "delta", 0.7, 4, 10),
    ];

    for strategy in [
        OptimizationStrategy::TruncateOld,
        OptimizationStrategy::TruncateLowPriority,
        OptimizationStrategy::Deduplicate,
        OptimizationStrategy::Compress,
    ] {
        let optimizer = ContextOptimizer::new(
            ContextOptimizerConfig::new(15).with_strategies([strategy]),
        );
        let result = optimizer.optimize(items.clone()).await.unwrap();
        assert_eq!(
            result.optimized.len() + result.removed.len(),
            items.len(),
            "{strategy} lost or duplicated items"
        );
        assert_eq!(
            result.tokens_saved,
            result.original_tokens() - result.optimized_tokens()
        );
    }
}

#[tokio::test]
async fn summarize_collapses_to_one_item() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let summarizer = FnSummarizer::new(move |items: Vec<OptimizableItem>| {
        counter.fetch_add(1, Ordering::SeqCst);
        async move { Ok::<_, String>(format!("{} earlier steps", items.len())) }
    });
    let optimizer = ContextOptimizer::new(
        ContextOptimizerConfig::new(5).with_strategies([OptimizationStrategy::Summarize]),
    )
    .with_summarizer(summarizer);

    let items = vec![
        item("a", "read main.rs", 0.5, 10, 40),
        item("b", "ran tests", 0.8, 20, 40),
        item("c", "fixed bug", 0.6, 30, 40),
    ];
    let result = optimizer.optimize(items).await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(result.optimized.len(), 1);
    assert_eq!(result.removed.len(), 3);
    let summary = &result.optimized[0];
    assert!(summary.is_summary());
    assert_eq!(summary.content, "3 earlier steps");
    assert_eq!(summary.id, "summary-30");
    assert_eq!(summary.priority, 0.8);
    assert_eq!(result.strategy, OptimizationStrategy::Summarize);
}

#[tokio::test]
async fn summarizer_failure_propagates() {
    let summarizer = FnSummarizer::new(|_items: Vec<OptimizableItem>| async move {
        Err::<String, _>("rate limited")
    });
    let optimizer = ContextOptimizer::new(
        ContextOptimizerConfig::new(1).with_strategies([OptimizationStrategy::Summarize]),
    )
    .with_summarizer(summarizer);

    let err = optimizer
        .optimize(vec![item("a", "long content", 0.5, 1, 10)])
        .await
        .unwrap_err();
    assert!(matches!(err, ContextError::Summarizer(ref msg) if msg == "rate limited"));
}

#[tokio::test]
async fn deduplicate_ignores_case_and_whitespace() {
    let shared = "a".repeat(100);
    let items = vec![
        OptimizableItem::new("a", "Hello   World", 0.5, 1),
        OptimizableItem::new("b", "  hello world ", 0.5, 2),
        OptimizableItem::new("c", format!("{shared} tail one"), 0.5, 3),
        OptimizableItem::new("d", format!("{shared} tail two"), 0.5, 4),
        OptimizableItem::new("e", "something else", 0.5, 5),
    ];
    let optimizer = ContextOptimizer::new(
        ContextOptimizerConfig::new(1).with_strategies([OptimizationStrategy::Deduplicate]),
    );
    let result = optimizer.optimize(items).await.unwrap();

    assert_eq!(ids(&result.optimized), vec!["a", "c", "e"]);
    assert_eq!(ids(&result.removed), vec!["b", "d"]);
}

#[tokio::test]
async fn truncate_old_keeps_newest_fitting_prefix() {
    let items = vec![
        item("t1", "one", 0.5, 1, 5),
        item("t2", "two", 0.5, 2, 5),
        item("t3", "three", 0.5, 3, 5),
    ];
    let optimizer = ContextOptimizer::new(
        ContextOptimizerConfig::new(8).with_strategies([OptimizationStrategy::TruncateOld]),
    );
    let result = optimizer.optimize(items).await.unwrap();

    assert_eq!(ids(&result.optimized), vec!["t3"]);
    assert_eq!(ids(&result.removed), vec!["t1", "t2"]);
    assert_eq!(result.tokens_saved, 10);
}

#[tokio::test]
async fn chain_stops_once_target_is_met() {
    let items = vec![
        item("old", "stale", 0.9, 1, 50),
        item("mid", "middle", 0.1, 2, 30),
        item("new", "fresh", 0.5, 3, 30),
    ];
    let optimizer = ContextOptimizer::new(ContextOptimizerConfig::new(60));
    let result = optimizer.optimize(items).await.unwrap();

    // truncate-old alone gets under 60, so the chain stops there.
    assert_eq!(result.strategy, OptimizationStrategy::TruncateOld);
    assert_eq!(ids(&result.optimized), vec!["mid", "new"]);
    assert!(result.fits(60));
}

// ── Manager + optimizer ──────────────────────────────────────────────

#[tokio::test]
async fn manager_history_summarized_through_optimizer() {
    let mut manager = ContextManager::default();
    manager.add_system("You are a build assistant.");
    manager.add_user("Why does the build fail?");
    manager.add_tool("error[E0308]: mismatched types in src/lib.rs");
    manager.add_assistant("The return type of parse() is wrong.");
    let system_tokens = manager.ledger().used(ContextSegment::SystemPrompt);

    let exported = manager.to_optimizable();
    assert_eq!(exported.len(), 3);
    assert!(exported.iter().all(|i| i.kind.as_deref() != Some("system")));

    let optimizer = ContextOptimizer::new(
        ContextOptimizerConfig::new(1).with_strategies([OptimizationStrategy::Summarize]),
    )
    .with_summarizer(FnSummarizer::new(|_items: Vec<OptimizableItem>| async move {
        Ok::<_, String>("parse() had the wrong type".to_string())
    }));
    let result = optimizer.optimize(exported).await.unwrap();
    let removed = manager.apply_optimization(&result);

    assert_eq!(removed, 3);
    assert_eq!(manager.len(), 2);
    let summary = &manager.items()[1];
    assert_eq!(summary.role, Role::Assistant);
    assert_eq!(summary.content, "parse() had the wrong type");
    assert_eq!(summary.to_optimizable().kind.as_deref(), Some("summary"));

    let ledger = manager.ledger();
    assert_eq!(ledger.used(ContextSegment::SystemPrompt), system_tokens);
    assert_eq!(ledger.used(ContextSegment::ToolOutputs), 0);
    assert_eq!(ledger.used(ContextSegment::History), summary.tokens);
    assert_eq!(ledger.total_used(), manager.total_tokens());
}

#[tokio::test]
async fn manager_history_truncated_through_optimizer() {
    let mut manager = ContextManager::default();
    manager.add_system("rules");
    let low = manager.add("a".repeat(40), Role::Tool, AddOptions::new().priority(0.1));
    let high = manager.add("b".repeat(40), Role::User, AddOptions::new().priority(0.9));

    let optimizer = ContextOptimizer::new(
        ContextOptimizerConfig::new(10)
            .with_strategies([OptimizationStrategy::TruncateLowPriority]),
    );
    let result = optimizer.optimize(manager.to_optimizable()).await.unwrap();
    manager.apply_optimization(&result);

    assert!(manager.get(&low.id).is_none());
    assert!(manager.get(&high.id).is_some());
    assert_eq!(manager.ledger().total_used(), manager.total_tokens());
}

#[tokio::test]
async fn manager_compress_uses_injected_summarizer() {
    let mut manager = ContextManager::default();
    manager.add_system("sys");
    manager.add_user("one");
    manager.add_assistant("two");

    let summarizer = FnSummarizer::new(|items: Vec<OptimizableItem>| async move {
        Ok::<_, String>(format!("{} messages", items.len()))
    });
    let report = manager.compress(Some(&summarizer)).await.unwrap();

    assert!(report.summarized);
    assert_eq!(report.items_before, 3);
    assert_eq!(report.items_after, 2);
    assert!(manager.build().ends_with("assistant: 2 messages"));
}

// ── Config ───────────────────────────────────────────────────────────

#[tokio::test]
async fn engine_config_file_drives_every_component() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("engine.json");
    std::fs::write(
        &path,
        r#"{
            "budgeter": { "total_budget": 1000, "response_reserve": 200 },
            "manager": { "max_tokens": 400, "reserved_tokens": 100 },
            "optimizer": { "target_tokens": 8, "strategies": ["truncate-old"] },
            "allocation": { "model_limit": 4000, "output_reserve": 500, "system_prompt": 500 }
        }"#,
    )
    .unwrap();

    let config = EngineConfig::from_json_file(&path).unwrap();

    let mut b = ContextBudgeter::new(config.budgeter.clone().unwrap());
    assert_eq!(b.available(), 800);
    assert!(b.allocate("history", 700, 8).is_some());

    let manager = ContextManager::new(config.manager.clone());
    assert_eq!(manager.limit(), 300);

    let allocation = config.allocation.clone().unwrap();
    assert_eq!(allocation.segment(ContextSegment::History), 3_000);

    let optimizer = ContextOptimizer::new(config.optimizer.clone().unwrap());
    let result = optimizer
        .optimize(vec![
            item("t1", "one", 0.5, 1, 5),
            item("t2", "two", 0.5, 2, 5),
        ])
        .await
        .unwrap();
    assert_eq!(ids(&result.optimized), vec!["t2"]);
}

#[test]
fn engine_config_rejects_bad_allocation_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("engine.json");
    std::fs::write(
        &path,
        r#"{ "allocation": { "model_limit": 1000, "output_reserve": 100, "history": { "fixed": 5000 } } }"#,
    )
    .unwrap();

    let err = EngineConfig::from_json_file(&path).unwrap_err();
    assert!(matches!(err, ContextError::InvalidAllocation { .. }));
}
