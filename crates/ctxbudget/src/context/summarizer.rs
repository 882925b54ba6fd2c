//! The injected summarization capability.
//!
//! Summarization needs an LLM call, which this crate does not make. Callers
//! hand the optimizer (or the manager's `compress`) a [`Summarizer`]; it is
//! awaited to completion and its errors propagate unchanged. Wrap it in a
//! [`TimeoutSummarizer`] when the host needs bounded latency.

use std::future::Future;
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::warn;

use super::optimizer::OptimizableItem;
use crate::error::ContextError;

/// The prompt an LLM-backed summarizer sends. Instructs the model to produce
/// a concise, factual summary suitable for replacing the summarized items.
const SUMMARIZATION_PROMPT: &str = "\
Summarize the following context items concisely. Focus on:
- What was accomplished and what remains to be done
- Key findings and decisions made
- Failed approaches (what was tried and why it failed)
- File paths, identifiers, and error messages mentioned

Rules:
- Only include facts explicitly stated in the items. Do not infer or extrapolate.
- Preserve file paths, function names, and error messages verbatim.
- Higher-priority items matter more; drop low-priority detail first.
- If there is an existing summary, merge the new information into it to produce a single \
  standalone summary that replaces the existing one entirely.";

/// Boxed future returned by [`Summarizer::summarize`].
pub type SummaryFuture<'a> = BoxFuture<'a, Result<String, ContextError>>;

/// Turns a set of context items into one summary string.
///
/// Uses a boxed future so that the trait is dyn-compatible.
pub trait Summarizer: Send + Sync {
    fn summarize<'a>(&'a self, items: &'a [OptimizableItem]) -> SummaryFuture<'a>;
}

/// A [`Summarizer`] backed by an async closure.
///
/// # Example
///
/// ```
/// use ctxbudget::context::optimizer::OptimizableItem;
/// use ctxbudget::context::summarizer::FnSummarizer;
///
/// let summarizer = FnSummarizer::new(|items: Vec<OptimizableItem>| async move {
///     Ok::<_, String>(format!("{} items summarized", items.len()))
/// });
/// ```
pub struct FnSummarizer<F> {
    func: F,
}

impl<F, Fut, E> FnSummarizer<F>
where
    F: Fn(Vec<OptimizableItem>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<String, E>> + Send + 'static,
    E: std::fmt::Display,
{
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

impl<F, Fut, E> Summarizer for FnSummarizer<F>
where
    F: Fn(Vec<OptimizableItem>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<String, E>> + Send + 'static,
    E: std::fmt::Display,
{
    fn summarize<'a>(&'a self, items: &'a [OptimizableItem]) -> SummaryFuture<'a> {
        let fut = (self.func)(items.to_vec());
        Box::pin(async move { fut.await.map_err(|e| ContextError::Summarizer(e.to_string())) })
    }
}

/// Bounds another summarizer's latency with `tokio::time::timeout`.
pub struct TimeoutSummarizer<S> {
    inner: S,
    timeout: Duration,
}

impl<S: Summarizer> TimeoutSummarizer<S> {
    pub fn new(inner: S, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

impl<S: Summarizer> Summarizer for TimeoutSummarizer<S> {
    fn summarize<'a>(&'a self, items: &'a [OptimizableItem]) -> SummaryFuture<'a> {
        Box::pin(async move {
            match tokio::time::timeout(self.timeout, self.inner.summarize(items)).await {
                Ok(result) => result,
                Err(_) => {
                    let after_ms = self.timeout.as_millis() as u64;
                    warn!(after_ms, items = items.len(), "summarizer timed out");
                    Err(ContextError::SummarizerTimeout { after_ms })
                }
            }
        })
    }
}

/// Build the summarization prompt for a set of items.
///
/// Returns a (system, user) message pair suitable for a one-shot LLM call.
/// Items are rendered oldest first with their priority so the model can
/// weigh them.
pub fn build_summarization_request(
    items: &[OptimizableItem],
    existing_summary: Option<&str>,
) -> (String, String) {
    let mut content = String::new();

    if let Some(existing) = existing_summary {
        content.push_str("=== EXISTING SUMMARY ===\n");
        content.push_str(existing);
        content.push_str("\n\n=== NEW ITEMS TO SUMMARIZE ===\n");
    }

    let mut ordered: Vec<&OptimizableItem> = items.iter().collect();
    ordered.sort_by_key(|item| item.timestamp);
    for item in ordered {
        let kind = item.kind.as_deref().unwrap_or("item");
        content.push_str(&format!(
            "[{kind} {} p={:.2}]: {}\n\n",
            item.id, item.priority, item.content
        ));
    }

    (SUMMARIZATION_PROMPT.to_string(), content)
}
