//! Caller-owned response cache.
//!
//! Avoids paying twice for identical requests within one agent session.
//! Entries are keyed by a fingerprint of the whitespace-normalized request,
//! so trivially reformatted prompts still hit. Each agent owns its own
//! [`ResponseCache`]; there is no process-wide instance.
//!
//! [`put_within`](ResponseCache::put_within) ties the cache to a
//! [`ContextBudgeter`] allocation: a response is only stored when its
//! estimated tokens fit, and caching is skipped otherwise. Every entry
//! remembers what it was charged. Replacing or dropping an entry gives the
//! tokens back: immediately inside `put_within`, otherwise on the next
//! [`settle`](ResponseCache::settle) or `put_within`.

use std::collections::HashMap;

use tracing::trace;

use super::budgeter::{AllocationId, ContextBudgeter};

/// Tokens an entry debited from a budgeter allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Charge {
    allocation: AllocationId,
    tokens: usize,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    response: String,
    charge: Option<Charge>,
    turn: u32,
}

/// Responses keyed by request fingerprint.
#[derive(Debug)]
pub struct ResponseCache {
    entries: HashMap<u64, CacheEntry>,
    /// Maximum number of entries before eviction.
    max_entries: usize,
    /// Charges of dropped entries not yet credited back.
    pending_refunds: Vec<Charge>,
    hits: u64,
    misses: u64,
}

impl ResponseCache {
    /// Create a new cache with the given capacity.
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: HashMap::new(),
            max_entries,
            pending_refunds: Vec::new(),
            hits: 0,
            misses: 0,
        }
    }

    /// Look up a cached response. Returns `Some(response)` on cache hit.
    pub fn get(&mut self, request: &str) -> Option<&str> {
        if let Some(entry) = self.entries.get(&request_fingerprint(request)) {
            self.hits += 1;
            Some(&entry.response)
        } else {
            self.misses += 1;
            None
        }
    }

    /// Store a response, evicting the oldest entry when at capacity.
    pub fn put(&mut self, request: &str, response: String, turn: u32) {
        self.insert(request_fingerprint(request), response, None, turn);
    }

    /// Store a response only if its estimated tokens fit the allocation,
    /// debiting the allocation on success.
    ///
    /// Tokens held by an entry this one replaces count as available. Entries
    /// dropped to make room are credited back before returning.
    /// Returns `false` when caching was skipped.
    pub fn put_within(
        &mut self,
        budgeter: &mut ContextBudgeter,
        allocation: AllocationId,
        request: &str,
        response: String,
        turn: u32,
    ) -> bool {
        self.settle(budgeter);

        let key = request_fingerprint(request);
        let tokens = budgeter.estimator().estimate(&response);
        let reclaimable = match self.entries.get(&key).and_then(|e| e.charge) {
            Some(charge) if charge.allocation == allocation => charge.tokens,
            _ => 0,
        };
        let fits = budgeter
            .get(allocation)
            .is_some_and(|a| tokens <= a.remaining() + reclaimable);
        if !fits {
            trace!(%allocation, tokens, "response not cached: allocation exhausted");
            return false;
        }

        self.insert(key, response, Some(Charge { allocation, tokens }), turn);
        self.settle(budgeter);
        if !budgeter.use_tokens(allocation, tokens) {
            self.entries.remove(&key);
            return false;
        }
        true
    }

    /// Credit the charges of dropped entries back to `budgeter`. Returns the
    /// tokens credited; charges for allocations that no longer exist are
    /// discarded.
    pub fn settle(&mut self, budgeter: &mut ContextBudgeter) -> usize {
        let mut credited = 0;
        for charge in self.pending_refunds.drain(..) {
            if budgeter.refund(charge.allocation, charge.tokens) {
                credited += charge.tokens;
            }
        }
        credited
    }

    /// Drop every entry, returning the budgeted tokens they held. Those
    /// tokens are credited on the next [`settle`](Self::settle).
    pub fn invalidate_all(&mut self) -> usize {
        let charges: Vec<Charge> = self.entries.drain().filter_map(|(_, e)| e.charge).collect();
        let freed = charges.iter().map(|c| c.tokens).sum();
        self.pending_refunds.extend(charges);
        freed
    }

    /// Drop entries older than `max_age` turns.
    pub fn evict_older_than(&mut self, current_turn: u32, max_age: u32) {
        let pending = &mut self.pending_refunds;
        self.entries.retain(|_, entry| {
            let keep = current_turn.saturating_sub(entry.turn) <= max_age;
            if !keep {
                pending.extend(entry.charge);
            }
            keep
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }

    /// Hit rate as a fraction (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    fn insert(&mut self, key: u64, response: String, charge: Option<Charge>, turn: u32) {
        if let Some(replaced) = self.entries.remove(&key) {
            self.pending_refunds.extend(replaced.charge);
        } else if self.entries.len() >= self.max_entries {
            self.evict_oldest();
        }
        self.entries.insert(
            key,
            CacheEntry {
                response,
                charge,
                turn,
            },
        );
    }

    fn evict_oldest(&mut self) {
        let Some(oldest) = self
            .entries
            .iter()
            .min_by_key(|(_, v)| v.turn)
            .map(|(k, _)| *k)
        else {
            return;
        };
        if let Some(entry) = self.entries.remove(&oldest) {
            self.pending_refunds.extend(entry.charge);
        }
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new(100)
    }
}

/// FNV-1a over the whitespace-normalized request.
fn request_fingerprint(request: &str) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for (i, word) in request.split_whitespace().enumerate() {
        if i > 0 {
            hash ^= b' ' as u64;
            hash = hash.wrapping_mul(0x100000001b3);
        }
        for byte in word.as_bytes() {
            hash ^= *byte as u64;
            hash = hash.wrapping_mul(0x100000001b3);
        }
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::budgeter::ContextBudgeterConfig;

    fn budgeter() -> ContextBudgeter {
        ContextBudgeter::new(ContextBudgeterConfig::new(1_000).with_response_reserve(200))
    }

    #[test]
    fn put_and_get() {
        let mut cache = ResponseCache::new(10);
        cache.put("summarize foo.rs", "short summary".into(), 1);
        assert_eq!(cache.get("summarize foo.rs"), Some("short summary"));
        assert_eq!(cache.hits(), 1);
    }

    #[test]
    fn whitespace_variants_share_an_entry() {
        let mut cache = ResponseCache::new(10);
        cache.put("  summarize\n foo.rs ", "s".into(), 1);
        assert_eq!(cache.get("summarize foo.rs"), Some("s"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn miss_is_counted() {
        let mut cache = ResponseCache::new(10);
        assert_eq!(cache.get("unknown"), None);
        assert_eq!(cache.misses(), 1);
        assert_eq!(cache.hit_rate(), 0.0);
    }

    #[test]
    fn capacity_evicts_oldest_turn() {
        let mut cache = ResponseCache::new(2);
        cache.put("a", "r1".into(), 1);
        cache.put("b", "r2".into(), 2);
        cache.put("c", "r3".into(), 3);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("c"), Some("r3"));
    }

    #[test]
    fn evict_older_than_drops_stale_entries() {
        let mut cache = ResponseCache::new(10);
        cache.put("a", "a".into(), 1);
        cache.put("b", "b".into(), 5);
        cache.evict_older_than(6, 2);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn put_within_respects_allocation() {
        let mut budgeter = budgeter();
        let alloc = budgeter.allocate("cache", 10, 2).unwrap();
        let mut cache = ResponseCache::new(10);

        assert!(cache.put_within(&mut budgeter, alloc.id, "q1", "x".repeat(32), 1));
        assert_eq!(budgeter.get(alloc.id).unwrap().used, 8);

        // 12 more tokens would overdraw the allocation: skip caching.
        assert!(!cache.put_within(&mut budgeter, alloc.id, "q2", "y".repeat(48), 1));
        assert_eq!(cache.len(), 1);
        assert_eq!(budgeter.get(alloc.id).unwrap().used, 8);
    }

    #[test]
    fn capacity_eviction_refunds_allocation() {
        let mut budgeter = budgeter();
        let alloc = budgeter.allocate("cache", 10, 2).unwrap();
        let mut cache = ResponseCache::new(1);

        assert!(cache.put_within(&mut budgeter, alloc.id, "q1", "x".repeat(32), 1));
        assert!(cache.put_within(&mut budgeter, alloc.id, "q2", "y".repeat(8), 2));
        assert_eq!(cache.len(), 1);
        assert_eq!(budgeter.get(alloc.id).unwrap().used, 2);
    }

    #[test]
    fn replacing_a_key_charges_once() {
        let mut budgeter = budgeter();
        let alloc = budgeter.allocate("cache", 10, 2).unwrap();
        let mut cache = ResponseCache::new(10);

        assert!(cache.put_within(&mut budgeter, alloc.id, "q", "a".repeat(20), 1));
        assert!(cache.put_within(&mut budgeter, alloc.id, "q", "b".repeat(20), 2));
        assert_eq!(cache.len(), 1);
        assert_eq!(budgeter.get(alloc.id).unwrap().used, 5);

        // A replacement may use the tokens the old entry held.
        assert!(cache.put_within(&mut budgeter, alloc.id, "q", "c".repeat(40), 3));
        assert_eq!(budgeter.get(alloc.id).unwrap().used, 10);
        assert_eq!(cache.get("q"), Some("c".repeat(40).as_str()));
    }

    #[test]
    fn invalidate_all_frees_allocation_for_reuse() {
        let mut budgeter = budgeter();
        let alloc = budgeter.allocate("cache", 10, 2).unwrap();
        let mut cache = ResponseCache::new(10);

        assert!(cache.put_within(&mut budgeter, alloc.id, "q1", "x".repeat(40), 1));
        assert_eq!(cache.invalidate_all(), 10);
        assert!(cache.is_empty());
        assert_eq!(cache.settle(&mut budgeter), 10);
        assert_eq!(budgeter.get(alloc.id).unwrap().used, 0);

        assert!(cache.put_within(&mut budgeter, alloc.id, "q2", "y".repeat(40), 2));
    }

    #[test]
    fn stale_entries_refund_on_next_put() {
        let mut budgeter = budgeter();
        let alloc = budgeter.allocate("cache", 10, 2).unwrap();
        let mut cache = ResponseCache::new(10);

        assert!(cache.put_within(&mut budgeter, alloc.id, "old", "x".repeat(40), 1));
        cache.evict_older_than(10, 3);
        assert!(cache.is_empty());
        assert!(cache.put_within(&mut budgeter, alloc.id, "new", "y".repeat(40), 10));
        assert_eq!(budgeter.get(alloc.id).unwrap().used, 10);
    }

    #[test]
    fn settle_ignores_released_allocations() {
        let mut budgeter = budgeter();
        let alloc = budgeter.allocate("cache", 10, 2).unwrap();
        let mut cache = ResponseCache::new(10);

        assert!(cache.put_within(&mut budgeter, alloc.id, "q", "x".repeat(8), 1));
        budgeter.release(alloc.id);
        cache.invalidate_all();
        assert_eq!(cache.settle(&mut budgeter), 0);
    }

    #[test]
    fn fingerprint_is_deterministic_and_distinct() {
        assert_eq!(request_fingerprint("a b"), request_fingerprint("a   b"));
        assert_ne!(request_fingerprint("ab"), request_fingerprint("a b"));
        assert_ne!(request_fingerprint("foo"), request_fingerprint("bar"));
    }
}
