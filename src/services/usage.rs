//! Usage recording
//!
//! Token tallies priced against the configured pricing table, appended to an
//! on-disk history, plus the process-wide in-flight request counter the
//! dashboard reads.

use crate::config::PricingEntry;
use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, RwLock};
use tracing::{debug, warn};

const HISTORY_LIMIT: usize = 10_000;

/// Token counts for one request
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenCounts {
    #[serde(default)]
    pub prompt: u64,
    #[serde(default)]
    pub completion: u64,
    #[serde(default)]
    pub cached: u64,
    #[serde(default)]
    pub reasoning: u64,
    #[serde(default)]
    pub cache_creation: u64,
}

impl TokenCounts {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// One appended history record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageEntry {
    /// Epoch milliseconds
    pub timestamp: i64,
    pub provider: String,
    pub model: String,
    pub connection_id: String,
    pub tokens: TokenCounts,
    /// USD; 0 when no pricing entry exists
    pub cost: f64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct UsageHistory {
    #[serde(default)]
    history: Vec<UsageEntry>,
}

/// Cost in USD for a token tally under one pricing entry
///
/// Linear in every token category; rates are USD per million tokens.
pub fn cost(pricing: Option<&PricingEntry>, tokens: &TokenCounts) -> f64 {
    let Some(pricing) = pricing else { return 0.0 };
    let per_million = |count: u64, rate: f64| (count as f64) * rate / 1_000_000.0;

    per_million(tokens.prompt, pricing.input)
        + per_million(tokens.completion, pricing.output)
        + per_million(tokens.cached, pricing.cached.unwrap_or(0.0))
        + per_million(tokens.reasoning, pricing.reasoning.unwrap_or(0.0))
        + per_million(tokens.cache_creation, pricing.cache_creation.unwrap_or(0.0))
}

/// Append-only usage history, serialized per file
#[derive(Debug)]
pub struct UsageStore {
    path: Option<PathBuf>,
    lock: Mutex<()>,
}

impl UsageStore {
    /// Store writing to `usage.json` under the state directory
    pub fn new(path: PathBuf) -> Self {
        Self { path: Some(path), lock: Mutex::new(()) }
    }

    /// In-memory store for tests and disabled persistence
    pub fn disabled() -> Self {
        Self { path: None, lock: Mutex::new(()) }
    }

    /// Append one entry, trimming the history to its bound
    pub fn append(&self, entry: UsageEntry) {
        debug!(
            "usage: {}/{} prompt={} completion={} cost={:.6}",
            entry.provider, entry.model, entry.tokens.prompt, entry.tokens.completion, entry.cost
        );
        if let Err(e) = self.append_inner(entry) {
            warn!("usage: failed to persist entry: {}", e);
        }
    }

    fn append_inner(&self, entry: UsageEntry) -> Result<()> {
        let Some(path) = &self.path else { return Ok(()) };
        let _guard = self.lock.lock().unwrap();

        let mut history: UsageHistory = match std::fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_default(),
            Err(_) => UsageHistory::default(),
        };
        history.history.push(entry);
        if history.history.len() > HISTORY_LIMIT {
            let excess = history.history.len() - HISTORY_LIMIT;
            history.history.drain(..excess);
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string(&history)?)
            .with_context(|| format!("writing {:?}", path))?;
        Ok(())
    }

    /// The recorded history (most recent last)
    pub fn history(&self) -> Vec<UsageEntry> {
        let Some(path) = &self.path else { return Vec::new() };
        let _guard = self.lock.lock().unwrap();
        std::fs::read_to_string(path)
            .ok()
            .and_then(|content| serde_json::from_str::<UsageHistory>(&content).ok())
            .map(|h| h.history)
            .unwrap_or_default()
    }
}

// In-flight request counter, keyed by model and by connection:model.
// Mutated on request begin/end, read by the dashboard, never persisted.
static IN_FLIGHT: Lazy<RwLock<HashMap<String, u32>>> = Lazy::new(|| RwLock::new(HashMap::new()));

/// RAII guard for one in-flight request
///
/// Decrements on drop, so abandoned streams release their slots.
#[derive(Debug)]
pub struct InFlightGuard {
    keys: Vec<String>,
}

/// Track a request as pending
pub fn track_pending(model: &str, connection_id: &str) -> InFlightGuard {
    let keys = vec![model.to_string(), format!("{}:{}", connection_id, model)];
    let mut counts = IN_FLIGHT.write().unwrap();
    for key in &keys {
        *counts.entry(key.clone()).or_insert(0) += 1;
    }
    InFlightGuard { keys }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut counts = IN_FLIGHT.write().unwrap();
        for key in &self.keys {
            match counts.get_mut(key) {
                Some(count) if *count > 1 => *count -= 1,
                Some(_) => {
                    counts.remove(key);
                }
                None => {}
            }
        }
    }
}

/// Snapshot of the in-flight counters
pub fn active_counts() -> HashMap<String, u32> {
    IN_FLIGHT.read().unwrap().clone()
}

/// Total in-flight requests for one model
pub fn active_for_model(model: &str) -> u32 {
    IN_FLIGHT.read().unwrap().get(model).copied().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pricing() -> PricingEntry {
        PricingEntry {
            input: 2.0,
            output: 10.0,
            cached: Some(0.5),
            reasoning: Some(10.0),
            cache_creation: None,
        }
    }

    #[test]
    fn test_cost_zero_for_zero_tokens() {
        assert_eq!(cost(Some(&pricing()), &TokenCounts::default()), 0.0);
    }

    #[test]
    fn test_cost_missing_pricing_is_zero() {
        let tokens = TokenCounts { prompt: 1000, completion: 1000, ..Default::default() };
        assert_eq!(cost(None, &tokens), 0.0);
    }

    #[test]
    fn test_cost_linear_in_each_category() {
        let tokens = TokenCounts {
            prompt: 1_000_000,
            completion: 500_000,
            cached: 2_000_000,
            reasoning: 100_000,
            cache_creation: 0,
        };
        let total = cost(Some(&pricing()), &tokens);
        // 2.0 + 5.0 + 1.0 + 1.0
        assert!((total - 9.0).abs() < 1e-9);

        let doubled = TokenCounts {
            prompt: 2_000_000,
            completion: 1_000_000,
            cached: 4_000_000,
            reasoning: 200_000,
            cache_creation: 0,
        };
        assert!((cost(Some(&pricing()), &doubled) - 18.0).abs() < 1e-9);
    }

    #[test]
    fn test_usage_store_appends_and_trims() {
        let dir = tempfile::tempdir().unwrap();
        let store = UsageStore::new(dir.path().join("usage.json"));

        for i in 0..3 {
            store.append(UsageEntry {
                timestamp: i,
                provider: "openai".into(),
                model: "gpt-4o".into(),
                connection_id: "c1".into(),
                tokens: TokenCounts { prompt: 10, completion: 5, ..Default::default() },
                cost: 0.0,
            });
        }
        let history = store.history();
        assert_eq!(history.len(), 3);
        assert_eq!(history[2].timestamp, 2);
    }

    #[test]
    fn test_in_flight_counter_balances() {
        let model = "test-counter-model";
        assert_eq!(active_for_model(model), 0);
        {
            let _a = track_pending(model, "c1");
            let _b = track_pending(model, "c2");
            assert_eq!(active_for_model(model), 2);
        }
        // Guards dropped: counters must return to zero
        assert_eq!(active_for_model(model), 0);
    }
}
