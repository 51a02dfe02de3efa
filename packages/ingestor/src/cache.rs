//! Transaction Dedup Cache
//!
//! Remembers recently seen transaction ids in insertion order. When the cache
//! grows past its cap the oldest fraction of entries is evicted in one step.

use std::collections::{HashSet, VecDeque};

use tracing::debug;

use crate::error::ParseError;

/// Default maximum number of remembered transaction ids
pub const DEFAULT_CACHE_MAX_SIZE: usize = 1000;

/// Default fraction of the cap evicted when the cache overflows
pub const DEFAULT_PRUNE_FRACTION: f64 = 0.20;

/// Slack absorbing floating-point error before flooring the retained count
const RETAIN_EPSILON: f64 = 1e-6;

/// Configuration for the dedup cache
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheConfig {
    /// Entry count that triggers eviction once exceeded
    pub max_size: usize,
    /// Fraction of `max_size` dropped on eviction, in (0, 1]
    pub prune_fraction: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_CACHE_MAX_SIZE,
            prune_fraction: DEFAULT_PRUNE_FRACTION,
        }
    }
}

impl CacheConfig {
    /// Number of entries kept after an eviction
    pub fn retained_after_prune(&self) -> usize {
        let fraction = self.prune_fraction.clamp(0.0, 1.0);
        // 1000 * (1 - 0.9) lands just below 100 in binary floating point
        let retained = self.max_size as f64 * (1.0 - fraction);
        ((retained + RETAIN_EPSILON).floor() as usize).min(self.max_size)
    }
}

/// Write-once, insertion-ordered set of transaction ids
#[derive(Debug, Clone)]
pub struct DedupCache {
    config: CacheConfig,
    order: VecDeque<String>,
    seen: HashSet<String>,
}

impl DedupCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            order: VecDeque::with_capacity(config.max_size + 1),
            seen: HashSet::with_capacity(config.max_size + 1),
        }
    }

    /// Record a transaction id if it has not been seen.
    ///
    /// # Returns
    /// `Ok(())` for a new id, `DuplicateTransaction` for a known one
    pub fn check_and_insert(&mut self, txid: &str) -> Result<(), ParseError> {
        if self.seen.contains(txid) {
            return Err(ParseError::DuplicateTransaction(txid.to_string()));
        }

        self.seen.insert(txid.to_string());
        self.order.push_back(txid.to_string());

        if self.order.len() > self.config.max_size {
            self.prune();
        }
        Ok(())
    }

    /// Evict the oldest entries down to the retained size
    fn prune(&mut self) {
        let keep = self.config.retained_after_prune();
        let before = self.order.len();

        while self.order.len() > keep {
            match self.order.pop_front() {
                Some(txid) => {
                    self.seen.remove(&txid);
                }
                None => break,
            }
        }

        debug!(evicted = before - self.order.len(), retained = self.order.len(), "Pruned dedup cache");
    }

    pub fn contains(&self, txid: &str) -> bool {
        self.seen.contains(txid)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== CacheConfig tests ====================

    #[test]
    fn test_default_config() {
        let config = CacheConfig::default();
        assert_eq!(config.max_size, 1000);
        assert_eq!(config.prune_fraction, 0.20);
        assert_eq!(config.retained_after_prune(), 800);
    }

    #[test]
    fn test_retained_after_full_prune() {
        let config = CacheConfig { max_size: 10, prune_fraction: 1.0 };
        assert_eq!(config.retained_after_prune(), 0);
    }

    #[test]
    fn test_retained_count_survives_float_rounding() {
        for (fraction, expected) in [(0.9, 100), (0.7, 300), (0.3, 700), (0.1, 900), (0.25, 750)] {
            let config = CacheConfig { max_size: 1000, prune_fraction: fraction };
            assert_eq!(config.retained_after_prune(), expected, "fraction {fraction}");
        }
        let config = CacheConfig { max_size: 7, prune_fraction: 0.5 };
        assert_eq!(config.retained_after_prune(), 3);
    }

    #[test]
    fn test_overflow_with_large_prune_fraction() {
        let mut cache = DedupCache::new(CacheConfig { max_size: 1000, prune_fraction: 0.9 });
        for i in 0..1001 {
            cache.check_and_insert(&format!("tx{i}")).unwrap();
        }
        assert_eq!(cache.len(), 100);
        assert!(cache.contains("tx901"));
        assert!(!cache.contains("tx900"));
    }

    // ==================== DedupCache tests ====================

    #[test]
    fn test_duplicate_rejected() {
        let mut cache = DedupCache::default();
        assert!(cache.check_and_insert("tx1").is_ok());
        assert_eq!(
            cache.check_and_insert("tx1"),
            Err(ParseError::DuplicateTransaction("tx1".into()))
        );
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_no_eviction_at_cap() {
        let mut cache = DedupCache::default();
        for i in 0..1000 {
            cache.check_and_insert(&format!("tx{i}")).unwrap();
        }
        assert_eq!(cache.len(), 1000);
        assert!(cache.contains("tx0"));
    }

    #[test]
    fn test_overflow_keeps_most_recent_800() {
        let mut cache = DedupCache::default();
        for i in 0..1001 {
            cache.check_and_insert(&format!("tx{i}")).unwrap();
        }

        assert_eq!(cache.len(), 800);
        for i in 0..201 {
            assert!(!cache.contains(&format!("tx{i}")), "tx{i} should be evicted");
        }
        for i in 201..1001 {
            assert!(cache.contains(&format!("tx{i}")), "tx{i} should be retained");
        }
    }

    #[test]
    fn test_evicted_id_is_accepted_again() {
        let mut cache = DedupCache::new(CacheConfig { max_size: 4, prune_fraction: 0.5 });
        for txid in ["a", "b", "c", "d", "e"] {
            cache.check_and_insert(txid).unwrap();
        }
        assert_eq!(cache.len(), 2);
        assert!(cache.check_and_insert("a").is_ok());
        assert!(cache.check_and_insert("e").is_err());
    }
}
