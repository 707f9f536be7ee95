//! Property-Based Tests for the Cache Tiers
//!
//! # Test Properties
//!
//! 1. **Size Accounting**: a tier's byte total equals the sum of its live
//!    entries' sizes after any sequence of sets and deletes
//! 2. **Budget**: no sequence of writes leaves a tier above its budget
//! 3. **Ordering Totality**: every strategy orders candidates into a
//!    permutation of its input
//! 4. **Selection Size**: a pass targets `ceil(percentage% of candidates)`

#![cfg(test)]

use proptest::prelude::*;
use serde_json::json;
use tempfile::TempDir;

use super::entry::KeyFilter;
use super::l1::{MemoryCache, MemoryCacheConfig};
use super::l2::{FileCache, FileCacheConfig};
use super::policy::{EvictionCandidate, EvictionPolicy, EvictionStrategy};

// =============================================================================
// Property Strategies
// =============================================================================

#[derive(Debug, Clone)]
enum Op {
    Set { key: u8, bytes: usize },
    Delete { key: u8 },
}

fn op_strategy(max_bytes: usize) -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0u8..12, 1usize..max_bytes).prop_map(|(key, bytes)| Op::Set { key, bytes }),
        1 => (0u8..12).prop_map(|key| Op::Delete { key }),
    ]
}

fn strategy_strategy() -> impl Strategy<Value = EvictionStrategy> {
    prop_oneof![
        Just(EvictionStrategy::Lru),
        Just(EvictionStrategy::Lfu),
        Just(EvictionStrategy::Priority),
        Just(EvictionStrategy::Size),
        Just(EvictionStrategy::Ttl),
        Just(EvictionStrategy::Hybrid),
    ]
}

fn candidate_strategy() -> impl Strategy<Value = Vec<EvictionCandidate>> {
    prop::collection::vec(
        (
            0i64..1_000_000,
            0u64..500,
            0u8..=10,
            1u64..100_000,
            prop::option::of(0i64..2_000_000),
        ),
        0..40,
    )
    .prop_map(|rows| {
        rows.into_iter()
            .enumerate()
            .map(|(i, (last, count, priority, size, ttl))| EvictionCandidate {
                key: format!("k{}", i),
                priority,
                created_at: last / 2,
                last_accessed: last,
                access_count: count,
                ttl_absolute: ttl,
                size_bytes: size,
                sequence: i as u64,
            })
            .collect()
    })
}

fn small_l1(policy: EvictionStrategy) -> MemoryCache {
    MemoryCache::new(MemoryCacheConfig {
        max_size_mb: 0.05,
        eviction_policy: policy,
        ..Default::default()
    })
}

fn l1_live_bytes(cache: &MemoryCache) -> u64 {
    cache
        .keys(&KeyFilter::all())
        .iter()
        .filter_map(|key| cache.metadata(key))
        .map(|meta| meta.size_bytes)
        .sum()
}

// =============================================================================
// Memory Tier Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Byte total always matches the live entries
    #[test]
    fn prop_l1_size_accounting(ops in prop::collection::vec(op_strategy(8_000), 1..80)) {
        let cache = small_l1(EvictionStrategy::Lru);
        for op in ops {
            match op {
                Op::Set { key, bytes } => {
                    cache.set(&format!("p:{}", key), json!("x".repeat(bytes)), None);
                }
                Op::Delete { key } => {
                    cache.delete(&format!("p:{}", key));
                }
            }
            prop_assert_eq!(cache.used_bytes(), l1_live_bytes(&cache));
        }
    }

    /// Writes never leave the tier above its budget, whatever the strategy
    #[test]
    fn prop_l1_respects_budget(
        sizes in prop::collection::vec(1usize..20_000, 1..60),
        policy in strategy_strategy(),
    ) {
        let cache = small_l1(policy);
        for (i, bytes) in sizes.into_iter().enumerate() {
            cache.set(&format!("b:{}", i), json!("y".repeat(bytes)), None);
            prop_assert!(cache.used_bytes() <= cache.max_bytes());
        }
    }
}

// =============================================================================
// File Tier Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    /// Same accounting and budget guarantees for the file tier
    #[test]
    fn prop_l2_accounting_and_budget(ops in prop::collection::vec(op_strategy(12_000), 1..30)) {
        let dir = TempDir::new().unwrap();
        let config = FileCacheConfig {
            base_dir: dir.path().to_path_buf(),
            max_size_mb: 0.05,
            index_flush_delay_ms: 10_000,
            ..Default::default()
        };

        tokio_test::block_on(async {
            let cache = FileCache::new(config);
            cache.init().await.unwrap();
            for op in ops {
                match op {
                    Op::Set { key, bytes } => {
                        let value = json!("z".repeat(bytes));
                        cache.set(&format!("f:{}", key), &value, None, 5, false).await.unwrap();
                    }
                    Op::Delete { key } => {
                        cache.delete(&format!("f:{}", key)).await.unwrap();
                    }
                }
                let live: u64 = cache
                    .keys(&KeyFilter::all())
                    .iter()
                    .filter_map(|key| cache.metadata(key))
                    .map(|meta| meta.size_bytes)
                    .sum();
                assert_eq!(cache.used_bytes(), live);
                assert!(cache.used_bytes() <= cache.max_bytes());
            }
            cache.shutdown().await.unwrap();
        });
    }
}

// =============================================================================
// Policy Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Ordering keeps every candidate exactly once
    #[test]
    fn prop_order_is_permutation(
        candidates in candidate_strategy(),
        strategy in strategy_strategy(),
        now in 0i64..2_000_000,
    ) {
        let policy = EvictionPolicy::default();
        let mut ordered = candidates.clone();
        policy.order(strategy, &mut ordered, now);

        prop_assert_eq!(ordered.len(), candidates.len());
        let mut before: Vec<_> = candidates.iter().map(|c| c.key.clone()).collect();
        let mut after: Vec<_> = ordered.iter().map(|c| c.key.clone()).collect();
        before.sort();
        after.sort();
        prop_assert_eq!(before, after);

        let mut again = candidates.clone();
        policy.order(strategy, &mut again, now);
        prop_assert_eq!(ordered, again);
    }

    /// Non-TTL passes target exactly ceil(percentage% of candidates)
    #[test]
    fn prop_select_size(
        candidates in candidate_strategy(),
        strategy in strategy_strategy(),
        percentage in 0.0f64..=100.0,
    ) {
        let policy = EvictionPolicy::default();
        let total = candidates.len();
        let selected = policy.select(strategy, candidates, percentage, 1_000_000);
        let target = ((total as f64) * percentage / 100.0).ceil() as usize;

        if strategy == EvictionStrategy::Ttl {
            prop_assert!(selected.len() <= target);
        } else {
            prop_assert_eq!(selected.len(), target);
        }
    }
}
