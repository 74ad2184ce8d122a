//! Property tests for cache and key invariants.
//!
//! Uses proptest to verify:
//! 1. Capacity: inserting past `max_size` evicts exactly the oldest entry
//! 2. Pattern invalidation removes exactly the matching keys
//! 3. Cache keys ignore parameter insertion order
//! 4. Backoff delays double per attempt

use proptest::prelude::*;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tickersync_core::cache_key::cache_key;
use tickersync_core::{RetryPolicy, TtlCache};

// ── Strategies (proptest) ────────────────────────────────────────────

fn arb_ticker() -> impl Strategy<Value = String> {
    "[A-Z]{1,5}"
}

fn arb_keys() -> impl Strategy<Value = Vec<String>> {
    prop::collection::btree_set(("[a-z]{1,4}", arb_ticker(), 0u32..50), 1..40).prop_map(|set| {
        set.into_iter()
            .map(|(ns, ticker, n)| format!("{ns}:{ticker}:{n}"))
            .collect()
    })
}

fn long_ttl() -> Duration {
    Duration::from_secs(3600)
}

// ── 1. Capacity ──────────────────────────────────────────────────────

proptest! {
    /// Once full, each new key evicts exactly one entry: the oldest one.
    #[test]
    fn overflow_evicts_oldest(keys in arb_keys(), max_size in 1usize..10) {
        let cache = TtlCache::new(max_size, long_ttl());
        for (i, key) in keys.iter().enumerate() {
            cache.set(key.clone(), i, None);
            prop_assert!(cache.len() <= max_size);
        }

        let kept = keys.len().min(max_size);
        prop_assert_eq!(cache.len(), kept);
        prop_assert_eq!(cache.stats().evictions as usize, keys.len() - kept);

        // Survivors are exactly the newest `kept` keys.
        let (evicted, survivors) = keys.split_at(keys.len() - kept);
        for key in survivors {
            prop_assert!(cache.get(key).is_some());
        }
        for key in evicted {
            prop_assert!(cache.get(key).is_none());
        }
    }

    /// Overwriting a live key never evicts another entry.
    #[test]
    fn overwrite_does_not_evict(keys in arb_keys()) {
        let cache = TtlCache::new(keys.len(), long_ttl());
        for key in &keys {
            cache.set(key.clone(), 0u8, None);
        }
        for key in &keys {
            cache.set(key.clone(), 1u8, None);
        }
        prop_assert_eq!(cache.len(), keys.len());
        prop_assert_eq!(cache.stats().evictions, 0);
    }
}

// ── 2. Pattern invalidation ──────────────────────────────────────────

proptest! {
    /// `invalidate_pattern(p)` removes the keys containing `p` and no others.
    #[test]
    fn invalidation_is_exact(keys in arb_keys(), ticker in arb_ticker()) {
        let cache = TtlCache::new(keys.len(), long_ttl());
        for key in &keys {
            cache.set(key.clone(), (), None);
        }

        let pattern = format!(":{ticker}:");
        let expected: Vec<&String> = keys.iter().filter(|k| k.contains(&pattern)).collect();

        let removed = cache.invalidate_pattern(&pattern);
        prop_assert_eq!(removed, expected.len());
        prop_assert_eq!(cache.len(), keys.len() - expected.len());
        for key in &keys {
            prop_assert_eq!(cache.entry(key).is_some(), !key.contains(&pattern));
        }
    }
}

// ── 3. Cache key canonicalization ────────────────────────────────────

proptest! {
    /// The same parameters hash to the same key in any insertion order.
    #[test]
    fn key_ignores_insertion_order(
        params in prop::collection::btree_map("[a-z]{1,6}", -1000i64..1000, 0..8),
        ticker in arb_ticker(),
    ) {
        let forward: HashMap<&String, &i64> = params.iter().collect();
        let reversed: HashMap<&String, &i64> = params.iter().rev().collect();
        let sorted: BTreeMap<&String, &i64> = params.iter().collect();

        let a = cache_key("bars", &ticker, &forward);
        let b = cache_key("bars", &ticker, &reversed);
        let c = cache_key("bars", &ticker, &sorted);
        prop_assert_eq!(&a, &b);
        prop_assert_eq!(&a, &c);
        let prefix = format!("bars:{ticker}:");
        prop_assert!(a.starts_with(&prefix));
    }

    /// Changing any value changes the key.
    #[test]
    fn key_depends_on_values(
        params in prop::collection::btree_map("[a-z]{1,6}", -1000i64..1000, 1..8),
        bump in 1i64..100,
    ) {
        let mut changed = params.clone();
        if let Some(v) = changed.values_mut().next() {
            *v += bump;
        }
        prop_assert_ne!(cache_key("ns", "X", &params), cache_key("ns", "X", &changed));
    }
}

// ── 4. Backoff schedule ──────────────────────────────────────────────

proptest! {
    #[test]
    fn backoff_doubles(base_ms in 1u64..1000, attempt in 1u32..20) {
        let policy = RetryPolicy::new(30, Duration::from_millis(base_ms));
        prop_assert_eq!(policy.delay_for(attempt + 1), policy.delay_for(attempt) * 2);
        prop_assert_eq!(policy.delay_for(1), Duration::from_millis(base_ms));
    }
}
