use agentmux::cache::{Cache, CacheConfig};
use std::time::Duration;

fn cache(config: CacheConfig) -> Cache<String, serde_json::Value> {
    Cache::new(config)
}

#[test]
fn keys_preserve_insertion_order_without_eviction() {
    let c: Cache<String, String> = Cache::new(CacheConfig {
        max_entries: 100,
        ttl_ms: 0,
        ..CacheConfig::default()
    });

    for name in ["alpha", "beta", "gamma", "delta"] {
        c.set(name.to_string(), name.to_uppercase());
    }
    assert_eq!(c.keys(), vec!["alpha", "beta", "gamma", "delta"]);

    // A get moves the key to the most-recent position.
    c.get(&"beta".to_string());
    assert_eq!(c.keys(), vec!["alpha", "gamma", "delta", "beta"]);
}

#[test]
fn lru_eviction_prefers_the_least_recently_used() {
    let c: Cache<String, String> = Cache::new(CacheConfig {
        max_entries: 3,
        ..CacheConfig::default()
    });
    c.set("a".into(), "1".into());
    c.set("b".into(), "2".into());
    c.set("c".into(), "3".into());

    // Touch "a" so "b" becomes the eviction victim.
    c.get(&"a".to_string());
    c.set("d".into(), "4".into());

    assert!(c.get(&"a".to_string()).is_some());
    assert!(c.get(&"b".to_string()).is_none());
    assert!(c.get(&"c".to_string()).is_some());
    assert!(c.get(&"d".to_string()).is_some());
}

#[test]
fn ttl_expiry_counts_as_miss_not_eviction() {
    let c: Cache<String, String> = Cache::new(CacheConfig {
        ttl_ms: 10,
        ..CacheConfig::default()
    });
    c.set("ephemeral".into(), "x".into());
    assert!(c.get(&"ephemeral".to_string()).is_some());

    std::thread::sleep(Duration::from_millis(25));
    assert!(c.get(&"ephemeral".to_string()).is_none());

    let stats = c.stats();
    assert_eq!(stats.evictions, 0);
    assert_eq!(stats.entries, 0);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, 1);
}

#[test]
fn byte_budget_evicts_until_the_new_entry_fits() {
    // Each entry is estimated at 2 × len("\"0123456789\"") = 24 bytes, so a
    // 50-byte budget holds two entries.
    let c = cache(CacheConfig {
        max_entries: 100,
        max_bytes: 50,
        ..CacheConfig::default()
    });

    c.set("a".into(), serde_json::json!("0123456789"));
    c.set("b".into(), serde_json::json!("0123456789"));
    c.set("c".into(), serde_json::json!("0123456789"));
    let stats = c.stats();
    assert!(stats.bytes <= 50);
    assert_eq!(stats.evictions, 1);
    assert!(c.get(&"a".to_string()).is_none());
}

#[test]
fn oversized_values_are_rejected_outright() {
    let c = cache(CacheConfig {
        max_bytes: 32,
        ..CacheConfig::default()
    });
    assert!(!c.set("big".into(), serde_json::json!("x".repeat(100))));
    assert_eq!(c.stats().sets, 0);
}

#[test]
fn stats_report_hit_rate_and_average_size() {
    let c: Cache<String, String> = Cache::new(CacheConfig::default());
    c.set("k".into(), "value".into());
    c.get(&"k".to_string());
    c.get(&"missing".to_string());

    let stats = c.stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
    assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);
    assert!(stats.avg_entry_size > 0.0);
}

#[test]
fn delete_and_clear() {
    let c: Cache<String, String> = Cache::new(CacheConfig::default());
    c.set("a".into(), "1".into());
    c.set("b".into(), "2".into());

    assert!(c.delete(&"a".to_string()));
    assert!(!c.delete(&"a".to_string()));
    assert_eq!(c.stats().entries, 1);

    c.clear();
    assert_eq!(c.stats().entries, 0);
    assert_eq!(c.stats().bytes, 0);
}

#[tokio::test]
async fn background_sweep_removes_expired_entries() {
    let c: Cache<String, String> = Cache::new(CacheConfig {
        ttl_ms: 10,
        cleanup_interval_ms: 15,
        ..CacheConfig::default()
    });
    c.set("gone-soon".into(), "x".into());

    tokio::time::sleep(Duration::from_millis(60)).await;
    // The sweep ran without any get touching the key.
    assert_eq!(c.stats().entries, 0);
    c.destroy();
}
