use std::{sync::Arc, thread, time::Duration};

use retune_service::{CacheSettings, ManualClock, SignatureCache};

fn settings(max_size: usize) -> CacheSettings {
	CacheSettings {
		max_size,
		ttl: Duration::from_secs(60),
		admission_threshold: 0.7,
		cleanup_interval: Duration::ZERO,
	}
}

fn cache_with_clock(max_size: usize) -> (Arc<ManualClock>, SignatureCache) {
	let clock = Arc::new(ManualClock::new());
	let cache = SignatureCache::with_clock(settings(max_size), clock.clone());

	(clock, cache)
}

#[test]
fn reading_an_entry_protects_it_from_eviction() {
	let cache = SignatureCache::new(settings(2));

	assert!(cache.set("A", "bundle-a", 0.9));
	assert!(cache.set("B", "bundle-b", 0.9));
	assert!(cache.get("A").is_some());
	assert!(cache.set("C", "bundle-c", 0.9));

	assert!(cache.get("B").is_none(), "B should have been the least recently used entry.");
	assert_eq!(cache.get("A").map(|entry| entry.bundle_id), Some("bundle-a".to_string()));
	assert_eq!(cache.get("C").map(|entry| entry.bundle_id), Some("bundle-c".to_string()));
	assert_eq!(cache.len(), 2);
}

#[test]
fn overflow_without_reads_drops_the_oldest_insert() {
	let cache = SignatureCache::new(settings(3));

	for key in ["k1", "k2", "k3", "k4"] {
		assert!(cache.set(key, key, 1.0));
	}

	assert!(cache.get("k1").is_none());

	for key in ["k2", "k3", "k4"] {
		assert!(cache.get(key).is_some(), "Expected {key} to remain cached.");
	}
}

#[test]
fn entries_below_the_admission_threshold_are_never_retrievable() {
	let cache = SignatureCache::new(settings(4));

	assert!(!cache.set("low", "bundle", 0.69));
	assert!(!cache.set("nan", "bundle", f64::NAN));
	assert!(cache.set("edge", "bundle", 0.7));

	assert!(cache.get("low").is_none());
	assert!(cache.get("nan").is_none());
	assert!(cache.get("edge").is_some());
}

#[test]
fn rewriting_a_key_replaces_it_without_eviction() {
	let cache = SignatureCache::new(settings(2));

	cache.set("A", "first", 0.8);
	cache.set("B", "bundle-b", 0.8);
	cache.set("A", "second", 0.9);

	assert_eq!(cache.len(), 2);
	assert_eq!(cache.get("A").map(|entry| entry.bundle_id), Some("second".to_string()));
	assert!(cache.get("B").is_some());
}

#[test]
fn expired_entries_read_as_misses() {
	let (clock, cache) = cache_with_clock(4);

	cache.set("A", "bundle-a", 0.9);
	clock.advance(Duration::from_secs(59));

	assert!(cache.get("A").is_some());

	clock.advance(Duration::from_secs(1));

	assert!(cache.get("A").is_none());
	assert_eq!(cache.len(), 0);

	let stats = cache.stats();

	assert_eq!(stats.cache_hits, 1);
	assert_eq!(stats.cache_misses, 1);
}

#[test]
fn sweep_removes_only_expired_entries() {
	let (clock, cache) = cache_with_clock(4);

	cache.set("old", "bundle-old", 0.9);
	clock.advance(Duration::from_secs(30));
	cache.set("new", "bundle-new", 0.9);
	clock.advance(Duration::from_secs(30));

	assert_eq!(cache.sweep_expired(), 1);
	assert_eq!(cache.len(), 1);
	assert!(cache.get("new").is_some());
}

#[test]
fn hits_update_usage_and_statistics() {
	let (clock, cache) = cache_with_clock(4);

	cache.set("A", "bundle-a", 0.9);
	clock.advance(Duration::from_secs(5));

	let first = cache.get("A").expect("Expected a cache hit.");
	let second = cache.get("A").expect("Expected a cache hit.");

	assert!(cache.get("missing").is_none());
	assert_eq!(first.usage_count, 1);
	assert_eq!(second.usage_count, 2);
	assert!(second.last_used_at > second.created_at);

	let stats = cache.stats();

	assert_eq!(stats.total_requests, 3);
	assert_eq!(stats.cache_hits, 2);
	assert_eq!(stats.cache_misses, 1);
	assert!((stats.hit_rate - 2.0 / 3.0).abs() < 1e-12);
	assert_eq!(stats.entries, 1);

	cache.reset_stats();

	let stats = cache.stats();

	assert_eq!(stats.total_requests, 0);
	assert_eq!(stats.hit_rate, 0.0);
	assert_eq!(stats.entries, 1);
}

#[test]
fn invalidate_accepts_glob_patterns() {
	let cache = SignatureCache::new(settings(8));

	for key in ["b_aaaa", "b_bbbb", "q_cccc"] {
		cache.set(key, "bundle", 0.9);
	}

	assert_eq!(cache.invalidate(Some("b_*")), 2);
	assert!(cache.get("q_cccc").is_some());
	assert_eq!(cache.invalidate(None), 1);
	assert!(cache.is_empty());
}

#[test]
fn a_zero_capacity_cache_stores_nothing() {
	let cache = SignatureCache::new(settings(0));

	assert!(!cache.set("A", "bundle-a", 1.0));
	assert!(!cache.set("B", "bundle-b", 1.0));
	assert!(cache.is_empty());
	assert!(cache.get("A").is_none());
}

#[test]
fn concurrent_writers_and_readers_respect_the_bound() {
	const THREADS: usize = 8;
	const KEYS_PER_THREAD: usize = 400;
	const MAX_SIZE: usize = 64;

	let cache = SignatureCache::new(settings(MAX_SIZE));

	thread::scope(|scope| {
		for worker in 0..THREADS {
			let cache = &cache;

			scope.spawn(move || {
				for index in 0..KEYS_PER_THREAD {
					let key = format!("b_{worker:02}_{index:04}");

					assert!(cache.set(&key, "bundle", 0.9));

					cache.get(&key);
					cache.get("b_shared");

					assert!(cache.len() <= MAX_SIZE);
				}
			});
		}
	});

	let stats = cache.stats();

	assert_eq!(cache.len(), MAX_SIZE);
	assert_eq!(stats.entries, MAX_SIZE);
	assert_eq!(stats.total_requests, (THREADS * KEYS_PER_THREAD * 2) as u64);
	assert_eq!(stats.cache_hits + stats.cache_misses, stats.total_requests);
	assert!(stats.cache_misses >= (THREADS * KEYS_PER_THREAD) as u64);

	// Recency bookkeeping survives the contention: the next insert evicts exactly one key.
	assert!(cache.set("b_after", "bundle", 0.9));
	assert_eq!(cache.len(), MAX_SIZE);
	assert!(cache.get("b_after").is_some());
}

#[tokio::test]
async fn destroy_clears_entries_and_statistics() {
	let cache = Arc::new(SignatureCache::new(CacheSettings {
		cleanup_interval: Duration::from_millis(10),
		..settings(4)
	}));

	cache.start_sweeper();
	cache.set("A", "bundle-a", 0.9);
	cache.get("A");
	cache.destroy().await;

	assert!(cache.is_empty());
	assert_eq!(cache.stats().total_requests, 0);
}

#[tokio::test]
async fn background_sweep_evicts_expired_entries() {
	let clock = Arc::new(ManualClock::new());
	let cache = Arc::new(SignatureCache::with_clock(
		CacheSettings { cleanup_interval: Duration::from_millis(10), ..settings(4) },
		clock.clone(),
	));

	cache.set("A", "bundle-a", 0.9);
	cache.start_sweeper();
	clock.advance(Duration::from_secs(120));

	tokio::time::sleep(Duration::from_millis(100)).await;

	assert!(cache.is_empty());

	cache.stop_sweeper().await;
}
