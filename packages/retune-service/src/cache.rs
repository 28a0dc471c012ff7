use std::{
	collections::BTreeMap,
	sync::{
		Arc, Mutex, MutexGuard,
		atomic::{AtomicU64, Ordering},
	},
	time::{Duration, Instant},
};

use dashmap::DashMap;
use serde::Serialize;
use tokio::{sync::watch, task::JoinHandle, time::MissedTickBehavior};

use retune_domain::pattern;

pub trait Clock
where
	Self: Send + Sync,
{
	fn now(&self) -> Instant;
}

pub struct SystemClock;
impl Clock for SystemClock {
	fn now(&self) -> Instant {
		Instant::now()
	}
}

/// A clock that only moves when told to.
pub struct ManualClock {
	origin: Instant,
	offset: Mutex<Duration>,
}
impl ManualClock {
	pub fn new() -> Self {
		Self { origin: Instant::now(), offset: Mutex::new(Duration::ZERO) }
	}

	pub fn advance(&self, by: Duration) {
		let mut offset = self.offset.lock().unwrap_or_else(|err| err.into_inner());

		*offset += by;
	}
}
impl Default for ManualClock {
	fn default() -> Self {
		Self::new()
	}
}
impl Clock for ManualClock {
	fn now(&self) -> Instant {
		self.origin + *self.offset.lock().unwrap_or_else(|err| err.into_inner())
	}
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CacheSettings {
	pub max_size: usize,
	pub ttl: Duration,
	pub admission_threshold: f64,
	/// Zero disables the background sweep.
	pub cleanup_interval: Duration,
}
impl CacheSettings {
	pub fn from_config(cfg: &retune_config::Cache) -> Self {
		Self {
			max_size: cfg.max_size,
			ttl: Duration::from_secs(cfg.ttl_secs),
			admission_threshold: cfg.admission_threshold,
			cleanup_interval: Duration::from_secs(cfg.cleanup_interval_secs),
		}
	}
}
impl Default for CacheSettings {
	fn default() -> Self {
		Self::from_config(&retune_config::Cache::default())
	}
}

#[derive(Clone, Debug, PartialEq)]
pub struct CacheEntry {
	pub signature: String,
	pub bundle_id: String,
	pub satisfaction: f64,
	pub usage_count: u64,
	pub created_at: Instant,
	pub last_used_at: Instant,
	pub ttl: Duration,
}
impl CacheEntry {
	fn is_expired(&self, now: Instant) -> bool {
		now.saturating_duration_since(self.created_at) >= self.ttl
	}
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct CacheStats {
	pub hit_rate: f64,
	pub total_requests: u64,
	pub cache_hits: u64,
	pub cache_misses: u64,
	pub entries: usize,
}

struct Slot {
	entry: CacheEntry,
	tick: u64,
}

struct Sweeper {
	shutdown: watch::Sender<bool>,
	handle: JoinHandle<()>,
}

/// Bounded cache of bundle references keyed by signature.
///
/// Only outcomes at or above the admission threshold are stored. Recency order is kept apart
/// from expiry: expired entries are dropped lazily on read and by the optional background sweep,
/// while a full cache evicts its least recently used key.
///
/// Entries live in a sharded map, so reads of unrelated keys do not contend. The recency index
/// maps ticks to keys; its smallest tick is the least recently used key. A slot guard may be held
/// while locking the index, never the other way round.
pub struct SignatureCache {
	settings: CacheSettings,
	clock: Arc<dyn Clock>,
	slots: DashMap<String, Slot>,
	recency: Mutex<BTreeMap<u64, String>>,
	// New keys are admitted one at a time so a full cache never overshoots its bound.
	admission: Mutex<()>,
	next_tick: AtomicU64,
	hits: AtomicU64,
	misses: AtomicU64,
	sweeper: Mutex<Option<Sweeper>>,
}
impl SignatureCache {
	pub fn new(settings: CacheSettings) -> Self {
		Self::with_clock(settings, Arc::new(SystemClock))
	}

	pub fn with_clock(settings: CacheSettings, clock: Arc<dyn Clock>) -> Self {
		Self {
			settings,
			clock,
			slots: DashMap::new(),
			recency: Mutex::new(BTreeMap::new()),
			admission: Mutex::new(()),
			next_tick: AtomicU64::new(0),
			hits: AtomicU64::new(0),
			misses: AtomicU64::new(0),
			sweeper: Mutex::new(None),
		}
	}

	pub fn settings(&self) -> &CacheSettings {
		&self.settings
	}

	pub fn get(&self, signature: &str) -> Option<CacheEntry> {
		let now = self.clock.now();
		let Some(mut slot) = self.slots.get_mut(signature) else {
			self.misses.fetch_add(1, Ordering::Relaxed);

			tracing::debug!(signature, "Signature cache miss.");

			return None;
		};

		if slot.entry.is_expired(now) {
			let tick = slot.tick;

			drop(slot);
			self.remove_slot(signature, tick);
			self.misses.fetch_add(1, Ordering::Relaxed);

			tracing::debug!(signature, "Signature cache entry expired.");

			return None;
		}

		let tick = self.tick();

		self.move_to_front(signature, slot.tick, tick);

		slot.tick = tick;
		slot.entry.usage_count += 1;
		slot.entry.last_used_at = now;

		let entry = slot.entry.clone();

		drop(slot);
		self.hits.fetch_add(1, Ordering::Relaxed);

		tracing::debug!(signature, usage_count = entry.usage_count, "Signature cache hit.");

		Some(entry)
	}

	/// Stores a bundle reference. Returns `false` when the satisfaction score is below the
	/// admission threshold or the cache has no capacity; nothing is stored in that case.
	pub fn set(&self, signature: &str, bundle_id: &str, satisfaction: f64) -> bool {
		if self.settings.max_size == 0 {
			tracing::debug!(signature, "Signature cache has no capacity. Entry refused.");

			return false;
		}
		if !satisfaction.is_finite() || satisfaction < self.settings.admission_threshold {
			tracing::debug!(
				signature,
				satisfaction,
				threshold = self.settings.admission_threshold,
				"Signature cache refused entry below admission threshold."
			);

			return false;
		}

		let now = self.clock.now();
		let entry = CacheEntry {
			signature: signature.to_string(),
			bundle_id: bundle_id.to_string(),
			satisfaction,
			usage_count: 0,
			created_at: now,
			last_used_at: now,
			ttl: self.settings.ttl,
		};
		let _admission = self.admission.lock().unwrap_or_else(|err| err.into_inner());

		if let Some(mut slot) = self.slots.get_mut(signature) {
			let tick = self.tick();

			self.move_to_front(signature, slot.tick, tick);

			slot.tick = tick;
			slot.entry = entry;

			return true;
		}

		while self.slots.len() >= self.settings.max_size {
			let Some(evicted) = self.evict_least_recent() else {
				break;
			};

			tracing::debug!(signature = %evicted.signature, "Signature cache evicted entry.");
		}

		let tick = self.tick();

		self.recency().insert(tick, signature.to_string());
		self.slots.insert(signature.to_string(), Slot { entry, tick });

		true
	}

	/// Removes every entry, or only the signatures matching a `*` glob. Returns the removed count.
	pub fn invalidate(&self, pattern: Option<&str>) -> usize {
		self.remove_where(|key, _| {
			pattern.is_none_or(|pattern| pattern::glob_matches(pattern, key))
		})
	}

	pub fn sweep_expired(&self) -> usize {
		let now = self.clock.now();

		self.remove_where(|_, entry| entry.is_expired(now))
	}

	pub fn stats(&self) -> CacheStats {
		let hits = self.hits.load(Ordering::Relaxed);
		let misses = self.misses.load(Ordering::Relaxed);
		let total_requests = hits + misses;
		let hit_rate = if total_requests == 0 { 0.0 } else { hits as f64 / total_requests as f64 };

		CacheStats {
			hit_rate,
			total_requests,
			cache_hits: hits,
			cache_misses: misses,
			entries: self.slots.len(),
		}
	}

	pub fn reset_stats(&self) {
		self.hits.store(0, Ordering::Relaxed);
		self.misses.store(0, Ordering::Relaxed);
	}

	pub fn len(&self) -> usize {
		self.slots.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Starts the periodic expiry sweep. A zero cleanup interval, or a sweep that is already
	/// running, makes this a no-op.
	pub fn start_sweeper(self: &Arc<Self>) {
		let interval = self.settings.cleanup_interval;

		if interval.is_zero() {
			return;
		}

		let mut sweeper = self.sweeper.lock().unwrap_or_else(|err| err.into_inner());

		if sweeper.is_some() {
			return;
		}

		let (shutdown, mut shutdown_rx) = watch::channel(false);
		let cache = Arc::clone(self);
		let handle = tokio::spawn(async move {
			let mut ticker = tokio::time::interval(interval);

			ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
			ticker.tick().await;

			loop {
				tokio::select! {
					_ = shutdown_rx.changed() => break,
					_ = ticker.tick() => {
						let removed = cache.sweep_expired();

						if removed > 0 {
							tracing::info!(removed, "Swept expired signature cache entries.");
						}
					},
				}
			}
		});

		*sweeper = Some(Sweeper { shutdown, handle });
	}

	/// Stops the sweep and waits for it to exit.
	pub async fn stop_sweeper(&self) {
		let sweeper = self.sweeper.lock().unwrap_or_else(|err| err.into_inner()).take();

		if let Some(Sweeper { shutdown, handle }) = sweeper {
			let _ = shutdown.send(true);

			if let Err(err) = handle.await {
				tracing::error!(error = %err, "Signature cache sweeper exited abnormally.");
			}
		}
	}

	/// Stops the sweep and drops every entry and statistic.
	pub async fn destroy(&self) {
		self.stop_sweeper().await;

		let _admission = self.admission.lock().unwrap_or_else(|err| err.into_inner());

		self.slots.clear();
		self.recency().clear();
		self.reset_stats();
	}

	fn tick(&self) -> u64 {
		self.next_tick.fetch_add(1, Ordering::Relaxed)
	}

	fn recency(&self) -> MutexGuard<'_, BTreeMap<u64, String>> {
		self.recency.lock().unwrap_or_else(|err| err.into_inner())
	}

	fn move_to_front(&self, key: &str, from: u64, to: u64) {
		let mut recency = self.recency();

		recency.remove(&from);
		recency.insert(to, key.to_string());
	}

	// A tick that no longer matches means the key was touched or replaced in between.
	fn remove_slot(&self, key: &str, tick: u64) -> Option<CacheEntry> {
		let (_, slot) = self.slots.remove_if(key, |_, slot| slot.tick == tick)?;

		self.recency().remove(&slot.tick);

		Some(slot.entry)
	}

	fn evict_least_recent(&self) -> Option<CacheEntry> {
		loop {
			let (tick, key) = self.recency().pop_first()?;

			if let Some((_, slot)) = self.slots.remove_if(&key, |_, slot| slot.tick == tick) {
				return Some(slot.entry);
			}
		}
	}

	fn remove_where<F>(&self, mut matches: F) -> usize
	where
		F: FnMut(&str, &CacheEntry) -> bool,
	{
		let mut removed = Vec::new();

		self.slots.retain(|key, slot| {
			if matches(key.as_str(), &slot.entry) {
				removed.push(slot.tick);

				return false;
			}

			true
		});

		let mut recency = self.recency();

		for tick in &removed {
			recency.remove(tick);
		}

		removed.len()
	}
}
