//! Owns the in-memory cache map, the single-flight in-flight-fetch
//! registry, and the persistence hydrate/persist cycle.

// crates.io
use futures::future::{BoxFuture, Shared};
use indexmap::IndexMap;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, instrument};
// self
use crate::{
	_prelude::*,
	cache::{entry::CacheEntry, persistence},
	config::CacheSettings,
	env::{Environment, PersistentStore},
	key::RepositoryKey,
};

/// Outcome of a single fetch attempt, already normalized by the HTTP
/// client layer — a failed fetch never reaches the cache manager as an
/// error, it arrives here as an unchanged/empty outcome instead.
#[derive(Clone, Debug)]
pub struct FetchOutcome {
	/// `features` payload, or the previous value if the fetch failed and
	/// there was nothing better to report.
	pub features: Value,
	/// `experiments` payload, same fallback rule as `features`.
	pub experiments: Value,
	/// Upstream version stamp, if the fetch succeeded.
	pub date_updated: Option<String>,
	/// Whether the response advertised server-sent-event support.
	pub sse_supported: bool,
	/// Whether this outcome represents a genuinely fetched payload as
	/// opposed to a failure that fell back to the previous state.
	pub changed: bool,
	/// Whether the underlying fetch actually succeeded, as opposed to
	/// degrading to the previous cached state.
	pub succeeded: bool,
}

type InFlight = Shared<BoxFuture<'static, FetchOutcome>>;

/// Cache map plus the bookkeeping needed to coalesce concurrent fetches
/// and mirror state to a persistent store.
pub struct CacheManager {
	cache: RwLock<IndexMap<RepositoryKey, CacheEntry>>,
	in_flight: Mutex<std::collections::HashMap<RepositoryKey, InFlight>>,
	hydrated: Mutex<bool>,
}
impl std::fmt::Debug for CacheManager {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("CacheManager").finish_non_exhaustive()
	}
}
impl CacheManager {
	/// Build an empty cache manager.
	pub fn new() -> Self {
		Self {
			cache: RwLock::new(IndexMap::new()),
			in_flight: Mutex::new(std::collections::HashMap::new()),
			hydrated: Mutex::new(false),
		}
	}

	/// Current snapshot for `key`, if cached.
	pub async fn lookup(&self, key: &RepositoryKey) -> Option<CacheEntry> {
		self.cache.read().await.get(key).cloned()
	}

	/// Join an in-flight fetch for `key`, or start one via `spawn` and
	/// register it for others to join.
	///
	/// `spawn` is called at most once per distinct in-flight window; every
	/// concurrent caller for the same key observes the exact same
	/// `FetchOutcome`, not merely a non-overlapping execution.
	pub async fn begin_fetch_or_join<F>(&self, key: &RepositoryKey, spawn: F) -> FetchOutcome
	where
		F: FnOnce() -> BoxFuture<'static, FetchOutcome>,
	{
		let mut in_flight = self.in_flight.lock().await;

		if let Some(shared) = in_flight.get(key) {
			let shared = shared.clone();

			drop(in_flight);

			return shared.await;
		}

		let shared: InFlight = spawn().shared();

		in_flight.insert(key.clone(), shared.clone());
		drop(in_flight);

		let outcome = shared.await;

		self.in_flight.lock().await.remove(key);

		outcome
	}

	/// Apply a fetch outcome to the cache map, returning `true` if the
	/// stored payload actually changed (a new `dateUpdated`, or first
	/// population), `false` if only the staleness deadline was renewed.
	#[instrument(skip(self, outcome, settings), fields(key = %key))]
	pub async fn ingest(
		&self,
		key: &RepositoryKey,
		outcome: &FetchOutcome,
		settings: &CacheSettings,
	) -> bool {
		let mut cache = self.cache.write().await;
		let same_nonempty_version = outcome.date_updated.as_deref().is_some_and(|version| !version.is_empty());

		match cache.get_mut(key) {
			Some(existing) if same_nonempty_version && existing.date_updated == outcome.date_updated => {
				existing.renew(settings.stale_ttl);

				debug!("renewed cache entry without a payload change");

				false
			},
			_ => {
				cache.insert(
					key.clone(),
					CacheEntry::new(
						outcome.features.clone(),
						outcome.experiments.clone(),
						outcome.date_updated.clone(),
						outcome.sse_supported,
						settings.stale_ttl,
					),
				);

				true
			},
		}
	}

	/// Drop every cached entry and reset the hydration latch.
	pub async fn clear(&self) {
		self.cache.write().await.clear();
		*self.hydrated.lock().await = false;
	}

	/// Whether [`Self::hydrate`] has already run for this manager.
	pub async fn is_hydrated(&self) -> bool {
		*self.hydrated.lock().await
	}

	/// Load the persisted snapshot into the cache map, exactly once per
	/// manager lifetime (until [`Self::clear`] resets the latch).
	///
	/// Missing store, missing record, or a corrupt blob are all silently
	/// treated as "nothing to hydrate" — persistence is a cache warm-up
	/// optimization, never a hard dependency for serving features.
	#[instrument(skip(self, store))]
	pub async fn hydrate(&self, store: &dyn PersistentStore, cache_key: &str) -> Result<()> {
		let mut hydrated = self.hydrated.lock().await;

		if *hydrated {
			return Ok(());
		}

		*hydrated = true;

		let Some(raw) = store.get_item(cache_key).await? else {
			debug!("no persisted snapshot found");

			return Ok(());
		};

		match persistence::deserialize_snapshot(&raw) {
			Ok(records) => {
				let mut cache = self.cache.write().await;

				for (key, entry) in records {
					cache.entry(key).or_insert(entry);
				}
			},
			Err(err) => debug!(error = %err, "ignoring corrupt persisted snapshot"),
		}

		Ok(())
	}

	/// Serialize the current cache map and write it to `store`.
	pub async fn persist(&self, store: &dyn PersistentStore, cache_key: &str) -> Result<()> {
		let raw = {
			let cache = self.cache.read().await;

			persistence::serialize_snapshot(&cache)?
		};

		store.set_item(cache_key, raw).await
	}

	/// Fire-and-forget persistence: spawn a task that persists the current
	/// map, logging rather than propagating a failure.
	///
	/// Ingest must not block on the store round-trip — a slow or
	/// momentarily unavailable store should never delay a feature update
	/// reaching subscribers.
	pub fn persist_in_background(self: &Arc<Self>, environment: Arc<Environment>, cache_key: String) {
		let manager = Arc::clone(self);

		tokio::spawn(async move {
			let Some(store) = environment.persistent_store().await else { return };

			if let Err(err) = manager.persist(store.as_ref(), &cache_key).await {
				debug!(error = %err, "failed to persist cache snapshot");
			}
		});
	}
}
impl Default for CacheManager {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn outcome(date_updated: &str, changed: bool) -> FetchOutcome {
		FetchOutcome {
			features: serde_json::json!({"flag": true}),
			experiments: serde_json::json!({}),
			date_updated: Some(date_updated.to_string()),
			sse_supported: false,
			changed,
			succeeded: true,
		}
	}

	#[tokio::test]
	async fn ingest_reports_change_on_first_population() {
		let manager = CacheManager::new();
		let key = RepositoryKey::plain("host", "key");
		let changed = manager.ingest(&key, &outcome("v1", true), &CacheSettings::default()).await;

		assert!(changed);
		assert!(manager.lookup(&key).await.is_some());
	}

	#[tokio::test]
	async fn ingest_does_not_report_change_for_same_version() {
		let manager = CacheManager::new();
		let key = RepositoryKey::plain("host", "key");
		let settings = CacheSettings::default();

		manager.ingest(&key, &outcome("v1", true), &settings).await;

		let changed = manager.ingest(&key, &outcome("v1", false), &settings).await;

		assert!(!changed);
	}

	#[tokio::test]
	async fn ingest_always_reports_change_when_the_feed_never_sends_a_version() {
		let manager = CacheManager::new();
		let key = RepositoryKey::plain("host", "key");
		let settings = CacheSettings::default();
		let versionless = FetchOutcome {
			features: serde_json::json!({"flag": true}),
			experiments: serde_json::json!({}),
			date_updated: None,
			sse_supported: false,
			changed: true,
			succeeded: true,
		};

		manager.ingest(&key, &versionless, &settings).await;

		let changed = manager.ingest(&key, &versionless, &settings).await;

		assert!(changed, "a feed with no dateUpdated must never be treated as a no-op renewal");
	}

	#[tokio::test]
	async fn concurrent_callers_join_the_same_fetch() {
		use std::sync::atomic::{AtomicUsize, Ordering};

		let manager = Arc::new(CacheManager::new());
		let key = RepositoryKey::plain("host", "key");
		let calls = Arc::new(AtomicUsize::new(0));

		let spawn = |calls: Arc<AtomicUsize>| -> BoxFuture<'static, FetchOutcome> {
			calls.fetch_add(1, Ordering::SeqCst);

			Box::pin(async move {
				tokio::time::sleep(Duration::from_millis(20)).await;

				FetchOutcome {
					features: serde_json::json!({}),
					experiments: serde_json::json!({}),
					date_updated: Some("v1".into()),
					sse_supported: false,
					changed: true,
					succeeded: true,
				}
			})
		};

		let manager_a = Arc::clone(&manager);
		let key_a = key.clone();
		let calls_a = Arc::clone(&calls);
		let a = tokio::spawn(async move {
			manager_a.begin_fetch_or_join(&key_a, || spawn(calls_a)).await
		});

		let manager_b = Arc::clone(&manager);
		let key_b = key.clone();
		let calls_b = Arc::clone(&calls);
		let b = tokio::spawn(async move {
			manager_b.begin_fetch_or_join(&key_b, || spawn(calls_b)).await
		});

		let (outcome_a, outcome_b) = tokio::join!(a, b);

		assert_eq!(outcome_a.unwrap().date_updated, outcome_b.unwrap().date_updated);
		assert_eq!(calls.load(Ordering::SeqCst), 1);
	}
}
