//! The public repository surface: subscription registry, cache
//! configuration, and the fetch-with-cache decision tree tying the cache
//! manager, the HTTP client, and the streaming engine together.

// std
use std::sync::atomic::{AtomicBool, Ordering};
#[cfg(feature = "metrics")] use std::collections::HashMap;
// crates.io
use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, instrument};
// self
use crate::{
	_prelude::*,
	cache::{entry::CacheEntry, manager::{CacheManager, FetchOutcome}},
	config::{CacheSettings, CacheSettingsPatch, RefreshOptions},
	env::{Environment, Polyfills, StreamEvent},
	http::client,
	instance::{ApiHosts, InstanceId, SdkInstance},
	key::RepositoryKey,
	stream::{StreamSink, StreamingEngine},
};

/// Point-in-time view of one key's cache/streaming state, returned by
/// [`Repository::status`]/[`Repository::statuses`].
#[derive(Clone, Debug)]
pub struct RepositoryStatus {
	/// The key this status describes.
	pub key: RepositoryKey,
	/// Number of subscribed instances currently sharing this key.
	pub subscriber_count: usize,
	/// Whether the cached payload is stale (due for a background refresh).
	pub is_stale: bool,
	/// Wall-clock time the cached payload was last fetched, if any.
	pub last_fetched: Option<DateTime<Utc>>,
	/// Whether a streaming connection is currently open for this key.
	pub streaming: bool,
}

type SubscriberSet = IndexMap<InstanceId, Arc<dyn SdkInstance>>;

/// State shared between [`Repository`]'s public surface and the
/// background streaming engine. Kept separate from [`Repository`] itself
/// so it can be handed to [`StreamingEngine`] as a [`StreamSink`] without
/// a self-referential `Arc`.
struct Shared {
	environment: Arc<Environment>,
	cache: Arc<CacheManager>,
	settings: RwLock<CacheSettings>,
	subscriptions: RwLock<IndexMap<RepositoryKey, SubscriberSet>>,
	/// Global background-sync latch. Flipped by `refresh_features`'s
	/// `background_sync` override for every key, not just the caller's —
	/// this mirrors documented upstream behavior, surprising as it is.
	background_sync: AtomicBool,
	#[cfg(feature = "metrics")]
	metrics: std::sync::Mutex<HashMap<RepositoryKey, Arc<crate::metrics::RepositoryMetrics>>>,
}
impl std::fmt::Debug for Shared {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Shared").finish_non_exhaustive()
	}
}
impl Shared {
	async fn representative_decryption_key(&self, key: &RepositoryKey) -> Option<String> {
		self.subscriptions
			.read()
			.await
			.get(key)
			.and_then(|set| set.values().next())
			.and_then(|instance| instance.decryption_key())
	}

	async fn subscribers(&self, key: &RepositoryKey) -> Vec<Arc<dyn SdkInstance>> {
		self.subscriptions
			.read()
			.await
			.get(key)
			.map(|set| set.values().cloned().collect())
			.unwrap_or_default()
	}

	#[cfg(feature = "metrics")]
	fn metrics_for(&self, key: &RepositoryKey) -> Arc<crate::metrics::RepositoryMetrics> {
		let mut metrics = self.metrics.lock().expect("metrics registry mutex poisoned");

		Arc::clone(metrics.entry(key.clone()).or_insert_with(crate::metrics::RepositoryMetrics::new))
	}

	#[cfg(feature = "metrics")]
	fn record_outcome(&self, key: &RepositoryKey, outcome: &FetchOutcome, elapsed: Duration) {
		let metrics = self.metrics_for(key);

		if outcome.succeeded {
			metrics.record_refresh_success(elapsed);
		} else {
			metrics.record_refresh_error();
		}
	}

	#[instrument(skip(self, outcome), fields(key = %key))]
	async fn commit_and_fanout(&self, key: &RepositoryKey, outcome: &FetchOutcome) {
		let settings = self.settings.read().await.clone();
		let changed = self.cache.ingest(key, outcome, &settings).await;

		if changed {
			self.cache.persist_in_background(Arc::clone(&self.environment), settings.cache_key.clone());
		}

		for instance in self.subscribers(key).await {
			if let Err(err) = instance.set_features(outcome.features.clone()).await {
				debug!(error = %err, "instance rejected features payload");
			}
			if let Err(err) = instance.set_experiments(outcome.experiments.clone()).await {
				debug!(error = %err, "instance rejected experiments payload");
			}
		}
	}
}
#[async_trait]
impl StreamSink for Shared {
	async fn handle_stream_event(&self, key: RepositoryKey, event: StreamEvent) {
		match event {
			StreamEvent::Open => debug!(%key, "stream opened"),
			StreamEvent::Error(message) => debug!(%key, error = %message, "stream reported an error"),
			StreamEvent::Message { data, .. } => {
				let decryption_key = self.representative_decryption_key(&key).await;
				let previous = self.cache.lookup(&key).await;
				let raw = client::RawFetchResult::from_body(data.as_bytes(), true);
				let outcome =
					client::resolve_outcome(raw, decryption_key.as_deref(), &self.environment, previous.as_ref())
						.await;

				self.commit_and_fanout(&key, &outcome).await;
			},
		}
	}
}

/// Process-wide feature repository: one cache map and subscription
/// registry shared by every instance that subscribes to it.
///
/// Cheap to clone — cloning shares the same underlying state, the way a
/// caller would otherwise reach for a single global singleton, while
/// still letting tests build independent repositories side by side.
#[derive(Clone, Debug)]
pub struct Repository {
	shared: Arc<Shared>,
	stream: Arc<StreamingEngine>,
}
impl Repository {
	/// Start building a repository with default cache settings and the
	/// default environment (a `reqwest`-backed fetcher and SSE factory, an
	/// AES-GCM decryptor, no persistent store).
	pub fn builder() -> RepositoryBuilder {
		RepositoryBuilder::default()
	}

	/// Subscribe `instance` to its derived key, returning an id used to
	/// [`Self::unsubscribe`] later.
	///
	/// Only registers the instance against its key's subscriber set;
	/// nothing is fetched or delivered until a [`Self::refresh_features`]
	/// call resolves a payload.
	#[instrument(skip(self, instance))]
	pub async fn subscribe(&self, instance: Arc<dyn SdkInstance>) -> InstanceId {
		let key = derive_key(instance.as_ref());
		let id = InstanceId::generate();

		self.shared.subscriptions.write().await.entry(key).or_default().insert(id, instance);

		id
	}

	/// Remove `id` from every key's subscriber set.
	///
	/// Sweeps all keys rather than trusting a single remembered key,
	/// matching documented upstream behavior: an instance that changed its
	/// derived key mid-lifetime (e.g. a new `userId`) is still fully
	/// cleaned up.
	#[instrument(skip(self))]
	pub async fn unsubscribe(&self, id: InstanceId) {
		let mut emptied = Vec::new();

		{
			let mut subscriptions = self.shared.subscriptions.write().await;

			for (key, subscribers) in subscriptions.iter_mut() {
				subscribers.swap_remove(&id);

				if subscribers.is_empty() {
					emptied.push(key.clone());
				}
			}

			for key in &emptied {
				subscriptions.swap_remove(key);
			}
		}

		for key in emptied {
			self.stream.close(&key).await;
		}
	}

	/// Resolve a payload for `instance`'s key, subject to `options`, and
	/// (unless `options.update_instance` is `false`) deliver it to
	/// `instance`.
	///
	/// Returns the resolved `{features, experiments}` payload, or
	/// `serde_json::Value::Null` if `options.timeout` elapsed before a
	/// fetch completed — the fetch itself is never aborted, it keeps
	/// running in the background and still populates the cache.
	#[instrument(skip(self, instance, options))]
	pub async fn refresh_features(
		&self,
		instance: &Arc<dyn SdkInstance>,
		options: RefreshOptions,
	) -> Result<Value> {
		if let Some(background_sync) = options.background_sync {
			self.shared.background_sync.store(background_sync, Ordering::SeqCst);

			if !background_sync {
				self.stream.close_all().await;
			}
		}

		let key = derive_key(instance.as_ref());
		let hosts = instance.api_hosts();
		let ctx = instance_ctx(instance.as_ref());
		let payload = self.fetch_with_cache(&key, &hosts, &ctx, &options).await?;

		if options.update_instance && !payload_is_empty(&payload) {
			deliver_payload(instance.as_ref(), &payload).await?;
		}

		Ok(payload)
	}

	/// Drop every cached entry, close every streaming connection, and
	/// reset the persistence hydration latch.
	#[instrument(skip(self))]
	pub async fn clear_cache(&self) -> Result<()> {
		self.shared.cache.clear().await;
		self.stream.close_all().await;

		Ok(())
	}

	/// Apply a sparse override to the current cache settings.
	pub async fn configure_cache(&self, patch: CacheSettingsPatch) -> Result<()> {
		let mut settings = self.shared.settings.write().await;
		let next = patch.apply(&settings)?;

		*settings = next;

		Ok(())
	}

	/// Replace one or more environment shims at runtime.
	pub async fn set_polyfills(&self, overrides: Polyfills) {
		self.shared.environment.set_polyfills(overrides).await;
	}

	/// Current status for `key`, if anything is cached or subscribed under
	/// it.
	pub async fn status(&self, key: &RepositoryKey) -> Option<RepositoryStatus> {
		let subscriber_count =
			self.shared.subscriptions.read().await.get(key).map(IndexMap::len).unwrap_or(0);
		let entry = self.shared.cache.lookup(key).await;

		if subscriber_count == 0 && entry.is_none() {
			return None;
		}

		Some(RepositoryStatus {
			key: key.clone(),
			subscriber_count,
			is_stale: entry.as_ref().map(|entry| entry.is_stale()).unwrap_or(true),
			last_fetched: entry.as_ref().map(|entry| entry.fetched_at_wall()),
			streaming: self.stream.is_open(key).await,
		})
	}

	/// Status for every key with a subscriber or a cache entry.
	pub async fn statuses(&self) -> Vec<RepositoryStatus> {
		let keys: Vec<RepositoryKey> = self.shared.subscriptions.read().await.keys().cloned().collect();
		let mut statuses = Vec::with_capacity(keys.len());

		for key in keys {
			if let Some(status) = self.status(&key).await {
				statuses.push(status);
			}
		}

		statuses
	}

	async fn ensure_hydrated(&self) -> Result<()> {
		if self.shared.cache.is_hydrated().await {
			return Ok(());
		}

		let Some(store) = self.shared.environment.persistent_store().await else { return Ok(()) };
		let cache_key = self.shared.settings.read().await.cache_key.clone();

		self.shared.cache.hydrate(store.as_ref(), &cache_key).await
	}

	async fn ensure_streaming(
		&self,
		key: RepositoryKey,
		hosts: ApiHosts,
		client_key: String,
		headers: Vec<(String, String)>,
	) {
		let background_sync_enabled = self.shared.settings.read().await.background_sync
			&& self.shared.background_sync.load(Ordering::SeqCst);

		if background_sync_enabled {
			self.stream.ensure_open(key, hosts, client_key, headers).await;
		}
	}

	/// The fetch-with-cache decision tree: serve a usable cached entry
	/// immediately (kicking off a background refresh if it is stale),
	/// otherwise block on a fresh fetch — bounded by `options.timeout`,
	/// after which `Value::Null` is returned while the fetch keeps running
	/// in the background and still populates the cache.
	async fn fetch_with_cache(
		&self,
		key: &RepositoryKey,
		hosts: &ApiHosts,
		ctx: &InstanceContext,
		options: &RefreshOptions,
	) -> Result<Value> {
		self.ensure_hydrated().await?;

		let cached = self.shared.cache.lookup(key).await;
		let usable = !options.skip_cache
			&& cached.as_ref().map(|entry| options.allow_stale || !entry.is_stale()).unwrap_or(false);

		if usable {
			let entry = cached.expect("usable implies a cached entry");

			#[cfg(feature = "metrics")]
			self.shared.metrics_for(key).record_hit(entry.is_stale());

			if entry.sse_supported {
				self.ensure_streaming(key.clone(), hosts.clone(), ctx.client_key.clone(), ctx.headers.clone()).await;
			}

			if entry.is_stale() {
				self.spawn_fetch(key.clone(), hosts.clone(), ctx.clone());
			}

			return Ok(cache_payload(&entry));
		}

		#[cfg(feature = "metrics")]
		self.shared.metrics_for(key).record_miss();

		let handle = self.spawn_fetch(key.clone(), hosts.clone(), ctx.clone());

		match options.timeout {
			Some(timeout) => match tokio::time::timeout(timeout, handle).await {
				Ok(Ok(outcome)) => Ok(outcome_payload(&outcome)),
				_ => Ok(Value::Null),
			},
			None => {
				let outcome = handle.await.map_err(|err| Error::Stream(format!("fetch task panicked: {err}")))?;

				Ok(outcome_payload(&outcome))
			},
		}
	}

	/// Fetch `key` and commit the result to the cache and its subscribers,
	/// detached onto its own task so a caller's timeout never aborts it.
	fn spawn_fetch(&self, key: RepositoryKey, hosts: ApiHosts, ctx: InstanceContext) -> tokio::task::JoinHandle<FetchOutcome> {
		let shared = Arc::clone(&self.shared);

		tokio::spawn(async move {
			#[cfg(feature = "metrics")]
			let started = Instant::now();

			let outcome = fetch_and_resolve(&shared, &key, &hosts, &ctx).await;

			shared.commit_and_fanout(&key, &outcome).await;

			#[cfg(feature = "metrics")]
			shared.record_outcome(&key, &outcome, started.elapsed());

			outcome
		})
	}

	/// Current per-key telemetry snapshot, if any fetch has been attempted
	/// for `key` since the repository was built.
	#[cfg(feature = "metrics")]
	pub fn metrics_snapshot(&self, key: &RepositoryKey) -> Option<crate::metrics::RepositoryMetricsSnapshot> {
		self.shared.metrics.lock().expect("metrics registry mutex poisoned").get(key).map(|metrics| metrics.snapshot())
	}
}

/// The handful of instance-derived values a background task needs,
/// carried separately so the task does not have to hold a borrow of the
/// caller's `&dyn SdkInstance`.
#[derive(Clone)]
struct InstanceContext {
	client_key: String,
	remote_eval: bool,
	attributes: Value,
	headers: Vec<(String, String)>,
	decryption_key: Option<String>,
}
fn instance_ctx(instance: &dyn SdkInstance) -> InstanceContext {
	InstanceContext {
		client_key: instance.client_key().to_string(),
		remote_eval: instance.is_remote_eval(),
		attributes: instance.attributes(),
		headers: instance.request_headers(),
		decryption_key: instance.decryption_key(),
	}
}

async fn fetch_and_resolve(
	shared: &Shared,
	key: &RepositoryKey,
	hosts: &ApiHosts,
	ctx: &InstanceContext,
) -> FetchOutcome {
	let previous = shared.cache.lookup(key).await;
	let outcome_future = {
		let environment = Arc::clone(&shared.environment);
		let hosts = hosts.clone();
		let ctx = ctx.clone();
		let previous = previous.clone();

		move || -> futures::future::BoxFuture<'static, FetchOutcome> {
			Box::pin(async move {
				let raw = client::fetch(
					&environment,
					&hosts,
					&ctx.client_key,
					ctx.remote_eval,
					&ctx.attributes,
					&ctx.headers,
				)
				.await;

				client::resolve_outcome(raw, ctx.decryption_key.as_deref(), &environment, previous.as_ref()).await
			})
		}
	};

	shared.cache.begin_fetch_or_join(key, outcome_future).await
}

/// Build the `{features, experiments}` payload reported for a cached entry.
fn cache_payload(entry: &CacheEntry) -> Value {
	serde_json::json!({ "features": entry.features, "experiments": entry.experiments })
}

/// Build the `{features, experiments}` payload reported for a fresh fetch
/// outcome.
fn outcome_payload(outcome: &FetchOutcome) -> Value {
	serde_json::json!({ "features": outcome.features, "experiments": outcome.experiments })
}

/// Whether a resolved payload is the `Value::Null` sentinel used when a
/// timeout elapsed before a fetch completed — the only case treated as "no
/// payload resolved" rather than a delivered (possibly empty) result.
fn payload_is_empty(payload: &Value) -> bool {
	payload.is_null()
}

async fn deliver_payload(instance: &dyn SdkInstance, payload: &Value) -> Result<()> {
	instance.set_features(payload["features"].clone()).await?;
	instance.set_experiments(payload["experiments"].clone()).await?;

	Ok(())
}

fn derive_key(instance: &dyn SdkInstance) -> RepositoryKey {
	let hosts = instance.api_hosts();

	if instance.is_remote_eval() {
		let user_id = instance.user_id().unwrap_or_default();

		RepositoryKey::remote_eval(&hosts.api_host, instance.client_key(), &user_id)
	} else {
		RepositoryKey::plain(&hosts.api_host, instance.client_key())
	}
}

/// Builds a [`Repository`] with validated cache settings and a chosen
/// environment.
#[derive(Default)]
pub struct RepositoryBuilder {
	settings: CacheSettings,
	environment: Option<Environment>,
}
impl RepositoryBuilder {
	/// Override the default cache settings.
	pub fn cache_settings(mut self, settings: CacheSettings) -> Self {
		self.settings = settings;
		self
	}

	/// Supply a pre-built environment instead of the default one.
	pub fn environment(mut self, environment: Environment) -> Self {
		self.environment = Some(environment);
		self
	}

	/// Validate settings and construct the repository.
	pub fn build(self) -> Result<Repository> {
		self.settings.validate()?;

		let environment = Arc::new(match self.environment {
			Some(environment) => environment,
			None => Environment::new()?,
		});
		let cache = Arc::new(CacheManager::new());
		let shared = Arc::new(Shared {
			environment: Arc::clone(&environment),
			cache,
			settings: RwLock::new(self.settings),
			subscriptions: RwLock::new(IndexMap::new()),
			background_sync: AtomicBool::new(true),
			#[cfg(feature = "metrics")]
			metrics: std::sync::Mutex::new(HashMap::new()),
		});
		let stream = Arc::new(StreamingEngine::new(environment, Arc::clone(&shared) as Arc<dyn StreamSink>));

		Ok(Repository { shared, stream })
	}
}
