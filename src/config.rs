//! Cache configuration: the tunables a caller can set once at construction
//! time via [`RepositoryBuilder`](crate::RepositoryBuilder), and patch later
//! via `configure_cache`.

// self
use crate::{Error, Result, _prelude::*};

/// Default staleness window before a cached payload is considered old
/// enough to trigger a background refresh.
const DEFAULT_STALE_TTL: Duration = Duration::from_secs(60);
/// Default polling interval used when a key has no active subscriber for a
/// while but streaming has not been explicitly disabled.
const DEFAULT_IDLE_STREAM_INTERVAL: Duration = Duration::from_secs(20 * 60);
/// Default persistence key, matching the upstream SDK's storage key so a
/// migrated deployment finds its existing cache on first boot.
const DEFAULT_CACHE_KEY: &str = "gbFeaturesCache";

/// Cache tunables in effect for a [`Repository`](crate::Repository).
#[derive(Clone, Debug)]
pub struct CacheSettings {
	/// How long a payload may be served before a background refresh is
	/// triggered on its behalf.
	pub stale_ttl: Duration,
	/// Key under which the whole cache map is mirrored to the persistent
	/// store.
	pub cache_key: String,
	/// Whether server-sent-event streaming is attempted at all; `false`
	/// leaves keys on stale-TTL polling only.
	pub background_sync: bool,
	/// Whether to keep a streaming connection open for a key with no
	/// active subscriber.
	pub disable_idle_streams: bool,
	/// Polling interval substituted for streaming when
	/// `disable_idle_streams` is set, or when streaming cannot be
	/// established for a key.
	pub idle_stream_interval: Duration,
}
impl Default for CacheSettings {
	fn default() -> Self {
		Self {
			stale_ttl: DEFAULT_STALE_TTL,
			cache_key: DEFAULT_CACHE_KEY.to_string(),
			background_sync: true,
			disable_idle_streams: false,
			idle_stream_interval: DEFAULT_IDLE_STREAM_INTERVAL,
		}
	}
}
impl CacheSettings {
	/// Check that the settings form a coherent configuration.
	pub fn validate(&self) -> Result<()> {
		if self.stale_ttl.is_zero() {
			return Err(Error::Validation {
				field: "stale_ttl",
				reason: "must be greater than zero.".into(),
			});
		}
		if self.cache_key.trim().is_empty() {
			return Err(Error::Validation {
				field: "cache_key",
				reason: "must not be empty.".into(),
			});
		}
		if self.idle_stream_interval.is_zero() {
			return Err(Error::Validation {
				field: "idle_stream_interval",
				reason: "must be greater than zero.".into(),
			});
		}

		Ok(())
	}
}

/// Sparse set of overrides applied to an existing [`CacheSettings`] by
/// `configure_cache`; any field left `None` leaves the current value
/// untouched.
#[derive(Clone, Debug, Default)]
pub struct CacheSettingsPatch {
	/// Override for [`CacheSettings::stale_ttl`].
	pub stale_ttl: Option<Duration>,
	/// Override for [`CacheSettings::cache_key`].
	pub cache_key: Option<String>,
	/// Override for [`CacheSettings::background_sync`].
	pub background_sync: Option<bool>,
	/// Override for [`CacheSettings::disable_idle_streams`].
	pub disable_idle_streams: Option<bool>,
	/// Override for [`CacheSettings::idle_stream_interval`].
	pub idle_stream_interval: Option<Duration>,
}
impl CacheSettingsPatch {
	/// Apply this patch to `settings` in place, validating the result
	/// before committing it; on failure `settings` is left unchanged.
	pub fn apply(self, settings: &CacheSettings) -> Result<CacheSettings> {
		let mut next = settings.clone();

		if let Some(stale_ttl) = self.stale_ttl {
			next.stale_ttl = stale_ttl;
		}
		if let Some(cache_key) = self.cache_key {
			next.cache_key = cache_key;
		}
		if let Some(background_sync) = self.background_sync {
			next.background_sync = background_sync;
		}
		if let Some(disable_idle_streams) = self.disable_idle_streams {
			next.disable_idle_streams = disable_idle_streams;
		}
		if let Some(idle_stream_interval) = self.idle_stream_interval {
			next.idle_stream_interval = idle_stream_interval;
		}

		next.validate()?;

		Ok(next)
	}
}

/// Per-call overrides accepted by `refresh_features`.
#[derive(Clone, Debug)]
pub struct RefreshOptions {
	/// Force a remote fetch even if the cached payload is still fresh.
	pub skip_cache: bool,
	/// Whether a stale cached entry may be served immediately (with a
	/// background refresh kicked off on its behalf) instead of blocking on
	/// a fresh fetch. A fresh entry is always served regardless of this
	/// flag.
	pub allow_stale: bool,
	/// Whether a resolved payload should be delivered to `instance` via
	/// `set_features`/`set_experiments`; `false` resolves and returns the
	/// payload without mutating the instance.
	pub update_instance: bool,
	/// Flip the global background-sync latch for this and subsequent
	/// calls; `None` leaves it untouched.
	pub background_sync: Option<bool>,
	/// How long to wait for the refresh before giving up and returning
	/// whatever is cached (possibly nothing) instead.
	pub timeout: Option<Duration>,
}
impl Default for RefreshOptions {
	fn default() -> Self {
		Self { skip_cache: false, allow_stale: true, update_instance: true, background_sync: None, timeout: None }
	}
}
