//! A single cached payload for one [`RepositoryKey`](crate::RepositoryKey).

// crates.io
use serde_json::Value;
// self
use crate::_prelude::*;

/// One cached `{features, experiments}` pair, version-stamped by the
/// upstream `dateUpdated` field rather than by HTTP cache-control
/// semantics.
#[derive(Clone, Debug)]
pub struct CacheEntry {
	/// Raw `features` payload, as received.
	pub features: Value,
	/// Raw `experiments` payload, as received.
	pub experiments: Value,
	/// Upstream version stamp, used to detect a no-op refresh.
	pub date_updated: Option<String>,
	/// Whether the response that produced this entry advertised
	/// server-sent-event support.
	pub sse_supported: bool,
	/// Monotonic instant this entry was committed, used for staleness math
	/// immune to wall-clock adjustments.
	fetched_at: Instant,
	/// Wall-clock mirror of `fetched_at`, carried only so the entry can be
	/// persisted and rehydrated across restarts.
	fetched_at_wall: DateTime<Utc>,
	/// Monotonic instant after which this entry is considered stale.
	stale_at: Instant,
}
impl CacheEntry {
	/// Commit a freshly fetched payload, stale after `stale_ttl`.
	pub fn new(
		features: Value,
		experiments: Value,
		date_updated: Option<String>,
		sse_supported: bool,
		stale_ttl: Duration,
	) -> Self {
		let fetched_at = Instant::now();

		Self {
			features,
			experiments,
			date_updated,
			sse_supported,
			fetched_at,
			fetched_at_wall: Utc::now(),
			stale_at: fetched_at + stale_ttl,
		}
	}

	/// Whether this entry is old enough to warrant a background refresh.
	pub fn is_stale(&self) -> bool {
		Instant::now() >= self.stale_at
	}

	/// Instant this entry was fetched.
	pub fn fetched_at(&self) -> Instant {
		self.fetched_at
	}

	/// Wall-clock mirror of [`Self::fetched_at`], for persistence and
	/// logging.
	pub fn fetched_at_wall(&self) -> DateTime<Utc> {
		self.fetched_at_wall
	}

	/// Wall-clock mirror of the staleness deadline, for persistence.
	pub fn stale_at_wall(&self) -> DateTime<Utc> {
		let until_stale = self.stale_at.saturating_duration_since(self.fetched_at);

		self.fetched_at_wall + TimeDelta::from_std(until_stale).unwrap_or(TimeDelta::zero())
	}

	/// Push the staleness deadline out by `stale_ttl` from now, leaving the
	/// payload itself untouched; used when a refresh confirms the payload
	/// is unchanged (same `dateUpdated`) so only the deadline needs to
	/// move.
	pub fn renew(&mut self, stale_ttl: Duration) {
		self.stale_at = Instant::now() + stale_ttl;
	}

	/// Rebuild an entry from a persisted record, rebasing both its
	/// wall-clock `fetched_at_wall` and its absolute `stale_at` deadline
	/// onto a fresh monotonic anchor.
	///
	/// The persisted `stale_at_wall` is honored as-is rather than
	/// recomputed from the process's *current* `stale_ttl` setting, so a
	/// `configure_cache` call between persisting and restoring a snapshot
	/// never changes the staleness deadline of an already-persisted entry.
	pub fn rehydrate(
		features: Value,
		experiments: Value,
		date_updated: Option<String>,
		sse_supported: bool,
		fetched_at_wall: DateTime<Utc>,
		stale_at_wall: DateTime<Utc>,
	) -> Self {
		let now = Instant::now();
		let since_fetch = (Utc::now() - fetched_at_wall).to_std().unwrap_or(Duration::ZERO);
		let until_stale = (stale_at_wall - Utc::now()).to_std().unwrap_or(Duration::ZERO);

		Self {
			features,
			experiments,
			date_updated,
			sse_supported,
			fetched_at: now - since_fetch,
			fetched_at_wall,
			stale_at: now + until_stale,
		}
	}
}
