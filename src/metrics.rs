//! Optional Prometheus-compatible telemetry for repository activity.
//!
//! Disabled unless the crate is built with the `metrics` (and, for the
//! exporter itself, `prometheus`) feature — every public item here is
//! cfg-gated accordingly by [`crate::lib`]'s module declaration.

// std
use std::sync::{
	OnceLock,
	atomic::{AtomicU64, Ordering},
};
// crates.io
use metrics::Label;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use smallvec::SmallVec;
// self
use crate::_prelude::*;

type LabelSet = SmallVec<[Label; 2]>;

const METRIC_REQUESTS_TOTAL: &str = "feature_repo_requests_total";
const METRIC_HITS_TOTAL: &str = "feature_repo_hits_total";
const METRIC_STALE_TOTAL: &str = "feature_repo_stale_total";
const METRIC_MISSES_TOTAL: &str = "feature_repo_misses_total";
const METRIC_REFRESH_TOTAL: &str = "feature_repo_refresh_total";
const METRIC_REFRESH_DURATION: &str = "feature_repo_refresh_duration_seconds";
const METRIC_REFRESH_ERRORS: &str = "feature_repo_refresh_errors_total";
const METRIC_STREAM_RECONNECTS: &str = "feature_repo_stream_reconnects_total";

/// Shared Prometheus handle installed by [`install_default_exporter`].
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Thread-safe metrics accumulator for a single repository key.
#[derive(Debug, Default)]
pub struct RepositoryMetrics {
	total_requests: AtomicU64,
	cache_hits: AtomicU64,
	stale_serves: AtomicU64,
	refresh_successes: AtomicU64,
	refresh_errors: AtomicU64,
	stream_reconnects: AtomicU64,
	last_refresh_micros: AtomicU64,
}
impl RepositoryMetrics {
	/// Create a new metrics accumulator.
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	/// Record a hit outcome.
	pub fn record_hit(&self, stale: bool) {
		self.total_requests.fetch_add(1, Ordering::Relaxed);
		self.cache_hits.fetch_add(1, Ordering::Relaxed);

		if stale {
			self.stale_serves.fetch_add(1, Ordering::Relaxed);
		}
	}

	/// Record a miss outcome.
	pub fn record_miss(&self) {
		self.total_requests.fetch_add(1, Ordering::Relaxed);
	}

	/// Record a successful refresh and its latency.
	pub fn record_refresh_success(&self, duration: Duration) {
		self.refresh_successes.fetch_add(1, Ordering::Relaxed);
		self.last_refresh_micros.store(duration.as_micros() as u64, Ordering::Relaxed);
	}

	/// Record a refresh failure.
	pub fn record_refresh_error(&self) {
		self.refresh_errors.fetch_add(1, Ordering::Relaxed);
	}

	/// Record a streaming reconnect attempt.
	pub fn record_stream_reconnect(&self) {
		self.stream_reconnects.fetch_add(1, Ordering::Relaxed);
	}

	/// Take a point-in-time snapshot for status reporting.
	pub fn snapshot(&self) -> RepositoryMetricsSnapshot {
		RepositoryMetricsSnapshot {
			total_requests: self.total_requests.load(Ordering::Relaxed),
			cache_hits: self.cache_hits.load(Ordering::Relaxed),
			stale_serves: self.stale_serves.load(Ordering::Relaxed),
			refresh_successes: self.refresh_successes.load(Ordering::Relaxed),
			refresh_errors: self.refresh_errors.load(Ordering::Relaxed),
			stream_reconnects: self.stream_reconnects.load(Ordering::Relaxed),
			last_refresh_micros: match self.last_refresh_micros.load(Ordering::Relaxed) {
				0 => None,
				value => Some(value),
			},
		}
	}
}

/// Read-only snapshot of per-key telemetry counters.
#[derive(Clone, Debug)]
pub struct RepositoryMetricsSnapshot {
	/// Total number of resolve calls observed.
	pub total_requests: u64,
	/// Count of resolves served from the cache.
	pub cache_hits: u64,
	/// Count of resolves served from a stale payload.
	pub stale_serves: u64,
	/// Count of successful refresh operations.
	pub refresh_successes: u64,
	/// Count of refresh attempts that resulted in errors.
	pub refresh_errors: u64,
	/// Count of streaming reconnect attempts.
	pub stream_reconnects: u64,
	/// Microsecond latency of the most recent refresh.
	pub last_refresh_micros: Option<u64>,
}
impl RepositoryMetricsSnapshot {
	/// Convenience method to compute the cache hit rate.
	pub fn hit_rate(&self) -> f64 {
		if self.total_requests == 0 {
			0.0
		} else {
			self.cache_hits as f64 / self.total_requests as f64
		}
	}

	/// Ratio of stale serves over total requests.
	pub fn stale_ratio(&self) -> f64 {
		if self.total_requests == 0 {
			0.0
		} else {
			self.stale_serves as f64 / self.total_requests as f64
		}
	}
}

/// Install the default Prometheus recorder backed by `metrics`.
///
/// Multiple invocations are safe; subsequent calls become no-ops once the
/// recorder is installed.
pub fn install_default_exporter() -> Result<()> {
	if PROMETHEUS_HANDLE.get().is_some() {
		return Ok(());
	}

	let handle = PrometheusBuilder::new()
		.install_recorder()
		.map_err(|err| Error::Metrics(err.to_string()))?;
	let _ = PROMETHEUS_HANDLE.set(handle);

	Ok(())
}

/// Access the global Prometheus exporter handle when installed.
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
	PROMETHEUS_HANDLE.get()
}

/// Record a cache hit, tagging whether it was served stale.
pub fn record_resolve_hit(key: &str, stale: bool) {
	let labels = base_labels(key);

	metrics::counter!(METRIC_REQUESTS_TOTAL, labels.iter()).increment(1);
	metrics::counter!(METRIC_HITS_TOTAL, labels.iter()).increment(1);

	if stale {
		metrics::counter!(METRIC_STALE_TOTAL, labels.iter()).increment(1);
	}
}

/// Record a cache miss that required an upstream fetch.
pub fn record_resolve_miss(key: &str) {
	let labels = base_labels(key);

	metrics::counter!(METRIC_REQUESTS_TOTAL, labels.iter()).increment(1);
	metrics::counter!(METRIC_MISSES_TOTAL, labels.iter()).increment(1);
}

/// Record a successful refresh attempt along with its latency.
pub fn record_refresh_success(key: &str, duration: Duration) {
	metrics::counter!(METRIC_REFRESH_TOTAL, status_labels(key, "success").iter()).increment(1);
	metrics::histogram!(METRIC_REFRESH_DURATION, base_labels(key).iter()).record(duration.as_secs_f64());
}

/// Record a failed refresh attempt.
pub fn record_refresh_error(key: &str) {
	metrics::counter!(METRIC_REFRESH_TOTAL, status_labels(key, "error").iter()).increment(1);
	metrics::counter!(METRIC_REFRESH_ERRORS, base_labels(key).iter()).increment(1);
}

/// Record a streaming reconnect attempt for `key`.
pub fn record_stream_reconnect(key: &str) {
	metrics::counter!(METRIC_STREAM_RECONNECTS, base_labels(key).iter()).increment(1);
}

fn base_labels(key: &str) -> LabelSet {
	let mut labels = LabelSet::with_capacity(1);

	labels.push(Label::new("key", key.to_owned()));

	labels
}

fn status_labels(key: &str, status: &'static str) -> LabelSet {
	let mut labels = base_labels(key);

	labels.push(Label::new("status", status));

	labels
}
