//! Jittered exponential backoff for server-sent-event reconnection.
//!
//! The first three consecutive errors reconnect immediately — short blips
//! on an otherwise healthy connection shouldn't cost a delay. From the
//! fourth error onward the delay grows as `3^(errors - 3) * (1 + jitter)`
//! seconds, where `jitter` is up to a full second, capped at five minutes.

// crates.io
use rand::Rng;
// self
use crate::_prelude::*;

/// Number of consecutive errors tolerated before backoff kicks in.
const GRACE_ERRORS: u32 = 3;
/// Upper bound on any single computed delay.
const MAX_DELAY: Duration = Duration::from_secs(300);

/// Tracks consecutive stream errors for one key and computes the delay
/// before the next reconnect attempt.
#[derive(Debug, Default)]
pub struct ReconnectBackoff {
	errors: u32,
}
impl ReconnectBackoff {
	/// Start with a clean error count.
	pub fn new() -> Self {
		Self::default()
	}

	/// Record another error and return the delay to wait before retrying.
	pub fn record_error(&mut self) -> Duration {
		self.errors += 1;

		self.delay()
	}

	/// Clear the error count after a successful connection.
	pub fn reset(&mut self) {
		self.errors = 0;
	}

	fn delay(&self) -> Duration {
		if self.errors <= GRACE_ERRORS {
			return Duration::ZERO;
		}

		let exponent = self.errors - GRACE_ERRORS;
		let base_seconds = 3u64.saturating_pow(exponent);
		let jitter_millis = rand::rng().random_range(0..1000u64);
		let millis = base_seconds.saturating_mul(1000u64.saturating_add(jitter_millis));

		Duration::from_millis(millis).min(MAX_DELAY)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn first_three_errors_reconnect_immediately() {
		let mut backoff = ReconnectBackoff::new();

		for _ in 0..GRACE_ERRORS {
			assert_eq!(backoff.record_error(), Duration::ZERO);
		}
	}

	#[test]
	fn fourth_error_introduces_a_delay() {
		let mut backoff = ReconnectBackoff::new();

		for _ in 0..GRACE_ERRORS {
			backoff.record_error();
		}

		let delay = backoff.record_error();

		assert!(delay >= Duration::from_millis(3000));
		assert!(delay < Duration::from_millis(6000));
	}

	#[test]
	fn delay_is_capped() {
		let mut backoff = ReconnectBackoff::new();

		for _ in 0..30 {
			backoff.record_error();
		}

		assert!(backoff.delay() <= MAX_DELAY);
	}

	#[test]
	fn delay_is_capped_once_the_uncapped_floor_exceeds_max_delay() {
		let mut backoff = ReconnectBackoff::new();

		// At errors=9 (exponent=6), even the zero-jitter floor (3^6 * 1000ms
		// = 729s) exceeds MAX_DELAY, so the cap is exercised regardless of
		// jitter.
		for _ in 0..9 {
			backoff.record_error();
		}

		assert_eq!(backoff.delay(), MAX_DELAY);
	}

	#[test]
	fn reset_clears_the_error_count() {
		let mut backoff = ReconnectBackoff::new();

		for _ in 0..10 {
			backoff.record_error();
		}

		backoff.reset();

		assert_eq!(backoff.record_error(), Duration::ZERO);
	}
}
