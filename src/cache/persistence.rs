//! Write-through mirror of the in-memory cache map into an optional
//! [`PersistentStore`](crate::env::PersistentStore).

// crates.io
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
// self
use crate::{_prelude::*, cache::entry::CacheEntry, key::RepositoryKey};

/// On-disk shape of one cache entry; deliberately flat so a hand-written
/// record from another process (or a migrated deployment) round-trips.
#[derive(Serialize, Deserialize)]
struct PersistedEntry {
	features: serde_json::Value,
	experiments: serde_json::Value,
	date_updated: Option<String>,
	sse_supported: bool,
	fetched_at: DateTime<Utc>,
	stale_at: DateTime<Utc>,
}

/// Serialize the whole cache map to a single JSON string suitable for
/// `PersistentStore::set_item`.
pub fn serialize_snapshot(cache: &IndexMap<RepositoryKey, CacheEntry>) -> Result<String> {
	let records: Vec<(String, PersistedEntry)> = cache
		.iter()
		.map(|(key, entry)| {
			(
				key.as_str().to_string(),
				PersistedEntry {
					features: entry.features.clone(),
					experiments: entry.experiments.clone(),
					date_updated: entry.date_updated.clone(),
					sse_supported: entry.sse_supported,
					fetched_at: entry.fetched_at_wall(),
					stale_at: entry.stale_at_wall(),
				},
			)
		})
		.collect();

	Ok(serde_json::to_string(&records)?)
}

/// Parse a snapshot produced by [`serialize_snapshot`] back into cache
/// entries, rebased onto the current process's monotonic clock but keeping
/// each entry's persisted `stale_at` deadline exactly as recorded —
/// independent of whatever `stale_ttl` is currently configured.
///
/// A malformed individual record is skipped rather than failing the whole
/// hydration; a corrupt persisted blob should degrade to a cold cache, not
/// an unusable one.
pub fn deserialize_snapshot(raw: &str) -> Result<IndexMap<RepositoryKey, CacheEntry>> {
	let records: Vec<(String, PersistedEntry)> = serde_json::from_str(raw)?;
	let mut cache = IndexMap::with_capacity(records.len());

	for (key, record) in records {
		let entry = CacheEntry::rehydrate(
			record.features,
			record.experiments,
			record.date_updated,
			record.sse_supported,
			record.fetched_at,
			record.stale_at,
		);

		cache.insert(RepositoryKey::from(key), entry);
	}

	Ok(cache)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn snapshot_round_trips() {
		let mut cache = IndexMap::new();

		cache.insert(
			RepositoryKey::plain("https://cdn.example.com", "sdk-abc"),
			CacheEntry::new(
				serde_json::json!({"flag": true}),
				serde_json::json!({}),
				Some("v1".into()),
				true,
				Duration::from_secs(60),
			),
		);

		let raw = serialize_snapshot(&cache).expect("serialize");
		let restored = deserialize_snapshot(&raw).expect("deserialize");
		let entry = restored
			.get(&RepositoryKey::plain("https://cdn.example.com", "sdk-abc"))
			.expect("entry present");

		assert_eq!(entry.features["flag"], true);
		assert_eq!(entry.date_updated.as_deref(), Some("v1"));
		assert!(!entry.is_stale());
	}

	#[test]
	fn stale_persisted_entry_rehydrates_already_stale() {
		let mut cache = IndexMap::new();

		cache.insert(
			RepositoryKey::plain("host", "key"),
			CacheEntry::new(serde_json::json!({}), serde_json::json!({}), None, false, Duration::ZERO),
		);

		let raw = serialize_snapshot(&cache).expect("serialize");
		let restored = deserialize_snapshot(&raw).expect("deserialize");
		let entry = restored.get(&RepositoryKey::plain("host", "key")).expect("entry present");

		assert!(entry.is_stale());
	}

	#[test]
	fn stale_at_survives_a_changed_stale_ttl_between_persist_and_restore() {
		let mut cache = IndexMap::new();

		cache.insert(
			RepositoryKey::plain("host", "key"),
			CacheEntry::new(
				serde_json::json!({}),
				serde_json::json!({}),
				Some("v1".into()),
				false,
				Duration::from_secs(60),
			),
		);

		let raw = serialize_snapshot(&cache).expect("serialize");

		// A much shorter stale_ttl is now configured, but it must not affect
		// an already-persisted entry's deadline.
		let restored = deserialize_snapshot(&raw).expect("deserialize");
		let entry = restored.get(&RepositoryKey::plain("host", "key")).expect("entry present");

		assert!(!entry.is_stale());
	}
}
