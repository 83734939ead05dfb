//! Repository key derivation.

// self
use crate::_prelude::*;

/// Separator joining the components of a [`RepositoryKey`].
///
/// Matches the reserved separator used by the upstream SDK so that keys
/// derived here are stable across restarts and persisted snapshots.
const SEPARATOR: &str = "||";

/// Opaque identity naming a feature source from the viewpoint of an SDK
/// instance.
///
/// Two instances that produce the same key are interchangeable consumers
/// for caching and streaming purposes; the repository never distinguishes
/// them except by their place in the subscription set.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RepositoryKey(Arc<str>);
impl RepositoryKey {
	/// Build a key from the plain `apiHost || clientKey` pair.
	pub fn plain(api_host: &str, client_key: &str) -> Self {
		Self(Arc::from(format!("{api_host}{SEPARATOR}{client_key}")))
	}

	/// Build a key from `apiHost || clientKey || userId`, used when the
	/// instance evaluates features remotely.
	pub fn remote_eval(api_host: &str, client_key: &str, user_id: &str) -> Self {
		Self(Arc::from(format!("{api_host}{SEPARATOR}{client_key}{SEPARATOR}{user_id}")))
	}

	/// Borrow the key as a plain string, e.g. for persistence or logging.
	pub fn as_str(&self) -> &str {
		&self.0
	}
}
impl std::fmt::Display for RepositoryKey {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(&self.0)
	}
}
impl From<String> for RepositoryKey {
	fn from(value: String) -> Self {
		Self(Arc::from(value))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn plain_key_joins_host_and_client_key() {
		let key = RepositoryKey::plain("https://cdn.example.com", "sdk-abc");

		assert_eq!(key.as_str(), "https://cdn.example.com||sdk-abc");
	}

	#[test]
	fn remote_eval_key_includes_user_id() {
		let key = RepositoryKey::remote_eval("https://cdn.example.com", "sdk-abc", "user-1");

		assert_eq!(key.as_str(), "https://cdn.example.com||sdk-abc||user-1");
	}

	#[test]
	fn equal_components_produce_equal_keys() {
		let a = RepositoryKey::plain("host", "key");
		let b = RepositoryKey::plain("host", "key");

		assert_eq!(a, b);
	}
}
