//! The capability surface a caller's SDK instance exposes to the
//! repository: enough to derive a cache key and to receive updated
//! payloads, nothing more.

// crates.io
use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;
// self
use crate::_prelude::*;

/// The API endpoints an instance resolves features/experiments against.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApiHosts {
	/// Base URL used for plain feature fetches.
	pub api_host: String,
	/// Path appended to `api_host` (then `/{clientKey}`) for a plain fetch.
	pub features_path: String,
	/// Base URL used for remote-eval fetches; falls back to `api_host` when
	/// not set separately.
	pub remote_eval_host: Option<String>,
	/// Path appended to the remote-eval host (then `/{clientKey}`) for a
	/// remote-eval fetch.
	pub remote_eval_path: String,
	/// Base URL used for the server-sent-event stream; falls back to
	/// `api_host` when not set separately, matching the upstream SDK's
	/// default.
	pub streaming_host: Option<String>,
	/// Path appended to the streaming host (then `/{clientKey}`) to open a
	/// subscription stream.
	pub streaming_path: String,
}
impl ApiHosts {
	/// Build a host pair with the upstream SDK's default path layout and no
	/// separate remote-eval or streaming hosts.
	pub fn new(api_host: impl Into<String>) -> Self {
		Self {
			api_host: api_host.into(),
			features_path: "/api/features".into(),
			remote_eval_host: None,
			remote_eval_path: "/api/eval".into(),
			streaming_host: None,
			streaming_path: "/sub".into(),
		}
	}

	/// Resolve the host that streaming connections should target.
	pub fn resolved_streaming_host(&self) -> &str {
		self.streaming_host.as_deref().unwrap_or(&self.api_host)
	}

	/// Resolve the host that remote-eval requests should target.
	pub fn resolved_remote_eval_host(&self) -> &str {
		self.remote_eval_host.as_deref().unwrap_or(&self.api_host)
	}
}

/// Opaque identity assigned to a subscribed instance, distinct from any
/// identity the instance itself carries.
///
/// The repository tracks subscribers by this id rather than by instance
/// identity so that two otherwise-identical instances (same key, same
/// client) never collide in the subscription set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct InstanceId(Uuid);
impl InstanceId {
	/// Generate a fresh, process-unique id.
	pub fn generate() -> Self {
		Self(Uuid::new_v4())
	}
}
impl std::fmt::Display for InstanceId {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		self.0.fmt(f)
	}
}

/// The fixed set of operations the repository needs from a caller's SDK
/// instance in order to key its cache and deliver updates.
///
/// Implementations are expected to be cheap to clone (typically an `Arc`
/// around shared state) since the repository holds one per subscription
/// for the lifetime of the subscription.
#[async_trait]
pub trait SdkInstance: Send + Sync + std::fmt::Debug {
	/// API hosts this instance resolves against.
	fn api_hosts(&self) -> ApiHosts;

	/// The client key identifying this instance's project/environment.
	fn client_key(&self) -> &str;

	/// The user id used for remote-eval key derivation, if the instance
	/// evaluates features server-side on a per-user basis.
	fn user_id(&self) -> Option<String> {
		None
	}

	/// Base64-encoded decryption key, if this instance's payloads arrive
	/// encrypted. `None` means payloads are plain JSON.
	fn decryption_key(&self) -> Option<String> {
		None
	}

	/// Whether this instance evaluates features server-side, against its
	/// current attributes, instead of fetching a plain feature definition
	/// payload.
	fn is_remote_eval(&self) -> bool {
		false
	}

	/// Targeting attributes sent as the request body for a remote-eval
	/// fetch. Ignored for a plain fetch.
	fn attributes(&self) -> Value {
		Value::Null
	}

	/// Extra headers to attach to every outgoing request (fetch and
	/// streaming) made on this instance's behalf.
	fn request_headers(&self) -> Vec<(String, String)> {
		Vec::new()
	}

	/// Deliver a freshly fetched or pushed `features` payload.
	async fn set_features(&self, features: Value) -> crate::Result<()>;

	/// Deliver a freshly fetched or pushed `experiments` payload.
	///
	/// Not every deployment uses server-side experiment evaluation; the
	/// default implementation discards the payload.
	async fn set_experiments(&self, _experiments: Value) -> crate::Result<()> {
		Ok(())
	}
}
