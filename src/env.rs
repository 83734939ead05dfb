//! Environment shims: pluggable references to the HTTP client, the
//! server-sent-event source, the persistent key-value store, and the
//! decryption primitive.
//!
//! Every shim is a trait object behind an `Arc`, mirroring how the rest of
//! the crate treats its collaborators as replaceable capabilities rather
//! than concrete types. Defaults are resolved once, at
//! [`Environment::default`] time, from whatever is available in this
//! process; a missing default yields an absent reference, never a panic.

// std
use std::collections::HashMap;
// crates.io
use aes_gcm::{
	Aes256Gcm, Nonce,
	aead::{Aead, KeyInit},
};
use async_trait::async_trait;
use base64::{Engine, prelude::BASE64_STANDARD};
use futures::stream::BoxStream;
#[cfg(feature = "redis")] use redis::AsyncCommands;
use reqwest::{
	Client, Method,
	header::{HeaderMap, HeaderName, HeaderValue},
};
use reqwest_eventsource::{Event as SseEvent, EventSource};
use serde_json::Value;
use tokio::sync::RwLock;
// self
use crate::{Error, Result, _prelude::*};

/// An HTTP request the repository wants dispatched, independent of the
/// transport that eventually sends it.
#[derive(Clone, Debug)]
pub struct OutgoingRequest {
	/// HTTP method, e.g. `GET` or `POST`.
	pub method: Method,
	/// Fully qualified target URL.
	pub url: String,
	/// Request headers supplied by the caller.
	pub headers: HeaderMap,
	/// Optional JSON body, sent for remote-eval requests.
	pub body: Option<Value>,
}
impl OutgoingRequest {
	/// Build a bare `GET` request with no headers or body.
	pub fn get(url: impl Into<String>) -> Self {
		Self { method: Method::GET, url: url.into(), headers: HeaderMap::new(), body: None }
	}
}

/// Raw response metadata returned from a [`Fetcher`].
#[derive(Clone, Debug)]
pub struct RawResponse {
	/// HTTP status code of the response.
	pub status: u16,
	/// Response headers, used to detect `x-sse-support`.
	pub headers: HeaderMap,
	/// Raw response body bytes.
	pub body: Vec<u8>,
}
impl RawResponse {
	/// Whether the response advertises server-sent-event support.
	pub fn supports_sse(&self) -> bool {
		self.headers
			.get("x-sse-support")
			.and_then(|value| value.to_str().ok())
			.map(|value| value.eq_ignore_ascii_case("enabled"))
			.unwrap_or(false)
	}
}

/// Dispatches a single HTTP request and returns its raw response.
///
/// Implementations must never perform retries internally; the
/// fetch-never-rejects convention and any retry policy live above this
/// trait, in `crate::http::client`.
#[async_trait]
pub trait Fetcher: Send + Sync + std::fmt::Debug {
	/// Issue the request and return its raw response, or an error if the
	/// transport itself failed (connection refused, TLS failure, timeout).
	async fn fetch(&self, request: OutgoingRequest) -> Result<RawResponse>;
}

/// Opens a server-sent-event stream for a request.
pub trait EventSourceFactory: Send + Sync + std::fmt::Debug {
	/// Open the stream, optionally retrying without headers if the
	/// transport rejects the header set outright.
	fn open(&self, request: OutgoingRequest) -> Result<BoxStream<'static, StreamEvent>>;
}

/// A single event observed on an open server-sent-event stream.
#[derive(Clone, Debug)]
pub enum StreamEvent {
	/// The stream transitioned to the open state.
	Open,
	/// A named message event arrived (event name, optional data).
	Message { event: String, data: String },
	/// The underlying transport reported an error or closed.
	Error(String),
}

/// Reads and writes a single opaque string record, keyed by name.
#[async_trait]
pub trait PersistentStore: Send + Sync + std::fmt::Debug {
	/// Read the current value for `key`, if any.
	async fn get_item(&self, key: &str) -> Result<Option<String>>;
	/// Overwrite the value for `key`.
	async fn set_item(&self, key: &str, value: String) -> Result<()>;
}

/// Decrypts an encrypted features/experiments payload.
pub trait Decryptor: Send + Sync + std::fmt::Debug {
	/// Decrypt `ciphertext` using `key` and parse the result as JSON.
	fn decrypt(&self, ciphertext: &str, key: &str) -> Result<Value>;
}

/// Default [`Fetcher`] backed by a shared `reqwest::Client`.
#[derive(Clone, Debug)]
pub struct ReqwestFetcher {
	client: Client,
}
impl ReqwestFetcher {
	/// Build a fetcher around a freshly constructed client.
	pub fn new() -> Result<Self> {
		let client = Client::builder()
			.user_agent(format!("feature-repo-cache/{}", env!("CARGO_PKG_VERSION")))
			.connect_timeout(Duration::from_secs(5))
			.build()?;

		Ok(Self { client })
	}

	/// Build a fetcher around a caller-supplied client (primarily for tests).
	pub fn with_client(client: Client) -> Self {
		Self { client }
	}
}
#[async_trait]
impl Fetcher for ReqwestFetcher {
	async fn fetch(&self, request: OutgoingRequest) -> Result<RawResponse> {
		let mut builder = self.client.request(request.method, &request.url);

		builder = builder.headers(request.headers);

		if let Some(body) = &request.body {
			builder = builder.json(body);
		}

		let response = builder.send().await?;
		let status = response.status().as_u16();
		let headers = response.headers().clone();
		let body = response.bytes().await?.to_vec();

		Ok(RawResponse { status, headers, body })
	}
}

/// Default [`EventSourceFactory`] backed by `reqwest-eventsource`.
#[derive(Clone, Debug)]
pub struct SseEventSourceFactory {
	client: Client,
}
impl SseEventSourceFactory {
	/// Build a factory around a freshly constructed client.
	pub fn new() -> Result<Self> {
		let client = Client::builder()
			.user_agent(format!("feature-repo-cache/{}", env!("CARGO_PKG_VERSION")))
			.build()?;

		Ok(Self { client })
	}

	/// Build a factory around a caller-supplied client.
	pub fn with_client(client: Client) -> Self {
		Self { client }
	}
}
impl EventSourceFactory for SseEventSourceFactory {
	fn open(&self, request: OutgoingRequest) -> Result<BoxStream<'static, StreamEvent>> {
		use futures::StreamExt;

		let mut builder = self.client.request(request.method.clone(), &request.url);

		builder = builder.headers(request.headers.clone());

		let source = EventSource::new(builder)
			.map_err(|err| Error::Stream(format!("failed to open event source: {err}")))?;
		let stream = source.map(|event| match event {
			Ok(SseEvent::Open) => StreamEvent::Open,
			Ok(SseEvent::Message(message)) =>
				StreamEvent::Message { event: message.event, data: message.data },
			Err(err) => StreamEvent::Error(err.to_string()),
		});

		Ok(Box::pin(stream))
	}
}

/// In-process [`PersistentStore`] used when no external store is configured.
///
/// Gives the repository a working persistence mirror without requiring an
/// external dependency; state is lost on process restart, same as having
/// no store configured at all, but round-trips correctly within a process.
#[derive(Clone, Debug, Default)]
pub struct InMemoryStore {
	records: Arc<RwLock<HashMap<String, String>>>,
}
impl InMemoryStore {
	/// Construct an empty store.
	pub fn new() -> Self {
		Self::default()
	}
}
#[async_trait]
impl PersistentStore for InMemoryStore {
	async fn get_item(&self, key: &str) -> Result<Option<String>> {
		Ok(self.records.read().await.get(key).cloned())
	}

	async fn set_item(&self, key: &str, value: String) -> Result<()> {
		self.records.write().await.insert(key.to_string(), value);

		Ok(())
	}
}

#[cfg(feature = "redis")]
/// [`PersistentStore`] backed by Redis, for sharing the cache mirror across
/// processes.
#[derive(Clone, Debug)]
pub struct RedisStore {
	client: redis::Client,
}
#[cfg(feature = "redis")]
impl RedisStore {
	/// Build a store around a Redis client.
	pub fn new(client: redis::Client) -> Self {
		Self { client }
	}
}
#[cfg(feature = "redis")]
#[async_trait]
impl PersistentStore for RedisStore {
	async fn get_item(&self, key: &str) -> Result<Option<String>> {
		let mut conn = self.client.get_multiplexed_async_connection().await?;
		let value: Option<String> = conn.get(key).await?;

		Ok(value)
	}

	async fn set_item(&self, key: &str, value: String) -> Result<()> {
		let mut conn = self.client.get_multiplexed_async_connection().await?;

		conn.set::<_, _, ()>(key, value).await?;

		Ok(())
	}
}

/// Default [`Decryptor`] using AES-256-GCM.
///
/// Ciphertext is expected in `base64(nonce).base64(ciphertext)` form; `key`
/// is a base64-encoded 32-byte AES key.
#[derive(Clone, Debug, Default)]
pub struct AesGcmDecryptor;
impl Decryptor for AesGcmDecryptor {
	fn decrypt(&self, ciphertext: &str, key: &str) -> Result<Value> {
		let (nonce_b64, data_b64) = ciphertext
			.split_once('.')
			.ok_or_else(|| Error::Decrypt("ciphertext must be `nonce.data`.".into()))?;
		let nonce_bytes = BASE64_STANDARD
			.decode(nonce_b64)
			.map_err(|err| Error::Decrypt(format!("invalid nonce encoding: {err}")))?;
		let data_bytes = BASE64_STANDARD
			.decode(data_b64)
			.map_err(|err| Error::Decrypt(format!("invalid ciphertext encoding: {err}")))?;
		let key_bytes = BASE64_STANDARD
			.decode(key)
			.map_err(|err| Error::Decrypt(format!("invalid key encoding: {err}")))?;

		if key_bytes.len() != 32 {
			return Err(Error::Decrypt("key must decode to 32 bytes (AES-256).".into()));
		}

		let cipher = Aes256Gcm::new_from_slice(&key_bytes)
			.map_err(|err| Error::Decrypt(format!("invalid key material: {err}")))?;
		let nonce = Nonce::from_slice(&nonce_bytes);
		let plaintext = cipher
			.decrypt(nonce, data_bytes.as_ref())
			.map_err(|err| Error::Decrypt(format!("decryption failed: {err}")))?;
		let value = serde_json::from_slice(&plaintext)?;

		Ok(value)
	}
}

/// Partial override set accepted by `set_polyfills`; any field left `None`
/// leaves the corresponding shim untouched.
#[derive(Default)]
pub struct Polyfills {
	/// Replacement HTTP fetcher.
	pub fetch: Option<Arc<dyn Fetcher>>,
	/// Replacement event-source factory.
	pub event_source: Option<Arc<dyn EventSourceFactory>>,
	/// Replacement persistent store.
	pub persistent_store: Option<Arc<dyn PersistentStore>>,
	/// Replacement decryptor.
	pub decryptor: Option<Arc<dyn Decryptor>>,
}

/// Holds the current set of environment shims, read fresh on every access
/// so that a late `set_polyfills` call affects in-flight operations.
#[derive(Debug)]
pub struct Environment {
	inner: RwLock<EnvironmentState>,
}
struct EnvironmentState {
	fetch: Option<Arc<dyn Fetcher>>,
	event_source: Option<Arc<dyn EventSourceFactory>>,
	persistent_store: Option<Arc<dyn PersistentStore>>,
	decryptor: Option<Arc<dyn Decryptor>>,
}
impl std::fmt::Debug for EnvironmentState {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("EnvironmentState")
			.field("fetch", &self.fetch.is_some())
			.field("event_source", &self.event_source.is_some())
			.field("persistent_store", &self.persistent_store.is_some())
			.field("decryptor", &self.decryptor.is_some())
			.finish()
	}
}
impl Environment {
	/// Build the default environment: a `reqwest`-backed fetcher and SSE
	/// factory, an AES-GCM decryptor, and no persistent store.
	///
	/// Reading the persistent store default never happens eagerly here —
	/// there is none until the caller configures one — so there is nothing
	/// to swallow a failure from, unlike a browser's `localStorage` probe.
	pub fn new() -> Result<Self> {
		let fetch: Arc<dyn Fetcher> = Arc::new(ReqwestFetcher::new()?);
		let event_source: Arc<dyn EventSourceFactory> = Arc::new(SseEventSourceFactory::new()?);
		let decryptor: Arc<dyn Decryptor> = Arc::new(AesGcmDecryptor);

		Ok(Self {
			inner: RwLock::new(EnvironmentState {
				fetch: Some(fetch),
				event_source: Some(event_source),
				persistent_store: None,
				decryptor: Some(decryptor),
			}),
		})
	}

	/// Merge a partial override set into the current shims.
	pub async fn set_polyfills(&self, overrides: Polyfills) {
		let mut state = self.inner.write().await;

		if let Some(fetch) = overrides.fetch {
			state.fetch = Some(fetch);
		}
		if let Some(event_source) = overrides.event_source {
			state.event_source = Some(event_source);
		}
		if let Some(persistent_store) = overrides.persistent_store {
			state.persistent_store = Some(persistent_store);
		}
		if let Some(decryptor) = overrides.decryptor {
			state.decryptor = Some(decryptor);
		}
	}

	/// Current fetcher, read at call time.
	pub async fn fetch(&self) -> Option<Arc<dyn Fetcher>> {
		self.inner.read().await.fetch.clone()
	}

	/// Current event-source factory, read at call time.
	pub async fn event_source(&self) -> Option<Arc<dyn EventSourceFactory>> {
		self.inner.read().await.event_source.clone()
	}

	/// Current persistent store, read at call time.
	pub async fn persistent_store(&self) -> Option<Arc<dyn PersistentStore>> {
		self.inner.read().await.persistent_store.clone()
	}

	/// Current decryptor, read at call time.
	pub async fn decryptor(&self) -> Option<Arc<dyn Decryptor>> {
		self.inner.read().await.decryptor.clone()
	}
}

/// Build an empty header map from a plain `key -> value` list, skipping
/// entries that fail to parse rather than rejecting the whole request.
pub fn headers_from_pairs(pairs: &[(String, String)]) -> HeaderMap {
	let mut headers = HeaderMap::new();

	for (name, value) in pairs {
		if let (Ok(name), Ok(value)) =
			(HeaderName::try_from(name.as_str()), HeaderValue::from_str(value))
		{
			headers.insert(name, value);
		}
	}

	headers
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn supports_sse_reads_header_case_insensitively() {
		let mut headers = HeaderMap::new();

		headers.insert("x-sse-support", HeaderValue::from_static("Enabled"));

		let response = RawResponse { status: 200, headers, body: Vec::new() };

		assert!(response.supports_sse());
	}

	#[test]
	fn aes_gcm_round_trip() {
		use aes_gcm::aead::OsRng;

		let cipher_key = Aes256Gcm::generate_key(OsRng);
		let cipher = Aes256Gcm::new(&cipher_key);
		let nonce = Aes256Gcm::generate_nonce(OsRng);
		let plaintext = br#"{"hello":"world"}"#;
		let ciphertext = cipher.encrypt(&nonce, plaintext.as_ref()).expect("encrypt");
		let payload = format!(
			"{}.{}",
			BASE64_STANDARD.encode(nonce),
			BASE64_STANDARD.encode(ciphertext)
		);
		let key_b64 = BASE64_STANDARD.encode(cipher_key);
		let decryptor = AesGcmDecryptor;
		let value = decryptor.decrypt(&payload, &key_b64).expect("decrypt");

		assert_eq!(value["hello"], "world");
	}
}
