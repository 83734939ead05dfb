//! Per-key server-sent-event connections: one background task per
//! subscribed key, reconnecting with jittered backoff until the key is
//! closed.

// std
use std::collections::HashMap;
// crates.io
use async_trait::async_trait;
use futures::StreamExt;
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::{instrument, warn};
// self
use crate::{
	_prelude::*,
	env::{Environment, OutgoingRequest, StreamEvent, headers_from_pairs},
	instance::ApiHosts,
	key::RepositoryKey,
	stream::backoff::ReconnectBackoff,
};

/// Receives stream events as they arrive, decoupling
/// [`StreamingEngine`] from the subscription registry that actually acts
/// on them.
#[async_trait]
pub trait StreamSink: Send + Sync + std::fmt::Debug {
	/// Handle one event observed for `key`.
	async fn handle_stream_event(&self, key: RepositoryKey, event: StreamEvent);
}

/// Owns the background reconnect loop for every key currently streaming.
pub struct StreamingEngine {
	environment: Arc<Environment>,
	sink: Arc<dyn StreamSink>,
	tasks: Mutex<HashMap<RepositoryKey, JoinHandle<()>>>,
}
impl std::fmt::Debug for StreamingEngine {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("StreamingEngine").finish_non_exhaustive()
	}
}
impl StreamingEngine {
	/// Build an engine that reports events to `sink`.
	pub fn new(environment: Arc<Environment>, sink: Arc<dyn StreamSink>) -> Self {
		Self { environment, sink, tasks: Mutex::new(HashMap::new()) }
	}

	/// Ensure a streaming connection is open for `key`; a no-op if one is
	/// already running. `headers` are attached to every connection attempt
	/// (and every reconnect), carrying the instance's own auth/targeting
	/// headers onto the stream.
	pub async fn ensure_open(
		&self,
		key: RepositoryKey,
		hosts: ApiHosts,
		client_key: String,
		headers: Vec<(String, String)>,
	) {
		let mut tasks = self.tasks.lock().await;

		if tasks.contains_key(&key) {
			return;
		}

		let environment = Arc::clone(&self.environment);
		let sink = Arc::clone(&self.sink);
		let task_key = key.clone();
		let handle = tokio::spawn(async move {
			run_reconnect_loop(environment, sink, task_key, hosts, client_key, headers).await
		});

		tasks.insert(key, handle);
	}

	/// Tear down the streaming connection for `key`, if any.
	pub async fn close(&self, key: &RepositoryKey) {
		if let Some(handle) = self.tasks.lock().await.remove(key) {
			handle.abort();
		}
	}

	/// Tear down every open streaming connection.
	pub async fn close_all(&self) {
		let mut tasks = self.tasks.lock().await;

		for (_, handle) in tasks.drain() {
			handle.abort();
		}
	}

	/// Whether a streaming connection is currently tracked for `key`.
	pub async fn is_open(&self, key: &RepositoryKey) -> bool {
		self.tasks.lock().await.contains_key(key)
	}
}

#[instrument(skip(environment, sink, hosts, headers), fields(key = %key))]
async fn run_reconnect_loop(
	environment: Arc<Environment>,
	sink: Arc<dyn StreamSink>,
	key: RepositoryKey,
	hosts: ApiHosts,
	client_key: String,
	headers: Vec<(String, String)>,
) {
	let mut backoff = ReconnectBackoff::new();

	loop {
		let Some(factory) = environment.event_source().await else {
			warn!("no event source factory configured, abandoning stream");

			return;
		};

		let url = format!(
			"{}{}/{client_key}",
			hosts.resolved_streaming_host().trim_end_matches('/'),
			hosts.streaming_path
		);
		let request = OutgoingRequest { headers: headers_from_pairs(&headers), ..OutgoingRequest::get(url) };
		let mut stream = match factory.open(request) {
			Ok(stream) => stream,
			Err(err) => {
				warn!(error = %err, "failed to open stream");

				#[cfg(feature = "metrics")]
				crate::metrics::record_stream_reconnect(key.as_str());

				tokio::time::sleep(backoff.record_error()).await;

				continue;
			},
		};

		while let Some(event) = stream.next().await {
			if matches!(event, StreamEvent::Open) {
				backoff.reset();
			}

			sink.handle_stream_event(key.clone(), event).await;
		}

		#[cfg(feature = "metrics")]
		crate::metrics::record_stream_reconnect(key.as_str());

		tokio::time::sleep(backoff.record_error()).await;
	}
}
