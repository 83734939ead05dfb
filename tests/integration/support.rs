//! Shared `SdkInstance` test double used across the integration scenarios.

// crates.io
use async_trait::async_trait;
use feature_repo_cache::{ApiHosts, Result, SdkInstance};
use serde_json::Value;
use tokio::sync::Mutex;

/// Records every payload handed to it instead of acting on it, so tests can
/// assert on what the repository delivered.
#[derive(Debug)]
pub struct RecordingInstance {
	hosts: ApiHosts,
	client_key: String,
	user_id: Option<String>,
	decryption_key: Option<String>,
	features: Mutex<Vec<Value>>,
	experiments: Mutex<Vec<Value>>,
}
impl RecordingInstance {
	pub fn new(api_host: impl Into<String>, client_key: impl Into<String>) -> Self {
		Self {
			hosts: ApiHosts::new(api_host),
			client_key: client_key.into(),
			user_id: None,
			decryption_key: None,
			features: Mutex::new(Vec::new()),
			experiments: Mutex::new(Vec::new()),
		}
	}

	pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
		self.user_id = Some(user_id.into());
		self
	}

	pub fn with_decryption_key(mut self, decryption_key: impl Into<String>) -> Self {
		self.decryption_key = Some(decryption_key.into());
		self
	}

	pub async fn delivery_count(&self) -> usize {
		self.features.lock().await.len()
	}

	pub async fn last_features(&self) -> Option<Value> {
		self.features.lock().await.last().cloned()
	}
}
#[async_trait]
impl SdkInstance for RecordingInstance {
	fn api_hosts(&self) -> ApiHosts {
		self.hosts.clone()
	}

	fn client_key(&self) -> &str {
		&self.client_key
	}

	fn user_id(&self) -> Option<String> {
		self.user_id.clone()
	}

	fn decryption_key(&self) -> Option<String> {
		self.decryption_key.clone()
	}

	async fn set_features(&self, features: Value) -> Result<()> {
		self.features.lock().await.push(features);

		Ok(())
	}

	async fn set_experiments(&self, experiments: Value) -> Result<()> {
		self.experiments.lock().await.push(experiments);

		Ok(())
	}
}
