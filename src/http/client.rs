//! Builds and dispatches the plain and remote-eval feature requests,
//! never surfacing a transport failure — a failed fetch resolves to an
//! empty/unchanged outcome instead of an error, so a subscriber always
//! gets *something* back.

// crates.io
use serde::Deserialize;
use serde_json::Value;
use tracing::{instrument, warn};
// self
use crate::{
	_prelude::*,
	cache::{entry::CacheEntry, manager::FetchOutcome},
	env::{Environment, OutgoingRequest, headers_from_pairs},
	instance::ApiHosts,
};

/// Shape of the upstream features endpoint response.
///
/// `features`/`experiments` may arrive encrypted as a `ciphertext.nonce`
/// string instead of a structured value; callers distinguish the two by
/// checking the companion `encrypted_features`/`encrypted_experiments`
/// field. Unknown fields are ignored rather than rejected, so an upstream
/// addition to the payload never breaks an older client.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiResponse {
	#[serde(default)]
	features: Option<Value>,
	#[serde(default)]
	experiments: Option<Value>,
	#[serde(default)]
	encrypted_features: Option<String>,
	#[serde(default)]
	encrypted_experiments: Option<String>,
	#[serde(default)]
	date_updated: Option<String>,
}

/// A fetch result before it has been decrypted, if it needed to be.
pub struct RawFetchResult {
	/// Plain `features`, if the response was not encrypted.
	pub features: Option<Value>,
	/// Plain `experiments`, if the response was not encrypted.
	pub experiments: Option<Value>,
	/// Ciphertext for `features`, if the response was encrypted.
	pub encrypted_features: Option<String>,
	/// Ciphertext for `experiments`, if the response was encrypted.
	pub encrypted_experiments: Option<String>,
	/// Upstream version stamp.
	pub date_updated: Option<String>,
	/// Whether the response advertised server-sent-event support.
	pub sse_supported: bool,
	/// Whether a usable response was actually received.
	pub succeeded: bool,
}

/// Build the endpoint URL, method, body and headers for a fetch against
/// `hosts`.
///
/// `remote_eval` switches the request to a `POST` against the remote-eval
/// host carrying the instance's current `attributes` as the body; otherwise
/// a plain `GET` against the features host is used. `headers` are attached
/// to either branch, letting an instance carry its own auth/targeting
/// headers on every fetch.
fn build_request(
	hosts: &ApiHosts,
	client_key: &str,
	remote_eval: bool,
	attributes: &Value,
	headers: &[(String, String)],
) -> OutgoingRequest {
	if remote_eval {
		OutgoingRequest {
			method: reqwest::Method::POST,
			url: format!(
				"{}{}/{client_key}",
				hosts.resolved_remote_eval_host().trim_end_matches('/'),
				hosts.remote_eval_path
			),
			headers: headers_from_pairs(headers),
			body: Some(serde_json::json!({ "attributes": attributes })),
		}
	} else {
		OutgoingRequest {
			headers: headers_from_pairs(headers),
			..OutgoingRequest::get(format!(
				"{}{}/{client_key}",
				hosts.api_host.trim_end_matches('/'),
				hosts.features_path
			))
		}
	}
}

/// Fetch the current payload for `client_key`, never returning an error: a
/// transport failure, a non-success status, or malformed JSON all degrade
/// to `succeeded: false` with every field empty.
#[instrument(skip(environment, attributes), fields(api_host = %hosts.api_host))]
pub async fn fetch(
	environment: &Environment,
	hosts: &ApiHosts,
	client_key: &str,
	remote_eval: bool,
	attributes: &Value,
	headers: &[(String, String)],
) -> RawFetchResult {
	let failure = RawFetchResult {
		features: None,
		experiments: None,
		encrypted_features: None,
		encrypted_experiments: None,
		date_updated: None,
		sse_supported: false,
		succeeded: false,
	};

	let Some(fetcher) = environment.fetch().await else {
		warn!("no fetcher configured, treating as a failed fetch");

		return failure;
	};

	let request = build_request(hosts, client_key, remote_eval, attributes, headers);
	let response = match fetcher.fetch(request).await {
		Ok(response) => response,
		Err(err) => {
			warn!(error = %err, "feature fetch failed");

			return failure;
		},
	};

	if !(200..300).contains(&response.status) {
		warn!(status = response.status, "feature fetch returned a non-success status");

		return failure;
	}

	RawFetchResult::from_body(&response.body, response.supports_sse())
}

impl RawFetchResult {
	/// Parse a raw JSON body (from a fetch response or a streamed event)
	/// into a result, degrading to a failed result on malformed JSON
	/// rather than propagating a parse error.
	pub fn from_body(body: &[u8], sse_supported: bool) -> Self {
		let failure = RawFetchResult {
			features: None,
			experiments: None,
			encrypted_features: None,
			encrypted_experiments: None,
			date_updated: None,
			sse_supported,
			succeeded: false,
		};

		let parsed: ApiResponse = match serde_json::from_slice(body) {
			Ok(parsed) => parsed,
			Err(err) => {
				warn!(error = %err, "feature payload was unparseable JSON");

				return failure;
			},
		};

		RawFetchResult {
			features: parsed.features,
			experiments: parsed.experiments,
			encrypted_features: parsed.encrypted_features,
			encrypted_experiments: parsed.encrypted_experiments,
			date_updated: parsed.date_updated,
			sse_supported,
			succeeded: true,
		}
	}
}

/// Decrypt (if needed) and normalize a [`RawFetchResult`] into a
/// [`FetchOutcome`], falling back to `previous`'s payload whenever a field
/// is missing, undecryptable, or the whole fetch failed.
pub async fn resolve_outcome(
	raw: RawFetchResult,
	decryption_key: Option<&str>,
	environment: &Environment,
	previous: Option<&CacheEntry>,
) -> FetchOutcome {
	let fallback_features = previous.map(|entry| entry.features.clone()).unwrap_or(Value::Null);
	let fallback_experiments = previous.map(|entry| entry.experiments.clone()).unwrap_or(Value::Null);
	let fallback_date_updated = previous.and_then(|entry| entry.date_updated.clone());

	if !raw.succeeded {
		return FetchOutcome {
			features: fallback_features,
			experiments: fallback_experiments,
			date_updated: fallback_date_updated,
			sse_supported: previous.map(|entry| entry.sse_supported).unwrap_or(false),
			changed: false,
			succeeded: false,
		};
	}

	let features = decrypt_field(raw.features, raw.encrypted_features, decryption_key, environment)
		.await
		.unwrap_or_else(|| fallback_features.clone());
	let experiments =
		decrypt_field(raw.experiments, raw.encrypted_experiments, decryption_key, environment)
			.await
			.unwrap_or_else(|| fallback_experiments.clone());
	let changed = raw.date_updated != fallback_date_updated
		|| features != fallback_features
		|| experiments != fallback_experiments;

	FetchOutcome {
		features,
		experiments,
		date_updated: raw.date_updated.or(fallback_date_updated),
		sse_supported: raw.sse_supported,
		changed,
		succeeded: true,
	}
}

async fn decrypt_field(
	plain: Option<Value>,
	ciphertext: Option<String>,
	decryption_key: Option<&str>,
	environment: &Environment,
) -> Option<Value> {
	if let Some(plain) = plain {
		return Some(plain);
	}

	let ciphertext = ciphertext?;
	let decryption_key = decryption_key?;
	let decryptor = environment.decryptor().await?;

	match decryptor.decrypt(&ciphertext, decryption_key) {
		Ok(value) => Some(value),
		Err(err) => {
			warn!(error = %err, "failed to decrypt payload field");

			None
		},
	}
}
