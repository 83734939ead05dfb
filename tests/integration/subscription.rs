//! Subscription registry behaviour: coalesced concurrent subscribes,
//! unsubscribe bookkeeping, and multi-key status reporting.

// std
use std::sync::Arc;
// crates.io
use feature_repo_cache::{RefreshOptions, Repository, RepositoryKey, SdkInstance};
use wiremock::{
	Mock, MockServer, ResponseTemplate,
	matchers::{method, path},
};

use crate::support::RecordingInstance;

fn features_body(date_updated: &str) -> serde_json::Value {
	serde_json::json!({
		"features": { "myFeature": { "defaultValue": true } },
		"experiments": {},
		"dateUpdated": date_updated,
	})
}

#[tokio::test]
async fn two_instances_on_the_same_key_coalesce_into_one_fetch() {
	let server = MockServer::start().await;

	Mock::given(method("GET"))
		.and(path("/api/features/sdk-abc"))
		.respond_with(ResponseTemplate::new(200).set_body_json(features_body("v1")))
		.expect(1)
		.mount(&server)
		.await;

	let repository = Repository::builder().build().expect("build");
	let first = Arc::new(RecordingInstance::new(server.uri(), "sdk-abc"));
	let second = Arc::new(RecordingInstance::new(server.uri(), "sdk-abc"));
	let dyn_first = Arc::clone(&first) as Arc<dyn SdkInstance>;
	let dyn_second = Arc::clone(&second) as Arc<dyn SdkInstance>;

	tokio::join!(repository.subscribe(Arc::clone(&dyn_first)), repository.subscribe(Arc::clone(&dyn_second)),);

	let (a, b) = tokio::join!(
		repository.refresh_features(&dyn_first, RefreshOptions::default()),
		repository.refresh_features(&dyn_second, RefreshOptions::default()),
	);
	a.expect("refresh");
	b.expect("refresh");

	let key = RepositoryKey::plain(&server.uri(), "sdk-abc");
	let status = repository.status(&key).await.expect("status present");

	assert_eq!(status.subscriber_count, 2);

	server.verify().await;
}

#[tokio::test]
async fn unsubscribe_clears_the_key_once_the_last_subscriber_leaves() {
	let server = MockServer::start().await;

	Mock::given(method("GET"))
		.and(path("/api/features/sdk-abc"))
		.respond_with(ResponseTemplate::new(200).set_body_json(features_body("v1")))
		.mount(&server)
		.await;

	let repository = Repository::builder().build().expect("build");
	let instance = Arc::new(RecordingInstance::new(server.uri(), "sdk-abc"));
	let id = repository.subscribe(Arc::clone(&instance) as Arc<dyn SdkInstance>).await;

	let key = RepositoryKey::plain(&server.uri(), "sdk-abc");

	assert!(repository.status(&key).await.is_some());

	repository.unsubscribe(id).await;

	assert!(repository.status(&key).await.is_none());
}

#[tokio::test]
async fn statuses_reports_every_subscribed_key() {
	let server = MockServer::start().await;

	Mock::given(method("GET"))
		.respond_with(ResponseTemplate::new(200).set_body_json(features_body("v1")))
		.mount(&server)
		.await;

	let repository = Repository::builder().build().expect("build");
	let first = Arc::new(RecordingInstance::new(server.uri(), "sdk-a"));
	let second = Arc::new(RecordingInstance::new(server.uri(), "sdk-b"));

	repository.subscribe(Arc::clone(&first) as Arc<dyn SdkInstance>).await;
	repository.subscribe(Arc::clone(&second) as Arc<dyn SdkInstance>).await;

	let statuses = repository.statuses().await;

	assert_eq!(statuses.len(), 2);
}
