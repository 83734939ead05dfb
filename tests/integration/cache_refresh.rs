//! Cold cache, warm cache, and stale-serves-then-refreshes behaviour.

// std
use std::{sync::Arc, time::Duration};
// crates.io
use feature_repo_cache::{CacheSettings, RefreshOptions, Repository, SdkInstance};
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
async fn cold_cache_blocks_on_the_first_fetch() {
	let server = MockServer::start().await;

	Mock::given(method("GET"))
		.and(path("/api/features/sdk-abc"))
		.respond_with(ResponseTemplate::new(200).set_body_json(features_body("v1")))
		.expect(1)
		.mount(&server)
		.await;

	let repository = Repository::builder().build().expect("build");
	let instance = Arc::new(RecordingInstance::new(server.uri(), "sdk-abc"));
	let dyn_instance = Arc::clone(&instance) as Arc<dyn SdkInstance>;

	repository.subscribe(Arc::clone(&dyn_instance)).await;
	repository.refresh_features(&dyn_instance, RefreshOptions::default()).await.expect("refresh");

	assert_eq!(instance.delivery_count().await, 1);
	assert_eq!(instance.last_features().await.unwrap()["myFeature"]["defaultValue"], true);

	server.verify().await;
}

#[tokio::test]
async fn hot_fresh_cache_is_reused_without_a_second_fetch() {
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

	repository.subscribe(Arc::clone(&dyn_first)).await;
	repository.subscribe(Arc::clone(&dyn_second)).await;
	repository.refresh_features(&dyn_first, RefreshOptions::default()).await.expect("refresh");
	repository.refresh_features(&dyn_second, RefreshOptions::default()).await.expect("refresh");

	assert_eq!(first.delivery_count().await, 1);
	assert_eq!(second.delivery_count().await, 1);

	server.verify().await;
}

#[tokio::test]
async fn stale_cache_serves_immediately_and_refreshes_in_the_background() {
	let server = MockServer::start().await;

	Mock::given(method("GET"))
		.and(path("/api/features/sdk-abc"))
		.respond_with(ResponseTemplate::new(200).set_body_json(features_body("v2")))
		.expect(2..)
		.mount(&server)
		.await;

	let settings = CacheSettings { stale_ttl: Duration::from_millis(10), ..CacheSettings::default() };
	let repository = Repository::builder().cache_settings(settings).build().expect("build");
	let first = Arc::new(RecordingInstance::new(server.uri(), "sdk-abc"));
	let dyn_first = Arc::clone(&first) as Arc<dyn SdkInstance>;

	repository.subscribe(Arc::clone(&dyn_first)).await;
	repository.refresh_features(&dyn_first, RefreshOptions::default()).await.expect("refresh");
	assert_eq!(first.delivery_count().await, 1);

	tokio::time::sleep(Duration::from_millis(30)).await;

	let second = Arc::new(RecordingInstance::new(server.uri(), "sdk-abc"));
	let dyn_second = Arc::clone(&second) as Arc<dyn SdkInstance>;

	repository.subscribe(Arc::clone(&dyn_second)).await;
	repository.refresh_features(&dyn_second, RefreshOptions::default()).await.expect("refresh");

	// The stale payload is delivered immediately, before the background
	// refresh (which targets the same dateUpdated and is a no-op commit)
	// has a chance to run.
	assert_eq!(second.delivery_count().await, 1);

	tokio::time::sleep(Duration::from_millis(50)).await;

	server.verify().await;
}
