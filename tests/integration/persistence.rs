//! A repository rebuilt against a populated persistent store hydrates
//! before ever reaching the network.

// std
use std::{sync::Arc, time::Duration};
// crates.io
use feature_repo_cache::{
	RefreshOptions, Repository,
	env::{Environment, InMemoryStore, Polyfills},
};
use wiremock::{
	Mock, MockServer, ResponseTemplate,
	matchers::{method, path},
};

use crate::support::RecordingInstance;

#[tokio::test]
async fn a_fresh_repository_hydrates_from_the_shared_store_without_refetching() {
	let server = MockServer::start().await;

	Mock::given(method("GET"))
		.and(path("/api/features/sdk-abc"))
		.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
			"features": { "myFeature": { "defaultValue": false } },
			"experiments": {},
			"dateUpdated": "v1",
		})))
		.expect(1)
		.mount(&server)
		.await;

	let store = InMemoryStore::new();

	let environment_a = Environment::new().expect("environment");
	environment_a
		.set_polyfills(Polyfills { persistent_store: Some(Arc::new(store.clone())), ..Default::default() })
		.await;

	let repository_a = Repository::builder().environment(environment_a).build().expect("build");
	let instance_a = Arc::new(RecordingInstance::new(server.uri(), "sdk-abc"));
	let dyn_instance_a = Arc::clone(&instance_a) as Arc<dyn feature_repo_cache::SdkInstance>;

	repository_a.subscribe(Arc::clone(&dyn_instance_a)).await;
	repository_a.refresh_features(&dyn_instance_a, RefreshOptions::default()).await.expect("refresh");

	// Persistence happens on a spawned background task; give it a moment.
	tokio::time::sleep(Duration::from_millis(50)).await;

	let environment_b = Environment::new().expect("environment");
	environment_b
		.set_polyfills(Polyfills { persistent_store: Some(Arc::new(store)), ..Default::default() })
		.await;

	let repository_b = Repository::builder().environment(environment_b).build().expect("build");
	let instance_b = Arc::new(RecordingInstance::new(server.uri(), "sdk-abc"));
	let dyn_instance_b = Arc::clone(&instance_b) as Arc<dyn feature_repo_cache::SdkInstance>;

	repository_b.subscribe(Arc::clone(&dyn_instance_b)).await;
	repository_b.refresh_features(&dyn_instance_b, RefreshOptions::default()).await.expect("refresh");

	assert_eq!(instance_b.delivery_count().await, 1);
	assert_eq!(instance_b.last_features().await.unwrap()["myFeature"]["defaultValue"], false);

	server.verify().await;
}
