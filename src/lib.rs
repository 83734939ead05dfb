//! Process-wide, multi-instance feature-flag repository — caches remote
//! feature/experiment payloads, coalesces concurrent fetches, mirrors state
//! to an optional persistent store, and keeps subscribers current via
//! server-sent-event streaming with polling as a fallback.

#![deny(clippy::all, missing_docs, unused_crate_dependencies)]

pub mod cache;
pub mod config;
pub mod env;
pub mod http;
pub mod instance;
pub mod key;
#[cfg(feature = "metrics")] pub mod metrics;
pub mod stream;

mod error;
mod registry;
mod _prelude {
	pub use std::{
		sync::Arc,
		time::{Duration, SystemTime},
	};

	pub use chrono::{DateTime, TimeDelta, Utc};
	pub use tokio::time::Instant;

	pub use crate::{Error, Result};
}

#[cfg(feature = "prometheus")] pub use crate::metrics::install_default_exporter;
pub use crate::{
	config::{CacheSettings, CacheSettingsPatch, RefreshOptions},
	error::{Error, Result},
	instance::{ApiHosts, InstanceId, SdkInstance},
	key::RepositoryKey,
	registry::{Repository, RepositoryBuilder, RepositoryStatus},
};
