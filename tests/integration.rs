//! Integration test entrypoint; individual scenarios live under
//! `tests/integration/`.

mod support;

mod cache_refresh;
mod persistence;
mod subscription;
