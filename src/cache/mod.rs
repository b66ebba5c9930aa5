//! Offline caching
//!
//! Generation-tagged stores, an install/activate/serve worker lifecycle,
//! and a local intercept endpoint that applies per-class caching policies
//! to everything the application fetches.

pub mod fetch;
pub mod policy;
pub mod server;
pub mod store;
pub mod worker;

#[cfg(test)]
pub(crate) mod testutil;

pub use fetch::{FetchedResponse, Fetcher, HttpFetcher, WorkerFetcher};
pub use policy::{Classifier, RequestClass};
pub use server::{create_intercept_router, InterceptState};
pub use store::{CacheEntry, CacheStore, FsCacheStore, MemoryCacheStore};
pub use worker::{CacheWorker, CachedResponse, ServedFrom, WorkerState};
