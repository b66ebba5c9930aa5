//! Network fetch seam for the cache worker.
//!
//! The worker never talks to `reqwest` directly; everything goes through
//! the [`Fetcher`] trait so tests can script network behavior, including
//! total outages.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;

use super::worker::CacheWorker;

/// A fetched response. `opaque` marks cross-origin responses whose status
/// is unobservable; they are accepted on faith for runtime caching.
#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: u16,
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
    pub opaque: bool,
}

impl FetchedResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Whether the response may be written to a cache store.
    pub fn is_cacheable(&self) -> bool {
        self.opaque || self.is_success()
    }
}

#[async_trait]
pub trait Fetcher: Send + Sync + 'static {
    async fn fetch(&self, method: &str, url: &str) -> Result<FetchedResponse>;

    /// Forward a request with its body and content type intact. The
    /// non-GET passthrough path depends on this; implementations must
    /// not drop the body.
    async fn fetch_with_body(
        &self,
        method: &str,
        url: &str,
        body: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<FetchedResponse>;
}

/// Production fetcher backed by a shared `reqwest` client.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to create HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, method: &str, url: &str) -> Result<FetchedResponse> {
        self.fetch_with_body(method, url, Vec::new(), None).await
    }

    async fn fetch_with_body(
        &self,
        method: &str,
        url: &str,
        body: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<FetchedResponse> {
        let method: reqwest::Method = method
            .parse()
            .with_context(|| format!("invalid HTTP method {method}"))?;
        let mut request = self.client.request(method, url);
        if let Some(content_type) = content_type {
            request = request.header(reqwest::header::CONTENT_TYPE, content_type);
        }
        if !body.is_empty() {
            request = request.body(body);
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("request to {url} failed"))?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let bytes = response
            .bytes()
            .await
            .context("failed to read response body")?
            .to_vec();

        Ok(FetchedResponse {
            status,
            bytes,
            content_type,
            opaque: false,
        })
    }
}

/// Routes fetches through the cache worker so callers see the same
/// policies as intercepted traffic, cached copies included.
pub struct WorkerFetcher {
    worker: Arc<CacheWorker>,
}

impl WorkerFetcher {
    pub fn new(worker: Arc<CacheWorker>) -> Self {
        Self { worker }
    }
}

#[async_trait]
impl Fetcher for WorkerFetcher {
    async fn fetch(&self, method: &str, url: &str) -> Result<FetchedResponse> {
        // The worker only answers with full bodies, so existence probes
        // become GETs; a cached asset then still answers offline.
        let method = if method.eq_ignore_ascii_case("HEAD") {
            "GET"
        } else {
            method
        };
        let response = self.worker.handle(method, url, false).await?;
        Ok(FetchedResponse {
            status: response.status,
            bytes: response.bytes,
            content_type: response.content_type,
            opaque: false,
        })
    }

    async fn fetch_with_body(
        &self,
        method: &str,
        url: &str,
        body: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<FetchedResponse> {
        let response = self
            .worker
            .passthrough(method, url, body, content_type)
            .await?;
        Ok(FetchedResponse {
            status: response.status,
            bytes: response.bytes,
            content_type: response.content_type,
            opaque: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::testutil::FakeFetcher;
    use crate::cache::MemoryCacheStore;
    use crate::config::CacheSettings;
    use std::path::PathBuf;

    #[tokio::test]
    async fn test_worker_fetcher_answers_probes_from_cache_offline() {
        let settings = CacheSettings {
            version: "v1".to_string(),
            dir: PathBuf::from("unused"),
            shell_manifest: vec!["/".to_string()],
            runtime_prefixes: vec!["/models/".to_string()],
            root_document: "/".to_string(),
            upstream: "http://upstream".to_string(),
        };
        let store = Arc::new(MemoryCacheStore::new());
        let network = Arc::new(FakeFetcher::new());
        network.respond(
            "http://upstream/models/a.onnx",
            FetchedResponse {
                status: 200,
                bytes: b"weights".to_vec(),
                content_type: None,
                opaque: false,
            },
        );
        let worker = Arc::new(CacheWorker::new(store, network.clone(), &settings));
        worker.activate().await.unwrap();

        let probe = WorkerFetcher::new(worker);
        let first = probe.fetch("HEAD", "/models/a.onnx").await.unwrap();
        assert_eq!(first.bytes, b"weights");

        network.set_offline(true);
        let second = probe.fetch("HEAD", "/models/a.onnx").await.unwrap();
        assert_eq!(second.bytes, b"weights");
    }

    #[test]
    fn test_cacheability() {
        let ok = FetchedResponse {
            status: 200,
            bytes: vec![],
            content_type: None,
            opaque: false,
        };
        assert!(ok.is_cacheable());

        let not_found = FetchedResponse { status: 404, ..ok.clone() };
        assert!(!not_found.is_cacheable());

        // Opaque responses have no observable status but are cached on faith.
        let opaque = FetchedResponse {
            status: 0,
            bytes: vec![],
            content_type: None,
            opaque: true,
        };
        assert!(opaque.is_cacheable());
        assert!(!opaque.is_success());
    }
}
