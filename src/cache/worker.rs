//! Offline cache worker
//!
//! A process-wide interceptor with its own lifecycle, independent of any
//! camera session. Install pre-populates the shell store, activate evicts
//! every store from another generation, and only then does the worker
//! begin answering requests. Request handling applies one of three
//! policies chosen by [`Classifier`](super::policy::Classifier).

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::config::CacheSettings;
use crate::error::Error;

use super::fetch::{FetchedResponse, Fetcher};
use super::policy::{request_path, Classifier, RequestClass};
use super::store::{CacheEntry, CacheStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Installing,
    Activating,
    Active,
}

/// Where a response was ultimately served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServedFrom {
    Cache,
    Network,
}

#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub status: u16,
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
    pub served_from: ServedFrom,
}

impl CachedResponse {
    fn from_entry(entry: CacheEntry) -> Self {
        Self {
            status: 200,
            bytes: entry.bytes,
            content_type: entry.content_type,
            served_from: ServedFrom::Cache,
        }
    }

    fn from_network(response: FetchedResponse) -> Self {
        Self {
            status: response.status,
            bytes: response.bytes,
            content_type: response.content_type,
            served_from: ServedFrom::Network,
        }
    }
}

pub struct CacheWorker {
    store: Arc<dyn CacheStore>,
    fetcher: Arc<dyn Fetcher>,
    classifier: Classifier,
    version: String,
    shell_manifest: Vec<String>,
    root_document: String,
    upstream: String,
    state: RwLock<WorkerState>,
}

impl CacheWorker {
    pub fn new(
        store: Arc<dyn CacheStore>,
        fetcher: Arc<dyn Fetcher>,
        settings: &CacheSettings,
    ) -> Self {
        Self {
            classifier: Classifier::new(settings),
            store,
            fetcher,
            version: settings.version.clone(),
            shell_manifest: settings.shell_manifest.clone(),
            root_document: settings.root_document.clone(),
            upstream: settings.upstream.trim_end_matches('/').to_string(),
            state: RwLock::new(WorkerState::Installing),
        }
    }

    pub fn state(&self) -> WorkerState {
        *self.state.read()
    }

    pub fn shell_store(&self) -> String {
        format!("shell-{}", self.version)
    }

    pub fn runtime_store(&self) -> String {
        format!("runtime-{}", self.version)
    }

    /// Install then activate. The worker serves nothing until this returns.
    pub async fn start(&self) -> Result<()> {
        self.install().await?;
        self.activate().await?;
        Ok(())
    }

    /// Pre-populate the shell store with the full manifest. Any missing
    /// shell asset aborts installation; entries already present for this
    /// generation are kept as-is so an offline restart of an installed
    /// version succeeds.
    pub async fn install(&self) -> Result<()> {
        *self.state.write() = WorkerState::Installing;
        let store_name = self.shell_store();
        for path in &self.shell_manifest {
            if self.store.contains(&store_name, path).await? {
                debug!("shell asset {path} already installed for {}", self.version);
                continue;
            }
            let url = self.absolutize(path);
            let response = self
                .fetcher
                .fetch("GET", &url)
                .await
                .with_context(|| format!("failed to install shell asset {path}"))?;
            if !response.is_cacheable() {
                bail!(
                    "shell asset {path} returned status {} during install",
                    response.status
                );
            }
            self.store
                .put(
                    &store_name,
                    path,
                    CacheEntry {
                        bytes: response.bytes,
                        content_type: response.content_type,
                    },
                )
                .await
                .with_context(|| format!("failed to store shell asset {path}"))?;
        }
        info!("cache install complete for generation {}", self.version);
        Ok(())
    }

    /// Delete every shell/runtime store tagged with another generation,
    /// then begin serving. Cleanup is complete before the state flips.
    pub async fn activate(&self) -> Result<()> {
        *self.state.write() = WorkerState::Activating;
        let keep = [self.shell_store(), self.runtime_store()];
        for store in self.store.list_stores().await? {
            let is_ours = store.starts_with("shell-") || store.starts_with("runtime-");
            if is_ours && !keep.contains(&store) {
                self.store
                    .delete_store(&store)
                    .await
                    .with_context(|| format!("failed to evict stale store {store}"))?;
                info!("evicted stale cache store {store}");
            }
        }
        *self.state.write() = WorkerState::Active;
        info!("cache worker active (generation {})", self.version);
        Ok(())
    }

    /// Forward mutation traffic to the network untouched, body and
    /// content type included. Never cached.
    pub async fn passthrough(
        &self,
        method: &str,
        url: &str,
        body: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<CachedResponse> {
        let response = self
            .fetcher
            .fetch_with_body(method, &self.absolutize(url), body, content_type)
            .await?;
        Ok(CachedResponse::from_network(response))
    }

    /// Handle one intercepted request. Non-GET traffic is passed through
    /// to the network unconditionally and never cached.
    pub async fn handle(
        &self,
        method: &str,
        url: &str,
        navigation: bool,
    ) -> Result<CachedResponse> {
        if !method.eq_ignore_ascii_case("GET") {
            return self.passthrough(method, url, Vec::new(), None).await;
        }
        if self.state() != WorkerState::Active {
            bail!("cache worker is not active yet");
        }
        match self.classifier.classify(url) {
            RequestClass::Runtime => self.handle_runtime(url).await,
            RequestClass::Shell => self.handle_shell(url).await,
            RequestClass::Dynamic => self.handle_dynamic(url, navigation).await,
        }
    }

    /// Cache-first. Populated lazily; a write failure is logged and
    /// swallowed, never failing the fetch that triggered it.
    async fn handle_runtime(&self, url: &str) -> Result<CachedResponse> {
        let store_name = self.runtime_store();
        if let Some(entry) = self.store.get(&store_name, url).await? {
            return Ok(CachedResponse::from_entry(entry));
        }
        match self.fetcher.fetch("GET", &self.absolutize(url)).await {
            Ok(response) => {
                if response.is_cacheable() {
                    self.put_logged(&store_name, url, &response).await;
                }
                Ok(CachedResponse::from_network(response))
            }
            Err(err) => {
                warn!("runtime asset fetch failed with no cached copy: {url}: {err:#}");
                Err(Error::OfflineMiss {
                    url: url.to_string(),
                }
                .into())
            }
        }
    }

    /// Stale-while-revalidate: serve the cached copy immediately and
    /// refresh it concurrently for next time. No cached copy makes the
    /// network fetch the primary response.
    async fn handle_shell(&self, url: &str) -> Result<CachedResponse> {
        let store_name = self.shell_store();
        let key = request_path(url).to_string();
        let absolute = self.absolutize(url);
        if let Some(entry) = self.store.get(&store_name, &key).await? {
            let store = self.store.clone();
            let fetcher = self.fetcher.clone();
            tokio::spawn(async move {
                match fetcher.fetch("GET", &absolute).await {
                    Ok(response) if response.is_cacheable() => {
                        let entry = CacheEntry {
                            bytes: response.bytes,
                            content_type: response.content_type,
                        };
                        if let Err(err) = store.put(&store_name, &key, entry).await {
                            warn!("cache write skipped for {key}: {err:#}");
                        }
                    }
                    Ok(response) => {
                        debug!("shell revalidation of {key} returned {}", response.status)
                    }
                    Err(err) => debug!("shell revalidation of {key} failed: {err:#}"),
                }
            });
            return Ok(CachedResponse::from_entry(entry));
        }
        let response = self
            .fetcher
            .fetch("GET", &absolute)
            .await
            .with_context(|| format!("shell asset {key} unavailable"))?;
        if response.is_cacheable() {
            self.put_logged(&store_name, &key, &response).await;
        }
        Ok(CachedResponse::from_network(response))
    }

    /// Network-first with cache fallback; failed navigations fall back
    /// further to the cached root document.
    async fn handle_dynamic(&self, url: &str, navigation: bool) -> Result<CachedResponse> {
        let store_name = self.runtime_store();
        match self.fetcher.fetch("GET", &self.absolutize(url)).await {
            Ok(response) => {
                if response.is_success() {
                    self.put_logged(&store_name, url, &response).await;
                }
                Ok(CachedResponse::from_network(response))
            }
            Err(err) => {
                if let Some(entry) = self.store.get(&store_name, url).await? {
                    debug!("serving {url} from cache after network failure");
                    return Ok(CachedResponse::from_entry(entry));
                }
                if navigation {
                    if let Some(entry) = self
                        .store
                        .get(&self.shell_store(), &self.root_document)
                        .await?
                    {
                        info!("navigation to {url} failed, serving cached shell");
                        return Ok(CachedResponse::from_entry(entry));
                    }
                }
                Err(err)
            }
        }
    }

    async fn put_logged(&self, store: &str, key: &str, response: &FetchedResponse) {
        let entry = CacheEntry {
            bytes: response.bytes.clone(),
            content_type: response.content_type.clone(),
        };
        if let Err(err) = self.store.put(store, key, entry).await {
            warn!("cache write skipped for {key}: {err:#}");
        }
    }

    fn absolutize(&self, url: &str) -> String {
        if url.starts_with('/') {
            format!("{}{}", self.upstream, url)
        } else {
            url.to_string()
        }
    }
}
