//! Scripted network doubles shared by cache and asset tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;

use super::fetch::{FetchedResponse, Fetcher};

/// A fetcher answering from a scripted table. Unknown URLs and the
/// offline switch both produce transport errors, mimicking an
/// unreachable network rather than an HTTP error response.
#[derive(Default)]
pub struct FakeFetcher {
    responses: Mutex<HashMap<String, FetchedResponse>>,
    offline: AtomicBool,
    calls: Mutex<Vec<String>>,
    bodies: Mutex<Vec<(Vec<u8>, Option<String>)>>,
}

impl FakeFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, url: &str, response: FetchedResponse) {
        self.responses.lock().insert(url.to_string(), response);
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Every `"METHOD url"` seen so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Bodies (with content type) forwarded through `fetch_with_body`.
    pub fn forwarded_bodies(&self) -> Vec<(Vec<u8>, Option<String>)> {
        self.bodies.lock().clone()
    }
}

#[async_trait]
impl Fetcher for FakeFetcher {
    async fn fetch(&self, method: &str, url: &str) -> Result<FetchedResponse> {
        self.calls.lock().push(format!("{method} {url}"));
        if self.offline.load(Ordering::SeqCst) {
            bail!("network unreachable");
        }
        match self.responses.lock().get(url) {
            Some(response) => Ok(response.clone()),
            None => bail!("no route to {url}"),
        }
    }

    async fn fetch_with_body(
        &self,
        method: &str,
        url: &str,
        body: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<FetchedResponse> {
        self.bodies
            .lock()
            .push((body, content_type.map(|s| s.to_string())));
        self.fetch(method, url).await
    }
}
