//! Request classification
//!
//! Every intercepted GET falls into exactly one policy class. The class
//! decides which store serves it and in which order cache and network are
//! consulted.

use crate::config::CacheSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
    /// Large model assets and build output: cache-first, lazily populated.
    Runtime,
    /// Shell manifest member: stale-while-revalidate.
    Shell,
    /// Everything else: network-first with cache fallback.
    Dynamic,
}

pub struct Classifier {
    shell_paths: Vec<String>,
    runtime_prefixes: Vec<String>,
}

impl Classifier {
    pub fn new(settings: &CacheSettings) -> Self {
        Self {
            shell_paths: settings.shell_manifest.clone(),
            runtime_prefixes: settings.runtime_prefixes.clone(),
        }
    }

    pub fn classify(&self, url: &str) -> RequestClass {
        let path = request_path(url);
        if self
            .runtime_prefixes
            .iter()
            .any(|p| path.starts_with(p.as_str()) || url.starts_with(p.as_str()))
        {
            return RequestClass::Runtime;
        }
        if self.shell_paths.iter().any(|s| s == path) {
            return RequestClass::Shell;
        }
        RequestClass::Dynamic
    }
}

/// Path component of an absolute or origin-relative URL, without the query.
pub fn request_path(url: &str) -> &str {
    let after_scheme = match url.find("://") {
        Some(idx) => &url[idx + 3..],
        None => return url.split('?').next().unwrap_or(url),
    };
    let path = match after_scheme.find('/') {
        Some(idx) => &after_scheme[idx..],
        None => "/",
    };
    path.split('?').next().unwrap_or(path)
}
