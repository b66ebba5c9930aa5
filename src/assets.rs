//! Model asset availability
//!
//! Engine bring-up is refused up front when the assets it would need are
//! reachable neither on disk nor remotely. The check requires at least
//! one detector variant plus every explicitly required asset; individual
//! missing variants only narrow the fallback chain.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::cache::Fetcher;
use crate::config::{AssetsConfig, EngineSettings};
use crate::error::Error;

#[derive(Debug, Clone)]
pub struct AssetReport {
    pub available_variants: Vec<String>,
    pub missing_variants: Vec<String>,
    pub missing_required: Vec<String>,
}

impl AssetReport {
    /// Enough to bring an engine up: one usable detector variant and no
    /// missing required asset.
    pub fn is_viable(&self) -> bool {
        !self.available_variants.is_empty() && self.missing_required.is_empty()
    }
}

pub struct AssetChecker {
    local_dir: PathBuf,
    remote_base: Option<String>,
    detector_variants: Vec<String>,
    required: Vec<String>,
    fetcher: Arc<dyn Fetcher>,
}

#[derive(Clone, Copy, PartialEq)]
enum AssetKind {
    Variant,
    Required,
}

impl AssetChecker {
    pub fn new(
        engine: &EngineSettings,
        assets: &AssetsConfig,
        fetcher: Arc<dyn Fetcher>,
    ) -> Self {
        Self {
            local_dir: engine.local_model_dir.clone(),
            remote_base: engine.remote_model_base.clone(),
            detector_variants: engine.detector_variants.clone(),
            required: assets.required.clone(),
            fetcher,
        }
    }

    /// Probe every asset concurrently and report what is reachable.
    pub async fn check(&self) -> Result<AssetReport> {
        let mut probes = JoinSet::new();
        for name in &self.detector_variants {
            probes.spawn(self.probe(name.clone(), AssetKind::Variant));
        }
        for name in &self.required {
            probes.spawn(self.probe(name.clone(), AssetKind::Required));
        }

        let mut report = AssetReport {
            available_variants: Vec::new(),
            missing_variants: Vec::new(),
            missing_required: Vec::new(),
        };
        while let Some(result) = probes.join_next().await {
            let (name, kind, available) = result?;
            match (kind, available) {
                (AssetKind::Variant, true) => report.available_variants.push(name),
                (AssetKind::Variant, false) => report.missing_variants.push(name),
                (AssetKind::Required, true) => {}
                (AssetKind::Required, false) => report.missing_required.push(name),
            }
        }
        // Preserve the configured fallback order; JoinSet completion
        // order is arbitrary.
        report
            .available_variants
            .sort_by_key(|v| self.detector_variants.iter().position(|c| c == v));

        if !report.missing_variants.is_empty() {
            debug!("unavailable detector variants: {:?}", report.missing_variants);
        }
        if !report.missing_required.is_empty() {
            warn!("missing required assets: {:?}", report.missing_required);
        }
        Ok(report)
    }

    /// Like [`check`](Self::check), but turns a non-viable report into an
    /// error so bring-up can bail before touching the engine.
    pub async fn ensure_viable(&self) -> Result<AssetReport, Error> {
        let report = self.check().await?;
        if report.is_viable() {
            Ok(report)
        } else {
            Err(Error::AssetsMissing)
        }
    }

    fn probe(
        &self,
        name: String,
        kind: AssetKind,
    ) -> impl std::future::Future<Output = (String, AssetKind, bool)> + Send + 'static {
        let local = self.local_dir.join(&name);
        let remote = self
            .remote_base
            .as_ref()
            .map(|base| format!("{}/{}", base.trim_end_matches('/'), name));
        let fetcher = self.fetcher.clone();
        async move {
            if tokio::fs::try_exists(&local).await.unwrap_or(false) {
                return (name, kind, true);
            }
            if let Some(url) = remote {
                match fetcher.fetch("HEAD", &url).await {
                    Ok(response) if response.is_cacheable() => return (name, kind, true),
                    Ok(response) => {
                        debug!("remote probe for {name} returned {}", response.status)
                    }
                    Err(err) => debug!("remote probe for {name} failed: {err:#}"),
                }
            }
            (name, kind, false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::testutil::FakeFetcher;
    use crate::cache::FetchedResponse;
    use crate::config::Config;

    fn checker(dir: &std::path::Path, remote: Option<&str>, fetcher: Arc<FakeFetcher>) -> AssetChecker {
        let mut engine = Config::default().engine;
        engine.local_model_dir = dir.to_path_buf();
        engine.remote_model_base = remote.map(|s| s.to_string());
        let assets = Config::default().assets;
        AssetChecker::new(&engine, &assets, fetcher)
    }

    fn ok_response() -> FetchedResponse {
        FetchedResponse {
            status: 200,
            bytes: vec![],
            content_type: None,
            opaque: false,
        }
    }

    #[tokio::test]
    async fn test_local_assets_satisfy_check() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("scrfd_500m_kps.onnx"), b"m").unwrap();
        std::fs::write(dir.path().join("genderage.onnx"), b"m").unwrap();

        let checker = checker(dir.path(), None, Arc::new(FakeFetcher::new()));
        let report = checker.check().await.unwrap();
        assert!(report.is_viable());
        assert_eq!(report.available_variants, vec!["scrfd_500m_kps.onnx"]);
        assert_eq!(report.missing_variants, vec!["scrfd_10g_kps.onnx"]);
    }

    #[tokio::test]
    async fn test_no_variant_anywhere_is_not_viable() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("genderage.onnx"), b"m").unwrap();

        let checker = checker(dir.path(), None, Arc::new(FakeFetcher::new()));
        let report = checker.check().await.unwrap();
        assert!(!report.is_viable());
        assert!(matches!(
            checker.ensure_viable().await,
            Err(Error::AssetsMissing)
        ));
    }

    #[tokio::test]
    async fn test_missing_required_asset_is_not_viable() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("scrfd_500m_kps.onnx"), b"m").unwrap();

        let checker = checker(dir.path(), None, Arc::new(FakeFetcher::new()));
        let report = checker.check().await.unwrap();
        assert!(!report.is_viable());
        assert_eq!(report.missing_required, vec!["genderage.onnx"]);
    }

    #[tokio::test]
    async fn test_remote_probe_fills_local_gaps() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("genderage.onnx"), b"m").unwrap();

        let fetcher = Arc::new(FakeFetcher::new());
        fetcher.respond(
            "https://models.example.com/scrfd_500m_kps.onnx",
            ok_response(),
        );

        let checker = checker(dir.path(), Some("https://models.example.com/"), fetcher);
        let report = checker.check().await.unwrap();
        assert!(report.is_viable());
        assert_eq!(report.available_variants, vec!["scrfd_500m_kps.onnx"]);
    }

    #[tokio::test]
    async fn test_variant_order_follows_configuration() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("scrfd_500m_kps.onnx"), b"m").unwrap();
        std::fs::write(dir.path().join("scrfd_10g_kps.onnx"), b"m").unwrap();
        std::fs::write(dir.path().join("genderage.onnx"), b"m").unwrap();

        let checker = checker(dir.path(), None, Arc::new(FakeFetcher::new()));
        let report = checker.check().await.unwrap();
        assert_eq!(
            report.available_variants,
            vec!["scrfd_500m_kps.onnx", "scrfd_10g_kps.onnx"]
        );
    }
}
