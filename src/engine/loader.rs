//! Resilient engine bring-up
//!
//! Walks the candidate chain in order, bounding each initialization with
//! a timeout so one hung backend cannot stall bring-up forever. Warm-up
//! runs under its own timeout but is advisory only: a candidate that
//! initialized but failed warm-up is still returned.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::cache::CacheWorker;
use crate::config::EngineSettings;
use crate::error::Error;

use super::{AssetSource, EngineConfig, EngineFactory, InferenceEngine};

/// Bring-up progress, published over a watch channel for status display.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadStatus {
    Idle,
    Trying {
        candidate: String,
        attempt: usize,
        total: usize,
    },
    Ready {
        candidate: String,
    },
    Failed,
}

pub struct EngineLoader {
    factory: Arc<dyn EngineFactory>,
    settings: EngineSettings,
    status: watch::Sender<LoadStatus>,
    // Held so progress published before anyone subscribes is retained.
    status_rx: watch::Receiver<LoadStatus>,
    remote: Option<RemoteStaging>,
}

struct RemoteStaging {
    worker: Arc<CacheWorker>,
    dir: PathBuf,
}

impl EngineLoader {
    pub fn new(factory: Arc<dyn EngineFactory>, settings: EngineSettings) -> Self {
        let (status, status_rx) = watch::channel(LoadStatus::Idle);
        Self {
            factory,
            settings,
            status,
            status_rx,
            remote: None,
        }
    }

    /// Enable remote candidates: model files are pulled through the
    /// cache worker into `dir` before the candidate is constructed.
    pub fn with_remote_staging(mut self, worker: Arc<CacheWorker>, dir: PathBuf) -> Self {
        self.remote = Some(RemoteStaging { worker, dir });
        self
    }

    pub fn status(&self) -> watch::Receiver<LoadStatus> {
        self.status_rx.clone()
    }

    /// Try every candidate in order and return the first that
    /// initializes. Fails only once the whole chain is exhausted.
    pub async fn load(&self) -> Result<Arc<dyn InferenceEngine>, Error> {
        let candidates = EngineConfig::expand(&self.settings);
        let total = candidates.len();
        let init_timeout = Duration::from_secs(self.settings.init_timeout_secs);
        let warmup_timeout = Duration::from_secs(self.settings.warmup_timeout_secs);

        for (attempt, mut config) in candidates.into_iter().enumerate() {
            let label = config.describe();
            let _ = self.status.send(LoadStatus::Trying {
                candidate: label.clone(),
                attempt: attempt + 1,
                total,
            });

            if config.source == AssetSource::Remote {
                match self.stage(&config).await {
                    Ok(dir) => config.model_dir = dir,
                    Err(err) => {
                        warn!("candidate {label} could not be staged: {err:#}");
                        continue;
                    }
                }
            }

            let engine = match self.factory.create(config) {
                Ok(engine) => engine,
                Err(err) => {
                    warn!("candidate {label} could not be constructed: {err:#}");
                    continue;
                }
            };

            match timeout(init_timeout, engine.initialize()).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!("candidate {label} failed to initialize: {err:#}");
                    continue;
                }
                Err(_) => {
                    warn!("candidate {label} timed out after {init_timeout:?}");
                    continue;
                }
            }

            match timeout(warmup_timeout, engine.warmup()).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!("warm-up failed for {label}, continuing: {err:#}"),
                Err(_) => warn!("warm-up timed out for {label}, continuing"),
            }

            info!("engine ready: {label} ({}/{total})", attempt + 1);
            let _ = self.status.send(LoadStatus::Ready { candidate: label });
            return Ok(engine);
        }

        let _ = self.status.send(LoadStatus::Failed);
        Err(Error::EngineUnavailable)
    }

    /// Download the candidate's model files through the cache worker, so
    /// a previously fetched model stays loadable offline.
    async fn stage(&self, config: &EngineConfig) -> Result<PathBuf> {
        let staging = self
            .remote
            .as_ref()
            .context("remote candidates require staging to be configured")?;
        let base = self
            .settings
            .remote_model_base
            .as_deref()
            .context("remote candidates require a remote model base")?
            .trim_end_matches('/');

        tokio::fs::create_dir_all(&staging.dir)
            .await
            .context("failed to create model staging directory")?;

        self.stage_file(staging, base, &config.variant, true).await?;
        if config.age_enabled {
            // A missing age model narrows features, not the chain.
            if let Err(err) = self.stage_file(staging, base, &config.age_model, false).await {
                warn!("age model could not be staged: {err:#}");
            }
        }
        Ok(staging.dir.clone())
    }

    async fn stage_file(
        &self,
        staging: &RemoteStaging,
        base: &str,
        file: &str,
        required: bool,
    ) -> Result<()> {
        let dest = staging.dir.join(file);
        if tokio::fs::try_exists(&dest).await? {
            return Ok(());
        }

        let url = format!("{base}/{file}");
        let response = staging.worker.handle("GET", &url, false).await?;
        if !(200..300).contains(&response.status) {
            if required {
                bail!("remote model {file} returned status {}", response.status);
            }
            return Ok(());
        }

        tokio::fs::write(&dest, &response.bytes)
            .await
            .with_context(|| format!("failed to write staged model {file}"))?;
        info!("staged remote model {file} ({} bytes)", response.bytes.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::Frame;
    use crate::config::Config;
    use crate::engine::Detection;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    #[derive(Debug, Clone)]
    enum Behavior {
        Ok,
        InitFails,
        InitHangs(Duration),
        WarmupFails,
        WarmupHangs(Duration),
    }

    struct ScriptedEngine {
        config: EngineConfig,
        behavior: Behavior,
    }

    #[async_trait]
    impl InferenceEngine for ScriptedEngine {
        fn config(&self) -> &EngineConfig {
            &self.config
        }

        async fn initialize(&self) -> Result<()> {
            match self.behavior {
                Behavior::InitFails => bail!("model file is corrupt"),
                Behavior::InitHangs(duration) => {
                    tokio::time::sleep(duration).await;
                    Ok(())
                }
                _ => Ok(()),
            }
        }

        async fn warmup(&self) -> Result<()> {
            match self.behavior {
                Behavior::WarmupFails => bail!("backend rejected warm-up inference"),
                Behavior::WarmupHangs(duration) => {
                    tokio::time::sleep(duration).await;
                    Ok(())
                }
                _ => Ok(()),
            }
        }

        async fn detect(&self, _frame: &Frame) -> Result<Detection> {
            Ok(Detection::default())
        }
    }

    struct ScriptedFactory {
        behaviors: Mutex<VecDeque<Behavior>>,
        created: Mutex<Vec<String>>,
    }

    impl ScriptedFactory {
        fn new(behaviors: Vec<Behavior>) -> Arc<Self> {
            Arc::new(Self {
                behaviors: Mutex::new(behaviors.into()),
                created: Mutex::new(Vec::new()),
            })
        }

        fn created(&self) -> Vec<String> {
            self.created.lock().clone()
        }
    }

    impl EngineFactory for ScriptedFactory {
        fn create(&self, config: EngineConfig) -> Result<Arc<dyn InferenceEngine>> {
            self.created.lock().push(config.describe());
            let behavior = self.behaviors.lock().pop_front().unwrap_or(Behavior::Ok);
            Ok(Arc::new(ScriptedEngine { config, behavior }))
        }
    }

    fn settings() -> EngineSettings {
        Config::default().engine
    }

    #[tokio::test]
    async fn test_first_working_candidate_wins() {
        let factory = ScriptedFactory::new(vec![Behavior::InitFails, Behavior::Ok]);
        let loader = EngineLoader::new(factory.clone(), settings());

        let engine = loader.load().await.unwrap();
        assert_eq!(engine.config().variant, "scrfd_10g_kps.onnx");
        assert_eq!(
            factory.created(),
            vec!["local/CPU/scrfd_500m_kps.onnx", "local/CPU/scrfd_10g_kps.onnx"]
        );
        assert!(matches!(
            &*loader.status().borrow(),
            LoadStatus::Ready { candidate } if candidate == "local/CPU/scrfd_10g_kps.onnx"
        ));
    }

    #[tokio::test]
    async fn test_exhausted_chain_is_engine_unavailable() {
        let factory = ScriptedFactory::new(vec![Behavior::InitFails, Behavior::InitFails]);
        let loader = EngineLoader::new(factory, settings());

        assert!(matches!(
            loader.load().await,
            Err(Error::EngineUnavailable)
        ));
        assert_eq!(*loader.status().borrow(), LoadStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_candidate_is_cut_off_by_timeout() {
        let factory = ScriptedFactory::new(vec![
            Behavior::InitHangs(Duration::from_secs(300)),
            Behavior::Ok,
        ]);
        let loader = EngineLoader::new(factory, settings());

        let start = tokio::time::Instant::now();
        let engine = loader.load().await.unwrap();
        let elapsed = start.elapsed();

        assert_eq!(engine.config().variant, "scrfd_10g_kps.onnx");
        // The hung candidate costs exactly its init timeout, not 300s.
        assert!(elapsed >= Duration::from_secs(10));
        assert!(elapsed < Duration::from_secs(11));
    }

    #[tokio::test]
    async fn test_status_reaches_subscribers_arriving_after_load() {
        let factory = ScriptedFactory::new(vec![Behavior::Ok]);
        let loader = EngineLoader::new(factory, settings());
        loader.load().await.unwrap();

        // A subscriber arriving only now must still see the final state,
        // not the initial one.
        assert!(matches!(
            &*loader.status().borrow(),
            LoadStatus::Ready { .. }
        ));
    }

    #[tokio::test]
    async fn test_warmup_failure_does_not_fail_candidate() {
        let factory = ScriptedFactory::new(vec![Behavior::WarmupFails]);
        let loader = EngineLoader::new(factory, settings());

        let engine = loader.load().await.unwrap();
        assert_eq!(engine.config().variant, "scrfd_500m_kps.onnx");
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_warmup_is_bounded_and_non_fatal() {
        let factory = ScriptedFactory::new(vec![Behavior::WarmupHangs(Duration::from_secs(60))]);
        let loader = EngineLoader::new(factory, settings());

        let start = tokio::time::Instant::now();
        let engine = loader.load().await.unwrap();
        let elapsed = start.elapsed();

        assert_eq!(engine.config().variant, "scrfd_500m_kps.onnx");
        assert!(elapsed >= Duration::from_secs(4));
        assert!(elapsed < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_remote_candidate_stages_models_through_cache() {
        use crate::cache::testutil::FakeFetcher;
        use crate::cache::{CacheWorker, FetchedResponse, MemoryCacheStore};

        let mut settings = settings();
        settings.remote_model_base = Some("https://models.example.com".to_string());
        settings.detector_variants = vec!["scrfd_500m_kps.onnx".to_string()];

        let store = Arc::new(MemoryCacheStore::new());
        let fetcher = Arc::new(FakeFetcher::new());
        let model_response = |body: &[u8]| FetchedResponse {
            status: 200,
            bytes: body.to_vec(),
            content_type: Some("application/octet-stream".to_string()),
            opaque: false,
        };
        fetcher.respond(
            "https://models.example.com/scrfd_500m_kps.onnx",
            model_response(b"detector-weights"),
        );
        fetcher.respond(
            "https://models.example.com/genderage.onnx",
            model_response(b"age-weights"),
        );
        let cache_settings = Config::default().cache;
        let worker = Arc::new(CacheWorker::new(store, fetcher, &cache_settings));
        // No shell to install in this setup; activate directly.
        worker.activate().await.unwrap();

        let staging = tempfile::tempdir().unwrap();
        // The single local candidate fails, forcing the remote one.
        let factory = ScriptedFactory::new(vec![Behavior::InitFails, Behavior::Ok]);
        let loader = EngineLoader::new(factory, settings)
            .with_remote_staging(worker, staging.path().to_path_buf());

        let engine = loader.load().await.unwrap();
        assert_eq!(engine.config().source, AssetSource::Remote);
        assert_eq!(engine.config().model_dir, staging.path());
        assert_eq!(
            std::fs::read(staging.path().join("scrfd_500m_kps.onnx")).unwrap(),
            b"detector-weights"
        );
        assert_eq!(
            std::fs::read(staging.path().join("genderage.onnx")).unwrap(),
            b"age-weights"
        );
    }
}
