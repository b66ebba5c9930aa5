//! Inference engine module
//!
//! Engine bring-up is a fallback chain over candidate configurations
//! rather than a single load: every combination of asset source,
//! compute backend and detector variant is a candidate, and the loader
//! walks them in order until one initializes.

pub mod loader;
pub mod openvino;
pub mod preprocess;

pub use loader::{EngineLoader, LoadStatus};
pub use self::openvino::{OpenVinoEngine, OpenVinoEngineFactory};

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::camera::Frame;
use crate::config::EngineSettings;

/// Where a candidate's model files come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetSource {
    Local,
    Remote,
}

impl AssetSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetSource::Local => "local",
            AssetSource::Remote => "remote",
        }
    }
}

/// One fully specified engine candidate.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub source: AssetSource,
    pub variant: String,
    pub backend: String,
    /// Directory the model files are read from. For remote candidates
    /// the loader points this at the staging directory after download.
    pub model_dir: PathBuf,
    pub age_model: String,
    pub age_enabled: bool,
    pub min_confidence: f32,
}

impl EngineConfig {
    /// Expand settings into the ordered candidate list. Within a source
    /// the variant varies fastest, then the backend; local candidates
    /// come before remote ones.
    pub fn expand(settings: &EngineSettings) -> Vec<EngineConfig> {
        let mut sources = vec![AssetSource::Local];
        if settings.remote_model_base.is_some() {
            sources.push(AssetSource::Remote);
        }

        let mut candidates = Vec::new();
        for source in sources {
            for backend in &settings.backends {
                for variant in &settings.detector_variants {
                    candidates.push(EngineConfig {
                        source,
                        variant: variant.clone(),
                        backend: backend.clone(),
                        model_dir: settings.local_model_dir.clone(),
                        age_model: settings.age_model.clone(),
                        age_enabled: settings.age_enabled,
                        min_confidence: settings.min_confidence,
                    });
                }
            }
        }
        candidates
    }

    /// Short human label for status reporting.
    pub fn describe(&self) -> String {
        format!("{}/{}/{}", self.source.as_str(), self.backend, self.variant)
    }
}

/// A single face as the engine sees it, in frame coordinates.
#[derive(Debug, Clone)]
pub struct FaceObservation {
    /// `[x, y, width, height]`
    pub bounds: [f32; 4],
    pub score: f32,
    /// Estimated age in years, when the age model ran for this face.
    pub age: Option<f32>,
}

/// One detection pass over one frame.
#[derive(Debug, Clone, Default)]
pub struct Detection {
    pub faces: Vec<FaceObservation>,
    pub inference_time_ms: f64,
}

/// A loaded (or loadable) engine candidate.
#[async_trait]
pub trait InferenceEngine: Send + Sync {
    fn config(&self) -> &EngineConfig;

    /// Load and compile the models. Must be called before `detect`.
    async fn initialize(&self) -> Result<()>;

    /// Best-effort first inference to pull lazy backend setup forward.
    /// Failures here must not be treated as a broken engine.
    async fn warmup(&self) -> Result<()>;

    async fn detect(&self, frame: &Frame) -> Result<Detection>;
}

/// Constructs engines from candidate configurations. Construction is
/// cheap and must not touch model files; that happens in `initialize`.
pub trait EngineFactory: Send + Sync {
    fn create(&self, config: EngineConfig) -> Result<Arc<dyn InferenceEngine>>;
}
