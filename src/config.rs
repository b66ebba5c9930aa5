//! Age estimation runtime configuration

use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub camera: CameraConfig,
    pub engine: EngineSettings,
    pub assets: AssetsConfig,
    pub detect: DetectConfig,
    pub cache: CacheSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Port for the local cache intercept endpoint.
    pub intercept_port: u16,
    /// Origin the application is served from. Camera access is refused
    /// when this is neither encrypted nor local.
    pub origin: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    /// Preferred (not mandatory) capture width.
    pub width: u32,
    /// Preferred (not mandatory) capture height.
    pub height: u32,
    pub fps: u32,
    /// Preferred facing when no explicit device is selected ("user" or
    /// "environment").
    pub facing: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineSettings {
    /// Directory holding model files on the local device.
    pub local_model_dir: PathBuf,
    /// Optional remote base URL to fall back to when local assets are
    /// absent. Fetches go through the cache worker.
    pub remote_model_base: Option<String>,
    /// Detector model alternatives, most compatible first.
    pub detector_variants: Vec<String>,
    /// Compute backends, most preferred first (OpenVINO device names).
    pub backends: Vec<String>,
    /// Age/gender estimation sub-model file.
    pub age_model: String,
    pub age_enabled: bool,
    pub min_confidence: f32,
    /// Per-candidate initialization timeout.
    pub init_timeout_secs: u64,
    /// Best-effort warm-up timeout. Warm-up failure never fails a candidate.
    pub warmup_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssetsConfig {
    /// Paths that must all resolve, on top of at least one detector
    /// variant, for `AssetChecker::check` to pass.
    pub required: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DetectConfig {
    /// Minimum interval between two inference calls. Display cadence is
    /// decoupled from inference cadence; ~66-100ms gives 10-15 inferences
    /// per second.
    pub min_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheSettings {
    /// Cache generation tag. Bumping it is the sole upgrade mechanism:
    /// activation deletes every store tagged with another version.
    pub version: String,
    /// Filesystem root for the cache stores.
    pub dir: PathBuf,
    /// Shell manifest: small critical paths fully pre-populated at install.
    pub shell_manifest: Vec<String>,
    /// URL prefixes classified as runtime-cacheable (model files, build
    /// output).
    pub runtime_prefixes: Vec<String>,
    /// Cached fallback for failed navigations.
    pub root_document: String,
    /// Upstream origin the intercept endpoint proxies to.
    pub upstream: String,
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn default_path() -> &'static str {
        "config.toml"
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                intercept_port: 8787,
                origin: "http://localhost:3000".to_string(),
            },
            camera: CameraConfig {
                width: 1280,
                height: 720,
                fps: 30,
                facing: "user".to_string(),
            },
            engine: EngineSettings {
                local_model_dir: PathBuf::from("models"),
                remote_model_base: None,
                detector_variants: vec![
                    "scrfd_500m_kps.onnx".to_string(),
                    "scrfd_10g_kps.onnx".to_string(),
                ],
                backends: vec!["CPU".to_string()],
                age_model: "genderage.onnx".to_string(),
                age_enabled: true,
                min_confidence: 0.2,
                init_timeout_secs: 10,
                warmup_timeout_secs: 4,
            },
            assets: AssetsConfig {
                required: vec!["genderage.onnx".to_string()],
            },
            detect: DetectConfig {
                min_interval_ms: 100,
            },
            cache: CacheSettings {
                version: "v1".to_string(),
                dir: PathBuf::from("data/cache"),
                shell_manifest: vec![
                    "/".to_string(),
                    "/manifest.webmanifest".to_string(),
                    "/icons/icon-192.png".to_string(),
                    "/icons/icon-512.png".to_string(),
                ],
                runtime_prefixes: vec!["/models/".to_string(), "/static/".to_string()],
                root_document: "/".to_string(),
                upstream: "http://localhost:3000".to_string(),
            },
        }
    }
}
