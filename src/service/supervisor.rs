//! Session supervisor
//!
//! Drives the full bring-up sequence: asset check, engine fallback
//! chain, camera start, then the detection loop. The engine is loaded
//! once and reused across camera restarts and device switches; camera
//! failures leave the loaded engine untouched so a retry is cheap.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tracing::info;

use crate::assets::AssetChecker;
use crate::camera::{CameraDevice, CameraSession};
use crate::config::DetectConfig;
use crate::detect::{self, LoopHandle};
use crate::engine::{EngineLoader, InferenceEngine};
use crate::error::Error;

use super::types::DetectionResult;

/// Externally visible session state, published over a watch channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceStatus {
    Idle,
    CheckingAssets,
    LoadingEngine,
    StartingCamera,
    Running { width: u32, height: u32 },
    Stopped,
    Error { message: String, retryable: bool },
}

/// Live handles for one started session.
pub struct SessionInfo {
    pub width: u32,
    pub height: u32,
    pub results: watch::Receiver<Option<DetectionResult>>,
    pub fps: watch::Receiver<f64>,
    /// Last transient detection failure, cleared by the next success.
    pub errors: watch::Receiver<Option<String>>,
}

pub struct Supervisor {
    assets: AssetChecker,
    loader: EngineLoader,
    camera: Arc<CameraSession>,
    min_interval: Duration,
    engine: Mutex<Option<Arc<dyn InferenceEngine>>>,
    loop_handle: Mutex<Option<LoopHandle>>,
    status: watch::Sender<ServiceStatus>,
    // Held so transitions published before anyone subscribes are retained.
    status_rx: watch::Receiver<ServiceStatus>,
}

impl Supervisor {
    pub fn new(
        assets: AssetChecker,
        loader: EngineLoader,
        camera: Arc<CameraSession>,
        detect: &DetectConfig,
    ) -> Self {
        let (status, status_rx) = watch::channel(ServiceStatus::Idle);
        Self {
            assets,
            loader,
            camera,
            min_interval: Duration::from_millis(detect.min_interval_ms),
            engine: Mutex::new(None),
            loop_handle: Mutex::new(None),
            status,
            status_rx,
        }
    }

    pub fn status(&self) -> watch::Receiver<ServiceStatus> {
        self.status_rx.clone()
    }

    /// Bring-up progress of the engine fallback chain.
    pub fn engine_status(&self) -> watch::Receiver<crate::engine::LoadStatus> {
        self.loader.status()
    }

    /// Start (or restart) a session on the given device. The previous
    /// detection loop is fully stopped before the camera switches.
    pub async fn start(&self, device: Option<u32>) -> Result<SessionInfo, Error> {
        let engine = match self.ensure_engine().await {
            Ok(engine) => engine,
            Err(err) => return Err(self.fail(err)),
        };

        if let Some(handle) = self.loop_handle.lock().await.take() {
            handle.shutdown().await;
        }

        let _ = self.status.send(ServiceStatus::StartingCamera);
        let (width, height) = match self.camera.start(device).await {
            Ok(dims) => dims,
            Err(err) => return Err(self.fail(err)),
        };

        let handle = detect::spawn(engine, self.camera.subscribe(), self.min_interval);
        let results = handle.results();
        let fps = handle.fps();
        let errors = handle.errors();
        *self.loop_handle.lock().await = Some(handle);

        let _ = self.status.send(ServiceStatus::Running { width, height });
        info!("session running at {width}x{height}");
        Ok(SessionInfo {
            width,
            height,
            results,
            fps,
            errors,
        })
    }

    /// Stop the loop and release the camera. Idempotent; the loaded
    /// engine is kept for the next start.
    pub async fn stop(&self) {
        if let Some(handle) = self.loop_handle.lock().await.take() {
            handle.shutdown().await;
        }
        self.camera.stop().await;
        let _ = self.status.send(ServiceStatus::Stopped);
    }

    /// Restart the session on another capture device.
    pub async fn switch_device(&self, device: u32) -> Result<SessionInfo, Error> {
        self.start(Some(device)).await
    }

    pub async fn list_devices(&self) -> Result<Vec<CameraDevice>, Error> {
        self.camera.list_devices().await
    }

    async fn ensure_engine(&self) -> Result<Arc<dyn InferenceEngine>, Error> {
        let mut guard = self.engine.lock().await;
        if let Some(engine) = guard.as_ref() {
            return Ok(engine.clone());
        }

        let _ = self.status.send(ServiceStatus::CheckingAssets);
        let report = self.assets.ensure_viable().await?;
        info!(
            "assets viable: {} detector variant(s) available",
            report.available_variants.len()
        );

        let _ = self.status.send(ServiceStatus::LoadingEngine);
        let engine = self.loader.load().await?;
        *guard = Some(engine.clone());
        Ok(engine)
    }

    fn fail(&self, err: Error) -> Error {
        let retryable = matches!(
            err,
            Error::PermissionDenied
                | Error::DeviceBusy
                | Error::DeviceNotFound
                | Error::ConstraintsUnsatisfiable
        );
        let _ = self.status.send(ServiceStatus::Error {
            message: err.user_message(),
            retryable,
        });
        err
    }
}
