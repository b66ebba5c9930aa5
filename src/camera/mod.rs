//! Camera session lifecycle
//!
//! A session owns at most one live stream. Starting always tears down
//! the previous stream first, so rapid device switching can never leak
//! a capture thread, and a constrained open gets one degraded retry
//! before the failure is surfaced.

pub mod backend;

#[cfg(test)]
pub(crate) mod testutil;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::CameraConfig;
use crate::error::Error;

pub use backend::{CameraBackend, NokhwaBackend, OpenStream, StreamHandle, StreamRequest};

/// One decoded camera frame, RGB8 row-major.
#[derive(Debug, Clone)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub rgb: Vec<u8>,
}

/// Which way a device points, when the platform reveals it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Facing {
    Front,
    Back,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraDevice {
    pub index: u32,
    pub label: String,
    pub facing: Option<Facing>,
}

/// Receiver side of the live frame feed. `None` means no stream is
/// currently producing.
pub type FrameSource = watch::Receiver<Option<Arc<Frame>>>;

/// Camera access requires an origin that is either encrypted or local.
pub fn ensure_secure_origin(origin: &str) -> Result<(), Error> {
    if origin.starts_with("https://") {
        return Ok(());
    }
    if let Some(rest) = origin.strip_prefix("http://") {
        let host = rest.split([':', '/']).next().unwrap_or("");
        if matches!(host, "localhost" | "127.0.0.1" | "[::1]") {
            return Ok(());
        }
    }
    Err(Error::InsecureContext {
        origin: origin.to_string(),
    })
}

struct ActiveStream {
    stop: Arc<AtomicBool>,
    handle: StreamHandle,
    device: Option<u32>,
    width: u32,
    height: u32,
}

pub struct CameraSession {
    backend: Arc<dyn CameraBackend>,
    config: CameraConfig,
    origin: String,
    frames: watch::Sender<Option<Arc<Frame>>>,
    // Held so the feed never closes between subscribers.
    frames_rx: FrameSource,
    active: Mutex<Option<ActiveStream>>,
}

impl CameraSession {
    pub fn new(backend: Arc<dyn CameraBackend>, config: &CameraConfig, origin: &str) -> Self {
        let (frames, frames_rx) = watch::channel(None);
        Self {
            backend,
            config: config.clone(),
            origin: origin.to_string(),
            frames,
            frames_rx,
            active: Mutex::new(None),
        }
    }

    /// Subscribe to the live frame feed. The feed survives stream
    /// restarts; subscribers see `None` between streams.
    pub fn subscribe(&self) -> FrameSource {
        self.frames_rx.clone()
    }

    pub fn current_device(&self) -> Option<u32> {
        self.active.lock().as_ref().and_then(|s| s.device)
    }

    /// Start capturing, replacing any live stream. Returns the
    /// negotiated resolution; frames are flowing by the time it does.
    pub async fn start(&self, device: Option<u32>) -> Result<(u32, u32), Error> {
        ensure_secure_origin(&self.origin)?;
        self.stop().await;

        let request = StreamRequest {
            device,
            width: self.config.width,
            height: self.config.height,
            fps: self.config.fps,
            minimal: false,
        };

        match self.open(request.clone()).await {
            Ok(dims) => Ok(dims),
            Err(err) if err.is_retryable_open() => {
                warn!("constrained camera open failed ({err}), retrying without preferences");
                self.open(StreamRequest {
                    minimal: true,
                    ..request
                })
                .await
            }
            Err(err) => Err(err),
        }
    }

    async fn open(&self, request: StreamRequest) -> Result<(u32, u32), Error> {
        let stop = Arc::new(AtomicBool::new(false));
        let backend = self.backend.clone();
        let frames = self.frames.clone();
        let thread_stop = stop.clone();
        let device = request.device;

        let stream = tokio::task::spawn_blocking(move || {
            backend.open(&request, thread_stop, frames)
        })
        .await
        .map_err(|e| Error::Camera(e.to_string()))??;

        let dims = (stream.width, stream.height);
        *self.active.lock() = Some(ActiveStream {
            stop,
            handle: stream.handle,
            device,
            width: stream.width,
            height: stream.height,
        });
        info!("camera session started at {}x{}", dims.0, dims.1);
        Ok(dims)
    }

    /// Stop the live stream, if any. Idempotent; the capture thread has
    /// fully exited when this returns. The join happens off the runtime
    /// so a slow final frame read cannot stall a worker.
    pub async fn stop(&self) {
        let stream = self.active.lock().take();
        if let Some(stream) = stream {
            stream.stop.store(true, Ordering::SeqCst);
            let (width, height) = (stream.width, stream.height);
            let handle = stream.handle;
            let _ = tokio::task::spawn_blocking(move || handle.join()).await;
            info!("camera session stopped ({width}x{height})");
        }
    }

    fn stop_blocking(&self) {
        if let Some(stream) = self.active.lock().take() {
            stream.stop.store(true, Ordering::SeqCst);
            stream.handle.join();
            info!("camera session stopped ({}x{})", stream.width, stream.height);
        }
    }

    pub fn is_running(&self) -> bool {
        self.active.lock().is_some()
    }

    /// Enumerate capture devices. Platforms that withhold labels until a
    /// stream has been granted get one open-and-release of the default
    /// device to unlock them; if that grant fails the unlabeled entries
    /// are returned as-is.
    pub async fn list_devices(&self) -> Result<Vec<CameraDevice>, Error> {
        let devices = self.enumerate().await?;
        if devices.iter().any(|d| d.label.is_empty()) && !self.is_running() {
            if let Err(err) = self.warmup_grant().await {
                debug!("permission warm-up failed: {err}");
                return Ok(devices);
            }
            return self.enumerate().await;
        }
        Ok(devices)
    }

    async fn enumerate(&self) -> Result<Vec<CameraDevice>, Error> {
        let backend = self.backend.clone();
        tokio::task::spawn_blocking(move || backend.list_devices())
            .await
            .map_err(|e| Error::Camera(e.to_string()))?
    }

    /// Open and immediately release the default device, purely so the
    /// platform associates a grant with this process.
    async fn warmup_grant(&self) -> Result<(), Error> {
        let backend = self.backend.clone();
        let stop = Arc::new(AtomicBool::new(false));
        let (frames, _keepalive) = watch::channel(None);
        let request = StreamRequest {
            device: None,
            width: self.config.width,
            height: self.config.height,
            fps: self.config.fps,
            minimal: true,
        };

        let thread_stop = stop.clone();
        let stream = tokio::task::spawn_blocking(move || {
            backend.open(&request, thread_stop, frames)
        })
        .await
        .map_err(|e| Error::Camera(e.to_string()))??;

        stop.store(true, Ordering::SeqCst);
        let handle = stream.handle;
        let _ = tokio::task::spawn_blocking(move || handle.join()).await;
        Ok(())
    }
}

impl Drop for CameraSession {
    fn drop(&mut self) {
        self.stop_blocking();
    }
}
