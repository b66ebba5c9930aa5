//! Camera capture backends
//!
//! The [`CameraBackend`] trait is the seam between session lifecycle
//! logic and the capture hardware. The production backend drives a
//! `nokhwa` camera from a dedicated thread, publishing decoded frames
//! into a watch channel so consumers always see the latest frame only.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};

use nokhwa::{
    pixel_format::RgbFormat,
    query,
    utils::{ApiBackend, CameraIndex, RequestedFormat, RequestedFormatType, Resolution},
    Camera,
};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::Error;

use super::{CameraDevice, Facing, Frame};

/// What a stream open should aim for. `width`/`height`/`fps` are
/// preferences, not mandates; the driver keeps the last word. `minimal`
/// drops even the preferences for the degraded retry.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub device: Option<u32>,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub minimal: bool,
}

/// Joins the capture thread once its stop flag is raised.
pub struct StreamHandle {
    join: Option<std::thread::JoinHandle<()>>,
}

impl StreamHandle {
    pub(crate) fn new(join: std::thread::JoinHandle<()>) -> Self {
        Self { join: Some(join) }
    }

    pub fn join(mut self) {
        if let Some(handle) = self.join.take() {
            let _ = handle.join();
        }
    }
}

/// An opened stream with the resolution the driver actually negotiated.
pub struct OpenStream {
    pub width: u32,
    pub height: u32,
    pub handle: StreamHandle,
}

/// Blocking capture seam. `open` must not return before the negotiated
/// format is known; frames begin flowing into `frames` immediately after.
pub trait CameraBackend: Send + Sync + 'static {
    fn list_devices(&self) -> Result<Vec<CameraDevice>, Error>;

    fn open(
        &self,
        request: &StreamRequest,
        stop: Arc<AtomicBool>,
        frames: watch::Sender<Option<Arc<Frame>>>,
    ) -> Result<OpenStream, Error>;
}

#[derive(Default)]
pub struct NokhwaBackend;

impl NokhwaBackend {
    pub fn new() -> Self {
        Self
    }
}

/// Drivers encode the facing, when they know it, in the device label.
fn infer_facing(label: &str) -> Option<Facing> {
    let lower = label.to_lowercase();
    if lower.contains("front") {
        Some(Facing::Front)
    } else if lower.contains("back") || lower.contains("rear") {
        Some(Facing::Back)
    } else {
        None
    }
}

fn map_camera_error(err: &nokhwa::NokhwaError) -> Error {
    let message = err.to_string();
    let lower = message.to_lowercase();
    if lower.contains("permission") || lower.contains("access denied") {
        Error::PermissionDenied
    } else if lower.contains("busy") || lower.contains("in use") {
        Error::DeviceBusy
    } else if lower.contains("not found") || lower.contains("no device") {
        Error::DeviceNotFound
    } else {
        Error::Camera(message)
    }
}

impl CameraBackend for NokhwaBackend {
    fn list_devices(&self) -> Result<Vec<CameraDevice>, Error> {
        let devices = query(ApiBackend::Auto).map_err(|e| map_camera_error(&e))?;
        Ok(devices
            .iter()
            .enumerate()
            .map(|(idx, info)| {
                let label = info.human_name().to_string();
                let facing = infer_facing(&label);
                CameraDevice {
                    index: idx as u32,
                    label,
                    facing,
                }
            })
            .collect())
    }

    fn open(
        &self,
        request: &StreamRequest,
        stop: Arc<AtomicBool>,
        frames: watch::Sender<Option<Arc<Frame>>>,
    ) -> Result<OpenStream, Error> {
        let request = request.clone();
        // nokhwa cameras are not Send; the camera lives and dies on this
        // thread, and only the negotiated format crosses back.
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(u32, u32), Error>>();
        let join = std::thread::Builder::new()
            .name("camera-capture".to_string())
            .spawn(move || {
                capture_loop(request, stop, frames, ready_tx);
            })
            .map_err(|e| Error::Camera(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok((width, height))) => Ok(OpenStream {
                width,
                height,
                handle: StreamHandle::new(join),
            }),
            Ok(Err(err)) => {
                let _ = join.join();
                Err(err)
            }
            Err(_) => {
                let _ = join.join();
                Err(Error::Camera("capture thread exited before start".to_string()))
            }
        }
    }
}

fn capture_loop(
    request: StreamRequest,
    stop: Arc<AtomicBool>,
    frames: watch::Sender<Option<Arc<Frame>>>,
    ready_tx: mpsc::Sender<Result<(u32, u32), Error>>,
) {
    let index = CameraIndex::Index(request.device.unwrap_or(0));
    let format = RequestedFormat::new::<RgbFormat>(RequestedFormatType::AbsoluteHighestResolution);

    let mut camera = match Camera::new(index, format) {
        Ok(camera) => camera,
        Err(err) => {
            let _ = ready_tx.send(Err(map_camera_error(&err)));
            return;
        }
    };

    if let Err(err) = camera.open_stream() {
        let _ = ready_tx.send(Err(map_camera_error(&err)));
        return;
    }

    if !request.minimal {
        // Preferences only. A driver that cannot honor them keeps its
        // own format and we carry on.
        if let Err(err) = camera.set_resolution(Resolution::new(request.width, request.height)) {
            warn!(
                "could not set resolution {}x{}: {err}",
                request.width, request.height
            );
        }
        if let Err(err) = camera.set_frame_rate(request.fps) {
            warn!("could not set frame rate {}: {err}", request.fps);
        }
    }

    let resolution = camera.resolution();
    let (width, height) = (resolution.width(), resolution.height());
    info!(
        "camera stream open at {width}x{height} @ {} fps",
        camera.frame_rate()
    );
    if ready_tx.send(Ok((width, height))).is_err() {
        let _ = camera.stop_stream();
        return;
    }

    let mut consecutive_errors = 0u32;
    while !stop.load(Ordering::SeqCst) {
        match camera.frame().and_then(|f| f.decode_image::<RgbFormat>()) {
            Ok(decoded) => {
                consecutive_errors = 0;
                let frame = Frame {
                    width: decoded.width(),
                    height: decoded.height(),
                    rgb: decoded.into_raw(),
                };
                if frames.send(Some(Arc::new(frame))).is_err() {
                    break;
                }
            }
            Err(err) => {
                consecutive_errors += 1;
                debug!("frame capture failed: {err}");
                if consecutive_errors > 30 {
                    warn!("camera produced {consecutive_errors} consecutive errors, stopping");
                    break;
                }
            }
        }
    }

    if let Err(err) = camera.stop_stream() {
        warn!("failed to stop camera stream: {err}");
    }
    let _ = frames.send(None);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_facing_inferred_from_label() {
        assert_eq!(infer_facing("Front Camera"), Some(Facing::Front));
        assert_eq!(infer_facing("rear camera"), Some(Facing::Back));
        assert_eq!(infer_facing("Integrated Webcam"), None);
    }

    #[test]
    #[ignore] // Requires actual webcam hardware
    fn test_list_devices() {
        let backend = NokhwaBackend::new();
        let devices = backend.list_devices().expect("failed to list devices");
        for device in devices {
            println!("  [{}] {}", device.index, device.label);
        }
    }
}
