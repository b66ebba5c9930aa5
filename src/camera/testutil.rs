//! Scripted camera backend for lifecycle tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::error::Error;

use super::backend::{CameraBackend, OpenStream, StreamHandle, StreamRequest};
use super::{CameraDevice, Frame};

fn clone_error(err: &Error) -> Error {
    match err {
        Error::PermissionDenied => Error::PermissionDenied,
        Error::DeviceNotFound => Error::DeviceNotFound,
        Error::DeviceBusy => Error::DeviceBusy,
        Error::ConstraintsUnsatisfiable => Error::ConstraintsUnsatisfiable,
        other => Error::Camera(other.to_string()),
    }
}

/// A backend whose streams are plain threads ticking a stop flag, so
/// open/stop ordering and leak checks behave like the real thing.
pub struct FakeBackend {
    requests: Mutex<Vec<StreamRequest>>,
    failures: Mutex<Vec<Error>>,
    negotiated: Mutex<Option<(u32, u32)>>,
    frame: Mutex<Option<Frame>>,
    live: Arc<AtomicUsize>,
    devices: Mutex<Vec<CameraDevice>>,
    label_after_open: Mutex<Option<String>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
            failures: Mutex::new(Vec::new()),
            negotiated: Mutex::new(None),
            frame: Mutex::new(None),
            live: Arc::new(AtomicUsize::new(0)),
            devices: Mutex::new(vec![CameraDevice {
                index: 0,
                label: "Fake Camera".to_string(),
                facing: None,
            }]),
            label_after_open: Mutex::new(None),
        }
    }

    /// Resolution the fake driver negotiates regardless of preferences.
    pub fn set_negotiated(&self, width: u32, height: u32) {
        *self.negotiated.lock() = Some((width, height));
    }

    /// Queue `count` failures for the next open attempts.
    pub fn fail_next_opens(&self, count: usize, err: Error) {
        let mut failures = self.failures.lock();
        for _ in 0..count {
            failures.push(clone_error(&err));
        }
    }

    /// Frame repeatedly published by every opened stream.
    pub fn publish_frame(&self, frame: Frame) {
        *self.frame.lock() = Some(frame);
    }

    pub fn set_devices(&self, devices: Vec<CameraDevice>) {
        *self.devices.lock() = devices;
    }

    /// Simulate a platform that only reveals labels once a stream has
    /// been granted: unlabeled devices pick this label up on open.
    pub fn label_after_open(&self, label: &str) {
        *self.label_after_open.lock() = Some(label.to_string());
    }

    pub fn open_requests(&self) -> Vec<StreamRequest> {
        self.requests.lock().clone()
    }

    pub fn live_streams(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

impl CameraBackend for FakeBackend {
    fn list_devices(&self) -> Result<Vec<CameraDevice>, Error> {
        Ok(self.devices.lock().clone())
    }

    fn open(
        &self,
        request: &StreamRequest,
        stop: Arc<AtomicBool>,
        frames: watch::Sender<Option<Arc<Frame>>>,
    ) -> Result<OpenStream, Error> {
        self.requests.lock().push(request.clone());
        if let Some(err) = self.failures.lock().pop() {
            return Err(err);
        }
        if let Some(label) = self.label_after_open.lock().take() {
            for device in self.devices.lock().iter_mut() {
                if device.label.is_empty() {
                    device.label = label.clone();
                }
            }
        }

        let (width, height) = self
            .negotiated
            .lock()
            .unwrap_or((request.width, request.height));
        let frame = self.frame.lock().clone();
        let live = self.live.clone();
        live.fetch_add(1, Ordering::SeqCst);

        let join = std::thread::spawn(move || {
            while !stop.load(Ordering::SeqCst) {
                if let Some(ref frame) = frame {
                    if frames.send(Some(Arc::new(frame.clone()))).is_err() {
                        break;
                    }
                }
                std::thread::sleep(Duration::from_millis(1));
            }
            let _ = frames.send(None);
            live.fetch_sub(1, Ordering::SeqCst);
        });

        Ok(OpenStream {
            width,
            height,
            handle: StreamHandle::new(join),
        })
    }
}
