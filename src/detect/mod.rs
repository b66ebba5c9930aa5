//! Throttled detection loop
//!
//! Frame arrival drives the loop; a minimum interval gates how often a
//! frame actually reaches the engine, decoupling inference cadence from
//! capture cadence. A failed inference is logged and skipped, never
//! terminating the loop, and a stop request discards whatever inference
//! was in flight.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::camera::FrameSource;
use crate::engine::InferenceEngine;
use crate::error::Error;
use crate::service::types::DetectionResult;

/// Inference throughput over rolling one-second windows.
pub struct FpsCounter {
    count: u32,
    window_start: Instant,
}

impl FpsCounter {
    pub fn new() -> Self {
        Self {
            count: 0,
            window_start: Instant::now(),
        }
    }

    /// Record one inference. Returns the rate when a window closes.
    pub fn tick(&mut self) -> Option<f64> {
        self.count += 1;
        let elapsed = self.window_start.elapsed();
        if elapsed >= Duration::from_secs(1) {
            let rate = self.count as f64 / elapsed.as_secs_f64();
            self.count = 0;
            self.window_start = Instant::now();
            Some(rate)
        } else {
            None
        }
    }
}

impl Default for FpsCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Running detection loop. Dropping the handle does not stop the loop;
/// call [`stop`](LoopHandle::stop).
pub struct LoopHandle {
    running: Arc<AtomicBool>,
    results: watch::Receiver<Option<DetectionResult>>,
    fps: watch::Receiver<f64>,
    errors: watch::Receiver<Option<String>>,
    join: tokio::task::JoinHandle<()>,
}

impl LoopHandle {
    pub fn results(&self) -> watch::Receiver<Option<DetectionResult>> {
        self.results.clone()
    }

    pub fn fps(&self) -> watch::Receiver<f64> {
        self.fps.clone()
    }

    /// Last transient detection failure, cleared by the next success.
    pub fn errors(&self) -> watch::Receiver<Option<String>> {
        self.errors.clone()
    }

    /// Request a stop. Any in-flight inference result is discarded.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) && !self.join.is_finished()
    }

    /// Stop and wait for the loop task to exit.
    pub async fn shutdown(self) {
        self.stop();
        let _ = self.join.await;
    }
}

/// Spawn the loop over a frame feed. Results are published over a watch
/// channel so slow consumers only ever see the latest.
pub fn spawn(
    engine: Arc<dyn InferenceEngine>,
    frames: FrameSource,
    min_interval: Duration,
) -> LoopHandle {
    let running = Arc::new(AtomicBool::new(true));
    let (results_tx, results_rx) = watch::channel(None);
    let (fps_tx, fps_rx) = watch::channel(0.0);
    let (errors_tx, errors_rx) = watch::channel(None);

    let flag = running.clone();
    let join = tokio::spawn(async move {
        run_loop(engine, frames, min_interval, flag, results_tx, fps_tx, errors_tx).await;
    });

    LoopHandle {
        running,
        results: results_rx,
        fps: fps_rx,
        errors: errors_rx,
        join,
    }
}

async fn run_loop(
    engine: Arc<dyn InferenceEngine>,
    mut frames: FrameSource,
    min_interval: Duration,
    running: Arc<AtomicBool>,
    results: watch::Sender<Option<DetectionResult>>,
    fps: watch::Sender<f64>,
    errors: watch::Sender<Option<String>>,
) {
    let mut counter = FpsCounter::new();
    let mut last_inference: Option<Instant> = None;

    info!("detection loop started (min interval {min_interval:?})");
    while running.load(Ordering::SeqCst) {
        if frames.changed().await.is_err() {
            debug!("frame feed closed, detection loop exiting");
            break;
        }
        let frame = match frames.borrow_and_update().clone() {
            Some(frame) => frame,
            None => continue,
        };
        if !running.load(Ordering::SeqCst) {
            break;
        }

        // Newer frames that arrive inside the gate refresh the preview
        // but never trigger inference.
        if let Some(last) = last_inference {
            if last.elapsed() < min_interval {
                continue;
            }
        }
        last_inference = Some(Instant::now());

        match engine.detect(&frame).await {
            Ok(detection) => {
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                let _ = results.send(Some(DetectionResult::from_detection(&detection)));
                if let Some(rate) = counter.tick() {
                    let _ = fps.send(rate);
                }
                if errors.borrow().is_some() {
                    let _ = errors.send(None);
                }
            }
            Err(err) => {
                warn!("detection failed on one frame, continuing: {err:#}");
                let message =
                    Error::DetectionTransient(format!("{err:#}")).user_message();
                let _ = errors.send(Some(message));
            }
        }
    }
    info!("detection loop stopped");
}
