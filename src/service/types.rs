//! Service layer types

use serde::{Deserialize, Serialize};

use crate::engine::Detection;

/// The face the UI presents, condensed from a full detection pass.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PrimaryFace {
    /// `[x, y, width, height]` in frame coordinates.
    pub bounds: [f32; 4],
    /// Age in whole years, absent when the age model did not run.
    pub age: Option<u32>,
    /// Detector score clamped to `[0, 1]`.
    pub confidence: f32,
}

/// One published detection result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DetectionResult {
    /// The most prominent face, by box area. `None` when no face passed
    /// the confidence threshold.
    pub face: Option<PrimaryFace>,
    pub faces_total: usize,
    pub inference_time_ms: f64,
}

impl DetectionResult {
    pub fn from_detection(detection: &Detection) -> Self {
        let primary = detection
            .faces
            .iter()
            .max_by(|a, b| {
                let area_a = a.bounds[2] * a.bounds[3];
                let area_b = b.bounds[2] * b.bounds[3];
                area_a.total_cmp(&area_b)
            })
            .map(|face| PrimaryFace {
                bounds: face.bounds,
                age: face.age.map(|a| a.round() as u32),
                confidence: face.score.clamp(0.0, 1.0),
            });

        Self {
            face: primary,
            faces_total: detection.faces.len(),
            inference_time_ms: detection.inference_time_ms,
        }
    }
}
