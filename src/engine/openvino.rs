//! OpenVINO engine candidate
//!
//! Runs SCRFD face detection plus an optional InsightFace age model on
//! one compute backend. Model compilation happens in `initialize` so a
//! broken candidate fails there, inside the loader's timeout, and never
//! at construction.

use std::ops::Deref;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use image::DynamicImage;
use ndarray::Array4;
use openvino::{CompiledModel, Core, ElementType, InferRequest, Shape, Tensor};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::camera::Frame;

use super::preprocess::{
    crop_face, frame_to_image, preprocess_for_age, preprocess_for_detection, ResizeInfo,
    DETECTOR_INPUT_SIZE,
};
use super::{Detection, EngineConfig, EngineFactory, FaceObservation, InferenceEngine};

/// Wrapper for OpenVINO Core that implements Send + Sync
pub struct SafeCore(Core);
unsafe impl Send for SafeCore {}
unsafe impl Sync for SafeCore {}

impl Deref for SafeCore {
    type Target = Core;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::ops::DerefMut for SafeCore {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// Wrapper for OpenVINO CompiledModel that implements Send + Sync
#[derive(Clone)]
pub struct SafeCompiledModel(pub Arc<CompiledModel>);
unsafe impl Send for SafeCompiledModel {}
unsafe impl Sync for SafeCompiledModel {}

impl SafeCompiledModel {
    /// Create an inference request. The C++ CompiledModel is thread-safe
    /// but the Rust bindings require `&mut self`; bypass that here.
    pub fn create_infer_request(&self) -> Result<InferRequest> {
        unsafe {
            let ptr = Arc::as_ptr(&self.0) as *mut CompiledModel;
            (*ptr).create_infer_request().map_err(|e| e.into())
        }
    }
}

struct LoadedModels {
    detector: SafeCompiledModel,
    age: Option<SafeCompiledModel>,
}

pub struct OpenVinoEngine {
    config: EngineConfig,
    core: Arc<RwLock<SafeCore>>,
    models: RwLock<Option<LoadedModels>>,
    nms_threshold: f32,
}

impl OpenVinoEngine {
    pub fn new(config: EngineConfig, core: Arc<RwLock<SafeCore>>) -> Self {
        Self {
            config,
            core,
            models: RwLock::new(None),
            nms_threshold: 0.4,
        }
    }
}

#[async_trait]
impl InferenceEngine for OpenVinoEngine {
    fn config(&self) -> &EngineConfig {
        &self.config
    }

    async fn initialize(&self) -> Result<()> {
        let core = self.core.clone();
        let detector_path = self.config.model_dir.join(&self.config.variant);
        let age_path = self.config.model_dir.join(&self.config.age_model);
        let backend = self.config.backend.clone();
        let age_enabled = self.config.age_enabled;
        let label = self.config.describe();

        let loaded = tokio::task::spawn_blocking(move || -> Result<LoadedModels> {
            let start = Instant::now();
            let mut core = core.write();

            let detector_file = detector_path
                .to_str()
                .ok_or_else(|| anyhow!("non-utf8 model path"))?;
            let model = core
                .read_model_from_file(detector_file, "")
                .with_context(|| format!("failed to read detector model {detector_file}"))?;
            let detector = core
                .compile_model(&model, backend.as_str().into())
                .with_context(|| format!("failed to compile detector on {backend}"))?;
            let detector = SafeCompiledModel(Arc::new(detector));

            // A broken age model narrows features rather than failing
            // the candidate.
            let age = if age_enabled {
                let age_file = age_path
                    .to_str()
                    .ok_or_else(|| anyhow!("non-utf8 model path"))?;
                match core
                    .read_model_from_file(age_file, "")
                    .and_then(|m| core.compile_model(&m, backend.as_str().into()))
                {
                    Ok(compiled) => Some(SafeCompiledModel(Arc::new(compiled))),
                    Err(err) => {
                        warn!("age model unavailable, continuing without ages: {err}");
                        None
                    }
                }
            } else {
                None
            };

            info!("engine {label} compiled in {:?}", start.elapsed());
            Ok(LoadedModels { detector, age })
        })
        .await??;

        *self.models.write() = Some(loaded);
        Ok(())
    }

    async fn warmup(&self) -> Result<()> {
        let (w, h) = DETECTOR_INPUT_SIZE;
        let frame = Frame {
            width: w,
            height: h,
            rgb: vec![127; (w * h * 3) as usize],
        };
        self.detect(&frame).await.map(|_| ())
    }

    async fn detect(&self, frame: &Frame) -> Result<Detection> {
        let (detector, age) = {
            let guard = self.models.read();
            let models = guard
                .as_ref()
                .ok_or_else(|| anyhow!("engine not initialized"))?;
            (models.detector.clone(), models.age.clone())
        };
        let frame = frame.clone();
        let min_confidence = self.config.min_confidence;
        let nms_threshold = self.nms_threshold;

        tokio::task::spawn_blocking(move || {
            run_detection(&detector, age.as_ref(), &frame, min_confidence, nms_threshold)
        })
        .await?
    }
}

fn run_detection(
    detector: &SafeCompiledModel,
    age: Option<&SafeCompiledModel>,
    frame: &Frame,
    min_confidence: f32,
    nms_threshold: f32,
) -> Result<Detection> {
    let start = Instant::now();

    let image = frame_to_image(frame)?;
    let resize_info = ResizeInfo::new((frame.width, frame.height), DETECTOR_INPUT_SIZE);
    let input = preprocess_for_detection(&image)?;

    let mut request = detector.create_infer_request()?;
    set_f32_input(&mut request, &input)?;
    request.infer()?;

    let boxes = decode_scrfd(&request, min_confidence, &resize_info)?;
    let boxes = nms(boxes, nms_threshold);
    debug!("detected {} faces after NMS", boxes.len());

    let mut faces = Vec::with_capacity(boxes.len());
    for raw in boxes {
        let bounds = [raw.x1, raw.y1, raw.x2 - raw.x1, raw.y2 - raw.y1];
        let age_years = age.and_then(|model| {
            match estimate_age(model, &image, bounds) {
                Ok(age) => age,
                Err(err) => {
                    debug!("age estimation failed: {err:#}");
                    None
                }
            }
        });
        faces.push(FaceObservation {
            bounds,
            score: raw.score,
            age: age_years,
        });
    }

    Ok(Detection {
        faces,
        inference_time_ms: start.elapsed().as_secs_f64() * 1000.0,
    })
}

fn estimate_age(
    model: &SafeCompiledModel,
    image: &DynamicImage,
    bounds: [f32; 4],
) -> Result<Option<f32>> {
    let face = crop_face(image, bounds, 0.25);
    let input = preprocess_for_age(&face)?;

    let mut request = model.create_infer_request()?;
    set_f32_input(&mut request, &input)?;
    request.infer()?;

    let output = request.get_output_tensor()?;
    let data = read_tensor_f32(&output)?;
    Ok(decode_age(&data))
}

/// Decode the InsightFace age head. Two known layouts:
/// `[female_logit, male_logit, age_scale]` where age is `age_scale * 100`,
/// and `[gender_val, age_factor]` where the age factor may already be in
/// years.
fn decode_age(output: &[f32]) -> Option<f32> {
    let age = match output.len() {
        3 => output[2] * 100.0,
        2 => {
            let factor = output[1];
            if factor > 1.0 && factor < 120.0 {
                factor
            } else {
                factor * 100.0
            }
        }
        len => {
            warn!("unexpected age model output length: {len}");
            return None;
        }
    };
    Some(age.clamp(1.0, 100.0))
}

#[derive(Debug, Clone)]
struct RawBox {
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
    score: f32,
}

/// Parse SCRFD outputs: per-stride score, bbox and optional keypoint
/// tensors in distance format. Keypoints are ignored.
fn decode_scrfd(
    request: &InferRequest,
    min_confidence: f32,
    resize_info: &ResizeInfo,
) -> Result<Vec<RawBox>> {
    let mut output_count = 0;
    for i in 0..20 {
        if request.get_output_tensor_by_index(i).is_ok() {
            output_count += 1;
        } else {
            break;
        }
    }

    let (fmc, num_anchors) = match output_count {
        6 | 9 => (3, 2),
        10 | 15 => (5, 1),
        _ => {
            warn!("unknown SCRFD output count {output_count}, assuming 3 strides");
            (3, 2)
        }
    };
    let strides: &[i32] = if fmc == 3 {
        &[8, 16, 32]
    } else {
        &[8, 16, 32, 64, 128]
    };

    let (input_w, input_h) = (DETECTOR_INPUT_SIZE.0 as i32, DETECTOR_INPUT_SIZE.1 as i32);
    let mut all_boxes = Vec::new();

    for (idx, &stride) in strides.iter().enumerate() {
        let scores = read_tensor_f32(&request.get_output_tensor_by_index(idx)?)?;
        let bboxes = read_tensor_f32(&request.get_output_tensor_by_index(idx + fmc)?)?;

        let feat_w = input_w / stride;
        let feat_h = input_h / stride;

        let mut anchor = 0usize;
        'grid: for y in 0..feat_h {
            for x in 0..feat_w {
                let cx = x as f32 * stride as f32;
                let cy = y as f32 * stride as f32;
                for _ in 0..num_anchors {
                    let i = anchor;
                    anchor += 1;
                    if i >= scores.len() {
                        break 'grid;
                    }
                    let score = scores[i];
                    if score < min_confidence {
                        continue;
                    }
                    let bbox_idx = i * 4;
                    if bbox_idx + 3 >= bboxes.len() {
                        continue;
                    }

                    // Distances from the anchor center, in stride units.
                    let x1 = cx - bboxes[bbox_idx] * stride as f32;
                    let y1 = cy - bboxes[bbox_idx + 1] * stride as f32;
                    let x2 = cx + bboxes[bbox_idx + 2] * stride as f32;
                    let y2 = cy + bboxes[bbox_idx + 3] * stride as f32;

                    let (ox1, oy1) = resize_info.to_original(x1, y1);
                    let (ox2, oy2) = resize_info.to_original(x2, y2);
                    let max_w = resize_info.original_width as f32;
                    let max_h = resize_info.original_height as f32;

                    all_boxes.push(RawBox {
                        x1: ox1.clamp(0.0, max_w),
                        y1: oy1.clamp(0.0, max_h),
                        x2: ox2.clamp(0.0, max_w),
                        y2: oy2.clamp(0.0, max_h),
                        score,
                    });
                }
            }
        }
    }

    Ok(all_boxes)
}

/// Non-maximum suppression, highest score wins.
fn nms(mut boxes: Vec<RawBox>, threshold: f32) -> Vec<RawBox> {
    if boxes.is_empty() {
        return boxes;
    }
    boxes.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut keep = Vec::new();
    let mut suppressed = vec![false; boxes.len()];

    for i in 0..boxes.len() {
        if suppressed[i] {
            continue;
        }
        keep.push(boxes[i].clone());
        for j in (i + 1)..boxes.len() {
            if !suppressed[j] && iou(&boxes[i], &boxes[j]) > threshold {
                suppressed[j] = true;
            }
        }
    }

    keep
}

fn iou(a: &RawBox, b: &RawBox) -> f32 {
    let x1 = a.x1.max(b.x1);
    let y1 = a.y1.max(b.y1);
    let x2 = a.x2.min(b.x2);
    let y2 = a.y2.min(b.y2);

    let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let area_a = (a.x2 - a.x1) * (a.y2 - a.y1);
    let area_b = (b.x2 - b.x1) * (b.y2 - b.y1);
    let union = area_a + area_b - intersection;

    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}

fn set_f32_input(request: &mut InferRequest, data: &Array4<f32>) -> Result<()> {
    let dims: Vec<i64> = data.shape().iter().map(|d| *d as i64).collect();
    let shape = Shape::new(&dims)?;
    let mut input = Tensor::new(ElementType::F32, &shape)?;

    let slice = data
        .as_slice()
        .ok_or_else(|| anyhow!("input tensor is not contiguous"))?;
    unsafe {
        let tensor_data = input.get_raw_data_mut()?.as_mut_ptr() as *mut f32;
        std::ptr::copy_nonoverlapping(slice.as_ptr(), tensor_data, slice.len());
    }

    request.set_input_tensor(&input)?;
    Ok(())
}

fn read_tensor_f32(tensor: &Tensor) -> Result<Vec<f32>> {
    let shape = tensor.get_shape()?;
    let total: i64 = shape.get_dimensions().iter().product();

    let data = unsafe {
        let ptr = tensor.get_raw_data()?.as_ptr() as *const f32;
        std::slice::from_raw_parts(ptr, total as usize).to_vec()
    };
    Ok(data)
}

/// Shares one OpenVINO core across every candidate it constructs.
pub struct OpenVinoEngineFactory {
    core: Arc<RwLock<SafeCore>>,
}

impl OpenVinoEngineFactory {
    pub fn new() -> Result<Self> {
        let core = Core::new().context("failed to create OpenVINO core")?;
        Ok(Self {
            core: Arc::new(RwLock::new(SafeCore(core))),
        })
    }
}

impl EngineFactory for OpenVinoEngineFactory {
    fn create(&self, config: EngineConfig) -> Result<Arc<dyn InferenceEngine>> {
        Ok(Arc::new(OpenVinoEngine::new(config, self.core.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(x1: f32, y1: f32, x2: f32, y2: f32, score: f32) -> RawBox {
        RawBox { x1, y1, x2, y2, score }
    }

    #[test]
    fn test_iou_calculation() {
        let a = raw(0.0, 0.0, 10.0, 10.0, 0.9);
        let b = raw(5.0, 5.0, 15.0, 15.0, 0.8);
        // Intersection 25, union 175.
        assert!((iou(&a, &b) - 0.143).abs() < 0.01);
    }

    #[test]
    fn test_nms_suppresses_overlaps_keeps_best() {
        let boxes = vec![
            raw(0.0, 0.0, 10.0, 10.0, 0.7),
            raw(1.0, 1.0, 11.0, 11.0, 0.9),
            raw(50.0, 50.0, 60.0, 60.0, 0.8),
        ];
        let kept = nms(boxes, 0.4);
        assert_eq!(kept.len(), 2);
        assert!((kept[0].score - 0.9).abs() < 1e-6);
        assert!((kept[1].score - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_decode_age_three_output_layout() {
        // [female, male, age_scale]
        let age = decode_age(&[0.2, 0.8, 0.27]).unwrap();
        assert!((age - 27.0).abs() < 1e-3);
    }

    #[test]
    fn test_decode_age_two_output_layouts() {
        // Age factor already in years.
        assert!((decode_age(&[0.1, 34.0]).unwrap() - 34.0).abs() < 1e-3);
        // Normalized age factor.
        assert!((decode_age(&[0.1, 0.34]).unwrap() - 34.0).abs() < 1e-3);
    }

    #[test]
    fn test_decode_age_clamps_and_rejects() {
        assert!((decode_age(&[0.0, 0.0, 5.0]).unwrap() - 100.0).abs() < 1e-6);
        assert!(decode_age(&[1.0]).is_none());
    }
}
