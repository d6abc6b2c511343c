//! Text-region segmentation model behind ONNX Runtime.
//!
//! The exported model takes one `[1, 3, S, S]` float RGB tensor scaled to
//! `0..1` and returns four tensors:
//! - `boxes`  `[N, 4]` as `x1, y1, x2, y2` in input pixels
//! - `labels` `[N]` class indices (int64 or float)
//! - `scores` `[N]`
//! - `masks`  `[N, 1, H, W]` probabilities, either full-frame (`H = W = S`)
//!   or per-box (any other size, pasted into the box)

use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use image::imageops::FilterType;
use image::RgbImage;
use ndarray::{Array2, Array4, ArrayView2, ArrayViewD, Axis};
use ort::session::Session;
use ort::value::{Value, ValueType};

use crate::color_utils::symbols;
use crate::model_access::{resolve_model_path, CliModelInfo, RetryPolicy};
use crate::model_manager::ModelLoader;
use crate::onnx_session::{create_onnx_session, determine_optimal_device, DeviceSelection, SessionInfo};
use crate::region_source::{RawInstance, RawSegmentation};

/// Instances scoring below this are discarded
pub const SCORE_THRESHOLD: f32 = 0.5;

/// Input size used when the model declares a dynamic spatial shape
pub const DEFAULT_INPUT_SIZE: u32 = 1024;

pub const OUTPUT_BOXES: &str = "boxes";
pub const OUTPUT_LABELS: &str = "labels";
pub const OUTPUT_SCORES: &str = "scores";
pub const OUTPUT_MASKS: &str = "masks";

/// A model that finds text regions in an image
pub trait SegmentationModel: Send + Sync {
    fn segment(&self, image: &RgbImage) -> Result<RawSegmentation>;

    fn describe(&self) -> String {
        "segmentation model".to_string()
    }
}

/// Raw model tensors, already copied out of the session
#[derive(Debug, Clone)]
pub struct ModelOutputs {
    pub boxes: Array2<f32>,
    pub labels: Vec<i64>,
    pub scores: Vec<f32>,
    /// `[N, H, W]`
    pub masks: ndarray::Array3<f32>,
}

/// Resize to the square model input and lay out as NCHW floats in `0..1`
pub fn preprocess_image(image: &RgbImage, input_size: u32) -> Array4<f32> {
    let resized = image::imageops::resize(image, input_size, input_size, FilterType::Triangle);
    let size = input_size as usize;

    let mut input = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            input[[0, c, y as usize, x as usize]] = pixel[c] as f32 / 255.0;
        }
    }
    input
}

/// Turn model tensors into per-instance probability fields at input resolution
pub fn decode_instances(
    outputs: &ModelOutputs,
    input_size: u32,
    score_threshold: f32,
) -> Result<RawSegmentation> {
    let count = outputs.scores.len();
    if outputs.labels.len() != count
        || outputs.boxes.nrows() != count
        || outputs.masks.len_of(Axis(0)) != count
    {
        return Err(anyhow!(
            "Model outputs disagree on instance count: {} boxes, {} labels, {} scores, {} masks",
            outputs.boxes.nrows(),
            outputs.labels.len(),
            count,
            outputs.masks.len_of(Axis(0))
        ));
    }
    if outputs.boxes.ncols() != 4 && count > 0 {
        return Err(anyhow!(
            "Expected boxes with 4 coordinates, got {}",
            outputs.boxes.ncols()
        ));
    }

    let mut instances = Vec::new();
    for i in 0..count {
        let score = outputs.scores[i];
        if score < score_threshold {
            continue;
        }
        let label = outputs.labels[i];
        if label < 0 {
            return Err(anyhow!("Instance {i} has negative class index {label}"));
        }

        let mask = outputs.masks.index_axis(Axis(0), i);
        let probabilities = if mask.dim() == (input_size as usize, input_size as usize) {
            mask.to_owned()
        } else {
            let b = outputs.boxes.row(i);
            paste_box_mask(mask, [b[0], b[1], b[2], b[3]], input_size)
        };

        instances.push(RawInstance {
            probabilities,
            class_index: label as usize,
            score,
        });
    }

    log::debug!(
        "Kept {} of {count} instance(s) at score >= {score_threshold}",
        instances.len()
    );
    Ok(RawSegmentation { instances })
}

/// Place a per-box mask into a full input-size probability field
fn paste_box_mask(mask: ArrayView2<f32>, bbox: [f32; 4], input_size: u32) -> Array2<f32> {
    let size = input_size as usize;
    let mut field = Array2::<f32>::zeros((size, size));
    let (mh, mw) = mask.dim();
    if mh == 0 || mw == 0 {
        return field;
    }

    let clamp = |v: f32| v.round().clamp(0.0, input_size as f32) as usize;
    let (x1, y1, x2, y2) = (clamp(bbox[0]), clamp(bbox[1]), clamp(bbox[2]), clamp(bbox[3]));
    if x2 <= x1 || y2 <= y1 {
        return field;
    }

    let (bw, bh) = ((x2 - x1) as f32, (y2 - y1) as f32);
    for y in y1..y2 {
        let my = (((y - y1) as f32 + 0.5) / bh * mh as f32) as usize;
        for x in x1..x2 {
            let mx = (((x - x1) as f32 + 0.5) / bw * mw as f32) as usize;
            field[[y, x]] = mask[[my.min(mh - 1), mx.min(mw - 1)]];
        }
    }
    field
}

fn owned_f32(view: ArrayViewD<f32>) -> Vec<f32> {
    view.iter().copied().collect()
}

fn extract_labels(value: &Value) -> Result<Vec<i64>> {
    if let Ok(view) = value.try_extract_array::<i64>() {
        return Ok(view.iter().copied().collect());
    }
    let view = value
        .try_extract_array::<f32>()
        .map_err(|e| anyhow!("Failed to extract labels: {e}"))?;
    Ok(view.iter().map(|v| v.round() as i64).collect())
}

/// ONNX Runtime implementation of [`SegmentationModel`]
pub struct OnnxSegmenter {
    // Running a session needs `&mut`
    session: Mutex<Session>,
    input_name: String,
    input_size: u32,
    score_threshold: f32,
    info: SessionInfo,
}

impl OnnxSegmenter {
    pub fn load(model_path: &Path, device: &DeviceSelection) -> Result<Self> {
        let (session, info) = create_onnx_session(model_path, device)?;

        let input = session
            .inputs
            .first()
            .ok_or_else(|| anyhow!("Model declares no inputs"))?;
        let input_name = input.name.clone();
        let input_size = match &input.input_type {
            ValueType::Tensor { shape, .. } if shape.len() == 4 && shape[3] > 0 => shape[3] as u32,
            other => {
                log::debug!("Input shape {other:?} is dynamic; using {DEFAULT_INPUT_SIZE}");
                DEFAULT_INPUT_SIZE
            }
        };

        for required in [OUTPUT_BOXES, OUTPUT_LABELS, OUTPUT_SCORES, OUTPUT_MASKS] {
            if !session.outputs.iter().any(|o| o.name == required) {
                return Err(anyhow!("Model is missing output '{required}'"));
            }
        }

        log::debug!("Input: {input_name}, size {input_size}x{input_size}");
        Ok(Self {
            session: Mutex::new(session),
            input_name,
            input_size,
            score_threshold: SCORE_THRESHOLD,
            info,
        })
    }

    fn run(&self, input: Array4<f32>) -> Result<ModelOutputs> {
        let input_value =
            Value::from_array(input).map_err(|e| anyhow!("Failed to create input value: {e}"))?;

        let mut session = self
            .session
            .lock()
            .map_err(|_| anyhow!("Inference session lock poisoned"))?;
        let outputs = session
            .run(ort::inputs![self.input_name.as_str() => &input_value])
            .map_err(|e| anyhow!("Failed to run inference: {e}"))?;

        let boxes = outputs[OUTPUT_BOXES]
            .try_extract_array::<f32>()
            .map_err(|e| anyhow!("Failed to extract boxes: {e}"))?;
        let scores = outputs[OUTPUT_SCORES]
            .try_extract_array::<f32>()
            .map_err(|e| anyhow!("Failed to extract scores: {e}"))?;
        let masks = outputs[OUTPUT_MASKS]
            .try_extract_array::<f32>()
            .map_err(|e| anyhow!("Failed to extract masks: {e}"))?;
        let labels = extract_labels(&outputs[OUTPUT_LABELS])?;

        let count = scores.len();
        let boxes = Array2::from_shape_vec((count, 4), owned_f32(boxes.view()))
            .map_err(|e| anyhow!("Unexpected boxes shape: {e}"))?;

        let mask_shape = masks.shape().to_vec();
        let (mh, mw) = match mask_shape.as_slice() {
            [_, 1, h, w] | [_, h, w] => (*h, *w),
            other => return Err(anyhow!("Unexpected masks shape {other:?}")),
        };
        let masks = ndarray::Array3::from_shape_vec((count, mh, mw), owned_f32(masks.view()))
            .map_err(|e| anyhow!("Unexpected masks shape: {e}"))?;

        Ok(ModelOutputs {
            boxes,
            labels,
            scores: owned_f32(scores.view()),
            masks,
        })
    }
}

impl SegmentationModel for OnnxSegmenter {
    fn segment(&self, image: &RgbImage) -> Result<RawSegmentation> {
        let input = preprocess_image(image, self.input_size);
        let outputs = self.run(input)?;
        decode_instances(&outputs, self.input_size, self.score_threshold)
    }

    fn describe(&self) -> String {
        format!(
            "{} ({:.1} MB, {})",
            self.info.model_path,
            self.info.model_size_bytes as f64 / (1024.0 * 1024.0),
            self.info.execution_providers.join(" -> ")
        )
    }
}

/// Builds an [`OnnxSegmenter`] from the configured model location
#[derive(Debug, Clone)]
pub struct OnnxModelLoader {
    pub model: CliModelInfo,
    pub retry: RetryPolicy,
    pub device: DeviceSelection,
}

impl OnnxModelLoader {
    /// Resolves the device now, so it is decided once per manager
    pub fn new(model: CliModelInfo, device: &str) -> Self {
        let device = determine_optimal_device(device);
        log::debug!("{} Device: {} ({})", symbols::system_setup(), device.device, device.reason);
        Self {
            model,
            retry: RetryPolicy::default(),
            device,
        }
    }
}

impl ModelLoader for OnnxModelLoader {
    fn load(&self) -> Result<Arc<dyn SegmentationModel>> {
        let path = resolve_model_path(&self.model, &self.retry)?;
        let segmenter = OnnxSegmenter::load(&path, &self.device)?;
        Ok(Arc::new(segmenter))
    }
}
