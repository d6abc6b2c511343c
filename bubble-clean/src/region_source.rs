//! Region source adapter.
//!
//! Two producers feed the cleaning engine:
//! - the segmentation model, which yields per-instance probability fields and
//!   class indices ([`RawSegmentation`]);
//! - the polygon editor, which yields user-adjusted outlines
//!   ([`EditorPolygon`]).
//!
//! [`RegionSource`] turns either one into a [`DetectionSet`]. The inverse
//! direction, [`detection_set_to_polygons`], simplifies automatic masks into
//! outlines the editor can display before the user adjusts them.

use anyhow::{anyhow, Result};
use image::imageops::FilterType;
use image::{GrayImage, Luma};
use imageproc::contours::{find_contours, BorderType};
use imageproc::drawing::draw_polygon_mut;
use imageproc::geometry::approximate_polygon_dp;
use imageproc::point::Point;
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::region::{DetectionSet, Region, RegionClass, MASK_OFF, MASK_ON};

/// Probability above which a model mask pixel counts as inside the region
pub const MASK_THRESHOLD: f32 = 0.5;

/// Default Douglas-Peucker tolerance (pixels) for editor outlines
pub const DEFAULT_SIMPLIFY_TOLERANCE: f64 = 1.5;

/// Confidence given to regions drawn by hand
pub const MANUAL_CONFIDENCE: f32 = 1.0;

/// One instance as reported by the segmentation model
#[derive(Debug, Clone)]
pub struct RawInstance {
    /// Per-pixel probability, indexed `[row, col]`, at model resolution
    pub probabilities: Array2<f32>,
    pub class_index: usize,
    pub score: f32,
}

/// Everything the segmentation model reported for one image
#[derive(Debug, Clone, Default)]
pub struct RawSegmentation {
    pub instances: Vec<RawInstance>,
}

impl RawSegmentation {
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

/// A user-editable outline in image pixel coordinates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditorPolygon {
    pub class: RegionClass,
    pub points: Vec<[f32; 2]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

/// Producer-specific region data waiting to be normalized
#[derive(Debug, Clone)]
pub enum RegionSource {
    /// Output of the segmentation model
    Automatic(RawSegmentation),
    /// Outlines from the polygon editor
    Manual(Vec<EditorPolygon>),
}

impl RegionSource {
    /// Normalize into a detection set whose masks match `width` x `height`
    pub fn into_detection_set(self, width: u32, height: u32) -> Result<DetectionSet> {
        if width == 0 || height == 0 {
            return Err(anyhow!(
                "Cannot build regions for an empty image ({width}x{height})"
            ));
        }

        match self {
            RegionSource::Automatic(raw) => from_segmentation(&raw, width, height),
            RegionSource::Manual(polygons) => from_polygons(&polygons, width, height),
        }
    }
}

/// Build a detection set from model output
pub fn from_segmentation(raw: &RawSegmentation, width: u32, height: u32) -> Result<DetectionSet> {
    let mut set = DetectionSet::new();

    for (index, instance) in raw.instances.iter().enumerate() {
        let class = RegionClass::from_index(instance.class_index).ok_or_else(|| {
            anyhow!(
                "Instance {index} has unknown class index {}",
                instance.class_index
            )
        })?;

        let mask = binarize_probabilities(&instance.probabilities)?;
        let mask = resize_mask_nearest(&mask, width, height);
        set.push(Region::new(mask, class, Some(instance.score)));
    }

    log::debug!(
        "Normalized {} model instance(s) into {}",
        raw.len(),
        set.summary()
    );
    Ok(set)
}

/// Build a detection set from editor polygons
pub fn from_polygons(polygons: &[EditorPolygon], width: u32, height: u32) -> Result<DetectionSet> {
    let mut set = DetectionSet::new();

    for (index, polygon) in polygons.iter().enumerate() {
        let mask = rasterize_polygon(&polygon.points, width, height)
            .map_err(|e| anyhow!("Polygon {index} ({}): {e}", polygon.class))?;
        let confidence = polygon.confidence.or(Some(MANUAL_CONFIDENCE));
        set.push(Region::new(mask, polygon.class, confidence));
    }

    log::debug!(
        "Rasterized {} polygon(s) into {}",
        polygons.len(),
        set.summary()
    );
    Ok(set)
}

/// Threshold a probability field into a binary mask
pub fn binarize_probabilities(probabilities: &Array2<f32>) -> Result<GrayImage> {
    let (rows, cols) = probabilities.dim();
    if rows == 0 || cols == 0 {
        return Err(anyhow!("Model mask is empty ({cols}x{rows})"));
    }

    Ok(GrayImage::from_fn(cols as u32, rows as u32, |x, y| {
        if probabilities[[y as usize, x as usize]] > MASK_THRESHOLD {
            Luma([MASK_ON])
        } else {
            Luma([MASK_OFF])
        }
    }))
}

/// Resize a mask with nearest-neighbor sampling so labels never blend
pub fn resize_mask_nearest(mask: &GrayImage, width: u32, height: u32) -> GrayImage {
    if mask.dimensions() == (width, height) {
        return mask.clone();
    }
    image::imageops::resize(mask, width, height, FilterType::Nearest)
}

/// Vertices may lie at most this many image sizes outside the image
pub const MAX_POLYGON_OVERSHOOT: f32 = 4.0;

/// Fill a polygon into a binary mask of the given size
pub fn rasterize_polygon(points: &[[f32; 2]], width: u32, height: u32) -> Result<GrayImage> {
    let vertices = to_vertices(points, width, height)?;
    if vertices.len() < 3 {
        return Err(anyhow!(
            "Polygon needs at least 3 distinct vertices, got {}",
            vertices.len()
        ));
    }

    let mut mask = GrayImage::new(width, height);
    draw_polygon_mut(&mut mask, &vertices, Luma([MASK_ON]));
    Ok(mask)
}

/// Round to integer vertices, dropping repeats and an explicit closing vertex.
/// Coordinates must be finite and within [`MAX_POLYGON_OVERSHOOT`] image
/// sizes of the image.
fn to_vertices(points: &[[f32; 2]], width: u32, height: u32) -> Result<Vec<Point<i32>>> {
    let x_limit = MAX_POLYGON_OVERSHOOT * width as f32;
    let y_limit = MAX_POLYGON_OVERSHOOT * height as f32;

    let mut vertices: Vec<Point<i32>> = Vec::with_capacity(points.len());
    for (index, &[x, y]) in points.iter().enumerate() {
        if !x.is_finite() || !y.is_finite() {
            return Err(anyhow!("Vertex {index} is not a finite coordinate ({x}, {y})"));
        }
        let outside_x = x < -x_limit || x > width as f32 + x_limit;
        let outside_y = y < -y_limit || y > height as f32 + y_limit;
        if outside_x || outside_y {
            return Err(anyhow!(
                "Vertex {index} ({x}, {y}) lies far outside the {width}x{height} image"
            ));
        }
        let vertex = Point::new(x.round() as i32, y.round() as i32);
        if vertices.last() != Some(&vertex) {
            vertices.push(vertex);
        }
    }
    while vertices.len() > 1 && vertices.first() == vertices.last() {
        vertices.pop();
    }
    Ok(vertices)
}

/// Trace the outer contours of a mask and simplify each one.
///
/// Holes are ignored; the editor only edits outer boundaries. Regions touching
/// the image edge are traced too. When simplification collapses a thin region
/// below three vertices the unsimplified contour is kept instead.
pub fn simplify_mask(mask: &GrayImage, tolerance: f64) -> Vec<Vec<Point<i32>>> {
    let (width, height) = mask.dimensions();
    if width == 0 || height == 0 {
        return Vec::new();
    }

    // find_contours skips foreground on the outermost pixel ring
    let mut padded = GrayImage::new(width + 2, height + 2);
    image::imageops::replace(&mut padded, mask, 1, 1);

    let (max_x, max_y) = (width as i32 - 1, height as i32 - 1);
    find_contours::<i32>(&padded)
        .into_iter()
        .filter(|c| c.border_type == BorderType::Outer)
        .filter_map(|c| {
            let raw: Vec<Point<i32>> = c
                .points
                .iter()
                .map(|p| Point::new((p.x - 1).clamp(0, max_x), (p.y - 1).clamp(0, max_y)))
                .collect();

            if tolerance > 0.0 {
                let simplified = dedup_closed(approximate_polygon_dp(&raw, tolerance, true));
                if simplified.len() >= 3 {
                    return Some(simplified);
                }
            }
            let raw = dedup_closed(raw);
            (raw.len() >= 3).then_some(raw)
        })
        .collect()
}

fn dedup_closed(mut outline: Vec<Point<i32>>) -> Vec<Point<i32>> {
    outline.dedup();
    while outline.len() > 1 && outline.first() == outline.last() {
        outline.pop();
    }
    outline
}

/// Convert every region of a detection set into editor outlines
pub fn detection_set_to_polygons(set: &DetectionSet, tolerance: f64) -> Vec<EditorPolygon> {
    let mut polygons = Vec::new();
    for region in set {
        for outline in simplify_mask(&region.mask, tolerance) {
            polygons.push(EditorPolygon {
                class: region.class,
                points: outline
                    .iter()
                    .map(|p| [p.x as f32, p.y as f32])
                    .collect(),
                confidence: region.confidence,
            });
        }
    }
    polygons
}
