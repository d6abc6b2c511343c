//! Editor exchange documents.
//!
//! A region document carries the image size and one outline per region:
//!
//! ```json
//! {"width": 800, "height": 1200,
//!  "regions": [{"class": "bubble", "points": [[10, 12], [40, 12], [40, 30]],
//!               "confidence": 0.93, "bbox": [10, 12, 41, 31]}]}
//! ```
//!
//! `confidence`, `bbox` and `generated_at` are optional on input.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::region::{DetectionSet, RegionClass};
use crate::region_source::{detection_set_to_polygons, EditorPolygon, RegionSource};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionEntry {
    pub class: RegionClass,
    pub points: Vec<[f32; 2]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    /// `[x1, y1, x2, y2]`, exclusive max corner
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbox: Option<[f32; 4]>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionDocument {
    pub width: u32,
    pub height: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub regions: Vec<RegionEntry>,
}

fn outline_bbox(points: &[[f32; 2]]) -> Option<[f32; 4]> {
    let first = points.first()?;
    let mut bbox = [first[0], first[1], first[0], first[1]];
    for [x, y] in points {
        bbox[0] = bbox[0].min(*x);
        bbox[1] = bbox[1].min(*y);
        bbox[2] = bbox[2].max(*x);
        bbox[3] = bbox[3].max(*y);
    }
    bbox[2] += 1.0;
    bbox[3] += 1.0;
    Some(bbox)
}

impl RegionDocument {
    /// Simplified outlines of every region in `set`
    pub fn from_detection_set(set: &DetectionSet, width: u32, height: u32, tolerance: f64) -> Self {
        let regions = detection_set_to_polygons(set, tolerance)
            .into_iter()
            .map(|polygon| RegionEntry {
                bbox: outline_bbox(&polygon.points),
                class: polygon.class,
                points: polygon.points,
                confidence: polygon.confidence,
            })
            .collect();

        Self {
            width,
            height,
            generated_at: Some(Utc::now()),
            regions,
        }
    }

    pub fn polygons(&self) -> Vec<EditorPolygon> {
        self.regions
            .iter()
            .map(|entry| EditorPolygon {
                class: entry.class,
                points: entry.points.clone(),
                confidence: entry.confidence,
            })
            .collect()
    }

    /// Outlines are in the document's pixel space; rescale them to an image
    /// of a different size
    pub fn scaled_polygons(&self, width: u32, height: u32) -> Result<Vec<EditorPolygon>> {
        if self.width == 0 || self.height == 0 {
            return Err(anyhow!(
                "Region document has invalid size {}x{}",
                self.width,
                self.height
            ));
        }
        if (self.width, self.height) == (width, height) {
            return Ok(self.polygons());
        }

        log::debug!(
            "Scaling regions from {}x{} to {width}x{height}",
            self.width,
            self.height
        );
        let sx = width as f32 / self.width as f32;
        let sy = height as f32 / self.height as f32;
        Ok(self
            .polygons()
            .into_iter()
            .map(|mut polygon| {
                for point in &mut polygon.points {
                    point[0] *= sx;
                    point[1] *= sy;
                }
                polygon
            })
            .collect())
    }

    /// Manual region source for an image of the given size
    pub fn to_region_source(&self, width: u32, height: u32) -> Result<RegionSource> {
        Ok(RegionSource::Manual(self.scaled_polygons(width, height)?))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| anyhow!("Failed to read regions {}: {e}", path.display()))?;
        serde_json::from_str(&text)
            .map_err(|e| anyhow!("Invalid region document {}: {e}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)
            .map_err(|e| anyhow!("Failed to write regions {}: {e}", path.display()))
    }
}
