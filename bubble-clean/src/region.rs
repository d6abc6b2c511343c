//! Region data model shared by every producer of region masks.
//!
//! A [`Region`] is a binary mask plus a class label and an optional confidence.
//! A [`DetectionSet`] is all the regions found (or drawn) for one image. The
//! cleaning engine only ever sees these types, so it cannot tell whether a set
//! came from the segmentation model or from the polygon editor.

use image::{GrayImage, Luma};
use serde::{Deserialize, Serialize};

/// Pixel value marking the inside of a binary mask
pub const MASK_ON: u8 = 255;

/// Pixel value marking the outside of a binary mask
pub const MASK_OFF: u8 = 0;

/// Text region classes produced by the segmentation model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegionClass {
    Bubble,
    FloatingText,
    NarrationBox,
}

impl std::str::FromStr for RegionClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "bubble" => Ok(RegionClass::Bubble),
            "floating_text" | "text" => Ok(RegionClass::FloatingText),
            "narration_box" | "narration" => Ok(RegionClass::NarrationBox),
            _ => Err(format!("Unknown region class: {s}")),
        }
    }
}

impl std::fmt::Display for RegionClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl RegionClass {
    /// Map a model class index to a region class.
    ///
    /// The model was trained with `0 = bubble`, `1 = floating text`,
    /// `2 = narration box`.
    pub fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(RegionClass::Bubble),
            1 => Some(RegionClass::FloatingText),
            2 => Some(RegionClass::NarrationBox),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RegionClass::Bubble => "bubble",
            RegionClass::FloatingText => "floating_text",
            RegionClass::NarrationBox => "narration_box",
        }
    }

    /// Whether regions of this class are erased with an opaque fill
    /// (as opposed to inpainting).
    pub fn is_opaque_fill(&self) -> bool {
        matches!(self, RegionClass::Bubble | RegionClass::NarrationBox)
    }

    pub fn all_classes() -> Vec<RegionClass> {
        vec![
            RegionClass::Bubble,
            RegionClass::FloatingText,
            RegionClass::NarrationBox,
        ]
    }
}

/// One labeled area of an image to be erased
#[derive(Debug, Clone)]
pub struct Region {
    /// Binary mask, [`MASK_ON`] inside the region and [`MASK_OFF`] elsewhere
    pub mask: GrayImage,
    pub class: RegionClass,
    /// Display-only score; cleaning ignores it
    pub confidence: Option<f32>,
}

impl Region {
    pub fn new(mask: GrayImage, class: RegionClass, confidence: Option<f32>) -> Self {
        Self {
            mask,
            class,
            confidence,
        }
    }

    /// Number of pixels inside the region
    pub fn area(&self) -> u64 {
        self.mask.pixels().filter(|p| p[0] > 0).count() as u64
    }

    /// Tight bounding box `(x1, y1, x2, y2)` with exclusive max corner, if the
    /// mask is non-empty
    pub fn bounding_box(&self) -> Option<(u32, u32, u32, u32)> {
        mask_bounding_box(&self.mask)
    }
}

/// All regions found for one image, regardless of producer
#[derive(Debug, Clone, Default)]
pub struct DetectionSet {
    regions: Vec<Region>,
}

impl DetectionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_regions(regions: Vec<Region>) -> Self {
        Self { regions }
    }

    pub fn push(&mut self, region: Region) {
        self.regions.push(region);
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Region> {
        self.regions.iter()
    }

    pub fn count_class(&self, class: RegionClass) -> usize {
        self.regions.iter().filter(|r| r.class == class).count()
    }

    /// Short human readable summary, e.g. `2 bubble, 1 floating_text`
    pub fn summary(&self) -> String {
        let parts: Vec<String> = RegionClass::all_classes()
            .into_iter()
            .map(|class| (class, self.count_class(class)))
            .filter(|(_, count)| *count > 0)
            .map(|(class, count)| format!("{count} {class}"))
            .collect();

        if parts.is_empty() {
            "no regions".to_string()
        } else {
            parts.join(", ")
        }
    }
}

impl<'a> IntoIterator for &'a DetectionSet {
    type Item = &'a Region;
    type IntoIter = std::slice::Iter<'a, Region>;

    fn into_iter(self) -> Self::IntoIter {
        self.regions.iter()
    }
}

/// Bounding box of the non-zero pixels of a mask
pub fn mask_bounding_box(mask: &GrayImage) -> Option<(u32, u32, u32, u32)> {
    let mut bounds: Option<(u32, u32, u32, u32)> = None;
    for (x, y, p) in mask.enumerate_pixels() {
        if p[0] == 0 {
            continue;
        }
        bounds = Some(match bounds {
            None => (x, y, x + 1, y + 1),
            Some((x1, y1, x2, y2)) => (x1.min(x), y1.min(y), x2.max(x + 1), y2.max(y + 1)),
        });
    }
    bounds
}

/// Intersection over union of two masks of equal size
pub fn mask_iou(a: &GrayImage, b: &GrayImage) -> f64 {
    let mut intersection = 0u64;
    let mut union = 0u64;
    for (pa, pb) in a.pixels().zip(b.pixels()) {
        let (ia, ib) = (pa[0] > 0, pb[0] > 0);
        if ia && ib {
            intersection += 1;
        }
        if ia || ib {
            union += 1;
        }
    }

    if union == 0 {
        1.0
    } else {
        intersection as f64 / union as f64
    }
}

/// Build a rectangular mask; handy for tests and synthetic regions
pub fn rect_mask(width: u32, height: u32, x1: u32, y1: u32, x2: u32, y2: u32) -> GrayImage {
    GrayImage::from_fn(width, height, |x, y| {
        if x >= x1 && x < x2 && y >= y1 && y < y2 {
            Luma([MASK_ON])
        } else {
            Luma([MASK_OFF])
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_class_from_str() {
        assert_eq!("bubble".parse::<RegionClass>().unwrap(), RegionClass::Bubble);
        assert_eq!(
            "Floating-Text".parse::<RegionClass>().unwrap(),
            RegionClass::FloatingText
        );
        assert_eq!(
            "narration_box".parse::<RegionClass>().unwrap(),
            RegionClass::NarrationBox
        );
        assert!("panel".parse::<RegionClass>().is_err());
    }

    #[test]
    fn test_region_class_from_index() {
        assert_eq!(RegionClass::from_index(0), Some(RegionClass::Bubble));
        assert_eq!(RegionClass::from_index(1), Some(RegionClass::FloatingText));
        assert_eq!(RegionClass::from_index(2), Some(RegionClass::NarrationBox));
        assert_eq!(RegionClass::from_index(3), None);
    }

    #[test]
    fn test_opaque_fill_classes() {
        assert!(RegionClass::Bubble.is_opaque_fill());
        assert!(RegionClass::NarrationBox.is_opaque_fill());
        assert!(!RegionClass::FloatingText.is_opaque_fill());
    }

    #[test]
    fn test_region_class_serde_names() {
        let json = serde_json::to_string(&RegionClass::FloatingText).unwrap();
        assert_eq!(json, "\"floating_text\"");
        let back: RegionClass = serde_json::from_str("\"narration_box\"").unwrap();
        assert_eq!(back, RegionClass::NarrationBox);
    }

    #[test]
    fn test_region_area_and_bbox() {
        let region = Region::new(rect_mask(50, 40, 10, 5, 20, 15), RegionClass::Bubble, None);
        assert_eq!(region.area(), 100);
        assert_eq!(region.bounding_box(), Some((10, 5, 20, 15)));

        let empty = Region::new(GrayImage::new(10, 10), RegionClass::Bubble, None);
        assert_eq!(empty.area(), 0);
        assert_eq!(empty.bounding_box(), None);
    }

    #[test]
    fn test_detection_set_summary() {
        let mut set = DetectionSet::new();
        assert!(set.is_empty());
        assert_eq!(set.summary(), "no regions");

        set.push(Region::new(rect_mask(10, 10, 0, 0, 2, 2), RegionClass::Bubble, None));
        set.push(Region::new(rect_mask(10, 10, 0, 0, 2, 2), RegionClass::Bubble, None));
        set.push(Region::new(
            rect_mask(10, 10, 5, 5, 7, 7),
            RegionClass::FloatingText,
            Some(0.8),
        ));

        assert_eq!(set.len(), 3);
        assert_eq!(set.count_class(RegionClass::Bubble), 2);
        assert_eq!(set.summary(), "2 bubble, 1 floating_text");
    }

    #[test]
    fn test_mask_iou() {
        let a = rect_mask(10, 10, 0, 0, 4, 4);
        let b = rect_mask(10, 10, 2, 0, 6, 4);
        // 8 shared pixels, 24 in the union
        assert!((mask_iou(&a, &b) - 8.0 / 24.0).abs() < 1e-9);
        assert_eq!(mask_iou(&a, &a), 1.0);
        assert_eq!(mask_iou(&GrayImage::new(3, 3), &GrayImage::new(3, 3)), 1.0);
    }
}
