//! Region cleaning engine.
//!
//! Bubbles and narration boxes are erased with an opaque fill whose outer
//! one-pixel ring is feathered into the surroundings. Floating text sits on
//! artwork, so those regions are gathered into one mask and reconstructed by
//! a single inpainting pass at the end.

use anyhow::{anyhow, Result};
use image::{GrayImage, Luma, Rgb, RgbImage};
use imageproc::distance_transform::Norm;
use imageproc::filter::gaussian_blur_f32;
use imageproc::morphology::{dilate, erode};
use serde::{Deserialize, Serialize};

use crate::color_utils::symbols;
use crate::inpaint::inpaint_telea;
use crate::region::{DetectionSet, Region, MASK_OFF, MASK_ON};
use crate::region_source::resize_mask_nearest;

/// Tunable parameters of the cleaning strategies
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CleaningParams {
    /// Erosion (chessboard distance) separating the solid core from the feathered ring
    pub erode_radius: u8,
    /// Gaussian sigma used to soften the ring; 0 disables feathering
    pub feather_sigma: f32,
    /// Dilation applied to the accumulated floating-text mask
    pub dilate_radius: u8,
    /// Neighborhood radius of the inpainting pass
    pub inpaint_radius: u32,
    pub fill_color: [u8; 3],
}

impl Default for CleaningParams {
    fn default() -> Self {
        Self {
            erode_radius: 1,
            feather_sigma: 1.1,
            dilate_radius: 1,
            inpaint_radius: 5,
            fill_color: [255, 255, 255],
        }
    }
}

impl CleaningParams {
    pub fn validate(&self) -> Result<()> {
        if !self.feather_sigma.is_finite() || self.feather_sigma < 0.0 {
            return Err(anyhow!(
                "feather_sigma must be a non-negative number, got {}",
                self.feather_sigma
            ));
        }
        if self.inpaint_radius == 0 {
            return Err(anyhow!("inpaint_radius must be at least 1"));
        }
        Ok(())
    }

    fn fill(&self) -> Rgb<u8> {
        Rgb(self.fill_color)
    }
}

/// Result of a cleaning call; always carries an image of the input's size
#[derive(Debug, Clone)]
pub enum CleaningOutcome {
    Cleaned(RgbImage),
    /// Cleaning failed part way; `image` is an untouched copy of the input
    Fallback { image: RgbImage, reason: String },
}

impl CleaningOutcome {
    pub fn image(&self) -> &RgbImage {
        match self {
            CleaningOutcome::Cleaned(image) => image,
            CleaningOutcome::Fallback { image, .. } => image,
        }
    }

    pub fn into_image(self) -> RgbImage {
        match self {
            CleaningOutcome::Cleaned(image) => image,
            CleaningOutcome::Fallback { image, .. } => image,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, CleaningOutcome::Fallback { .. })
    }

    pub fn fallback_reason(&self) -> Option<&str> {
        match self {
            CleaningOutcome::Cleaned(_) => None,
            CleaningOutcome::Fallback { reason, .. } => Some(reason),
        }
    }
}

/// Stateless cleaner; safe to share across threads
#[derive(Debug, Clone, Default)]
pub struct CleaningEngine {
    params: CleaningParams,
}

impl CleaningEngine {
    pub fn new(params: CleaningParams) -> Self {
        Self { params }
    }

    /// Erase every region of `regions` from a copy of `image`.
    ///
    /// Never fails: any error while processing returns the original image as
    /// [`CleaningOutcome::Fallback`] and is logged as a warning.
    pub fn clean(&self, image: &RgbImage, regions: &DetectionSet) -> CleaningOutcome {
        if regions.is_empty() {
            log::debug!("No regions to clean; returning input unchanged");
            return CleaningOutcome::Cleaned(image.clone());
        }

        match self.try_clean(image, regions) {
            Ok(cleaned) => CleaningOutcome::Cleaned(cleaned),
            Err(e) => {
                log::warn!("{}Cleaning failed, keeping original image: {e}", symbols::warning());
                CleaningOutcome::Fallback {
                    image: image.clone(),
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Fallible core of [`clean`](Self::clean)
    pub fn try_clean(&self, image: &RgbImage, regions: &DetectionSet) -> Result<RgbImage> {
        let (width, height) = image.dimensions();
        let mut output = image.clone();
        let mut inpaint_mask: Option<GrayImage> = None;

        for (index, region) in regions.iter().enumerate() {
            let mask = fit_mask(region, width, height)
                .map_err(|e| anyhow!("Region {index} ({}): {e}", region.class))?;

            if region.class.is_opaque_fill() {
                self.fill_with_soft_edge(&mut output, &mask);
            } else {
                let accumulated = inpaint_mask.get_or_insert_with(|| GrayImage::new(width, height));
                merge_mask(accumulated, &mask);
            }
        }

        // An all-zero accumulated mask leaves nothing to inpaint
        if let Some(accumulated) = inpaint_mask.filter(|m| m.pixels().any(|p| p[0] > 0)) {
            let dilated = if self.params.dilate_radius > 0 {
                dilate(&accumulated, Norm::LInf, self.params.dilate_radius)
            } else {
                accumulated
            };
            output = inpaint_telea(&output, &dilated, self.params.inpaint_radius)?;
        }

        log::debug!("Cleaned {} ({}x{})", regions.summary(), width, height);
        Ok(output)
    }

    /// Fill the eroded core solidly and alpha-blend the fill over the
    /// blurred border ring
    fn fill_with_soft_edge(&self, output: &mut RgbImage, mask: &GrayImage) {
        let fill = self.params.fill();

        let core = if self.params.erode_radius > 0 {
            erode(mask, Norm::LInf, self.params.erode_radius)
        } else {
            mask.clone()
        };

        let border = GrayImage::from_fn(mask.width(), mask.height(), |x, y| {
            if mask.get_pixel(x, y)[0] > 0 && core.get_pixel(x, y)[0] == 0 {
                Luma([MASK_ON])
            } else {
                Luma([MASK_OFF])
            }
        });

        for (x, y, p) in core.enumerate_pixels() {
            if p[0] > 0 {
                output.put_pixel(x, y, fill);
            }
        }

        let soft = if self.params.feather_sigma > 0.0 {
            gaussian_blur_f32(&border, self.params.feather_sigma)
        } else {
            border
        };

        for (x, y, a) in soft.enumerate_pixels() {
            if a[0] == 0 {
                continue;
            }
            let alpha = a[0] as f32 / 255.0;
            let pixel = output.get_pixel_mut(x, y);
            for c in 0..3 {
                let blended = pixel[c] as f32 * (1.0 - alpha) + fill[c] as f32 * alpha;
                pixel[c] = blended.round().clamp(0.0, 255.0) as u8;
            }
        }
    }
}

/// The region mask at image size, resized with nearest sampling if needed
fn fit_mask(region: &Region, width: u32, height: u32) -> Result<GrayImage> {
    let (mw, mh) = region.mask.dimensions();
    if mw == 0 || mh == 0 {
        return Err(anyhow!("mask is empty ({mw}x{mh})"));
    }
    if (mw, mh) != (width, height) {
        log::debug!("Resizing {mw}x{mh} mask to {width}x{height}");
    }
    Ok(resize_mask_nearest(&region.mask, width, height))
}

fn merge_mask(accumulated: &mut GrayImage, mask: &GrayImage) {
    for (acc, m) in accumulated.pixels_mut().zip(mask.pixels()) {
        if m[0] > 0 {
            acc[0] = MASK_ON;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::{rect_mask, RegionClass};

    fn textured(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            Rgb([
                ((x * 7 + y * 3) % 200) as u8,
                ((x * 2 + y * 11) % 180) as u8,
                ((x * 5 + y * 5) % 160) as u8,
            ])
        })
    }

    fn set_of(regions: Vec<Region>) -> DetectionSet {
        DetectionSet::from_regions(regions)
    }

    #[test]
    fn test_default_params() {
        let params = CleaningParams::default();
        assert_eq!(params.erode_radius, 1);
        assert_eq!(params.dilate_radius, 1);
        assert_eq!(params.inpaint_radius, 5);
        assert!((params.feather_sigma - 1.1).abs() < f32::EPSILON);
        assert_eq!(params.fill_color, [255, 255, 255]);
        assert!(params.validate().is_ok());
    }

    #[test]
    fn test_params_validation() {
        let mut params = CleaningParams {
            inpaint_radius: 0,
            ..Default::default()
        };
        assert!(params.validate().is_err());

        params.inpaint_radius = 3;
        params.feather_sigma = -1.0;
        assert!(params.validate().is_err());

        params.feather_sigma = f32::NAN;
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_params_from_partial_toml() {
        let params: CleaningParams = toml::from_str("inpaint_radius = 7\n").unwrap();
        assert_eq!(params.inpaint_radius, 7);
        assert_eq!(params.erode_radius, 1);
    }

    #[test]
    fn test_empty_set_is_byte_identical() {
        let image = textured(64, 48);
        let outcome = CleaningEngine::default().clean(&image, &DetectionSet::new());
        assert!(!outcome.is_fallback());
        assert_eq!(outcome.image().as_raw(), image.as_raw());
    }

    #[test]
    fn test_bubble_square_core_is_white() {
        let image = RgbImage::from_pixel(100, 100, Rgb([0, 0, 0]));
        let mask = rect_mask(100, 100, 40, 40, 60, 60);
        let set = set_of(vec![Region::new(mask, RegionClass::Bubble, Some(0.9))]);

        let outcome = CleaningEngine::default().clean(&image, &set);
        let out = outcome.image();

        for y in 42..58 {
            for x in 42..58 {
                assert_eq!(*out.get_pixel(x, y), Rgb([255, 255, 255]), "({x},{y})");
            }
        }
        // Only a thin halo around the square may change
        for (x, y, p) in out.enumerate_pixels() {
            let far = x < 36 || x >= 64 || y < 36 || y >= 64;
            if far {
                assert_eq!(*p, Rgb([0, 0, 0]), "({x},{y}) changed");
            }
        }
    }

    #[test]
    fn test_narration_box_uses_fill_color() {
        let image = textured(50, 50);
        let mask = rect_mask(50, 50, 5, 5, 30, 20);
        let params = CleaningParams {
            fill_color: [250, 240, 230],
            ..Default::default()
        };
        let set = set_of(vec![Region::new(mask.clone(), RegionClass::NarrationBox, None)]);

        let out = CleaningEngine::new(params).clean(&image, &set).into_image();
        let core = erode(&mask, Norm::LInf, 1);
        for (x, y, p) in core.enumerate_pixels() {
            if p[0] > 0 {
                assert_eq!(*out.get_pixel(x, y), Rgb([250, 240, 230]));
            }
        }
    }

    #[test]
    fn test_floating_text_only_touches_dilated_mask() {
        let image = textured(80, 60);
        let mask = rect_mask(80, 60, 30, 20, 45, 30);
        let set = set_of(vec![Region::new(mask.clone(), RegionClass::FloatingText, None)]);

        let out = CleaningEngine::default().clean(&image, &set).into_image();
        let allowed = dilate(&mask, Norm::LInf, 1);
        for (x, y, p) in out.enumerate_pixels() {
            if allowed.get_pixel(x, y)[0] == 0 {
                assert_eq!(p, image.get_pixel(x, y), "({x},{y}) changed");
            }
        }
    }

    #[test]
    fn test_mixed_regions() {
        // Dark text on a vertical gradient, plus a bubble elsewhere
        let mut image = RgbImage::from_fn(120, 80, |_, y| {
            let v = 40 + (y * 2) as u8;
            Rgb([v, v / 2, 90])
        });
        for y in 50..60 {
            for x in 70..100 {
                if (x + y) % 3 == 0 {
                    image.put_pixel(x, y, Rgb([0, 0, 0]));
                }
            }
        }
        let bubble = rect_mask(120, 80, 5, 5, 40, 35);
        let text = rect_mask(120, 80, 70, 50, 100, 60);
        let set = set_of(vec![
            Region::new(bubble, RegionClass::Bubble, Some(0.95)),
            Region::new(text, RegionClass::FloatingText, Some(0.8)),
        ]);

        let outcome = CleaningEngine::default().clean(&image, &set);
        assert!(!outcome.is_fallback());
        let out = outcome.image();

        assert_eq!(*out.get_pixel(20, 20), Rgb([255, 255, 255]));

        // Reconstructed area follows the gradient instead of a flat fill
        let top = out.get_pixel(85, 51)[0] as i32;
        let bottom = out.get_pixel(85, 58)[0] as i32;
        assert!(bottom > top, "expected gradient, got {top} .. {bottom}");
        assert!(out.get_pixel(85, 55)[0] > 60);
    }

    #[test]
    fn test_idempotent_on_empty_set() {
        let image = textured(40, 40);
        let set = set_of(vec![Region::new(
            rect_mask(40, 40, 10, 10, 25, 25),
            RegionClass::Bubble,
            None,
        )]);
        let engine = CleaningEngine::default();
        let once = engine.clean(&image, &set).into_image();
        let twice = engine.clean(&once, &DetectionSet::new()).into_image();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_small_mask_is_resized() {
        let image = RgbImage::from_pixel(40, 40, Rgb([10, 10, 10]));
        // 10x10 mask covering the middle, upscaled 4x
        let mask = rect_mask(10, 10, 3, 3, 7, 7);
        let set = set_of(vec![Region::new(mask, RegionClass::Bubble, None)]);

        let out = CleaningEngine::default().clean(&image, &set).into_image();
        assert_eq!(out.dimensions(), (40, 40));
        assert_eq!(*out.get_pixel(20, 20), Rgb([255, 255, 255]));
        assert_eq!(*out.get_pixel(2, 2), Rgb([10, 10, 10]));
    }

    #[test]
    fn test_failure_falls_back_to_original() {
        let image = textured(30, 30);
        let set = set_of(vec![
            Region::new(rect_mask(30, 30, 2, 2, 12, 12), RegionClass::Bubble, None),
            Region::new(GrayImage::new(0, 0), RegionClass::FloatingText, None),
        ]);

        let outcome = CleaningEngine::default().clean(&image, &set);
        assert!(outcome.is_fallback());
        assert!(outcome.fallback_reason().unwrap().contains("Region 1"));
        assert_eq!(outcome.image(), &image);
    }

    #[test]
    fn test_blank_floating_text_skips_inpainting() {
        let image = textured(30, 30);
        // radius 0 would make an inpainting pass fail
        let params = CleaningParams {
            inpaint_radius: 0,
            ..Default::default()
        };
        let set = set_of(vec![Region::new(
            GrayImage::new(30, 30),
            RegionClass::FloatingText,
            None,
        )]);

        let outcome = CleaningEngine::new(params).clean(&image, &set);
        assert!(!outcome.is_fallback());
        assert_eq!(outcome.into_image(), image);
    }

    #[test]
    fn test_inpaint_error_falls_back() {
        let image = textured(30, 30);
        let params = CleaningParams {
            inpaint_radius: 0,
            ..Default::default()
        };
        let set = set_of(vec![Region::new(
            rect_mask(30, 30, 10, 10, 15, 15),
            RegionClass::FloatingText,
            None,
        )]);

        let outcome = CleaningEngine::new(params).clean(&image, &set);
        assert!(outcome.is_fallback());
        assert_eq!(outcome.into_image(), image);
    }

    #[test]
    fn test_engine_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<CleaningEngine>();
    }
}
