//! Batch processing shared by the `clean`, `polygons` and `apply` commands.
//!
//! Each command supplies an [`ImageProcessor`]; [`run_batch`] collects the
//! inputs, runs the processor over them and reports progress and failures.

use anyhow::{anyhow, Result};
use image::{ImageFormat, RgbImage};
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::cleaning::{CleaningEngine, CleaningOutcome};
use crate::color_utils::{progress, symbols};
use crate::config::{ApplyConfig, CleanConfig, PolygonsConfig, ProcessingConfig};
use crate::editor_io::RegionDocument;
use crate::image_input::{collect_images_from_sources, load_rgb_image, ImageInputConfig};
use crate::model_manager::ModelManager;
use crate::output_manager::OutputManager;
use crate::region::DetectionSet;
use crate::region_source::RegionSource;

/// What processing one image produced
#[derive(Debug, Clone)]
pub struct ImageReport {
    pub outputs: Vec<PathBuf>,
    pub summary: String,
    /// Cleaning failed and the original image was written instead
    pub fallback: bool,
    pub processing_time_ms: f64,
}

/// Counts from a finished batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub processed: usize,
    pub failed: usize,
    pub fallbacks: usize,
}

pub trait ImageProcessor {
    type Config: ProcessingConfig;

    /// Runs once before the first image; errors here abort the batch
    fn prepare(&self) -> Result<()> {
        Ok(())
    }

    fn process_single_image(&self, image_path: &Path, config: &Self::Config) -> Result<ImageReport>;
}

/// Process every image named by the config's sources
pub fn run_batch<P: ImageProcessor>(processor: &P, config: &P::Config) -> Result<BatchSummary> {
    let batch_start = Instant::now();
    let image_config = ImageInputConfig::from_strict_flag(config.base().strict);
    let image_files = collect_images_from_sources(&config.base().sources, &image_config)?;

    let mut summary = BatchSummary::default();
    if image_files.is_empty() {
        log::warn!("{}No valid images found to process", symbols::warning());
        return Ok(summary);
    }
    log::info!("🎯 Found {} image(s) to process", image_files.len());

    processor.prepare()?;

    let progress_bar = progress::create_batch_progress_bar(image_files.len());

    for (index, image_path) in image_files.iter().enumerate() {
        if let Some(pb) = &progress_bar {
            pb.set_message(format!("{}", image_path.display()));
        }

        match processor.process_single_image(image_path, config) {
            Ok(report) => {
                summary.processed += 1;
                if report.fallback {
                    summary.fallbacks += 1;
                }
                log::info!(
                    "{} Processed {} ({}/{}) in {:.1}ms: {}",
                    symbols::completed_successfully(),
                    image_path.display(),
                    index + 1,
                    image_files.len(),
                    report.processing_time_ms,
                    report.summary
                );
                for output in &report.outputs {
                    log::debug!("{} Wrote {}", symbols::save_file(), output.display());
                }
            }
            Err(e) => {
                summary.failed += 1;
                if config.base().strict {
                    if let Some(pb) = &progress_bar {
                        pb.finish_and_clear();
                    }
                    return Err(e.context(format!("Failed to process {}", image_path.display())));
                }
                log::warn!(
                    "{}Failed to process {} ({}/{}): {e}",
                    symbols::warning(),
                    image_path.display(),
                    index + 1,
                    image_files.len()
                );
            }
        }

        if let Some(pb) = &progress_bar {
            pb.inc(1);
        }
    }

    if let Some(pb) = progress_bar {
        pb.finish_and_clear();
        progress::remove_progress_bar(&pb);
    }

    if summary.processed > 0 {
        log::info!(
            "{} Processed {} image(s) in {:.1}s ({})",
            symbols::completed_successfully(),
            summary.processed,
            batch_start.elapsed().as_secs_f64(),
            config.tool_name()
        );
    }
    if summary.fallbacks > 0 {
        log::warn!(
            "{} {} image(s) could not be cleaned and were saved unchanged",
            symbols::completed_partially_successfully(),
            summary.fallbacks
        );
    }
    if summary.failed > 0 {
        log::warn!(
            "{}{} of {} image(s) failed to process",
            symbols::warning(),
            summary.failed,
            image_files.len()
        );
    }

    Ok(summary)
}

fn save_png(image: &RgbImage, path: &Path) -> Result<()> {
    image
        .save_with_format(path, ImageFormat::Png)
        .map_err(|e| anyhow!("Failed to save {}: {e}", path.display()))
}

fn outcome_summary(outcome: &CleaningOutcome, regions: &DetectionSet) -> String {
    match outcome.fallback_reason() {
        None => format!("cleaned {}", regions.summary()),
        Some(reason) => format!("kept original ({reason})"),
    }
}

/// Detect regions with the model for one image
fn detect(manager: &ModelManager, image: &RgbImage) -> Result<DetectionSet> {
    let model = manager.acquire()?;
    let raw = model.segment(image)?;
    RegionSource::Automatic(raw).into_detection_set(image.width(), image.height())
}

/// `clean`: detect, erase, save `<stem>_clean.png` and optionally the regions
pub struct CleanProcessor<'m> {
    pub manager: &'m ModelManager,
    pub engine: CleaningEngine,
}

impl ImageProcessor for CleanProcessor<'_> {
    type Config = CleanConfig;

    fn prepare(&self) -> Result<()> {
        self.manager.acquire().map(|_| ())
    }

    fn process_single_image(&self, image_path: &Path, config: &CleanConfig) -> Result<ImageReport> {
        let start = Instant::now();
        let output_manager = OutputManager::new(config, image_path);
        let clean_path = output_manager.generate_main_output_path("clean", "png")?;
        let regions_path = if config.write_polygons {
            Some(output_manager.generate_auxiliary_output("regions", "json")?)
        } else {
            None
        };

        let image = load_rgb_image(image_path)?;
        let regions = detect(self.manager, &image)?;
        log::debug!("Detected {} in {}", regions.summary(), image_path.display());

        let outcome = self.engine.clean(&image, &regions);
        let summary = outcome_summary(&outcome, &regions);
        let fallback = outcome.is_fallback();
        save_png(outcome.image(), &clean_path)?;
        let mut outputs = vec![clean_path];

        if let Some(path) = regions_path {
            RegionDocument::from_detection_set(
                &regions,
                image.width(),
                image.height(),
                config.simplify_tolerance,
            )
            .save(&path)?;
            outputs.push(path);
        }

        Ok(ImageReport {
            outputs,
            summary,
            fallback,
            processing_time_ms: start.elapsed().as_secs_f64() * 1000.0,
        })
    }
}

/// `polygons`: detect and write only the editor document
pub struct PolygonsProcessor<'m> {
    pub manager: &'m ModelManager,
}

impl ImageProcessor for PolygonsProcessor<'_> {
    type Config = PolygonsConfig;

    fn prepare(&self) -> Result<()> {
        self.manager.acquire().map(|_| ())
    }

    fn process_single_image(
        &self,
        image_path: &Path,
        config: &PolygonsConfig,
    ) -> Result<ImageReport> {
        let start = Instant::now();
        let regions_path =
            OutputManager::new(config, image_path).generate_auxiliary_output("regions", "json")?;

        let image = load_rgb_image(image_path)?;
        let regions = detect(self.manager, &image)?;
        let document = RegionDocument::from_detection_set(
            &regions,
            image.width(),
            image.height(),
            config.simplify_tolerance,
        );
        document.save(&regions_path)?;

        Ok(ImageReport {
            outputs: vec![regions_path],
            summary: format!(
                "{} outline(s) from {}",
                document.regions.len(),
                regions.summary()
            ),
            fallback: false,
            processing_time_ms: start.elapsed().as_secs_f64() * 1000.0,
        })
    }
}

/// `apply`: rasterize edited polygons and erase them; never loads the model
pub struct ApplyProcessor {
    pub engine: CleaningEngine,
    pub document: RegionDocument,
}

impl ApplyProcessor {
    pub fn from_config(config: &ApplyConfig) -> Result<Self> {
        Ok(Self {
            engine: CleaningEngine::new(config.params.clone()),
            document: RegionDocument::load(&config.regions_path)?,
        })
    }
}

impl ImageProcessor for ApplyProcessor {
    type Config = ApplyConfig;

    fn process_single_image(&self, image_path: &Path, config: &ApplyConfig) -> Result<ImageReport> {
        let start = Instant::now();
        let clean_path =
            OutputManager::new(config, image_path).generate_main_output_path("clean", "png")?;

        let image = load_rgb_image(image_path)?;
        let regions = self
            .document
            .to_region_source(image.width(), image.height())?
            .into_detection_set(image.width(), image.height())?;

        let outcome = self.engine.clean(&image, &regions);
        let summary = outcome_summary(&outcome, &regions);
        let fallback = outcome.is_fallback();
        save_png(outcome.image(), &clean_path)?;

        Ok(ImageReport {
            outputs: vec![clean_path],
            summary,
            fallback,
            processing_time_ms: start.elapsed().as_secs_f64() * 1000.0,
        })
    }
}

pub fn run_clean(config: &CleanConfig, manager: &ModelManager) -> Result<BatchSummary> {
    let processor = CleanProcessor {
        manager,
        engine: CleaningEngine::new(config.params.clone()),
    };
    run_batch(&processor, config)
}

pub fn run_polygons(config: &PolygonsConfig, manager: &ModelManager) -> Result<BatchSummary> {
    run_batch(&PolygonsProcessor { manager }, config)
}

pub fn run_apply(config: &ApplyConfig) -> Result<BatchSummary> {
    let processor = ApplyProcessor::from_config(config)?;
    run_batch(&processor, config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cleaning::CleaningParams;
    use crate::config::BaseConfig;
    use crate::model_manager::ModelLoader;
    use crate::region_source::{RawInstance, RawSegmentation};
    use crate::segmentation::SegmentationModel;
    use image::Rgb;
    use ndarray::Array2;
    use std::sync::Arc;
    use tempfile::tempdir;

    /// Reports one bubble covering the center quarter of any image
    struct CenterBubble;

    impl SegmentationModel for CenterBubble {
        fn segment(&self, _image: &RgbImage) -> Result<RawSegmentation> {
            let mut probabilities = Array2::<f32>::zeros((16, 16));
            for r in 4..12 {
                for c in 4..12 {
                    probabilities[[r, c]] = 0.95;
                }
            }
            Ok(RawSegmentation {
                instances: vec![RawInstance {
                    probabilities,
                    class_index: 0,
                    score: 0.9,
                }],
            })
        }
    }

    struct CenterBubbleLoader;

    impl ModelLoader for CenterBubbleLoader {
        fn load(&self) -> Result<Arc<dyn SegmentationModel>> {
            Ok(Arc::new(CenterBubble))
        }
    }

    struct FailingLoader;

    impl ModelLoader for FailingLoader {
        fn load(&self) -> Result<Arc<dyn SegmentationModel>> {
            Err(anyhow!("weights unavailable"))
        }
    }

    fn base(sources: Vec<String>, strict: bool) -> BaseConfig {
        BaseConfig {
            sources,
            device: "cpu".to_string(),
            output_dir: None,
            strict,
            force: false,
        }
    }

    fn write_page(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        RgbImage::from_pixel(64, 64, Rgb([20, 20, 20])).save(&path).unwrap();
        path
    }

    #[test]
    fn test_clean_writes_image_and_regions() {
        let dir = tempdir().unwrap();
        let page = write_page(dir.path(), "page.png");
        let config = CleanConfig {
            base: base(vec![page.to_string_lossy().to_string()], true),
            params: CleaningParams::default(),
            write_polygons: true,
            simplify_tolerance: 1.5,
            model: Default::default(),
        };
        let manager = ModelManager::new(CenterBubbleLoader);

        let summary = run_clean(&config, &manager).unwrap();
        assert_eq!(summary.processed, 1);
        assert_eq!(manager.construction_count(), 1);

        let cleaned = image::open(dir.path().join("page_clean.png")).unwrap().to_rgb8();
        assert_eq!(*cleaned.get_pixel(32, 32), Rgb([255, 255, 255]));
        assert_eq!(*cleaned.get_pixel(2, 2), Rgb([20, 20, 20]));

        let doc = RegionDocument::load(&dir.path().join("page_regions.json")).unwrap();
        assert_eq!(doc.regions.len(), 1);
        assert_eq!((doc.width, doc.height), (64, 64));
    }

    #[test]
    fn test_polygons_only_writes_document() {
        let dir = tempdir().unwrap();
        let page = write_page(dir.path(), "page.png");
        let config = PolygonsConfig {
            base: base(vec![page.to_string_lossy().to_string()], true),
            simplify_tolerance: 1.5,
            model: Default::default(),
        };

        let summary = run_polygons(&config, &ModelManager::new(CenterBubbleLoader)).unwrap();
        assert_eq!(summary.processed, 1);
        assert!(dir.path().join("page_regions.json").exists());
        assert!(!dir.path().join("page_clean.png").exists());
    }

    #[test]
    fn test_model_failure_aborts_batch() {
        let dir = tempdir().unwrap();
        let page = write_page(dir.path(), "page.png");
        let config = PolygonsConfig {
            base: base(vec![page.to_string_lossy().to_string()], false),
            simplify_tolerance: 1.5,
            model: Default::default(),
        };

        let err = run_polygons(&config, &ModelManager::new(FailingLoader)).unwrap_err();
        assert!(err.to_string().contains("weights unavailable"));
    }

    #[test]
    fn test_permissive_batch_continues_after_failure() {
        let dir = tempdir().unwrap();
        let good = write_page(dir.path(), "good.png");
        let broken = dir.path().join("broken.png");
        std::fs::write(&broken, b"not a png").unwrap();

        let config = CleanConfig {
            base: base(vec![dir.path().to_string_lossy().to_string()], false),
            params: CleaningParams::default(),
            write_polygons: false,
            simplify_tolerance: 1.5,
            model: Default::default(),
        };
        let summary = run_clean(&config, &ModelManager::new(CenterBubbleLoader)).unwrap();
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.failed, 1);
        assert!(good.with_file_name("good_clean.png").exists());
    }

    #[test]
    fn test_apply_uses_document_without_model() {
        let dir = tempdir().unwrap();
        let page = write_page(dir.path(), "page.png");
        let regions = dir.path().join("page_regions.json");
        std::fs::write(
            &regions,
            r#"{"width": 64, "height": 64, "regions": [
                {"class": "narration_box", "points": [[8, 8], [30, 8], [30, 20], [8, 20]]}
            ]}"#,
        )
        .unwrap();

        let config = ApplyConfig {
            base: base(vec![page.to_string_lossy().to_string()], true),
            regions_path: regions,
            params: CleaningParams::default(),
        };
        let summary = run_apply(&config).unwrap();
        assert_eq!(summary, BatchSummary { processed: 1, failed: 0, fallbacks: 0 });

        let cleaned = image::open(dir.path().join("page_clean.png")).unwrap().to_rgb8();
        assert_eq!(*cleaned.get_pixel(18, 14), Rgb([255, 255, 255]));
        assert_eq!(*cleaned.get_pixel(50, 50), Rgb([20, 20, 20]));
    }
}
