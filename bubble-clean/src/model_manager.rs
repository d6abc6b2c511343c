//! Process-wide, lazily constructed segmentation model.
//!
//! The first [`ModelManager::acquire`] call loads the weights, builds the model
//! and runs a smoke test on an all-zero 100x100 image. Concurrent first callers
//! block until that single construction finishes and then share its result.
//! A failed construction is kept: every later call returns the same error.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use anyhow::{anyhow, Result};
use image::RgbImage;

use crate::color_utils::symbols;
use crate::segmentation::SegmentationModel;

/// Side length of the synthetic smoke-test image
pub const SMOKE_TEST_SIZE: u32 = 100;

/// Builds the model on first use
pub trait ModelLoader: Send + Sync {
    fn load(&self) -> Result<Arc<dyn SegmentationModel>>;
}

pub struct ModelManager {
    loader: Box<dyn ModelLoader>,
    model: OnceLock<Result<Arc<dyn SegmentationModel>, String>>,
    constructions: AtomicUsize,
}

impl ModelManager {
    pub fn new(loader: impl ModelLoader + 'static) -> Self {
        Self {
            loader: Box::new(loader),
            model: OnceLock::new(),
            constructions: AtomicUsize::new(0),
        }
    }

    /// The shared model, constructing it on the first call
    pub fn acquire(&self) -> Result<Arc<dyn SegmentationModel>> {
        let slot = self.model.get_or_init(|| {
            self.constructions.fetch_add(1, Ordering::SeqCst);
            self.construct().map_err(|e| format!("{e:#}"))
        });

        match slot {
            Ok(model) => Ok(Arc::clone(model)),
            Err(message) => Err(anyhow!("Segmentation model unavailable: {message}")),
        }
    }

    /// Whether a model has been constructed and passed its smoke test
    pub fn is_ready(&self) -> bool {
        matches!(self.model.get(), Some(Ok(_)))
    }

    /// How many times construction has run; at most one
    pub fn construction_count(&self) -> usize {
        self.constructions.load(Ordering::SeqCst)
    }

    fn construct(&self) -> Result<Arc<dyn SegmentationModel>> {
        log::info!("{} Loading segmentation model", symbols::checking());
        let model = self.loader.load()?;
        smoke_test(model.as_ref())?;
        log::info!(
            "{} Model ready: {}",
            symbols::model_loaded(),
            model.describe()
        );
        Ok(model)
    }
}

/// Run one inference on an all-zero image
pub fn smoke_test(model: &dyn SegmentationModel) -> Result<()> {
    let blank = RgbImage::new(SMOKE_TEST_SIZE, SMOKE_TEST_SIZE);
    let raw = model
        .segment(&blank)
        .map_err(|e| anyhow!("Model failed its smoke test: {e}"))?;
    log::debug!("Smoke test found {} instance(s) on a blank image", raw.len());
    Ok(())
}
