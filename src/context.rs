use crate::{
    common::*,
    metrics::{Lpips, PerceptualDistance},
    model::{FeatureExtractor, VggFeatures},
};

/// Per-worker execution state, created once and passed down.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    pub device: Device,
    pub rank: usize,
    pub world_size: usize,
    pub span: Span,
}

impl WorkerContext {
    pub fn new(device: Device, rank: usize, world_size: usize) -> Self {
        let span = info_span!("worker", rank, ?device);
        Self {
            device,
            rank,
            world_size,
            span,
        }
    }

    pub fn is_main(&self) -> bool {
        self.rank == 0
    }

    /// Loads the frozen VGG19 trunk used by the perceptual and style losses.
    pub fn load_feature_extractor(
        &self,
        weights_file: Option<&Path>,
    ) -> Result<Box<dyn FeatureExtractor>> {
        let vgg = VggFeatures::load(true, weights_file, self.device)?;
        Ok(Box::new(vgg))
    }

    pub fn load_perceptual_distance(
        &self,
        weights_file: Option<&Path>,
    ) -> Result<Box<dyn PerceptualDistance>> {
        let lpips = Lpips::load(weights_file, self.device)?;
        Ok(Box::new(lpips))
    }
}
