use crate::{common::*, metrics::MetricsReport};

/// A batch of images in `[0, 255]` and binary hole masks.
#[derive(Debug, TensorLike)]
pub struct InpaintBatch {
    pub epoch: usize,
    pub step: usize,
    pub image: Tensor,
    pub mask: Tensor,
}

#[derive(Debug)]
pub enum DataMessage {
    Batch(InpaintBatch),
    EpochEnd { epoch: usize },
}

/// Step records sent from rank 0 to the event logger.
#[derive(Debug)]
pub enum LogMessage {
    Losses {
        step: usize,
        losses: IndexMap<String, f64>,
        learning_rate_g: f64,
        learning_rate_d: f64,
        loss_scale: f64,
    },
    Metrics {
        step: usize,
        report: MetricsReport,
    },
    Images {
        step: usize,
        original: Tensor,
        coarse: Tensor,
        recon: Tensor,
    },
}
