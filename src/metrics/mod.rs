mod engine;
mod fid;
mod lpips;
mod plot;
mod quality;

pub use engine::*;
pub use fid::*;
pub use lpips::*;
pub use plot::*;
pub use quality::*;

use crate::common::*;

pub type LossLedger = IndexMap<String, f64>;

#[derive(Debug, TensorLike)]
pub struct GanLosses {
    pub g: Tensor,
    pub d: Tensor,
    pub r: Tensor,
    pub tv: Tensor,
    pub perc: Tensor,
    pub style: Tensor,
    pub contra: Tensor,
}

impl GanLosses {
    pub fn to_ledger(&self) -> LossLedger {
        let Self {
            g,
            d,
            r,
            tv,
            perc,
            style,
            contra,
        } = self;

        [
            ("g", g),
            ("d", d),
            ("r", r),
            ("tv", tv),
            ("perc", perc),
            ("style", style),
            ("contra", contra),
        ]
        .into_iter()
        .map(|(name, loss)| (name.to_string(), f64::from(&loss.detach())))
        .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityScores {
    pub ssim: f64,
    pub psnr: f64,
    pub lpips: f64,
    pub real_score: f64,
    pub fake_score: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricsReport {
    pub step: usize,
    pub accuracy: f64,
    /// Present on steps where the reference batch is evaluated.
    pub quality: Option<QualityScores>,
}
