use crate::{
    common::*,
    model::{FeatureExtractor, VggFeatures},
};

const LPIPS_SHIFT: [f32; 3] = [-0.030, -0.088, -0.188];
const LPIPS_SCALE: [f32; 3] = [0.458, 0.448, 0.450];
const CHANNEL_NORM_EPS: f64 = 1e-10;

pub trait PerceptualDistance: Send {
    fn distance(&self, lhs: &Tensor, rhs: &Tensor) -> Result<Tensor>;
}

/// LPIPS on VGG16 features.
///
/// Variables are laid out as `net.features.{index}` for the trunk and
/// `lin{tap}.weight` of shape `[1, C, 1, 1]` for the linear heads.
#[derive(Debug)]
pub struct Lpips {
    net: VggFeatures,
    heads: Vec<Tensor>,
    shift: Tensor,
    scale: Tensor,
}

impl Lpips {
    pub fn new<'a>(path: impl Borrow<nn::Path<'a>>) -> Self {
        let path = path.borrow();
        let net = VggFeatures::vgg16(path / "net");
        let heads = net
            .stage_channels()
            .into_iter()
            .enumerate()
            .map(|(index, channels)| {
                (path / format!("lin{}", index)).var(
                    "weight",
                    &[1, channels, 1, 1],
                    nn::Init::Const(1.0 / channels as f64),
                )
            })
            .collect();

        let device = path.device();
        let shift = Tensor::of_slice(&LPIPS_SHIFT)
            .view([1, 3, 1, 1])
            .to_device(device);
        let scale = Tensor::of_slice(&LPIPS_SCALE)
            .view([1, 3, 1, 1])
            .to_device(device);

        Self {
            net,
            heads,
            shift,
            scale,
        }
    }

    pub fn load(weights_file: Option<&Path>, device: Device) -> Result<FrozenLpips> {
        let mut vs = nn::VarStore::new(device);
        let lpips = Self::new(&vs.root());

        match weights_file {
            Some(file) => {
                vs.load(file).with_context(|| {
                    format!("unable to load LPIPS weights from '{}'", file.display())
                })?;
                info!("loaded LPIPS weights from '{}'", file.display());
            }
            None => warn!("no LPIPS weights file is given, using random weights"),
        }
        vs.freeze();

        Ok(FrozenLpips { _vs: vs, lpips })
    }

    fn normalize_channels(xs: &Tensor) -> Tensor {
        let norm = xs
            .square()
            .sum_dim_intlist(&[1], true, Kind::Float)
            .sqrt();
        xs / (norm + CHANNEL_NORM_EPS)
    }
}

impl PerceptualDistance for Lpips {
    fn distance(&self, lhs: &Tensor, rhs: &Tensor) -> Result<Tensor> {
        ensure!(
            lhs.size() == rhs.size(),
            "shape mismatch {:?} vs {:?}",
            lhs.size(),
            rhs.size()
        );

        let lhs_feats = self.net.extract(&((lhs - &self.shift) / &self.scale))?;
        let rhs_feats = self.net.extract(&((rhs - &self.shift) / &self.scale))?;

        let distance = izip!(&self.heads, &lhs_feats, &rhs_feats)
            .map(|(head, lhs_feat, rhs_feat)| {
                let diff = (Self::normalize_channels(lhs_feat) - Self::normalize_channels(rhs_feat))
                    .square();
                diff.conv2d(&head.clamp_min(0.0), None::<Tensor>, &[1, 1], &[0, 0], &[1, 1], 1)
                    .mean_dim(&[1, 2, 3], false, Kind::Float)
            })
            .reduce(|lhs, rhs| lhs + rhs)
            .ok_or_else(|| format_err!("no feature taps"))?;

        Ok(distance)
    }
}

#[derive(Debug)]
pub struct FrozenLpips {
    _vs: nn::VarStore,
    pub lpips: Lpips,
}

impl PerceptualDistance for FrozenLpips {
    fn distance(&self, lhs: &Tensor, rhs: &Tensor) -> Result<Tensor> {
        self.lpips.distance(lhs, rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lpips_test() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let lpips = Lpips::new(&vs.root());
        ensure!(vs.variables().contains_key("lin4.weight"));
        ensure!(vs.variables().contains_key("net.features.28.weight"));

        let lhs = Tensor::rand(&[2, 3, 32, 32], FLOAT_CPU) * 2.0 - 1.0;
        let rhs = Tensor::rand(&[2, 3, 32, 32], FLOAT_CPU) * 2.0 - 1.0;

        let same = lpips.distance(&lhs, &lhs)?;
        ensure!(same.size() == vec![2]);
        ensure!(f64::from(&same.abs().max()) < 1e-6);

        let dist = lpips.distance(&lhs, &rhs)?;
        ensure!(f64::from(&dist.min()) >= 0.0);
        ensure!(f64::from(&dist.max()).is_finite());

        ensure!(lpips
            .distance(&lhs, &Tensor::rand(&[1, 3, 32, 32], FLOAT_CPU))
            .is_err());
        Ok(())
    }
}
