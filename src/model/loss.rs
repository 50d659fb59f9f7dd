use super::FeatureExtractor;
use crate::common::*;

const COVERAGE_EPS: f64 = 1e-8;
const NORM_EPS: f64 = 1e-12;

pub fn generator_loss(neg: &Tensor) -> Tensor {
    -neg.mean(Kind::Float)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiscriminatorLossKind {
    /// `mean(relu(1 - pos)) + mean(relu(1 + neg))`
    Hinge,
    /// `mean(neg) - mean(pos)`
    Plain,
}

impl Default for DiscriminatorLossKind {
    fn default() -> Self {
        Self::Hinge
    }
}

impl DiscriminatorLossKind {
    pub fn forward(self, pos: &Tensor, neg: &Tensor) -> Tensor {
        match self {
            Self::Hinge => {
                let hinge_pos = (-pos + 1.0).relu().mean(Kind::Float);
                let hinge_neg = (neg + 1.0).relu().mean(Kind::Float);
                hinge_pos + hinge_neg
            }
            Self::Plain => neg.mean(Kind::Float) - pos.mean(Kind::Float),
        }
    }
}

/// Masked L1 loss on the coarse and refined outputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct L1ReconLoss {
    #[serde(default = "default_alpha")]
    pub coarse_hole: f64,
    #[serde(default = "default_alpha")]
    pub coarse_unhole: f64,
    #[serde(default = "default_alpha")]
    pub refined_hole: f64,
    #[serde(default = "default_alpha")]
    pub refined_unhole: f64,
}

fn default_alpha() -> f64 {
    1.0
}

impl Default for L1ReconLoss {
    fn default() -> Self {
        Self {
            coarse_hole: 1.0,
            coarse_unhole: 1.0,
            refined_hole: 1.0,
            refined_unhole: 1.0,
        }
    }
}

impl L1ReconLoss {
    /// `masks` is either aligned with `images` or is the doubled mask batch fed
    /// to the discriminator, in which case only its first half is used.
    pub fn forward(
        &self,
        images: &Tensor,
        coarse: &Tensor,
        refined: &Tensor,
        masks: &Tensor,
    ) -> Result<Tensor> {
        let Self {
            coarse_hole,
            coarse_unhole,
            refined_hole,
            refined_unhole,
        } = *self;

        ensure!(
            images.size() == coarse.size() && images.size() == refined.size(),
            "image shape {:?} does not match output shapes {:?} and {:?}",
            images.size(),
            coarse.size(),
            refined.size()
        );
        let (batch_size, _c, height, width) = images.size4()?;
        let (mask_batch_size, mask_c, mask_h, mask_w) = masks.size4()?;
        ensure!(
            mask_c == 1 && mask_h == height && mask_w == width,
            "mask shape {:?} is not compatible with image shape {:?}",
            masks.size(),
            images.size()
        );

        let masks = if mask_batch_size == batch_size {
            masks.shallow_clone()
        } else if mask_batch_size == batch_size * 2 {
            masks.narrow(0, 0, batch_size)
        } else {
            bail!(
                "mask batch size {} does not match image batch size {}",
                mask_batch_size,
                batch_size
            );
        };

        let coverage = masks
            .view([batch_size, -1])
            .mean_dim(&[1], false, Kind::Float)
            .view([-1, 1, 1, 1]);
        let hole_weight = &masks / coverage.clamp_min(COVERAGE_EPS);
        let unhole_weight = (-&masks + 1.0) / (-&coverage + 1.0).clamp_min(COVERAGE_EPS);

        let refined_l1 = (images - refined).abs();
        let coarse_l1 = (images - coarse).abs();

        let loss = (&refined_l1 * &hole_weight).mean(Kind::Float) * refined_hole
            + (&refined_l1 * &unhole_weight).mean(Kind::Float) * refined_unhole
            + (&coarse_l1 * &hole_weight).mean(Kind::Float) * coarse_hole
            + (&coarse_l1 * &unhole_weight).mean(Kind::Float) * coarse_unhole;

        Ok(loss)
    }
}

pub fn tv_loss(xs: &Tensor) -> Result<Tensor> {
    let (batch_size, channels, height, width) = xs.size4()?;
    ensure!(
        height > 1 && width > 1,
        "total variation requires spatial size > 1, but get {}x{}",
        height,
        width
    );

    let count_h = (channels * (height - 1) * width) as f64;
    let count_w = (channels * height * (width - 1)) as f64;
    let h_tv = (xs.narrow(2, 1, height - 1) - xs.narrow(2, 0, height - 1))
        .square()
        .sum(Kind::Float);
    let w_tv = (xs.narrow(3, 1, width - 1) - xs.narrow(3, 0, width - 1))
        .square()
        .sum(Kind::Float);

    Ok((h_tv / count_h + w_tv / count_w) * 2.0 / batch_size as f64)
}

pub struct VggLoss {
    extractor: Box<dyn FeatureExtractor>,
    mean: Tensor,
    std: Tensor,
    weights: Vec<f64>,
}

impl fmt::Debug for VggLoss {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VggLoss")
            .field("weights", &self.weights)
            .finish()
    }
}

impl VggLoss {
    pub fn new(extractor: Box<dyn FeatureExtractor>, device: Device) -> Self {
        let mean = Tensor::of_slice(&[0.485f32, 0.456, 0.406])
            .view([1, 3, 1, 1])
            .to_device(device);
        let std = Tensor::of_slice(&[0.229f32, 0.224, 0.225])
            .view([1, 3, 1, 1])
            .to_device(device);

        Self {
            extractor,
            mean,
            std,
            weights: vec![1.0 / 32.0, 1.0 / 16.0, 1.0 / 8.0, 1.0 / 4.0, 1.0],
        }
    }

    pub fn forward(&self, generated: &Tensor, target: &Tensor) -> Result<(Tensor, Tensor)> {
        ensure!(
            generated.size() == target.size(),
            "shape mismatch {:?} vs {:?}",
            generated.size(),
            target.size()
        );

        let generated = (generated - &self.mean) / &self.std;
        let target = (target - &self.mean) / &self.std;
        let generated_feats = self.extractor.extract(&generated)?;
        let target_feats = self.extractor.extract(&target)?;
        ensure!(
            generated_feats.len() == self.weights.len() && target_feats.len() == self.weights.len(),
            "expect {} feature stages, but get {}",
            self.weights.len(),
            generated_feats.len()
        );

        let device = generated.device();
        let init = (
            Tensor::zeros(&[], (Kind::Float, device)),
            Tensor::zeros(&[], (Kind::Float, device)),
        );

        izip!(&self.weights, &generated_feats, &target_feats).try_fold(
            init,
            |(perceptual, style), (&weight, gen_feat, target_feat)| -> Result<_> {
                let target_feat = target_feat.detach();
                let l1 = (gen_feat - &target_feat).abs().mean(Kind::Float);
                let gram_diff = gram_matrix(gen_feat)? - gram_matrix(&target_feat)?;
                let mse = gram_diff.square().mean(Kind::Float);
                Ok((perceptual + l1 * weight, style + mse * weight))
            },
        )
    }
}

pub fn gram_matrix(xs: &Tensor) -> Result<Tensor> {
    let (b, c, h, w) = xs.size4()?;
    let features = xs.view([b, c, h * w]);
    let gram = features.bmm(&features.transpose(1, 2)) / (c * h * w) as f64;
    Ok(gram)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NceReduction {
    Mean,
    Sum,
    None,
}

#[derive(Debug, Clone)]
pub struct InfoNce {
    pub temperature: f64,
    pub reduction: NceReduction,
}

impl Default for InfoNce {
    fn default() -> Self {
        Self {
            temperature: 0.1,
            reduction: NceReduction::Mean,
        }
    }
}

impl InfoNce {
    pub fn forward(
        &self,
        query: &Tensor,
        positive_key: &Tensor,
        negative_keys: Option<&Tensor>,
    ) -> Result<Tensor> {
        let Self {
            temperature,
            reduction,
        } = *self;

        ensure!(
            query.dim() == 2
                && positive_key.dim() == 2
                && negative_keys.map(|keys| keys.dim() == 2).unwrap_or(true),
            "query, positive_key and negative_keys should all have 2 dimensions"
        );
        let (num_queries, width) = query.size2()?;
        let (num_positives, positive_width) = positive_key.size2()?;
        ensure!(
            num_queries == num_positives,
            "query and positive_key must have the same number of samples, but get {} and {}",
            num_queries,
            num_positives
        );
        ensure!(
            positive_width == width
                && negative_keys
                    .map(|keys| keys.size()[1] == width)
                    .unwrap_or(true),
            "query, positive_key and negative_keys should have the same number of components"
        );

        let device = query.device();
        let query = l2_normalize(query);
        let positive_key = l2_normalize(positive_key);

        let (logits, labels) = match negative_keys {
            Some(negative_keys) => {
                let negative_keys = l2_normalize(negative_keys);
                let positive_logit =
                    (&query * &positive_key).sum_dim_intlist(&[1], true, Kind::Float);
                let negative_logits = query.matmul(&negative_keys.transpose(-2, -1));
                let logits = Tensor::cat(&[positive_logit, negative_logits], 1);
                let labels = Tensor::zeros(&[num_queries], (Kind::Int64, device));
                (logits, labels)
            }
            None => {
                let logits = query.matmul(&positive_key.transpose(-2, -1));
                let labels = Tensor::arange(num_queries, (Kind::Int64, device));
                (logits, labels)
            }
        };

        let losses = -(logits / temperature)
            .log_softmax(1, Kind::Float)
            .gather(1, &labels.unsqueeze(1), false)
            .view([-1]);

        let loss = match reduction {
            NceReduction::Mean => losses.mean(Kind::Float),
            NceReduction::Sum => losses.sum(Kind::Float),
            NceReduction::None => losses,
        };
        Ok(loss)
    }
}

fn l2_normalize(xs: &Tensor) -> Tensor {
    let norm = xs
        .square()
        .sum_dim_intlist(&[-1], true, Kind::Float)
        .sqrt()
        .clamp_min(NORM_EPS);
    xs / norm
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::VggFeatures;
    use approx::assert_abs_diff_eq;

    #[test]
    fn hinge_loss_test() -> Result<()> {
        let pos = Tensor::of_slice(&[2.0f32, 0.5]);
        let neg = Tensor::of_slice(&[-2.0f32, 0.0]);
        let loss = f64::from(&DiscriminatorLossKind::Hinge.forward(&pos, &neg));
        // relu(1 - pos) = [0, 0.5], relu(1 + neg) = [0, 1]
        assert_abs_diff_eq!(loss, 0.75, epsilon = 1e-6);

        let plain = f64::from(&DiscriminatorLossKind::Plain.forward(&pos, &neg));
        assert_abs_diff_eq!(plain, -1.0 - 1.25, epsilon = 1e-6);

        let gen = f64::from(&generator_loss(&neg));
        assert_abs_diff_eq!(gen, 1.0, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn recon_loss_full_mask_test() -> Result<()> {
        let images = Tensor::rand(&[2, 3, 8, 8], FLOAT_CPU);
        let coarse = Tensor::rand(&[2, 3, 8, 8], FLOAT_CPU);
        let refined = Tensor::rand(&[2, 3, 8, 8], FLOAT_CPU);
        let recon = L1ReconLoss::default();

        for masks in [
            Tensor::ones(&[4, 1, 8, 8], FLOAT_CPU),
            Tensor::zeros(&[4, 1, 8, 8], FLOAT_CPU),
        ] {
            let loss = f64::from(&recon.forward(&images, &coarse, &refined, &masks)?);
            ensure!(loss.is_finite() && loss >= 0.0, "loss = {}", loss);
        }

        // an all-ones mask leaves only the hole terms
        let masks = Tensor::ones(&[2, 1, 8, 8], FLOAT_CPU);
        let hole_only = L1ReconLoss {
            coarse_unhole: 0.0,
            refined_unhole: 0.0,
            ..Default::default()
        };
        let lhs = f64::from(&recon.forward(&images, &coarse, &refined, &masks)?);
        let rhs = f64::from(&hole_only.forward(&images, &coarse, &refined, &masks)?);
        assert_abs_diff_eq!(lhs, rhs, epsilon = 1e-6);

        Ok(())
    }

    #[test]
    fn recon_loss_normalization_test() -> Result<()> {
        let images = Tensor::zeros(&[1, 3, 4, 4], FLOAT_CPU);
        let refined = Tensor::ones(&[1, 3, 4, 4], FLOAT_CPU);
        let masks = Tensor::zeros(&[1, 1, 4, 4], FLOAT_CPU);
        let _ = masks.narrow(2, 0, 1).fill_(1.0);

        let loss = L1ReconLoss {
            coarse_hole: 0.0,
            coarse_unhole: 0.0,
            refined_hole: 1.0,
            refined_unhole: 0.0,
        };
        // |diff| = 1 everywhere, hole weight = mask / 0.25, mean = 1
        let value = f64::from(&loss.forward(&images, &refined, &refined, &masks)?);
        assert_abs_diff_eq!(value, 1.0, epsilon = 1e-5);

        ensure!(loss
            .forward(&images, &refined, &refined, &Tensor::zeros(&[3, 1, 4, 4], FLOAT_CPU))
            .is_err());
        Ok(())
    }

    #[test]
    fn tv_loss_test() -> Result<()> {
        let flat = Tensor::ones(&[2, 3, 5, 5], FLOAT_CPU);
        assert_abs_diff_eq!(f64::from(&tv_loss(&flat)?), 0.0, epsilon = 1e-9);

        // a vertical ramp with unit steps, sum(dh^2) / count_h = 1 per sample
        let ramp = Tensor::arange(4, FLOAT_CPU)
            .view([1, 1, 4, 1])
            .expand(&[2, 1, 4, 4], false)
            .contiguous();
        assert_abs_diff_eq!(f64::from(&tv_loss(&ramp)?), 2.0, epsilon = 1e-6);

        ensure!(tv_loss(&Tensor::ones(&[3, 5, 5], FLOAT_CPU)).is_err());
        Ok(())
    }

    #[test]
    fn vgg_loss_test() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let extractor = VggFeatures::vgg19(&vs.root());
        let vgg_loss = VggLoss::new(Box::new(extractor), Device::Cpu);

        let target = Tensor::rand(&[2, 3, 32, 32], FLOAT_CPU);
        let (perc, style) = vgg_loss.forward(&target, &target)?;
        assert_abs_diff_eq!(f64::from(&perc), 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(f64::from(&style), 0.0, epsilon = 1e-6);

        let generated = Tensor::rand(&[2, 3, 32, 32], FLOAT_CPU).set_requires_grad(true);
        let (perc, style) = vgg_loss.forward(&generated, &target)?;
        let (perc, style) = (f64::from(&perc), f64::from(&style));
        ensure!(perc.is_finite() && perc > 0.0);
        ensure!(style.is_finite() && style >= 0.0);
        Ok(())
    }

    #[test]
    fn gram_matrix_test() -> Result<()> {
        let xs = Tensor::ones(&[1, 2, 2, 2], FLOAT_CPU);
        let gram = gram_matrix(&xs)?;
        ensure!(gram.size() == vec![1, 2, 2]);
        // each entry = 4 / (2 * 2 * 2)
        assert_abs_diff_eq!(f64::from(&gram.mean(Kind::Float)), 0.5, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn info_nce_implicit_test() -> Result<()> {
        let nce = InfoNce::default();
        let query = Tensor::randn(&[6, 16], FLOAT_CPU);
        let positive = Tensor::randn(&[6, 16], FLOAT_CPU);

        let loss = f64::from(&nce.forward(&query, &positive, None)?);
        ensure!(loss.is_finite() && loss >= 0.0);

        // matching pairs score better than random pairs
        let aligned = f64::from(&nce.forward(&query, &query, None)?);
        ensure!(aligned < loss);

        let per_sample = InfoNce {
            reduction: NceReduction::None,
            ..Default::default()
        }
        .forward(&query, &positive, None)?;
        ensure!(per_sample.size() == vec![6]);
        Ok(())
    }

    #[test]
    fn info_nce_negative_permutation_test() -> Result<()> {
        let nce = InfoNce::default();
        let query = Tensor::randn(&[4, 8], FLOAT_CPU);
        let positive = Tensor::randn(&[4, 8], FLOAT_CPU);
        let negatives = Tensor::randn(&[5, 8], FLOAT_CPU);
        let permuted = negatives.index_select(0, &Tensor::of_slice(&[3i64, 0, 4, 1, 2]));

        let lhs = f64::from(&nce.forward(&query, &positive, Some(&negatives))?);
        let rhs = f64::from(&nce.forward(&query, &positive, Some(&permuted))?);
        ensure!(lhs.is_finite() && lhs >= 0.0);
        assert_abs_diff_eq!(lhs, rhs, epsilon = 1e-5);
        Ok(())
    }

    #[test]
    fn info_nce_invalid_input_test() -> Result<()> {
        let nce = InfoNce::default();
        let query = Tensor::randn(&[4, 8], FLOAT_CPU);

        ensure!(nce
            .forward(&query, &Tensor::randn(&[3, 8], FLOAT_CPU), None)
            .is_err());
        ensure!(nce
            .forward(&query, &Tensor::randn(&[4, 8, 1], FLOAT_CPU), None)
            .is_err());
        ensure!(nce
            .forward(&query, &Tensor::randn(&[4, 7], FLOAT_CPU), None)
            .is_err());
        ensure!(nce
            .forward(
                &query,
                &Tensor::randn(&[4, 8], FLOAT_CPU),
                Some(&Tensor::randn(&[4, 6], FLOAT_CPU))
            )
            .is_err());
        Ok(())
    }
}
