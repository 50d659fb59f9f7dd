use super::conv::{Conv2D, Conv2DInit, GatedConv2D, GatedConv2DInit};
use crate::common::*;

pub trait InpaintGenerator {
    fn forward_t(&self, image: &Tensor, mask: &Tensor, train: bool) -> Result<GeneratorOutput>;
}

#[derive(Debug, TensorLike)]
pub struct GeneratorOutput {
    pub embedding: Tensor,
    pub coarse: Tensor,
    pub refined: Tensor,
}

/// Keeps known pixels from `image` and takes hole pixels from `output`.
pub fn composite(output: &Tensor, image: &Tensor, mask: &Tensor) -> Tensor {
    mask * output + (-mask + 1.0) * image
}

#[derive(Debug, Clone)]
pub struct GatedGeneratorInit {
    pub base_channels: usize,
    pub embedding_dim: usize,
}

impl GatedGeneratorInit {
    pub fn build<'a>(self, path: impl Borrow<nn::Path<'a>>) -> Result<GatedGenerator> {
        let path = path.borrow();
        let Self {
            base_channels,
            embedding_dim,
        } = self;
        ensure!(base_channels > 0, "zero base_channels is not allowed");
        ensure!(embedding_dim > 0, "zero embedding_dim is not allowed");

        let coarse = GatedStage::new(path / "coarse", base_channels)?;
        let refine = GatedStage::new(path / "refine", base_channels)?;
        let embedding = nn::linear(
            path / "embedding",
            (base_channels * 4) as i64,
            embedding_dim as i64,
            Default::default(),
        );

        Ok(GatedGenerator {
            coarse,
            refine,
            embedding,
        })
    }
}

/// Coarse-to-fine generator built from gated convolutions.
///
/// The embedding is pooled from the bottleneck of the refinement stage.
#[derive(Debug)]
pub struct GatedGenerator {
    coarse: GatedStage,
    refine: GatedStage,
    embedding: nn::Linear,
}

impl InpaintGenerator for GatedGenerator {
    fn forward_t(&self, image: &Tensor, mask: &Tensor, _train: bool) -> Result<GeneratorOutput> {
        let (b, c, h, w) = image.size4()?;
        ensure!(c == 3, "expect 3 image channels, but get {}", c);
        ensure!(
            mask.size() == vec![b, 1, h, w],
            "mask shape {:?} does not match image shape {:?}",
            mask.size(),
            image.size()
        );
        ensure!(
            h % 4 == 0 && w % 4 == 0,
            "image size must be a multiple of 4, but get {}x{}",
            h,
            w
        );

        let masked = image * (-mask + 1.0);
        let (_, coarse) = self.coarse.forward(&Tensor::cat(&[&masked, mask], 1));

        let blended = composite(&coarse, image, mask);
        let (bottleneck, refined) = self.refine.forward(&Tensor::cat(&[&blended, mask], 1));

        let embedding = self
            .embedding
            .forward(&bottleneck.adaptive_avg_pool2d(&[1, 1]).flatten(1, -1));

        Ok(GeneratorOutput {
            embedding,
            coarse,
            refined,
        })
    }
}

#[derive(Debug)]
struct GatedStage {
    encoder: Vec<GatedConv2D>,
    bottleneck: Vec<GatedConv2D>,
    decoder: Vec<GatedConv2D>,
    to_rgb: Conv2D,
}

impl GatedStage {
    fn new(path: nn::Path, c: usize) -> Result<Self> {
        let down = |ksize| GatedConv2DInit {
            conv: Conv2DInit {
                stride: 2,
                ..Conv2DInit::new(ksize)
            },
            activation: true,
        };
        let up = || GatedConv2DInit {
            conv: Conv2DInit::upsample(),
            activation: true,
        };

        let encoder = vec![
            GatedConv2DInit::new(5).build(&path / "enc_0", 4, c)?,
            down(3).build(&path / "enc_1", c, c * 2)?,
            GatedConv2DInit::new(3).build(&path / "enc_2", c * 2, c * 2)?,
            down(3).build(&path / "enc_3", c * 2, c * 4)?,
            GatedConv2DInit::new(3).build(&path / "enc_4", c * 4, c * 4)?,
        ];

        let bottleneck: Vec<_> = [2, 4, 8]
            .iter()
            .enumerate()
            .map(|(index, &dilation)| {
                GatedConv2DInit {
                    conv: Conv2DInit::dilated(3, dilation),
                    activation: true,
                }
                .build(&path / format!("dilated_{}", index), c * 4, c * 4)
            })
            .try_collect()?;

        let decoder = vec![
            up().build(&path / "dec_0", c * 4, c * 2)?,
            GatedConv2DInit::new(3).build(&path / "dec_1", c * 2, c * 2)?,
            up().build(&path / "dec_2", c * 2, c)?,
            GatedConv2DInit::new(3).build(&path / "dec_3", c, c)?,
        ];

        let to_rgb = Conv2DInit::new(3).build(&path / "to_rgb", c, 3)?;

        Ok(Self {
            encoder,
            bottleneck,
            decoder,
            to_rgb,
        })
    }

    fn forward(&self, input: &Tensor) -> (Tensor, Tensor) {
        let xs = self
            .encoder
            .iter()
            .chain(&self.bottleneck)
            .fold(input.shallow_clone(), |xs, layer| layer.forward(&xs));
        let output = self
            .decoder
            .iter()
            .fold(xs.shallow_clone(), |xs, layer| layer.forward(&xs));
        let output = self.to_rgb.forward(&output).tanh();
        (xs, output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generator_test() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let generator = GatedGeneratorInit {
            base_channels: 8,
            embedding_dim: 16,
        }
        .build(&vs.root())?;

        let image = Tensor::rand(&[2, 3, 32, 32], FLOAT_CPU) * 2.0 - 1.0;
        let mask = Tensor::rand(&[2, 1, 32, 32], FLOAT_CPU).ge(0.5).to_kind(Kind::Float);
        let GeneratorOutput {
            embedding,
            coarse,
            refined,
        } = generator.forward_t(&image, &mask, true)?;

        ensure!(embedding.size() == vec![2, 16]);
        ensure!(coarse.size() == vec![2, 3, 32, 32]);
        ensure!(refined.size() == vec![2, 3, 32, 32]);
        ensure!(f64::from(&refined.abs().max()) <= 1.0);

        let bad_mask = Tensor::zeros(&[2, 3, 32, 32], FLOAT_CPU);
        ensure!(generator.forward_t(&image, &bad_mask, true).is_err());
        Ok(())
    }

    #[test]
    fn composite_test() -> Result<()> {
        let image = Tensor::rand(&[2, 3, 8, 8], FLOAT_CPU);
        let output = Tensor::rand(&[2, 3, 8, 8], FLOAT_CPU);
        let mask = Tensor::rand(&[2, 1, 8, 8], FLOAT_CPU).ge(0.5).to_kind(Kind::Float);
        let recon = composite(&output, &image, &mask);

        let known = -&mask + 1.0;
        let diff = ((&recon - &image) * &known).abs().max();
        ensure!(f64::from(&diff) == 0.0);

        let diff = ((&recon - &output) * &mask).abs().max();
        ensure!(f64::from(&diff) == 0.0);
        Ok(())
    }
}
