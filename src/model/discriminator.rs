use super::conv::{Conv2D, Conv2DInit};
use crate::common::*;

/// Scores image/mask pairs. Higher scores mean more realistic.
pub trait InpaintDiscriminator {
    /// Returns a `[B, N]` score map flattened over the patches.
    fn forward_t(&self, image: &Tensor, mask: &Tensor, train: bool) -> Result<Tensor>;
}

#[derive(Debug, Clone)]
pub struct PatchDiscriminatorInit {
    pub ksize: usize,
    pub channels: Vec<usize>,
}

impl PatchDiscriminatorInit {
    pub fn new(base_channels: usize) -> Self {
        let c = base_channels;
        Self {
            ksize: 5,
            channels: vec![c * 2, c * 4, c * 8, c * 8, c * 8, c * 8],
        }
    }

    pub fn build<'a>(self, path: impl Borrow<nn::Path<'a>>) -> Result<PatchDiscriminator> {
        let path = path.borrow();
        let Self { ksize, channels } = self;
        ensure!(!channels.is_empty(), "zero depth is not allowed");

        let convs: Vec<_> = izip!(
            iter::once(4).chain(channels.iter().copied()),
            channels.iter().copied()
        )
        .enumerate()
        .map(|(index, (in_c, out_c))| {
            Conv2DInit {
                stride: 2,
                ..Conv2DInit::new(ksize)
            }
            .build(path / format!("conv_{}", index), in_c, out_c)
        })
        .try_collect()?;

        Ok(PatchDiscriminator { convs })
    }
}

/// Strided convolution stack classifying each receptive-field patch.
#[derive(Debug)]
pub struct PatchDiscriminator {
    convs: Vec<Conv2D>,
}

impl PatchDiscriminator {
    pub fn num_downsamples(&self) -> usize {
        self.convs.len()
    }
}

impl InpaintDiscriminator for PatchDiscriminator {
    fn forward_t(&self, image: &Tensor, mask: &Tensor, _train: bool) -> Result<Tensor> {
        let (b, c, h, w) = image.size4()?;
        ensure!(c == 3, "expect 3 image channels, but get {}", c);
        ensure!(
            mask.size() == vec![b, 1, h, w],
            "mask shape {:?} does not match image shape {:?}",
            mask.size(),
            image.size()
        );
        let scale = 1 << self.convs.len();
        ensure!(
            h >= scale && w >= scale,
            "image size {}x{} is too small for {} downsamplings",
            h,
            w,
            self.convs.len()
        );

        let xs = self.convs.iter().fold(
            Tensor::cat(&[image, mask], 1),
            |xs, conv| conv.forward(&xs).leaky_relu(),
        );
        Ok(xs.flatten(1, -1))
    }
}
