use crate::common::*;
use std::f64::consts::PI;

const IMAGE_CHANNELS: i64 = 3;

pub trait Augment {
    fn apply(&self, xs: &Tensor) -> Result<Tensor>;
}

/// Random flips, integer translations and colour jitter.
///
/// The input is a `[B, C, H, W]` batch with `C >= 3`. The first three
/// channels are an image in `[0, 255]`. Spatial transforms move every
/// channel identically, while colour transforms only touch the image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AugmentPipe {
    #[serde(default)]
    pub xflip: f64,
    #[serde(default)]
    pub xint: f64,
    #[serde(default = "default_xint_max")]
    pub xint_max: f64,
    #[serde(default)]
    pub brightness: f64,
    #[serde(default)]
    pub contrast: f64,
    #[serde(default)]
    pub hue: f64,
    #[serde(default)]
    pub saturation: f64,
    #[serde(default = "default_brightness_std")]
    pub brightness_std: f64,
    #[serde(default = "default_contrast_std")]
    pub contrast_std: f64,
    #[serde(default = "default_hue_max")]
    pub hue_max: f64,
    #[serde(default = "default_saturation_std")]
    pub saturation_std: f64,
}

impl Default for AugmentPipe {
    fn default() -> Self {
        Self {
            xflip: 1.0,
            xint: 0.75,
            xint_max: default_xint_max(),
            brightness: 0.75,
            contrast: 0.75,
            hue: 1.0,
            saturation: 0.75,
            brightness_std: default_brightness_std(),
            contrast_std: default_contrast_std(),
            hue_max: default_hue_max(),
            saturation_std: default_saturation_std(),
        }
    }
}

impl AugmentPipe {
    pub fn identity() -> Self {
        Self {
            xflip: 0.0,
            xint: 0.0,
            brightness: 0.0,
            contrast: 0.0,
            hue: 0.0,
            saturation: 0.0,
            ..Self::default()
        }
    }

    fn flip(&self, xs: Tensor) -> Tensor {
        if self.xflip <= 0.0 {
            return xs;
        }
        let batch_size = xs.size()[0];
        let options = (Kind::Float, xs.device());

        let selected = Tensor::rand(&[batch_size], options)
            .lt(self.xflip)
            .logical_and(&Tensor::rand(&[batch_size], options).lt(0.5));
        blend(&selected, &xs.flip(&[3]), &xs)
    }

    fn translate(&self, xs: Tensor) -> Result<Tensor> {
        if self.xint <= 0.0 || self.xint_max <= 0.0 {
            return Ok(xs);
        }
        let (batch_size, _c, height, width) = xs.size4()?;
        let options = (Kind::Float, xs.device());

        let shifts = (Tensor::rand(&[batch_size, 2], options) * 2.0 - 1.0) * self.xint_max;
        let enabled = Tensor::rand(&[batch_size, 1], options).lt(self.xint);
        let shifts = shifts * enabled.to_kind(Kind::Float);

        let pad_x = ((width as f64 * self.xint_max).ceil() as i64).min(width - 1);
        let pad_y = ((height as f64 * self.xint_max).ceil() as i64).min(height - 1);
        let padded = xs.reflection_pad2d(&[pad_x, pad_x, pad_y, pad_y]);

        let samples: Vec<_> = (0..batch_size)
            .map(|index| {
                let tx = ((shifts.double_value(&[index, 0]) * width as f64).round() as i64)
                    .clamp(-pad_x, pad_x);
                let ty = ((shifts.double_value(&[index, 1]) * height as f64).round() as i64)
                    .clamp(-pad_y, pad_y);
                padded
                    .get(index)
                    .narrow(1, pad_y - ty, height)
                    .narrow(2, pad_x - tx, width)
            })
            .collect();

        Ok(Tensor::stack(&samples, 0))
    }

    fn color_matrix(&self, batch_size: i64, device: Device) -> Tensor {
        let Self {
            brightness,
            contrast,
            hue,
            saturation,
            brightness_std,
            contrast_std,
            hue_max,
            saturation_std,
            ..
        } = *self;
        let options = (Kind::Float, device);
        let consts = ColorConsts::new(device);
        let enabled = |prob: f64| {
            Tensor::rand(&[batch_size, 1, 1], options)
                .lt(prob)
                .to_kind(Kind::Float)
        };

        let mut matrix = consts.identity.repeat(&[batch_size, 1, 1]);

        if brightness > 0.0 {
            let offset = Tensor::randn(&[batch_size, 1, 1], options) * brightness_std
                * enabled(brightness);
            matrix = (&consts.identity + &consts.translation * offset).matmul(&matrix);
        }

        if contrast > 0.0 {
            let gain = (Tensor::randn(&[batch_size, 1, 1], options) * contrast_std
                * enabled(contrast))
            .exp2();
            matrix = (&consts.rgb * gain + &consts.alpha).matmul(&matrix);
        }

        if hue > 0.0 && hue_max > 0.0 {
            let theta = (Tensor::rand(&[batch_size, 1, 1], options) * 2.0 - 1.0)
                * (PI * hue_max)
                * enabled(hue);
            let rotation = &consts.rgb * theta.cos()
                + &consts.luma_cross * theta.sin()
                + &consts.luma_outer * (-theta.cos() + 1.0)
                + &consts.alpha;
            matrix = rotation.matmul(&matrix);
        }

        if saturation > 0.0 {
            let gain = (Tensor::randn(&[batch_size, 1, 1], options) * saturation_std
                * enabled(saturation))
            .exp2();
            let desaturate =
                &consts.luma_outer + (&consts.rgb - &consts.luma_outer) * gain + &consts.alpha;
            matrix = desaturate.matmul(&matrix);
        }

        matrix
    }

    fn color(&self, xs: Tensor) -> Result<Tensor> {
        let Self {
            brightness,
            contrast,
            hue,
            saturation,
            ..
        } = *self;
        if brightness <= 0.0 && contrast <= 0.0 && hue <= 0.0 && saturation <= 0.0 {
            return Ok(xs);
        }

        let (batch_size, channels, height, width) = xs.size4()?;
        let matrix = self.color_matrix(batch_size, xs.device());

        let image = xs.narrow(1, 0, IMAGE_CHANNELS) / 127.5 - 1.0;
        let pixels = image.view([batch_size, IMAGE_CHANNELS, height * width]);
        let pixels = matrix
            .narrow(1, 0, 3)
            .narrow(2, 0, 3)
            .matmul(&pixels)
            + matrix.narrow(1, 0, 3).narrow(2, 3, 1);
        let image = ((pixels.view([batch_size, IMAGE_CHANNELS, height, width]) + 1.0) * 127.5)
            .clamp(0.0, 255.0);

        if channels == IMAGE_CHANNELS {
            Ok(image)
        } else {
            let rest = xs.narrow(1, IMAGE_CHANNELS, channels - IMAGE_CHANNELS);
            Ok(Tensor::cat(&[image, rest], 1))
        }
    }
}

impl Augment for AugmentPipe {
    fn apply(&self, xs: &Tensor) -> Result<Tensor> {
        let (_b, c, h, w) = xs.size4()?;
        ensure!(
            c >= IMAGE_CHANNELS,
            "expect at least {} channels, but get {}",
            IMAGE_CHANNELS,
            c
        );
        ensure!(h >= 2 && w >= 2, "image size {}x{} is too small", h, w);

        let xs = self.flip(xs.shallow_clone());
        let xs = self.translate(xs)?;
        let xs = self.color(xs)?;
        Ok(xs)
    }
}

struct ColorConsts {
    identity: Tensor,
    translation: Tensor,
    rgb: Tensor,
    alpha: Tensor,
    luma_outer: Tensor,
    luma_cross: Tensor,
}

impl ColorConsts {
    fn new(device: Device) -> Self {
        let matrix = |values: &[f32]| Tensor::of_slice(values).view([1, 4, 4]).to_device(device);
        let third = 1.0 / 3.0;
        let v = 1.0 / 3f32.sqrt();

        Self {
            identity: matrix(&[
                1., 0., 0., 0., //
                0., 1., 0., 0., //
                0., 0., 1., 0., //
                0., 0., 0., 1.,
            ]),
            translation: matrix(&[
                0., 0., 0., 1., //
                0., 0., 0., 1., //
                0., 0., 0., 1., //
                0., 0., 0., 0.,
            ]),
            rgb: matrix(&[
                1., 0., 0., 0., //
                0., 1., 0., 0., //
                0., 0., 1., 0., //
                0., 0., 0., 0.,
            ]),
            alpha: matrix(&[
                0., 0., 0., 0., //
                0., 0., 0., 0., //
                0., 0., 0., 0., //
                0., 0., 0., 1.,
            ]),
            luma_outer: matrix(&[
                third, third, third, 0., //
                third, third, third, 0., //
                third, third, third, 0., //
                0., 0., 0., 0.,
            ]),
            luma_cross: matrix(&[
                0., -v, v, 0., //
                v, 0., -v, 0., //
                -v, v, 0., 0., //
                0., 0., 0., 0.,
            ]),
        }
    }
}

fn blend(selected: &Tensor, lhs: &Tensor, rhs: &Tensor) -> Tensor {
    let weight = selected.to_kind(Kind::Float).view([-1, 1, 1, 1]);
    lhs * &weight + rhs * (-&weight + 1.0)
}

fn default_xint_max() -> f64 {
    0.125
}

fn default_brightness_std() -> f64 {
    0.2
}

fn default_contrast_std() -> f64 {
    0.5
}

fn default_hue_max() -> f64 {
    1.0
}

fn default_saturation_std() -> f64 {
    1.0
}
