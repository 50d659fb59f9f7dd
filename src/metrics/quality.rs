use crate::common::*;

const SSIM_WINDOW: i64 = 7;
const SSIM_K1: f64 = 0.01;
const SSIM_K2: f64 = 0.03;
const DEFAULT_DATA_RANGE: f64 = 255.0;

pub const MAX_PSNR: f64 = 100.0;

/// Structural similarity of two `[C, H, W]` images in `[0, 255]`.
///
/// A uniform 7x7 window with sample covariance is slid over the valid
/// region of each channel, and the mean SSIM is returned. The data range
/// is taken from `reference`.
pub fn ssim(reference: &Tensor, image: &Tensor) -> Result<f64> {
    ensure!(
        reference.size() == image.size(),
        "shape mismatch {:?} vs {:?}",
        reference.size(),
        image.size()
    );
    let (_c, h, w) = reference.size3()?;
    ensure!(
        h >= SSIM_WINDOW && w >= SSIM_WINDOW,
        "image must be at least {0}x{0}, but get {1}x{2}",
        SSIM_WINDOW,
        h,
        w
    );

    let x = reference.detach().to_kind(Kind::Double).unsqueeze(0);
    let y = image.detach().to_kind(Kind::Double).unsqueeze(0);

    let data_range = {
        let range = f64::from(&(x.max() - x.min()));
        if range > 0.0 {
            range
        } else {
            DEFAULT_DATA_RANGE
        }
    };

    let num_pixels = (SSIM_WINDOW * SSIM_WINDOW) as f64;
    let cov_norm = num_pixels / (num_pixels - 1.0);
    let filter = |xs: &Tensor| {
        xs.avg_pool2d(
            &[SSIM_WINDOW, SSIM_WINDOW],
            &[1, 1],
            &[0, 0],
            false,
            true,
            None::<i64>,
        )
    };

    let ux = filter(&x);
    let uy = filter(&y);
    let uxx = filter(&(&x * &x));
    let uyy = filter(&(&y * &y));
    let uxy = filter(&(&x * &y));
    let vx = (uxx - &ux * &ux) * cov_norm;
    let vy = (uyy - &uy * &uy) * cov_norm;
    let vxy = (uxy - &ux * &uy) * cov_norm;

    let c1 = (SSIM_K1 * data_range).powi(2);
    let c2 = (SSIM_K2 * data_range).powi(2);
    let numerator = (&ux * &uy * 2.0 + c1) * (vxy * 2.0 + c2);
    let denominator = (ux.square() + uy.square() + c1) * (vx + vy + c2);
    let ssim_map = numerator / denominator;

    Ok(f64::from(&ssim_map.mean(Kind::Double)))
}

pub fn psnr(reference: &Tensor, image: &Tensor) -> Result<f64> {
    ensure!(
        reference.size() == image.size(),
        "shape mismatch {:?} vs {:?}",
        reference.size(),
        image.size()
    );

    let diff = reference.detach().to_kind(Kind::Double) - image.detach().to_kind(Kind::Double);
    let mse = f64::from(&diff.square().mean(Kind::Double));
    if mse == 0.0 {
        return Ok(MAX_PSNR);
    }
    Ok(20.0 * (255.0 / mse.sqrt()).log10())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn identical_images_test() -> Result<()> {
        let image = Tensor::rand(&[3, 16, 16], FLOAT_CPU) * 255.0;
        assert_abs_diff_eq!(ssim(&image, &image)?, 1.0, epsilon = 1e-9);
        ensure!(psnr(&image, &image)? == MAX_PSNR);
        Ok(())
    }

    #[test]
    fn degraded_image_test() -> Result<()> {
        let image = Tensor::rand(&[3, 16, 16], FLOAT_CPU) * 255.0;
        let noisy = (&image + Tensor::randn(&[3, 16, 16], FLOAT_CPU) * 20.0).clamp(0.0, 255.0);
        let score = ssim(&image, &noisy)?;
        ensure!(score < 1.0 && score > -1.0, "ssim = {}", score);

        // a uniform error of 1 gives 20 * log10(255)
        let shifted = &image + 1.0;
        assert_abs_diff_eq!(psnr(&image, &shifted)?, 20.0 * 255f64.log10(), epsilon = 1e-4);

        // constant references fall back to the 8-bit range
        let flat = Tensor::zeros(&[1, 8, 8], FLOAT_CPU);
        assert_abs_diff_eq!(ssim(&flat, &flat)?, 1.0, epsilon = 1e-9);

        ensure!(ssim(&image, &Tensor::zeros(&[3, 8, 8], FLOAT_CPU)).is_err());
        ensure!(ssim(&flat.narrow(1, 0, 4), &flat.narrow(1, 0, 4)).is_err());
        Ok(())
    }
}
