use crate::common::*;
use tch::CModule;
use tokio_stream::wrappers::ReadDirStream;

const INCEPTION_SIZE: i64 = 299;
const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg"];

/// Fréchet Inception Distance between two image directories.
///
/// The TorchScript module takes `[B, 3, 299, 299]` RGB batches in `[0, 1]`
/// and returns pooled features `[B, D]` or `[B, D, 1, 1]`.
#[derive(Debug, Clone)]
pub struct FidInit {
    pub real_dir: PathBuf,
    pub fake_dir: PathBuf,
    pub model_file: PathBuf,
    pub batch_size: usize,
    pub num_workers: usize,
    pub device: Device,
}

impl FidInit {
    pub async fn compute(self) -> Result<f64> {
        let Self {
            real_dir,
            fake_dir,
            model_file,
            batch_size,
            num_workers,
            device,
        } = self;
        ensure!(batch_size > 0, "zero batch_size is not allowed");
        ensure!(num_workers > 0, "zero num_workers is not allowed");

        let model = CModule::load_on_device(&model_file, device).with_context(|| {
            format!("unable to load Inception model '{}'", model_file.display())
        })?;

        let real_stats = directory_stats(&model, &real_dir, batch_size, num_workers, device).await?;
        let fake_stats = directory_stats(&model, &fake_dir, batch_size, num_workers, device).await?;
        let fid = real_stats.frechet_distance(&fake_stats)?;

        info!(
            "FID between '{}' and '{}' is {}",
            real_dir.display(),
            fake_dir.display(),
            fid
        );
        Ok(fid)
    }
}

#[derive(Debug)]
pub struct FeatureStats {
    pub mean: Tensor,
    pub cov: Tensor,
}

impl FeatureStats {
    pub fn from_features(features: &Tensor) -> Result<Self> {
        let (num_samples, _dim) = features.size2()?;
        ensure!(
            num_samples >= 2,
            "at least 2 samples are required, but get {}",
            num_samples
        );

        let features = features.to_kind(Kind::Double).to_device(Device::Cpu);
        let mean = features.mean_dim(&[0], false, Kind::Double);
        let centered = &features - mean.unsqueeze(0);
        let cov = centered.tr().mm(&centered) / (num_samples - 1) as f64;

        Ok(Self { mean, cov })
    }

    /// `|mu1 - mu2|^2 + tr(S1) + tr(S2) - 2 tr(sqrt(sqrt(S1) S2 sqrt(S1)))`
    pub fn frechet_distance(&self, other: &Self) -> Result<f64> {
        ensure!(
            self.mean.size() == other.mean.size(),
            "feature dimensions differ: {:?} vs {:?}",
            self.mean.size(),
            other.mean.size()
        );

        let diff = &self.mean - &other.mean;
        let sqrt_cov = sqrtm_psd(&self.cov);
        let product = sqrt_cov.mm(&other.cov).mm(&sqrt_cov);
        let product = (&product + product.tr()) / 2.0;
        let (eigenvalues, _) = product.linalg_eigh("L");
        let trace_covmean = eigenvalues.clamp_min(0.0).sqrt().sum(Kind::Double);

        let distance = diff.dot(&diff) + self.cov.trace() + other.cov.trace() - trace_covmean * 2.0;
        Ok(f64::from(&distance))
    }
}

fn sqrtm_psd(matrix: &Tensor) -> Tensor {
    let (eigenvalues, eigenvectors) = matrix.linalg_eigh("L");
    let root = eigenvalues.clamp_min(0.0).sqrt();
    (&eigenvectors * root.unsqueeze(0)).mm(&eigenvectors.tr())
}

async fn directory_stats(
    model: &CModule,
    dir: &Path,
    batch_size: usize,
    num_workers: usize,
    device: Device,
) -> Result<FeatureStats> {
    let files = list_images(dir).await?;
    ensure!(
        files.len() >= 2,
        "at least 2 images are required in '{}', but found {}",
        dir.display(),
        files.len()
    );
    info!("found {} images in '{}'", files.len(), dir.display());

    let mut batches = Box::pin(
        stream::iter(files)
            .map(|file| async move {
                tokio::task::spawn_blocking(move || load_image(&file)).await?
            })
            .buffered(num_workers)
            .chunks(batch_size),
    );

    let mut features = vec![];
    while let Some(results) = batches.next().await {
        let images: Vec<_> = results.into_iter().try_collect()?;
        let batch = Tensor::stack(&images, 0).to_device(device);
        let output = tch::no_grad(|| model.forward_ts(&[batch]))?;
        features.push(output.flatten(1, -1).to_device(Device::Cpu));
    }

    FeatureStats::from_features(&Tensor::cat(&features, 0))
}

async fn list_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let read_dir = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("unable to read directory '{}'", dir.display()))?;

    let mut files: Vec<_> = ReadDirStream::new(read_dir)
        .map_err(Error::from)
        .try_filter_map(|entry| async move {
            let path = entry.path();
            let is_image = path
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
                .unwrap_or(false);
            Fallible::Ok(is_image.then(|| path))
        })
        .try_collect()
        .await?;
    files.sort();

    Ok(files)
}

fn load_image(file: &Path) -> Result<Tensor> {
    let image = tch::vision::image::load_and_resize(file, INCEPTION_SIZE, INCEPTION_SIZE)
        .with_context(|| format!("unable to load image '{}'", file.display()))?;
    Ok(image.to_kind(Kind::Float) / 255.0)
}
