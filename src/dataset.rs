use crate::common::*;
use tch::vision;

/// Random-access source of `(image, mask)` pairs.
///
/// Images are `[3, H, W]` float tensors in `[0, 255]`. Masks are `[1, H, W]`
/// float tensors in `{0, 1}` where 1 marks the hole.
pub trait InpaintDataset: fmt::Debug + Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn item(&self, index: usize) -> Result<(Tensor, Tensor)>;
}

#[derive(Debug, Clone)]
pub struct FaceMaskDatasetInit<P>
where
    P: AsRef<Path>,
{
    pub dataset_dir: P,
    pub csv_file: String,
    pub input_size: usize,
}

impl<P> FaceMaskDatasetInit<P>
where
    P: AsRef<Path>,
{
    pub async fn load(self) -> Result<FaceMaskDataset> {
        let Self {
            dataset_dir,
            csv_file,
            input_size,
        } = self;
        let dataset_dir = dataset_dir.as_ref().to_owned();
        let index_file = dataset_dir.join(&csv_file);

        let mut reader = csv::Reader::from_path(&index_file)
            .with_context(|| format!("unable to open '{}'", index_file.display()))?;
        let entries: Vec<_> = reader
            .records()
            .enumerate()
            .map(|(line, record)| -> Result<_> {
                let record = record?;
                let (image, mask) = match (record.get(1), record.get(2)) {
                    (Some(image), Some(mask)) => (image, mask),
                    _ => bail!(
                        "row {} of '{}' has less than 3 columns",
                        line + 1,
                        index_file.display()
                    ),
                };
                Ok(MaskedImageEntry {
                    image: dataset_dir.join(image),
                    mask: dataset_dir.join(mask),
                })
            })
            .try_collect()?;

        ensure!(!entries.is_empty(), "empty dataset is not allowed");
        info!("{} image/mask pairs in '{}'", entries.len(), index_file.display());

        stream::iter(entries.clone())
            .map(Fallible::Ok)
            .try_par_for_each(None, |entry| async move {
                ensure!(entry.image.is_file(), "'{}' is not a file", entry.image.display());
                ensure!(entry.mask.is_file(), "'{}' is not a file", entry.mask.display());
                Ok(())
            })
            .await?;

        Ok(FaceMaskDataset {
            entries,
            input_size: input_size as i64,
        })
    }
}

#[derive(Debug)]
pub struct FaceMaskDataset {
    entries: Vec<MaskedImageEntry>,
    input_size: i64,
}

impl InpaintDataset for FaceMaskDataset {
    fn len(&self) -> usize {
        self.entries.len()
    }

    fn item(&self, index: usize) -> Result<(Tensor, Tensor)> {
        let Self {
            ref entries,
            input_size,
        } = *self;
        let entry = entries
            .get(index)
            .ok_or_else(|| format_err!("index {} is out of bound", index))?;

        let image = vision::image::load_and_resize(&entry.image, input_size, input_size)
            .with_context(|| format!("unable to load '{}'", entry.image.display()))?
            .to_kind(Kind::Float);
        let mask = vision::image::load_and_resize(&entry.mask, input_size, input_size)
            .with_context(|| format!("unable to load '{}'", entry.mask.display()))?
            .narrow(0, 0, 1)
            .to_kind(Kind::Float)
            .ge(128.0)
            .to_kind(Kind::Float);

        Ok((image, mask))
    }
}

#[derive(Debug, Clone)]
struct MaskedImageEntry {
    image: PathBuf,
    mask: PathBuf,
}

#[derive(Debug, Clone)]
pub struct RandomDataset {
    pub len: usize,
    pub input_size: usize,
}

impl RandomDataset {
    pub fn new(input_size: usize) -> Self {
        Self {
            len: 50,
            input_size,
        }
    }
}

impl InpaintDataset for RandomDataset {
    fn len(&self) -> usize {
        self.len
    }

    fn item(&self, index: usize) -> Result<(Tensor, Tensor)> {
        ensure!(index < self.len, "index {} is out of bound", index);
        let size = self.input_size as i64;
        let image = Tensor::rand(&[3, size, size], FLOAT_CPU) * 255.0;
        let mask = Tensor::randint(2, &[1, size, size], FLOAT_CPU);
        Ok((image, mask))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_dataset_test() -> Result<()> {
        let dataset = RandomDataset::new(32);
        ensure!(dataset.len() == 50);

        let (image, mask) = dataset.item(3)?;
        ensure!(image.size() == vec![3, 32, 32]);
        ensure!(mask.size() == vec![1, 32, 32]);
        ensure!(f64::from(&(&mask * (-&mask + 1.0)).abs().max()) == 0.0);
        ensure!(dataset.item(50).is_err());
        Ok(())
    }

    #[tokio::test]
    async fn face_mask_dataset_test() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let image = Tensor::full(&[3, 20, 20], 200i64, (Kind::Uint8, Device::Cpu));
        let mask = Tensor::cat(
            &[
                Tensor::zeros(&[3, 20, 10], (Kind::Uint8, Device::Cpu)),
                Tensor::full(&[3, 20, 10], 255i64, (Kind::Uint8, Device::Cpu)),
            ],
            2,
        );
        vision::image::save(&image, dir.path().join("image.png"))?;
        vision::image::save(&mask, dir.path().join("mask.png"))?;
        fs::write(
            dir.path().join("index.csv"),
            "id,image,mask\n0,image.png,mask.png\n",
        )?;

        let dataset = FaceMaskDatasetInit {
            dataset_dir: dir.path(),
            csv_file: "index.csv".into(),
            input_size: 16,
        }
        .load()
        .await?;
        ensure!(dataset.len() == 1);

        let (image, mask) = dataset.item(0)?;
        ensure!(image.size() == vec![3, 16, 16]);
        ensure!(mask.size() == vec![1, 16, 16]);
        ensure!(f64::from(&mask.narrow(2, 0, 4).max()) == 0.0);
        ensure!(f64::from(&mask.narrow(2, 12, 4).min()) == 1.0);
        ensure!(dataset.item(1).is_err());
        Ok(())
    }

    #[tokio::test]
    async fn missing_file_test() -> Result<()> {
        let dir = tempfile::tempdir()?;
        fs::write(
            dir.path().join("index.csv"),
            "id,image,mask\n0,image.png,mask.png\n",
        )?;

        let result = FaceMaskDatasetInit {
            dataset_dir: dir.path(),
            csv_file: "index.csv".into(),
            input_size: 16,
        }
        .load()
        .await;
        ensure!(result.is_err());
        Ok(())
    }
}
