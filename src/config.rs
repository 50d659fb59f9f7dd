use crate::{
    augment::AugmentPipe,
    common::*,
    model::{DiscriminatorLossKind, L1ReconLoss},
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub dataset: Dataset,
    pub train: Training,
    pub loss: Loss,
    #[serde(default)]
    pub augment: AugmentPipe,
    pub logging: Logging,
    pub metrics: Metrics,
    #[serde(default)]
    pub model: Model,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file '{}'", path.display()))?;
        let config: Self = json5::from_str(&text)
            .with_context(|| format!("unable to parse config file '{}'", path.display()))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let Self {
            dataset,
            train,
            loss,
            logging,
            ..
        } = self;

        ensure!(
            dataset.dataset_dir.is_dir(),
            "dataset directory '{}' does not exist",
            dataset.dataset_dir.display()
        );
        ensure!(
            dataset.input_size.get() >= 16,
            "input_size must be at least 16, but get {}",
            dataset.input_size
        );

        ensure!(
            train.nodes.get() == 1,
            "multi-node training is not supported, but get nodes = {}",
            train.nodes
        );
        ensure!(
            train.node_rank < train.nodes.get(),
            "node rank {} is out of range for {} nodes",
            train.node_rank,
            train.nodes
        );
        ensure!(
            train.devices.len() == train.gpus.get(),
            "{} devices are listed but gpus = {}",
            train.devices.len(),
            train.gpus
        );
        ensure!(
            train.learning_rate_g.raw() > 0.0 && train.learning_rate_d.raw() > 0.0,
            "learning rates must be positive"
        );
        train.devices.iter().try_for_each(|entry| -> Result<_> {
            if let Device::Cuda(index) = entry.0 {
                ensure!(
                    (index as i64) < tch::Cuda::device_count(),
                    "CUDA device {} is not available",
                    index
                );
            }
            Ok(())
        })?;

        ensure!(loss.temperature.raw() > 0.0, "temperature must be positive");
        ensure!(
            loss.perceptual_weight.raw() >= 0.0 && loss.style_weight.raw() >= 0.0,
            "loss weights must be non-negative"
        );

        for (name, dir) in [
            ("checkpoint_dir", &logging.checkpoint_dir),
            ("plots_dir", &logging.plots_dir),
            ("video_dir", &logging.video_dir),
        ] {
            ensure!(
                !dir.as_os_str().is_empty(),
                "logging.{} must be specified",
                name
            );
        }

        Ok(())
    }

    pub fn world_size(&self) -> usize {
        self.train.nodes.get() * self.train.gpus.get()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dataset {
    pub dataset_dir: PathBuf,
    #[serde(default = "default_csv_file")]
    pub csv_file: String,
    pub input_size: NonZeroUsize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Training {
    pub epochs: usize,
    pub batch_size: NonZeroUsize,
    pub learning_rate_g: R64,
    pub learning_rate_d: R64,
    #[serde(default = "default_nodes")]
    pub nodes: NonZeroUsize,
    #[serde(default = "default_nodes")]
    pub gpus: NonZeroUsize,
    #[serde(default)]
    pub node_rank: usize,
    #[serde(default = "default_devices")]
    pub devices: Vec<DeviceEntry>,
    #[serde(default)]
    pub resume: bool,
    #[serde(default)]
    pub seed: i64,
    #[serde(default = "default_true")]
    pub mixed_precision: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceEntry(#[serde(with = "tch_serde::serde_device")] pub Device);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Loss {
    #[serde(default)]
    pub discriminator: DiscriminatorLossKind,
    #[serde(default)]
    pub recon: L1ReconLoss,
    #[serde(default = "default_perceptual_weight")]
    pub perceptual_weight: R64,
    #[serde(default = "default_style_weight")]
    pub style_weight: R64,
    #[serde(default = "default_temperature")]
    pub temperature: R64,
    /// VGG19 weights in tch format. Random weights are used when absent.
    pub vgg19_weights: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Logging {
    pub screen_steps: NonZeroUsize,
    pub checkpoint_dir: PathBuf,
    pub plots_dir: PathBuf,
    pub video_dir: PathBuf,
    /// Directory of TensorBoard event files. Events are not written if unset.
    pub event_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metrics {
    pub plot_steps: NonZeroUsize,
    #[serde(default = "default_reference_size")]
    pub reference_size: NonZeroUsize,
    /// LPIPS VGG16 weights in tch format. Random weights are used when absent.
    pub lpips_weights: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    pub base_channels: NonZeroUsize,
    pub embedding_dim: NonZeroUsize,
}

impl Default for Model {
    fn default() -> Self {
        Self {
            base_channels: NonZeroUsize::new(32).unwrap(),
            embedding_dim: NonZeroUsize::new(128).unwrap(),
        }
    }
}

fn default_csv_file() -> String {
    "maskffhq.csv".into()
}

fn default_nodes() -> NonZeroUsize {
    NonZeroUsize::new(1).unwrap()
}

fn default_devices() -> Vec<DeviceEntry> {
    vec![DeviceEntry(Device::cuda_if_available())]
}

fn default_true() -> bool {
    true
}

fn default_perceptual_weight() -> R64 {
    r64(0.05)
}

fn default_style_weight() -> R64 {
    r64(40.0)
}

fn default_temperature() -> R64 {
    r64(0.1)
}

fn default_reference_size() -> NonZeroUsize {
    NonZeroUsize::new(1).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_CONFIG: &str = r#"{
        dataset: { dataset_dir: ".", input_size: 64 },
        train: {
            epochs: 1,
            batch_size: 2,
            learning_rate_g: 0.0001,
            learning_rate_d: 0.0004,
        },
        loss: {},
        logging: {
            screen_steps: 100,
            checkpoint_dir: "checkpoints",
            plots_dir: "plots",
            video_dir: "video",
        },
        metrics: { plot_steps: 100 },
    }"#;

    #[test]
    fn parse_config_test() -> Result<()> {
        let config: Config = json5::from_str(TEST_CONFIG)?;
        config.validate()?;

        ensure!(config.world_size() == 1);
        ensure!(config.loss.perceptual_weight == 0.05);
        ensure!(config.loss.style_weight == 40.0);
        ensure!(config.loss.discriminator == DiscriminatorLossKind::Hinge);
        ensure!(config.dataset.csv_file == "maskffhq.csv");
        ensure!(config.train.mixed_precision);

        Ok(())
    }

    #[test]
    fn reject_multi_node_test() -> Result<()> {
        let mut config: Config = json5::from_str(TEST_CONFIG)?;
        config.train.nodes = NonZeroUsize::new(2).unwrap();
        ensure!(config.validate().is_err());

        let mut config: Config = json5::from_str(TEST_CONFIG)?;
        config.dataset.dataset_dir = "/non/existent/dir".into();
        ensure!(config.validate().is_err());

        let mut config: Config = json5::from_str(TEST_CONFIG)?;
        config.logging.plots_dir = PathBuf::new();
        ensure!(config.validate().is_err());

        Ok(())
    }
}
