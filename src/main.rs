use anyhow::Result;
use mask_inpaint::{
    common::*,
    config::{self, DeviceEntry},
    metrics::FidInit,
};
use std::env;
use tracing_subscriber::{filter::LevelFilter, prelude::*, EnvFilter};

#[derive(Debug, Clone, StructOpt)]
/// Adversarial image inpainting with gated convolutions.
enum Args {
    /// Train the inpainting networks.
    Train(TrainArgs),
    /// Compute the FID between two image directories.
    Fid(FidArgs),
}

#[derive(Debug, Clone, StructOpt)]
struct TrainArgs {
    #[structopt(long, default_value = "config.json5")]
    config: PathBuf,
    /// Resume from the files in the checkpoint directory.
    #[structopt(long)]
    checkpoint: bool,
    /// How often to print losses, save examples and plot metrics.
    #[structopt(long)]
    screenstep: Option<NonZeroUsize>,
    /// How often to plot metrics, overriding --screenstep.
    #[structopt(long)]
    plotstep: Option<NonZeroUsize>,
    #[structopt(long)]
    nodes: Option<NonZeroUsize>,
    /// Number of devices on this node.
    #[structopt(long)]
    gpus: Option<NonZeroUsize>,
    /// Rank of this node.
    #[structopt(long)]
    nr: Option<usize>,
    #[structopt(long)]
    epochs: Option<usize>,
    #[structopt(long)]
    batch_size: Option<NonZeroUsize>,
    #[structopt(long)]
    input_size: Option<NonZeroUsize>,
    #[structopt(long)]
    learning_rate_g: Option<f64>,
    #[structopt(long)]
    learning_rate_d: Option<f64>,
    #[structopt(long)]
    dataset_dir: Option<PathBuf>,
    #[structopt(long)]
    checkpoint_dir: Option<PathBuf>,
    #[structopt(long)]
    plots_dir: Option<PathBuf>,
    #[structopt(long)]
    video_dir: Option<PathBuf>,
}

impl TrainArgs {
    /// Overrides the configuration file with command line options.
    fn apply(self, config: &mut config::Config) -> Result<()> {
        let Self {
            config: _,
            checkpoint,
            screenstep,
            plotstep,
            nodes,
            gpus,
            nr,
            epochs,
            batch_size,
            input_size,
            learning_rate_g,
            learning_rate_d,
            dataset_dir,
            checkpoint_dir,
            plots_dir,
            video_dir,
        } = self;
        let config::Config {
            dataset,
            train,
            logging,
            metrics,
            ..
        } = config;

        if checkpoint {
            train.resume = true;
        }
        if let Some(gpus) = gpus {
            train.gpus = gpus;
            if train.devices.len() != gpus.get() {
                train.devices = (0..gpus.get())
                    .map(|index| DeviceEntry(Device::Cuda(index)))
                    .collect();
            }
        }
        if let Some(lr) = learning_rate_g {
            train.learning_rate_g =
                R64::try_new(lr).ok_or_else(|| format_err!("invalid learning rate {}", lr))?;
        }
        if let Some(lr) = learning_rate_d {
            train.learning_rate_d =
                R64::try_new(lr).ok_or_else(|| format_err!("invalid learning rate {}", lr))?;
        }
        if let Some(screenstep) = screenstep {
            logging.screen_steps = screenstep;
            metrics.plot_steps = screenstep;
        }
        if let Some(plotstep) = plotstep {
            metrics.plot_steps = plotstep;
        }
        if let Some(nodes) = nodes {
            train.nodes = nodes;
        }
        if let Some(nr) = nr {
            train.node_rank = nr;
        }
        if let Some(epochs) = epochs {
            train.epochs = epochs;
        }
        if let Some(batch_size) = batch_size {
            train.batch_size = batch_size;
        }
        if let Some(input_size) = input_size {
            dataset.input_size = input_size;
        }
        if let Some(dir) = dataset_dir {
            dataset.dataset_dir = dir;
        }
        if let Some(dir) = checkpoint_dir {
            logging.checkpoint_dir = dir;
        }
        if let Some(dir) = plots_dir {
            logging.plots_dir = dir;
        }
        if let Some(dir) = video_dir {
            logging.video_dir = dir;
        }

        Ok(())
    }
}

#[derive(Debug, Clone, StructOpt)]
struct FidArgs {
    /// Directory of real images.
    #[structopt(long)]
    real: PathBuf,
    /// Directory of generated images.
    #[structopt(long)]
    fake: PathBuf,
    /// TorchScript Inception feature extractor.
    #[structopt(long)]
    model: PathBuf,
    #[structopt(long, default_value = "50")]
    batch_size: usize,
    #[structopt(long, default_value = "8")]
    num_workers: usize,
    /// "cpu", "cuda" or "cuda:N".
    #[structopt(long, default_value = "cuda", parse(try_from_str = parse_device))]
    device: Device,
}

fn parse_device(text: &str) -> Result<Device> {
    let device = match text {
        "cpu" => Device::Cpu,
        "cuda" => Device::cuda_if_available(),
        _ => {
            let index = text
                .strip_prefix("cuda:")
                .ok_or_else(|| format_err!("invalid device '{}'", text))?;
            Device::Cuda(index.parse()?)
        }
    };
    Ok(device)
}

#[tokio::main]
async fn main() -> Result<()> {
    // setup tracing
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true).compact();
    let filter_layer = {
        let filter = EnvFilter::from_default_env();
        if env::var("RUST_LOG").is_err() {
            filter.add_directive(LevelFilter::INFO.into())
        } else {
            filter
        }
    };

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();

    match Args::from_args() {
        Args::Train(args) => {
            let mut config = config::Config::load(&args.config)?;
            args.apply(&mut config)?;
            mask_inpaint::start(config).await?;
        }
        Args::Fid(args) => {
            let FidArgs {
                real,
                fake,
                model,
                batch_size,
                num_workers,
                device,
            } = args;

            let fid = FidInit {
                real_dir: real,
                fake_dir: fake,
                model_file: model,
                batch_size,
                num_workers,
                device,
            }
            .compute()
            .await?;
            println!("FID: {}", fid);
        }
    }

    Ok(())
}
