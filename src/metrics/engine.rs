use super::{
    plot::{render_panels, save_plot, Panel, PlotConfig},
    psnr, ssim, LossLedger, MetricsReport, PerceptualDistance, QualityScores,
};
use crate::{
    common::*,
    dataset::InpaintDataset,
    model::{composite, InpaintDiscriminator, InpaintGenerator},
    utils,
};

#[derive(Debug, Clone, Default)]
pub struct MetricsHistory {
    pub losses: IndexMap<String, Vec<f64>>,
    pub accuracy: Vec<f64>,
    pub ssim: Vec<f64>,
    pub psnr: Vec<f64>,
    pub lpips: Vec<f64>,
}

impl MetricsHistory {
    pub fn len(&self) -> usize {
        self.accuracy.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accuracy.is_empty()
    }

    pub fn num_evaluations(&self) -> usize {
        self.ssim.len()
    }
}

pub struct MetricsEngineInit<'a> {
    pub dataset: &'a dyn InpaintDataset,
    pub reference_size: usize,
    pub plot_steps: usize,
    pub plots_dir: PathBuf,
    pub video_dir: PathBuf,
    pub lpips: Box<dyn PerceptualDistance>,
    pub device: Device,
}

impl MetricsEngineInit<'_> {
    pub fn build(self) -> Result<MetricsEngine> {
        let Self {
            dataset,
            reference_size,
            plot_steps,
            plots_dir,
            video_dir,
            lpips,
            device,
        } = self;
        ensure!(plot_steps > 0, "zero plot_steps is not allowed");
        ensure!(reference_size > 0, "zero reference_size is not allowed");
        ensure!(
            dataset.len() >= reference_size,
            "dataset has {} items, fewer than the reference size {}",
            dataset.len(),
            reference_size
        );

        let (images, masks): (Vec<_>, Vec<_>) = (0..reference_size)
            .map(|index| dataset.item(index))
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .unzip();
        let reference_image = (Tensor::stack(&images, 0) / 127.5 - 1.0).to_device(device);
        let reference_mask = Tensor::stack(&masks, 0).to_device(device);

        for dir in [&plots_dir, &video_dir] {
            fs::create_dir_all(dir)
                .with_context(|| format!("unable to create directory '{}'", dir.display()))?;
        }

        Ok(MetricsEngine {
            plot_steps,
            plots_dir,
            video_dir,
            plot_config: PlotConfig::default(),
            lpips,
            reference_image,
            reference_mask,
            history: MetricsHistory::default(),
        })
    }
}

pub struct MetricsEngine {
    plot_steps: usize,
    plots_dir: PathBuf,
    video_dir: PathBuf,
    plot_config: PlotConfig,
    lpips: Box<dyn PerceptualDistance>,
    reference_image: Tensor,
    reference_mask: Tensor,
    history: MetricsHistory,
}

impl fmt::Debug for MetricsEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsEngine")
            .field("plot_steps", &self.plot_steps)
            .field("plots_dir", &self.plots_dir)
            .field("video_dir", &self.video_dir)
            .field("history_len", &self.history.len())
            .finish()
    }
}

impl MetricsEngine {
    pub fn history(&self) -> &MetricsHistory {
        &self.history
    }

    /// Records one step.
    ///
    /// `pred` is the discriminator output on the real batch followed by the
    /// fake batch. Nothing is recorded if the ledger has fewer than two
    /// entries, its names differ from those of the first update, or the
    /// reference evaluation fails.
    pub fn update(
        &mut self,
        ledger: &LossLedger,
        pred: &Tensor,
        generator: &dyn InpaintGenerator,
        discriminator: &dyn InpaintDiscriminator,
    ) -> Result<MetricsReport> {
        ensure!(
            ledger.len() >= 2,
            "at least 2 losses are required, but get {}",
            ledger.len()
        );
        if !self.history.losses.is_empty() {
            let same_keys = ledger.len() == self.history.losses.len()
                && ledger
                    .keys()
                    .all(|name| self.history.losses.contains_key(name));
            ensure!(
                same_keys,
                "loss names {:?} differ from the tracked names {:?}",
                ledger.keys().collect::<Vec<_>>(),
                self.history.losses.keys().collect::<Vec<_>>()
            );
        }
        let accuracy = discriminator_accuracy(pred)?;
        let step = self.history.len() + 1;

        // evaluate before recording so that a failure leaves the history intact
        let evaluation = if step % self.plot_steps == 0 {
            Some(self.evaluate_reference(generator, discriminator)?)
        } else {
            None
        };

        for (name, &value) in ledger {
            self.history
                .losses
                .entry(name.clone())
                .or_default()
                .push(value);
        }
        self.history.accuracy.push(accuracy);

        let quality = match evaluation {
            Some((quality, original, recon)) => {
                self.history.ssim.push(quality.ssim);
                self.history.psnr.push(quality.psnr);
                self.history.lpips.push(quality.lpips);

                if let Err(err) = self.plot_losses() {
                    warn!("unable to plot losses: {:?}", err);
                }
                self.save_reference(&original, &recon);
                if let Err(err) = self.plot_quality() {
                    warn!("unable to plot quality metrics: {:?}", err);
                }
                Some(quality)
            }
            None => None,
        };

        Ok(MetricsReport {
            step,
            accuracy,
            quality,
        })
    }

    fn evaluate_reference(
        &self,
        generator: &dyn InpaintGenerator,
        discriminator: &dyn InpaintDiscriminator,
    ) -> Result<(QualityScores, Tensor, Tensor)> {
        let image = &self.reference_image;
        let mask = &self.reference_mask;

        let (recon, real_score, fake_score) = tch::no_grad(|| -> Result<_> {
            let output = generator.forward_t(image, mask, false)?;
            let recon = composite(&output.refined, image, mask);
            let scores = discriminator
                .forward_t(
                    &Tensor::cat(&[image, &recon], 0),
                    &Tensor::cat(&[mask, mask], 0),
                    false,
                )?
                .detach();
            let batch_size = image.size()[0];
            let real_score = f64::from(&scores.narrow(0, 0, batch_size).mean(Kind::Float));
            let fake_score = f64::from(&scores.narrow(0, batch_size, batch_size).mean(Kind::Float));
            Ok((recon, real_score, fake_score))
        })?;

        let original = image.get(0);
        let recon = recon.get(0);
        let to_pixels = |xs: &Tensor| ((xs + 1.0) * 127.5).clamp(0.0, 255.0);

        let ssim = ssim(&to_pixels(&original), &to_pixels(&recon))?;
        let psnr = psnr(&to_pixels(&original), &to_pixels(&recon))?;
        let lpips = tch::no_grad(|| {
            self.lpips
                .distance(&original.unsqueeze(0), &recon.unsqueeze(0))
        })?;
        let lpips = f64::from(&lpips.mean(Kind::Float));

        let quality = QualityScores {
            ssim,
            psnr,
            lpips,
            real_score,
            fake_score,
        };
        Ok((quality, original, recon))
    }

    fn save_reference(&self, original: &Tensor, recon: &Tensor) {
        let reference_file = self.plots_dir.join("reference.png");
        if let Err(err) = utils::save_image(original, &reference_file) {
            warn!("{:?}", err);
        }
        let recon_file = self
            .video_dir
            .join(format!("recon_{:06}.png", self.history.num_evaluations()));
        if let Err(err) = utils::save_image(recon, &recon_file) {
            warn!("{:?}", err);
        }
    }

    fn plot_losses(&self) -> Result<()> {
        let MetricsHistory {
            losses, accuracy, ..
        } = &self.history;
        let panels: Vec<_> = losses
            .values()
            .map(|curve| Panel::new(vec![curve.as_slice()]))
            .chain(iter::once(Panel::with_range(
                vec![accuracy.as_slice()],
                0.0,
                1.0,
            )))
            .collect();

        let image = render_panels(&self.plot_config, &panels);
        save_plot(&image, self.plots_dir.join("loss.png"))
    }

    fn plot_quality(&self) -> Result<()> {
        let MetricsHistory {
            ssim, psnr, lpips, ..
        } = &self.history;
        let panels = vec![
            Panel::new(vec![ssim.as_slice()]),
            Panel::new(vec![psnr.as_slice()]),
            Panel::new(vec![lpips.as_slice()]),
        ];

        let image = render_panels(&self.plot_config, &panels);
        save_plot(&image, self.plots_dir.join("metrics.png"))
    }
}

pub fn discriminator_accuracy(pred: &Tensor) -> Result<f64> {
    let batch_size = pred.size().first().copied().unwrap_or(0);
    ensure!(
        batch_size > 0 && batch_size % 2 == 0,
        "prediction batch size must be positive and even, but get {}",
        batch_size
    );
    let half = batch_size / 2;

    let decisions = pred
        .detach()
        .view([batch_size, -1])
        .mean_dim(&[1], false, Kind::Float)
        .gt(0.5)
        .to_kind(Kind::Float);
    let real_correct = f64::from(&decisions.narrow(0, 0, half).sum(Kind::Float));
    let fake_correct = half as f64 - f64::from(&decisions.narrow(0, half, half).sum(Kind::Float));

    Ok((real_correct + fake_correct) / batch_size as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dataset::RandomDataset,
        metrics::Lpips,
        model::{GatedGeneratorInit, GeneratorOutput, PatchDiscriminatorInit},
    };

    fn make_ledger(names: &[&str]) -> LossLedger {
        names
            .iter()
            .enumerate()
            .map(|(index, name)| (name.to_string(), index as f64))
            .collect()
    }

    #[test]
    fn accuracy_test() -> Result<()> {
        let separated = Tensor::cat(
            &[
                Tensor::ones(&[3, 1, 4, 4], FLOAT_CPU),
                Tensor::zeros(&[3, 1, 4, 4], FLOAT_CPU),
            ],
            0,
        );
        ensure!(discriminator_accuracy(&separated)? == 1.0);
        ensure!(discriminator_accuracy(&(-separated + 1.0))? == 0.0);

        let half_right = Tensor::of_slice(&[0.9f32, 0.1, 0.9, 0.1]);
        ensure!(discriminator_accuracy(&half_right)? == 0.5);

        ensure!(discriminator_accuracy(&Tensor::ones(&[3, 2], FLOAT_CPU)).is_err());
        ensure!(discriminator_accuracy(&Tensor::ones(&[0, 2], FLOAT_CPU)).is_err());
        Ok(())
    }

    #[derive(Debug)]
    struct BrokenGenerator;

    impl InpaintGenerator for BrokenGenerator {
        fn forward_t(
            &self,
            _image: &Tensor,
            _mask: &Tensor,
            _train: bool,
        ) -> Result<GeneratorOutput> {
            bail!("generator failed")
        }
    }

    #[test]
    fn failed_evaluation_keeps_history_test() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();
        let discriminator = PatchDiscriminatorInit::new(2).build(&root / "discriminator")?;
        let dataset = RandomDataset {
            len: 2,
            input_size: 64,
        };
        let mut engine = MetricsEngineInit {
            dataset: &dataset,
            reference_size: 1,
            plot_steps: 1,
            plots_dir: dir.path().join("plots"),
            video_dir: dir.path().join("video"),
            lpips: Box::new(Lpips::new(&root / "lpips")),
            device: Device::Cpu,
        }
        .build()?;

        let pred = Tensor::rand(&[4, 16], FLOAT_CPU);
        let ledger = make_ledger(&["g", "d"]);
        ensure!(engine
            .update(&ledger, &pred, &BrokenGenerator, &discriminator)
            .is_err());

        let history = engine.history();
        ensure!(history.is_empty());
        ensure!(history.losses.is_empty());
        ensure!(history.num_evaluations() == 0);
        Ok(())
    }

    #[test]
    fn metrics_engine_test() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let plots_dir = dir.path().join("plots");
        let video_dir = dir.path().join("video");

        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();
        let generator = GatedGeneratorInit {
            base_channels: 4,
            embedding_dim: 8,
        }
        .build(&root / "generator")?;
        let discriminator = PatchDiscriminatorInit::new(2).build(&root / "discriminator")?;
        let lpips = Lpips::new(&root / "lpips");

        let dataset = RandomDataset {
            len: 4,
            input_size: 64,
        };
        let mut engine = MetricsEngineInit {
            dataset: &dataset,
            reference_size: 2,
            plot_steps: 2,
            plots_dir: plots_dir.clone(),
            video_dir: video_dir.clone(),
            lpips: Box::new(lpips),
            device: Device::Cpu,
        }
        .build()?;

        let pred = Tensor::rand(&[4, 16], FLOAT_CPU);

        // too few losses are rejected without recording anything
        ensure!(engine
            .update(&make_ledger(&["g"]), &pred, &generator, &discriminator)
            .is_err());
        ensure!(engine.history().is_empty());

        let ledger = make_ledger(&["g", "d", "r"]);
        let report = engine.update(&ledger, &pred, &generator, &discriminator)?;
        ensure!(report.step == 1 && report.quality.is_none());

        // a changed set of names is rejected
        ensure!(engine
            .update(&make_ledger(&["g", "d", "x"]), &pred, &generator, &discriminator)
            .is_err());
        ensure!(engine.history().len() == 1);

        let report = engine.update(&ledger, &pred, &generator, &discriminator)?;
        let quality = report
            .quality
            .ok_or_else(|| format_err!("quality is expected on the plot step"))?;
        ensure!(quality.ssim.is_finite() && quality.ssim <= 1.0);
        ensure!(quality.psnr > 0.0);
        ensure!(quality.lpips.is_finite() && quality.lpips >= 0.0);

        let history = engine.history();
        ensure!(history.losses["d"] == vec![1.0, 1.0]);
        ensure!(history.num_evaluations() == 1);

        ensure!(plots_dir.join("loss.png").is_file());
        ensure!(plots_dir.join("metrics.png").is_file());
        ensure!(plots_dir.join("reference.png").is_file());
        ensure!(video_dir.join("recon_000001.png").is_file());
        Ok(())
    }
}
