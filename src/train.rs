use crate::{
    augment::{Augment, AugmentPipe},
    checkpoint::{Checkpoint, CheckpointMut},
    common::*,
    config::Config,
    context::WorkerContext,
    dataset::InpaintDataset,
    dist::ProcessGroup,
    message::{DataMessage, InpaintBatch, LogMessage},
    metrics::{GanLosses, MetricsEngine, MetricsEngineInit},
    model::{
        composite, generator_loss, tv_loss, DiscriminatorLossKind, GatedGenerator,
        GatedGeneratorInit, GeneratorOutput, InfoNce, InpaintDiscriminator, InpaintGenerator,
        L1ReconLoss, NceReduction, PatchDiscriminator, PatchDiscriminatorInit, VggLoss,
    },
    optim::{Adam, AdamInit, GradScaler},
    utils::{self, RateCounter},
};

pub struct TrainerInit<'a> {
    pub config: &'a Config,
    pub context: WorkerContext,
    pub group: Box<dyn ProcessGroup>,
}

impl TrainerInit<'_> {
    pub fn build(self) -> Result<Trainer> {
        let Self {
            config,
            context,
            group,
        } = self;
        let Config {
            train,
            loss,
            logging,
            model,
            augment,
            ..
        } = config;
        let device = context.device;
        ensure!(
            group.rank() == context.rank && group.world_size() == context.world_size,
            "process group rank {}/{} does not match worker rank {}/{}",
            group.rank(),
            group.world_size(),
            context.rank,
            context.world_size
        );

        // every rank starts from the same random state
        tch::manual_seed(train.seed);

        let mut generator_vs = nn::VarStore::new(device);
        let generator = GatedGeneratorInit {
            base_channels: model.base_channels.get(),
            embedding_dim: model.embedding_dim.get(),
        }
        .build(&generator_vs.root())?;

        let mut discriminator_vs = nn::VarStore::new(device);
        let discriminator =
            PatchDiscriminatorInit::new(model.base_channels.get()).build(&discriminator_vs.root())?;

        let mut generator_opt = AdamInit::new(train.learning_rate_g.raw()).build(&generator_vs)?;
        let mut discriminator_opt =
            AdamInit::new(train.learning_rate_d.raw()).build(&discriminator_vs)?;
        let mut scaler = GradScaler::new(train.mixed_precision);

        if train.resume {
            info!(
                "resuming from checkpoint directory '{}'",
                logging.checkpoint_dir.display()
            );
            CheckpointMut {
                generator_vs: &mut generator_vs,
                discriminator_vs: &mut discriminator_vs,
                generator_opt: &mut generator_opt,
                discriminator_opt: &mut discriminator_opt,
                scaler: &mut scaler,
            }
            .load(&logging.checkpoint_dir)?;
        }

        // start every replica from the parameters of rank 0
        for vs in [&generator_vs, &discriminator_vs] {
            let mut variables = sorted_variables(vs);
            group
                .broadcast(&mut variables, 0)
                .context("unable to broadcast initial parameters")?;
        }

        let vgg_loss = VggLoss::new(
            context.load_feature_extractor(loss.vgg19_weights.as_deref())?,
            device,
        );
        let info_nce = InfoNce {
            temperature: loss.temperature.raw(),
            reduction: NceReduction::Mean,
        };

        for dir in [&logging.checkpoint_dir, &logging.plots_dir] {
            fs::create_dir_all(dir)
                .with_context(|| format!("unable to create directory '{}'", dir.display()))?;
        }

        Ok(Trainer {
            context,
            group,
            generator_vs,
            discriminator_vs,
            generator,
            discriminator,
            generator_opt,
            discriminator_opt,
            scaler,
            augment: augment.clone(),
            discriminator_loss: loss.discriminator,
            recon_loss: loss.recon.clone(),
            vgg_loss,
            info_nce,
            perceptual_weight: loss.perceptual_weight.raw(),
            style_weight: loss.style_weight.raw(),
            checkpoint_dir: logging.checkpoint_dir.clone(),
            plots_dir: logging.plots_dir.clone(),
        })
    }
}

#[derive(Debug)]
pub struct StepOutput {
    pub losses: GanLosses,
    pub total: Tensor,
    /// Discriminator scores of the real batch followed by the fake batch.
    pub pred: Tensor,
    pub image: Tensor,
    pub coarse: Tensor,
    pub recon: Tensor,
    pub finite: bool,
}

pub struct Trainer {
    context: WorkerContext,
    group: Box<dyn ProcessGroup>,
    generator_vs: nn::VarStore,
    discriminator_vs: nn::VarStore,
    generator: GatedGenerator,
    discriminator: PatchDiscriminator,
    generator_opt: Adam,
    discriminator_opt: Adam,
    scaler: GradScaler,
    augment: AugmentPipe,
    discriminator_loss: DiscriminatorLossKind,
    recon_loss: L1ReconLoss,
    vgg_loss: VggLoss,
    info_nce: InfoNce,
    perceptual_weight: f64,
    style_weight: f64,
    checkpoint_dir: PathBuf,
    plots_dir: PathBuf,
}

impl fmt::Debug for Trainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trainer")
            .field("context", &self.context)
            .field("scaler", &self.scaler)
            .field("checkpoint_dir", &self.checkpoint_dir)
            .finish()
    }
}

impl Trainer {
    pub fn generator(&self) -> &dyn InpaintGenerator {
        &self.generator
    }

    pub fn discriminator(&self) -> &dyn InpaintDiscriminator {
        &self.discriminator
    }

    pub fn generator_vs(&self) -> &nn::VarStore {
        &self.generator_vs
    }

    pub fn discriminator_vs(&self) -> &nn::VarStore {
        &self.discriminator_vs
    }

    pub fn generator_opt(&self) -> &Adam {
        &self.generator_opt
    }

    pub fn discriminator_opt(&self) -> &Adam {
        &self.discriminator_opt
    }

    pub fn scaler(&self) -> &GradScaler {
        &self.scaler
    }

    /// Runs one adversarial step on an image batch in `[0, 255]` and its
    /// hole masks.
    pub fn step(&mut self, image: &Tensor, mask: &Tensor) -> Result<StepOutput> {
        let device = self.context.device;

        // augment the batch and append it to the original
        let (image, mask) = {
            let (_b, c, _h, _w) = image.size4()?;
            ensure!(c == 3, "expect 3 image channels, but get {}", c);
            let augmented = self.augment.apply(&Tensor::cat(&[image, mask], 1))?;
            let aug_image = augmented.narrow(1, 0, 3);
            let aug_mask = augmented.narrow(1, 3, 1);
            (
                Tensor::cat(&[image, &aug_image], 0),
                Tensor::cat(&[mask, &aug_mask], 0),
            )
        };
        let image = image.to_device(device) / 127.5 - 1.0;
        let mask = mask.to_device(device);

        // forward generator
        let GeneratorOutput {
            embedding,
            coarse,
            refined,
        } = self.generator.forward_t(&image, &mask, true)?;
        let coarse_recon = composite(&coarse, &image, &mask);
        let recon = composite(&refined, &image, &mask);
        let dmask = Tensor::cat(&[&mask, &mask], 0);

        // update discriminator
        let pred = self
            .discriminator
            .forward_t(&Tensor::cat(&[&image, &recon], 0), &dmask, true)?;
        let (pos, neg) = split_halves(&pred)?;
        let d = self.discriminator_loss.forward(&pos, &neg);

        // the generator graph is reused below
        let finite_d = backward_step(
            &*self.group,
            &self.scaler,
            &mut self.discriminator_opt,
            &d,
            true,
        )?;
        self.generator_opt.zero_grad();
        self.discriminator_opt.zero_grad();

        // update generator
        let fake_pred = self.discriminator.forward_t(&recon, &mask, true)?;
        let g = generator_loss(&fake_pred);
        let r = self.recon_loss.forward(&image, &coarse, &refined, &dmask)?;
        let tv = tv_loss(&refined)?;
        let (perc, style) = self.vgg_loss.forward(&refined, &image)?;
        let perc = perc * self.perceptual_weight;
        let style = style * self.style_weight;
        let contra = {
            let (query, positive) = split_halves(&embedding)?;
            self.info_nce.forward(&query, &positive, None)?
        };
        let total = &g + &r + &tv + &perc + &style + &contra;

        let finite_g = backward_step(
            &*self.group,
            &self.scaler,
            &mut self.generator_opt,
            &total,
            false,
        )?;

        let finite = finite_d && finite_g;
        self.scaler.update(finite);

        Ok(StepOutput {
            losses: GanLosses {
                g: g.detach(),
                d: d.detach(),
                r: r.detach(),
                tv: tv.detach(),
                perc: perc.detach(),
                style: style.detach(),
                contra: contra.detach(),
            },
            total: total.detach(),
            pred: pred.detach(),
            image,
            coarse: coarse_recon.detach(),
            recon: recon.detach(),
            finite,
        })
    }

    pub fn save_checkpoint(&self) -> Result<()> {
        Checkpoint {
            generator_vs: &self.generator_vs,
            discriminator_vs: &self.discriminator_vs,
            generator_opt: &self.generator_opt,
            discriminator_opt: &self.discriminator_opt,
            scaler: &self.scaler,
        }
        .save(&self.checkpoint_dir)
    }

    pub fn save_examples(&self, output: &StepOutput, step: usize) -> Result<()> {
        let StepOutput {
            image,
            coarse,
            recon,
            ..
        } = output;
        let last = image.size()[0] - 1;

        for (prefix, index) in [("", 0), ("aug_", last)] {
            let files = [
                (format!("{}{}_{}.png", prefix, "orig", step), image),
                (format!("{}{}_{}.png", prefix, "coarse", step), coarse),
                (format!("{}{}_{}.png", prefix, "recon", step), recon),
            ];
            for (name, images) in files {
                utils::save_image(&images.get(index), self.plots_dir.join(name))?;
            }
        }
        Ok(())
    }
}

fn backward_step(
    group: &dyn ProcessGroup,
    scaler: &GradScaler,
    opt: &mut Adam,
    loss: &Tensor,
    keep_graph: bool,
) -> Result<bool> {
    let scaled = scaler.scale_loss(loss);
    let mut grads = Tensor::f_run_backward(&[&scaled], opt.params(), keep_graph, false)?;
    group.all_reduce_mean(&mut grads)?;

    let finite = scaler.unscale(&mut grads);
    if finite {
        opt.step(&grads)?;
    } else {
        warn!("non-finite gradients found, skip the optimizer step");
    }
    Ok(finite)
}

fn split_halves(xs: &Tensor) -> Result<(Tensor, Tensor)> {
    let batch_size = xs.size()[0];
    ensure!(
        batch_size % 2 == 0,
        "expect an even batch size, but get {}",
        batch_size
    );
    let half = batch_size / 2;
    Ok((xs.narrow(0, 0, half), xs.narrow(0, half, half)))
}

fn sorted_variables(vs: &nn::VarStore) -> Vec<Tensor> {
    vs.variables()
        .into_iter()
        .sorted_by(|(lhs, _), (rhs, _)| lhs.cmp(rhs))
        .map(|(_, var)| var)
        .collect()
}

pub fn training_worker(
    config: Arc<Config>,
    context: WorkerContext,
    group: Box<dyn ProcessGroup>,
    dataset: Arc<dyn InpaintDataset>,
    mut data_rx: mpsc::Receiver<DataMessage>,
    mut log_tx: Option<mpsc::Sender<LogMessage>>,
) -> Result<()> {
    let _entered = context.span.clone().entered();
    let is_main = context.is_main();
    let screen_steps = config.logging.screen_steps.get();
    let batch_size = config.train.batch_size.get();
    let epochs = config.train.epochs;

    let mut trainer = TrainerInit {
        config: &config,
        context: context.clone(),
        group,
    }
    .build()?;

    let mut metrics: Option<MetricsEngine> = if is_main {
        let engine = MetricsEngineInit {
            dataset: &*dataset,
            reference_size: config.metrics.reference_size.get(),
            plot_steps: config.metrics.plot_steps.get(),
            plots_dir: config.logging.plots_dir.clone(),
            video_dir: config.logging.video_dir.clone(),
            lpips: context.load_perceptual_distance(config.metrics.lpips_weights.as_deref())?,
            device: context.device,
        }
        .build()?;
        Some(engine)
    } else {
        None
    };

    let mut rate_counter = RateCounter::with_second_interval();
    let mut global_step = 0;
    info!("start training");

    while let Some(msg) = data_rx.blocking_recv() {
        let InpaintBatch {
            epoch,
            step,
            image,
            mask,
        } = match msg {
            DataMessage::Batch(batch) => batch,
            DataMessage::EpochEnd { epoch } => {
                info!("epoch {}/{} finished", epoch + 1, epochs);
                if is_main {
                    trainer.save_checkpoint()?;
                }
                continue;
            }
        };

        let output = trainer.step(&image, &mask)?;
        let ledger = output.losses.to_ledger();
        rate_counter.add(1.0);

        if step % screen_steps == 0 {
            let total = f64::from(&output.total);
            match rate_counter.rate() {
                Some(batch_rate) => info!(
                    "epoch: {}/{}\tstep: {}\tloss: {:.5}\t{:.2} batch/s\t{:.2} sample/s",
                    epoch,
                    epochs,
                    step,
                    total,
                    batch_rate,
                    batch_rate * batch_size as f64
                ),
                None => info!(
                    "epoch: {}/{}\tstep: {}\tloss: {:.5}",
                    epoch, epochs, step, total
                ),
            }

            if is_main {
                if let Err(err) = trainer.save_examples(&output, step) {
                    warn!("unable to save example images: {:?}", err);
                }
                trainer.save_checkpoint()?;
            }
        }

        if let Some(metrics) = &mut metrics {
            let report = metrics.update(
                &ledger,
                &output.pred,
                trainer.generator(),
                trainer.discriminator(),
            )?;

            if let Some(tx) = &log_tx {
                let mut messages = vec![
                    LogMessage::Losses {
                        step: global_step,
                        losses: ledger,
                        learning_rate_g: trainer.generator_opt().lr(),
                        learning_rate_d: trainer.discriminator_opt().lr(),
                        loss_scale: trainer.scaler().scale(),
                    },
                    LogMessage::Metrics {
                        step: global_step,
                        report,
                    },
                ];
                if step % screen_steps == 0 {
                    let first = |xs: &Tensor| xs.narrow(0, 0, 1).to_device(Device::Cpu);
                    messages.push(LogMessage::Images {
                        step: global_step,
                        original: first(&output.image),
                        coarse: first(&output.coarse),
                        recon: first(&output.recon),
                    });
                }

                let closed = messages
                    .into_iter()
                    .any(|msg| tx.blocking_send(msg).is_err());
                if closed {
                    warn!("event logger is closed, stop sending events");
                    log_tx = None;
                }
            }
        }

        global_step += 1;
    }

    if is_main {
        trainer.save_checkpoint()?;
    }
    info!("training ended");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dist::SingleProcess;

    fn test_config(dir: &Path) -> Result<Config> {
        let text = format!(
            r#"{{
                dataset: {{ dataset_dir: "{dir}", input_size: 256 }},
                train: {{
                    epochs: 1,
                    batch_size: 1,
                    learning_rate_g: 0.0001,
                    learning_rate_d: 0.0004,
                }},
                loss: {{}},
                logging: {{
                    screen_steps: 1,
                    checkpoint_dir: "{dir}/checkpoints",
                    plots_dir: "{dir}/plots",
                    video_dir: "{dir}/video",
                }},
                metrics: {{ plot_steps: 1 }},
                model: {{ base_channels: 2, embedding_dim: 8 }},
            }}"#,
            dir = dir.display()
        );
        Ok(json5::from_str(&text)?)
    }

    fn snapshot(vs: &nn::VarStore) -> Vec<Tensor> {
        sorted_variables(vs)
            .iter()
            .map(|var| var.detach().copy())
            .collect()
    }

    fn changed(before: &[Tensor], vs: &nn::VarStore) -> bool {
        izip!(before, sorted_variables(vs))
            .any(|(before, after)| f64::from(&(before - after).abs().max()) > 0.0)
    }

    #[test]
    fn trainer_step_test() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = test_config(dir.path())?;
        let mut trainer = TrainerInit {
            config: &config,
            context: WorkerContext::new(Device::Cpu, 0, 1),
            group: Box::new(SingleProcess),
        }
        .build()?;

        let num_g_params = trainer.generator_opt().params().len();
        let num_d_params = trainer.discriminator_opt().params().len();
        let g_before = snapshot(trainer.generator_vs());
        let d_before = snapshot(trainer.discriminator_vs());

        let image = Tensor::rand(&[2, 3, 256, 256], FLOAT_CPU) * 255.0;
        let mask = Tensor::zeros(&[2, 1, 256, 256], FLOAT_CPU);
        let _ = mask.narrow(2, 64, 128).narrow(3, 64, 128).fill_(1.0);

        let output = trainer.step(&image, &mask)?;
        ensure!(output.finite);

        let ledger = output.losses.to_ledger();
        ensure!(
            ledger.keys().collect::<Vec<_>>()
                == vec!["g", "d", "r", "tv", "perc", "style", "contra"]
        );
        ensure!(
            ledger.values().all(|value| value.is_finite()),
            "non-finite losses {:?}",
            ledger
        );
        ensure!(output.pred.size()[0] == 8);
        ensure!(output.recon.size() == vec![4, 3, 256, 256]);

        // known pixels of the canonical view are kept as is
        let diff = (output.recon.narrow(0, 0, 2) - output.image.narrow(0, 0, 2)).narrow(2, 0, 64);
        ensure!(f64::from(&diff.abs().max()) < 1e-6);

        ensure!(trainer.generator_opt().params().len() == num_g_params);
        ensure!(trainer.discriminator_opt().params().len() == num_d_params);
        ensure!(changed(&g_before, trainer.generator_vs()));
        ensure!(changed(&d_before, trainer.discriminator_vs()));

        trainer.save_examples(&output, 0)?;
        ensure!(config.logging.plots_dir.join("aug_recon_0.png").is_file());
        trainer.save_checkpoint()?;
        ensure!(config.logging.checkpoint_dir.join("opt_generator.ot").is_file());
        Ok(())
    }

    #[test]
    fn training_worker_test() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut config = test_config(dir.path())?;
        config.dataset.input_size = NonZeroUsize::new(64).unwrap();
        let config = Arc::new(config);

        let dataset = crate::dataset::RandomDataset {
            len: 2,
            input_size: 64,
        };
        let (data_tx, data_rx) = mpsc::channel(4);
        let (log_tx, mut log_rx) = mpsc::channel(16);

        let image = Tensor::rand(&[1, 3, 64, 64], FLOAT_CPU) * 255.0;
        let mask = Tensor::ones(&[1, 1, 64, 64], FLOAT_CPU);
        let messages = vec![
            DataMessage::Batch(InpaintBatch {
                epoch: 0,
                step: 0,
                image,
                mask,
            }),
            DataMessage::EpochEnd { epoch: 0 },
        ];
        for msg in messages {
            data_tx
                .blocking_send(msg)
                .map_err(|_| format_err!("data channel is closed"))?;
        }
        drop(data_tx);

        training_worker(
            config.clone(),
            WorkerContext::new(Device::Cpu, 0, 1),
            Box::new(SingleProcess),
            Arc::new(dataset),
            data_rx,
            Some(log_tx),
        )?;

        let mut num_messages = 0;
        while log_rx.try_recv().is_ok() {
            num_messages += 1;
        }
        ensure!(num_messages == 3);
        ensure!(config.logging.checkpoint_dir.join("generator.ot").is_file());
        ensure!(config.logging.plots_dir.join("loss.png").is_file());
        Ok(())
    }
}
