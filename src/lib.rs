pub mod augment;
pub mod checkpoint;
pub mod common;
pub mod config;
pub mod context;
pub mod data_stream;
pub mod dataset;
pub mod dist;
pub mod logging;
pub mod message;
pub mod metrics;
pub mod model;
pub mod optim;
pub mod sampler;
pub mod train;
pub mod utils;

pub(crate) const FILE_STRFTIME: &str = "%Y-%m-%d-%H-%M-%S.%3f%z";

use crate::{
    common::*,
    config::Config,
    context::WorkerContext,
    data_stream::DataStreamInit,
    dataset::{FaceMaskDatasetInit, InpaintDataset},
    dist::{ProcessGroup, SingleProcess, ThreadGroup},
    sampler::DistributedSampler,
};
use chrono::Local;

/// Runs a training session with one worker thread per device.
pub async fn start(config: Config) -> Result<()> {
    config.validate()?;
    let config = Arc::new(config);
    let world_size = config.world_size();

    // load dataset
    let dataset: Arc<dyn InpaintDataset> = {
        let config::Dataset {
            dataset_dir,
            csv_file,
            input_size,
        } = &config.dataset;

        let dataset = FaceMaskDatasetInit {
            dataset_dir,
            csv_file: csv_file.clone(),
            input_size: input_size.get(),
        }
        .load()
        .await?;
        ensure!(!dataset.is_empty(), "the dataset is empty");
        info!("loaded {} samples", dataset.len());
        Arc::new(dataset)
    };

    let groups: Vec<Box<dyn ProcessGroup>> = if world_size == 1 {
        vec![Box::new(SingleProcess)]
    } else {
        ThreadGroup::new(world_size)?
            .into_iter()
            .map(|group| Box::new(group) as Box<dyn ProcessGroup>)
            .collect()
    };

    // event logger of rank 0
    let (log_tx, log_fut) = match &config.logging.event_dir {
        Some(event_dir) => {
            let start_time = Local::now();
            let event_dir = event_dir.join(format!("{}", start_time.format(FILE_STRFTIME)));
            let (log_tx, log_rx) = mpsc::channel(16);
            let log_fut = tokio::task::spawn(logging::logging_worker(event_dir, log_rx))
                .map(|result| Fallible::Ok(result??));
            (Some(log_tx), Some(log_fut))
        }
        None => (None, None),
    };

    let worker_futs: Vec<_> = groups
        .into_iter()
        .enumerate()
        .map(|(rank, group)| -> Result<_> {
            let device = config.train.devices[rank].0;
            let sampler = DistributedSampler::new(
                dataset.len(),
                world_size,
                rank,
                true,
                config.train.seed as u64,
            )?;
            let (data_tx, data_rx) = mpsc::channel(2);

            // data stream to channel worker
            let data_fut = {
                let stream = DataStreamInit {
                    dataset: dataset.clone(),
                    sampler,
                    batch_size: config.train.batch_size.get(),
                    epochs: config.train.epochs,
                }
                .build()?;

                tokio::task::spawn(async move {
                    let mut stream = Box::pin(stream);

                    while let Some(msg) = stream.next().await.transpose()? {
                        let result = data_tx.send(msg).await;
                        if result.is_err() {
                            break;
                        }
                    }

                    Fallible::Ok(())
                })
                .map(|result| Fallible::Ok(result??))
            };

            // training worker
            let train_fut = {
                let config = config.clone();
                let dataset = dataset.clone();
                let log_tx = if rank == 0 { log_tx.clone() } else { None };
                let context = WorkerContext::new(device, rank, world_size);

                // the worker drops its group handle on exit, which fails the
                // pending collectives of the other ranks
                tokio::task::spawn_blocking(move || -> Result<()> {
                    train::training_worker(config, context, group, dataset, data_rx, log_tx)
                })
                .map(|result| Fallible::Ok(result??))
            };

            Ok(future::try_join(data_fut, train_fut).map_ok(|_| ()))
        })
        .try_collect()?;

    // the logger stops once every sender is dropped
    drop(log_tx);

    let train_fut = future::try_join_all(worker_futs);
    match log_fut {
        Some(log_fut) => {
            futures::try_join!(train_fut, log_fut)?;
        }
        None => {
            train_fut.await?;
        }
    }

    Ok(())
}
