use crate::{
    common::*,
    dataset::InpaintDataset,
    message::{DataMessage, InpaintBatch},
    sampler::DistributedSampler,
};

#[derive(Debug, Clone)]
pub struct DataStreamInit {
    pub dataset: Arc<dyn InpaintDataset>,
    pub sampler: DistributedSampler,
    pub batch_size: usize,
    pub epochs: usize,
}

impl DataStreamInit {
    /// Streams the batches of every epoch, each epoch followed by an
    /// [DataMessage::EpochEnd] marker.
    pub fn build(self) -> Result<impl Stream<Item = Result<DataMessage>> + Send> {
        let Self {
            dataset,
            sampler,
            batch_size,
            epochs,
        } = self;
        ensure!(batch_size > 0, "zero batch_size is not allowed");

        let stream = stream::iter(0..epochs).flat_map(move |epoch| {
            let indices = sampler.indices(epoch);
            let dataset = dataset.clone();

            // load samples in parallel
            let batches = stream::iter(indices)
                .map(Fallible::Ok)
                .try_par_map_unordered(None, move |index| {
                    let dataset = dataset.clone();
                    move || dataset.item(index)
                })
                .chunks(batch_size)
                .enumerate()
                .map(move |(step, results)| -> Result<_> {
                    let samples: Vec<_> = results.into_iter().try_collect()?;
                    let (images, masks): (Vec<_>, Vec<_>) = samples.into_iter().unzip();

                    Ok(DataMessage::Batch(InpaintBatch {
                        epoch,
                        step,
                        image: Tensor::stack(&images, 0),
                        mask: Tensor::stack(&masks, 0),
                    }))
                });

            batches.chain(stream::once(future::ready(Ok(DataMessage::EpochEnd {
                epoch,
            }))))
        });

        Ok(stream)
    }
}
