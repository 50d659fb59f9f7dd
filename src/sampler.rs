use crate::common::*;

/// Splits dataset indexes among the ranks of a process group.
///
/// The index list is padded by wrapping around so that every rank receives
/// the same number of samples.
#[derive(Debug, Clone)]
pub struct DistributedSampler {
    len: usize,
    num_replicas: usize,
    rank: usize,
    shuffle: bool,
    seed: u64,
}

impl DistributedSampler {
    pub fn new(len: usize, num_replicas: usize, rank: usize, shuffle: bool, seed: u64) -> Result<Self> {
        ensure!(len > 0, "cannot sample from an empty dataset");
        ensure!(num_replicas > 0, "num_replicas must be positive");
        ensure!(
            rank < num_replicas,
            "rank {} is out of range for {} replicas",
            rank,
            num_replicas
        );

        Ok(Self {
            len,
            num_replicas,
            rank,
            shuffle,
            seed,
        })
    }

    pub fn num_samples(&self) -> usize {
        (self.len + self.num_replicas - 1) / self.num_replicas
    }

    /// Indexes of this rank for `epoch`. Every rank shuffles with the same
    /// seed so the partitions are disjoint up to padding.
    pub fn indices(&self, epoch: usize) -> Vec<usize> {
        let Self {
            len,
            num_replicas,
            rank,
            shuffle,
            seed,
        } = *self;

        let mut indices: Vec<_> = (0..len).collect();
        if shuffle {
            let mut rng = StdRng::seed_from_u64(seed.wrapping_add(epoch as u64));
            indices.shuffle(&mut rng);
        }

        let total_size = self.num_samples() * num_replicas;
        indices
            .iter()
            .copied()
            .cycle()
            .take(total_size)
            .skip(rank)
            .step_by(num_replicas)
            .collect()
    }
}
