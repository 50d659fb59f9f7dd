use crate::common::*;

/// Collective operations among data-parallel workers.
///
/// Every rank must enter the same collectives in the same order.
pub trait ProcessGroup: Send + Sync {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    fn all_reduce_mean(&self, tensors: &mut [Tensor]) -> Result<()>;

    fn broadcast(&self, tensors: &mut [Tensor], root: usize) -> Result<()>;

    fn barrier(&self) -> Result<()>;

    fn is_main(&self) -> bool {
        self.rank() == 0
    }
}

#[derive(Debug, Clone, Default)]
pub struct SingleProcess;

impl ProcessGroup for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_reduce_mean(&self, _tensors: &mut [Tensor]) -> Result<()> {
        Ok(())
    }

    fn broadcast(&self, _tensors: &mut [Tensor], root: usize) -> Result<()> {
        ensure!(root == 0, "root rank {} is out of range", root);
        Ok(())
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }
}

/// A group of worker threads in one process, one per device.
///
/// Collectives exchange CPU copies through shared slots guarded by a
/// barrier. Dropping a handle marks its rank as departed, and every pending
/// or later barrier of the other ranks then fails.
#[derive(Debug)]
pub struct ThreadGroup {
    rank: usize,
    shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    world_size: usize,
    barrier: Mutex<BarrierState>,
    arrival: Condvar,
    slots: Mutex<Vec<Option<Vec<Tensor>>>>,
}

#[derive(Debug, Default)]
struct BarrierState {
    arrived: usize,
    generation: usize,
    departed: Option<usize>,
}

impl Shared {
    fn wait(&self) -> Result<()> {
        let mut state = self
            .barrier
            .lock()
            .map_err(|_| format_err!("process group state is poisoned"))?;
        if let Some(rank) = state.departed {
            bail!("rank {} has left the process group", rank);
        }

        let generation = state.generation;
        state.arrived += 1;
        if state.arrived == self.world_size {
            state.arrived = 0;
            state.generation += 1;
            self.arrival.notify_all();
            return Ok(());
        }

        let state = self
            .arrival
            .wait_while(state, |state| {
                state.generation == generation && state.departed.is_none()
            })
            .map_err(|_| format_err!("process group state is poisoned"))?;

        // a completed generation wins over a later departure
        if state.generation != generation {
            return Ok(());
        }
        match state.departed {
            Some(rank) => bail!("rank {} has left the process group", rank),
            None => Ok(()),
        }
    }

    fn depart(&self, rank: usize) {
        let mut state = match self.barrier.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.departed.get_or_insert(rank);
        self.arrival.notify_all();
    }
}

impl ThreadGroup {
    pub fn new(world_size: usize) -> Result<Vec<Self>> {
        ensure!(world_size > 0, "world_size must be positive");

        let shared = Arc::new(Shared {
            world_size,
            barrier: Mutex::new(BarrierState::default()),
            arrival: Condvar::new(),
            slots: Mutex::new((0..world_size).map(|_| None).collect()),
        });

        Ok((0..world_size)
            .map(|rank| Self {
                rank,
                shared: shared.clone(),
            })
            .collect())
    }

    fn publish(&self, tensors: Option<Vec<Tensor>>) -> Result<()> {
        let mut slots = self
            .shared
            .slots
            .lock()
            .map_err(|_| format_err!("process group state is poisoned"))?;
        slots[self.rank] = tensors;
        Ok(())
    }

    fn copy_from(&self, root: usize, tensors: &mut [Tensor]) -> Result<()> {
        let slots = self
            .shared
            .slots
            .lock()
            .map_err(|_| format_err!("process group state is poisoned"))?;
        let source = slots[root]
            .as_ref()
            .ok_or_else(|| format_err!("root rank {} did not publish its tensors", root))?;
        ensure!(
            source.len() == tensors.len(),
            "ranks disagree on the number of tensors"
        );

        tch::no_grad(|| {
            for (tensor, source) in tensors.iter_mut().zip(source) {
                tensor.copy_(&source.to_device(tensor.device()));
            }
        });
        Ok(())
    }

    fn collect(&self) -> Result<Vec<Vec<Tensor>>> {
        let slots = self
            .shared
            .slots
            .lock()
            .map_err(|_| format_err!("process group state is poisoned"))?;
        slots
            .iter()
            .enumerate()
            .map(|(rank, slot)| {
                let tensors = slot
                    .as_ref()
                    .ok_or_else(|| format_err!("rank {} did not publish its tensors", rank))?;
                Ok(tensors.iter().map(|tensor| tensor.shallow_clone()).collect())
            })
            .try_collect()
    }
}

impl ProcessGroup for ThreadGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.shared.world_size
    }

    fn all_reduce_mean(&self, tensors: &mut [Tensor]) -> Result<()> {
        let world_size = self.shared.world_size;
        if world_size == 1 {
            return Ok(());
        }

        self.publish(Some(to_cpu(tensors)))?;
        self.shared.wait()?;

        let result = self.collect().and_then(|all| {
            tch::no_grad(|| -> Result<()> {
                for (index, tensor) in tensors.iter_mut().enumerate() {
                    let parts: Vec<_> = all
                        .iter()
                        .map(|rank_tensors| {
                            rank_tensors.get(index).ok_or_else(|| {
                                format_err!("ranks disagree on the number of tensors")
                            })
                        })
                        .try_collect()?;
                    ensure!(
                        parts.iter().all(|part| part.size() == tensor.size()),
                        "ranks disagree on the shape of tensor {}",
                        index
                    );
                    let mean = Tensor::stack(&parts, 0).mean_dim(&[0], false, Kind::Float);
                    tensor.copy_(&mean.to_kind(tensor.kind()).to_device(tensor.device()));
                }
                Ok(())
            })
        });

        // no rank may clear its slot before every rank has read it
        self.shared.wait()?;
        self.publish(None)?;
        result
    }

    fn broadcast(&self, tensors: &mut [Tensor], root: usize) -> Result<()> {
        let world_size = self.shared.world_size;
        ensure!(root < world_size, "root rank {} is out of range", root);
        if world_size == 1 {
            return Ok(());
        }

        if self.rank == root {
            self.publish(Some(to_cpu(tensors)))?;
        }
        self.shared.wait()?;

        let result = if self.rank == root {
            Ok(())
        } else {
            self.copy_from(root, tensors)
        };

        self.shared.wait()?;
        if self.rank == root {
            self.publish(None)?;
        }
        result
    }

    fn barrier(&self) -> Result<()> {
        self.shared.wait()
    }
}

impl Drop for ThreadGroup {
    fn drop(&mut self) {
        self.shared.depart(self.rank);
    }
}

fn to_cpu(tensors: &[Tensor]) -> Vec<Tensor> {
    tensors
        .iter()
        .map(|tensor| tensor.detach().to_device(Device::Cpu))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn all_reduce_mean_test() -> Result<()> {
        let handles: Vec<_> = ThreadGroup::new(3)?
            .into_iter()
            .map(|group| {
                thread::spawn(move || -> Result<()> {
                    let rank = group.rank() as f64;
                    let mut tensors = vec![
                        Tensor::ones(&[2, 2], FLOAT_CPU) * rank,
                        Tensor::ones(&[3], FLOAT_CPU) * (rank * 2.0),
                    ];
                    group.all_reduce_mean(&mut tensors)?;
                    ensure!(f64::from(&(&tensors[0] - 1.0).abs().max()) < 1e-6);
                    ensure!(f64::from(&(&tensors[1] - 2.0).abs().max()) < 1e-6);

                    // a second round reuses the slots
                    let mut tensors = vec![Tensor::ones(&[1], FLOAT_CPU) * rank];
                    group.all_reduce_mean(&mut tensors)?;
                    ensure!(f64::from(&(&tensors[0] - 1.0).abs().max()) < 1e-6);
                    Ok(())
                })
            })
            .collect();

        for handle in handles {
            handle
                .join()
                .map_err(|_| format_err!("worker thread panicked"))??;
        }
        Ok(())
    }

    #[test]
    fn broadcast_test() -> Result<()> {
        let handles: Vec<_> = ThreadGroup::new(2)?
            .into_iter()
            .map(|group| {
                thread::spawn(move || -> Result<()> {
                    let rank = group.rank() as f64;
                    let mut tensors = vec![Tensor::ones(&[4], FLOAT_CPU) * (rank + 5.0)];
                    group.broadcast(&mut tensors, 0)?;
                    ensure!(f64::from(&(&tensors[0] - 5.0).abs().max()) < 1e-6);
                    Ok(())
                })
            })
            .collect();

        for handle in handles {
            handle
                .join()
                .map_err(|_| format_err!("worker thread panicked"))??;
        }
        Ok(())
    }

    #[test]
    fn departed_rank_test() -> Result<()> {
        let mut groups = ThreadGroup::new(2)?;
        let rank1 = groups.pop().ok_or_else(|| format_err!("missing rank 1"))?;
        let rank0 = groups.pop().ok_or_else(|| format_err!("missing rank 0"))?;

        let waiter = thread::spawn(move || -> Result<()> {
            let mut tensors = vec![Tensor::ones(&[2], FLOAT_CPU)];
            ensure!(rank0.all_reduce_mean(&mut tensors).is_err());
            ensure!(rank0.barrier().is_err());
            Ok(())
        });

        // rank 1 fails before entering any collective
        let failed = thread::spawn(move || -> Result<()> {
            let _group = rank1;
            bail!("data loading failed")
        });

        ensure!(failed
            .join()
            .map_err(|_| format_err!("worker thread panicked"))?
            .is_err());
        waiter
            .join()
            .map_err(|_| format_err!("worker thread panicked"))??;
        Ok(())
    }

    #[test]
    fn completed_barrier_test() -> Result<()> {
        let handles: Vec<_> = ThreadGroup::new(2)?
            .into_iter()
            .map(|group| {
                thread::spawn(move || -> Result<()> {
                    let rank = group.rank() as f64;
                    let mut tensors = vec![Tensor::ones(&[1], FLOAT_CPU) * rank];
                    group.all_reduce_mean(&mut tensors)?;
                    group.barrier()?;
                    Ok(())
                })
            })
            .collect();

        // leaving after the last collective is not an error
        for handle in handles {
            handle
                .join()
                .map_err(|_| format_err!("worker thread panicked"))??;
        }
        Ok(())
    }

    #[test]
    fn single_process_test() -> Result<()> {
        let group = SingleProcess;
        let mut tensors = vec![Tensor::ones(&[2], FLOAT_CPU)];
        group.all_reduce_mean(&mut tensors)?;
        ensure!(f64::from(&tensors[0].sum(Kind::Float)) == 2.0);
        ensure!(group.is_main() && group.world_size() == 1);
        ensure!(group.broadcast(&mut tensors, 1).is_err());
        Ok(())
    }
}
