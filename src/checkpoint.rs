use crate::{
    common::*,
    optim::{Adam, GradScaler},
};
use std::collections::HashMap;

const GENERATOR_FILE: &str = "generator.ot";
const DISCRIMINATOR_FILE: &str = "discriminator.ot";
const GENERATOR_OPT_FILE: &str = "opt_generator.ot";
const DISCRIMINATOR_OPT_FILE: &str = "opt_discriminator.ot";

pub struct Checkpoint<'a> {
    pub generator_vs: &'a nn::VarStore,
    pub discriminator_vs: &'a nn::VarStore,
    pub generator_opt: &'a Adam,
    pub discriminator_opt: &'a Adam,
    pub scaler: &'a GradScaler,
}

impl Checkpoint<'_> {
    /// Writes the four checkpoint files. Each file is written to a temporary
    /// path first and renamed into place.
    pub fn save(&self, checkpoint_dir: impl AsRef<Path>) -> Result<()> {
        let checkpoint_dir = checkpoint_dir.as_ref();
        fs::create_dir_all(checkpoint_dir).with_context(|| {
            format!(
                "unable to create checkpoint directory '{}'",
                checkpoint_dir.display()
            )
        })?;

        let Self {
            generator_vs,
            discriminator_vs,
            generator_opt,
            discriminator_opt,
            scaler,
        } = *self;

        write_atomic(checkpoint_dir.join(GENERATOR_FILE), |path| {
            generator_vs.save(path)?;
            Ok(())
        })?;
        write_atomic(checkpoint_dir.join(DISCRIMINATOR_FILE), |path| {
            discriminator_vs.save(path)?;
            Ok(())
        })?;
        write_atomic(checkpoint_dir.join(GENERATOR_OPT_FILE), |path| {
            let state: Vec<_> = generator_opt
                .named_state()
                .into_iter()
                .chain(scaler.named_state())
                .collect();
            save_named(&state, path)
        })?;
        write_atomic(checkpoint_dir.join(DISCRIMINATOR_OPT_FILE), |path| {
            save_named(&discriminator_opt.named_state(), path)
        })?;

        debug!("checkpoint saved to '{}'", checkpoint_dir.display());
        Ok(())
    }
}

pub struct CheckpointMut<'a> {
    pub generator_vs: &'a mut nn::VarStore,
    pub discriminator_vs: &'a mut nn::VarStore,
    pub generator_opt: &'a mut Adam,
    pub discriminator_opt: &'a mut Adam,
    pub scaler: &'a mut GradScaler,
}

impl CheckpointMut<'_> {
    /// Loads whatever checkpoint files exist. Missing files are skipped,
    /// while unreadable files are errors.
    pub fn load(self, checkpoint_dir: impl AsRef<Path>) -> Result<()> {
        let checkpoint_dir = checkpoint_dir.as_ref();
        let Self {
            generator_vs,
            discriminator_vs,
            generator_opt,
            discriminator_opt,
            scaler,
        } = self;

        if let Some(path) = existing(checkpoint_dir.join(GENERATOR_FILE)) {
            generator_vs
                .load(&path)
                .with_context(|| format!("unable to load '{}'", path.display()))?;
            info!("loaded generator from '{}'", path.display());
        }

        if let Some(path) = existing(checkpoint_dir.join(DISCRIMINATOR_FILE)) {
            discriminator_vs
                .load(&path)
                .with_context(|| format!("unable to load '{}'", path.display()))?;
            info!("loaded discriminator from '{}'", path.display());
        }

        if let Some(path) = existing(checkpoint_dir.join(GENERATOR_OPT_FILE)) {
            let state = load_named(&path)?;
            generator_opt
                .load_named_state(&state)
                .with_context(|| format!("invalid optimizer state in '{}'", path.display()))?;
            scaler.load_named_state(&state);
            info!("loaded generator optimizer from '{}'", path.display());
        }

        if let Some(path) = existing(checkpoint_dir.join(DISCRIMINATOR_OPT_FILE)) {
            let state = load_named(&path)?;
            discriminator_opt
                .load_named_state(&state)
                .with_context(|| format!("invalid optimizer state in '{}'", path.display()))?;
            info!("loaded discriminator optimizer from '{}'", path.display());
        }

        Ok(())
    }
}

fn existing(path: PathBuf) -> Option<PathBuf> {
    if path.is_file() {
        Some(path)
    } else {
        warn!("checkpoint file '{}' does not exist, skipped", path.display());
        None
    }
}

fn write_atomic<F>(path: PathBuf, write: F) -> Result<()>
where
    F: FnOnce(&Path) -> Result<()>,
{
    let tmp_path = path.with_extension("ot.tmp");
    write(&tmp_path).with_context(|| format!("unable to write '{}'", tmp_path.display()))?;
    fs::rename(&tmp_path, &path)
        .with_context(|| format!("unable to move checkpoint to '{}'", path.display()))?;
    Ok(())
}

fn save_named(state: &[(String, Tensor)], path: &Path) -> Result<()> {
    let named: Vec<_> = state
        .iter()
        .map(|(name, tensor)| (name.as_str(), tensor))
        .collect();
    Tensor::save_multi(&named, path)?;
    Ok(())
}

fn load_named(path: &Path) -> Result<HashMap<String, Tensor>> {
    let named = Tensor::load_multi(path)
        .with_context(|| format!("unable to load '{}'", path.display()))?;
    Ok(named.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optim::AdamInit;

    struct State {
        vs_g: nn::VarStore,
        vs_d: nn::VarStore,
        opt_g: Adam,
        opt_d: Adam,
        scaler: GradScaler,
    }

    fn make_state(value: f64) -> Result<State> {
        let vs_g = nn::VarStore::new(Device::Cpu);
        let vs_d = nn::VarStore::new(Device::Cpu);
        vs_g.root().var("w", &[2], nn::Init::Const(value));
        vs_d.root().var("w", &[3], nn::Init::Const(value));
        let opt_g = AdamInit::new(1e-3).build(&vs_g)?;
        let opt_d = AdamInit::new(1e-3).build(&vs_d)?;
        Ok(State {
            vs_g,
            vs_d,
            opt_g,
            opt_d,
            scaler: GradScaler::new(true),
        })
    }

    #[test]
    fn checkpoint_round_trip_test() -> Result<()> {
        let dir = tempfile::tempdir()?;

        let mut saved = make_state(1.0)?;
        let grads = vec![Tensor::ones(&[2], FLOAT_CPU)];
        saved.opt_g.step(&grads)?;
        saved.scaler.update(false);
        Checkpoint {
            generator_vs: &saved.vs_g,
            discriminator_vs: &saved.vs_d,
            generator_opt: &saved.opt_g,
            discriminator_opt: &saved.opt_d,
            scaler: &saved.scaler,
        }
        .save(dir.path())?;
        ensure!(dir.path().join("generator.ot").is_file());
        ensure!(!dir.path().join("generator.ot.tmp").exists());

        let mut loaded = make_state(0.0)?;
        CheckpointMut {
            generator_vs: &mut loaded.vs_g,
            discriminator_vs: &mut loaded.vs_d,
            generator_opt: &mut loaded.opt_g,
            discriminator_opt: &mut loaded.opt_d,
            scaler: &mut loaded.scaler,
        }
        .load(dir.path())?;

        let w_saved = saved.vs_g.variables()["w"].shallow_clone();
        let w_loaded = loaded.vs_g.variables()["w"].shallow_clone();
        ensure!(f64::from(&(w_saved - w_loaded).abs().max()) == 0.0);
        ensure!(f64::from(&loaded.vs_d.variables()["w"].sum(Kind::Float)) == 3.0);
        ensure!(loaded.opt_g.num_steps() == 1);
        ensure!(loaded.scaler == saved.scaler);
        Ok(())
    }

    #[test]
    fn missing_and_corrupt_files_test() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut state = make_state(2.0)?;

        // an empty directory leaves the state untouched
        CheckpointMut {
            generator_vs: &mut state.vs_g,
            discriminator_vs: &mut state.vs_d,
            generator_opt: &mut state.opt_g,
            discriminator_opt: &mut state.opt_d,
            scaler: &mut state.scaler,
        }
        .load(dir.path())?;
        ensure!(f64::from(&state.vs_g.variables()["w"].sum(Kind::Float)) == 4.0);

        fs::write(dir.path().join("discriminator.ot"), b"not a checkpoint")?;
        let result = CheckpointMut {
            generator_vs: &mut state.vs_g,
            discriminator_vs: &mut state.vs_d,
            generator_opt: &mut state.opt_g,
            discriminator_opt: &mut state.opt_d,
            scaler: &mut state.scaler,
        }
        .load(dir.path());
        ensure!(result.is_err());
        Ok(())
    }
}
