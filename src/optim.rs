use crate::common::*;
use std::collections::HashMap;

const DEFAULT_INIT_SCALE: f64 = 65536.0;
const DEFAULT_GROWTH_INTERVAL: usize = 2000;

#[derive(Debug, Clone)]
pub struct AdamInit {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
}

impl AdamInit {
    pub fn new(lr: f64) -> Self {
        Self {
            lr,
            beta1: 0.5,
            beta2: 0.999,
            eps: 1e-8,
        }
    }

    pub fn build(self, vs: &nn::VarStore) -> Result<Adam> {
        let Self {
            lr,
            beta1,
            beta2,
            eps,
        } = self;
        ensure!(lr > 0.0, "learning rate must be positive, but get {}", lr);
        ensure!(
            (0.0..1.0).contains(&beta1) && (0.0..1.0).contains(&beta2),
            "betas must be in [0, 1)"
        );

        let mut named: Vec<_> = vs
            .variables()
            .into_iter()
            .filter(|(_, var)| var.requires_grad())
            .collect();
        named.sort_by(|(lhs, _), (rhs, _)| lhs.cmp(rhs));
        ensure!(!named.is_empty(), "no trainable variables");

        let (names, params): (Vec<_>, Vec<_>) = named.into_iter().unzip();
        let exp_avg: Vec<_> = params.iter().map(|param| param.zeros_like()).collect();
        let exp_avg_sq: Vec<_> = params.iter().map(|param| param.zeros_like()).collect();

        Ok(Adam {
            lr,
            beta1,
            beta2,
            eps,
            step: 0,
            names,
            params,
            exp_avg,
            exp_avg_sq,
        })
    }
}

/// Adam whose moments can be saved and restored.
///
/// Gradients are passed in explicitly, aligned with [Adam::params].
#[derive(Debug)]
pub struct Adam {
    lr: f64,
    beta1: f64,
    beta2: f64,
    eps: f64,
    step: i64,
    names: Vec<String>,
    params: Vec<Tensor>,
    exp_avg: Vec<Tensor>,
    exp_avg_sq: Vec<Tensor>,
}

impl Adam {
    pub fn params(&self) -> &[Tensor] {
        &self.params
    }

    pub fn lr(&self) -> f64 {
        self.lr
    }

    pub fn num_steps(&self) -> i64 {
        self.step
    }

    pub fn step(&mut self, grads: &[Tensor]) -> Result<()> {
        ensure!(
            grads.len() == self.params.len(),
            "expect {} gradients, but get {}",
            self.params.len(),
            grads.len()
        );

        self.step += 1;
        let Self {
            lr,
            beta1,
            beta2,
            eps,
            step,
            ref mut params,
            ref mut exp_avg,
            ref mut exp_avg_sq,
            ..
        } = *self;
        let bias_correction1 = 1.0 - beta1.powi(step as i32);
        let bias_correction2 = 1.0 - beta2.powi(step as i32);
        let step_size = lr / bias_correction1;

        tch::no_grad(|| {
            for (param, grad, m, v) in izip!(params, grads, exp_avg, exp_avg_sq) {
                m.copy_(&(&*m * beta1 + grad * (1.0 - beta1)));
                v.copy_(&(&*v * beta2 + grad.square() * (1.0 - beta2)));
                let denom = v.sqrt() / bias_correction2.sqrt() + eps;
                let update = &*m / denom * step_size;
                param.copy_(&(&*param - update));
            }
        });

        Ok(())
    }

    pub fn zero_grad(&mut self) {
        self.params.iter_mut().for_each(|param| param.zero_grad());
    }

    /// Optimizer state keyed by `step`, `exp_avg.{var}` and `exp_avg_sq.{var}`.
    pub fn named_state(&self) -> Vec<(String, Tensor)> {
        let step = Tensor::of_slice(&[self.step]);
        iter::once(("step".to_string(), step))
            .chain(izip!(&self.names, &self.exp_avg).map(|(name, m)| {
                (format!("exp_avg.{}", name), m.shallow_clone())
            }))
            .chain(izip!(&self.names, &self.exp_avg_sq).map(|(name, v)| {
                (format!("exp_avg_sq.{}", name), v.shallow_clone())
            }))
            .collect()
    }

    pub fn load_named_state(&mut self, state: &HashMap<String, Tensor>) -> Result<()> {
        let step = state
            .get("step")
            .ok_or_else(|| format_err!("optimizer state has no step counter"))?;
        let step = i64::from(step);

        tch::no_grad(|| -> Result<()> {
            for (name, m, v) in izip!(&self.names, &mut self.exp_avg, &mut self.exp_avg_sq) {
                for (prefix, dst) in [("exp_avg", m), ("exp_avg_sq", v)] {
                    let key = format!("{}.{}", prefix, name);
                    let src = state
                        .get(&key)
                        .ok_or_else(|| format_err!("optimizer state has no entry '{}'", key))?;
                    ensure!(
                        src.size() == dst.size(),
                        "shape mismatch for '{}': expect {:?}, but get {:?}",
                        key,
                        dst.size(),
                        src.size()
                    );
                    dst.copy_(src);
                }
            }
            Ok(())
        })?;

        self.step = step;
        Ok(())
    }
}

/// Dynamic loss scaling for reduced-precision backward passes.
#[derive(Debug, Clone, PartialEq)]
pub struct GradScaler {
    enabled: bool,
    scale: f64,
    growth_factor: f64,
    backoff_factor: f64,
    growth_interval: usize,
    growth_tracker: usize,
}

impl GradScaler {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            scale: if enabled { DEFAULT_INIT_SCALE } else { 1.0 },
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: DEFAULT_GROWTH_INTERVAL,
            growth_tracker: 0,
        }
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn scale_loss(&self, loss: &Tensor) -> Tensor {
        loss * self.scale
    }

    /// Divides the gradients by the scale. Returns false if any gradient is
    /// not finite.
    pub fn unscale(&self, grads: &mut [Tensor]) -> bool {
        let inv_scale = 1.0 / self.scale;
        tch::no_grad(|| {
            grads.iter_mut().fold(true, |finite, grad| {
                *grad = &*grad * inv_scale;
                let max = f64::from(&grad.abs().max());
                finite && max.is_finite()
            })
        })
    }

    pub fn update(&mut self, finite: bool) {
        if !self.enabled {
            return;
        }

        if finite {
            self.growth_tracker += 1;
            if self.growth_tracker >= self.growth_interval {
                self.scale *= self.growth_factor;
                self.growth_tracker = 0;
            }
        } else {
            self.scale *= self.backoff_factor;
            self.growth_tracker = 0;
        }
    }

    pub fn named_state(&self) -> Vec<(String, Tensor)> {
        vec![
            ("scaler.scale".into(), Tensor::of_slice(&[self.scale])),
            (
                "scaler.growth_tracker".into(),
                Tensor::of_slice(&[self.growth_tracker as i64]),
            ),
        ]
    }

    pub fn load_named_state(&mut self, state: &HashMap<String, Tensor>) {
        if !self.enabled {
            return;
        }
        if let Some(scale) = state.get("scaler.scale") {
            self.scale = f64::from(scale);
        }
        if let Some(tracker) = state.get("scaler.growth_tracker") {
            self.growth_tracker = i64::from(tracker) as usize;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn quadratic_grad(param: &Tensor) -> Tensor {
        param.detach() * 2.0
    }

    #[test]
    fn adam_step_test() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let param = vs.root().var("x", &[1], nn::Init::Const(1.0));
        let mut adam = AdamInit::new(0.1).build(&vs)?;

        // the first Adam step moves each parameter by about lr
        adam.step(&[quadratic_grad(&param)])?;
        assert_abs_diff_eq!(f64::from(&param), 0.9, epsilon = 1e-4);

        ensure!(adam.step(&[]).is_err());
        Ok(())
    }

    #[test]
    fn adam_state_round_trip_test() -> Result<()> {
        let make = || -> Result<_> {
            let vs = nn::VarStore::new(Device::Cpu);
            let param = vs.root().var("x", &[3], nn::Init::Const(1.0));
            let adam = AdamInit::new(0.01).build(&vs)?;
            Ok((vs, param, adam))
        };

        let (_vs1, param1, mut adam1) = make()?;
        for _ in 0..3 {
            adam1.step(&[quadratic_grad(&param1)])?;
        }

        let (_vs2, mut param2, mut adam2) = make()?;
        let state: HashMap<_, _> = adam1.named_state().into_iter().collect();
        adam2.load_named_state(&state)?;
        tch::no_grad(|| param2.copy_(&param1));
        ensure!(adam2.num_steps() == 3);

        adam1.step(&[quadratic_grad(&param1)])?;
        adam2.step(&[quadratic_grad(&param2)])?;
        assert_abs_diff_eq!(
            f64::from(&(&param1 - &param2).abs().max()),
            0.0,
            epsilon = 1e-7
        );

        let mut broken = state;
        broken.remove("exp_avg.x");
        ensure!(adam2.load_named_state(&broken).is_err());
        Ok(())
    }

    #[test]
    fn grad_scaler_test() -> Result<()> {
        let mut scaler = GradScaler::new(true);
        ensure!(scaler.scale() == 65536.0);

        let mut grads = vec![Tensor::ones(&[2], FLOAT_CPU) * 65536.0];
        ensure!(scaler.unscale(&mut grads));
        assert_abs_diff_eq!(f64::from(&grads[0].sum(Kind::Float)), 2.0, epsilon = 1e-6);

        let mut grads = vec![Tensor::of_slice(&[1.0f32, f32::INFINITY])];
        let finite = scaler.unscale(&mut grads);
        ensure!(!finite);
        scaler.update(finite);
        ensure!(scaler.scale() == 32768.0);

        (0..DEFAULT_GROWTH_INTERVAL).for_each(|_| scaler.update(true));
        ensure!(scaler.scale() == 65536.0);

        let mut disabled = GradScaler::new(false);
        disabled.update(false);
        ensure!(disabled.scale() == 1.0);
        Ok(())
    }
}
