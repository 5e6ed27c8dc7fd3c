//! SGD with momentum and L2 weight decay.

use candle_core::{backprop::GradStore, Result, Tensor, Var};
use candle_nn::optim::Optimizer;

/// Hyper-parameters for [`SgdMomentum`].
#[derive(Debug, Clone, Copy)]
pub struct ParamsSgdMomentum {
    pub lr: f64,
    pub momentum: f64,
    pub weight_decay: f64,
}

impl Default for ParamsSgdMomentum {
    fn default() -> Self {
        Self {
            lr: 0.1,
            momentum: 0.9,
            weight_decay: 1e-5,
        }
    }
}

/// Classic SGD: `v ← μ·v + (g + λ·θ)`, `θ ← θ − lr·v`.
///
/// Velocity buffers are allocated lazily on the first step that produces a
/// gradient for the corresponding var.
pub struct SgdMomentum {
    vars: Vec<Var>,
    velocity: Vec<Option<Tensor>>,
    params: ParamsSgdMomentum,
}

impl Optimizer for SgdMomentum {
    type Config = ParamsSgdMomentum;

    fn new(vars: Vec<Var>, params: ParamsSgdMomentum) -> Result<Self> {
        let vars: Vec<Var> = vars
            .into_iter()
            .filter(|var| var.dtype().is_float())
            .collect();
        let velocity = vars.iter().map(|_| None).collect();
        Ok(Self {
            vars,
            velocity,
            params,
        })
    }

    fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr;
    }

    fn step(&mut self, grads: &GradStore) -> Result<()> {
        for (var, velocity) in self.vars.iter().zip(self.velocity.iter_mut()) {
            let Some(grad) = grads.get(var.as_tensor()) else {
                continue;
            };
            let theta = var.as_tensor();
            let grad = if self.params.weight_decay > 0.0 {
                (grad + theta.affine(self.params.weight_decay, 0.0)?)?
            } else {
                grad.clone()
            };
            let v = match velocity.take() {
                Some(prev) => (prev.affine(self.params.momentum, 0.0)? + &grad)?,
                None => grad,
            };
            var.set(&theta.sub(&v.affine(self.params.lr, 0.0)?)?)?;
            *velocity = Some(v);
        }
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn momentum_accumulates_velocity() {
        let device = Device::Cpu;
        let x = Var::new(&[1.0f32], &device).unwrap();
        let mut opt = SgdMomentum::new(
            vec![x.clone()],
            ParamsSgdMomentum {
                lr: 0.1,
                momentum: 0.9,
                weight_decay: 0.0,
            },
        )
        .unwrap();

        // loss = x, so the gradient is constantly 1.
        let loss = x.as_tensor().sum_all().unwrap();
        let grads = loss.backward().unwrap();
        opt.step(&grads).unwrap();
        let after_one = x.as_tensor().to_vec1::<f32>().unwrap()[0];
        assert!((after_one - 0.9).abs() < 1e-6);

        let loss = x.as_tensor().sum_all().unwrap();
        let grads = loss.backward().unwrap();
        opt.step(&grads).unwrap();
        // v = 0.9·1 + 1 = 1.9 → x = 0.9 − 0.19 = 0.71
        let after_two = x.as_tensor().to_vec1::<f32>().unwrap()[0];
        assert!((after_two - 0.71).abs() < 1e-6);
    }

    #[test]
    fn weight_decay_shrinks_parameters() {
        let device = Device::Cpu;
        let x = Var::new(&[2.0f32], &device).unwrap();
        let mut opt = SgdMomentum::new(
            vec![x.clone()],
            ParamsSgdMomentum {
                lr: 0.1,
                momentum: 0.0,
                weight_decay: 0.5,
            },
        )
        .unwrap();
        // loss = x − x keeps the raw gradient at 0; only decay acts.
        let loss = (x.as_tensor() - x.as_tensor()).unwrap().sum_all().unwrap();
        let grads = loss.backward().unwrap();
        opt.step(&grads).unwrap();
        let value = x.as_tensor().to_vec1::<f32>().unwrap()[0];
        // θ = 2 − 0.1·(0 + 0.5·2) = 1.9
        assert!((value - 1.9).abs() < 1e-6);
    }
}
