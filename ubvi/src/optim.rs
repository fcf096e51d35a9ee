use crate::common::*;

use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use indicatif::{ProgressBar, ProgressDrawTarget};
use serde::{Deserialize, Serialize};

/// Adam on a stochastic objective, gradients by automatic
/// differentiation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdamOptions {
    /// Number of gradient steps. Default: 3000
    pub num_iters: usize,
    /// Base step size `lr`; step `t` uses `lr / sqrt(1 + t)`. Default: 0.1
    pub learning_rate: f64,
    /// Default: 0.9
    pub beta1: f64,
    /// Default: 0.999
    pub beta2: f64,
    /// Default: 1e-8
    pub eps: f64,
    /// Decoupled weight decay. Default: 0
    pub weight_decay: f64,
    pub show_progress: bool,
}

impl Default for AdamOptions {
    fn default() -> Self {
        AdamOptions {
            num_iters: 3000,
            learning_rate: 0.1,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.0,
            show_progress: false,
        }
    }
}

pub struct Adam {
    options: AdamOptions,
}

impl Adam {
    pub fn new(options: AdamOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &AdamOptions {
        &self.options
    }

    /// Minimize a Monte Carlo `loss` starting from `x0`.
    ///
    /// `loss` receives the parameters as a tracked `[p]` tensor and
    /// the generator for its draws, and returns a scalar tensor. A
    /// step is skipped when the loss or any gradient is not finite.
    ///
    /// Returns the final point and the loss trace, one value per step.
    pub fn minimize<L, R>(&self, mut loss: L, x0: &DVec, rng: &mut R) -> anyhow::Result<(DVec, Vec<f64>)>
    where
        L: FnMut(&Tensor, &mut R) -> anyhow::Result<Tensor>,
        R: Rng,
    {
        let opts = &self.options;
        let dev = Device::Cpu;

        let xx = Var::from_tensor(&x0.to_tensor(&dev)?)?;
        let mut adam = AdamW::new(
            vec![xx.clone()],
            ParamsAdamW {
                lr: opts.learning_rate,
                beta1: opts.beta1,
                beta2: opts.beta2,
                eps: opts.eps,
                weight_decay: opts.weight_decay,
            },
        )?;

        let mut trace = Vec::with_capacity(opts.num_iters);
        let mut num_skipped = 0;

        let pb = ProgressBar::new(opts.num_iters as u64);

        if !opts.show_progress {
            pb.set_draw_target(ProgressDrawTarget::hidden());
        }

        for t in 0..opts.num_iters {
            adam.set_learning_rate(opts.learning_rate / ((1 + t) as f64).sqrt());

            let loss_t = loss(xx.as_tensor(), rng)?;
            let value = loss_t.to_scalar::<f64>()?;
            trace.push(value);
            pb.inc(1);

            if !value.is_finite() {
                num_skipped += 1;
                debug!("[{}] skipped step, loss {}", t + 1, value);
                continue;
            }

            let grads = loss_t.backward()?;
            let finite = match grads.get(xx.as_tensor()) {
                Some(g) => g.to_vec1::<f64>()?.iter().all(|x| x.is_finite()),
                None => false,
            };
            if !finite {
                num_skipped += 1;
                debug!("[{}] skipped step, non-finite gradient", t + 1);
                continue;
            }

            adam.step(&grads)?;

            if (t + 1) % 100 == 0 {
                debug!("[{}] loss: {}", t + 1, value);
            }
        }

        pb.finish_and_clear();

        if num_skipped > 0 {
            warn!(
                "skipped {} of {} steps with non-finite loss or gradient",
                num_skipped, opts.num_iters
            );
        }

        Ok((DVec::from_tensor(xx.as_tensor())?, trace))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand_distr::StandardNormal;

    fn options(num_iters: usize, learning_rate: f64) -> AdamOptions {
        AdamOptions {
            num_iters,
            learning_rate,
            ..AdamOptions::default()
        }
    }

    #[test]
    fn minimizes_a_quadratic() -> anyhow::Result<()> {
        let target = DVec::from_vec(vec![1.0, -2.0, 0.5]);
        let target_t = target.to_tensor(&Device::Cpu)?;
        let adam = Adam::new(options(3000, 0.5));
        let mut rng = SmallRng::seed_from_u64(1);
        let (xx, trace) = adam.minimize(
            |x, _| Ok(x.sub(&target_t)?.sqr()?.sum_all()?),
            &DVec::zeros(3),
            &mut rng,
        )?;
        assert_eq!(trace.len(), 3000);
        assert_abs_diff_eq!(xx, target, epsilon = 1e-2);
        assert!(trace.last().unwrap() < &trace[0]);
        Ok(())
    }

    #[test]
    fn noisy_gradients_still_converge() -> anyhow::Result<()> {
        // E[(x - 3)² + x z] is minimized at 3 for z ~ N(0, 1)
        let adam = Adam::new(options(2000, 0.5));
        let mut rng = SmallRng::seed_from_u64(2);
        let (xx, _) = adam.minimize(
            |x, r| {
                let z: f64 = r.sample(StandardNormal);
                let quad = x.affine(1.0, -3.0)?.sqr()?;
                Ok((quad + x.affine(z, 0.0)?)?.sum_all()?)
            },
            &DVec::zeros(1),
            &mut rng,
        )?;
        assert_abs_diff_eq!(xx[0], 3.0, epsilon = 0.15);
        Ok(())
    }

    #[test]
    fn non_finite_losses_are_skipped() -> anyhow::Result<()> {
        let adam = Adam::new(options(50, 0.1));
        let mut rng = SmallRng::seed_from_u64(3);
        let x0 = DVec::from_vec(vec![-1.0, 4.0]);
        let (xx, trace) = adam.minimize(
            |x, _| Ok(x.sum_all()?.affine(f64::NAN, 0.0)?),
            &x0,
            &mut rng,
        )?;
        assert_eq!(xx, x0);
        assert_eq!(trace.len(), 50);
        Ok(())
    }

    #[test]
    fn non_finite_gradients_are_skipped() -> anyhow::Result<()> {
        // sqrt has an infinite slope at zero
        let adam = Adam::new(options(20, 0.1));
        let mut rng = SmallRng::seed_from_u64(4);
        let x0 = DVec::from_vec(vec![0.0]);
        let (xx, trace) = adam.minimize(|x, _| Ok(x.sqrt()?.sum_all()?), &x0, &mut rng)?;
        assert_eq!(xx, x0);
        assert!(trace.iter().all(|v| *v == 0.0));
        Ok(())
    }

    #[test]
    fn loss_errors_are_returned() {
        let adam = Adam::new(options(10, 0.1));
        let mut rng = SmallRng::seed_from_u64(5);
        let res = adam.minimize(
            |_, _| anyhow::bail!("target failed"),
            &DVec::zeros(2),
            &mut rng,
        );
        assert!(res.unwrap_err().to_string().contains("target failed"));
    }
}
