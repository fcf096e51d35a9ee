use crate::common::*;
use crate::engine::{Ubvi, UbviOptions};
use crate::optim::{Adam, AdamOptions};
use crate::traits::{ReparamFamily, Target};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Instant;

/// Summary of one boosting round
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundReport {
    pub round: usize,
    /// Hellinger-squared estimate after the round
    pub hellsq: f64,
    /// weights of components `0..=round`
    pub weights: Vec<f64>,
    /// final loss of the round's optimizer
    pub final_loss: f64,
    pub elapsed_secs: f64,
}

/// A fitted square-root mixture `q ∝ (Σ_i λ_i sqrt(g_i))²`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqrtMixture {
    pub dim: usize,
    pub params: Vec<Vec<f64>>,
    pub weights: Vec<f64>,
    /// `Z[j][k] = ∫ sqrt(g_j g_k)`
    pub overlap: Vec<Vec<f64>>,
    pub log_fg: Vec<f64>,
    pub reports: Vec<RoundReport>,
}

impl SqrtMixture {
    pub fn num_components(&self) -> usize {
        self.params.len()
    }

    pub fn to_json_file(&self, file_path: &str) -> anyhow::Result<()> {
        if let Some(dir) = Path::new(file_path).parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }
        std::fs::write(file_path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn from_json_file(file_path: &str) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(file_path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// Runs the boosting rounds: multi-start initialization, Adam
/// refinement of the round objective, then registration with the
/// engine.
pub struct BoostingVi<T: Target, F: ReparamFamily> {
    engine: Ubvi<T, F>,
    adam: Adam,
    rng: SmallRng,
    reports: Vec<RoundReport>,
}

impl<T: Target, F: ReparamFamily> BoostingVi<T, F> {
    pub fn new(
        target: T,
        family: F,
        ubvi_options: UbviOptions,
        adam_options: AdamOptions,
        seed: u64,
    ) -> Self {
        Self {
            engine: Ubvi::new(target, family, ubvi_options),
            adam: Adam::new(adam_options),
            rng: SmallRng::seed_from_u64(seed),
            reports: vec![],
        }
    }

    pub fn engine(&self) -> &Ubvi<T, F> {
        &self.engine
    }

    pub fn reports(&self) -> &[RoundReport] {
        &self.reports
    }

    /// Run the remaining rounds up to the configured number of
    /// components and return the fitted mixture
    pub fn run(&mut self) -> anyhow::Result<SqrtMixture> {
        let nn = self.engine.options().num_components;
        while self.engine.num_components() < nn {
            self.step()?;
        }
        Ok(self.mixture())
    }

    /// One boosting round
    pub fn step(&mut self) -> anyhow::Result<&RoundReport> {
        let i = self.engine.num_components();
        let timer = Instant::now();

        let engine = &self.engine;

        let mut init_rng = SmallRng::seed_from_u64(self.rng.random());
        let x0 = engine.initialize(|x| Ok(-engine.objective(x, &mut init_rng)?), i, &mut self.rng)?;

        let (x, trace) = self
            .adam
            .minimize(|x, r| Ok(engine.objective_tensor(x, r)?.neg()?), &x0, &mut self.rng)
            .with_context(|| format!("round {}: optimizer", i))?;

        let final_loss = trace.last().copied().unwrap_or(f64::NAN);
        info!("round {}: optimizer finished, loss {:.6}", i, final_loss);

        let hellsq = self.engine.register_component(x, &mut self.rng)?;

        self.reports.push(RoundReport {
            round: i,
            hellsq,
            weights: self.engine.weights().as_slice().to_vec(),
            final_loss,
            elapsed_secs: timer.elapsed().as_secs_f64(),
        });

        self.reports
            .last()
            .ok_or(anyhow::anyhow!("no report for round {}", i))
    }

    /// Snapshot of the current mixture
    pub fn mixture(&self) -> SqrtMixture {
        let zz = self.engine.overlap();
        SqrtMixture {
            dim: self.engine.family().dim(),
            params: self
                .engine
                .params()
                .iter()
                .map(|p| p.as_slice().to_vec())
                .collect(),
            weights: self.engine.weights().as_slice().to_vec(),
            overlap: zz
                .row_iter()
                .map(|row| row.iter().copied().collect())
                .collect(),
            log_fg: self.engine.log_fg().as_slice().to_vec(),
            reports: self.reports.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gaussian::GaussianFamily;
    use crate::traits::ComponentFamily;
    use approx::assert_abs_diff_eq;

    fn quick_options(num_components: usize) -> (UbviOptions, AdamOptions) {
        (
            UbviOptions {
                num_components,
                num_samples: 100,
                num_logfg_samples: 1000,
                num_init: 50,
                init_inflation: 1.0,
            },
            AdamOptions {
                num_iters: 30,
                ..AdamOptions::default()
            },
        )
    }

    /// N((1, 0), diag(1, 1/2)) up to a constant
    fn gaussian_target(x: &Tensor) -> candle_core::Result<Tensor> {
        let a = x.i((.., 0))?.affine(1.0, -1.0)?.sqr()?;
        let b = x.i((.., 1))?.sqr()?;
        a.affine(-0.5, 0.0)? - b
    }

    #[test]
    fn single_component_finds_a_gaussian_target() {
        let (uo, ao) = quick_options(1);
        let ao = AdamOptions {
            num_iters: 500,
            ..ao
        };
        let mut vi = BoostingVi::new(gaussian_target, GaussianFamily::new(2), uo, ao, 3);
        let mix = vi.run().unwrap();
        let fam = vi.engine().family();
        let p = DVec::from_vec(mix.params[0].clone());
        assert_abs_diff_eq!(fam.mean(&p), DVec::from_vec(vec![1.0, 0.0]), epsilon = 0.3);
        assert!(mix.reports[0].hellsq < 0.05, "{}", mix.reports[0].hellsq);
        assert_eq!(fam.num_params(), p.len());
    }

    #[test]
    fn run_fills_every_round() {
        let (uo, ao) = quick_options(3);
        let mut vi = BoostingVi::new(gaussian_target, GaussianFamily::new(2), uo, ao, 42);
        let mix = vi.run().unwrap();

        assert_eq!(mix.num_components(), 3);
        assert_eq!(mix.dim, 2);
        assert_eq!(mix.reports.len(), 3);
        for (i, rep) in mix.reports.iter().enumerate() {
            assert_eq!(rep.round, i);
            assert_eq!(rep.weights.len(), i + 1);
            assert!(rep.weights.iter().all(|&w| w >= 0.0));
            assert!((0.0..=1.0).contains(&rep.hellsq), "{}", rep.hellsq);
        }
        assert_eq!(mix.overlap.len(), 3);
        for j in 0..3 {
            assert_eq!(mix.overlap[j][j], 1.0);
        }

        // a finished run has nothing left to do
        let again = vi.run().unwrap();
        assert_eq!(again, mix);
    }

    #[test]
    fn same_seed_same_mixture() {
        let fit = |seed| {
            let (uo, ao) = quick_options(2);
            BoostingVi::new(gaussian_target, GaussianFamily::new(2), uo, ao, seed)
                .run()
                .map(|m| (m.params, m.weights))
                .unwrap()
        };
        assert_eq!(fit(7), fit(7));
    }
}
