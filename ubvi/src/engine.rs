//! Hellinger-distance boosting engine.
//!
//! The approximation is a square-root mixture
//!
//! ```text
//! g(x) = Σ_i λ_i sqrt(g_i(x)),    q(x) = g(x)² / ∫ g²
//! ```
//!
//! grown one component per round. The engine owns the overlap matrix
//! `Z[j,k] = ∫ sqrt(g_j g_k)`, the estimates `log <sqrt f, sqrt g_i>`
//! and the weights `λ`, which are re-solved over all components after
//! every addition.
//!
//! The target enters only through its square root, so `logf` is
//! halved on the way in.

use crate::common::*;
use crate::traits::{ComponentFamily, ReparamFamily, Target};

use anyhow::Context;
use matrix_util::nnls::nnls;
use serde::{Deserialize, Serialize};

/// Options for the boosting engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UbviOptions {
    /// Maximum number of components `N`. Default: 10
    pub num_components: usize,
    /// Monte Carlo samples per objective evaluation and per
    /// Hellinger estimate. Default: 100
    pub num_samples: usize,
    /// Monte Carlo samples for each `log <f, g_i>` estimate. Default: 10000
    pub num_logfg_samples: usize,
    /// Candidate draws in the multi-start initialization. Default: 1000
    pub num_init: usize,
    /// Spread of initialization candidates around existing components. Default: 1.0
    pub init_inflation: f64,
}

impl Default for UbviOptions {
    fn default() -> Self {
        UbviOptions {
            num_components: 10,
            num_samples: 100,
            num_logfg_samples: 10_000,
            num_init: 1000,
            init_inflation: 1.0,
        }
    }
}

pub struct Ubvi<T: Target, F: ComponentFamily> {
    target: T,
    family: F,
    options: UbviOptions,
    params: Vec<DVec>,
    /// `λ` over all `N` slots; only the registered ones are nonzero
    weights: DVec,
    /// `Z` over all `N` slots
    overlap: Mat,
    /// `log <sqrt f, sqrt g_i>` over all `N` slots
    log_fg: DVec,
    /// `log <sqrt f, g>` of the current weighted mixture
    log_fg_sum: f64,
}

impl<T: Target, F: ComponentFamily> Ubvi<T, F> {
    pub fn new(target: T, family: F, options: UbviOptions) -> Self {
        let nn = options.num_components;
        Self {
            target,
            family,
            options,
            params: Vec::with_capacity(nn),
            weights: DVec::zeros(nn),
            overlap: Mat::zeros(nn, nn),
            log_fg: DVec::from_element(nn, f64::NEG_INFINITY),
            log_fg_sum: f64::NEG_INFINITY,
        }
    }

    pub fn options(&self) -> &UbviOptions {
        &self.options
    }

    pub fn family(&self) -> &F {
        &self.family
    }

    pub fn target(&self) -> &T {
        &self.target
    }

    /// number of registered components
    pub fn num_components(&self) -> usize {
        self.params.len()
    }

    pub fn params(&self) -> &[DVec] {
        &self.params
    }

    /// weights of the registered components
    pub fn weights(&self) -> DVec {
        self.weights.rows(0, self.num_components()).into_owned()
    }

    /// overlap matrix of the registered components
    pub fn overlap(&self) -> Mat {
        let kk = self.num_components();
        self.overlap.view((0, 0), (kk, kk)).into_owned()
    }

    /// `log <sqrt f, sqrt g_i>` estimates of the registered components
    pub fn log_fg(&self) -> DVec {
        self.log_fg.rows(0, self.num_components()).into_owned()
    }

    pub fn log_fg_sum(&self) -> f64 {
        self.log_fg_sum
    }

    /// `log sqrt f` at each row of `x`
    fn log_sqrt_target(&self, x: &Mat) -> anyhow::Result<DVec> {
        let lf = self.target.logf(&x.to_tensor(&Device::Cpu)?)?;
        let lf = DVec::from_tensor(&lf)?;
        if lf.len() != x.nrows() {
            anyhow::bail!("target returned {} values for {} points", lf.len(), x.nrows());
        }
        Ok(lf * 0.5)
    }

    /// Register the next component and re-fit the mixture.
    ///
    /// Updates the overlap matrix, estimates `log <f, g_i>`, re-solves
    /// all the weights and returns the new Hellinger-squared estimate.
    /// On failure nothing is committed.
    pub fn register_component<R: Rng>(&mut self, params: DVec, rng: &mut R) -> anyhow::Result<f64> {
        let i = self.num_components();
        if i >= self.options.num_components {
            anyhow::bail!(
                "cannot add component {}: the mixture holds at most {} components",
                i,
                self.options.num_components
            );
        }
        if params.len() != self.family.num_params() {
            anyhow::bail!(
                "round {}: expected {} parameters, got {}",
                i,
                self.family.num_params(),
                params.len()
            );
        }

        let saved = (
            self.weights.clone(),
            self.overlap.clone(),
            self.log_fg.clone(),
            self.log_fg_sum,
        );
        self.params.push(params);

        match self.refit(i, rng) {
            Ok(hellsq) => Ok(hellsq),
            Err(err) => {
                self.params.pop();
                (self.weights, self.overlap, self.log_fg, self.log_fg_sum) = saved;
                Err(err)
            }
        }
    }

    /// Update `Z` and `log_fg` for the newly pushed component `i`,
    /// re-solve the weights and estimate the distance
    fn refit<R: Rng>(&mut self, i: usize, rng: &mut R) -> anyhow::Result<f64> {
        let znew = self
            .family
            .log_sqrt_pair_integral_batch(&self.params[i], &self.params[..=i])
            .map(f64::exp);
        self.overlap.row_mut(i).columns_mut(0, i + 1).copy_from(&znew.transpose());
        self.overlap.column_mut(i).rows_mut(0, i + 1).copy_from(&znew);
        self.log_fg[i] = self.logfg_est(i, rng)?;

        let weights = if i == 0 {
            DVec::from_element(1, 1.0)
        } else {
            solve_weights(&self.overlap(), &self.log_fg()).with_context(|| format!("round {}", i))?
        };
        self.weights.rows_mut(0, i + 1).copy_from(&weights);

        self.current_distance(i, rng)
    }

    /// `log <sqrt f, sqrt g_i>` by importance sampling from `g_i`
    fn logfg_est<R: Rng>(&self, i: usize, rng: &mut R) -> anyhow::Result<f64> {
        let x = self
            .family
            .sample(&self.params[i], self.options.num_logfg_samples, rng);
        let lf = self.log_sqrt_target(&x)?;
        let lg = self.family.logpdf(&self.params[i], &x) * 0.5;
        Ok((lf - lg).log_mean_exp())
    }

    /// Refresh `log <sqrt f, g>` for the current weights and report the
    /// Hellinger-squared estimate after round `i`
    fn current_distance<R: Rng>(&mut self, i: usize, rng: &mut R) -> anyhow::Result<f64> {
        let terms: Vec<f64> = std::iter::once(f64::NEG_INFINITY)
            .chain((0..=i).map(|j| self.log_fg[j] + self.weights[j].max(MIN_WEIGHT).ln()))
            .collect();
        self.log_fg_sum = terms.log_sum_exp();

        let hellsq = self.hellsq_est(i, rng)?;
        info!("round {}: Hellinger-squared estimate {:.6}", i, hellsq);
        Ok(hellsq)
    }

    /// The round objective for a candidate component `x` against the
    /// registered mixture; larger is better.
    ///
    /// See [`Ubvi::objective_with`].
    pub fn objective<R: Rng>(&self, x: &DVec, rng: &mut R) -> anyhow::Result<f64> {
        let kk = self.num_components();
        self.objective_with(x, &self.params, &self.weights.as_slice()[..kk], rng)
    }

    /// Log of the Hellinger-affinity gain from adding `h = g(·; x)` to
    /// the mixture `(params, weights)`; larger is better.
    ///
    /// With `lgh = log <h, g>`, `lf = log <f, h>` (importance sampled
    /// from `h`) and `lg = log <f, g> + lgh`, the gain is
    ///
    /// ```text
    /// (exp(lf) - exp(lg)) / sqrt(1 - exp(2 lgh))
    /// ```
    ///
    /// carried in log space. When the gain is negative the negated log
    /// of its magnitude is returned, so `log(1 - exp(a))` only ever
    /// sees `a <= 0`. Reads but never modifies the engine.
    pub fn objective_with<R: Rng>(
        &self,
        x: &DVec,
        params: &[DVec],
        weights: &[f64],
        rng: &mut R,
    ) -> anyhow::Result<f64> {
        if params.len() != weights.len() {
            anyhow::bail!(
                "{} components but {} weights",
                params.len(),
                weights.len()
            );
        }

        let lgh = if weights.is_empty() {
            f64::NEG_INFINITY
        } else {
            let lpi = self.family.log_sqrt_pair_integral_batch(x, params);
            let terms: Vec<f64> = weights
                .iter()
                .zip(lpi.iter())
                .map(|(w, l)| w.max(MIN_WEIGHT).ln() + l)
                .collect();
            terms.log_sum_exp()
        };

        let nn = self.options.num_samples;
        let h_samples = self.family.sample(x, nn, rng);
        let lf = self.log_sqrt_target(&h_samples)?;
        let lh = self.family.logpdf(x, &h_samples) * 0.5;

        let lf_num = (lf - lh).log_mean_exp();
        let lg_num = self.log_fg_sum + lgh;

        if lf_num.is_nan() || lg_num.is_nan() {
            return Ok(f64::NAN);
        }
        if lf_num == f64::NEG_INFINITY && lg_num == f64::NEG_INFINITY {
            return Ok(f64::NEG_INFINITY);
        }

        let log_denom = 0.5 * log1mexp(2.0 * lgh);

        Ok(if lf_num > lg_num {
            lf_num - log_denom + log1mexp(lg_num - lf_num)
        } else {
            -(lg_num - log_denom + log1mexp(lf_num - lg_num))
        })
    }

    /// Hellinger-squared distance between `f` and the mixture of
    /// components `0..=i`, self-normalized importance sampling from
    /// `g²`:
    ///
    /// ```text
    /// 1 - mean(r) / sqrt(mean(r²)),   r = sqrt(f) / g
    /// ```
    pub fn hellsq_est<R: Rng>(&self, i: usize, rng: &mut R) -> anyhow::Result<f64> {
        let x = self.sample_g(i, self.options.num_samples, rng)?;
        let lf = self.log_sqrt_target(&x)?;
        let lg = self.logg(&x, i + 1);
        let lr = lf - lg;
        let num = lr.log_mean_exp();
        let den = (&lr * 2.0).log_mean_exp();
        Ok(1.0 - (num - 0.5 * den).exp())
    }

    /// Draw `n` points from `g² / ∫g²` where `g` is the mixture of
    /// components `0..=i`.
    ///
    /// `g²` expands into pair terms `λ_j λ_k sqrt(g_j g_k)` with mass
    /// `λ_j λ_k Z[j,k]`; a multinomial split of `n` over the ordered
    /// pairs is folded onto unordered pairs, and each pair with a
    /// positive count draws from the family's cross density.
    pub fn sample_g<R: Rng>(&self, i: usize, n: usize, rng: &mut R) -> anyhow::Result<Mat> {
        let kk = i + 1;
        if kk > self.num_components() {
            anyhow::bail!(
                "cannot sample components 0..={} with only {} registered",
                i,
                self.num_components()
            );
        }
        if n == 0 {
            return Ok(Mat::zeros(0, self.family.dim()));
        }

        let ww = &self.weights;
        let mut pair_mass = Vec::with_capacity(kk * kk);
        for j in 0..kk {
            for m in 0..kk {
                pair_mass.push(ww[j] * self.overlap[(j, m)] * ww[m]);
            }
        }

        let counts = multinomial(n, &pair_mass, rng)?;

        let mut blocks = vec![];
        for j in 0..kk {
            for m in 0..=j {
                let nsamp = if j == m {
                    counts[j * kk + j]
                } else {
                    counts[j * kk + m] + counts[m * kk + j]
                };
                if nsamp > 0 {
                    blocks.push(self.family.cross_sample(
                        &self.params[j],
                        &self.params[m],
                        nsamp,
                        rng,
                    )?);
                }
            }
        }

        Mat::concatenate_rows(&blocks)
    }

    /// `log g(x) = log Σ_{j < k} λ_j sqrt(g_j(x))` for each row of `x`,
    /// using the first `k` components; `-inf` everywhere when `k == 0`
    pub fn logg(&self, x: &Mat, k: usize) -> DVec {
        let nn = x.nrows();
        if k == 0 {
            return DVec::from_element(nn, f64::NEG_INFINITY);
        }

        let log_w: Vec<f64> = (0..k).map(|j| self.weights[j].max(MIN_WEIGHT).ln()).collect();
        let half_lp = self.family.logpdf_batch(&self.params[..k], x) * 0.5;

        DVec::from_iterator(
            nn,
            half_lp.row_iter().map(|row| {
                row.iter()
                    .zip(log_w.iter())
                    .map(|(lp, lw)| lp + lw)
                    .collect::<Vec<f64>>()
                    .log_sum_exp()
            }),
        )
    }

    /// Multi-start search for round `i`'s starting point: draw
    /// `num_init` candidates from the family's initializer and keep
    /// the one with the smallest finite `loss`. Fails if no candidate
    /// has a finite loss.
    pub fn initialize<L, R>(&self, mut loss: L, i: usize, rng: &mut R) -> anyhow::Result<DVec>
    where
        L: FnMut(&DVec) -> anyhow::Result<f64>,
        R: Rng,
    {
        if i > self.num_components() {
            anyhow::bail!(
                "cannot initialize round {} with only {} registered components",
                i,
                self.num_components()
            );
        }

        info!("round {}: initializing from {} candidates", i, self.options.num_init);

        let mut best: Option<(DVec, f64)> = None;
        for _ in 0..self.options.num_init {
            let candidate = self.family.params_init(
                &self.params[..i],
                &self.weights.as_slice()[..i],
                self.options.init_inflation,
                rng,
            );
            let value = loss(&candidate)?;
            if !value.is_finite() {
                continue;
            }
            let best_value = best.as_ref().map_or(f64::INFINITY, |(_, v)| *v);
            if value < best_value {
                debug!("improved x0: {:?} with obj0 = {}", candidate.as_slice(), value);
                best = Some((candidate, value));
            }
        }

        match best {
            Some((x0, _)) => Ok(x0),
            None => anyhow::bail!(
                "round {}: no candidate with a finite objective after {} initialization attempts",
                i,
                self.options.num_init
            ),
        }
    }

    /// `log q(x)` of the fitted approximation `q = g² / (λ' Z λ)`
    pub fn log_density(&self, x: &Mat) -> DVec {
        let kk = self.num_components();
        if kk == 0 {
            return DVec::from_element(x.nrows(), f64::NEG_INFINITY);
        }
        let ww = self.weights();
        let log_norm = (ww.transpose() * self.overlap() * &ww)[(0, 0)].ln();
        self.logg(x, kk).map(|lg| 2.0 * lg - log_norm)
    }

    /// Draw `n` points from the fitted approximation
    pub fn sample<R: Rng>(&self, n: usize, rng: &mut R) -> anyhow::Result<Mat> {
        match self.num_components() {
            0 => anyhow::bail!("no components registered yet"),
            kk => self.sample_g(kk - 1, n, rng),
        }
    }
}

impl<T: Target, F: ReparamFamily> Ubvi<T, F> {
    /// [`Ubvi::objective`] as a differentiable function of a
    /// parameter tensor `x`, typically a [`Var`].
    ///
    /// The candidate's samples are reparameterised, `T(x, ε)` with `ε`
    /// drawn from `rng`, so gradients reach `x` through `log f`,
    /// `log h` and the closed-form overlaps `log <h, g_j>`. Draws the
    /// same random numbers as [`Ubvi::objective`] and agrees with it
    /// at the same seed.
    pub fn objective_tensor<R: Rng>(&self, x: &Tensor, rng: &mut R) -> anyhow::Result<Tensor> {
        let kk = self.num_components();
        let nn = self.options.num_samples;
        let dev = x.device();

        let eps = self.family.noise(nn, rng).to_tensor(dev)?;
        let h_samples = self.family.sample_t(x, &eps)?;
        let lf = self.target.logf(&h_samples)?.affine(0.5, 0.0)?;
        let lh = self.family.logpdf_at_sample_t(x, &eps)?.affine(0.5, 0.0)?;
        let lf_num = log_mean_exp_tensor(&(lf - lh)?, 0)?;

        if kk == 0 {
            // lg = -inf, and the gain reduces to <f, h>
            return Ok(lf_num);
        }

        let log_w: Vec<f64> = (0..kk)
            .map(|j| self.weights[j].max(MIN_WEIGHT).ln())
            .collect();
        let log_w = Tensor::from_vec(log_w, kk, dev)?;
        let lpi = self.family.log_sqrt_pair_integral_t(x, &self.params)?;
        let lgh = log_sum_exp_tensor(&(lpi + log_w)?, 0)?;
        let lg_num = lgh.affine(1.0, self.log_fg_sum)?;

        let lf_val = lf_num.to_scalar::<f64>()?;
        let lg_val = lg_num.to_scalar::<f64>()?;
        if lf_val.is_nan() || lg_val.is_nan() {
            return Ok(Tensor::new(f64::NAN, dev)?);
        }
        if lf_val == f64::NEG_INFINITY && lg_val == f64::NEG_INFINITY {
            return Ok(Tensor::new(f64::NEG_INFINITY, dev)?);
        }

        let log_denom = log1mexp_tensor(&lgh.affine(2.0, 0.0)?)?.affine(0.5, 0.0)?;

        let ret = if lf_val > lg_val {
            let gain = log1mexp_tensor(&(&lg_num - &lf_num)?)?;
            ((lf_num - log_denom)? + gain)?
        } else {
            let loss = log1mexp_tensor(&(&lf_num - &lg_num)?)?;
            ((lg_num - log_denom)? + loss)?.neg()?
        };
        Ok(ret)
    }
}

/// Weights of a square-root mixture maximizing `λ' d` subject to
/// `λ' Z λ = 1` and `λ >= 0`, where `d = exp(log_fg - max log_fg)`.
///
/// With `Z = L L'` and `Linv = L^{-1}`, solve the NNLS problem
/// `min ||Linv x + Linv d||` over `x >= 0`, then
/// `λ = Linv' u / ||u||` with `u = Linv (x + d)`. Tiny negative
/// entries from round-off are clipped to zero. The weights are not
/// normalized to sum to one.
pub fn solve_weights(overlap: &Mat, log_fg: &DVec) -> anyhow::Result<DVec> {
    let kk = log_fg.len();
    if overlap.shape() != (kk, kk) {
        anyhow::bail!(
            "overlap matrix is {:?} but there are {} components",
            overlap.shape(),
            kk
        );
    }

    let max_log_fg = log_fg.max();
    if !max_log_fg.is_finite() {
        anyhow::bail!("log <f, g_i> estimates are not finite: {:?}", log_fg.as_slice());
    }

    let (chol, _) = cholesky_with_jitter(overlap).context("overlap matrix factorization")?;
    let linv = lower_triangular_inverse(&chol.l())?;

    let dd = log_fg.map(|x| (x - max_log_fg).exp());
    let bb = nnls(&linv, &(-(&linv * &dd)))?;
    let lbd = &linv * (bb + &dd);

    let norm = lbd.norm();
    if !(norm > 0.0 && norm.is_finite()) {
        anyhow::bail!("degenerate weight direction, norm = {}", norm);
    }

    Ok((linv.tr_mul(&(lbd / norm))).map(|x| x.max(0.0)))
}
