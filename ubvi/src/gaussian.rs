//! Multivariate Gaussian components.
//!
//! A parameter vector holds the mean `μ` followed by the rows of the
//! lower-triangular Cholesky factor `L` of `Σ = L L'`, packed row by
//! row, with the diagonal stored on the log scale:
//!
//! ```text
//! θ = [ μ_1 .. μ_d | log L_11 | L_21, log L_22 | ... | L_d1 .. log L_dd ]
//! ```
//!
//! so any real vector of length `d + d(d+1)/2` is a valid component.

use crate::common::*;
use crate::traits::{ComponentFamily, ReparamFamily};
use rand_distr::weighted::WeightedIndex;
use rand_distr::Distribution;

const LN_2PI: f64 = 1.837_877_066_409_345_5;

#[derive(Debug, Clone)]
pub struct GaussianFamily {
    dim: usize,
    /// scale of the very first candidate components
    init_scale: f64,
}

impl GaussianFamily {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            init_scale: 1.0,
        }
    }

    /// Set the standard deviation of the first round's candidates
    pub fn with_init_scale(mut self, init_scale: f64) -> Self {
        self.init_scale = init_scale;
        self
    }

    pub fn init_scale(&self) -> f64 {
        self.init_scale
    }

    /// Pack a mean and a lower-triangular factor with positive
    /// diagonal into a parameter vector
    pub fn pack(&self, mu: &DVec, chol: &Mat) -> anyhow::Result<DVec> {
        let dd = self.dim;
        if mu.len() != dd || chol.shape() != (dd, dd) {
            anyhow::bail!(
                "expected a {}-vector and a {} x {} factor, got {} and {:?}",
                dd,
                dd,
                dd,
                mu.len(),
                chol.shape()
            );
        }
        if chol.diagonal().iter().any(|&x| x <= 0.0) {
            anyhow::bail!("the Cholesky factor must have a positive diagonal");
        }

        let mut ret = DVec::zeros(self.num_params());
        ret.rows_mut(0, dd).copy_from(mu);
        let mut k = dd;
        for r in 0..dd {
            for c in 0..=r {
                ret[k] = if r == c { chol[(r, c)].ln() } else { chol[(r, c)] };
                k += 1;
            }
        }
        Ok(ret)
    }

    /// Parameter vector of `N(μ, Σ)`
    pub fn from_mean_cov(&self, mu: &DVec, cov: &Mat) -> anyhow::Result<DVec> {
        let chol = cov
            .clone()
            .cholesky()
            .ok_or(anyhow::anyhow!("covariance is not positive definite"))?;
        self.pack(mu, &chol.l())
    }

    pub fn mean(&self, params: &DVec) -> DVec {
        params.rows(0, self.dim).into_owned()
    }

    /// The lower-triangular factor `L` with `Σ = L L'`
    pub fn chol_factor(&self, params: &DVec) -> Mat {
        let dd = self.dim;
        let mut ret = Mat::zeros(dd, dd);
        let mut k = dd;
        for r in 0..dd {
            for c in 0..=r {
                ret[(r, c)] = if r == c { params[k].exp() } else { params[k] };
                k += 1;
            }
        }
        ret
    }

    pub fn covariance(&self, params: &DVec) -> Mat {
        let ll = self.chol_factor(params);
        &ll * ll.transpose()
    }

    /// position of `log L_rr` in a parameter vector
    fn log_diag_index(&self, r: usize) -> usize {
        self.dim + r * (r + 3) / 2
    }

    /// `log |Σ|`
    fn log_det(&self, params: &DVec) -> f64 {
        (0..self.dim)
            .map(|r| 2.0 * params[self.log_diag_index(r)])
            .sum()
    }

    /// `Σ^{-1}` through the inverse of the Cholesky factor
    fn precision(&self, params: &DVec) -> anyhow::Result<Mat> {
        let linv = lower_triangular_inverse(&self.chol_factor(params))?;
        Ok(linv.tr_mul(&linv))
    }
}

/// Add `mu'` to every row of `x`
fn shift_rows(mut x: Mat, mu: &DVec) -> Mat {
    let mu_t = mu.transpose();
    for mut row in x.row_iter_mut() {
        row += &mu_t;
    }
    x
}

impl ComponentFamily for GaussianFamily {
    fn dim(&self) -> usize {
        self.dim
    }

    fn num_params(&self) -> usize {
        self.dim + self.dim * (self.dim + 1) / 2
    }

    fn logpdf(&self, params: &DVec, x: &Mat) -> DVec {
        let dd = self.dim as f64;
        let mu = self.mean(params);
        let ll = self.chol_factor(params);

        // z = L^{-1} (x - μ), one column per point
        let centred = shift_rows(x.clone(), &(-mu)).transpose();
        let zz = ll.solve_lower_triangular_unchecked(&centred);

        let log_norm = -0.5 * dd * LN_2PI - 0.5 * self.log_det(params);
        DVec::from_iterator(
            x.nrows(),
            zz.column_iter().map(|z| log_norm - 0.5 * z.norm_squared()),
        )
    }

    fn sample<R: Rng>(&self, params: &DVec, n: usize, rng: &mut R) -> Mat {
        let ll = self.chol_factor(params);
        let eps = self.noise(n, rng);
        shift_rows(eps * ll.transpose(), &self.mean(params))
    }

    /// `sqrt(N(μa, Σa) N(μb, Σb))` is proportional to a Gaussian with
    /// precision `P = (Σa^{-1} + Σb^{-1}) / 2` and mean
    /// `P^{-1} (Σa^{-1} μa + Σb^{-1} μb) / 2`
    fn cross_sample<R: Rng>(
        &self,
        params_a: &DVec,
        params_b: &DVec,
        n: usize,
        rng: &mut R,
    ) -> anyhow::Result<Mat> {
        if params_a == params_b {
            return Ok(self.sample(params_a, n, rng));
        }

        let prec_a = self.precision(params_a)?;
        let prec_b = self.precision(params_b)?;
        let prec = (&prec_a + &prec_b) * 0.5;
        let shift = (&prec_a * self.mean(params_a) + &prec_b * self.mean(params_b)) * 0.5;

        let (chol, _) = cholesky_with_jitter(&prec)?;
        let mu = chol.solve(&shift);

        // x = μ + L^{-T} ε has covariance (L L')^{-1} = P^{-1}
        let eps = Mat::rnorm(self.dim, n, rng);
        let xx = chol
            .l()
            .transpose()
            .solve_upper_triangular(&eps)
            .ok_or(anyhow::anyhow!("singular cross-precision factor"))?;

        Ok(shift_rows(xx.transpose(), &mu))
    }

    /// Bhattacharyya coefficient of two Gaussians, `Σ̄ = (Σa + Σb) / 2`:
    ///
    /// ```text
    /// -1/8 δ' Σ̄^{-1} δ - 1/2 log|Σ̄| + 1/4 (log|Σa| + log|Σb|)
    /// ```
    ///
    /// Returns `NaN` if `Σ̄` cannot be factorized.
    fn log_sqrt_pair_integral(&self, params_a: &DVec, params_b: &DVec) -> f64 {
        if params_a == params_b {
            return 0.0;
        }

        let sig_bar = (self.covariance(params_a) + self.covariance(params_b)) * 0.5;
        let Some(chol) = sig_bar.cholesky() else {
            return f64::NAN;
        };

        let delta = self.mean(params_a) - self.mean(params_b);
        let Some(zz) = chol.l_dirty().solve_lower_triangular(&delta) else {
            return f64::NAN;
        };

        -0.125 * zz.norm_squared() - 0.5 * cholesky_log_det(&chol)
            + 0.25 * (self.log_det(params_a) + self.log_det(params_b))
    }

    fn params_init<R: Rng>(
        &self,
        params: &[DVec],
        weights: &[f64],
        inflation: f64,
        rng: &mut R,
    ) -> DVec {
        let dd = self.dim;

        if params.is_empty() {
            let mu = Mat::rnorm(dd, 1, rng).column(0) * (inflation.sqrt() * self.init_scale);
            let mut ret = DVec::zeros(self.num_params());
            ret.rows_mut(0, dd).copy_from(&mu);
            for r in 0..dd {
                ret[self.log_diag_index(r)] = self.init_scale.ln();
            }
            return ret;
        }

        let probs: Vec<f64> = (0..params.len())
            .map(|k| weights.get(k).copied().unwrap_or(0.0).max(0.0))
            .collect();
        let pick = match WeightedIndex::new(&probs) {
            Ok(widx) => widx.sample(rng),
            Err(_) => rng.random_range(0..params.len()),
        };

        let base = &params[pick];
        let ll = self.chol_factor(base);
        let eps = Mat::rnorm(dd, 1, rng).column(0).into_owned();
        let mu = self.mean(base) + (&ll * eps) * inflation.sqrt();

        // L_k exp(ξ): shift the log-diagonal, scale the rest
        let xi: f64 = rng.sample(StandardNormal);
        let mut ret = base.clone();
        ret.rows_mut(0, dd).copy_from(&mu);
        let mut k = dd;
        for r in 0..dd {
            for c in 0..=r {
                if r == c {
                    ret[k] += xi;
                } else {
                    ret[k] *= xi.exp();
                }
                k += 1;
            }
        }
        ret
    }
}

/// Tensor versions of the parameter layout
impl GaussianFamily {
    /// `L` as a `[d, d]` tensor. The packed rows are gathered into a
    /// dense `d x d` layout, with a trailing zero slot standing for
    /// the upper triangle, and the diagonal is exponentiated.
    fn chol_factor_t(&self, params: &Tensor) -> candle_core::Result<Tensor> {
        let dd = self.dim;
        let npacked = self.num_params() - dd;
        let dev = params.device();

        let mut index = vec![npacked as u32; dd * dd];
        let mut diag = vec![0_f64; dd * dd];
        let mut k = 0;
        for r in 0..dd {
            for c in 0..=r {
                index[r * dd + c] = k as u32;
                if r == c {
                    diag[r * dd + c] = 1.0;
                }
                k += 1;
            }
        }

        let packed = params.narrow(0, dd, npacked)?;
        let padded = Tensor::cat(&[&packed, &Tensor::zeros(1, params.dtype(), dev)?], 0)?;
        let flat = padded.index_select(&Tensor::from_vec(index, dd * dd, dev)?, 0)?;

        let diag = Tensor::from_vec(diag, dd * dd, dev)?.to_dtype(params.dtype())?;
        let off_diag = diag.affine(-1.0, 1.0)?;

        let on = (flat.mul(&diag)?.exp()? * &diag)?;
        let off = (flat * off_diag)?;
        (on + off)?.reshape((dd, dd))
    }

    /// `log |Σ|` as a scalar tensor
    fn log_det_t(&self, params: &Tensor) -> candle_core::Result<Tensor> {
        let index: Vec<u32> = (0..self.dim)
            .map(|r| self.log_diag_index(r) as u32)
            .collect();
        let index = Tensor::from_vec(index, self.dim, params.device())?;
        params.index_select(&index, 0)?.sum_all()?.affine(2.0, 0.0)
    }
}

impl ReparamFamily for GaussianFamily {
    fn noise<R: Rng>(&self, n: usize, rng: &mut R) -> Mat {
        Mat::rnorm(n, self.dim, rng)
    }

    /// `x = μ + L ε`, one row per noise row
    fn sample_t(&self, params: &Tensor, eps: &Tensor) -> candle_core::Result<Tensor> {
        let mu = params.narrow(0, 0, self.dim)?;
        let ll = self.chol_factor_t(params)?;
        eps.matmul(&ll.t()?.contiguous()?)?
            .broadcast_add(&mu.unsqueeze(0)?)
    }

    /// `L^{-1} (x - μ) = ε` at `x = μ + L ε`, so only `log |Σ|`
    /// depends on `θ`
    fn logpdf_at_sample_t(&self, params: &Tensor, eps: &Tensor) -> candle_core::Result<Tensor> {
        let dd = self.dim as f64;
        let half_log_det = self.log_det_t(params)?.affine(0.5, 0.0)?;
        eps.sqr()?
            .sum(1)?
            .affine(-0.5, -0.5 * dd * LN_2PI)?
            .broadcast_sub(&half_log_det)
    }

    /// The Bhattacharyya coefficient against each fixed component,
    /// with `Σ̄_k = (Σ + Σ_k) / 2` factorized entry by entry over the
    /// batch of `K` pairs
    fn log_sqrt_pair_integral_t(
        &self,
        params: &Tensor,
        others: &[DVec],
    ) -> candle_core::Result<Tensor> {
        let dd = self.dim;
        let kk = others.len();
        let dev = params.device();

        if kk == 0 {
            return Tensor::zeros(0, params.dtype(), dev);
        }

        let mut sig_b = Vec::with_capacity(kk * dd * dd);
        let mut mu_b: Vec<f64> = Vec::with_capacity(kk * dd);
        let mut log_det_b = Vec::with_capacity(kk);
        for other in others {
            let cov = self.covariance(other);
            for r in 0..dd {
                for c in 0..dd {
                    sig_b.push(cov[(r, c)]);
                }
            }
            mu_b.extend(self.mean(other).iter());
            log_det_b.push(self.log_det(other));
        }
        let sig_b = Tensor::from_vec(sig_b, (kk, dd, dd), dev)?;
        let mu_b = Tensor::from_vec(mu_b, (kk, dd), dev)?;
        let log_det_b = Tensor::from_vec(log_det_b, kk, dev)?;

        let ll = self.chol_factor_t(params)?;
        let sig_a = ll.matmul(&ll.t()?.contiguous()?)?;
        let mu_a = params.narrow(0, 0, dd)?;

        let sig_bar = sig_b.broadcast_add(&sig_a.unsqueeze(0)?)?.affine(0.5, 0.0)?;
        let delta = mu_b.broadcast_sub(&mu_a.unsqueeze(0)?)?;

        // Cholesky of every Σ̄_k, one `[K]` tensor per entry
        let mut lbar: Vec<Vec<Tensor>> = Vec::with_capacity(dd);
        for r in 0..dd {
            let mut row: Vec<Tensor> = Vec::with_capacity(r + 1);
            for c in 0..=r {
                let mut acc = sig_bar.i((.., r, c))?;
                for k in 0..c {
                    let l_ck = if c == r { &row[k] } else { &lbar[c][k] };
                    acc = (acc - (&row[k] * l_ck)?)?;
                }
                let entry = if r == c {
                    acc.sqrt()?
                } else {
                    (acc / &lbar[c][c])?
                };
                row.push(entry);
            }
            lbar.push(row);
        }

        // z = Lbar^{-1} δ, accumulating |z|² and Σ log Lbar_rr
        let mut zz: Vec<Tensor> = Vec::with_capacity(dd);
        let mut quad = Tensor::zeros(kk, params.dtype(), dev)?;
        let mut half_log_det_bar = Tensor::zeros(kk, params.dtype(), dev)?;
        for r in 0..dd {
            let mut acc = delta.i((.., r))?;
            for k in 0..r {
                acc = (acc - (&lbar[r][k] * &zz[k])?)?;
            }
            let z_r = (acc / &lbar[r][r])?;
            quad = (quad + z_r.sqr()?)?;
            half_log_det_bar = (half_log_det_bar + lbar[r][r].log()?)?;
            zz.push(z_r);
        }

        let log_det_a = self.log_det_t(params)?;
        let quarter_log_dets = log_det_b.broadcast_add(&log_det_a)?.affine(0.25, 0.0)?;

        (quad.affine(-0.125, 0.0)? - half_log_det_bar)? + quarter_log_dets
    }
}
