use crate::common::*;
use rayon::prelude::*;

/// Unnormalized target density `f`
///
/// Written as tensor ops so that the round objective can be
/// differentiated through `log f` at reparameterised samples.
pub trait Target: Sync {
    /// `log f(x)` up to an additive constant: a `[n]` tensor with one
    /// value per row of the `[n, d]` batch `x`
    fn logf(&self, x: &Tensor) -> candle_core::Result<Tensor>;
}

impl<F> Target for F
where
    F: Fn(&Tensor) -> candle_core::Result<Tensor> + Sync,
{
    fn logf(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        self(x)
    }
}

/// A parametric family of component densities `g(x; θ)`.
///
/// Component parameters are flat vectors of length
/// [`ComponentFamily::num_params`]; every real vector of that length
/// must be a valid parameter, so that an unconstrained optimizer can
/// search over them. Point batches are `n x d` matrices, one point
/// per row.
pub trait ComponentFamily: Sync {
    /// dimensionality `d` of the sample space
    fn dim(&self) -> usize;

    /// length of a parameter vector
    fn num_params(&self) -> usize;

    /// `log g(x; θ)` for each row of `x`
    fn logpdf(&self, params: &DVec, x: &Mat) -> DVec;

    /// `log g(x; θ_k)` for many components at once: an `n x K`
    /// matrix with one column per parameter vector
    fn logpdf_batch(&self, params: &[DVec], x: &Mat) -> Mat {
        if params.is_empty() {
            return Mat::zeros(x.nrows(), 0);
        }
        let columns = params
            .par_iter()
            .map(|p| self.logpdf(p, x))
            .collect::<Vec<_>>();
        Mat::from_columns(&columns)
    }

    /// Draw `n` points from `g(·; θ)`
    fn sample<R: Rng>(&self, params: &DVec, n: usize, rng: &mut R) -> Mat;

    /// Draw `n` points from the normalized product density
    /// `sqrt(g(x; θa) g(x; θb)) / ∫ sqrt(g(x; θa) g(x; θb)) dx`
    fn cross_sample<R: Rng>(
        &self,
        params_a: &DVec,
        params_b: &DVec,
        n: usize,
        rng: &mut R,
    ) -> anyhow::Result<Mat>;

    /// `log ∫ sqrt(g(x; θa) g(x; θb)) dx` in closed form; zero when
    /// `θa == θb`
    fn log_sqrt_pair_integral(&self, params_a: &DVec, params_b: &DVec) -> f64;

    /// [`ComponentFamily::log_sqrt_pair_integral`] of one component
    /// against each of `others`
    fn log_sqrt_pair_integral_batch(&self, params: &DVec, others: &[DVec]) -> DVec {
        DVec::from_iterator(
            others.len(),
            others
                .iter()
                .map(|other| self.log_sqrt_pair_integral(params, other)),
        )
    }

    /// Draw a candidate starting point for the next component
    ///
    /// * `params` - parameters already in the mixture
    /// * `weights` - their mixture weights
    /// * `inflation` - how far to spread candidates around the
    ///   existing components
    fn params_init<R: Rng>(
        &self,
        params: &[DVec],
        weights: &[f64],
        inflation: f64,
        rng: &mut R,
    ) -> DVec;
}

/// A family whose draws can be written as a differentiable map
/// `x = T(θ, ε)` of parameter-free noise `ε`, so that gradients of a
/// Monte Carlo objective reach `θ` through the samples.
///
/// The tensor methods take `θ` as a `[num_params]` tensor (usually a
/// [`Var`]) and must agree with the `f64` methods of
/// [`ComponentFamily`] at the same parameters.
pub trait ReparamFamily: ComponentFamily {
    /// `[n, d]` noise consumed by [`ReparamFamily::sample_t`]; draws
    /// the same random numbers as [`ComponentFamily::sample`]
    fn noise<R: Rng>(&self, n: usize, rng: &mut R) -> Mat;

    /// `[n, d]` samples `T(θ, ε)`
    fn sample_t(&self, params: &Tensor, eps: &Tensor) -> candle_core::Result<Tensor>;

    /// `[n]` log densities `log g(T(θ, ε); θ)` at the reparameterised
    /// samples
    fn logpdf_at_sample_t(&self, params: &Tensor, eps: &Tensor) -> candle_core::Result<Tensor>;

    /// `[K]` tensor of `log ∫ sqrt(g(x; θ) g(x; θ_k)) dx` against fixed
    /// components `others`
    fn log_sqrt_pair_integral_t(
        &self,
        params: &Tensor,
        others: &[DVec],
    ) -> candle_core::Result<Tensor>;
}
