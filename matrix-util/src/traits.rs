use candle_core::{Device, Tensor};
use rand::Rng;

/// Operations to sample random matrices with a caller-owned random
/// number generator, so that every draw is reproducible from a seed
pub trait SampleOps {
    type Mat;
    type Scalar;

    /// Sample a matrix from a uniform distribution `U(0,1)`
    fn runif<R: Rng>(nrows: usize, ncols: usize, rng: &mut R) -> Self::Mat;

    /// Sample a matrix from a normal distribution `N(0,1)`
    fn rnorm<R: Rng>(nrows: usize, ncols: usize, rng: &mut R) -> Self::Mat;
}

/// Reading off from `Tensor`
pub trait ConvertMatOps {
    type Mat;
    type Scalar;

    fn from_tensor(_: &Tensor) -> anyhow::Result<Self::Mat>;
    fn to_tensor(&self, dev: &Device) -> anyhow::Result<Tensor>;
}

/// Numerically stable reductions in the log domain
pub trait LogSumExpOps {
    type Scalar;

    /// `log(sum(exp(x)))` over all the elements
    fn log_sum_exp(&self) -> Self::Scalar;

    /// `log(mean(exp(x)))` over all the elements
    fn log_mean_exp(&self) -> Self::Scalar;
}

/// Operations on the rows of a dense matrix
pub trait RowOps {
    type Mat;

    /// Stack a list of matrices with the same number of columns on
    /// top of each other
    fn concatenate_rows(blocks: &[Self::Mat]) -> anyhow::Result<Self::Mat>;
}
