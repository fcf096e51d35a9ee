use crate::traits::*;

use candle_core::{DType, Device, Tensor};
use log::warn;
pub use nalgebra::{Cholesky, DMatrix, DVector, Dyn};
pub use rand::Rng;
pub use rand_distr::StandardNormal;

/// Diagonal jitter tried in order when a Gram matrix fails to
/// factorize. The first entry is no jitter at all.
pub const CHOLESKY_JITTER: [f64; 5] = [0.0, 1e-12, 1e-10, 1e-8, 1e-6];

impl SampleOps for DMatrix<f64> {
    type Mat = DMatrix<f64>;
    type Scalar = f64;

    fn runif<R: Rng>(nrows: usize, ncols: usize, rng: &mut R) -> Self::Mat {
        DMatrix::<f64>::from_fn(nrows, ncols, |_, _| rng.random::<f64>())
    }

    fn rnorm<R: Rng>(nrows: usize, ncols: usize, rng: &mut R) -> Self::Mat {
        DMatrix::<f64>::from_fn(nrows, ncols, |_, _| rng.sample(StandardNormal))
    }
}

impl LogSumExpOps for [f64] {
    type Scalar = f64;

    fn log_sum_exp(&self) -> f64 {
        let max = self.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        if max == f64::NEG_INFINITY || max == f64::INFINITY {
            // empty, all -inf, or overflowing
            return max;
        }
        max + self.iter().map(|&x| (x - max).exp()).sum::<f64>().ln()
    }

    fn log_mean_exp(&self) -> f64 {
        if self.is_empty() {
            return f64::NEG_INFINITY;
        }
        self.log_sum_exp() - (self.len() as f64).ln()
    }
}

impl LogSumExpOps for DVector<f64> {
    type Scalar = f64;

    fn log_sum_exp(&self) -> f64 {
        self.as_slice().log_sum_exp()
    }

    fn log_mean_exp(&self) -> f64 {
        self.as_slice().log_mean_exp()
    }
}

impl RowOps for DMatrix<f64> {
    type Mat = DMatrix<f64>;

    fn concatenate_rows(blocks: &[DMatrix<f64>]) -> anyhow::Result<DMatrix<f64>> {
        let ncols = match blocks.iter().find(|b| b.nrows() > 0) {
            Some(b) => b.ncols(),
            None => return Ok(DMatrix::zeros(0, blocks.first().map_or(0, |b| b.ncols()))),
        };

        if blocks.iter().any(|b| b.nrows() > 0 && b.ncols() != ncols) {
            anyhow::bail!("all the blocks must have {} columns", ncols);
        }

        let nrows = blocks.iter().map(|b| b.nrows()).sum::<usize>();
        let mut ret = DMatrix::<f64>::zeros(nrows, ncols);
        let mut lb = 0;
        for b in blocks.iter().filter(|b| b.nrows() > 0) {
            ret.rows_mut(lb, b.nrows()).copy_from(b);
            lb += b.nrows();
        }
        Ok(ret)
    }
}

impl ConvertMatOps for DMatrix<f64> {
    type Mat = DMatrix<f64>;
    type Scalar = f64;

    fn from_tensor(tensor: &Tensor) -> anyhow::Result<Self::Mat> {
        let (nrows, ncols) = tensor.dims2()?;
        let data = tensor.to_dtype(DType::F64)?.flatten_all()?.to_vec1::<f64>()?;
        Ok(DMatrix::<f64>::from_row_slice(nrows, ncols, &data))
    }

    fn to_tensor(&self, dev: &Device) -> anyhow::Result<Tensor> {
        // nalgebra stores columns contiguously
        Ok(Tensor::from_slice(self.as_slice(), (self.ncols(), self.nrows()), dev)?
            .t()?
            .contiguous()?)
    }
}

impl ConvertMatOps for DVector<f64> {
    type Mat = DVector<f64>;
    type Scalar = f64;

    fn from_tensor(tensor: &Tensor) -> anyhow::Result<Self::Mat> {
        let data = tensor.to_dtype(DType::F64)?.flatten_all()?.to_vec1::<f64>()?;
        Ok(DVector::<f64>::from_vec(data))
    }

    fn to_tensor(&self, dev: &Device) -> anyhow::Result<Tensor> {
        Ok(Tensor::from_slice(self.as_slice(), self.len(), dev)?)
    }
}

/// Cholesky factorization of a symmetric positive semi-definite
/// matrix, retrying with the diagonal jitter in [`CHOLESKY_JITTER`]
/// when the plain factorization fails.
///
/// Returns the factorization and the jitter that was needed.
pub fn cholesky_with_jitter(mat: &DMatrix<f64>) -> anyhow::Result<(Cholesky<f64, Dyn>, f64)> {
    if !mat.is_square() {
        anyhow::bail!("cholesky needs a square matrix, got {:?}", mat.shape());
    }
    let nn = mat.nrows();
    for &eps in CHOLESKY_JITTER.iter() {
        let jittered = mat + DMatrix::<f64>::identity(nn, nn) * eps;
        if let Some(chol) = jittered.cholesky() {
            if eps > 0.0 {
                warn!("cholesky succeeded after adding {:e} to the diagonal", eps);
            }
            return Ok((chol, eps));
        }
    }
    anyhow::bail!(
        "{} x {} matrix is not positive definite even with jitter {:e}",
        nn,
        nn,
        CHOLESKY_JITTER[CHOLESKY_JITTER.len() - 1]
    )
}

/// Inverse of a lower-triangular matrix `L`
pub fn lower_triangular_inverse(lower: &DMatrix<f64>) -> anyhow::Result<DMatrix<f64>> {
    let nn = lower.nrows();
    lower
        .solve_lower_triangular(&DMatrix::<f64>::identity(nn, nn))
        .ok_or(anyhow::anyhow!("singular lower-triangular matrix"))
}

/// `log |A|` from a Cholesky factor `L` of `A = L L'`
pub fn cholesky_log_det(chol: &Cholesky<f64, Dyn>) -> f64 {
    2.0 * chol.l_dirty().diagonal().iter().map(|x| x.ln()).sum::<f64>()
}
