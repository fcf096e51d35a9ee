use crate::utils::LOG1MEXP_MAX_ARG;
use candle_core::{Result, Tensor};

/// Elementwise `log(1 - exp(a))` for `a <= 0`, differentiable
///
/// Arguments above [`LOG1MEXP_MAX_ARG`] are clamped as in
/// [`crate::utils::log1mexp`]. Without an `expm1` kernel the result
/// loses relative precision as `a` approaches zero.
pub fn log1mexp_tensor(a: &Tensor) -> Result<Tensor> {
    a.minimum(LOG1MEXP_MAX_ARG)?.exp()?.affine(-1.0, 1.0)?.log()
}

/// `log(sum(exp(x)))` along `dim`, shifted by the (detached)
/// maximum so that large negative entries do not underflow
///
/// An all `-inf` slice gives `-inf`.
pub fn log_sum_exp_tensor(x: &Tensor, dim: usize) -> Result<Tensor> {
    let max = x.max_keepdim(dim)?.detach().clamp(f64::MIN, f64::MAX)?;
    x.broadcast_sub(&max)?
        .exp()?
        .sum_keepdim(dim)?
        .log()?
        .add(&max)?
        .squeeze(dim)
}

/// `log(mean(exp(x)))` along `dim`
pub fn log_mean_exp_tensor(x: &Tensor, dim: usize) -> Result<Tensor> {
    let nn = x.dim(dim)? as f64;
    log_sum_exp_tensor(x, dim)?.affine(1.0, -nn.ln())
}
