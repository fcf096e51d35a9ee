//! Example target densities on `R²`, written as tensor ops on an
//! `[n, 2]` batch

use crate::common::*;

use candle_core::Result;
use std::f64::consts::PI;

/// Banana-shaped log-density
///
/// `-x²/200 - (y + b x² - 100 b)²/2 - log(2π · 10)` with `b = 0.1`:
/// a normal with variance 100 along `x` and unit variance around the
/// parabola `y = 10 - 0.1 x²`. Normalized.
pub fn banana(xx: &Tensor) -> Result<Tensor> {
    const B: f64 = 0.1;
    let log_norm = (2.0 * PI * 10.0).ln();
    let x2 = xx.i((.., 0))?.sqr()?;
    let y = xx.i((.., 1))?;
    let ridge = (y + x2.affine(B, -100.0 * B)?)?.sqr()?;
    x2.affine(-1.0 / 200.0, -log_norm)? - ridge.affine(0.5, 0.0)?
}

/// Equal mixture of two unit-covariance normals centred at `(±3, 0)`
pub fn bimodal(xx: &Tensor) -> Result<Tensor> {
    const SHIFT: f64 = 3.0;
    let log_norm = (2.0 * PI).ln() + 2_f64.ln();
    let x = xx.i((.., 0))?;
    let y2 = xx.i((.., 1))?.sqr()?;
    let left = (x.affine(1.0, SHIFT)?.sqr()? + &y2)?.affine(-0.5, 0.0)?;
    let right = (x.affine(1.0, -SHIFT)?.sqr()? + &y2)?.affine(-0.5, 0.0)?;
    Tensor::stack(&[&left, &right], 1)?
        .log_sum_exp(1)?
        .affine(1.0, -log_norm)
}
