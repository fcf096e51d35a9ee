//! Non-negative least squares.
//!
//! ```text
//! minimize || A x - b ||  subject to  x >= 0
//! ```
//!
//! Lawson & Hanson (1974), *Solving Least Squares Problems*, ch. 23.

use nalgebra::{DMatrix, DVector};

/// Solve `min ||A x - b||` over `x >= 0` by the Lawson-Hanson active
/// set method.
///
/// * `amat` - `m x n` design matrix
/// * `bvec` - length `m` response
///
/// Returns the solution `x` (length `n`). Fails if the dimensions
/// disagree or the active set does not settle within `3 n` outer
/// iterations.
pub fn nnls(amat: &DMatrix<f64>, bvec: &DVector<f64>) -> anyhow::Result<DVector<f64>> {
    let (mm, nn) = amat.shape();
    if bvec.len() != mm {
        anyhow::bail!("nnls: A has {} rows but b has {} elements", mm, bvec.len());
    }

    let max_iter = 3 * nn.max(1);
    let tol = 10.0 * f64::EPSILON * amat.abs().column_sum().max() * (mm.max(nn) as f64);

    let mut xx = DVector::<f64>::zeros(nn);
    let mut passive = vec![false; nn];

    let gradient = |xx: &DVector<f64>| amat.tr_mul(&(bvec - amat * xx));
    let mut ww = gradient(&xx);

    let mut iter = 0;
    loop {
        // most promising coordinate still clamped at zero
        let candidate = (0..nn)
            .filter(|&j| !passive[j])
            .max_by(|&a, &b| ww[a].total_cmp(&ww[b]));

        let jj = match candidate {
            Some(j) if ww[j] > tol => j,
            _ => break,
        };

        iter += 1;
        if iter > max_iter {
            anyhow::bail!("nnls: exceeded {} iterations", max_iter);
        }

        passive[jj] = true;

        loop {
            let ss = passive_least_squares(amat, bvec, &passive)?;

            if (0..nn).filter(|&j| passive[j]).all(|j| ss[j] > tol) {
                xx = ss;
                break;
            }

            // step back towards the previous feasible point until the
            // first passive coordinate hits zero
            let alpha = (0..nn)
                .filter(|&j| passive[j] && ss[j] <= tol)
                .map(|j| xx[j] / (xx[j] - ss[j]))
                .fold(f64::INFINITY, f64::min);
            let alpha = if alpha.is_finite() { alpha } else { 0.0 };

            xx += (&ss - &xx) * alpha;

            for j in 0..nn {
                if passive[j] && xx[j] <= tol {
                    passive[j] = false;
                    xx[j] = 0.0;
                }
            }
        }

        ww = gradient(&xx);
    }

    Ok(xx)
}

/// Unconstrained least squares restricted to the passive columns;
/// the other coordinates are zero.
fn passive_least_squares(
    amat: &DMatrix<f64>,
    bvec: &DVector<f64>,
    passive: &[bool],
) -> anyhow::Result<DVector<f64>> {
    let cols: Vec<usize> = (0..passive.len()).filter(|&j| passive[j]).collect();
    let sub = amat.select_columns(cols.iter());
    let sol = sub
        .svd(true, true)
        .solve(bvec, f64::EPSILON)
        .map_err(|e| anyhow::anyhow!("nnls: {}", e))?;

    let mut ret = DVector::<f64>::zeros(passive.len());
    for (k, &j) in cols.iter().enumerate() {
        ret[j] = sol[k];
    }
    Ok(ret)
}
