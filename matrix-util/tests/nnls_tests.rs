use approx::assert_abs_diff_eq;
use matrix_util::traits::SampleOps;
use rand::rngs::SmallRng;
use rand::SeedableRng;

#[test]
fn random_nnls_kkt_test() {
    use matrix_util::*;
    use nalgebra::{DMatrix, DVector};

    let mut rng = SmallRng::seed_from_u64(17);

    for _ in 0..20 {
        let aa = DMatrix::<f64>::rnorm(30, 6, &mut rng);
        let bb = DMatrix::<f64>::rnorm(30, 1, &mut rng).column(0).into_owned();

        let xx = nnls::nnls(&aa, &bb).unwrap();
        let ww: DVector<f64> = aa.tr_mul(&(&bb - &aa * &xx));

        for j in 0..xx.len() {
            assert!(xx[j] >= 0.0);
            if xx[j] > 0.0 {
                assert_abs_diff_eq!(ww[j], 0.0, epsilon = 1e-8);
            } else {
                assert!(ww[j] < 1e-8);
            }
        }
    }
}

#[test]
fn whitened_nnls_test() {
    use matrix_util::*;
    use nalgebra::{DMatrix, DVector};

    // min || Linv (x + d) || over x >= 0 for a Gram matrix Z = L L'
    let zz = DMatrix::from_row_slice(3, 3, &[1.0, 0.6, 0.2, 0.6, 1.0, 0.4, 0.2, 0.4, 1.0]);
    let (chol, _) = dmatrix_util::cholesky_with_jitter(&zz).unwrap();
    let linv = dmatrix_util::lower_triangular_inverse(&chol.l()).unwrap();

    let dd = DVector::from_vec(vec![1.0, 0.9, 0.3]);
    let xx = nnls::nnls(&linv, &(-(&linv * &dd))).unwrap();
    let lbd = &linv * (&xx + &dd);

    // Z^{-1} (x + d) >= 0 at the optimum
    let weights = linv.tr_mul(&lbd);
    assert!(weights.iter().all(|&w| w > -1e-10));
}
