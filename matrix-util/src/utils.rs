use rand::Rng;
use rand_distr::{Binomial, Distribution};

/// Largest argument `log1mexp` accepts; anything above is clamped
/// down to this value so that `log(1 - exp(a))` stays finite.
pub const LOG1MEXP_MAX_ARG: f64 = -1e-12;

/// `log(1 - exp(a))` for `a <= 0`
///
/// Uses `log(-expm1(a))` near zero and `log1p(-exp(a))` further away
/// (Mächler, 2012). Arguments in `(LOG1MEXP_MAX_ARG, inf]` come from
/// round-off in log-domain comparisons and are clamped to
/// `LOG1MEXP_MAX_ARG`.
pub fn log1mexp(a: f64) -> f64 {
    if a.is_nan() {
        return a;
    }
    let a = a.min(LOG1MEXP_MAX_ARG);
    if a > -std::f64::consts::LN_2 {
        (-a.exp_m1()).ln()
    } else {
        (-a.exp()).ln_1p()
    }
}

/// Draw multinomial counts of `ntot` trials over categories with
/// (unnormalized) probabilities `probs`
///
/// Sequential conditional binomials: category `k` receives
/// `Binomial(remaining, p_k / remaining_mass)` and the last category
/// with positive probability takes whatever is left, so the counts
/// always sum to `ntot` exactly.
///
/// * `ntot` - number of trials
/// * `probs` - non-negative weights, at least one positive
/// * `rng` - random number generator
pub fn multinomial<R: Rng>(ntot: usize, probs: &[f64], rng: &mut R) -> anyhow::Result<Vec<usize>> {
    if probs.iter().any(|p| !p.is_finite() || *p < 0.0) {
        anyhow::bail!("multinomial probabilities must be finite and non-negative");
    }

    let last_positive = probs
        .iter()
        .rposition(|&p| p > 0.0)
        .ok_or(anyhow::anyhow!("multinomial probabilities sum to zero"))?;

    let mut counts = vec![0_usize; probs.len()];
    let mut remaining = ntot;
    let mut mass: f64 = probs.iter().sum();

    for (k, &p) in probs.iter().enumerate().take(last_positive + 1) {
        if remaining == 0 {
            break;
        }
        if k == last_positive {
            counts[k] = remaining;
            break;
        }
        let q = (p / mass).clamp(0.0, 1.0);
        let c = if q <= 0.0 {
            0
        } else if q >= 1.0 {
            remaining
        } else {
            Binomial::new(remaining as u64, q)?.sample(rng) as usize
        };
        counts[k] = c;
        remaining -= c;
        mass -= p;
    }

    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    #[test]
    fn log1mexp_matches_naive_and_clamps() {
        for &a in &[-1e-6, -0.1, -0.5, -1.0, -5.0, -40.0] {
            let naive = (1.0 - f64::exp(a)).ln();
            assert_abs_diff_eq!(log1mexp(a), naive, epsilon = 1e-8);
        }
        assert_eq!(log1mexp(f64::NEG_INFINITY), 0.0);

        // round-off pushes the argument to zero or slightly above
        let at_zero = log1mexp(0.0);
        assert!(at_zero.is_finite());
        assert_eq!(at_zero, log1mexp(1e-9));
        assert_abs_diff_eq!(at_zero, LOG1MEXP_MAX_ARG.abs().ln(), epsilon = 1e-6);
    }

    #[test]
    fn multinomial_counts_sum_to_total() {
        let mut rng = SmallRng::seed_from_u64(11);
        let probs = [0.1, 0.0, 0.35, 0.05, 0.5];
        for &ntot in &[0_usize, 1, 7, 50, 1000] {
            let counts = multinomial(ntot, &probs, &mut rng).unwrap();
            assert_eq!(counts.len(), probs.len());
            assert_eq!(counts.iter().sum::<usize>(), ntot);
            assert_eq!(counts[1], 0);
        }
    }

    #[test]
    fn multinomial_trailing_zeros_and_unnormalized() {
        let mut rng = SmallRng::seed_from_u64(3);
        let probs = [2.0, 6.0, 0.0, 0.0];
        let counts = multinomial(10_000, &probs, &mut rng).unwrap();
        assert_eq!(counts.iter().sum::<usize>(), 10_000);
        assert_eq!(counts[2] + counts[3], 0);
        // expected 2500 in the first category
        assert!((counts[0] as f64 - 2500.0).abs() < 250.0);
    }

    #[test]
    fn multinomial_rejects_bad_probs() {
        let mut rng = SmallRng::seed_from_u64(0);
        assert!(multinomial(5, &[0.0, 0.0], &mut rng).is_err());
        assert!(multinomial(5, &[0.5, -0.1], &mut rng).is_err());
        assert!(multinomial(5, &[f64::NAN, 1.0], &mut rng).is_err());
    }
}
