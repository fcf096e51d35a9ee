//! End-to-end boosting on the banana target.
//!
//! A short budget (3 components, a few hundred Adam steps) is enough
//! to see the Hellinger distance drop from the first round and the
//! weights stay feasible. The full 10-component run is ignored by
//! default.
//!
//! Run: cargo test -p ubvi --test banana -- --nocapture
//! Full run: cargo test --release -p ubvi --test banana -- --ignored --nocapture

use anyhow::Result;
use approx::assert_relative_eq;
use ubvi::boosting::{BoostingVi, SqrtMixture};
use ubvi::common::*;
use ubvi::engine::{Ubvi, UbviOptions};
use ubvi::gaussian::GaussianFamily;
use ubvi::optim::AdamOptions;
use ubvi::targets::banana;
use ubvi::traits::Target;

type TargetFn = fn(&Tensor) -> candle_core::Result<Tensor>;

fn short_options() -> (UbviOptions, AdamOptions) {
    (
        UbviOptions {
            num_components: 3,
            num_samples: 500,
            num_logfg_samples: 5000,
            num_init: 200,
            ..UbviOptions::default()
        },
        AdamOptions {
            num_iters: 300,
            ..AdamOptions::default()
        },
    )
}

fn new_vi(ubvi_options: UbviOptions, adam_options: AdamOptions, seed: u64) -> BoostingVi<TargetFn, GaussianFamily> {
    let family = GaussianFamily::new(2).with_init_scale(3.0);
    BoostingVi::new(banana as TargetFn, family, ubvi_options, adam_options, seed)
}

/// `1 - ∫ sqrt(f q)` by the midpoint rule over the banana's support
fn grid_hellsq(engine: &Ubvi<TargetFn, GaussianFamily>) -> Result<f64> {
    let (nx, ny) = (400, 800);
    let (xlim, ylim) = ((-50.0, 50.0), (-300.0, 20.0));
    let hx = (xlim.1 - xlim.0) / nx as f64;
    let hy = (ylim.1 - ylim.0) / ny as f64;
    let mut pts = Mat::zeros(nx * ny, 2);
    for i in 0..nx {
        for j in 0..ny {
            pts[(i * ny + j, 0)] = xlim.0 + (i as f64 + 0.5) * hx;
            pts[(i * ny + j, 1)] = ylim.0 + (j as f64 + 0.5) * hy;
        }
    }
    let lf = DVec::from_tensor(&engine.target().logf(&pts.to_tensor(&Device::Cpu)?)?)?;
    let lq = engine.log_density(&pts);
    let affinity = lf.zip_map(&lq, |a, b| (0.5 * (a + b)).exp()).sum() * hx * hy;
    Ok(1.0 - affinity)
}

#[test]
fn banana_hellinger_trend() -> Result<()> {
    let (uo, ao) = short_options();
    let mut vi = new_vi(uo, ao, 2019);

    let mut exact = vec![];
    for _ in 0..3 {
        vi.step()?;
        exact.push(grid_hellsq(vi.engine())?);
    }
    let mixture = vi.mixture();
    assert_eq!(mixture.num_components(), 3);

    let hellsq: Vec<f64> = mixture.reports.iter().map(|r| r.hellsq).collect();
    println!("Hellinger-squared by round, estimated: {:?}", hellsq);
    println!("Hellinger-squared by round, on a grid: {:?}", exact);

    for &h in hellsq.iter().chain(exact.iter()) {
        assert!((0.0..=1.0).contains(&h), "{}", h);
    }

    // re-solved weights never lose affinity, up to the log <f, g_i>
    // estimates
    for w in exact.windows(2) {
        assert!(w[1] <= w[0] + 0.02, "{:?}", exact);
    }
    assert!(exact[2] < exact[0] - 0.02, "{:?}", exact);

    for rep in mixture.reports.iter() {
        assert!(rep.weights.iter().all(|&w| w >= 0.0));
        assert!(rep.weights.iter().any(|&w| w > 0.0));
    }

    // overlap matrix is symmetric with a unit diagonal
    let zz = &mixture.overlap;
    for j in 0..3 {
        assert_eq!(zz[j][j], 1.0);
        for k in 0..3 {
            assert_eq!(zz[j][k], zz[k][j]);
        }
    }
    Ok(())
}

#[test]
fn banana_estimates_drop_across_seeds() -> Result<()> {
    let seeds = [1_u64, 2, 3];
    let mut first = 0.0;
    let mut last = 0.0;
    for &seed in seeds.iter() {
        let (uo, ao) = short_options();
        let mixture = new_vi(uo, ao, seed).run()?;
        let hellsq: Vec<f64> = mixture.reports.iter().map(|r| r.hellsq).collect();
        println!("seed {}: {:?}", seed, hellsq);
        first += hellsq[0] / seeds.len() as f64;
        last += hellsq[2] / seeds.len() as f64;
    }
    assert!(last < first - 0.02, "mean first {} vs mean last {}", first, last);
    Ok(())
}

#[test]
#[ignore]
fn banana_ten_components() -> Result<()> {
    let ubvi_options = UbviOptions {
        num_components: 10,
        num_samples: 100,
        ..UbviOptions::default()
    };
    let mut vi = new_vi(ubvi_options, AdamOptions::default(), 2019);

    let mut exact = vec![];
    for _ in 0..10 {
        vi.step()?;
        exact.push(grid_hellsq(vi.engine())?);
        println!("round {}: {:?}", exact.len() - 1, vi.reports().last().map(|r| r.hellsq));
    }
    println!("Hellinger-squared by round, on a grid: {:?}", exact);

    for w in exact.windows(2) {
        assert!(w[1] <= w[0] + 0.02, "{:?}", exact);
    }
    assert!(exact[9] < exact[0] - 0.1, "{:?}", exact);
    Ok(())
}

#[test]
fn fitted_mixture_survives_json() -> Result<()> {
    let ubvi_options = UbviOptions {
        num_components: 2,
        num_samples: 100,
        num_logfg_samples: 1000,
        num_init: 50,
        ..UbviOptions::default()
    };
    let adam_options = AdamOptions {
        num_iters: 20,
        ..AdamOptions::default()
    };
    let mixture = new_vi(ubvi_options, adam_options, 7).run()?;

    let dir = tempfile::tempdir()?;
    let file = dir.path().join("fit").join("banana.json");
    let file = file.to_str().ok_or(anyhow::anyhow!("path"))?;

    mixture.to_json_file(file)?;
    let loaded = SqrtMixture::from_json_file(file)?;

    assert_eq!(loaded.dim, 2);
    assert_eq!(loaded.num_components(), 2);
    let flat = |m: &SqrtMixture| -> Vec<f64> {
        m.params
            .iter()
            .chain(m.overlap.iter())
            .flatten()
            .chain(m.weights.iter())
            .copied()
            .collect()
    };
    let (a, b) = (flat(&loaded), flat(&mixture));
    assert_eq!(a.len(), b.len());
    for (x, y) in a.iter().zip(b.iter()) {
        assert_relative_eq!(*x, *y, max_relative = 1e-14);
    }
    assert_eq!(loaded.reports.len(), 2);
    Ok(())
}

#[test]
fn fitted_density_matches_mixture_samples() -> Result<()> {
    let ubvi_options = UbviOptions {
        num_components: 2,
        num_samples: 200,
        num_logfg_samples: 2000,
        num_init: 50,
        ..UbviOptions::default()
    };
    let adam_options = AdamOptions {
        num_iters: 30,
        ..AdamOptions::default()
    };
    let mut vi = new_vi(ubvi_options, adam_options, 11);
    vi.run()?;

    let engine = vi.engine();
    let mut rng = SmallRng::seed_from_u64(5);
    let x = engine.sample(1000, &mut rng)?;
    assert_eq!(x.shape(), (1000, 2));

    let lq = engine.log_density(&x);
    assert!(lq.iter().all(|v| v.is_finite()));
    Ok(())
}
