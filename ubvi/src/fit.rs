use ubvi::boosting::BoostingVi;
use ubvi::common::*;
use ubvi::engine::UbviOptions;
use ubvi::gaussian::GaussianFamily;
use ubvi::optim::AdamOptions;
use ubvi::targets;

use anyhow::Result;
use clap::{Args, ValueEnum};

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum TargetKind {
    /// banana-shaped density around the parabola y = 10 - 0.1 x²
    Banana,
    /// equal mixture of two normals at (±3, 0)
    Bimodal,
}

#[derive(Args, Debug, Clone)]
pub struct FitArgs {
    #[arg(short, long, value_enum, default_value = "banana", help = "Target density")]
    target: TargetKind,

    #[arg(short, long, help = "Output JSON file for the fitted mixture")]
    out: String,

    #[arg(short = 'k', long, default_value = "10", help = "Number of mixture components")]
    num_components: usize,

    #[arg(
        long,
        default_value = "100",
        help = "Monte Carlo samples per objective and Hellinger estimate"
    )]
    num_samples: usize,

    #[arg(
        long,
        default_value = "10000",
        help = "Monte Carlo samples per component-target overlap estimate"
    )]
    num_logfg_samples: usize,

    #[arg(long, default_value = "1000", help = "Initialization candidates per round")]
    num_init: usize,

    #[arg(long, default_value = "3000", help = "Adam iterations per round")]
    num_iters: usize,

    #[arg(
        long,
        default_value = "0.1",
        help = "Adam learning rate, decayed as lr / sqrt(1 + t)"
    )]
    learning_rate: f64,

    #[arg(long, default_value = "3.0", help = "Scale of the first component's initialization")]
    init_scale: f64,

    #[arg(long, default_value = "42", help = "Random seed")]
    seed: u64,

    #[arg(long, default_value_t = false, help = "Show progress bar")]
    show_progress: bool,
}

pub fn fit(args: &FitArgs) -> Result<()> {
    if args.num_components == 0 {
        anyhow::bail!("need at least one component");
    }

    let ubvi_options = UbviOptions {
        num_components: args.num_components,
        num_samples: args.num_samples,
        num_logfg_samples: args.num_logfg_samples,
        num_init: args.num_init,
        ..UbviOptions::default()
    };

    let adam_options = AdamOptions {
        num_iters: args.num_iters,
        learning_rate: args.learning_rate,
        show_progress: args.show_progress,
        ..AdamOptions::default()
    };

    let family = GaussianFamily::new(2).with_init_scale(args.init_scale);

    info!(
        "fitting {} components to the {:?} target",
        args.num_components, args.target
    );

    let target: fn(&Tensor) -> candle_core::Result<Tensor> = match args.target {
        TargetKind::Banana => targets::banana,
        TargetKind::Bimodal => targets::bimodal,
    };

    let mut vi = BoostingVi::new(target, family, ubvi_options, adam_options, args.seed);
    let mixture = vi.run()?;

    for rep in mixture.reports.iter() {
        info!(
            "[{}] Hellinger-squared {:.6} ({:.1}s)",
            rep.round, rep.hellsq, rep.elapsed_secs
        );
    }

    mixture.to_json_file(&args.out)?;
    info!("wrote {}", args.out);
    Ok(())
}
