//! `verify-fusion` binary — deterministic forward-pass smoke check.
//!
//! Builds a fixed-seed fusion module over a three-level synthetic pyramid
//! pair, runs one supervised training forward and one inference forward, and
//! verifies the output contract:
//!
//!  1. The refined pyramid has one tensor per level with the configured
//!     channel counts and the input spatial sizes.
//!  2. The auxiliary loss is a finite, non-negative scalar.
//!  3. The inference path produces the same shapes without a loss.
//!
//! # Exit codes
//!
//! | Code | Meaning |
//! |------|---------|
//! | 0    | PASS — all contract checks hold |
//! | 1    | FAIL — a forward call errored or a check failed |
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin verify-fusion
//! cargo run --bin verify-fusion -- --batch 4 --base-size 128
//! ```

use clap::Parser;
use tch::{nn, Device, Kind, Tensor};
use tracing::info;

use rgbt_fusion::config::FusionConfig;
use rgbt_fusion::masks::InstanceMasks;
use rgbt_fusion::taf::TargetAwareFusion;

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// Arguments for the `verify-fusion` smoke-check binary.
#[derive(Parser, Debug)]
#[command(
    name = "verify-fusion",
    version,
    about = "Target-aware fusion forward-pass smoke check",
    long_about = None,
)]
struct Args {
    /// Batch size of the synthetic pyramids.
    #[arg(long, default_value_t = 2)]
    batch: i64,

    /// Spatial size of the finest pyramid level (halved per level).
    #[arg(long, default_value_t = 64)]
    base_size: i64,

    /// Random seed for parameter initialisation.
    #[arg(long, default_value_t = 0)]
    seed: i64,

    /// Log level: trace, debug, info, warn, error.
    #[arg(long, default_value = "info")]
    log_level: String,
}

// ---------------------------------------------------------------------------
// main
// ---------------------------------------------------------------------------

fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(
            args.log_level
                .parse::<tracing_subscriber::filter::LevelFilter>()
                .unwrap_or(tracing_subscriber::filter::LevelFilter::INFO),
        )
        .with_target(false)
        .with_thread_ids(false)
        .init();

    println!("{}", "=".repeat(72));
    println!("  Target-Aware Fusion: Forward-Pass Smoke Check");
    println!("{}", "=".repeat(72));
    println!();

    let channels = vec![64_usize, 128, 256];
    let sizes: Vec<i64> = (0..channels.len() as u32)
        .map(|i| args.base_size >> i)
        .collect();

    // ------------------------------------------------------------------
    // Step 1: build the module.
    // ------------------------------------------------------------------

    println!("[1/4] CONFIGURATION");
    let cfg = FusionConfig::with_channels(channels.clone());
    println!("  Levels:        {}", cfg.num_levels());
    println!("  Channels:      {channels:?}");
    println!("  Spatial sizes: {sizes:?}");
    println!("  Expand ratio:  {}", cfg.expand_ratio);
    println!("  Batch:         {}", args.batch);
    println!("  Seed:          {}", args.seed);
    println!();

    tch::manual_seed(args.seed);
    let vs = nn::VarStore::new(Device::Cpu);
    let taf = match TargetAwareFusion::new(&vs.root(), &cfg) {
        Ok(taf) => taf,
        Err(e) => {
            eprintln!("  ERROR: failed to build module: {e}");
            std::process::exit(1);
        }
    };
    info!("module built, version {}", rgbt_fusion::VERSION);

    // ------------------------------------------------------------------
    // Step 2: supervised training forward.
    // ------------------------------------------------------------------

    println!("[2/4] TRAINING FORWARD");
    let visible = synthetic_pyramid(&channels, &sizes, args.batch, 0.0);
    let thermal = synthetic_pyramid(&channels, &sizes, args.batch, 0.5);

    let image_size = (args.base_size * 4) as usize;
    let gt: Vec<InstanceMasks> = (0..args.batch)
        .map(|_| InstanceMasks::full_image(image_size, image_size))
        .collect();

    let out = match taf.forward_train(&visible, &thermal, &gt) {
        Ok(out) => out,
        Err(e) => {
            eprintln!("  ERROR: training forward failed: {e}");
            std::process::exit(1);
        }
    };
    let loss_val: f64 = out.loss.double_value(&[]);
    let refined = out.refined;
    println!("  Auxiliary loss: {loss_val:.6}");
    for (i, per_level) in out.level_losses.iter().enumerate() {
        println!("  level {i} loss:  {per_level:.6}");
    }
    for (i, t) in refined.iter().enumerate() {
        println!("  refined[{i}]: {:?}", t.size());
    }
    println!();

    // ------------------------------------------------------------------
    // Step 3: inference forward.
    // ------------------------------------------------------------------

    println!("[3/4] INFERENCE FORWARD");
    let inferred = match taf.forward_inference(&visible, &thermal) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("  ERROR: inference forward failed: {e}");
            std::process::exit(1);
        }
    };
    for (i, t) in inferred.iter().enumerate() {
        println!("  refined[{i}]: {:?}", t.size());
    }
    println!();

    // ------------------------------------------------------------------
    // Step 4: verdict.
    // ------------------------------------------------------------------

    println!("[4/4] VERDICT");
    println!("{}", "=".repeat(72));

    let mut failures = Vec::new();
    if !(loss_val.is_finite() && loss_val >= 0.0) {
        failures.push(format!("auxiliary loss {loss_val} is not a finite non-negative scalar"));
    }
    for (pyramid, label) in [(&refined, "train"), (&inferred, "inference")] {
        for (i, (t, (&c, &s))) in pyramid.iter().zip(channels.iter().zip(&sizes)).enumerate() {
            let expected = vec![args.batch, c as i64, s, s];
            if t.size() != expected {
                failures.push(format!(
                    "{label} refined[{i}] has shape {:?}, expected {expected:?}",
                    t.size()
                ));
            }
        }
    }

    if failures.is_empty() {
        println!("  PASS — loss {loss_val:.6}, {} levels, all shapes match", channels.len());
        println!("{}", "=".repeat(72));
        std::process::exit(0);
    } else {
        println!("  FAIL");
        for f in &failures {
            println!("    - {f}");
        }
        println!("{}", "=".repeat(72));
        std::process::exit(1);
    }
}

// ---------------------------------------------------------------------------
// Synthetic inputs
// ---------------------------------------------------------------------------

/// Deterministic pyramid: a phase-shifted linear ramp per level, no RNG.
fn synthetic_pyramid(channels: &[usize], sizes: &[i64], batch: i64, phase: f64) -> Vec<Tensor> {
    channels
        .iter()
        .zip(sizes)
        .map(|(&c, &s)| {
            let numel = batch * c as i64 * s * s;
            ((Tensor::arange(numel, (Kind::Float, Device::Cpu)) / (numel as f64)) + phase)
                .reshape([batch, c as i64, s, s])
        })
        .collect()
}
