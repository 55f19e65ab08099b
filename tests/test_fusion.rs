//! End-to-end integration tests for [`rgbt_fusion::taf`].
//!
//! Exercises the full fusion forward pass over synthetic pyramids. All
//! tensors are built from deterministic ramps or constants; parameter
//! initialisation is pinned with `tch::manual_seed`.

use rgbt_fusion::config::FusionConfig;
use rgbt_fusion::error::FusionError;
use rgbt_fusion::masks::InstanceMasks;
use rgbt_fusion::taf::TargetAwareFusion;
use tch::{nn, Device, Kind, Tensor};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn build(channels: Vec<usize>) -> (nn::VarStore, TargetAwareFusion) {
    tch::manual_seed(0);
    let vs = nn::VarStore::new(Device::Cpu);
    let cfg = FusionConfig::with_channels(channels);
    let taf = TargetAwareFusion::new(&vs.root(), &cfg).expect("config must be valid");
    (vs, taf)
}

/// Deterministic pyramid: per-level linear ramp offset by `phase`.
fn ramp_pyramid(channels: &[usize], sizes: &[i64], batch: i64, phase: f64) -> Vec<Tensor> {
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

// ---------------------------------------------------------------------------
// End-to-end reference scenario
// ---------------------------------------------------------------------------

/// Three levels, channels [64, 128, 256], batch 2, spatial sizes 64/32/16,
/// one full-image instance mask per image: the training forward must return
/// a finite scalar loss and a refined pyramid with exactly the input
/// geometry.
#[test]
fn reference_scenario_shapes_and_loss() {
    let channels = vec![64, 128, 256];
    let sizes = [64_i64, 32, 16];
    let (_vs, taf) = build(channels.clone());

    let visible = ramp_pyramid(&channels, &sizes, 2, 0.0);
    let thermal = ramp_pyramid(&channels, &sizes, 2, 0.25);
    let gt = vec![
        InstanceMasks::full_image(256, 256),
        InstanceMasks::full_image(256, 256),
    ];

    let out = taf.forward_train(&visible, &thermal, &gt).expect("valid scenario");

    let loss: f64 = out.loss.double_value(&[]);
    assert!(loss.is_finite() && loss >= 0.0, "loss must be in [0, ∞), got {loss}");

    assert_eq!(out.refined.len(), 3);
    assert_eq!(out.refined[0].size(), [2, 64, 64, 64]);
    assert_eq!(out.refined[1].size(), [2, 128, 32, 32]);
    assert_eq!(out.refined[2].size(), [2, 256, 16, 16]);
}

/// The inference path must produce the same pyramid geometry without any
/// supervision input.
#[test]
fn inference_returns_configured_channel_counts() {
    let channels = vec![64, 128, 256];
    let sizes = [64_i64, 32, 16];
    let (_vs, taf) = build(channels.clone());

    let visible = ramp_pyramid(&channels, &sizes, 2, 0.0);
    let thermal = ramp_pyramid(&channels, &sizes, 2, 0.5);

    let refined = taf.forward_inference(&visible, &thermal).expect("valid inputs");
    assert_eq!(refined.len(), channels.len());
    for (level, (tensor, &c)) in refined.iter().zip(&channels).enumerate() {
        assert_eq!(
            tensor.size()[1],
            c as i64,
            "refined[{level}] must have {c} channels"
        );
    }
}

// ---------------------------------------------------------------------------
// Shape contract
// ---------------------------------------------------------------------------

/// Per-level shape disagreement between the modalities must fail with
/// `ShapeMismatch` — never a silent reshape or broadcast.
#[test]
fn modality_shape_mismatch_is_an_error() {
    let channels = vec![64, 128, 256];
    let (_vs, taf) = build(channels.clone());

    let visible = ramp_pyramid(&channels, &[64, 32, 16], 2, 0.0);
    let mut thermal = ramp_pyramid(&channels, &[64, 32, 16], 2, 0.0);
    // Corrupt level 2: same channels, wrong spatial size.
    thermal[2] = Tensor::zeros([2, 256, 8, 8], (Kind::Float, Device::Cpu));

    let err = taf.forward_inference(&visible, &thermal).unwrap_err();
    match err {
        FusionError::ShapeMismatch { level, visible, thermal } => {
            assert_eq!(level, 2);
            assert_eq!(visible, vec![2, 256, 16, 16]);
            assert_eq!(thermal, vec![2, 256, 8, 8]);
        }
        other => panic!("expected ShapeMismatch, got {other:?}"),
    }
}

/// A pyramid shorter than the configured level count must fail with
/// `PyramidLengthMismatch` before any tensor work.
#[test]
fn short_pyramid_is_an_error() {
    let channels = vec![64, 128, 256];
    let (_vs, taf) = build(channels.clone());

    let visible = ramp_pyramid(&channels[..2], &[64, 32], 2, 0.0);
    let thermal = ramp_pyramid(&channels[..2], &[64, 32], 2, 0.0);

    let err = taf.forward_inference(&visible, &thermal).unwrap_err();
    assert!(
        matches!(
            err,
            FusionError::PyramidLengthMismatch { expected: 3, visible: 2, thermal: 2 }
        ),
        "expected PyramidLengthMismatch, got {err:?}"
    );
}

// ---------------------------------------------------------------------------
// Loss aggregation
// ---------------------------------------------------------------------------

/// The returned auxiliary loss must equal the unweighted arithmetic mean of
/// the per-level losses, each individually non-negative.
#[test]
fn auxiliary_loss_is_mean_of_level_losses() {
    let channels = vec![32, 64, 128];
    let sizes = [32_i64, 16, 8];
    let (_vs, taf) = build(channels.clone());

    let visible = ramp_pyramid(&channels, &sizes, 2, 0.1);
    let thermal = ramp_pyramid(&channels, &sizes, 2, -0.1);
    let gt = vec![
        InstanceMasks::full_image(128, 128),
        InstanceMasks::empty(128, 128),
    ];

    let out = taf.forward_train(&visible, &thermal, &gt).expect("valid inputs");
    assert_eq!(out.level_losses.len(), 3);

    for (level, &l) in out.level_losses.iter().enumerate() {
        assert!(l >= 0.0, "level {level} loss must be >= 0, got {l}");
    }

    let mean: f64 =
        out.level_losses.iter().map(|&l| f64::from(l)).sum::<f64>() / out.level_losses.len() as f64;
    let reported: f64 = out.loss.double_value(&[]);
    assert!(
        (mean - reported).abs() < 1e-4,
        "reported loss {reported} must be the mean of level losses {mean}"
    );
}

/// Empty instance collections produce an all-zero union mask; the dice
/// ε-smoothing must keep every level's loss finite (never NaN) on that path.
#[test]
fn empty_masks_produce_finite_loss() {
    let channels = vec![32, 64];
    let sizes = [16_i64, 8];
    let (_vs, taf) = build(channels.clone());

    let visible = ramp_pyramid(&channels, &sizes, 2, 0.0);
    let thermal = ramp_pyramid(&channels, &sizes, 2, 0.0);
    let gt = vec![InstanceMasks::empty(64, 64), InstanceMasks::empty(64, 64)];

    let out = taf.forward_train(&visible, &thermal, &gt).expect("valid inputs");
    let loss: f64 = out.loss.double_value(&[]);
    assert!(!loss.is_nan(), "all-empty supervision must not produce NaN");
    assert!(loss >= 0.0, "loss must stay non-negative, got {loss}");
    for &l in &out.level_losses {
        assert!(f64::from(l).is_finite(), "every level loss must be finite");
    }
}

// ---------------------------------------------------------------------------
// Bottom-up dependency
// ---------------------------------------------------------------------------

/// Perturbing the finest level's input must propagate through the bottom-up
/// chain and change every coarser refined level, even though those levels'
/// own fusion inputs are untouched.
#[test]
fn finest_level_perturbation_propagates_upward() {
    let channels = vec![16, 32, 64];
    let sizes = [16_i64, 8, 4];
    let (_vs, taf) = build(channels.clone());

    let visible = ramp_pyramid(&channels, &sizes, 1, 0.0);
    let thermal = ramp_pyramid(&channels, &sizes, 1, 0.5);

    let baseline = taf.forward_inference(&visible, &thermal).expect("valid inputs");

    // Perturb only visible[0]; levels 1 and 2 keep identical inputs.
    let mut perturbed = ramp_pyramid(&channels, &sizes, 1, 0.0);
    perturbed[0] = &perturbed[0] + 1.0;
    let shifted = taf.forward_inference(&perturbed, &thermal).expect("valid inputs");

    for level in 1..channels.len() {
        let diff: f64 = (&baseline[level] - &shifted[level])
            .abs()
            .max()
            .double_value(&[]);
        assert!(
            diff > 0.0,
            "refined[{level}] must depend on level 0 through the refinement chain"
        );
    }
}

/// Two identical forward passes over the same module and inputs must agree
/// exactly: the forward is a pure function of inputs and parameters.
#[test]
fn forward_is_deterministic() {
    let channels = vec![16, 32];
    let sizes = [8_i64, 4];
    let (_vs, taf) = build(channels.clone());

    let visible = ramp_pyramid(&channels, &sizes, 2, 0.3);
    let thermal = ramp_pyramid(&channels, &sizes, 2, 0.6);

    let first = taf.forward_inference(&visible, &thermal).expect("valid inputs");
    let second = taf.forward_inference(&visible, &thermal).expect("valid inputs");

    for (level, (a, b)) in first.iter().zip(&second).enumerate() {
        let diff: f64 = (a - b).abs().max().double_value(&[]);
        assert_eq!(diff, 0.0, "repeated forward must be bit-identical at level {level}");
    }
}
