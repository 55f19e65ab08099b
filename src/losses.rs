//! Auxiliary supervision loss for the fusion module.
//!
//! Each pyramid level's predicted target-probability map is supervised
//! against the resampled ground-truth union mask with a combined
//! region-overlap / pixel-classification loss:
//!
//! ```text
//! dice = 1 − (2·Σ(P·T) + ε) / (Σ(P) + Σ(T) + ε)        ε = 1
//! bce  = mean(−[T·log(P) + (1−T)·log(1−P)])
//! loss = weight · (bce + dice)
//! ```
//!
//! Both tensors are flattened to one dimension before reduction, so the loss
//! is invariant under any pixel permutation applied identically to `P` and
//! `T`. The smoothing constant ε keeps the dice term at zero (rather than
//! NaN) when prediction and target are both entirely empty.

use tch::{Kind, Reduction, Tensor};

/// Dice smoothing constant.
const SMOOTH: f64 = 1.0;

// ---------------------------------------------------------------------------
// DiceBceLoss
// ---------------------------------------------------------------------------

/// Combined dice + binary-cross-entropy loss.
///
/// Stateless apart from the configured weight; computed independently per
/// pyramid level.
#[derive(Debug, Clone, Copy)]
pub struct DiceBceLoss {
    weight: f64,
}

impl Default for DiceBceLoss {
    fn default() -> Self {
        DiceBceLoss { weight: 1.0 }
    }
}

impl DiceBceLoss {
    /// Create a loss with the given multiplier on the combined term.
    pub fn new(weight: f64) -> Self {
        DiceBceLoss { weight }
    }

    /// The configured loss multiplier.
    pub fn weight(&self) -> f64 {
        self.weight
    }

    /// Compute `weight · (bce + dice)` for a probability map `pred` in
    /// [0, 1] and a binary `target` of identical shape.
    ///
    /// Returns a scalar tensor attached to the computation graph.
    pub fn forward(&self, pred: &Tensor, target: &Tensor) -> Tensor {
        let p = pred.reshape([-1]);
        let t = target.reshape([-1]);

        let intersection = (&p * &t).sum(Kind::Float);
        let denom = p.sum(Kind::Float) + t.sum(Kind::Float) + SMOOTH;
        let dice = ((intersection * 2.0 + SMOOTH) / denom).neg() + 1.0;

        let bce = p.binary_cross_entropy::<Tensor>(&t, None, Reduction::Mean);

        (bce + dice) * self.weight
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Device;

    fn cpu() -> Device {
        Device::Cpu
    }

    #[test]
    fn perfect_binary_prediction_gives_zero_loss() {
        let loss_fn = DiceBceLoss::default();
        let dev = cpu();

        // Half foreground, half background, predicted exactly.
        let target = Tensor::cat(
            &[
                Tensor::ones([1, 1, 4, 8], (Kind::Float, dev)),
                Tensor::zeros([1, 1, 4, 8], (Kind::Float, dev)),
            ],
            2,
        );
        let loss = loss_fn.forward(&target, &target);
        let val: f64 = loss.double_value(&[]);

        assert!(
            val.abs() < 1e-5,
            "loss for an exact binary prediction must be ≈ 0, got {val}"
        );
    }

    #[test]
    fn wrong_prediction_gives_positive_loss() {
        let loss_fn = DiceBceLoss::default();
        let dev = cpu();

        let pred = Tensor::full([1, 1, 8, 8], 0.1, (Kind::Float, dev));
        let target = Tensor::ones([1, 1, 8, 8], (Kind::Float, dev));

        let val: f64 = loss_fn.forward(&pred, &target).double_value(&[]);
        assert!(val > 0.0, "loss for a wrong prediction must be > 0, got {val}");
    }

    #[test]
    fn empty_target_and_empty_prediction_is_zero_not_nan() {
        let loss_fn = DiceBceLoss::default();
        let dev = cpu();

        let zeros = Tensor::zeros([2, 1, 16, 16], (Kind::Float, dev));
        let val: f64 = loss_fn.forward(&zeros, &zeros).double_value(&[]);

        assert!(!val.is_nan(), "empty/empty case must not be NaN");
        assert!(
            val.abs() < 1e-6,
            "ε-smoothing must give ≈ 0 for empty pred and target, got {val}"
        );
    }

    #[test]
    fn loss_is_invariant_under_pixel_permutation() {
        let loss_fn = DiceBceLoss::default();
        let dev = cpu();

        let n = 64_i64;
        // Deterministic non-trivial prediction in (0, 1) and binary target.
        let pred = (Tensor::arange(n, (Kind::Float, dev)) / (n as f64) * 0.9) + 0.05;
        let target = Tensor::arange(n, (Kind::Float, dev)).remainder(2.0);

        // A fixed permutation: reverse order.
        let perm = Tensor::arange(n, (Kind::Int64, dev)).flip([0]);
        let pred_p = pred.index_select(0, &perm);
        let target_p = target.index_select(0, &perm);

        let a: f64 = loss_fn.forward(&pred, &target).double_value(&[]);
        let b: f64 = loss_fn.forward(&pred_p, &target_p).double_value(&[]);
        assert!(
            (a - b).abs() < 1e-6,
            "loss must not depend on pixel order: {a} vs {b}"
        );
    }

    #[test]
    fn weight_scales_the_loss_linearly() {
        let dev = cpu();
        let pred = Tensor::full([1, 1, 8, 8], 0.3, (Kind::Float, dev));
        let target = Tensor::ones([1, 1, 8, 8], (Kind::Float, dev));

        let base: f64 = DiceBceLoss::new(1.0).forward(&pred, &target).double_value(&[]);
        let doubled: f64 = DiceBceLoss::new(2.0).forward(&pred, &target).double_value(&[]);
        assert!(
            (doubled - 2.0 * base).abs() < 1e-6,
            "weight 2 must double the loss: {base} vs {doubled}"
        );
    }

    #[test]
    fn dice_term_matches_hand_computation() {
        let dev = cpu();
        // P = [0.5, 0.5], T = [1, 1]:
        //   dice = 1 - (2·1 + 1) / (1 + 2 + 1) = 0.25
        //   bce  = mean(-log(0.5)) = ln 2
        let pred = Tensor::full([2], 0.5, (Kind::Float, dev));
        let target = Tensor::from_slice(&[1.0_f32, 1.0]);

        let total: f64 = DiceBceLoss::default().forward(&pred, &target).double_value(&[]);
        let expected = 0.25 + std::f64::consts::LN_2;

        assert!(
            (total - expected).abs() < 1e-5,
            "expected dice 0.25 + bce ln2 = {expected}, got {total}"
        );
    }
}
