//! Target-aware fusion orchestrator.
//!
//! [`TargetAwareFusion`] owns one [`FusionLevel`] record per pyramid level
//! and sequences them over a visible/thermal pyramid pair:
//!
//! ```text
//! level 0 (finest):  fused₀ = Fusion₀(cat(vis₀, th₀))        refined₀ = fused₀
//! level i > 0:       fusedᵢ = Fusionᵢ(cat(visᵢ, thᵢ))
//!                    refinedᵢ = BottomUpᵢ₋₁(refinedᵢ₋₁, fusedᵢ)
//! every level:       Pᵢ = MaskHeadᵢ(refinedᵢ)
//! training only:     lossᵢ = DiceBce(Pᵢ, resample(union_mask, Pᵢ))
//!                    loss  = mean(loss₀ … loss_{L-1})
//! ```
//!
//! The forward pass is a pure function of its inputs and the module's
//! persistent parameters: single-threaded, synchronous, batch-parallel, and
//! free of side effects. Parameters are created once at construction and are
//! only mutated by an external optimizer between calls; concurrent forward
//! calls during an update require external synchronization.

use tch::{nn, nn::ModuleT, no_grad, Kind, Tensor};
use tracing::debug;

use crate::config::FusionConfig;
use crate::error::{FusionError, FusionResult};
use crate::fusion::{BottomUpRefiner, CspFusionBlock, MaskHead};
use crate::losses::DiceBceLoss;
use crate::masks::{batch_union_tensor, resample_to, InstanceMasks};

// ---------------------------------------------------------------------------
// FusionLevel
// ---------------------------------------------------------------------------

/// Persistent per-level state: the fusion block, the optional bottom-up
/// refiner that carries this level into the next coarser one, and the mask
/// head.
///
/// The refiner is `None` exactly on the last level — a structural property
/// of the level list established at construction, not a runtime index
/// comparison.
#[derive(Debug)]
pub struct FusionLevel {
    fusion: CspFusionBlock,
    refiner: Option<BottomUpRefiner>,
    mask_head: MaskHead,
}

impl FusionLevel {
    /// `true` when this level carries a refiner into the next level.
    pub fn has_refiner(&self) -> bool {
        self.refiner.is_some()
    }
}

// ---------------------------------------------------------------------------
// TrainOutput
// ---------------------------------------------------------------------------

/// Result of a supervised forward pass.
#[derive(Debug)]
pub struct TrainOutput {
    /// Unweighted arithmetic mean of the per-level losses; differentiable
    /// scalar for back-propagation.
    pub loss: Tensor,
    /// Detached per-level loss values, finest level first, for logging and
    /// checkpointing only.
    pub level_losses: Vec<f32>,
    /// Refined pyramid, one tensor per level with the single-modality
    /// channel widths.
    pub refined: Vec<Tensor>,
}

// ---------------------------------------------------------------------------
// TargetAwareFusion
// ---------------------------------------------------------------------------

/// Multi-scale fusion of a visible/thermal feature-pyramid pair with
/// auxiliary mask supervision.
#[derive(Debug)]
pub struct TargetAwareFusion {
    levels: Vec<FusionLevel>,
    loss: DiceBceLoss,
    config: FusionConfig,
}

impl TargetAwareFusion {
    /// Build the module under `p`, one [`FusionLevel`] per configured level.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`](crate::error::ConfigError) (wrapped in
    /// [`FusionError::Config`]) when the configuration is incoherent, e.g.
    /// when the trailing-activation flags do not cover every level.
    pub fn new(p: &nn::Path, config: &FusionConfig) -> FusionResult<Self> {
        config.validate()?;

        let mut levels = Vec::with_capacity(config.num_levels());
        for (idx, &channels) in config.in_channels.iter().enumerate() {
            let lp = p / format!("level{idx}");

            let fusion_path = &lp / "fusion";
            let fusion = CspFusionBlock::new(
                &fusion_path,
                channels as i64,
                config.mid_channels(idx) as i64,
                config,
                config.final_act_levels[idx],
            );

            // Populated for every level except the last.
            let refiner = config.in_channels.get(idx + 1).map(|&next_channels| {
                let refiner_path = &lp / "bottom_up";
                BottomUpRefiner::new(
                    &refiner_path,
                    channels as i64,
                    next_channels as i64,
                    config.level_stride as i64,
                    &config.norm,
                    config.act,
                )
            });

            let mask_path = &lp / "mask_head";
            let mask_head = MaskHead::new(&mask_path, channels as i64, &config.norm, config.act);

            levels.push(FusionLevel { fusion, refiner, mask_head });
        }

        Ok(TargetAwareFusion {
            levels,
            loss: DiceBceLoss::new(config.loss_weight),
            config: config.clone(),
        })
    }

    /// Number of pyramid levels.
    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    /// The configuration this module was built from.
    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    /// The per-level records, finest first.
    pub fn levels(&self) -> &[FusionLevel] {
        &self.levels
    }

    /// Training forward pass.
    ///
    /// Fuses the two pyramids, predicts a target-probability map at every
    /// level, and supervises each prediction against the union of
    /// `gt_masks` resampled (nearest-neighbor) to that level's resolution.
    ///
    /// Returns the unweighted arithmetic mean of the per-level losses
    /// together with the refined pyramid; the detached per-level values ride
    /// along for logging.
    ///
    /// # Errors
    ///
    /// - [`FusionError::PyramidLengthMismatch`] / [`FusionError::ShapeMismatch`]
    ///   when the pyramid pair violates the shape contract.
    /// - [`FusionError::MaskBatchMismatch`] / [`FusionError::MaskShapeMismatch`]
    ///   when the ground-truth collections do not cover the batch.
    pub fn forward_train(
        &self,
        visible: &[Tensor],
        thermal: &[Tensor],
        gt_masks: &[InstanceMasks],
    ) -> FusionResult<TrainOutput> {
        self.check_pyramids(visible, thermal)?;

        let batch = visible[0].size()[0] as usize;
        if gt_masks.len() != batch {
            return Err(FusionError::MaskBatchMismatch { batch, masks: gt_masks.len() });
        }

        let device = visible[0].device();
        let union = batch_union_tensor(gt_masks, device)?;
        debug!(levels = self.levels.len(), batch, "target-aware fusion training forward");

        let (refined, level_losses) = self.run_levels(visible, thermal, Some(&union), true);

        let mut total = Tensor::zeros([], (Kind::Float, device));
        let mut level_values = Vec::with_capacity(level_losses.len());
        for level_loss in &level_losses {
            level_values.push(level_loss.double_value(&[]) as f32);
            total = total + level_loss;
        }
        let loss = total / (self.levels.len() as f64);

        Ok(TrainOutput { loss, level_losses: level_values, refined })
    }

    /// Inference forward pass: the refined pyramid only, computed without
    /// gradient tracking and without mask prediction overhead beyond the
    /// heads themselves.
    ///
    /// # Errors
    ///
    /// Same shape-contract errors as [`forward_train`](Self::forward_train).
    pub fn forward_inference(
        &self,
        visible: &[Tensor],
        thermal: &[Tensor],
    ) -> FusionResult<Vec<Tensor>> {
        self.check_pyramids(visible, thermal)?;
        debug!(levels = self.levels.len(), "target-aware fusion inference forward");

        let (refined, _) = no_grad(|| self.run_levels(visible, thermal, None, false));
        Ok(refined)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    /// Verify the pyramid pair against the configured level count and the
    /// per-level shape contract. No tensor work happens before this passes.
    fn check_pyramids(&self, visible: &[Tensor], thermal: &[Tensor]) -> FusionResult<()> {
        let expected = self.levels.len();
        if visible.len() != expected || thermal.len() != expected {
            return Err(FusionError::PyramidLengthMismatch {
                expected,
                visible: visible.len(),
                thermal: thermal.len(),
            });
        }
        for (level, (v, t)) in visible.iter().zip(thermal.iter()).enumerate() {
            if v.size() != t.size() {
                return Err(FusionError::shape_mismatch(level, v.size(), t.size()));
            }
        }
        Ok(())
    }

    /// Run all levels in ascending order (finest first).
    ///
    /// Returns the refined pyramid and, when `union` is supplied, one loss
    /// tensor per level. The union mask is resampled to each prediction's
    /// resolution on the spot — deliberately recomputed per level.
    fn run_levels(
        &self,
        visible: &[Tensor],
        thermal: &[Tensor],
        union: Option<&Tensor>,
        train: bool,
    ) -> (Vec<Tensor>, Vec<Tensor>) {
        let mut refined: Vec<Tensor> = Vec::with_capacity(self.levels.len());
        let mut level_losses = Vec::new();
        // The refiner that carries the previous level's output into this one.
        let mut carry: Option<&BottomUpRefiner> = None;

        for (idx, level) in self.levels.iter().enumerate() {
            let stacked = Tensor::cat(&[&visible[idx], &thermal[idx]], 1);
            let fused = level.fusion.forward_t(&stacked, train);

            let refined_t = match (carry, refined.last()) {
                (Some(refiner), Some(prev)) => refiner.forward_t(prev, &fused, train),
                _ => fused,
            };

            let pred = level.mask_head.forward_t(&refined_t, train);
            if let Some(union) = union {
                let size = pred.size();
                let gt_level = resample_to(union, size[2], size[3]);
                level_losses.push(self.loss.forward(&pred, &gt_level));
            }

            carry = level.refiner.as_ref();
            refined.push(refined_t);
        }

        (refined, level_losses)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
