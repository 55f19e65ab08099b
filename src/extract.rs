//! Dual-stream feature extraction wiring.
//!
//! The fusion module consumes two feature pyramids produced by backbone
//! networks it does not own. Whether the two modality streams run through
//! one shared backbone instance or two independently owned instances is a
//! construction-time strategy choice, fixed for the module's lifetime and
//! modelled by [`BackboneBinding`]. [`DualStreamExtractor`] bundles a
//! binding with a [`TargetAwareFusion`] and enforces the supervision
//! contract of the training/inference split.
//!
//! Backbones stay opaque behind the [`FeatureSource`] trait: anything that
//! can turn a batch of images into a multi-scale pyramid qualifies.

use tch::{nn, Tensor};

use crate::config::FusionConfig;
use crate::error::{ConfigError, FusionError, FusionResult};
use crate::masks::InstanceMasks;
use crate::taf::TargetAwareFusion;

// ---------------------------------------------------------------------------
// FeatureSource
// ---------------------------------------------------------------------------

/// An opaque backbone capability: maps a `[B, C, H, W]` image batch to an
/// ordered multi-scale feature pyramid, finest level first.
pub trait FeatureSource {
    /// Produce the feature pyramid for `images`.
    fn pyramid(&self, images: &Tensor, train: bool) -> Vec<Tensor>;
}

// ---------------------------------------------------------------------------
// BackboneBinding
// ---------------------------------------------------------------------------

/// The backbone-sharing strategy, chosen once at construction.
#[derive(Debug)]
pub enum BackboneBinding<S> {
    /// One backbone instance serves both modalities.
    Shared(S),
    /// Each modality owns its backbone.
    Separate {
        /// Backbone for the visible-light stream.
        visible: S,
        /// Backbone for the thermal stream.
        thermal: S,
    },
}

impl<S: FeatureSource> BackboneBinding<S> {
    /// Build a binding from the configured sharing flag and the instances
    /// actually supplied.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::BackboneBinding`] when the flag and the
    /// instances disagree: a shared configuration with a second thermal
    /// instance, or a separate configuration without one.
    pub fn from_parts(
        config: &FusionConfig,
        visible: S,
        thermal: Option<S>,
    ) -> Result<Self, ConfigError> {
        match (config.shared_backbone, thermal) {
            (true, None) => Ok(BackboneBinding::Shared(visible)),
            (false, Some(thermal)) => Ok(BackboneBinding::Separate { visible, thermal }),
            (true, Some(_)) => Err(ConfigError::backbone_binding(
                "config requests a shared backbone but a second thermal instance was supplied",
            )),
            (false, None) => Err(ConfigError::backbone_binding(
                "config requests separate backbones but no thermal instance was supplied",
            )),
        }
    }

    /// `true` when one instance serves both modalities.
    pub fn is_shared(&self) -> bool {
        matches!(self, BackboneBinding::Shared(_))
    }

    /// Run both modality streams through their backbone(s).
    fn pyramids(
        &self,
        visible_images: &Tensor,
        thermal_images: &Tensor,
        train: bool,
    ) -> (Vec<Tensor>, Vec<Tensor>) {
        match self {
            BackboneBinding::Shared(backbone) => (
                backbone.pyramid(visible_images, train),
                backbone.pyramid(thermal_images, train),
            ),
            BackboneBinding::Separate { visible, thermal } => (
                visible.pyramid(visible_images, train),
                thermal.pyramid(thermal_images, train),
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// DualStreamExtractor
// ---------------------------------------------------------------------------

/// Output of one extraction pass.
#[derive(Debug)]
pub struct FusedFeatures {
    /// Auxiliary mask-supervision loss; present on the training path only.
    pub loss: Option<Tensor>,
    /// Refined feature pyramid, finest level first, single-modality channel
    /// widths.
    pub pyramid: Vec<Tensor>,
}

/// Backbone binding + target-aware fusion, with the supervision contract of
/// the host detector's forward split.
#[derive(Debug)]
pub struct DualStreamExtractor<S> {
    binding: BackboneBinding<S>,
    taf: TargetAwareFusion,
}

impl<S: FeatureSource> DualStreamExtractor<S> {
    /// Build an extractor under `p`.
    ///
    /// # Errors
    ///
    /// Fails with [`ConfigError::BackboneBinding`] when the binding variant
    /// contradicts `config.shared_backbone`, or with any configuration error
    /// raised by the fusion module itself.
    pub fn new(
        p: &nn::Path,
        config: &FusionConfig,
        binding: BackboneBinding<S>,
    ) -> FusionResult<Self> {
        if binding.is_shared() != config.shared_backbone {
            return Err(ConfigError::backbone_binding(
                "backbone binding variant contradicts the configured sharing flag",
            )
            .into());
        }
        let taf_path = p / "taf";
        let taf = TargetAwareFusion::new(&taf_path, config)?;
        Ok(DualStreamExtractor { binding, taf })
    }

    /// The fusion module.
    pub fn fusion(&self) -> &TargetAwareFusion {
        &self.taf
    }

    /// Extract and fuse features for one image pair batch.
    ///
    /// `return_loss` selects the training path: ground-truth masks are then
    /// mandatory, and forbidden otherwise.
    ///
    /// # Errors
    ///
    /// [`FusionError::MissingSupervision`] on a contract violation, plus any
    /// shape-contract error raised by the fusion forward.
    pub fn extract(
        &self,
        visible_images: &Tensor,
        thermal_images: &Tensor,
        gt_masks: Option<&[InstanceMasks]>,
        return_loss: bool,
    ) -> FusionResult<FusedFeatures> {
        match (return_loss, gt_masks) {
            (true, None) => Err(FusionError::missing_supervision(
                "training forward requires ground-truth masks",
            )),
            (false, Some(_)) => Err(FusionError::missing_supervision(
                "inference forward must not receive ground-truth masks",
            )),
            (true, Some(gt)) => {
                let (visible, thermal) =
                    self.binding.pyramids(visible_images, thermal_images, true);
                let out = self.taf.forward_train(&visible, &thermal, gt)?;
                Ok(FusedFeatures { loss: Some(out.loss), pyramid: out.refined })
            }
            (false, None) => {
                let (visible, thermal) =
                    self.binding.pyramids(visible_images, thermal_images, false);
                let pyramid = self.taf.forward_inference(&visible, &thermal)?;
                Ok(FusedFeatures { loss: None, pyramid })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
