//! Ground-truth mask construction.
//!
//! During training the fusion module is supervised by per-image collections
//! of binary instance masks at the original image resolution. Supervision
//! does not distinguish instances: all masks of an image are merged into one
//! **union mask** (the elementwise sum clipped to {0, 1}), lifted into a
//! `[B, 1, H, W]` tensor, and resampled to each pyramid level's resolution
//! by the orchestrator.
//!
//! Masks are handled host-side as [`ndarray`] arrays until the final tensor
//! lift, mirroring how the detector's other target builders prepare
//! supervision before the device transfer.

use ndarray::{Array2, Array3, Axis};
use tch::{Device, Kind, Tensor};

use crate::error::{FusionError, FusionResult};

// ---------------------------------------------------------------------------
// InstanceMasks
// ---------------------------------------------------------------------------

/// The binary instance masks of one image, shaped `[N, H, W]`.
///
/// `N` may be zero (an image with no annotated targets); height and width
/// are always known so an empty collection still produces an all-zero union
/// mask at the right resolution.
#[derive(Debug, Clone)]
pub struct InstanceMasks {
    masks: Array3<f32>,
}

impl InstanceMasks {
    /// Wrap an `[N, H, W]` stack of binary masks.
    pub fn new(masks: Array3<f32>) -> Self {
        InstanceMasks { masks }
    }

    /// An empty collection (no instances) at the given resolution.
    pub fn empty(height: usize, width: usize) -> Self {
        InstanceMasks { masks: Array3::zeros((0, height, width)) }
    }

    /// A single mask covering the full image.
    pub fn full_image(height: usize, width: usize) -> Self {
        InstanceMasks { masks: Array3::ones((1, height, width)) }
    }

    /// Number of instances.
    pub fn len(&self) -> usize {
        self.masks.shape()[0]
    }

    /// `true` when the image has no annotated instances.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mask height in pixels.
    pub fn height(&self) -> usize {
        self.masks.shape()[1]
    }

    /// Mask width in pixels.
    pub fn width(&self) -> usize {
        self.masks.shape()[2]
    }

    /// Union of all instances: the elementwise sum over the instance axis,
    /// clipped to {0, 1}. Shape `[H, W]`; all zeros when `N == 0`.
    pub fn union(&self) -> Array2<f32> {
        self.masks.sum_axis(Axis(0)).mapv(|v| v.clamp(0.0, 1.0))
    }
}

// ---------------------------------------------------------------------------
// Batch union tensor
// ---------------------------------------------------------------------------

/// Build the `[B, 1, H, W]` union-mask tensor for a batch of per-image
/// instance collections on `device`.
///
/// # Errors
///
/// Returns [`FusionError::MaskShapeMismatch`] when the images disagree on
/// resolution, and [`FusionError::MaskBatchMismatch`] for an empty batch
/// (a batch of zero images cannot supervise anything).
pub fn batch_union_tensor(masks: &[InstanceMasks], device: Device) -> FusionResult<Tensor> {
    let Some(first) = masks.first() else {
        return Err(FusionError::MaskBatchMismatch { batch: 0, masks: 0 });
    };
    let (height, width) = (first.height(), first.width());

    for (image, m) in masks.iter().enumerate() {
        if (m.height(), m.width()) != (height, width) {
            return Err(FusionError::MaskShapeMismatch {
                image,
                expected: (height, width),
                actual: (m.height(), m.width()),
            });
        }
    }

    let mut flat = Vec::with_capacity(masks.len() * height * width);
    for m in masks {
        flat.extend(m.union().iter().copied());
    }

    let batch = Tensor::from_slice(&flat)
        .reshape([masks.len() as i64, 1, height as i64, width as i64])
        .to_kind(Kind::Float)
        .to_device(device);
    Ok(batch)
}

/// Resample a `[B, 1, H, W]` union-mask tensor to `(height, width)` with
/// nearest-neighbor interpolation.
///
/// Called once per pyramid level; the result is intentionally not cached
/// across levels.
pub fn resample_to(batch_mask: &Tensor, height: i64, width: i64) -> Tensor {
    batch_mask.upsample_nearest2d([height, width], None, None)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
