//! Per-level fusion components.
//!
//! Three pieces make up one pyramid level of the target-aware fusion module:
//!
//! - [`CspFusionBlock`] merges the channel-concatenated modality pair back
//!   down to the single-modality width through a split main/short branch
//!   pair in the CSP style.
//! - [`BottomUpRefiner`] carries the previous (finer) level's refined tensor
//!   into the current level through a strided residual bottleneck and sums
//!   it with the current level's fusion output.
//! - [`MaskHead`] predicts a single-channel target-presence probability map
//!   from a refined tensor.
//!
//! ```text
//!                 ┌──────────────┐
//! concat(vis,th) ─► CspFusionBlock ─► fused ──+──► refined ──► MaskHead ─► P
//!                 └──────────────┘            │
//!            refined[level-1] ─► BottomUpRefiner
//! ```

use tch::{nn, nn::ModuleT, Tensor};

use crate::blocks::{ConvBlock, ResidualBlock};
use crate::config::{ActSpec, FusionConfig, NormSpec};

// ---------------------------------------------------------------------------
// CspFusionBlock
// ---------------------------------------------------------------------------

/// Cross-stage-partial fusion block for one pyramid level.
///
/// Input has `2 * channels` channels (the two modalities concatenated);
/// output has `channels`. Both branches project to the hidden width
/// `mid_channels = channels * expand_ratio`; the main branch additionally
/// runs through a stack of residual sub-blocks before the branches are
/// concatenated and projected back down.
///
/// The trailing activation on the final projection is a per-level setting:
/// in the reference configuration only the finest level enables it.
#[derive(Debug)]
pub struct CspFusionBlock {
    main_conv: ConvBlock,
    short_conv: ConvBlock,
    blocks: Vec<ResidualBlock>,
    final_conv: ConvBlock,
}

impl CspFusionBlock {
    /// Build the fusion block for a level with `channels` output channels.
    pub fn new(
        p: &nn::Path,
        channels: i64,
        mid_channels: i64,
        cfg: &FusionConfig,
        final_act: bool,
    ) -> Self {
        let in_channels = 2 * channels;
        let main_conv = ConvBlock::new(
            &(p / "main_conv"),
            in_channels,
            mid_channels,
            1,
            1,
            &cfg.norm,
            Some(cfg.act),
        );
        let short_conv = ConvBlock::new(
            &(p / "short_conv"),
            in_channels,
            mid_channels,
            1,
            1,
            &cfg.norm,
            Some(cfg.act),
        );
        let blocks = (0..cfg.num_blocks)
            .map(|i| {
                ResidualBlock::new(
                    &(p / format!("block{i}")),
                    mid_channels,
                    mid_channels,
                    cfg.add_identity,
                    cfg.use_depthwise,
                    &cfg.norm,
                    cfg.act,
                )
            })
            .collect();
        let final_conv = ConvBlock::new(
            &(p / "final_conv"),
            2 * mid_channels,
            channels,
            1,
            1,
            &cfg.norm,
            if final_act { Some(cfg.act) } else { None },
        );
        CspFusionBlock { main_conv, short_conv, blocks, final_conv }
    }
}

impl ModuleT for CspFusionBlock {
    fn forward_t(&self, x: &Tensor, train: bool) -> Tensor {
        let short = self.short_conv.forward_t(x, train);

        let mut main = self.main_conv.forward_t(x, train);
        for block in &self.blocks {
            main = block.forward_t(&main, train);
        }

        let merged = Tensor::cat(&[main, short], 1);
        self.final_conv.forward_t(&merged, train)
    }
}

// ---------------------------------------------------------------------------
// BottomUpRefiner
// ---------------------------------------------------------------------------

/// Strided residual bottleneck carrying refined level `i` into level `i+1`.
///
/// The previous refined tensor runs through a reduce → transform → expand
/// chain (1×1, strided 3×3, 1×1) and, in parallel, a strided 1×1 identity
/// path. Both are summed with the current level's fusion output, then
/// activated:
///
/// ```text
/// prev ── 1×1 ── 3×3(s) ── 1×1 ──┐
///   │                            ├─ sum ── act ──► refined
///   └──── 1×1(s) ────────────────┤
///                     fused ─────┘
/// ```
#[derive(Debug)]
pub struct BottomUpRefiner {
    conv1: ConvBlock,
    conv2: ConvBlock,
    conv3: ConvBlock,
    identity: ConvBlock,
    act: ActSpec,
}

impl BottomUpRefiner {
    /// Build a refiner from `in_channels` (previous level) to `out_channels`
    /// (current level), downsampling spatially by `stride`.
    pub fn new(
        p: &nn::Path,
        in_channels: i64,
        out_channels: i64,
        stride: i64,
        norm: &NormSpec,
        act: ActSpec,
    ) -> Self {
        let conv1 = ConvBlock::new(
            &(p / "conv1"),
            in_channels,
            out_channels,
            1,
            1,
            norm,
            Some(act),
        );
        let conv2 = ConvBlock::new(
            &(p / "conv2"),
            out_channels,
            out_channels,
            3,
            stride,
            norm,
            Some(act),
        );
        let conv3 = ConvBlock::new(&(p / "conv3"), out_channels, out_channels, 1, 1, norm, None);
        let identity = ConvBlock::new(
            &(p / "identity"),
            in_channels,
            out_channels,
            1,
            stride,
            norm,
            None,
        );
        BottomUpRefiner { conv1, conv2, conv3, identity, act }
    }

    /// Combine the previous level's refined tensor with the current level's
    /// fused tensor.
    pub fn forward_t(&self, prev_refined: &Tensor, fused: &Tensor, train: bool) -> Tensor {
        let out = self.conv1.forward_t(prev_refined, train);
        let out = self.conv2.forward_t(&out, train);
        let out = self.conv3.forward_t(&out, train);

        let identity = self.identity.forward_t(prev_refined, train);

        self.act.apply(&(out + identity + fused))
    }
}

// ---------------------------------------------------------------------------
// MaskHead
// ---------------------------------------------------------------------------

/// Per-level target-probability head.
///
/// A normalized + activated 1×1 projection down to one channel, followed by
/// a second 1×1 projection with a sigmoid, yielding values in [0, 1] at the
/// refined tensor's resolution.
#[derive(Debug)]
pub struct MaskHead {
    proj: ConvBlock,
    out: ConvBlock,
}

impl MaskHead {
    /// Build the mask head for a level with `in_channels` refined channels.
    pub fn new(p: &nn::Path, in_channels: i64, norm: &NormSpec, act: ActSpec) -> Self {
        let proj = ConvBlock::new(&(p / "proj"), in_channels, 1, 1, 1, norm, Some(act));
        let out = ConvBlock::new(&(p / "out"), 1, 1, 1, 1, norm, Some(ActSpec::Sigmoid));
        MaskHead { proj, out }
    }
}

impl ModuleT for MaskHead {
    fn forward_t(&self, x: &Tensor, train: bool) -> Tensor {
        self.out.forward_t(&self.proj.forward_t(x, train), train)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
