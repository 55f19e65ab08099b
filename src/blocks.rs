//! Convolutional building blocks shared by the fusion components.
//!
//! [`ConvBlock`] is the conv → norm → activation unit everything else is
//! assembled from; [`ResidualBlock`] is the residual sub-block stacked on
//! the main branch of each fusion block. All layers are constructed eagerly
//! at module-build time and registered under the supplied [`nn::Path`], so
//! their parameters live in the owning var store for the lifetime of the
//! module and are only ever mutated by an external optimizer.

use tch::{nn, nn::Module, nn::ModuleT, Tensor};

use crate::config::{ActSpec, NormSpec};

// ---------------------------------------------------------------------------
// Normalization layer
// ---------------------------------------------------------------------------

/// A constructed normalization layer, batch or group, per [`NormSpec`].
#[derive(Debug)]
pub(crate) enum Norm {
    Batch(nn::BatchNorm),
    Group(nn::GroupNorm),
}

impl Norm {
    pub(crate) fn new(p: &nn::Path, channels: i64, spec: &NormSpec) -> Self {
        match *spec {
            NormSpec::Batch { momentum, eps } => Norm::Batch(nn::batch_norm2d(
                p,
                channels,
                nn::BatchNormConfig { momentum, eps, ..Default::default() },
            )),
            NormSpec::Group { groups, eps } => {
                // Non-divisible channel counts (notably the 1-channel mask
                // projections) normalise as a single group.
                let groups = groups as i64;
                let groups = if channels % groups == 0 { groups } else { 1 };
                Norm::Group(nn::group_norm(
                    p,
                    groups,
                    channels,
                    nn::GroupNormConfig { eps, ..Default::default() },
                ))
            }
        }
    }

    pub(crate) fn forward_t(&self, x: &Tensor, train: bool) -> Tensor {
        match self {
            Norm::Batch(bn) => bn.forward_t(x, train),
            Norm::Group(gn) => gn.forward(x),
        }
    }
}

// ---------------------------------------------------------------------------
// ConvBlock
// ---------------------------------------------------------------------------

/// Convolution + normalization + optional activation.
///
/// The convolution is bias-free since a normalization layer always follows.
/// Padding is `(ksize - 1) / 2` so spatial size is preserved at stride 1.
#[derive(Debug)]
pub struct ConvBlock {
    conv: nn::Conv2D,
    norm: Norm,
    act: Option<ActSpec>,
}

impl ConvBlock {
    /// Build a dense conv block.
    pub fn new(
        p: &nn::Path,
        in_channels: i64,
        out_channels: i64,
        ksize: i64,
        stride: i64,
        norm: &NormSpec,
        act: Option<ActSpec>,
    ) -> Self {
        Self::with_groups(p, in_channels, out_channels, ksize, stride, 1, norm, act)
    }

    /// Build a conv block with grouped channels (`groups == in_channels`
    /// gives a depthwise convolution).
    #[allow(clippy::too_many_arguments)]
    pub fn with_groups(
        p: &nn::Path,
        in_channels: i64,
        out_channels: i64,
        ksize: i64,
        stride: i64,
        groups: i64,
        norm: &NormSpec,
        act: Option<ActSpec>,
    ) -> Self {
        let conv = nn::conv2d(
            p / "conv",
            in_channels,
            out_channels,
            ksize,
            nn::ConvConfig {
                stride,
                padding: (ksize - 1) / 2,
                groups,
                bias: false,
                ..Default::default()
            },
        );
        let norm = Norm::new(&(p / "norm"), out_channels, norm);
        ConvBlock { conv, norm, act }
    }
}

impl ModuleT for ConvBlock {
    fn forward_t(&self, x: &Tensor, train: bool) -> Tensor {
        let out = self.norm.forward_t(&self.conv.forward(x), train);
        match &self.act {
            Some(act) => act.apply(&out),
            None => out,
        }
    }
}

// ---------------------------------------------------------------------------
// ResidualBlock
// ---------------------------------------------------------------------------

/// Residual sub-block used on the main branch of a fusion block.
///
/// ```text
/// x ── 1×1 ConvBlock ── 3×3 ConvBlock ──+── out
///  │                                     │
///  └──────── (identity, optional) ───────┘
/// ```
///
/// With `use_depthwise` the 3×3 stage becomes a depthwise 3×3 followed by a
/// pointwise 1×1, each with its own norm and activation.
#[derive(Debug)]
pub struct ResidualBlock {
    conv1: ConvBlock,
    conv2: SpatialConv,
    add_identity: bool,
}

#[derive(Debug)]
enum SpatialConv {
    Standard(ConvBlock),
    Separable { depthwise: ConvBlock, pointwise: ConvBlock },
}

impl ResidualBlock {
    /// Build a residual sub-block mapping `in_channels` to `out_channels`.
    ///
    /// The identity shortcut is active only when `add_identity` is set and
    /// the channel counts match.
    pub fn new(
        p: &nn::Path,
        in_channels: i64,
        out_channels: i64,
        add_identity: bool,
        use_depthwise: bool,
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
        let conv2 = if use_depthwise {
            SpatialConv::Separable {
                depthwise: ConvBlock::with_groups(
                    &(p / "conv2_dw"),
                    out_channels,
                    out_channels,
                    3,
                    1,
                    out_channels,
                    norm,
                    Some(act),
                ),
                pointwise: ConvBlock::new(
                    &(p / "conv2_pw"),
                    out_channels,
                    out_channels,
                    1,
                    1,
                    norm,
                    Some(act),
                ),
            }
        } else {
            SpatialConv::Standard(ConvBlock::new(
                &(p / "conv2"),
                out_channels,
                out_channels,
                3,
                1,
                norm,
                Some(act),
            ))
        };
        ResidualBlock {
            conv1,
            conv2,
            add_identity: add_identity && in_channels == out_channels,
        }
    }
}

impl ModuleT for ResidualBlock {
    fn forward_t(&self, x: &Tensor, train: bool) -> Tensor {
        let out = self.conv1.forward_t(x, train);
        let out = match &self.conv2 {
            SpatialConv::Standard(conv) => conv.forward_t(&out, train),
            SpatialConv::Separable { depthwise, pointwise } => {
                pointwise.forward_t(&depthwise.forward_t(&out, train), train)
            }
        };
        if self.add_identity {
            out + x
        } else {
            out
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, Kind};

    fn root() -> nn::VarStore {
        nn::VarStore::new(Device::Cpu)
    }

    #[test]
    fn conv_block_preserves_spatial_size_at_stride_one() {
        let vs = root();
        let block = ConvBlock::new(
            &vs.root(),
            8,
            16,
            3,
            1,
            &NormSpec::default(),
            Some(ActSpec::Relu),
        );
        let x = Tensor::ones([2, 8, 10, 10], (Kind::Float, Device::Cpu));
        let y = block.forward_t(&x, true);
        assert_eq!(y.size(), [2, 16, 10, 10]);
    }

    #[test]
    fn conv_block_stride_two_halves_resolution() {
        let vs = root();
        let block = ConvBlock::new(
            &vs.root(),
            4,
            4,
            3,
            2,
            &NormSpec::default(),
            None,
        );
        let x = Tensor::ones([1, 4, 16, 16], (Kind::Float, Device::Cpu));
        let y = block.forward_t(&x, false);
        assert_eq!(y.size(), [1, 4, 8, 8]);
    }

    #[test]
    fn residual_block_keeps_shape() {
        let vs = root();
        let block = ResidualBlock::new(
            &vs.root(),
            8,
            8,
            true,
            false,
            &NormSpec::default(),
            ActSpec::Relu,
        );
        let x = Tensor::ones([2, 8, 12, 12], (Kind::Float, Device::Cpu));
        let y = block.forward_t(&x, true);
        assert_eq!(y.size(), x.size());
    }

    #[test]
    fn depthwise_residual_block_keeps_shape() {
        let vs = root();
        let block = ResidualBlock::new(
            &vs.root(),
            8,
            8,
            true,
            true,
            &NormSpec::default(),
            ActSpec::Silu,
        );
        let x = Tensor::ones([1, 8, 6, 6], (Kind::Float, Device::Cpu));
        let y = block.forward_t(&x, false);
        assert_eq!(y.size(), x.size());
    }

    #[test]
    fn group_norm_falls_back_to_one_group_for_single_channel() {
        let vs = root();
        // groups = 8 cannot divide 1 output channel; must not panic.
        let block = ConvBlock::new(
            &vs.root(),
            4,
            1,
            1,
            1,
            &NormSpec::Group { groups: 8, eps: 1e-5 },
            None,
        );
        let x = Tensor::ones([1, 4, 5, 5], (Kind::Float, Device::Cpu));
        let y = block.forward_t(&x, false);
        assert_eq!(y.size(), [1, 1, 5, 5]);
    }
}
