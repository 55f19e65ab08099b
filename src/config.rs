//! Fusion-module configuration.
//!
//! [`FusionConfig`] is the single source of truth for the construction-time
//! settings of the target-aware fusion module: per-level channel counts,
//! expansion ratio, block counts, normalization and activation
//! specifications, and the backbone-sharing strategy. It is serializable via
//! [`serde`] so it can be stored to / restored from JSON alongside detector
//! checkpoints. The configuration is fixed for the lifetime of the module;
//! nothing in it is consulted per forward call except through the layers it
//! parameterised.
//!
//! # Example
//!
//! ```rust
//! use rgbt_fusion::config::FusionConfig;
//!
//! let cfg = FusionConfig::default();
//! cfg.validate().expect("default config is valid");
//!
//! assert_eq!(cfg.in_channels, vec![256, 512, 1024, 2048]);
//! assert_eq!(cfg.num_levels(), 4);
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use tch::Tensor;

use crate::error::ConfigError;

// ---------------------------------------------------------------------------
// Normalization / activation specifications
// ---------------------------------------------------------------------------

/// Normalization layer specification: layer kind plus its parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum NormSpec {
    /// 2-D batch normalization.
    Batch {
        /// Running-statistics momentum.
        momentum: f64,
        /// Numerical-stability epsilon.
        eps: f64,
    },
    /// Group normalization.
    ///
    /// When a layer's channel count is not divisible by `groups` the layer
    /// falls back to a single group (the 1-channel mask-head projections
    /// always normalise as one group).
    Group {
        /// Number of channel groups.
        groups: usize,
        /// Numerical-stability epsilon.
        eps: f64,
    },
}

impl Default for NormSpec {
    fn default() -> Self {
        NormSpec::Batch { momentum: 0.03, eps: 1e-3 }
    }
}

/// Activation function specification.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ActSpec {
    /// Rectified linear unit.
    Relu,
    /// Sigmoid-weighted linear unit (swish).
    Silu,
    /// Leaky ReLU with a configurable negative slope.
    LeakyRelu {
        /// Slope applied to negative inputs.
        negative_slope: f64,
    },
    /// Logistic sigmoid.
    Sigmoid,
}

impl ActSpec {
    /// Apply this activation to `x`.
    pub fn apply(&self, x: &Tensor) -> Tensor {
        match self {
            ActSpec::Relu => x.relu(),
            ActSpec::Silu => x.silu(),
            // max(x, s·x) equals leaky-relu for 0 <= s < 1.
            ActSpec::LeakyRelu { negative_slope } => x.maximum(&(x * *negative_slope)),
            ActSpec::Sigmoid => x.sigmoid(),
        }
    }
}

impl Default for ActSpec {
    fn default() -> Self {
        ActSpec::Relu
    }
}

// ---------------------------------------------------------------------------
// FusionConfig
// ---------------------------------------------------------------------------

/// Complete construction-time configuration for the target-aware fusion
/// module.
///
/// All fields have documented defaults matching the reference detector setup
/// (a four-level ResNet-style pyramid). Use [`FusionConfig::default()`] or
/// [`FusionConfig::with_channels`] as a starting point, then override
/// individual fields as needed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusionConfig {
    // -----------------------------------------------------------------------
    // Pyramid geometry
    // -----------------------------------------------------------------------
    /// Channel count of each pyramid level, ordered finest to coarsest.
    ///
    /// The fused output at level `i` has `in_channels[i]` channels, matching
    /// the single-modality width. Default: **[256, 512, 1024, 2048]**.
    pub in_channels: Vec<usize>,

    /// Spatial stride between adjacent pyramid levels.
    ///
    /// The bottom-up refiners downsample by this factor when carrying a
    /// refined level into the next coarser one. Default: **2**.
    pub level_stride: usize,

    // -----------------------------------------------------------------------
    // Fusion block
    // -----------------------------------------------------------------------
    /// Hidden-channel expansion ratio of the fusion blocks.
    ///
    /// Each branch of a fusion block projects its 2C-channel input down to
    /// `C · expand_ratio` channels. Default: **0.5**.
    pub expand_ratio: f64,

    /// Number of residual sub-blocks on the main branch of each fusion
    /// block. Default: **1**.
    pub num_blocks: usize,

    /// Enable the identity shortcut inside each residual sub-block.
    /// Default: **true**.
    pub add_identity: bool,

    /// Use depthwise-separable 3×3 convolutions inside the residual
    /// sub-blocks instead of dense ones. Default: **false**.
    pub use_depthwise: bool,

    /// Trailing-activation flag of each fusion block's final projection,
    /// one entry per level.
    ///
    /// This asymmetry is intentional reference behavior, not a derived rule:
    /// only the finest level activates its final projection by default.
    pub final_act_levels: Vec<bool>,

    // -----------------------------------------------------------------------
    // Normalization / activation
    // -----------------------------------------------------------------------
    /// Normalization specification applied after every convolution.
    pub norm: NormSpec,

    /// Activation specification for all non-terminal nonlinearities.
    pub act: ActSpec,

    // -----------------------------------------------------------------------
    // Supervision
    // -----------------------------------------------------------------------
    /// Multiplier on the combined dice + BCE auxiliary loss. Default: **1.0**.
    pub loss_weight: f64,

    // -----------------------------------------------------------------------
    // Feature sources
    // -----------------------------------------------------------------------
    /// Whether both modalities run through one shared backbone instance.
    ///
    /// When `false`, the thermal stream owns an independently constructed
    /// backbone. The choice is fixed at construction and checked against the
    /// instances actually supplied. Default: **true**.
    pub shared_backbone: bool,
}

impl Default for FusionConfig {
    fn default() -> Self {
        FusionConfig::with_channels(vec![256, 512, 1024, 2048])
    }
}

impl FusionConfig {
    /// Build a configuration for the given per-level channel counts with all
    /// other fields at their defaults.
    ///
    /// The trailing activation is enabled on the finest level only,
    /// mirroring the reference design.
    pub fn with_channels(in_channels: Vec<usize>) -> Self {
        let final_act_levels = (0..in_channels.len()).map(|i| i == 0).collect();
        FusionConfig {
            in_channels,
            level_stride: 2,
            expand_ratio: 0.5,
            num_blocks: 1,
            add_identity: true,
            use_depthwise: false,
            final_act_levels,
            norm: NormSpec::default(),
            act: ActSpec::default(),
            loss_weight: 1.0,
            shared_backbone: true,
        }
    }

    /// Number of configured pyramid levels.
    pub fn num_levels(&self) -> usize {
        self.in_channels.len()
    }

    /// Hidden-channel count of the fusion block at `level`.
    pub fn mid_channels(&self, level: usize) -> usize {
        (self.in_channels[level] as f64 * self.expand_ratio) as usize
    }

    /// Load a [`FusionConfig`] from a JSON file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::FileRead`] if the file cannot be opened,
    /// [`ConfigError::ParseError`] if the JSON is malformed, and a
    /// validation error if the loaded values are incoherent.
    pub fn from_json(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        let cfg: FusionConfig =
            serde_json::from_str(&contents).map_err(|source| ConfigError::ParseError {
                path: path.to_path_buf(),
                source,
            })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize this configuration to pretty-printed JSON and write it to
    /// `path`, creating parent directories if necessary.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::FileRead`] if the directory cannot be created
    /// or the file cannot be written.
    pub fn to_json(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::FileRead {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::invalid_value("(serialization)", e.to_string()))?;
        std::fs::write(path, json).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(())
    }

    /// Validate all fields and return an error describing the first problem
    /// found, or `Ok(())` if the configuration is coherent.
    ///
    /// # Validated invariants
    ///
    /// - At least one pyramid level, every channel count non-zero.
    /// - `expand_ratio` in (0, 1] and a hidden width of at least one channel
    ///   at every level.
    /// - `num_blocks` at least 1.
    /// - `final_act_levels` has exactly one flag per level.
    /// - `level_stride` at least 1.
    /// - Norm/activation parameters within range.
    /// - `loss_weight` non-negative.
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Pyramid geometry
        if self.in_channels.is_empty() {
            return Err(ConfigError::invalid_value(
                "in_channels",
                "at least one pyramid level is required",
            ));
        }
        if let Some(level) = self.in_channels.iter().position(|&c| c == 0) {
            return Err(ConfigError::invalid_value(
                "in_channels",
                format!("channel count at level {level} must be > 0"),
            ));
        }
        if self.level_stride == 0 {
            return Err(ConfigError::invalid_value("level_stride", "must be >= 1"));
        }

        // Fusion block
        if !(self.expand_ratio > 0.0 && self.expand_ratio <= 1.0) {
            return Err(ConfigError::invalid_value(
                "expand_ratio",
                "must be in (0.0, 1.0]",
            ));
        }
        if let Some(level) = (0..self.in_channels.len()).find(|&l| self.mid_channels(l) == 0) {
            return Err(ConfigError::invalid_value(
                "expand_ratio",
                format!("hidden width at level {level} collapses to zero channels"),
            ));
        }
        if self.num_blocks == 0 {
            return Err(ConfigError::invalid_value("num_blocks", "must be >= 1"));
        }
        if self.final_act_levels.len() != self.in_channels.len() {
            return Err(ConfigError::invalid_value(
                "final_act_levels",
                format!(
                    "expected one flag per level ({}), got {}",
                    self.in_channels.len(),
                    self.final_act_levels.len()
                ),
            ));
        }

        // Norm / activation parameters
        match self.norm {
            NormSpec::Batch { momentum, eps } => {
                if !(momentum > 0.0 && momentum < 1.0) {
                    return Err(ConfigError::invalid_value(
                        "norm.momentum",
                        "must be in (0.0, 1.0)",
                    ));
                }
                if eps <= 0.0 {
                    return Err(ConfigError::invalid_value("norm.eps", "must be > 0.0"));
                }
            }
            NormSpec::Group { groups, eps } => {
                if groups == 0 {
                    return Err(ConfigError::invalid_value("norm.groups", "must be >= 1"));
                }
                if eps <= 0.0 {
                    return Err(ConfigError::invalid_value("norm.eps", "must be > 0.0"));
                }
            }
        }
        if let ActSpec::LeakyRelu { negative_slope } = self.act {
            if !(0.0..1.0).contains(&negative_slope) {
                return Err(ConfigError::invalid_value(
                    "act.negative_slope",
                    "must be in [0.0, 1.0)",
                ));
            }
        }

        // Supervision
        if self.loss_weight < 0.0 {
            return Err(ConfigError::invalid_value("loss_weight", "must be >= 0.0"));
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
