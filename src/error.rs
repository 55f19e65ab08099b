//! Error types for the target-aware fusion module.
//!
//! This module is the single source of truth for all error types in the
//! crate. Every module that produces an error imports its error type from
//! here rather than defining it inline, keeping the error hierarchy
//! centralised and consistent.
//!
//! ## Hierarchy
//!
//! ```text
//! FusionError (top-level)
//! └── ConfigError      (construction-time validation / file loading)
//! ```
//!
//! All failures are surfaced synchronously to the caller. The fusion forward
//! pass is a pure deterministic transform, so nothing is retried internally
//! and no partial results are produced: a call either completes or fails.

use std::path::PathBuf;
use thiserror::Error;

// ---------------------------------------------------------------------------
// FusionResult
// ---------------------------------------------------------------------------

/// Convenient `Result` alias used throughout the crate.
pub type FusionResult<T> = Result<T, FusionError>;

// ---------------------------------------------------------------------------
// FusionError — top-level aggregator
// ---------------------------------------------------------------------------

/// Top-level error type for the fusion module.
///
/// Forward-pass contract violations (`PyramidLengthMismatch`,
/// `ShapeMismatch`, `MissingSupervision`, …) are caller errors detected
/// before any tensor work begins. Construction-time problems arrive as
/// [`ConfigError`] and are coerced via [`From`].
#[derive(Debug, Error)]
pub enum FusionError {
    /// A configuration validation or loading error.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The two modality pyramids differ in length, or their common length
    /// does not match the configured number of fusion levels.
    #[error(
        "Pyramid length mismatch: module is configured for {expected} levels, \
         got {visible} visible and {thermal} thermal"
    )]
    PyramidLengthMismatch {
        /// Configured number of fusion levels.
        expected: usize,
        /// Number of tensors in the visible pyramid.
        visible: usize,
        /// Number of tensors in the thermal pyramid.
        thermal: usize,
    },

    /// The visible and thermal tensors at one level differ in shape.
    ///
    /// Fusion concatenates the two modalities channel-wise, so shapes must
    /// match exactly. A mismatch is always a caller error and is never
    /// papered over by broadcasting.
    #[error(
        "Shape mismatch at level {level}: visible {visible:?} vs thermal {thermal:?}"
    )]
    ShapeMismatch {
        /// Pyramid level at which the mismatch was detected (0 = finest).
        level: usize,
        /// Shape of the visible tensor.
        visible: Vec<i64>,
        /// Shape of the thermal tensor.
        thermal: Vec<i64>,
    },

    /// The ground-truth mask collection does not cover the batch.
    #[error("Ground-truth mask count {masks} does not match batch size {batch}")]
    MaskBatchMismatch {
        /// Batch dimension of the input pyramids.
        batch: usize,
        /// Number of per-image mask collections supplied.
        masks: usize,
    },

    /// Instance masks within one batch disagree on image resolution.
    #[error(
        "Mask resolution mismatch for image {image}: expected {expected:?}, got {actual:?}"
    )]
    MaskShapeMismatch {
        /// Index of the offending image within the batch.
        image: usize,
        /// (height, width) of the first image's masks.
        expected: (usize, usize),
        /// (height, width) of the offending image's masks.
        actual: (usize, usize),
    },

    /// The supervision contract was violated: the training path was invoked
    /// without ground-truth masks, or masks were supplied on the inference
    /// path, which forbids them.
    #[error("Supervision contract violation: {0}")]
    MissingSupervision(String),
}

impl FusionError {
    /// Construct a [`FusionError::ShapeMismatch`].
    pub fn shape_mismatch(level: usize, visible: Vec<i64>, thermal: Vec<i64>) -> Self {
        FusionError::ShapeMismatch { level, visible, thermal }
    }

    /// Construct a [`FusionError::MissingSupervision`].
    pub fn missing_supervision<S: Into<String>>(msg: S) -> Self {
        FusionError::MissingSupervision(msg.into())
    }
}

// ---------------------------------------------------------------------------
// ConfigError
// ---------------------------------------------------------------------------

/// Errors produced when loading or validating a [`FusionConfig`].
///
/// [`FusionConfig`]: crate::config::FusionConfig
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field has an invalid value.
    #[error("Invalid value for `{field}`: {reason}")]
    InvalidValue {
        /// Name of the field.
        field: &'static str,
        /// Human-readable reason.
        reason: String,
    },

    /// The backbone-sharing flag conflicts with the feature-source instances
    /// actually supplied at construction time.
    #[error("Backbone binding conflict: {0}")]
    BackboneBinding(String),

    /// A configuration file could not be read from disk.
    #[error("Cannot read config file `{path}`: {source}")]
    FileRead {
        /// Path that was being read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A configuration file contains malformed JSON.
    #[error("Cannot parse config file `{path}`: {source}")]
    ParseError {
        /// Path that was being parsed.
        path: PathBuf,
        /// Underlying JSON parse error.
        #[source]
        source: serde_json::Error,
    },
}

impl ConfigError {
    /// Construct a [`ConfigError::InvalidValue`].
    pub fn invalid_value<S: Into<String>>(field: &'static str, reason: S) -> Self {
        ConfigError::InvalidValue { field, reason: reason.into() }
    }

    /// Construct a [`ConfigError::BackboneBinding`].
    pub fn backbone_binding<S: Into<String>>(msg: S) -> Self {
        ConfigError::BackboneBinding(msg.into())
    }
}
