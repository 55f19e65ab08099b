//! # Target-Aware Fusion for RGB-T Detection
//!
//! This crate fuses paired visible-light and thermal feature pyramids into a
//! single refined pyramid for a downstream two-stage detector, steering the
//! fusion toward target regions with an auxiliary per-scale mask loss.
//!
//! ## Architecture
//!
//! ```text
//! visible pyramid ─┐
//!                  ├─► per level: cat ─► CspFusionBlock ─► fused
//! thermal pyramid ─┘                         │
//!                                            ▼
//!   refined[i-1] ─► BottomUpRefiner ──► refined[i] ─► MaskHead ─► P[i]
//!                                            │              │
//!                              (to neck /    ▼              ▼
//!                               heads)   refined        DiceBceLoss vs
//!                                        pyramid        union mask (train)
//! ```
//!
//! The finest level's fusion output seeds the refinement chain; every
//! coarser level combines its own fusion output with the previous refined
//! level through a strided residual bottleneck. During training each level's
//! mask prediction is supervised against the ground-truth union mask
//! resampled to that level, and the per-level losses are averaged into one
//! auxiliary scalar for the detector's total loss.
//!
//! ## Quick Start
//!
//! ```rust
//! use rgbt_fusion::config::FusionConfig;
//! use rgbt_fusion::taf::TargetAwareFusion;
//! use tch::{nn, Device, Kind, Tensor};
//!
//! let vs = nn::VarStore::new(Device::Cpu);
//! let cfg = FusionConfig::with_channels(vec![64, 128, 256]);
//! let taf = TargetAwareFusion::new(&vs.root(), &cfg).expect("valid config");
//!
//! let pyramid = |fill: f64| -> Vec<Tensor> {
//!     [(64_i64, 64_i64), (128, 32), (256, 16)]
//!         .iter()
//!         .map(|&(c, s)| Tensor::full([2, c, s, s], fill, (Kind::Float, Device::Cpu)))
//!         .collect()
//! };
//!
//! let refined = taf
//!     .forward_inference(&pyramid(0.5), &pyramid(-0.5))
//!     .expect("matching shapes");
//! assert_eq!(refined.len(), 3);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod blocks;
pub mod config;
pub mod error;
pub mod extract;
pub mod fusion;
pub mod losses;
pub mod masks;
pub mod taf;

// Convenient re-exports at the crate root.
pub use config::{ActSpec, FusionConfig, NormSpec};
pub use error::{ConfigError, FusionError, FusionResult};
pub use extract::{BackboneBinding, DualStreamExtractor, FeatureSource, FusedFeatures};
pub use losses::DiceBceLoss;
pub use masks::InstanceMasks;
pub use taf::{FusionLevel, TargetAwareFusion, TrainOutput};

/// Crate version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
