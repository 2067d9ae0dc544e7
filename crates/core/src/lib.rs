//! # mbv2-core — The Network Builder
//!
//! MobileNetV2 on candle, ready for post-training quantization:
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`rounding`] | `make_divisible` channel rounding |
//! | [`conv`] | `ConvBn`, `ConvBnReLU`, batch-norm folding |
//! | [`residual`] | `InvertedResidual` |
//! | [`quant`] | `QuantParams`, `MinMaxObserver`, `QuantBoundary` |
//! | [`visit`] | `LayerVisitor`, `ParamStats`, `LayerShapes` |
//! | [`model`] | `MobileNetV2`, `FeatureBlock`, block summaries |
//!
//! ## Design principles
//!
//! 1. **candle does the math.** Every layer is a thin composition of
//!    `candle-nn` primitives; there are no hand-written kernels.
//! 2. **`Send + Sync`-safe.** Fusion and calibration caches use
//!    `parking_lot::Mutex`, not `RefCell`.
//! 3. **Checkpoint-compatible names.** Variable paths follow torchvision's
//!    `features.{i}` / `classifier.1` layout.

pub mod conv;
pub mod model;
pub mod quant;
pub mod residual;
pub mod rounding;
pub mod visit;

// ── Public re-exports ───────────────────────────────────────────────────────

pub use conv::{ConvBn, ConvBnReLU, ConvSpec};
pub use model::{BlockKind, BlockSummary, BoundaryParams, FeatureBlock, MobileNetV2};
pub use quant::{BoundaryKind, MinMaxObserver, QuantBoundary, QuantParams};
pub use residual::InvertedResidual;
pub use rounding::make_divisible;
pub use visit::{LayerShapes, LayerVisitor, ParamStats};
