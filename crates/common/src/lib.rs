//! # mbv2-common — Shared Configuration
//!
//! Types shared across every crate in the workspace:
//!
//! * **[`MobileNetV2Config`]** — network hyper-parameters (serialised as JSON).
//! * **[`InvertedResidualSetting`]** — one validated `[t, c, n, s]` stage.
//! * **[`ExecutionMode`]** — float vs quantized execution between the
//!   quantization boundaries.

pub mod config;

pub use config::{
    ExecutionMode, InvertedResidualSetting, MobileNetV2Config, DEFAULT_INVERTED_RESIDUAL_SETTING,
};
