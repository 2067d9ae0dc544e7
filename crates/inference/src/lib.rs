//! # mbv2-infer — Inference Runtime
//!
//! * **[`InferenceRuntime`]** — load a model directory, fuse, classify.
//! * **[`init_model_dir`]** — write config + freshly initialised weights.
//! * **[`classify`]** — softmax top-k over logits.

pub mod classify;
pub mod runtime;

pub use classify::{argmax, top_k, Prediction};
pub use runtime::{
    init_model_dir, InferenceRuntime, CONFIG_FILE, QUANT_PARAMS_FILE, WEIGHTS_FILE,
};
