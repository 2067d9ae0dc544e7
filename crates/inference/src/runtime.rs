//! Inference runtime: model directory in, class predictions out.
//!
//! A model directory holds
//!
//! ```text
//! config.json         MobileNetV2Config
//! model.safetensors   weights and BN running statistics
//! quant_params.json   boundary parameters (optional, written by calibration)
//! ```

use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use indicatif::{ProgressBar, ProgressStyle};

use mbv2_common::MobileNetV2Config;
use mbv2_core::{BoundaryParams, MobileNetV2, ParamStats};

use crate::classify::{top_k, Prediction};

pub const CONFIG_FILE: &str = "config.json";
pub const WEIGHTS_FILE: &str = "model.safetensors";
pub const QUANT_PARAMS_FILE: &str = "quant_params.json";

/// Write `config.json` and freshly initialised weights into `dir`.
pub fn init_model_dir(
    dir: &Path,
    config: &MobileNetV2Config,
    device: &Device,
) -> anyhow::Result<ParamStats> {
    std::fs::create_dir_all(dir)?;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
    let model = MobileNetV2::new(vb, config)?;
    config.save(&dir.join(CONFIG_FILE))?;
    varmap.save(dir.join(WEIGHTS_FILE))?;

    let stats = model.param_stats();
    tracing::info!(
        dir = %dir.display(),
        params = stats.total(),
        tensors = varmap.all_vars().len(),
        "Initialised model directory"
    );
    Ok(stats)
}

/// High-level inference runtime.
pub struct InferenceRuntime {
    model: MobileNetV2,
    #[allow(dead_code)]
    varmap: VarMap,
    device: Device,
}

impl InferenceRuntime {
    /// Load config + weights (+ quant params when present) and fold BN for
    /// eval-mode forward.
    pub fn load(model_dir: &Path, device: Device) -> anyhow::Result<Self> {
        let config = MobileNetV2Config::load(&model_dir.join(CONFIG_FILE))?;

        let mut varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = MobileNetV2::new(vb, &config)?;

        let weights = model_dir.join(WEIGHTS_FILE);
        varmap.load(&weights)?;
        tracing::info!(path = %weights.display(), "Loaded weights");

        let quant_path = model_dir.join(QUANT_PARAMS_FILE);
        if quant_path.exists() {
            let json = std::fs::read_to_string(&quant_path)?;
            let params: BoundaryParams = serde_json::from_str(&json)?;
            model.load_quant_params(params);
            tracing::info!(path = %quant_path.display(), "Loaded quantization parameters");
        } else if config.execution == mbv2_common::ExecutionMode::Quantized {
            tracing::warn!(
                path = %quant_path.display(),
                "Quantized execution without calibration data; run calibration first"
            );
        }

        // Pre-compute fused conv weights for fast inference
        model.fuse()?;

        Ok(Self {
            model,
            varmap,
            device,
        })
    }

    pub fn model(&self) -> &MobileNetV2 {
        &self.model
    }

    pub fn config(&self) -> &MobileNetV2Config {
        self.model.config()
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Logits for a `(N, 3, H, W)` batch (a single `(3, H, W)` image is
    /// promoted to a batch of one).
    pub fn logits(&self, images: &Tensor) -> anyhow::Result<Tensor> {
        let images = match images.rank() {
            3 => images.unsqueeze(0)?,
            4 => images.clone(),
            r => anyhow::bail!("expected a (N, 3, H, W) batch, got rank {r}"),
        };
        let images = images.to_device(&self.device)?.to_dtype(DType::F32)?;
        Ok(self.model.forward(&images)?)
    }

    /// Top-`k` predictions per image.
    pub fn classify(&self, images: &Tensor, k: usize) -> anyhow::Result<Vec<Vec<Prediction>>> {
        let logits = self.logits(images)?;
        Ok(top_k(&logits, k)?)
    }

    /// Observe boundary ranges over `batches` and freeze them.
    pub fn calibrate(&self, batches: &[Tensor]) -> anyhow::Result<BoundaryParams> {
        let pb = ProgressBar::new(batches.len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40} {pos}/{len} calibration batches")?
                .progress_chars("=>-"),
        );
        let params = self.model.calibrate(batches.iter().inspect(|_| pb.inc(1)))?;
        pb.finish_and_clear();
        Ok(params)
    }

    /// Write the current boundary parameters to `quant_params.json`.
    pub fn save_quant_params(&self, model_dir: &Path) -> anyhow::Result<BoundaryParams> {
        let Some(params) = self.model.quant_params() else {
            anyhow::bail!("model has not been calibrated");
        };
        let json = serde_json::to_string_pretty(&params)?;
        std::fs::write(model_dir.join(QUANT_PARAMS_FILE), json)?;
        Ok(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(tag: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("mbv2-{tag}-{}", std::process::id()))
    }

    fn tiny_config() -> MobileNetV2Config {
        MobileNetV2Config {
            num_classes: 5,
            width_mult: 0.25,
            inverted_residual_setting: Some(vec![vec![1, 16, 1, 1], vec![6, 24, 1, 2]]),
            ..Default::default()
        }
    }

    #[test]
    fn init_then_load_round_trip() {
        let dir = temp_dir("roundtrip");
        let device = Device::Cpu;
        let stats = init_model_dir(&dir, &tiny_config(), &device).unwrap();
        assert!(stats.total() > 0);
        assert!(dir.join(CONFIG_FILE).exists());
        assert!(dir.join(WEIGHTS_FILE).exists());

        let rt = InferenceRuntime::load(&dir, device.clone()).unwrap();
        assert_eq!(rt.config().num_classes, 5);
        assert_eq!(rt.model().param_stats().total(), stats.total());

        let images = Tensor::randn(0f32, 1.0, (2, 3, 32, 32), &device).unwrap();
        let preds = rt.classify(&images, 3).unwrap();
        assert_eq!(preds.len(), 2);
        assert!(preds.iter().all(|p| p.len() == 3));

        let single = Tensor::randn(0f32, 1.0, (3, 32, 32), &device).unwrap();
        assert_eq!(rt.logits(&single).unwrap().dims(), &[1, 5]);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn loaded_weights_reproduce_saved_model() {
        let dir = temp_dir("reproduce");
        let device = Device::Cpu;
        init_model_dir(&dir, &tiny_config(), &device).unwrap();
        let a = InferenceRuntime::load(&dir, device.clone()).unwrap();
        let b = InferenceRuntime::load(&dir, device.clone()).unwrap();
        let images = Tensor::randn(0f32, 1.0, (1, 3, 32, 32), &device).unwrap();
        let ya: Vec<f32> = a.logits(&images).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        let yb: Vec<f32> = b.logits(&images).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        for (x, y) in ya.iter().zip(yb.iter()) {
            assert!((x - y).abs() < 1e-6);
        }
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn calibrate_and_persist_quant_params() {
        let dir = temp_dir("calibrate");
        let device = Device::Cpu;
        let config = MobileNetV2Config {
            execution: mbv2_common::ExecutionMode::Quantized,
            ..tiny_config()
        };
        init_model_dir(&dir, &config, &device).unwrap();

        let rt = InferenceRuntime::load(&dir, device.clone()).unwrap();
        assert!(rt.save_quant_params(&dir).is_err());
        let batches: Vec<Tensor> = (0..2)
            .map(|_| Tensor::randn(0f32, 1.0, (2, 3, 32, 32), &device).unwrap())
            .collect();
        let params = rt.calibrate(&batches).unwrap();
        assert_eq!(rt.save_quant_params(&dir).unwrap(), params);

        let reloaded = InferenceRuntime::load(&dir, device.clone()).unwrap();
        assert_eq!(reloaded.model().quant_params(), Some(params));
        assert_eq!(reloaded.classify(&batches[0], 1).unwrap().len(), 2);

        std::fs::remove_dir_all(&dir).ok();
    }
}
