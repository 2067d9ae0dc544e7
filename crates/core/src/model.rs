//! MobileNetV2 network assembly.
//!
//! ```text
//! x ─ quant ─ features[stem CBR, inverted residuals…, head CBR] ─ mean(H,W) ─ dropout ─ linear ─ dequant
//! ```
//!
//! Parameter names match torchvision (`features.{i}…`, `classifier.1…`) so
//! exported PyTorch checkpoints load into a [`candle_nn::VarMap`] directly.

use serde::{Deserialize, Serialize};

use candle_core::{ModuleT, Result, Tensor};
use candle_nn::{Dropout, Init, Linear, Module, VarBuilder};

use mbv2_common::{InvertedResidualSetting, MobileNetV2Config};

use crate::conv::{ConvBnReLU, ConvSpec};
use crate::quant::{BoundaryKind, QuantBoundary, QuantParams};
use crate::residual::InvertedResidual;
use crate::rounding::make_divisible;
use crate::visit::{LayerVisitor, ParamStats};

/// Classifier weights: N(0, 0.01), zero bias.
const LINEAR_INIT: Init = Init::Randn {
    mean: 0.,
    stdev: 0.01,
};

const IMAGE_CHANNELS: usize = 3;

// ── Feature blocks ──────────────────────────────────────────────────────────

/// One entry of the `features` trunk.
pub enum FeatureBlock {
    Stem(ConvBnReLU),
    InvertedResidual(InvertedResidual),
    Head(ConvBnReLU),
}

impl FeatureBlock {
    pub fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        match self {
            Self::Stem(b) | Self::Head(b) => b.forward_t(x, train),
            Self::InvertedResidual(b) => b.forward_t(x, train),
        }
    }

    fn fuse(&self) -> Result<()> {
        match self {
            Self::Stem(b) | Self::Head(b) => b.fuse(),
            Self::InvertedResidual(b) => b.fuse(),
        }
    }

    fn clear_fused(&self) {
        match self {
            Self::Stem(b) | Self::Head(b) => b.clear_fused(),
            Self::InvertedResidual(b) => b.clear_fused(),
        }
    }

    fn visit(&self, prefix: &str, v: &mut dyn LayerVisitor) {
        match self {
            Self::Stem(b) | Self::Head(b) => b.visit(prefix, v),
            Self::InvertedResidual(b) => b.visit(prefix, v),
        }
    }

    pub fn summary(&self, index: usize) -> BlockSummary {
        match self {
            Self::Stem(b) | Self::Head(b) => {
                let spec = b.spec();
                BlockSummary {
                    index,
                    kind: if matches!(self, Self::Stem(_)) {
                        BlockKind::Stem
                    } else {
                        BlockKind::Head
                    },
                    in_channels: spec.in_channels,
                    out_channels: spec.out_channels,
                    stride: spec.stride,
                    expand_ratio: None,
                    residual: false,
                }
            }
            Self::InvertedResidual(b) => BlockSummary {
                index,
                kind: BlockKind::InvertedResidual,
                in_channels: b.in_planes(),
                out_channels: b.out_planes(),
                stride: b.stride(),
                expand_ratio: Some(b.expand_ratio()),
                residual: b.use_res_connect(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockKind {
    Stem,
    InvertedResidual,
    Head,
}

/// Static description of one trunk block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSummary {
    pub index: usize,
    pub kind: BlockKind,
    pub in_channels: usize,
    pub out_channels: usize,
    pub stride: usize,
    pub expand_ratio: Option<usize>,
    pub residual: bool,
}

/// Calibrated parameters for both boundaries, persisted as JSON.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundaryParams {
    pub quant: QuantParams,
    pub dequant: QuantParams,
}

// ── MobileNetV2 ─────────────────────────────────────────────────────────────

pub struct MobileNetV2 {
    features: Vec<FeatureBlock>,
    quant: QuantBoundary,
    dequant: QuantBoundary,
    dropout: Dropout,
    classifier: Linear,
    last_channel: usize,
    config: MobileNetV2Config,
}

impl MobileNetV2 {
    /// Build the network. Fresh variables in `vb` are initialised with
    /// Kaiming-normal (fan-out) convs, unit/zero BN and N(0, 0.01) linear
    /// weights; variables already present (loaded checkpoint) are reused.
    pub fn new(vb: VarBuilder, config: &MobileNetV2Config) -> Result<Self> {
        config.validate()?;
        let stages = config.stages()?;

        let r = config.round_nearest;
        let stem_channel = make_divisible(config.input_channel as f64 * config.width_mult, r, None);
        let mut input_channel = stem_channel;
        let last_channel = make_divisible(
            config.last_channel as f64 * config.width_mult.max(1.0),
            r,
            None,
        );

        let fvb = vb.pp("features");
        let mut features = Vec::with_capacity(2 + config.num_blocks()?);

        features.push(FeatureBlock::Stem(ConvBnReLU::new(
            ConvSpec::new(IMAGE_CHANNELS, input_channel, 3).stride(2),
            config,
            fvb.pp("0"),
        )?));

        for &InvertedResidualSetting {
            expand_ratio,
            channels,
            repeats,
            stride,
        } in &stages
        {
            let output_channel = make_divisible(channels as f64 * config.width_mult, r, None);
            for i in 0..repeats {
                let stride = if i == 0 { stride } else { 1 };
                let block = InvertedResidual::new(
                    input_channel,
                    output_channel,
                    stride,
                    expand_ratio,
                    config,
                    fvb.pp(features.len().to_string()),
                )?;
                features.push(FeatureBlock::InvertedResidual(block));
                input_channel = output_channel;
            }
        }

        features.push(FeatureBlock::Head(ConvBnReLU::new(
            ConvSpec::new(input_channel, last_channel, 1),
            config,
            fvb.pp(features.len().to_string()),
        )?));

        let cvb = vb.pp("classifier").pp("1");
        let weight =
            cvb.get_with_hints((config.num_classes, last_channel), "weight", LINEAR_INIT)?;
        let bias = cvb.get_with_hints(config.num_classes, "bias", Init::Const(0.))?;
        let classifier = Linear::new(weight, Some(bias));

        tracing::debug!(
            stem_channel,
            last_channel,
            blocks = features.len(),
            num_classes = config.num_classes,
            execution = ?config.execution,
            "MobileNetV2 built"
        );

        Ok(Self {
            features,
            quant: QuantBoundary::new(BoundaryKind::Quantize, config.execution),
            dequant: QuantBoundary::new(BoundaryKind::Dequantize, config.execution),
            dropout: Dropout::new(config.dropout),
            classifier,
            last_channel,
            config: config.clone(),
        })
    }

    /// Eval-mode forward: `(N, 3, H, W)` → `(N, num_classes)` logits.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.forward_t(x, false)
    }

    /// Forward with an explicit train flag (BN batch statistics, dropout).
    pub fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let mut x = self.quant.forward(x)?;
        for block in &self.features {
            x = block.forward_t(&x, train)?;
        }
        // Spatial mean is always computed on real values.
        let x = x.mean((2, 3))?;
        let x = self.dropout.forward_t(&x, train)?;
        let x = self.classifier.forward(&x)?;
        self.dequant.forward(&x)
    }

    pub fn config(&self) -> &MobileNetV2Config {
        &self.config
    }

    pub fn features(&self) -> &[FeatureBlock] {
        &self.features
    }

    /// Width of the head conv (input to the classifier).
    pub fn last_channel(&self) -> usize {
        self.last_channel
    }

    pub fn num_inverted_residual_blocks(&self) -> usize {
        self.features
            .iter()
            .filter(|b| matches!(b, FeatureBlock::InvertedResidual(_)))
            .count()
    }

    pub fn block_summaries(&self) -> Vec<BlockSummary> {
        self.features
            .iter()
            .enumerate()
            .map(|(i, b)| b.summary(i))
            .collect()
    }

    /// Walk every leaf in declaration order.
    pub fn visit(&self, v: &mut dyn LayerVisitor) {
        v.quant_boundary("quant", &self.quant);
        for (i, block) in self.features.iter().enumerate() {
            block.visit(&format!("features.{i}"), v);
        }
        v.linear("classifier.1", &self.classifier);
        v.quant_boundary("dequant", &self.dequant);
    }

    pub fn param_stats(&self) -> ParamStats {
        let mut stats = ParamStats::default();
        self.visit(&mut stats);
        stats
    }

    // ── Inference fusion ────────────────────────────────────────────────────

    /// Fold every BN into its conv for eval-mode forward.
    pub fn fuse(&self) -> Result<()> {
        for block in &self.features {
            block.fuse()?;
        }
        Ok(())
    }

    /// Drop fused convs (call before training resumes).
    pub fn clear_fused(&self) {
        for block in &self.features {
            block.clear_fused();
        }
    }

    // ── Quantization ────────────────────────────────────────────────────────

    /// Run eval-mode forward over `batches` while both boundaries record the
    /// range of their inputs, then store parameters on both.
    ///
    /// On error both boundaries stop observing and keep whatever parameters
    /// they held before the call.
    pub fn calibrate<'a, I>(&self, batches: I) -> Result<BoundaryParams>
    where
        I: IntoIterator<Item = &'a Tensor>,
    {
        self.visit(&mut StartObserving);
        let observed = (|| -> Result<(usize, BoundaryParams)> {
            let mut seen = 0usize;
            for batch in batches {
                self.forward_t(batch, false)?;
                seen += 1;
            }
            let params = BoundaryParams {
                quant: self.quant.observed_params()?,
                dequant: self.dequant.observed_params()?,
            };
            Ok((seen, params))
        })();
        self.visit(&mut StopObserving);

        let (seen, params) = match observed {
            Ok(observed) => observed,
            Err(err) => {
                tracing::warn!(error = %err, "Calibration aborted");
                return Err(err);
            }
        };
        self.load_quant_params(params);
        tracing::info!(
            batches = seen,
            quant_scale = params.quant.scale,
            quant_zero_point = params.quant.zero_point,
            dequant_scale = params.dequant.scale,
            dequant_zero_point = params.dequant.zero_point,
            "Calibration finished"
        );
        Ok(params)
    }

    pub fn quant_params(&self) -> Option<BoundaryParams> {
        Some(BoundaryParams {
            quant: self.quant.params()?,
            dequant: self.dequant.params()?,
        })
    }

    pub fn load_quant_params(&self, params: BoundaryParams) {
        self.quant.set_params(Some(params.quant));
        self.dequant.set_params(Some(params.dequant));
    }
}

impl ModuleT for MobileNetV2 {
    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        self.forward_t(x, train)
    }
}

/// Puts every quantization boundary into observation mode.
struct StartObserving;

impl LayerVisitor for StartObserving {
    fn quant_boundary(&mut self, name: &str, boundary: &QuantBoundary) {
        tracing::debug!(boundary = name, "observing");
        boundary.start_observing();
    }
}

/// Takes every quantization boundary out of observation mode.
struct StopObserving;

impl LayerVisitor for StopObserving {
    fn quant_boundary(&mut self, _name: &str, boundary: &QuantBoundary) {
        boundary.stop_observing();
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
