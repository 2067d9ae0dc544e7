//! Convolution + batch-norm primitives.
//!
//! * [`ConvBn`] — bias-free conv followed by batch-norm (the linear
//!   projection at the end of every inverted residual block).
//! * [`ConvBnReLU`] — the same pair with a trailing ReLU; stem, head,
//!   expansion and depthwise stages all use it.
//!
//! Parameter names follow the `nn.Sequential` layout used by torchvision
//! checkpoints, so the caller hands in one [`VarBuilder`] per sub-layer.
//!
//! # Fusion
//!
//! [`ConvBn::fuse`] folds the batch-norm statistics into the convolution:
//!
//! ```text
//! k  = γ / √(σ² + ε)
//! W' = W · k        (per output channel)
//! b' = β − μ · k
//! ```
//!
//! The fused conv lives in a [`parking_lot::Mutex`] cache and is only used
//! by eval-mode forward. Training always runs conv → BN so the running
//! statistics keep updating.

use parking_lot::Mutex;

use candle_core::{bail, Module, ModuleT, Result, Tensor};
use candle_nn::init::{FanInOut, NonLinearity, NormalOrUniform};
use candle_nn::{BatchNorm, BatchNormConfig, Conv2d, Conv2dConfig, Init, VarBuilder};

use mbv2_common::MobileNetV2Config;

use crate::visit::LayerVisitor;

/// Kaiming-normal, fan-out mode, ReLU gain. Conv layers carry no bias.
const CONV_INIT: Init = Init::Kaiming {
    dist: NormalOrUniform::Normal,
    fan: FanInOut::FanOut,
    non_linearity: NonLinearity::ReLU,
};

/// Shape of a single convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvSpec {
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel_size: usize,
    pub stride: usize,
    pub groups: usize,
}

impl ConvSpec {
    pub fn new(in_channels: usize, out_channels: usize, kernel_size: usize) -> Self {
        Self {
            in_channels,
            out_channels,
            kernel_size,
            stride: 1,
            groups: 1,
        }
    }

    pub fn stride(mut self, stride: usize) -> Self {
        self.stride = stride;
        self
    }

    pub fn groups(mut self, groups: usize) -> Self {
        self.groups = groups;
        self
    }

    /// Same-style padding for odd kernels.
    pub fn padding(&self) -> usize {
        self.kernel_size.saturating_sub(1) / 2
    }

    fn conv_config(&self) -> Conv2dConfig {
        Conv2dConfig {
            padding: self.padding(),
            stride: self.stride,
            dilation: 1,
            groups: self.groups,
            ..Default::default()
        }
    }
}

// ── ConvBn ──────────────────────────────────────────────────────────────────

/// Conv2d (no bias) → BatchNorm2d.
pub struct ConvBn {
    spec: ConvSpec,
    conv: Conv2d,
    bn: BatchNorm,
    /// Inference cache: BN folded into the conv by [`ConvBn::fuse`].
    fused: Mutex<Option<Conv2d>>,
}

impl ConvBn {
    pub fn new(
        spec: ConvSpec,
        config: &MobileNetV2Config,
        conv_vb: VarBuilder,
        bn_vb: VarBuilder,
    ) -> Result<Self> {
        if spec.kernel_size == 0 || spec.kernel_size % 2 == 0 {
            bail!("kernel size must be odd, got {}", spec.kernel_size);
        }
        if spec.groups == 0
            || spec.in_channels % spec.groups != 0
            || spec.out_channels % spec.groups != 0
        {
            bail!(
                "channels {} -> {} are not divisible into {} groups",
                spec.in_channels,
                spec.out_channels,
                spec.groups
            );
        }

        let k = spec.kernel_size;
        let ws = conv_vb.get_with_hints(
            (spec.out_channels, spec.in_channels / spec.groups, k, k),
            "weight",
            CONV_INIT,
        )?;
        let conv = Conv2d::new(ws, None, spec.conv_config());

        let bn = candle_nn::batch_norm(
            spec.out_channels,
            BatchNormConfig {
                eps: config.bn_eps,
                remove_mean: true,
                affine: true,
                momentum: config.bn_momentum,
            },
            bn_vb,
        )?;

        Ok(Self {
            spec,
            conv,
            bn,
            fused: Mutex::new(None),
        })
    }

    pub fn spec(&self) -> &ConvSpec {
        &self.spec
    }

    pub fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        if !train {
            let guard = self.fused.lock();
            if let Some(ref fused) = *guard {
                return fused.forward(x);
            }
        }
        let x = self.conv.forward(x)?;
        self.bn.forward_t(&x, train)
    }

    /// Fold the current BN statistics into a biased conv for eval-mode forward.
    pub fn fuse(&self) -> Result<()> {
        let Some((gamma, beta)) = self.bn.weight_and_bias() else {
            bail!("cannot fuse a batch-norm without affine parameters");
        };
        let std = self.bn.running_var().affine(1.0, self.bn.eps())?.sqrt()?;
        let scale = gamma.div(&std)?;
        let weight = self
            .conv
            .weight()
            .broadcast_mul(&scale.reshape((self.spec.out_channels, 1, 1, 1))?)?;
        let bias = beta.sub(&self.bn.running_mean().mul(&scale)?)?;
        let fused = Conv2d::new(weight, Some(bias), *self.conv.config());
        self.fused.lock().replace(fused);
        Ok(())
    }

    /// Drop the fused conv (call before training resumes).
    pub fn clear_fused(&self) {
        self.fused.lock().take();
    }

    pub fn is_fused(&self) -> bool {
        self.fused.lock().is_some()
    }

    pub fn visit(&self, prefix: &str, conv_name: &str, bn_name: &str, v: &mut dyn LayerVisitor) {
        v.conv(&format!("{prefix}.{conv_name}"), &self.conv);
        v.batch_norm(&format!("{prefix}.{bn_name}"), &self.bn);
    }
}

// ── ConvBnReLU ──────────────────────────────────────────────────────────────

/// Conv2d (no bias) → BatchNorm2d → ReLU, stored as `{prefix}.0` / `{prefix}.1`.
pub struct ConvBnReLU {
    inner: ConvBn,
}

impl ConvBnReLU {
    pub fn new(spec: ConvSpec, config: &MobileNetV2Config, vb: VarBuilder) -> Result<Self> {
        let inner = ConvBn::new(spec, config, vb.pp("0"), vb.pp("1"))?;
        Ok(Self { inner })
    }

    pub fn spec(&self) -> &ConvSpec {
        self.inner.spec()
    }

    pub fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        self.inner.forward_t(x, train)?.relu()
    }

    pub fn fuse(&self) -> Result<()> {
        self.inner.fuse()
    }

    pub fn clear_fused(&self) {
        self.inner.clear_fused()
    }

    pub fn is_fused(&self) -> bool {
        self.inner.is_fused()
    }

    pub fn visit(&self, prefix: &str, v: &mut dyn LayerVisitor) {
        self.inner.visit(prefix, "0", "1", v)
    }
}

impl ModuleT for ConvBnReLU {
    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        self.forward_t(x, train)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
