//! Inverted residual block (expand → depthwise → linear projection).
//!
//! ```text
//! t ≠ 1:  x ─ 1×1 CBR (in→hidden) ─ 3×3 dw CBR (stride) ─ 1×1 conv+BN (hidden→out) ─┬─ y
//! t = 1:  x ─────────────────────── 3×3 dw CBR (stride) ─ 1×1 conv+BN (hidden→out) ─┤
//!         └──────────────── identity, only if stride = 1 and in = out ──────────────┘
//! ```
//!
//! The projection has no activation: the narrow output would lose
//! information through a ReLU.

use candle_core::{bail, ModuleT, Result, Tensor};
use candle_nn::VarBuilder;

use mbv2_common::MobileNetV2Config;

use crate::conv::{ConvBn, ConvBnReLU, ConvSpec};
use crate::visit::LayerVisitor;

pub struct InvertedResidual {
    in_planes: usize,
    out_planes: usize,
    hidden_dim: usize,
    stride: usize,
    expand_ratio: usize,
    /// 1×1 expansion, absent when `expand_ratio == 1`.
    expand: Option<ConvBnReLU>,
    depthwise: ConvBnReLU,
    project: ConvBn,
    use_res_connect: bool,
}

impl InvertedResidual {
    /// Parameters live under `{vb}.conv.{i}` mirroring the sequential layout:
    /// `conv.0` (expand), `conv.1` (depthwise), `conv.2`/`conv.3` (projection
    /// conv/BN); without expansion the indices shift down by one.
    pub fn new(
        in_planes: usize,
        out_planes: usize,
        stride: usize,
        expand_ratio: usize,
        config: &MobileNetV2Config,
        vb: VarBuilder,
    ) -> Result<Self> {
        if stride != 1 && stride != 2 {
            bail!("inverted residual stride must be 1 or 2, got {stride}");
        }
        if expand_ratio == 0 {
            bail!("inverted residual expand ratio must be positive");
        }

        let hidden_dim = in_planes * expand_ratio;
        let use_res_connect = stride == 1 && in_planes == out_planes;

        let vb = vb.pp("conv");
        let mut idx = 0usize;

        let expand = if expand_ratio != 1 {
            let pw = ConvBnReLU::new(
                ConvSpec::new(in_planes, hidden_dim, 1),
                config,
                vb.pp(idx.to_string()),
            )?;
            idx += 1;
            Some(pw)
        } else {
            None
        };

        let depthwise = ConvBnReLU::new(
            ConvSpec::new(hidden_dim, hidden_dim, 3)
                .stride(stride)
                .groups(hidden_dim),
            config,
            vb.pp(idx.to_string()),
        )?;
        idx += 1;

        let project = ConvBn::new(
            ConvSpec::new(hidden_dim, out_planes, 1),
            config,
            vb.pp(idx.to_string()),
            vb.pp((idx + 1).to_string()),
        )?;

        Ok(Self {
            in_planes,
            out_planes,
            hidden_dim,
            stride,
            expand_ratio,
            expand,
            depthwise,
            project,
            use_res_connect,
        })
    }

    pub fn in_planes(&self) -> usize {
        self.in_planes
    }

    pub fn out_planes(&self) -> usize {
        self.out_planes
    }

    pub fn hidden_dim(&self) -> usize {
        self.hidden_dim
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn expand_ratio(&self) -> usize {
        self.expand_ratio
    }

    /// Whether the identity shortcut is added to the block output.
    pub fn use_res_connect(&self) -> bool {
        self.use_res_connect
    }

    pub fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let h = match &self.expand {
            Some(pw) => pw.forward_t(x, train)?,
            None => x.clone(),
        };
        let h = self.depthwise.forward_t(&h, train)?;
        let h = self.project.forward_t(&h, train)?;
        if self.use_res_connect {
            x.add(&h)
        } else {
            Ok(h)
        }
    }

    pub fn fuse(&self) -> Result<()> {
        if let Some(pw) = &self.expand {
            pw.fuse()?;
        }
        self.depthwise.fuse()?;
        self.project.fuse()
    }

    pub fn clear_fused(&self) {
        if let Some(pw) = &self.expand {
            pw.clear_fused();
        }
        self.depthwise.clear_fused();
        self.project.clear_fused();
    }

    pub fn visit(&self, prefix: &str, v: &mut dyn LayerVisitor) {
        let mut idx = 0usize;
        if let Some(pw) = &self.expand {
            pw.visit(&format!("{prefix}.conv.{idx}"), v);
            idx += 1;
        }
        self.depthwise.visit(&format!("{prefix}.conv.{idx}"), v);
        idx += 1;
        self.project.visit(
            &format!("{prefix}.conv"),
            &idx.to_string(),
            &(idx + 1).to_string(),
            v,
        );
    }
}

impl ModuleT for InvertedResidual {
    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        self.forward_t(x, train)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn build(
        varmap: &VarMap,
        in_planes: usize,
        out_planes: usize,
        stride: usize,
        expand_ratio: usize,
    ) -> Result<InvertedResidual> {
        let vb = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
        InvertedResidual::new(
            in_planes,
            out_planes,
            stride,
            expand_ratio,
            &MobileNetV2Config::default(),
            vb.pp("block"),
        )
    }

    #[test]
    fn shortcut_only_for_stride_one_and_equal_width() {
        let varmap = VarMap::new();
        assert!(build(&varmap, 16, 16, 1, 6).unwrap().use_res_connect());
        let varmap = VarMap::new();
        assert!(!build(&varmap, 16, 16, 2, 6).unwrap().use_res_connect());
        let varmap = VarMap::new();
        assert!(!build(&varmap, 16, 24, 1, 6).unwrap().use_res_connect());
        let varmap = VarMap::new();
        assert!(!build(&varmap, 16, 24, 2, 6).unwrap().use_res_connect());
    }

    #[test]
    fn invalid_stride_is_rejected() {
        let varmap = VarMap::new();
        assert!(build(&varmap, 16, 16, 3, 6).is_err());
        let varmap = VarMap::new();
        assert!(build(&varmap, 16, 16, 0, 6).is_err());
    }

    #[test]
    fn expansion_layout() {
        let varmap = VarMap::new();
        let block = build(&varmap, 8, 16, 2, 6).unwrap();
        assert_eq!(block.hidden_dim(), 48);
        let data = varmap.data().lock().unwrap();
        assert_eq!(data["block.conv.0.0.weight"].as_tensor().dims(), &[48, 8, 1, 1]);
        assert_eq!(data["block.conv.1.0.weight"].as_tensor().dims(), &[48, 1, 3, 3]);
        assert_eq!(data["block.conv.2.weight"].as_tensor().dims(), &[16, 48, 1, 1]);
        assert!(data.contains_key("block.conv.3.running_var"));
    }

    #[test]
    fn no_expansion_layout() {
        let varmap = VarMap::new();
        let block = build(&varmap, 32, 16, 1, 1).unwrap();
        assert_eq!(block.hidden_dim(), 32);
        let data = varmap.data().lock().unwrap();
        assert_eq!(data["block.conv.0.0.weight"].as_tensor().dims(), &[32, 1, 3, 3]);
        assert_eq!(data["block.conv.1.weight"].as_tensor().dims(), &[16, 32, 1, 1]);
        assert!(data.contains_key("block.conv.2.weight"));
        assert!(!data.contains_key("block.conv.3.weight"));
    }

    #[test]
    fn forward_shapes() {
        let dev = Device::Cpu;
        let x = Tensor::randn(0f32, 1.0, (2, 8, 8, 8), &dev).unwrap();

        let varmap = VarMap::new();
        let down = build(&varmap, 8, 16, 2, 6).unwrap();
        assert_eq!(down.forward_t(&x, false).unwrap().dims(), &[2, 16, 4, 4]);

        let varmap = VarMap::new();
        let same = build(&varmap, 8, 8, 1, 6).unwrap();
        assert_eq!(same.forward_t(&x, true).unwrap().dims(), &[2, 8, 8, 8]);
    }

    #[test]
    fn shortcut_adds_input() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let block = build(&varmap, 8, 8, 1, 2).unwrap();
        // Zero the projection BN scale and shift: the branch contributes nothing.
        {
            let data = varmap.data().lock().unwrap();
            for name in ["block.conv.3.weight", "block.conv.3.bias"] {
                data[name].set(&Tensor::zeros(8, DType::F32, &dev).unwrap()).unwrap();
            }
        }
        let x = Tensor::randn(0f32, 1.0, (1, 8, 4, 4), &dev).unwrap();
        let y = block.forward_t(&x, false).unwrap();
        let diff = (y - &x)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-6);
    }
}
