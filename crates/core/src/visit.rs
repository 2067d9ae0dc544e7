//! Structural traversal of the module tree.
//!
//! Every block exposes `visit(prefix, visitor)` and reports its leaves by
//! kind. Callers dispatch on the callback that fires instead of inspecting
//! types at runtime.

use candle_core::Tensor;
use candle_nn::{BatchNorm, Conv2d, Linear};

use crate::quant::QuantBoundary;

/// Callbacks for each leaf kind. All default to no-ops.
pub trait LayerVisitor {
    fn conv(&mut self, _name: &str, _conv: &Conv2d) {}
    fn batch_norm(&mut self, _name: &str, _bn: &BatchNorm) {}
    fn linear(&mut self, _name: &str, _linear: &Linear) {}
    fn quant_boundary(&mut self, _name: &str, _boundary: &QuantBoundary) {}
}

/// Trainable parameter counts (running statistics excluded).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParamStats {
    pub conv_params: usize,
    pub norm_params: usize,
    pub linear_params: usize,
    pub num_convs: usize,
    pub num_norms: usize,
    pub num_linears: usize,
}

impl ParamStats {
    pub fn total(&self) -> usize {
        self.conv_params + self.norm_params + self.linear_params
    }
}

impl LayerVisitor for ParamStats {
    fn conv(&mut self, _name: &str, conv: &Conv2d) {
        self.num_convs += 1;
        self.conv_params += conv.weight().elem_count();
        self.conv_params += conv.bias().map_or(0, |b| b.elem_count());
    }

    fn batch_norm(&mut self, _name: &str, bn: &BatchNorm) {
        self.num_norms += 1;
        if let Some((w, b)) = bn.weight_and_bias() {
            self.norm_params += w.elem_count() + b.elem_count();
        }
    }

    fn linear(&mut self, _name: &str, linear: &Linear) {
        self.num_linears += 1;
        self.linear_params += linear.weight().elem_count();
        self.linear_params += linear.bias().map_or(0, |b| b.elem_count());
    }
}

/// Collects `(name, shape)` for every stored tensor of each leaf, in
/// traversal order: conv and linear weight (and bias when present),
/// batch-norm weight, bias, running mean and running variance.
#[derive(Debug, Default)]
pub struct LayerShapes {
    pub entries: Vec<(String, Vec<usize>)>,
}

impl LayerShapes {
    fn push(&mut self, name: &str, field: &str, t: &Tensor) {
        self.entries.push((format!("{name}.{field}"), t.dims().to_vec()));
    }
}

impl LayerVisitor for LayerShapes {
    fn conv(&mut self, name: &str, conv: &Conv2d) {
        self.push(name, "weight", conv.weight());
        if let Some(b) = conv.bias() {
            self.push(name, "bias", b);
        }
    }

    fn batch_norm(&mut self, name: &str, bn: &BatchNorm) {
        if let Some((w, b)) = bn.weight_and_bias() {
            self.push(name, "weight", w);
            self.push(name, "bias", b);
        }
        self.push(name, "running_mean", bn.running_mean());
        self.push(name, "running_var", bn.running_var());
    }

    fn linear(&mut self, name: &str, linear: &Linear) {
        self.push(name, "weight", linear.weight());
        if let Some(b) = linear.bias() {
            self.push(name, "bias", b);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::{VarBuilder, VarMap};

    #[test]
    fn shapes_cover_every_stored_tensor() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let bn = candle_nn::batch_norm(4, candle_nn::BatchNormConfig::default(), vb.pp("bn"))
            .unwrap();
        let linear = candle_nn::linear(4, 2, vb.pp("fc")).unwrap();

        let mut shapes = LayerShapes::default();
        shapes.batch_norm("bn", &bn);
        shapes.linear("fc", &linear);

        let names: Vec<&str> = shapes.entries.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "bn.weight",
                "bn.bias",
                "bn.running_mean",
                "bn.running_var",
                "fc.weight",
                "fc.bias",
            ]
        );
        assert_eq!(shapes.entries[4].1, vec![2, 4]);

        // Every recorded name is a tensor in the var map.
        let data = varmap.data().lock().unwrap();
        for name in names {
            assert!(data.contains_key(name), "{name}");
        }
    }
}
