//! Building blocks of the reference host graph

use crate::error::{LoraError, Result};
use crate::lora::{LoraLinear, MergedLoraLinear};
use crate::tensor::{self, Parameter};
use nalgebra::DMatrix;
use rand::Rng;

/// Dense projection. `fan_in_fan_out` marks `(in, out)` weight storage, the
/// layout of GPT-2 style `Conv1D` projections.
#[derive(Debug, Clone)]
pub struct Linear {
    pub weight: Parameter,
    pub bias: Option<Parameter>,
    pub fan_in_fan_out: bool,
}

impl Linear {
    /// `(out, in)` layer with fan-in uniform weight and bias
    pub fn new(in_features: usize, out_features: usize, bias: bool, rng: &mut impl Rng) -> Self {
        let weight = tensor::kaiming_uniform(out_features, in_features, rng);
        let bias = bias.then(|| {
            let bound = 1.0 / (in_features.max(1) as f64).sqrt();
            Parameter::new(DMatrix::from_fn(out_features, 1, |_, _| rng.gen_range(-bound..=bound)))
        });
        Self { weight: Parameter::new(weight), bias, fan_in_fan_out: false }
    }

    /// Same projection stored as `(in, out)`
    pub fn conv1d(in_features: usize, out_features: usize, bias: bool, rng: &mut impl Rng) -> Self {
        let mut layer = Self::new(in_features, out_features, bias, rng);
        layer.weight.value = layer.weight.value.transpose();
        layer.fan_in_fan_out = true;
        layer
    }

    /// Wrap existing tensors; `bias` is an `(out, 1)` column
    pub fn from_weights(
        weight: DMatrix<f64>,
        bias: Option<DMatrix<f64>>,
        fan_in_fan_out: bool,
    ) -> Result<Self> {
        let out_features = if fan_in_fan_out { weight.ncols() } else { weight.nrows() };
        if let Some(b) = &bias {
            if b.shape() != (out_features, 1) {
                return Err(LoraError::shape("linear bias", (out_features, 1), b.shape()));
            }
        }
        Ok(Self {
            weight: Parameter::new(weight),
            bias: bias.map(Parameter::new),
            fan_in_fan_out,
        })
    }

    pub fn in_features(&self) -> usize {
        if self.fan_in_fan_out {
            self.weight.value.nrows()
        } else {
            self.weight.value.ncols()
        }
    }

    pub fn out_features(&self) -> usize {
        if self.fan_in_fan_out {
            self.weight.value.ncols()
        } else {
            self.weight.value.nrows()
        }
    }

    pub fn forward(&self, x: &DMatrix<f64>) -> Result<DMatrix<f64>> {
        tensor::linear(
            x,
            &self.weight.value,
            self.bias.as_ref().map(|b| &b.value),
            self.fan_in_fan_out,
        )
    }

    pub(crate) fn parameters(&self) -> Vec<(&'static str, &Parameter)> {
        let mut params = vec![("weight", &self.weight)];
        if let Some(b) = &self.bias {
            params.push(("bias", b));
        }
        params
    }

    pub(crate) fn parameters_mut(&mut self) -> Vec<(&'static str, &mut Parameter)> {
        let mut params = vec![("weight", &mut self.weight)];
        if let Some(b) = &mut self.bias {
            params.push(("bias", b));
        }
        params
    }
}

/// Row-wise layer normalization with affine weight and bias
#[derive(Debug, Clone)]
pub struct LayerNorm {
    pub weight: Parameter,
    pub bias: Parameter,
    pub eps: f64,
}

impl LayerNorm {
    pub fn new(dim: usize) -> Self {
        Self {
            weight: Parameter::new(DMatrix::from_element(dim, 1, 1.0)),
            bias: Parameter::new(DMatrix::zeros(dim, 1)),
            eps: 1e-5,
        }
    }

    pub fn forward(&self, x: &DMatrix<f64>) -> Result<DMatrix<f64>> {
        let dim = self.weight.value.nrows();
        if x.ncols() != dim {
            return Err(LoraError::shape("layer norm input", (x.nrows(), dim), x.shape()));
        }
        let mut y = x.clone();
        for mut row in y.row_iter_mut() {
            let mean = row.mean();
            let var = row.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / dim as f64;
            let denom = (var + self.eps).sqrt();
            for (j, v) in row.iter_mut().enumerate() {
                *v = (*v - mean) / denom * self.weight.value[(j, 0)] + self.bias.value[(j, 0)];
            }
        }
        Ok(y)
    }
}

/// Parameter-free elementwise nonlinearity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Identity,
    Relu,
    Tanh,
    /// tanh approximation
    Gelu,
}

impl Activation {
    pub fn forward(&self, x: &DMatrix<f64>) -> DMatrix<f64> {
        match self {
            Activation::Identity => x.clone(),
            Activation::Relu => x.map(|v| v.max(0.0)),
            Activation::Tanh => x.map(f64::tanh),
            Activation::Gelu => x.map(|v| {
                let c = (2.0 / std::f64::consts::PI).sqrt();
                0.5 * v * (1.0 + (c * (v + 0.044715 * v.powi(3))).tanh())
            }),
        }
    }
}

/// Ordered, named children applied one after another
#[derive(Debug, Clone, Default)]
pub struct Sequential {
    children: Vec<(String, Module)>,
}

impl Sequential {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a child; names are path segments and must not contain `.`
    pub fn with(mut self, name: impl Into<String>, module: impl Into<Module>) -> Self {
        self.push(name, module);
        self
    }

    pub fn push(&mut self, name: impl Into<String>, module: impl Into<Module>) {
        let name = name.into();
        debug_assert!(!name.contains('.'), "child name '{}' contains '.'", name);
        self.children.push((name, module.into()));
    }

    pub fn children(&self) -> impl Iterator<Item = (&str, &Module)> {
        self.children.iter().map(|(n, m)| (n.as_str(), m))
    }

    pub fn child(&self, name: &str) -> Option<&Module> {
        self.children.iter().find(|(n, _)| n == name).map(|(_, m)| m)
    }

    pub fn child_mut(&mut self, name: &str) -> Option<&mut Module> {
        self.children.iter_mut().find(|(n, _)| n == name).map(|(_, m)| m)
    }

    pub fn forward(&self, x: &DMatrix<f64>) -> Result<DMatrix<f64>> {
        let mut h = x.clone();
        for (_, child) in &self.children {
            h = child.forward(&h)?;
        }
        Ok(h)
    }

    pub(crate) fn children_mut(&mut self) -> impl Iterator<Item = (&str, &mut Module)> {
        self.children.iter_mut().map(|(n, m)| (n.as_str(), m))
    }
}

/// A node of the host graph
#[derive(Debug, Clone)]
pub enum Module {
    Linear(Linear),
    Lora(LoraLinear),
    MergedLora(MergedLoraLinear),
    LayerNorm(LayerNorm),
    Activation(Activation),
    Sequential(Sequential),
}

impl Module {
    pub fn kind(&self) -> &'static str {
        match self {
            Module::Linear(_) => "Linear",
            Module::Lora(_) => "LoraLinear",
            Module::MergedLora(_) => "MergedLoraLinear",
            Module::LayerNorm(_) => "LayerNorm",
            Module::Activation(_) => "Activation",
            Module::Sequential(_) => "Sequential",
        }
    }

    /// Whether this node is an injected adapter layer
    pub fn is_adapter(&self) -> bool {
        matches!(self, Module::Lora(_) | Module::MergedLora(_))
    }

    pub fn forward(&self, x: &DMatrix<f64>) -> Result<DMatrix<f64>> {
        match self {
            Module::Linear(m) => m.forward(x),
            Module::Lora(m) => m.forward(x),
            Module::MergedLora(m) => m.forward(x),
            Module::LayerNorm(m) => m.forward(x),
            Module::Activation(m) => Ok(m.forward(x)),
            Module::Sequential(m) => m.forward(x),
        }
    }

    /// Propagate train/eval mode; adapter layers merge or unmerge here
    pub fn set_training(&mut self, training: bool) -> Result<()> {
        match self {
            Module::Lora(m) => m.set_training(training),
            Module::MergedLora(m) => m.set_training(training),
            Module::Sequential(m) => {
                for (_, child) in m.children_mut() {
                    child.set_training(training)?;
                }
                Ok(())
            }
            Module::Linear(_) | Module::LayerNorm(_) | Module::Activation(_) => Ok(()),
        }
    }

    pub(crate) fn collect_parameters<'a>(
        &'a self,
        prefix: &str,
        out: &mut Vec<(String, &'a Parameter)>,
    ) {
        let local: Vec<(&str, &Parameter)> = match self {
            Module::Linear(m) => m.parameters(),
            Module::Lora(m) => m.parameters(),
            Module::MergedLora(m) => m.parameters(),
            Module::LayerNorm(m) => vec![("weight", &m.weight), ("bias", &m.bias)],
            Module::Activation(_) => Vec::new(),
            Module::Sequential(m) => {
                for (name, child) in m.children() {
                    child.collect_parameters(&join_path(prefix, name), out);
                }
                Vec::new()
            }
        };
        out.extend(local.into_iter().map(|(n, p)| (join_path(prefix, n), p)));
    }

    pub(crate) fn collect_parameters_mut<'a>(
        &'a mut self,
        prefix: &str,
        out: &mut Vec<(String, &'a mut Parameter)>,
    ) {
        let local: Vec<(&str, &mut Parameter)> = match self {
            Module::Linear(m) => m.parameters_mut(),
            Module::Lora(m) => m.parameters_mut(),
            Module::MergedLora(m) => m.parameters_mut(),
            Module::LayerNorm(m) => vec![("weight", &mut m.weight), ("bias", &mut m.bias)],
            Module::Activation(_) => Vec::new(),
            Module::Sequential(m) => {
                for (name, child) in m.children_mut() {
                    child.collect_parameters_mut(&join_path(prefix, name), out);
                }
                Vec::new()
            }
        };
        out.extend(local.into_iter().map(|(n, p)| (join_path(prefix, n), p)));
    }
}

pub(crate) fn join_path(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", prefix, name)
    }
}

impl From<Linear> for Module {
    fn from(m: Linear) -> Self {
        Module::Linear(m)
    }
}

impl From<LoraLinear> for Module {
    fn from(m: LoraLinear) -> Self {
        Module::Lora(m)
    }
}

impl From<MergedLoraLinear> for Module {
    fn from(m: MergedLoraLinear) -> Self {
        Module::MergedLora(m)
    }
}

impl From<LayerNorm> for Module {
    fn from(m: LayerNorm) -> Self {
        Module::LayerNorm(m)
    }
}

impl From<Activation> for Module {
    fn from(m: Activation) -> Self {
        Module::Activation(m)
    }
}

impl From<Sequential> for Module {
    fn from(m: Sequential) -> Self {
        Module::Sequential(m)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_conv1d_matches_linear() {
        let mut rng = StdRng::seed_from_u64(1);
        let dense = Linear::new(4, 3, true, &mut rng);
        let conv = Linear::from_weights(
            dense.weight.value.transpose(),
            dense.bias.as_ref().map(|b| b.value.clone()),
            true,
        )
        .unwrap();
        assert_eq!(conv.in_features(), 4);
        assert_eq!(conv.out_features(), 3);

        let x = DMatrix::new_random(2, 4);
        let diff = dense.forward(&x).unwrap() - conv.forward(&x).unwrap();
        assert!(diff.norm() < 1e-12);
    }

    #[test]
    fn test_from_weights_checks_bias() {
        let result = Linear::from_weights(DMatrix::zeros(3, 2), Some(DMatrix::zeros(2, 1)), false);
        assert!(result.is_err());
    }

    #[test]
    fn test_layer_norm_normalizes_rows() {
        let ln = LayerNorm::new(4);
        let x = DMatrix::from_row_slice(1, 4, &[1.0, 2.0, 3.0, 4.0]);
        let y = ln.forward(&x).unwrap();
        assert!(y.row(0).mean().abs() < 1e-12);
    }

    #[test]
    fn test_sequential_parameter_names() {
        let mut rng = StdRng::seed_from_u64(2);
        let block = Sequential::new()
            .with("proj", Linear::new(2, 2, true, &mut rng))
            .with("act", Activation::Relu)
            .with("norm", LayerNorm::new(2));
        let module = Module::from(Sequential::new().with("block", block));
        let mut params = Vec::new();
        module.collect_parameters("", &mut params);
        let names: Vec<&str> = params.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(
            names,
            vec!["block.proj.weight", "block.proj.bias", "block.norm.weight", "block.norm.bias"]
        );
    }
}
