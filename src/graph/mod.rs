//! Host model graph
//!
//! Adapter injection only needs a narrow view of the host model: enumerate
//! named sub-modules, read one by path, swap one by path, run forward, toggle
//! train/eval and walk parameters. `ModuleGraph` is that view; `Model` is a
//! small tree-structured implementation of it.

mod layers;

pub use layers::{Activation, LayerNorm, Linear, Module, Sequential};

use crate::error::{LoraError, Result};
use crate::tensor::Parameter;
use layers::join_path;
use nalgebra::DMatrix;

/// Capabilities the substitution engine and the adapter facade consume
pub trait ModuleGraph {
    /// Identifier of the pretrained model, if known
    fn name_or_path(&self) -> Option<&str>;

    /// Dotted paths of every sub-module, parents before children
    fn named_modules(&self) -> Vec<String>;

    fn get_submodule(&self, path: &str) -> Option<&Module>;

    /// Put `module` at `path`, returning the module it displaced
    fn set_submodule(&mut self, path: &str, module: Module) -> Result<Module>;

    fn forward(&self, x: &DMatrix<f64>) -> Result<DMatrix<f64>>;

    fn set_training(&mut self, training: bool) -> Result<()>;

    fn named_parameters(&self) -> Vec<(String, &Parameter)>;

    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Parameter)>;
}

/// A tree of named modules run as one sequential stack
#[derive(Debug, Clone)]
pub struct Model {
    name_or_path: Option<String>,
    root: Sequential,
}

impl Model {
    pub fn new(root: Sequential) -> Self {
        Self { name_or_path: None, root }
    }

    pub fn with_name(mut self, name_or_path: impl Into<String>) -> Self {
        self.name_or_path = Some(name_or_path.into());
        self
    }

    pub fn root(&self) -> &Sequential {
        &self.root
    }

    fn parent_mut(&mut self, parent_path: &str) -> Option<&mut Sequential> {
        if parent_path.is_empty() {
            return Some(&mut self.root);
        }
        let mut node = &mut self.root;
        for segment in parent_path.split('.') {
            match node.child_mut(segment)? {
                Module::Sequential(seq) => node = seq,
                _ => return None,
            }
        }
        Some(node)
    }
}

fn collect_names(seq: &Sequential, prefix: &str, out: &mut Vec<String>) {
    for (name, child) in seq.children() {
        let path = join_path(prefix, name);
        out.push(path.clone());
        if let Module::Sequential(inner) = child {
            collect_names(inner, &path, out);
        }
    }
}

impl ModuleGraph for Model {
    fn name_or_path(&self) -> Option<&str> {
        self.name_or_path.as_deref()
    }

    fn named_modules(&self) -> Vec<String> {
        let mut names = Vec::new();
        collect_names(&self.root, "", &mut names);
        names
    }

    fn get_submodule(&self, path: &str) -> Option<&Module> {
        let mut segments = path.split('.');
        let mut node = self.root.child(segments.next()?)?;
        for segment in segments {
            match node {
                Module::Sequential(seq) => node = seq.child(segment)?,
                _ => return None,
            }
        }
        Some(node)
    }

    fn set_submodule(&mut self, path: &str, module: Module) -> Result<Module> {
        let (parent_path, child_name) = match path.rsplit_once('.') {
            Some((parent, child)) => (parent, child),
            None => ("", path),
        };
        let slot = self
            .parent_mut(parent_path)
            .and_then(|parent| parent.child_mut(child_name))
            .ok_or_else(|| LoraError::ModuleNotFound(path.to_string()))?;
        Ok(std::mem::replace(slot, module))
    }

    fn forward(&self, x: &DMatrix<f64>) -> Result<DMatrix<f64>> {
        self.root.forward(x)
    }

    fn set_training(&mut self, training: bool) -> Result<()> {
        for (_, child) in self.root.children_mut() {
            child.set_training(training)?;
        }
        Ok(())
    }

    fn named_parameters(&self) -> Vec<(String, &Parameter)> {
        let mut params = Vec::new();
        for (name, child) in self.root.children() {
            child.collect_parameters(name, &mut params);
        }
        params
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Parameter)> {
        let mut params = Vec::new();
        for (name, child) in self.root.children_mut() {
            child.collect_parameters_mut(name, &mut params);
        }
        params
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    /// `encoder.{q,k,v}` followed by `decoder.out`, all 6→6 with bias
    pub(crate) fn toy_model(seed: u64) -> Model {
        let mut rng = StdRng::seed_from_u64(seed);
        let encoder = Sequential::new()
            .with("q", Linear::new(6, 6, true, &mut rng))
            .with("k", Linear::new(6, 6, true, &mut rng))
            .with("v", Linear::new(6, 6, true, &mut rng))
            .with("act", Activation::Tanh);
        let decoder = Sequential::new()
            .with("norm", LayerNorm::new(6))
            .with("out", Linear::new(6, 6, true, &mut rng));
        Model::new(Sequential::new().with("encoder", encoder).with("decoder", decoder))
            .with_name("toy/encoder-decoder")
    }

    #[test]
    fn test_named_modules_order() {
        let model = toy_model(0);
        assert_eq!(
            model.named_modules(),
            vec![
                "encoder",
                "encoder.q",
                "encoder.k",
                "encoder.v",
                "encoder.act",
                "decoder",
                "decoder.norm",
                "decoder.out"
            ]
        );
    }

    #[test]
    fn test_get_submodule() {
        let model = toy_model(0);
        assert!(matches!(model.get_submodule("encoder.q"), Some(Module::Linear(_))));
        assert!(matches!(model.get_submodule("decoder"), Some(Module::Sequential(_))));
        assert!(model.get_submodule("encoder.q.weight").is_none());
        assert!(model.get_submodule("missing").is_none());
    }

    #[test]
    fn test_set_submodule_returns_displaced() {
        let mut model = toy_model(0);
        let old = model
            .set_submodule("encoder.k", Module::Activation(Activation::Identity))
            .unwrap();
        assert!(matches!(old, Module::Linear(_)));
        assert!(matches!(
            model.get_submodule("encoder.k"),
            Some(Module::Activation(Activation::Identity))
        ));
        let missing = model.set_submodule("encoder.z", Module::Activation(Activation::Relu));
        assert!(matches!(missing, Err(LoraError::ModuleNotFound(_))));
    }

    #[test]
    fn test_forward_and_parameters() {
        let model = toy_model(0);
        let y = model.forward(&DMatrix::new_random(3, 6)).unwrap();
        assert_eq!(y.shape(), (3, 6));
        let names: Vec<String> = model.named_parameters().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names.len(), 10);
        assert!(names.contains(&"decoder.norm.bias".to_string()));
    }
}
