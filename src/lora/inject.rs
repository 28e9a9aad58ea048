//! Graph substitution — swap targeted dense layers for adapter layers
//!
//! Each matched `Linear` is moved out of the graph, wrapped in a `LoraLinear`
//! (or a `MergedLoraLinear` when `enable_lora` is set) and put back at the
//! same path. The original layer object does not survive: its weight and
//! bias now live only inside the adapter layer.

use super::config::{BiasPolicy, LoraConfig};
use super::linear::LoraLinear;
use super::merged::MergedLoraLinear;
use crate::error::Result;
use crate::graph::{Activation, Module, ModuleGraph};
use log::{debug, info, warn};
use rand::Rng;

/// What one substitution pass changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InjectionReport {
    /// Paths of the layers now carrying adapters, in graph order
    pub replaced: Vec<String>,
}

impl InjectionReport {
    pub fn is_empty(&self) -> bool {
        self.replaced.is_empty()
    }
}

/// Paths of the dense layers `config` targets, in graph order.
///
/// Fails if any of them can't take the grouped adapter `config` asks for,
/// so a caller can check a whole graph before replacing anything.
pub fn plan_injection<G: ModuleGraph + ?Sized>(graph: &G, config: &LoraConfig) -> Result<Vec<String>> {
    let mut targets = Vec::new();
    for name in graph.named_modules() {
        if !config.is_target(&name) {
            continue;
        }
        match graph.get_submodule(&name) {
            Some(Module::Linear(linear)) => {
                if let Some(mask) = &config.enable_lora {
                    MergedLoraLinear::check_partition(linear.out_features(), mask)?;
                }
                targets.push(name);
            }
            Some(other) => debug!("Skipping '{}': {} is not a dense layer", name, other.kind()),
            None => {}
        }
    }
    Ok(targets)
}

/// Replace every targeted dense layer in `graph`, then freeze everything but
/// the adapter factors (and the biases `config.bias` allows).
pub fn inject_adapters<G: ModuleGraph + ?Sized>(
    graph: &mut G,
    config: &LoraConfig,
    rng: &mut impl Rng,
) -> Result<InjectionReport> {
    let targets = plan_injection(&*graph, config)?;
    let mut report = InjectionReport::default();

    for name in targets {
        let base = match graph.set_submodule(&name, Module::Activation(Activation::Identity))? {
            Module::Linear(linear) => linear,
            other => {
                graph.set_submodule(&name, other)?;
                continue;
            }
        };
        if base.fan_in_fan_out != config.fan_in_fan_out {
            warn!(
                "fan_in_fan_out is {} but '{}' stores its weight as {}; following the layer",
                config.fan_in_fan_out,
                name,
                if base.fan_in_fan_out { "(in, out)" } else { "(out, in)" },
            );
        }
        let adapter: Module = match &config.enable_lora {
            None => LoraLinear::from_config(base, config, rng)?.into(),
            Some(mask) => MergedLoraLinear::from_config(base, config, mask.clone(), rng)?.into(),
        };
        graph.set_submodule(&name, adapter)?;
        debug!("Injected adapter into '{}'", name);
        report.replaced.push(name);
    }

    mark_only_lora_as_trainable(graph, config.bias);

    if report.is_empty() {
        warn!(
            "No modules matched target_modules {:?}; the model has no trainable adapters",
            config.target_modules
        );
    } else {
        info!(
            "Injected rank-{} adapters into {} modules: {:?}",
            config.rank,
            report.replaced.len(),
            report.replaced
        );
    }
    Ok(report)
}

/// Paths of every adapter layer currently in the graph
pub fn adapter_layer_names<G: ModuleGraph + ?Sized>(graph: &G) -> Vec<String> {
    graph
        .named_modules()
        .into_iter()
        .filter(|name| graph.get_submodule(name).is_some_and(Module::is_adapter))
        .collect()
}

/// Whether a parameter belongs to the adapter subset under `bias`
pub fn is_adapter_parameter(name: &str, bias: BiasPolicy, adapter_layers: &[String]) -> bool {
    if name.contains("lora_") {
        return true;
    }
    match bias {
        BiasPolicy::None => false,
        BiasPolicy::All => name == "bias" || name.ends_with(".bias"),
        BiasPolicy::LoraOnly => name
            .strip_suffix(".bias")
            .is_some_and(|layer| adapter_layers.iter().any(|a| a == layer)),
    }
}

/// Freeze every parameter outside the adapter subset
pub fn mark_only_lora_as_trainable<G: ModuleGraph + ?Sized>(graph: &mut G, bias: BiasPolicy) {
    let adapter_layers = adapter_layer_names(&*graph);
    for (name, param) in graph.named_parameters_mut() {
        param.requires_grad = is_adapter_parameter(&name, bias, &adapter_layers);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LoraError;
    use crate::graph::tests::toy_model;
    use crate::graph::{Linear, Model, Sequential};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(9)
    }

    fn config(bias: BiasPolicy) -> LoraConfig {
        LoraConfig {
            rank: 2,
            alpha: 4,
            bias,
            ..LoraConfig::for_targets(["q", "v"])
        }
    }

    #[test]
    fn test_substitution_coverage() {
        let mut model = toy_model(1);
        let report = inject_adapters(&mut model, &config(BiasPolicy::None), &mut rng()).unwrap();
        assert_eq!(report.replaced, vec!["encoder.q", "encoder.v"]);
        assert!(matches!(model.get_submodule("encoder.q"), Some(Module::Lora(_))));
        assert!(matches!(model.get_submodule("encoder.v"), Some(Module::Lora(_))));
        assert!(matches!(model.get_submodule("encoder.k"), Some(Module::Linear(_))));
        assert!(matches!(model.get_submodule("decoder.out"), Some(Module::Linear(_))));
    }

    #[test]
    fn test_weights_are_transplanted() {
        let mut model = toy_model(1);
        let Some(Module::Linear(q)) = model.get_submodule("encoder.q") else {
            panic!("encoder.q should be linear");
        };
        let weight = q.weight.value.clone();
        let bias = q.bias.as_ref().unwrap().value.clone();
        let x = nalgebra::DMatrix::new_random(2, 6);
        let before = model.forward(&x).unwrap();

        inject_adapters(&mut model, &config(BiasPolicy::None), &mut rng()).unwrap();
        let Some(Module::Lora(layer)) = model.get_submodule("encoder.q") else {
            panic!("encoder.q should carry an adapter");
        };
        assert_eq!(layer.base().weight.value, weight);
        assert_eq!(layer.base().bias.as_ref().unwrap().value, bias);
        assert!((model.forward(&x).unwrap() - before).norm() < 1e-12);
    }

    #[test]
    fn test_freeze_invariant() {
        let mut model = toy_model(1);
        inject_adapters(&mut model, &config(BiasPolicy::None), &mut rng()).unwrap();
        let trainable: Vec<String> = model
            .named_parameters()
            .into_iter()
            .filter(|(_, p)| p.requires_grad)
            .map(|(n, _)| n)
            .collect();
        assert_eq!(
            trainable,
            vec![
                "encoder.q.lora_A.weight",
                "encoder.q.lora_B.weight",
                "encoder.v.lora_A.weight",
                "encoder.v.lora_B.weight"
            ]
        );
    }

    #[test]
    fn test_bias_policies() {
        let mut all = toy_model(1);
        inject_adapters(&mut all, &config(BiasPolicy::All), &mut rng()).unwrap();
        let trainable_biases: Vec<String> = all
            .named_parameters()
            .into_iter()
            .filter(|(n, p)| p.requires_grad && n.ends_with(".bias"))
            .map(|(n, _)| n)
            .collect();
        assert_eq!(trainable_biases.len(), 5);

        let mut lora_only = toy_model(1);
        inject_adapters(&mut lora_only, &config(BiasPolicy::LoraOnly), &mut rng()).unwrap();
        let trainable_biases: Vec<String> = lora_only
            .named_parameters()
            .into_iter()
            .filter(|(n, p)| p.requires_grad && n.ends_with(".bias"))
            .map(|(n, _)| n)
            .collect();
        assert_eq!(trainable_biases, vec!["encoder.q.bias", "encoder.v.bias"]);
    }

    #[test]
    fn test_no_match_is_not_an_error() {
        let mut model = toy_model(1);
        let cfg = LoraConfig::for_targets(["nonexistent"]);
        let report = inject_adapters(&mut model, &cfg, &mut rng()).unwrap();
        assert!(report.is_empty());
        assert!(model.named_parameters().iter().all(|(_, p)| !p.requires_grad));
    }

    #[test]
    fn test_non_linear_targets_are_skipped() {
        let mut model = toy_model(1);
        let cfg = LoraConfig::for_targets(["norm", "act"]);
        let report = inject_adapters(&mut model, &cfg, &mut rng()).unwrap();
        assert!(report.is_empty());
        assert!(matches!(model.get_submodule("decoder.norm"), Some(Module::LayerNorm(_))));
    }

    #[test]
    fn test_grouped_injection_and_guard() {
        let mut r = rng();
        let attn = Sequential::new().with("c_attn", Linear::conv1d(4, 12, true, &mut r));
        let mut model = Model::new(Sequential::new().with("attn", attn));
        let cfg = LoraConfig {
            enable_lora: Some(vec![true, false, true]),
            fan_in_fan_out: true,
            ..LoraConfig::for_targets(["c_attn"])
        };
        inject_adapters(&mut model, &cfg, &mut r).unwrap();
        assert!(matches!(model.get_submodule("attn.c_attn"), Some(Module::MergedLora(_))));

        let attn = Sequential::new().with("c_attn", Linear::new(4, 10, true, &mut r));
        let mut bad = Model::new(Sequential::new().with("attn", attn));
        let result = inject_adapters(&mut bad, &cfg, &mut r);
        assert!(matches!(result, Err(LoraError::Configuration(_))));
        // guard runs before the graph is touched
        assert!(matches!(bad.get_submodule("attn.c_attn"), Some(Module::Linear(_))));
    }

    #[test]
    fn test_grouped_guard_covers_every_target() {
        let mut r = rng();
        let block = Sequential::new()
            .with("a_attn", Linear::conv1d(4, 12, true, &mut r))
            .with("b_attn", Linear::conv1d(4, 10, true, &mut r));
        let mut model = Model::new(Sequential::new().with("blk", block));
        let cfg = LoraConfig {
            enable_lora: Some(vec![true, false, true]),
            fan_in_fan_out: true,
            ..LoraConfig::for_targets(["a_attn", "b_attn"])
        };
        assert!(matches!(plan_injection(&model, &cfg), Err(LoraError::Configuration(_))));

        let result = inject_adapters(&mut model, &cfg, &mut r);
        assert!(matches!(result, Err(LoraError::Configuration(_))));
        assert!(matches!(model.get_submodule("blk.a_attn"), Some(Module::Linear(_))));
        assert!(matches!(model.get_submodule("blk.b_attn"), Some(Module::Linear(_))));
        assert!(model.named_parameters().iter().all(|(_, p)| p.requires_grad));
    }

    #[test]
    fn test_plan_lists_dense_targets_only() {
        let model = toy_model(1);
        let cfg = LoraConfig::for_targets(["q", "norm", "out"]);
        assert_eq!(plan_injection(&model, &cfg).unwrap(), vec!["encoder.q", "decoder.out"]);
    }
}
