//! LoRA model — a host graph with adapters injected
//!
//! Construction runs the substitution pass once. Afterwards the facade
//! forwards computation and parameter access to the wrapped graph, tracks
//! train/eval mode and saves or loads the adapter-only weights.

use super::config::LoraConfig;
use super::inject::{adapter_layer_names, inject_adapters, is_adapter_parameter, plan_injection};
use crate::error::{LoraError, Result};
use crate::graph::ModuleGraph;
use crate::runtime::Capabilities;
use crate::storage::{self, ArtifactSource, StateDict, WEIGHTS_NAME};
use crate::tensor::Parameter;
use log::{info, warn};
use nalgebra::DMatrix;
use rand::Rng;
use std::collections::HashMap;
use std::path::Path;

/// Train/eval mode of the whole model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Train,
    Eval,
}

/// Outcome of overlaying stored tensors onto the model
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub loaded: Vec<String>,
    /// Stored names that don't exist in the model; ignored
    pub unexpected: Vec<String>,
}

pub struct LoraModel<G: ModuleGraph> {
    config: LoraConfig,
    model: G,
    mode: Mode,
    adapters: Vec<String>,
}

impl<G: ModuleGraph> LoraModel<G> {
    /// Everything construction can reject, checked against a borrowed graph.
    ///
    /// `new` consumes the graph and drops it on error; call this first to
    /// keep the graph when the build would fail.
    pub fn preflight(config: &LoraConfig, model: &G, capabilities: Capabilities) -> Result<()> {
        capabilities.require_low_rank()?;
        config.validate()?;
        plan_injection(model, config)?;
        Ok(())
    }

    pub fn new(config: LoraConfig, model: G, capabilities: Capabilities) -> Result<Self> {
        Self::with_rng(config, model, capabilities, &mut rand::thread_rng())
    }

    /// Like `new`, drawing adapter initialization from `rng`
    pub fn with_rng(
        config: LoraConfig,
        mut model: G,
        capabilities: Capabilities,
        rng: &mut impl Rng,
    ) -> Result<Self> {
        Self::preflight(&config, &model, capabilities)?;
        let report = inject_adapters(&mut model, &config, rng)?;
        model.set_training(true)?;
        Ok(Self {
            config,
            model,
            mode: Mode::Train,
            adapters: report.replaced,
        })
    }

    pub fn config(&self) -> &LoraConfig {
        &self.config
    }

    pub fn model(&self) -> &G {
        &self.model
    }

    /// Direct access to the wrapped graph; mode bookkeeping is the caller's
    /// responsibility when toggling layers through it.
    pub fn model_mut(&mut self) -> &mut G {
        &mut self.model
    }

    pub fn into_inner(self) -> G {
        self.model
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Paths of the layers that received adapters
    pub fn adapter_names(&self) -> &[String] {
        &self.adapters
    }

    pub fn forward(&self, x: &DMatrix<f64>) -> Result<DMatrix<f64>> {
        self.model.forward(x)
    }

    /// Enter training mode; merged adapters are split back out
    pub fn train(&mut self) -> Result<()> {
        self.model.set_training(true)?;
        self.mode = Mode::Train;
        Ok(())
    }

    /// Enter inference mode; with `merge_weights`, adapters are fused
    pub fn eval(&mut self) -> Result<()> {
        self.model.set_training(false)?;
        self.mode = Mode::Eval;
        Ok(())
    }

    pub fn named_parameters(&self) -> Vec<(String, &Parameter)> {
        self.model.named_parameters()
    }

    /// `(trainable, total)` scalar parameter counts
    pub fn trainable_parameter_counts(&self) -> (usize, usize) {
        self.model
            .named_parameters()
            .iter()
            .fold((0, 0), |(trainable, total), (_, p)| {
                let n = p.numel();
                (trainable + if p.requires_grad { n } else { 0 }, total + n)
            })
    }

    pub fn print_trainable_parameters(&self) {
        let (trainable, total) = self.trainable_parameter_counts();
        let pct = if total > 0 { 100.0 * trainable as f64 / total as f64 } else { 0.0 };
        info!(
            "trainable params: {} || all params: {} || trainable%: {:.4}",
            trainable, total, pct
        );
    }

    /// The adapter subset of the parameters, selected by name under the
    /// config's bias policy
    pub fn adapter_state_dict(&self) -> StateDict {
        let adapter_layers = adapter_layer_names(&self.model);
        self.model
            .named_parameters()
            .into_iter()
            .filter(|(name, _)| is_adapter_parameter(name, self.config.bias, &adapter_layers))
            .map(|(name, p)| (name, p.value.clone()))
            .collect()
    }

    /// Save config, adapter weights and model card into `dir`.
    ///
    /// Every parameter of the model is frozen as a side effect; call
    /// `unfreeze_adapters` to resume training afterwards.
    pub fn save_pretrained(&mut self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        storage::prepare_save_dir(dir)?;

        let base_model = self.model.name_or_path().map(str::to_string);
        let mut config = self.config.clone();
        if config.base_model_name_or_path.is_none() {
            config.base_model_name_or_path = base_model.clone();
        }
        config.save_pretrained(dir)?;

        for (_, param) in self.model.named_parameters_mut() {
            param.requires_grad = false;
        }

        let state = self.adapter_state_dict();
        storage::save_state_dict(&state, dir)?;
        storage::write_model_card(base_model.as_deref(), dir)?;
        Ok(())
    }

    /// Re-mark the adapter subset trainable, e.g. after `save_pretrained`
    pub fn unfreeze_adapters(&mut self) {
        super::inject::mark_only_lora_as_trainable(&mut self.model, self.config.bias);
    }

    /// Overlay stored tensors by name; unknown names are ignored, a known
    /// name with a different shape is an error.
    pub fn load_adapter_state(&mut self, state: StateDict) -> Result<LoadReport> {
        let restore_eval = self.mode == Mode::Eval && self.config.merge_weights;
        if restore_eval {
            self.train()?;
        }
        let overlaid = self.overlay_state(state);
        if restore_eval {
            self.eval()?;
        }
        let report = overlaid?;

        if !report.unexpected.is_empty() {
            warn!(
                "Ignored {} stored tensors not present in the model: {:?}",
                report.unexpected.len(),
                report.unexpected
            );
        }
        Ok(report)
    }

    fn overlay_state(&mut self, state: StateDict) -> Result<LoadReport> {
        let mut params: HashMap<String, &mut Parameter> =
            self.model.named_parameters_mut().into_iter().collect();
        let mut report = LoadReport::default();
        for (name, value) in state {
            match params.get_mut(&name) {
                Some(param) => {
                    if param.shape() != value.shape() {
                        return Err(LoraError::shape(
                            format!("parameter '{}'", name),
                            param.shape(),
                            value.shape(),
                        ));
                    }
                    param.value = value;
                    report.loaded.push(name);
                }
                None => report.unexpected.push(name),
            }
        }
        Ok(report)
    }

    /// Rebuild an adapter model on `model` from a saved adapter.
    ///
    /// `identifier` is a directory written by `save_pretrained`, or an id
    /// `source` can resolve. Config and weights are resolved independently.
    pub fn from_pretrained(
        model: G,
        identifier: &str,
        capabilities: Capabilities,
        source: Option<&dyn ArtifactSource>,
    ) -> Result<Self> {
        capabilities.require_low_rank()?;
        let config = LoraConfig::from_pretrained(identifier, source)?;
        let weights_path = storage::resolve_artifact(identifier, WEIGHTS_NAME, source)?;
        let state = storage::load_state_dict(&weights_path)?;

        let mut lora_model = Self::new(config, model, capabilities)?;
        let report = lora_model.load_adapter_state(state)?;
        info!(
            "Loaded {} adapter tensors from '{}'",
            report.loaded.len(),
            identifier
        );
        Ok(lora_model)
    }
}
