//! Adapter configuration
//!
//! Field names on disk follow the widely used PEFT adapter config layout
//! (`r`, `lora_alpha`, `target_modules`, ...) so configs can be exchanged
//! with other tooling.

use crate::error::{LoraError, Result};
use crate::storage::{self, ArtifactSource, CONFIG_NAME};
use log::info;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Which bias tensors stay trainable next to the adapter factors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BiasPolicy {
    /// Every bias stays frozen
    #[default]
    None,
    /// Every bias in the model is trainable
    All,
    /// Only biases of adapter layers are trainable
    LoraOnly,
}

/// Configuration shared by every adapter layer of a model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraConfig {
    #[serde(default = "default_peft_type")]
    pub peft_type: String,
    #[serde(default)]
    pub task_type: Option<String>,
    #[serde(default)]
    pub base_model_name_or_path: Option<String>,
    #[serde(default)]
    pub inference_mode: bool,
    /// Rank of the decomposition; 0 disables adaptation
    #[serde(rename = "r")]
    pub rank: usize,
    /// Scaling numerator, the update is scaled by `alpha / rank`
    #[serde(rename = "lora_alpha")]
    pub alpha: u32,
    /// Dropout probability on the adapter input
    #[serde(rename = "lora_dropout", default)]
    pub dropout: f64,
    /// Module name suffixes to adapt (e.g. `q`, `v`, `attn.c_attn`)
    #[serde(default)]
    pub target_modules: Vec<String>,
    /// Base weight stored as `(in, out)` instead of `(out, in)`
    #[serde(default)]
    pub fan_in_fan_out: bool,
    /// Fuse the adapter into the base weight in eval mode
    #[serde(default)]
    pub merge_weights: bool,
    /// Output partitions that receive adaptation; selects the grouped layer
    #[serde(default)]
    pub enable_lora: Option<Vec<bool>>,
    #[serde(default)]
    pub bias: BiasPolicy,
}

fn default_peft_type() -> String {
    "LORA".to_string()
}

impl Default for LoraConfig {
    fn default() -> Self {
        Self {
            peft_type: default_peft_type(),
            task_type: None,
            base_model_name_or_path: None,
            inference_mode: false,
            rank: 8,
            alpha: 8,
            dropout: 0.0,
            target_modules: Vec::new(),
            fan_in_fan_out: false,
            merge_weights: false,
            enable_lora: None,
            bias: BiasPolicy::None,
        }
    }
}

impl LoraConfig {
    /// Config targeting the given module names with default hyperparameters
    pub fn for_targets<I, S>(targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            target_modules: targets.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// `alpha / rank`, or `None` when adaptation is disabled
    pub fn scaling(&self) -> Option<f64> {
        if self.rank == 0 {
            None
        } else {
            Some(self.alpha as f64 / self.rank as f64)
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(LoraError::Configuration(format!(
                "lora_dropout must be in [0, 1), got {}",
                self.dropout
            )));
        }
        if let Some(mask) = &self.enable_lora {
            if mask.is_empty() {
                return Err(LoraError::Configuration("enable_lora must not be empty".into()));
            }
        }
        Ok(())
    }

    /// Whether a fully qualified module name is an injection target.
    ///
    /// Matches on a dot boundary: `q` selects `encoder.q` but not `encoder.seq`.
    pub fn is_target(&self, module_name: &str) -> bool {
        self.target_modules.iter().any(|target| {
            module_name == target
                || (module_name.ends_with(target.as_str())
                    && module_name[..module_name.len() - target.len()].ends_with('.'))
        })
    }

    /// The config as a JSON object, optionally flagged for inference
    pub fn to_json_value(&self, inference: bool) -> Result<serde_json::Value> {
        let mut value = serde_json::to_value(self)?;
        if inference {
            value["inference_mode"] = serde_json::Value::Bool(true);
        }
        Ok(value)
    }

    /// Write `adapter_config.json` into `dir`
    pub fn save_pretrained(&self, dir: impl AsRef<Path>) -> Result<()> {
        let path = dir.as_ref().join(CONFIG_NAME);
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, json)?;
        info!("Saved adapter config to {}", path.display());
        Ok(())
    }

    /// Read the config for `identifier`: a local directory, or an id the
    /// remote source can resolve.
    pub fn from_pretrained(identifier: &str, source: Option<&dyn ArtifactSource>) -> Result<Self> {
        let path = storage::resolve_artifact(identifier, CONFIG_NAME, source)?;
        let json = std::fs::read_to_string(&path)?;
        let config: Self = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scaling() {
        let config = LoraConfig { rank: 4, alpha: 16, ..LoraConfig::default() };
        assert_eq!(config.scaling(), Some(4.0));
        let disabled = LoraConfig { rank: 0, ..LoraConfig::default() };
        assert_eq!(disabled.scaling(), None);
    }

    #[test]
    fn test_target_matching_on_dot_boundary() {
        let config = LoraConfig::for_targets(["q", "attn.c_attn"]);
        assert!(config.is_target("encoder.q"));
        assert!(config.is_target("q"));
        assert!(config.is_target("h.0.attn.c_attn"));
        assert!(!config.is_target("encoder.seq"));
        assert!(!config.is_target("encoder.q.proj"));
        assert!(!config.is_target("encoder.k"));
    }

    #[test]
    fn test_validate() {
        assert!(LoraConfig::default().validate().is_ok());
        let bad_dropout = LoraConfig { dropout: 1.0, ..LoraConfig::default() };
        assert!(matches!(bad_dropout.validate(), Err(LoraError::Configuration(_))));
        let empty_mask = LoraConfig { enable_lora: Some(vec![]), ..LoraConfig::default() };
        assert!(empty_mask.validate().is_err());
    }

    #[test]
    fn test_json_uses_peft_keys() {
        let config = LoraConfig {
            rank: 4,
            alpha: 32,
            dropout: 0.1,
            enable_lora: Some(vec![true, false, true]),
            bias: BiasPolicy::LoraOnly,
            ..LoraConfig::for_targets(["q", "v"])
        };
        let value = config.to_json_value(false).unwrap();
        assert_eq!(value["r"], 4);
        assert_eq!(value["lora_alpha"], 32);
        assert_eq!(value["bias"], "lora_only");
        assert_eq!(value["peft_type"], "LORA");
        assert_eq!(value["inference_mode"], false);

        let parsed: LoraConfig = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_inference_flag() {
        let value = LoraConfig::default().to_json_value(true).unwrap();
        assert_eq!(value["inference_mode"], true);
    }

    #[test]
    fn test_minimal_json_fills_defaults() {
        let config: LoraConfig =
            serde_json::from_str(r#"{"r": 2, "lora_alpha": 4, "target_modules": ["q"]}"#).unwrap();
        assert_eq!(config.rank, 2);
        assert_eq!(config.bias, BiasPolicy::None);
        assert!(!config.merge_weights);
        assert_eq!(config.enable_lora, None);
    }
}
