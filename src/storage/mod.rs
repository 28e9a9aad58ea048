//! Adapter artifacts on disk
//!
//! A saved adapter is a directory holding three files: the config
//! (`adapter_config.json`), the adapter-only weights (`adapter_model.json`,
//! parameter name → tensor) and a `README.md` model card.

pub mod hub;

pub use hub::{resolve_artifact, ArtifactSource, HubCache};

use crate::error::{LoraError, Result};
use log::info;
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

pub const CONFIG_NAME: &str = "adapter_config.json";
pub const WEIGHTS_NAME: &str = "adapter_model.json";
pub const MODEL_CARD_NAME: &str = "README.md";

const MODEL_CARD_TEMPLATE: &str = "---
license: apache-2.0
base_model: {base_model}
tags:
- peft
- lora
---
# Lora adapters for {model_name}

";

/// Parameter name → tensor value
pub type StateDict = BTreeMap<String, DMatrix<f64>>;

/// Row-major tensor as written to disk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorRecord {
    pub shape: [usize; 2],
    pub data: Vec<f64>,
}

impl TensorRecord {
    pub fn from_matrix(m: &DMatrix<f64>) -> Self {
        let (rows, cols) = m.shape();
        let data = (0..rows)
            .flat_map(|i| (0..cols).map(move |j| m[(i, j)]))
            .collect();
        Self { shape: [rows, cols], data }
    }

    pub fn to_matrix(&self, name: &str) -> Result<DMatrix<f64>> {
        let [rows, cols] = self.shape;
        if rows * cols != self.data.len() {
            return Err(LoraError::ShapeMismatch {
                context: format!("stored tensor '{}'", name),
                expected: format!("{} values", rows * cols),
                actual: format!("{} values", self.data.len()),
            });
        }
        Ok(DMatrix::from_row_slice(rows, cols, &self.data))
    }
}

/// Write a state dict as `adapter_model.json` into `dir`
pub fn save_state_dict(state: &StateDict, dir: impl AsRef<Path>) -> Result<()> {
    let records: BTreeMap<&str, TensorRecord> = state
        .iter()
        .map(|(name, m)| (name.as_str(), TensorRecord::from_matrix(m)))
        .collect();
    let path = dir.as_ref().join(WEIGHTS_NAME);
    std::fs::write(&path, serde_json::to_string(&records)?)?;
    info!("Saved {} adapter tensors to {}", state.len(), path.display());
    Ok(())
}

/// Read a weights file written by `save_state_dict`
pub fn load_state_dict(path: impl AsRef<Path>) -> Result<StateDict> {
    let json = std::fs::read_to_string(path.as_ref())?;
    let records: BTreeMap<String, TensorRecord> = serde_json::from_str(&json)?;
    records
        .into_iter()
        .map(|(name, record)| {
            let m = record.to_matrix(&name)?;
            Ok((name, m))
        })
        .collect()
}

/// Model card text for an adapter trained on `base_model`
pub fn render_model_card(base_model: Option<&str>) -> String {
    let name = base_model.unwrap_or("unknown");
    MODEL_CARD_TEMPLATE
        .replace("{base_model}", name)
        .replace("{model_name}", name)
}

pub fn write_model_card(base_model: Option<&str>, dir: impl AsRef<Path>) -> Result<()> {
    std::fs::write(dir.as_ref().join(MODEL_CARD_NAME), render_model_card(base_model))?;
    Ok(())
}

/// Ensure `dir` can hold artifacts: not a file, created if missing
pub fn prepare_save_dir(dir: impl AsRef<Path>) -> Result<()> {
    let dir = dir.as_ref();
    if dir.is_file() {
        return Err(LoraError::Configuration(format!(
            "Provided path ({}) should be a directory, not a file",
            dir.display()
        )));
    }
    std::fs::create_dir_all(dir)?;
    Ok(())
}
