//! LoRA — low-rank adapters injected into a frozen host model
//!
//! Targeted dense layers are swapped for adapter layers that add a trainable
//! `(alpha / r) · B·A` update beside the frozen weight. The update can be
//! fused into the weight for inference and split out again for training.

mod config;
mod factors;
mod inject;
mod linear;
mod merged;
mod model;

pub use config::{BiasPolicy, LoraConfig};
pub use factors::LowRankFactors;
pub use inject::{
    adapter_layer_names, inject_adapters, is_adapter_parameter, mark_only_lora_as_trainable,
    plan_injection, InjectionReport,
};
pub use linear::LoraLinear;
pub use merged::MergedLoraLinear;
pub use model::{LoadReport, LoraModel, Mode};
