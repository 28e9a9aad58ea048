//! lora-tuner — parameter-efficient fine-tuning with low-rank adapters
//!
//! Wraps a frozen model, swaps its targeted projections for adapter layers,
//! and manages fusing those adapters into the base weights for inference.

pub mod error;
pub mod graph;
pub mod lora;
pub mod runtime;
pub mod storage;
pub mod tensor;

pub use error::{LoraError, Result};
pub use graph::{Model, Module, ModuleGraph};
pub use lora::{BiasPolicy, LoraConfig, LoraLinear, LoraModel, MergedLoraLinear, Mode};
pub use runtime::Capabilities;
pub use storage::{ArtifactSource, HubCache};
