//! Capability flags, resolved once at startup and passed into construction

use crate::error::{LoraError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Low-rank adapter kernels are compiled in
    pub low_rank: bool,
}

impl Capabilities {
    /// What this build supports
    pub fn detect() -> Self {
        Self {
            low_rank: cfg!(feature = "low-rank"),
        }
    }

    pub fn require_low_rank(&self) -> Result<()> {
        if self.low_rank {
            Ok(())
        } else {
            Err(LoraError::DependencyMissing(
                "LoRA requires the `low-rank` feature; rebuild with `--features low-rank`".into(),
            ))
        }
    }
}
