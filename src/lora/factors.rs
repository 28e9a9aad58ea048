//! Low-rank factor pair (A, B) and its scaling rule
//!
//! ΔW = (alpha / r) · B · A, with A ∈ ℝ^(r·k × d_in) and B holding the
//! up-projection for `k` output groups. A starts fan-in uniform and B at zero,
//! so a fresh pair contributes exactly nothing.

use crate::error::{LoraError, Result};
use crate::tensor::{self, Dropout, Parameter};
use nalgebra::DMatrix;
use rand::Rng;

/// Trainable low-rank factors of one adapter layer
#[derive(Debug, Clone)]
pub struct LowRankFactors {
    /// Down-projection `(r·k, d_in)`
    pub lora_a: Parameter,
    /// Up-projection `(out_active, r)`; block-diagonal over `groups`
    pub lora_b: Parameter,
    rank: usize,
    groups: usize,
    scale: f64,
    dropout: Dropout,
}

impl LowRankFactors {
    /// Build a factor pair.
    ///
    /// `groups` is 1 for a plain layer and the number of enabled output
    /// partitions for a grouped one; `out_active` is the total width of those
    /// partitions.
    pub fn new(
        in_features: usize,
        out_active: usize,
        rank: usize,
        groups: usize,
        alpha: u32,
        dropout: f64,
        rng: &mut impl Rng,
    ) -> Result<Self> {
        if rank == 0 {
            return Err(LoraError::Configuration(
                "low-rank factors need rank > 0".into(),
            ));
        }
        if groups == 0 || out_active % groups != 0 {
            return Err(LoraError::Configuration(format!(
                "{} active output features can't be split into {} groups",
                out_active, groups
            )));
        }
        let lora_a = Parameter::new(tensor::kaiming_uniform(rank * groups, in_features, rng));
        let lora_b = Parameter::new(DMatrix::zeros(out_active, rank));
        Ok(Self {
            lora_a,
            lora_b,
            rank,
            groups,
            scale: alpha as f64 / rank as f64,
            dropout: Dropout::new(dropout, rng),
        })
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn groups(&self) -> usize {
        self.groups
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn in_features(&self) -> usize {
        self.lora_a.value.ncols()
    }

    pub fn out_active(&self) -> usize {
        self.lora_b.value.nrows()
    }

    /// `scale · B(A(dropout(x)))`, shape `(n, out_active)`
    pub fn forward(&self, x: &DMatrix<f64>, training: bool) -> Result<DMatrix<f64>> {
        if x.ncols() != self.in_features() {
            return Err(LoraError::shape(
                "adapter input",
                (x.nrows(), self.in_features()),
                x.shape(),
            ));
        }
        let after_a = self.dropout.apply(x, training) * self.lora_a.value.transpose();
        let after_b = self.up_project(&after_a)?;
        Ok(after_b * self.scale)
    }

    /// Reconstructed `scale · B·A` in `(out_active, d_in)` layout.
    ///
    /// Uses the same grouped transform as the forward path, applied to Aᵀ, so
    /// fused and decomposed results come from identical arithmetic.
    pub fn delta_weight(&self) -> Result<DMatrix<f64>> {
        let delta_t = self.up_project(&self.lora_a.value.transpose())?;
        Ok(delta_t.transpose() * self.scale)
    }

    fn up_project(&self, after_a: &DMatrix<f64>) -> Result<DMatrix<f64>> {
        if self.groups == 1 {
            Ok(after_a * self.lora_b.value.transpose())
        } else {
            tensor::grouped_linear(after_a, &self.lora_b.value, self.groups)
        }
    }

    /// Trainable parameter count (A and B)
    pub fn num_parameters(&self) -> usize {
        self.lora_a.numel() + self.lora_b.numel()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(42)
    }

    #[test]
    fn test_rank_zero_rejected() {
        let result = LowRankFactors::new(8, 8, 0, 1, 8, 0.0, &mut rng());
        assert!(matches!(result, Err(LoraError::Configuration(_))));
    }

    #[test]
    fn test_shapes_and_init() {
        let f = LowRankFactors::new(10, 12, 4, 2, 8, 0.0, &mut rng()).unwrap();
        assert_eq!(f.lora_a.shape(), (8, 10));
        assert_eq!(f.lora_b.shape(), (12, 4));
        assert!(f.lora_a.value.norm() > 0.0);
        assert_eq!(f.lora_b.value.norm(), 0.0);
        assert_eq!(f.scale(), 2.0);
        assert_eq!(f.num_parameters(), 80 + 48);
    }

    #[test]
    fn test_zero_init_contributes_nothing() {
        let f = LowRankFactors::new(6, 6, 2, 1, 4, 0.0, &mut rng()).unwrap();
        let x = DMatrix::new_random(3, 6);
        assert_eq!(f.forward(&x, true).unwrap(), DMatrix::zeros(3, 6));
        assert_eq!(f.delta_weight().unwrap(), DMatrix::zeros(6, 6));
    }

    #[test]
    fn test_delta_matches_forward() {
        let mut f = LowRankFactors::new(5, 6, 3, 2, 6, 0.0, &mut rng()).unwrap();
        f.lora_b.value = DMatrix::new_random(6, 3);
        let x = DMatrix::new_random(4, 5);
        let via_forward = f.forward(&x, false).unwrap();
        let via_delta = &x * f.delta_weight().unwrap().transpose();
        assert!((via_forward - via_delta).norm() < 1e-12);
    }

    #[test]
    fn test_single_group_delta_is_scaled_product() {
        let mut f = LowRankFactors::new(4, 3, 2, 1, 6, 0.0, &mut rng()).unwrap();
        f.lora_b.value = DMatrix::new_random(3, 2);
        let expected = &f.lora_b.value * &f.lora_a.value * 3.0;
        assert!((f.delta_weight().unwrap() - expected).norm() < 1e-12);
    }
}
