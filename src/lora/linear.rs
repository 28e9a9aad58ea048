//! LoRA implemented in a dense layer
//!
//! Composition of a frozen `Linear` and an optional factor pair. In training
//! mode the factors run beside the base projection; with `merge_weights` set,
//! eval mode folds `scale · B·A` into the base weight and training mode takes
//! it back out.
//!
//! Forward and mode transitions are not synchronized; a caller must not run
//! `forward` on a layer while another thread merges or unmerges it.

use super::config::LoraConfig;
use super::factors::LowRankFactors;
use crate::error::Result;
use crate::graph::Linear;
use crate::tensor::{self, Parameter};
use nalgebra::DMatrix;
use rand::Rng;

#[derive(Debug, Clone)]
pub struct LoraLinear {
    base: Linear,
    factors: Option<LowRankFactors>,
    merge_weights: bool,
    merged: bool,
    training: bool,
}

impl LoraLinear {
    /// Wrap `base`, taking ownership of its weight and bias.
    ///
    /// With `rank == 0` no factors are created and the layer is a plain
    /// passthrough of the base projection.
    pub fn new(
        mut base: Linear,
        rank: usize,
        alpha: u32,
        dropout: f64,
        merge_weights: bool,
        rng: &mut impl Rng,
    ) -> Result<Self> {
        let factors = if rank > 0 {
            base.weight.requires_grad = false;
            Some(LowRankFactors::new(
                base.in_features(),
                base.out_features(),
                rank,
                1,
                alpha,
                dropout,
                rng,
            )?)
        } else {
            None
        };
        Ok(Self {
            base,
            factors,
            merge_weights,
            merged: false,
            training: true,
        })
    }

    pub fn from_config(base: Linear, config: &LoraConfig, rng: &mut impl Rng) -> Result<Self> {
        Self::new(
            base,
            config.rank,
            config.alpha,
            config.dropout,
            config.merge_weights,
            rng,
        )
    }

    pub fn base(&self) -> &Linear {
        &self.base
    }

    pub fn factors(&self) -> Option<&LowRankFactors> {
        self.factors.as_ref()
    }

    pub fn factors_mut(&mut self) -> Option<&mut LowRankFactors> {
        self.factors.as_mut()
    }

    pub fn is_merged(&self) -> bool {
        self.merged
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    pub fn in_features(&self) -> usize {
        self.base.in_features()
    }

    pub fn out_features(&self) -> usize {
        self.base.out_features()
    }

    pub fn forward(&self, x: &DMatrix<f64>) -> Result<DMatrix<f64>> {
        let mut result = self.base.forward(x)?;
        if let Some(factors) = self.factors.as_ref().filter(|_| !self.merged) {
            result += factors.forward(x, self.training)?;
        }
        Ok(result)
    }

    /// Train mode unmerges, eval mode merges; both only with `merge_weights`
    pub fn set_training(&mut self, training: bool) -> Result<()> {
        self.training = training;
        if self.merge_weights {
            if training {
                self.unmerge()?;
            } else {
                self.merge()?;
            }
        }
        Ok(())
    }

    /// Fold the scaled update into the base weight. No-op when merged.
    pub fn merge(&mut self) -> Result<()> {
        if self.merged {
            return Ok(());
        }
        if let Some(delta) = self.delta_weight()? {
            self.base.weight.value += delta;
        }
        self.merged = true;
        Ok(())
    }

    /// Subtract the scaled update from the base weight. No-op when unmerged.
    pub fn unmerge(&mut self) -> Result<()> {
        if !self.merged {
            return Ok(());
        }
        if let Some(delta) = self.delta_weight()? {
            self.base.weight.value -= delta;
        }
        self.merged = false;
        Ok(())
    }

    /// `scale · B·A` in the base weight's storage layout
    fn delta_weight(&self) -> Result<Option<DMatrix<f64>>> {
        match &self.factors {
            Some(factors) => Ok(Some(tensor::transpose(
                &factors.delta_weight()?,
                self.base.fan_in_fan_out,
            ))),
            None => Ok(None),
        }
    }

    pub(crate) fn parameters(&self) -> Vec<(&'static str, &Parameter)> {
        let mut params = self.base.parameters();
        if let Some(f) = &self.factors {
            params.push(("lora_A.weight", &f.lora_a));
            params.push(("lora_B.weight", &f.lora_b));
        }
        params
    }

    pub(crate) fn parameters_mut(&mut self) -> Vec<(&'static str, &mut Parameter)> {
        let mut params = self.base.parameters_mut();
        if let Some(f) = &mut self.factors {
            params.push(("lora_A.weight", &mut f.lora_a));
            params.push(("lora_B.weight", &mut f.lora_b));
        }
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn layer(fan_in_fan_out: bool, merge_weights: bool) -> LoraLinear {
        let mut rng = StdRng::seed_from_u64(3);
        let base = if fan_in_fan_out {
            Linear::conv1d(8, 5, true, &mut rng)
        } else {
            Linear::new(8, 5, true, &mut rng)
        };
        LoraLinear::new(base, 4, 8, 0.0, merge_weights, &mut rng).unwrap()
    }

    fn train_factors(layer: &mut LoraLinear) {
        let f = layer.factors_mut().unwrap();
        f.lora_b.value = DMatrix::new_random(5, 4);
    }

    #[test]
    fn test_zero_init_matches_base() {
        let layer = layer(false, true);
        let x = DMatrix::new_random(3, 8);
        assert_eq!(layer.forward(&x).unwrap(), layer.base().forward(&x).unwrap());
        assert!(!layer.base().weight.requires_grad);
        assert!(layer.factors().unwrap().lora_a.requires_grad);
    }

    #[test]
    fn test_merge_round_trip() {
        for fan_in_fan_out in [false, true] {
            let mut layer = layer(fan_in_fan_out, true);
            train_factors(&mut layer);
            let x = DMatrix::new_random(4, 8);
            let original_weight = layer.base().weight.value.clone();

            let decomposed = layer.forward(&x).unwrap();
            layer.set_training(false).unwrap();
            assert!(layer.is_merged());
            let fused = layer.forward(&x).unwrap();
            assert!((&decomposed - &fused).norm() < 1e-10);

            layer.set_training(true).unwrap();
            assert!(!layer.is_merged());
            assert!((layer.forward(&x).unwrap() - decomposed).norm() < 1e-10);
            assert!((&layer.base().weight.value - original_weight).norm() < 1e-12);
        }
    }

    #[test]
    fn test_merge_idempotent() {
        let mut layer = layer(false, true);
        train_factors(&mut layer);
        layer.set_training(false).unwrap();
        let once = layer.base().weight.value.clone();
        layer.set_training(false).unwrap();
        assert_eq!(layer.base().weight.value, once);
        assert!(layer.is_merged());
    }

    #[test]
    fn test_no_merge_without_flag() {
        let mut layer = layer(false, false);
        train_factors(&mut layer);
        let before = layer.base().weight.value.clone();
        layer.set_training(false).unwrap();
        assert!(!layer.is_merged());
        assert_eq!(layer.base().weight.value, before);
    }

    #[test]
    fn test_rank_zero_is_passthrough() {
        let mut rng = StdRng::seed_from_u64(4);
        let base = Linear::new(4, 4, false, &mut rng);
        let weight = base.weight.value.clone();
        let mut layer = LoraLinear::new(base, 0, 8, 0.0, true, &mut rng).unwrap();
        assert!(layer.factors().is_none());
        layer.set_training(false).unwrap();
        layer.set_training(true).unwrap();
        assert_eq!(layer.base().weight.value, weight);
        let names: Vec<&str> = layer.parameters().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["weight"]);
    }

    #[test]
    fn test_adapter_changes_output_after_training() {
        let mut layer = layer(false, false);
        train_factors(&mut layer);
        let x = DMatrix::new_random(2, 8);
        let diff = layer.forward(&x).unwrap() - layer.base().forward(&x).unwrap();
        assert!(diff.norm() > 0.0);
    }
}
