//! LoRA on a fused multi-projection layer
//!
//! One dense layer computes several equal-width projections at once (for
//! example query, key and value concatenated along the output axis).
//! `enable_lora` picks the partitions that get an adapter; the factors only
//! produce those columns and `zero_pad` scatters them back into the full
//! output width.

use super::config::LoraConfig;
use super::factors::LowRankFactors;
use crate::error::{LoraError, Result};
use crate::graph::Linear;
use crate::tensor::{self, Parameter};
use nalgebra::DMatrix;
use rand::Rng;

#[derive(Debug, Clone)]
pub struct MergedLoraLinear {
    base: Linear,
    factors: Option<LowRankFactors>,
    enable_lora: Vec<bool>,
    /// Per output feature: does it belong to an enabled partition
    lora_ind: Vec<bool>,
    merge_weights: bool,
    merged: bool,
    training: bool,
}

impl MergedLoraLinear {
    /// Fails unless `out_features` splits evenly into `enable_lora.len()` partitions
    pub fn check_partition(out_features: usize, enable_lora: &[bool]) -> Result<()> {
        if enable_lora.is_empty() {
            return Err(LoraError::Configuration("enable_lora must not be empty".into()));
        }
        if out_features % enable_lora.len() != 0 {
            return Err(LoraError::Configuration(format!(
                "The length of enable_lora ({}) must divide out_features ({})",
                enable_lora.len(),
                out_features
            )));
        }
        Ok(())
    }

    pub fn new(
        mut base: Linear,
        rank: usize,
        alpha: u32,
        dropout: f64,
        enable_lora: Vec<bool>,
        merge_weights: bool,
        rng: &mut impl Rng,
    ) -> Result<Self> {
        let out_features = base.out_features();
        Self::check_partition(out_features, &enable_lora)?;

        let per_group = out_features / enable_lora.len();
        let active = enable_lora.iter().filter(|e| **e).count();
        let lora_ind: Vec<bool> = enable_lora
            .iter()
            .flat_map(|&enabled| std::iter::repeat(enabled).take(per_group))
            .collect();

        let factors = if rank > 0 && active > 0 {
            base.weight.requires_grad = false;
            Some(LowRankFactors::new(
                base.in_features(),
                per_group * active,
                rank,
                active,
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
            enable_lora,
            lora_ind,
            merge_weights,
            merged: false,
            training: true,
        })
    }

    pub fn from_config(
        base: Linear,
        config: &LoraConfig,
        enable_lora: Vec<bool>,
        rng: &mut impl Rng,
    ) -> Result<Self> {
        Self::new(
            base,
            config.rank,
            config.alpha,
            config.dropout,
            enable_lora,
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

    pub fn enable_lora(&self) -> &[bool] {
        &self.enable_lora
    }

    pub fn lora_ind(&self) -> &[bool] {
        &self.lora_ind
    }

    pub fn is_merged(&self) -> bool {
        self.merged
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    fn active_width(&self) -> usize {
        self.lora_ind.iter().filter(|e| **e).count()
    }

    /// Scatter `(n, out_active)` columns into a zeroed `(n, out_features)`
    pub fn zero_pad(&self, x: &DMatrix<f64>) -> Result<DMatrix<f64>> {
        let active = self.active_width();
        if x.ncols() != active {
            return Err(LoraError::shape("zero_pad input", (x.nrows(), active), x.shape()));
        }
        let mut result = DMatrix::zeros(x.nrows(), self.lora_ind.len());
        let targets = self.lora_ind.iter().enumerate().filter(|(_, on)| **on);
        for (src, (dst, _)) in targets.enumerate() {
            result.column_mut(dst).copy_from(&x.column(src));
        }
        Ok(result)
    }

    pub fn forward(&self, x: &DMatrix<f64>) -> Result<DMatrix<f64>> {
        let mut result = self.base.forward(x)?;
        if let Some(factors) = self.factors.as_ref().filter(|_| !self.merged) {
            let after_b = factors.forward(x, self.training)?;
            result += self.zero_pad(&after_b)?;
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

    /// Full-width `scale · B·A` in the base weight's storage layout.
    ///
    /// Padding always runs along the output-feature axis: the compact delta
    /// is padded in `(in, out)` form and transposed back for `(out, in)`
    /// storage.
    fn delta_weight(&self) -> Result<Option<DMatrix<f64>>> {
        let Some(factors) = &self.factors else {
            return Ok(None);
        };
        let padded_in_out = self.zero_pad(&factors.delta_weight()?.transpose())?;
        Ok(Some(tensor::transpose(&padded_in_out, !self.base.fan_in_fan_out)))
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
