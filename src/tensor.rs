//! Tensor substrate — the handful of dense kernels adapter layers need
//!
//! Activations are `(tokens, features)` matrices; any leading batch axes are
//! flattened into rows by the caller. Weights follow the `(out, in)` layout
//! unless a layer stores them transposed as `(in, out)`.

use crate::error::{LoraError, Result};
use nalgebra::DMatrix;
use rand::distributions::Uniform;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::cell::RefCell;

/// A named tensor slot with its trainable flag
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub value: DMatrix<f64>,
    pub requires_grad: bool,
}

impl Parameter {
    /// A trainable parameter
    pub fn new(value: DMatrix<f64>) -> Self {
        Self { value, requires_grad: true }
    }

    /// A frozen parameter
    pub fn frozen(value: DMatrix<f64>) -> Self {
        Self { value, requires_grad: false }
    }

    pub fn shape(&self) -> (usize, usize) {
        self.value.shape()
    }

    pub fn numel(&self) -> usize {
        self.value.len()
    }
}

/// Returns `w` or its transpose, depending on the storage layout
pub fn transpose(w: &DMatrix<f64>, fan_in_fan_out: bool) -> DMatrix<f64> {
    if fan_in_fan_out {
        w.transpose()
    } else {
        w.clone()
    }
}

/// Dense transform `y = x · Wᵀ + b`, reading `W` as `(in, out)` when
/// `fan_in_fan_out` is set. `bias` is an `(out, 1)` column.
pub fn linear(
    x: &DMatrix<f64>,
    weight: &DMatrix<f64>,
    bias: Option<&DMatrix<f64>>,
    fan_in_fan_out: bool,
) -> Result<DMatrix<f64>> {
    let (out_features, in_features) = if fan_in_fan_out {
        (weight.ncols(), weight.nrows())
    } else {
        (weight.nrows(), weight.ncols())
    };
    if x.ncols() != in_features {
        return Err(LoraError::shape(
            "linear input",
            (x.nrows(), in_features),
            x.shape(),
        ));
    }
    let mut y = if fan_in_fan_out {
        x * weight
    } else {
        x * weight.transpose()
    };
    if let Some(b) = bias {
        if b.shape() != (out_features, 1) {
            return Err(LoraError::shape("linear bias", (out_features, 1), b.shape()));
        }
        add_bias(&mut y, b)?;
    }
    Ok(y)
}

/// Broadcast-add an `(out, 1)` bias column to every row of `y`
pub fn add_bias(y: &mut DMatrix<f64>, bias: &DMatrix<f64>) -> Result<()> {
    if bias.shape() != (y.ncols(), 1) {
        return Err(LoraError::shape("bias", (y.ncols(), 1), bias.shape()));
    }
    for j in 0..y.ncols() {
        let b = bias[(j, 0)];
        for i in 0..y.nrows() {
            y[(i, j)] += b;
        }
    }
    Ok(())
}

/// Grouped batched linear transform, the 1x1 grouped convolution.
///
/// `x` is `(n, in_channels)`, `weight` is `(out_channels, in_channels / groups)`.
/// Output group `g` only sees input group `g`, so the weight acts as a
/// block-diagonal `(out_channels, in_channels)` matrix without storing zeros.
pub fn grouped_linear(x: &DMatrix<f64>, weight: &DMatrix<f64>, groups: usize) -> Result<DMatrix<f64>> {
    if groups == 0 {
        return Err(LoraError::Configuration("grouped transform needs at least one group".into()));
    }
    let in_channels = x.ncols();
    let out_channels = weight.nrows();
    if in_channels % groups != 0 || out_channels % groups != 0 {
        return Err(LoraError::Configuration(format!(
            "channels ({} in, {} out) must be divisible by groups ({})",
            in_channels, out_channels, groups
        )));
    }
    let in_per_group = in_channels / groups;
    let out_per_group = out_channels / groups;
    if weight.ncols() != in_per_group {
        return Err(LoraError::shape(
            "grouped weight",
            (out_channels, in_per_group),
            weight.shape(),
        ));
    }

    let mut y = DMatrix::zeros(x.nrows(), out_channels);
    for g in 0..groups {
        let xg = x.columns(g * in_per_group, in_per_group);
        let wg = weight.rows(g * out_per_group, out_per_group);
        let yg = xg * wg.transpose();
        y.columns_mut(g * out_per_group, out_per_group).copy_from(&yg);
    }
    Ok(y)
}

/// Inverted dropout; identity outside training or when `p == 0`.
///
/// Masks are drawn from a generator seeded once at construction, so a
/// seeded model replays the same masks.
#[derive(Debug, Clone)]
pub struct Dropout {
    pub p: f64,
    rng: RefCell<StdRng>,
}

impl Dropout {
    pub fn new(p: f64, rng: &mut impl Rng) -> Self {
        Self {
            p,
            rng: RefCell::new(StdRng::seed_from_u64(rng.gen())),
        }
    }

    pub fn apply(&self, x: &DMatrix<f64>, training: bool) -> DMatrix<f64> {
        if !training || self.p <= 0.0 {
            return x.clone();
        }
        let keep = 1.0 - self.p;
        let mut rng = self.rng.borrow_mut();
        let mut y = x.clone();
        for v in y.iter_mut() {
            if rng.gen::<f64>() < self.p {
                *v = 0.0;
            } else {
                *v /= keep;
            }
        }
        y
    }
}

/// Kaiming-uniform with `a = √5`, the dense-layer default:
/// samples from `U(-1/√fan_in, 1/√fan_in)` where `fan_in = cols`.
pub fn kaiming_uniform(rows: usize, cols: usize, rng: &mut impl Rng) -> DMatrix<f64> {
    let bound = if cols > 0 { 1.0 / (cols as f64).sqrt() } else { 0.0 };
    let dist = Uniform::new_inclusive(-bound, bound);
    DMatrix::from_fn(rows, cols, |_, _| rng.sample(&dist))
}
