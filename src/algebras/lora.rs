/// Fixed-rank low-rank update
///
/// ΔW = scaling · B @ A with A: [RANK, IN], B: [OUT, RANK].
/// A is kaiming-uniform initialized, B starts at zero so a freshly
/// attached adapter is an exact no-op.

use crate::tensor_utils;
use crate::{Error, Result};
use ndarray::Array2;

#[derive(Debug, Clone)]
pub struct LoraUnit {
    /// Down projection, [RANK, IN].
    pub lora_a: Array2<f32>,
    /// Up projection, [OUT, RANK].
    pub lora_b: Array2<f32>,
    pub rank: usize,
    pub alpha: f32,
    /// alpha / rank, fixed at construction.
    pub scaling: f32,
    /// Dropout probability on the adapter branch input while training.
    pub dropout: f32,
}

impl LoraUnit {
    pub fn new(
        in_features: usize,
        out_features: usize,
        rank: usize,
        alpha: f32,
        dropout: f32,
        init_weights: bool,
    ) -> Result<Self> {
        if rank == 0 {
            return Err(Error::Config("low-rank unit requires rank > 0".into()));
        }
        let (lora_a, lora_b) = if init_weights {
            (
                tensor_utils::kaiming_uniform(rank, in_features, 5.0f32.sqrt()),
                Array2::zeros((out_features, rank)),
            )
        } else {
            (
                tensor_utils::randn(rank, in_features, 0.0, 0.02),
                tensor_utils::randn(out_features, rank, 0.0, 0.02),
            )
        };
        Ok(Self {
            lora_a,
            lora_b,
            rank,
            alpha,
            scaling: alpha / rank as f32,
            dropout,
        })
    }

    pub fn in_features(&self) -> usize {
        self.lora_a.ncols()
    }

    pub fn out_features(&self) -> usize {
        self.lora_b.nrows()
    }

    /// ΔW in [OUT, IN] orientation.
    pub fn delta_weight(&self) -> Array2<f32> {
        self.lora_b.dot(&self.lora_a) * self.scaling
    }

    /// scaling · (x Aᵀ) Bᵀ for a batch input [N, IN].
    pub fn forward_contribution(&self, x: &Array2<f32>) -> Result<Array2<f32>> {
        if x.ncols() != self.in_features() {
            return Err(Error::ShapeMismatch {
                expected: vec![x.nrows(), self.in_features()],
                got: vec![x.nrows(), x.ncols()],
            });
        }
        Ok(x.dot(&self.lora_a.t()).dot(&self.lora_b.t()) * self.scaling)
    }
}
