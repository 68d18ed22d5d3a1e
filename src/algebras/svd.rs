/// SVD-structured low-rank update
///
/// ΔW = scaling · B @ diag(E ⊙ mask) @ A with A: [RANK, IN],
/// E: [RANK], B: [OUT, RANK]. The explicit per-direction magnitude
/// vector E is what the rank allocator prunes: zeroing mask entries
/// removes directions without resizing any storage.

use crate::tensor_utils;
use crate::{Error, Result};
use ndarray::{Array1, Array2, Axis};

#[derive(Debug, Clone)]
pub struct SvdUnit {
    /// Right factor, [RANK, IN].
    pub lora_a: Array2<f32>,
    /// Per-direction magnitudes, [RANK].
    pub lora_e: Array1<f32>,
    /// Left factor, [OUT, RANK].
    pub lora_b: Array2<f32>,
    /// 0/1 mask over directions; length is always the initial rank.
    pub rank_mask: Array1<f32>,
    /// Cached count of retained directions.
    pub rank_num: usize,
    /// Initial (maximum) rank; storage is never resized below it.
    pub init_rank: usize,
    pub alpha: f32,
    /// alpha / init_rank, fixed for the life of the unit so pruning does
    /// not change the magnitude of surviving directions.
    pub scaling: f32,
    pub dropout: f32,
    /// Gradient of the loss w.r.t. E, written by the external training
    /// loop after each backward pass and consumed by the allocator.
    pub grad_e: Option<Array1<f32>>,
}

impl SvdUnit {
    pub fn new(
        in_features: usize,
        out_features: usize,
        init_rank: usize,
        alpha: f32,
        dropout: f32,
        init_weights: bool,
    ) -> Result<Self> {
        if init_rank == 0 {
            return Err(Error::Config("SVD unit requires init_rank > 0".into()));
        }
        let (lora_a, lora_e, lora_b) = if init_weights {
            (
                tensor_utils::randn(init_rank, in_features, 0.0, 0.02),
                Array1::zeros(init_rank),
                tensor_utils::randn(out_features, init_rank, 0.0, 0.02),
            )
        } else {
            (
                tensor_utils::randn(init_rank, in_features, 0.0, 0.02),
                Array1::from_elem(init_rank, 1.0),
                tensor_utils::randn(out_features, init_rank, 0.0, 0.02),
            )
        };
        Ok(Self {
            lora_a,
            lora_e,
            lora_b,
            rank_mask: Array1::from_elem(init_rank, 1.0),
            rank_num: init_rank,
            init_rank,
            alpha,
            scaling: alpha / init_rank as f32,
            dropout,
            grad_e: None,
        })
    }

    pub fn in_features(&self) -> usize {
        self.lora_a.ncols()
    }

    pub fn out_features(&self) -> usize {
        self.lora_b.nrows()
    }

    /// A with each row scaled by its (masked) magnitude, [RANK, IN].
    fn effective_a(&self) -> Array2<f32> {
        let gate = (&self.lora_e * &self.rank_mask).insert_axis(Axis(1));
        &self.lora_a * &gate
    }

    /// ΔW in [OUT, IN] orientation.
    pub fn delta_weight(&self) -> Array2<f32> {
        self.lora_b.dot(&self.effective_a()) * self.scaling
    }

    /// scaling · (x (E⊙mask⊙A)ᵀ) Bᵀ for a batch input [N, IN].
    pub fn forward_contribution(&self, x: &Array2<f32>) -> Result<Array2<f32>> {
        if x.ncols() != self.in_features() {
            return Err(Error::ShapeMismatch {
                expected: vec![x.nrows(), self.in_features()],
                got: vec![x.nrows(), x.ncols()],
            });
        }
        Ok(x.dot(&self.effective_a().t()).dot(&self.lora_b.t()) * self.scaling)
    }

    /// Install a new 0/1 mask. Storage is untouched; only the gate and the
    /// cached retained count change.
    pub fn set_rank_mask(&mut self, mask: Array1<f32>) -> Result<()> {
        if mask.len() != self.init_rank {
            return Err(Error::ShapeMismatch {
                expected: vec![self.init_rank],
                got: vec![mask.len()],
            });
        }
        self.rank_num = mask.iter().filter(|v| **v > 0.0).count();
        self.rank_mask = mask;
        Ok(())
    }

    /// Indices of currently retained directions.
    pub fn retained_indices(&self) -> Vec<usize> {
        self.rank_mask
            .iter()
            .enumerate()
            .filter(|(_, v)| **v > 0.0)
            .map(|(k, _)| k)
            .collect()
    }
}
