/// Tensor utility functions for petl-rs
///
/// Helpers for adapter factor initialization and the handful of dense-algebra
/// primitives the adapter layers share.

use ndarray::{Array1, Array2, ArrayView2};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal, Uniform};

/// Create a matrix sampled from N(mean, std).
pub fn randn(rows: usize, cols: usize, mean: f32, std: f32) -> Array2<f32> {
    let mut rng = rand::thread_rng();
    Array2::from_shape_fn((rows, cols), |_| {
        let z: f32 = rng.sample(StandardNormal);
        mean + std * z
    })
}

/// Kaiming uniform initialization, U(-bound, bound) with
/// bound = gain * sqrt(3 / fan_in) and gain = sqrt(2 / (1 + a^2)).
///
/// `fan_in` is the column count, matching a factor stored as [RANK, IN].
pub fn kaiming_uniform(rows: usize, cols: usize, a: f32) -> Array2<f32> {
    let fan_in = cols.max(1);
    let gain = (2.0 / (1.0 + a * a)).sqrt();
    let bound = gain * (3.0 / fan_in as f32).sqrt();
    let uniform = Uniform::new_inclusive(-bound, bound);
    let mut rng = rand::thread_rng();
    Array2::from_shape_fn((rows, cols), |_| uniform.sample(&mut rng))
}

/// View a weight in [OUT, IN] orientation regardless of how it is stored.
///
/// `transposed` marks Conv1D-style storage ([IN, OUT]), mirroring the
/// `fan_in_fan_out` flag on the node that owns the weight.
pub fn as_out_in(weight: &Array2<f32>, transposed: bool) -> ArrayView2<'_, f32> {
    if transposed {
        weight.t()
    } else {
        weight.view()
    }
}

/// ||M - I||_F for a square matrix, without materializing the identity.
pub fn frobenius_distance_from_identity(m: &Array2<f32>) -> f32 {
    let n = m.nrows().min(m.ncols());
    let mut acc = 0.0f32;
    for ((i, j), v) in m.indexed_iter() {
        let target = if i == j && i < n { 1.0 } else { 0.0 };
        let d = v - target;
        acc += d * d;
    }
    acc.sqrt()
}

/// Inverted dropout on a batch of row vectors. Identity when `p == 0.0`.
///
/// Surviving entries are scaled by 1/(1-p) so the expected activation is
/// unchanged, matching the training-time convention of the adapter branch.
pub fn dropout(x: &Array2<f32>, p: f32) -> Array2<f32> {
    if p <= 0.0 {
        return x.clone();
    }
    let keep = 1.0 - p;
    let mut rng = rand::thread_rng();
    x.mapv(|v| {
        if rng.gen::<f32>() < keep {
            v / keep
        } else {
            0.0
        }
    })
}

/// Elementwise product of a vector with an optional running product.
/// Used to accumulate per-channel scales across active scaling adapters.
pub fn accumulate_scale(acc: Option<Array1<f32>>, scale: &Array1<f32>) -> Array1<f32> {
    match acc {
        Some(prev) => prev * scale,
        None => scale.clone(),
    }
}
