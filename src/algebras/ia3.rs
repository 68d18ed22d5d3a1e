/// Per-channel multiplicative scaling (IA3-style)
///
/// A feed-forward node scales its input elementwise before the base
/// projection; any other node scales the output elementwise after it.
/// The orientation matters: the learned vector is per-input-channel in
/// the first case and per-output-channel in the second.

use crate::graph::Projection;
use crate::{Error, Result};
use ndarray::{Array1, Axis};
use tracing::warn;

/// Tolerance added when dividing the base weight during unmerge. The
/// restored weight is therefore not bit-exact; callers are warned.
pub const UNMERGE_EPSILON: f32 = 1e-8;

#[derive(Debug, Clone)]
pub struct Ia3Unit {
    /// Learned multipliers: length IN for feed-forward nodes, OUT
    /// otherwise.
    pub scale: Array1<f32>,
    pub is_feedforward: bool,
}

impl Ia3Unit {
    pub fn new(
        in_features: usize,
        out_features: usize,
        is_feedforward: bool,
        init_weights: bool,
    ) -> Self {
        let len = if is_feedforward { in_features } else { out_features };
        let scale = if init_weights {
            // Ones: a fresh unit is an exact no-op.
            Array1::from_elem(len, 1.0)
        } else {
            crate::tensor_utils::randn(len, 1, 0.0, 1.0).remove_axis(Axis(1))
        };
        Self {
            scale,
            is_feedforward,
        }
    }

    /// Fold the multipliers into a base projection's weight in place.
    pub fn merge_into(&self, base: &mut Projection) -> Result<()> {
        self.check_len(base)?;
        let mut w = if base.transposed {
            base.weight.view_mut().reversed_axes()
        } else {
            base.weight.view_mut()
        };
        // w is [OUT, IN] from here on.
        if self.is_feedforward {
            w *= &self.scale;
        } else {
            w *= &self.scale.view().insert_axis(Axis(1));
        }
        Ok(())
    }

    /// Reverse [`merge_into`] by elementwise division. Guarded by a small
    /// epsilon, so the result is close but not bit-exact.
    pub fn unmerge_from(&self, base: &mut Projection) -> Result<()> {
        self.check_len(base)?;
        warn!("unmerge of a scaling adapter is approximate (epsilon-guarded division)");
        let divisor = &self.scale + UNMERGE_EPSILON;
        let mut w = if base.transposed {
            base.weight.view_mut().reversed_axes()
        } else {
            base.weight.view_mut()
        };
        if self.is_feedforward {
            w /= &divisor;
        } else {
            w /= &divisor.view().insert_axis(Axis(1));
        }
        Ok(())
    }

    fn check_len(&self, base: &Projection) -> Result<()> {
        let expected = if self.is_feedforward {
            base.in_features()
        } else {
            base.out_features()
        };
        if self.scale.len() != expected {
            return Err(Error::ShapeMismatch {
                expected: vec![expected],
                got: vec![self.scale.len()],
            });
        }
        Ok(())
    }
}
