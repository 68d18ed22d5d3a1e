/// Adapter algebra implementations
pub mod ia3;
pub mod lora;
pub mod svd;

pub use ia3::Ia3Unit;
pub use lora::LoraUnit;
pub use svd::SvdUnit;

use ndarray::Array2;

use crate::Result;

/// One named adapter's parameters attached to one wrapped node.
#[derive(Debug, Clone)]
pub enum Unit {
    Lora(LoraUnit),
    Svd(SvdUnit),
    Ia3(Ia3Unit),
}

impl Unit {
    /// Additive contribution of this unit for a batch input, if the
    /// algebra is additive. Scaling units contribute multiplicatively and
    /// return `None` here; the layer composes them separately.
    pub fn forward_contribution(&self, x: &Array2<f32>) -> Result<Option<Array2<f32>>> {
        match self {
            Unit::Lora(u) => u.forward_contribution(x).map(Some),
            Unit::Svd(u) => u.forward_contribution(x).map(Some),
            Unit::Ia3(_) => Ok(None),
        }
    }

    pub fn dropout(&self) -> f32 {
        match self {
            Unit::Lora(u) => u.dropout,
            Unit::Svd(u) => u.dropout,
            Unit::Ia3(_) => 0.0,
        }
    }

    pub fn as_svd(&self) -> Option<&SvdUnit> {
        match self {
            Unit::Svd(u) => Some(u),
            _ => None,
        }
    }

    pub fn as_svd_mut(&mut self) -> Option<&mut SvdUnit> {
        match self {
            Unit::Svd(u) => Some(u),
            _ => None,
        }
    }
}
