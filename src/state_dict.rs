/// Adapter parameter serialization
///
/// The storage format is a flat mapping from dotted parameter path to
/// tensor value, using the convention
/// `base_model.model.<node-path>.<param>.<adapter-name>` with param one of
/// `lora_A`, `lora_E`, `lora_B`, `rank_mask`, `ia3_l`. The mask entry
/// carries a finalized allocation across the round trip, so a pruned
/// adapter stays pruned after reload. Load-time remapping of legacy
/// layouts is a pure string transform supplied by the caller.

use crate::algebras::Unit;
use crate::graph::Module;
use crate::registry::AdapterModel;
use crate::{Error, Result};
use indexmap::IndexMap;
use ndarray::{Array1, Array2};
use tracing::warn;

pub const PATH_PREFIX: &str = "base_model.model.";
/// Distributed-training wrapper segment stripped by the legacy remapper.
pub const LEGACY_DDP_MARKER: &str = "module.";

#[derive(Debug, Clone, PartialEq)]
pub enum TensorValue {
    Matrix(Array2<f32>),
    Vector(Array1<f32>),
}

pub type StateDict = IndexMap<String, TensorValue>;

/// Pure string-path transform applied to incoming keys before matching.
pub type KeyRemap<'a> = &'a dyn Fn(&str) -> String;

/// Default remapper for legacy layouts: strips the distributed-training
/// artifact marker and reinstates the outer wrapper prefix.
pub fn strip_legacy_prefixes(key: &str) -> String {
    let mut key = key.to_string();
    if let Some(stripped) = key.strip_prefix(LEGACY_DDP_MARKER) {
        key = stripped.to_string();
    }
    if let Some(rest) = key.strip_prefix(PATH_PREFIX) {
        if let Some(stripped) = rest.strip_prefix(LEGACY_DDP_MARKER) {
            key = format!("{PATH_PREFIX}{stripped}");
        }
    } else {
        key = format!("{PATH_PREFIX}{key}");
    }
    key
}

/// Collect one adapter's parameters across all wrapped nodes.
pub fn save_adapter(model: &AdapterModel, adapter_name: &str) -> Result<StateDict> {
    if model.config(adapter_name).is_none() {
        return Err(Error::UnknownAdapter(adapter_name.to_string()));
    }
    let mut dict = StateDict::new();
    for (path, node) in model.model().named_leaves() {
        let Some(layer) = node.as_adapted() else {
            continue;
        };
        let Some(unit) = layer.unit(adapter_name) else {
            continue;
        };
        let key = |param: &str| format!("{PATH_PREFIX}{path}.{param}.{adapter_name}");
        match unit {
            Unit::Lora(u) => {
                dict.insert(key("lora_A"), TensorValue::Matrix(u.lora_a.clone()));
                dict.insert(key("lora_B"), TensorValue::Matrix(u.lora_b.clone()));
            }
            Unit::Svd(u) => {
                dict.insert(key("lora_A"), TensorValue::Matrix(u.lora_a.clone()));
                dict.insert(key("lora_E"), TensorValue::Vector(u.lora_e.clone()));
                dict.insert(key("lora_B"), TensorValue::Matrix(u.lora_b.clone()));
                dict.insert(key("rank_mask"), TensorValue::Vector(u.rank_mask.clone()));
            }
            Unit::Ia3(u) => {
                dict.insert(key("ia3_l"), TensorValue::Vector(u.scale.clone()));
            }
        }
    }
    Ok(dict)
}

/// Load one adapter's parameters into an already-injected model.
///
/// Keys are remapped first (if a remapper is given), then matched against
/// the canonical path convention. Entries for other adapters are ignored;
/// entries naming unknown nodes are warned about and skipped; shape
/// mismatches are fatal.
pub fn load_adapter(
    model: &mut AdapterModel,
    adapter_name: &str,
    dict: &StateDict,
    remap: Option<KeyRemap<'_>>,
) -> Result<usize> {
    if model.config(adapter_name).is_none() {
        return Err(Error::UnknownAdapter(adapter_name.to_string()));
    }
    let mut loaded = 0usize;
    for (raw_key, value) in dict {
        let key = match remap {
            Some(remap) => remap(raw_key),
            None => raw_key.clone(),
        };
        let Some((path, param, name)) = parse_key(&key) else {
            warn!(key = %key, "skipping state-dict entry with unrecognized layout");
            continue;
        };
        if name != adapter_name {
            continue;
        }
        let Some(layer) = model
            .model_mut()
            .get_mut(&path)
            .and_then(Module::as_adapted_mut)
        else {
            warn!(key = %key, node = %path, "skipping entry for a node that is not adapter-wrapped");
            continue;
        };
        let Some(unit) = layer.unit_mut(adapter_name) else {
            warn!(key = %key, node = %path, "skipping entry; adapter not attached to this node");
            continue;
        };
        assign_param(unit, param, value)?;
        loaded += 1;
    }
    Ok(loaded)
}

/// Split a canonical key into (node path, parameter name, adapter name).
fn parse_key(key: &str) -> Option<(String, &str, &str)> {
    let rest = key.strip_prefix(PATH_PREFIX)?;
    let (rest, adapter) = rest.rsplit_once('.')?;
    let (path, param) = rest.rsplit_once('.')?;
    if !matches!(param, "lora_A" | "lora_E" | "lora_B" | "rank_mask" | "ia3_l") {
        return None;
    }
    Some((path.to_string(), param, adapter))
}

fn assign_param(unit: &mut Unit, param: &str, value: &TensorValue) -> Result<()> {
    match (unit, param, value) {
        (Unit::Lora(u), "lora_A", TensorValue::Matrix(m)) => {
            check_dims(u.lora_a.dim(), m.dim())?;
            u.lora_a = m.clone();
        }
        (Unit::Lora(u), "lora_B", TensorValue::Matrix(m)) => {
            check_dims(u.lora_b.dim(), m.dim())?;
            u.lora_b = m.clone();
        }
        (Unit::Svd(u), "lora_A", TensorValue::Matrix(m)) => {
            check_dims(u.lora_a.dim(), m.dim())?;
            u.lora_a = m.clone();
        }
        (Unit::Svd(u), "lora_B", TensorValue::Matrix(m)) => {
            check_dims(u.lora_b.dim(), m.dim())?;
            u.lora_b = m.clone();
        }
        (Unit::Svd(u), "lora_E", TensorValue::Vector(v)) => {
            check_len(u.lora_e.len(), v.len())?;
            u.lora_e = v.clone();
        }
        (Unit::Svd(u), "rank_mask", TensorValue::Vector(v)) => {
            check_len(u.rank_mask.len(), v.len())?;
            u.set_rank_mask(v.clone())?;
        }
        (Unit::Ia3(u), "ia3_l", TensorValue::Vector(v)) => {
            check_len(u.scale.len(), v.len())?;
            u.scale = v.clone();
        }
        (_, param, _) => {
            return Err(Error::InvalidOperation(format!(
                "parameter {param:?} does not belong to this adapter's algebra"
            )));
        }
    }
    Ok(())
}

fn check_dims(expected: (usize, usize), got: (usize, usize)) -> Result<()> {
    if expected != got {
        return Err(Error::ShapeMismatch {
            expected: vec![expected.0, expected.1],
            got: vec![got.0, got.1],
        });
    }
    Ok(())
}

fn check_len(expected: usize, got: usize) -> Result<()> {
    if expected != got {
        return Err(Error::ShapeMismatch {
            expected: vec![expected],
            got: vec![got],
        });
    }
    Ok(())
}
