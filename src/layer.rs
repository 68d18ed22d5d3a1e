/// Adapter-augmented projection node
///
/// An [`AdapterLayer`] owns one frozen base projection plus every adapter
/// unit attached to it, keyed by adapter name. It implements the forward
/// contract over the currently active names and the merge/unmerge contract
/// that folds adapted weights into the base weight and back.
///
/// Invariants:
/// - an adapter name appears in at most one of {active, merged};
/// - merge and unmerge strictly alternate per name, out-of-order calls are
///   no-ops that surface a warning;
/// - base parameters are only ever mutated by merge/unmerge.

use crate::algebras::{Ia3Unit, LoraUnit, SvdUnit, Unit};
use crate::config::{AdapterConfig, Algebra};
use crate::graph::{Projection, QuantProjection};
use crate::tensor_utils::{accumulate_scale, dropout};
use crate::{Error, Result};
use indexmap::{IndexMap, IndexSet};
use ndarray::{Array1, Array2};
use tracing::warn;

/// The wrapped base node: a plain dense projection or an opaque quantized
/// variant whose storage cannot be merged into.
#[derive(Debug)]
pub enum BaseNode {
    Dense(Projection),
    Quant(QuantProjection),
}

impl BaseNode {
    pub fn projection(&self) -> &Projection {
        match self {
            BaseNode::Dense(p) => p,
            BaseNode::Quant(q) => &q.inner,
        }
    }

    fn projection_mut(&mut self) -> &mut Projection {
        match self {
            BaseNode::Dense(p) => p,
            BaseNode::Quant(q) => &mut q.inner,
        }
    }

    pub fn is_quantized(&self) -> bool {
        matches!(self, BaseNode::Quant(_))
    }
}

#[derive(Debug)]
pub struct AdapterLayer {
    base: BaseNode,
    units: IndexMap<String, Unit>,
    active: IndexSet<String>,
    merged: Vec<String>,
    disabled: bool,
}

impl AdapterLayer {
    /// Wrap a base node and attach a first unit under `adapter_name`.
    /// The base projection is frozen as part of wrapping.
    pub fn new(
        mut base: BaseNode,
        adapter_name: &str,
        config: &AdapterConfig,
        is_feedforward: bool,
    ) -> Result<Self> {
        base.projection_mut().frozen = true;
        let mut layer = Self {
            base,
            units: IndexMap::new(),
            active: IndexSet::new(),
            merged: Vec::new(),
            disabled: false,
        };
        layer.update_layer(adapter_name, config, is_feedforward)?;
        Ok(layer)
    }

    pub fn in_features(&self) -> usize {
        self.base.projection().in_features()
    }

    pub fn out_features(&self) -> usize {
        self.base.projection().out_features()
    }

    pub fn base(&self) -> &BaseNode {
        &self.base
    }

    /// The base weight, for tests and merge verification.
    pub fn base_weight(&self) -> &Array2<f32> {
        &self.base.projection().weight
    }

    pub fn freeze_base(&mut self) {
        self.base.projection_mut().frozen = true;
    }

    pub fn unit(&self, name: &str) -> Option<&Unit> {
        self.units.get(name)
    }

    pub fn unit_mut(&mut self, name: &str) -> Option<&mut Unit> {
        self.units.get_mut(name)
    }

    pub fn unit_names(&self) -> impl Iterator<Item = &str> {
        self.units.keys().map(String::as_str)
    }

    pub fn active_names(&self) -> impl Iterator<Item = &str> {
        self.active.iter().map(String::as_str)
    }

    pub fn merged_names(&self) -> &[String] {
        &self.merged
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// Create or replace the unit stored under `adapter_name`.
    ///
    /// Re-running the surgeon with a new adapter name lands here instead of
    /// re-wrapping the node; so does an explicit reconfiguration.
    pub fn update_layer(
        &mut self,
        adapter_name: &str,
        config: &AdapterConfig,
        is_feedforward: bool,
    ) -> Result<()> {
        if self.merged.iter().any(|m| m == adapter_name) {
            return Err(Error::InvalidOperation(format!(
                "adapter {adapter_name:?} is merged; unmerge before reconfiguring it"
            )));
        }
        let (inf, outf) = (self.in_features(), self.out_features());
        let unit = match config.algebra {
            Algebra::LowRank => Unit::Lora(LoraUnit::new(
                inf,
                outf,
                config.rank,
                config.alpha,
                config.dropout,
                config.init_weights,
            )?),
            Algebra::Svd => Unit::Svd(SvdUnit::new(
                inf,
                outf,
                config.rank,
                config.alpha,
                config.dropout,
                config.init_weights,
            )?),
            Algebra::Scaling => {
                Unit::Ia3(Ia3Unit::new(inf, outf, is_feedforward, config.init_weights))
            }
        };
        let first = self.units.is_empty();
        self.units.insert(adapter_name.to_string(), unit);
        if first {
            self.active.insert(adapter_name.to_string());
        }
        Ok(())
    }

    /// Replace which adapter names participate in forward computation.
    /// Names that are unknown or currently merged are skipped with a
    /// warning.
    pub fn set_active(&mut self, names: &[String]) {
        self.active.clear();
        for name in names {
            if !self.units.contains_key(name) {
                warn!(adapter = %name, "cannot activate an adapter not attached to this node; skipping");
                continue;
            }
            if self.merged.iter().any(|m| m == name) {
                warn!(adapter = %name, "cannot activate a merged adapter; skipping");
                continue;
            }
            self.active.insert(name.clone());
        }
    }

    /// Enable or disable all adapters on this node. Disabling while merged
    /// unmerges first so the base forward is pure.
    pub fn set_disabled(&mut self, disabled: bool) -> Result<()> {
        if disabled && !self.merged.is_empty() {
            self.unmerge()?;
        }
        self.disabled = disabled;
        Ok(())
    }

    /// Forward a batch of row vectors through base plus active adapters.
    pub fn forward(&self, x: &Array2<f32>, training: bool) -> Result<Array2<f32>> {
        if self.disabled || self.active.is_empty() {
            return self.base.projection().forward(x);
        }

        // Scaling adapters compose multiplicatively around the base call;
        // low-rank adapters add their contribution afterwards.
        let mut input_scale: Option<Array1<f32>> = None;
        let mut output_scale: Option<Array1<f32>> = None;
        for name in &self.active {
            if let Some(Unit::Ia3(u)) = self.units.get(name) {
                if u.is_feedforward {
                    input_scale = Some(accumulate_scale(input_scale, &u.scale));
                } else {
                    output_scale = Some(accumulate_scale(output_scale, &u.scale));
                }
            }
        }

        let scaled_x;
        let base_input = match &input_scale {
            Some(scale) => {
                scaled_x = x * scale;
                &scaled_x
            }
            None => x,
        };
        let mut y = self.base.projection().forward(base_input)?;
        if let Some(scale) = &output_scale {
            y = y * scale;
        }

        for name in &self.active {
            let unit = &self.units[name];
            let p = unit.dropout();
            let branch_input;
            let adapter_x = if training && p > 0.0 {
                branch_input = dropout(x, p);
                &branch_input
            } else {
                x
            };
            if let Some(contribution) = unit.forward_contribution(adapter_x)? {
                y += &contribution;
            }
        }
        Ok(y)
    }

    /// Fold the named adapters (default: all active) into the base weight.
    /// Re-merging an already-merged name is a warned no-op.
    pub fn merge(&mut self, names: Option<&[String]>) -> Result<()> {
        let names: Vec<String> = match names {
            Some(names) => names.to_vec(),
            None => self.active.iter().cloned().collect(),
        };
        for name in names {
            if !self.units.contains_key(&name) {
                warn!(adapter = %name, "merge requested for an adapter not attached to this node; skipping");
                continue;
            }
            if self.merged.iter().any(|m| *m == name) {
                warn!(adapter = %name, "adapter already merged; skipping");
                continue;
            }
            if self.base.is_quantized() {
                return Err(Error::InvalidOperation(format!(
                    "cannot merge adapter {name:?} into quantized base storage"
                )));
            }
            self.apply_delta(&name, MergeDirection::Merge)?;
            self.active.shift_remove(&name);
            self.merged.push(name);
        }
        Ok(())
    }

    /// Reverse every merged adapter, most recent first. Calling without
    /// anything merged is a warned no-op.
    pub fn unmerge(&mut self) -> Result<()> {
        if self.merged.is_empty() {
            warn!("already unmerged, nothing to do");
            return Ok(());
        }
        while let Some(name) = self.merged.pop() {
            self.apply_delta(&name, MergeDirection::Unmerge)?;
            self.active.insert(name);
        }
        Ok(())
    }

    fn apply_delta(&mut self, name: &str, direction: MergeDirection) -> Result<()> {
        // Compute before borrowing the base mutably.
        let additive_delta = match &self.units[name] {
            Unit::Lora(u) => Some(u.delta_weight()),
            Unit::Svd(u) => Some(u.delta_weight()),
            Unit::Ia3(_) => None,
        };
        let base = self.base.projection_mut();
        match (&self.units[name], additive_delta) {
            (Unit::Ia3(u), _) => match direction {
                MergeDirection::Merge => u.merge_into(base),
                MergeDirection::Unmerge => u.unmerge_from(base),
            },
            (_, Some(delta)) => {
                // delta is [OUT, IN]; flip for Conv1D-style storage.
                let oriented = if base.transposed { delta.t().to_owned() } else { delta };
                match direction {
                    MergeDirection::Merge => base.weight += &oriented,
                    MergeDirection::Unmerge => base.weight -= &oriented,
                }
                Ok(())
            }
            _ => unreachable!("additive delta computed for every non-scaling unit"),
        }
    }

    /// Drop the unit stored under `adapter_name`. A merged unit is left in
    /// place with a warning; unmerge before removing it.
    pub fn remove_unit(&mut self, adapter_name: &str) {
        if self.merged.iter().any(|m| m == adapter_name) {
            warn!(adapter = %adapter_name, "refusing to remove a merged adapter; unmerge first");
            return;
        }
        self.units.shift_remove(adapter_name);
        self.active.shift_remove(adapter_name);
    }

    /// Record the gradient of the loss w.r.t. the SVD magnitude vector,
    /// written by the external training loop after backward.
    pub fn set_e_grad(&mut self, adapter_name: &str, grad: Array1<f32>) -> Result<()> {
        match self.units.get_mut(adapter_name) {
            Some(Unit::Svd(u)) => {
                if grad.len() != u.init_rank {
                    return Err(Error::ShapeMismatch {
                        expected: vec![u.init_rank],
                        got: vec![grad.len()],
                    });
                }
                u.grad_e = Some(grad);
                Ok(())
            }
            Some(_) => Err(Error::InvalidOperation(format!(
                "adapter {adapter_name:?} is not SVD-structured"
            ))),
            None => Err(Error::UnknownAdapter(adapter_name.to_string())),
        }
    }

    /// Consume the layer and return the base node, with every active
    /// adapter merged in. Used by `merge_and_unload`.
    pub(crate) fn into_base_merged(mut self) -> Result<BaseNode> {
        if self.base.is_quantized() {
            if !self.active.is_empty() {
                warn!("dropping adapters on a quantized node; quantized storage cannot be merged into");
            }
        } else if !self.disabled {
            self.merge(None)?;
        }
        Ok(self.base)
    }
}

#[derive(Clone, Copy)]
enum MergeDirection {
    Merge,
    Unmerge,
}
