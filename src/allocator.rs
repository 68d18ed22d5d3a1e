/// Adaptive rank allocator
///
/// Observes per-direction importance signals from every SVD-structured
/// unit of the single trainable adapter, maintains smoothed scores, and
/// prunes rank directions globally under a shrinking budget.
///
/// Phases: warmup (full initial budget), tuning (budget shrinks along a
/// cubic schedule), finalized (mask frozen at the final budget), then
/// mask-only (the frozen pattern is re-applied, nothing is recomputed).

use crate::config::RankSchedule;
use crate::graph::Module;
use crate::{Error, Result};
use indexmap::IndexMap;
use ndarray::Array1;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Warmup,
    Tuning,
    Finalized,
    MaskOnly,
}

/// Frozen allocation: node path -> indices of retained directions.
pub type RankPattern = IndexMap<String, Vec<usize>>;

#[derive(Debug)]
pub struct RankAllocator {
    adapter_name: String,
    schedule: RankSchedule,
    /// Sensitivity EMA per direction, keyed by node path.
    sensitivity: IndexMap<String, Array1<f64>>,
    /// Uncertainty EMA on the sensitivity deviation.
    uncertainty: IndexMap<String, Array1<f64>>,
    rank_pattern: Option<RankPattern>,
    phase: Phase,
}

impl RankAllocator {
    /// Build the allocator for the trainable adapter, checking that the
    /// combined capacity of all SVD units can satisfy the final budget.
    pub fn new(model: &Module, adapter_name: &str, schedule: RankSchedule) -> Result<Self> {
        schedule.validate()?;
        let capacity: usize = svd_unit_paths(model, adapter_name)
            .iter()
            .map(|(_, rank)| rank)
            .sum();
        if capacity == 0 {
            return Err(Error::Config(format!(
                "adapter {adapter_name:?} has no SVD-structured units to allocate over"
            )));
        }
        if capacity < schedule.final_budget {
            return Err(Error::Config(format!(
                "final budget {} exceeds the total adapter capacity {}",
                schedule.final_budget, capacity
            )));
        }
        Ok(Self {
            adapter_name: adapter_name.to_string(),
            schedule,
            sensitivity: IndexMap::new(),
            uncertainty: IndexMap::new(),
            rank_pattern: None,
            phase: Phase::Warmup,
        })
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// The frozen allocation, available once the budget is finalized.
    pub fn rank_pattern(&self) -> Option<&RankPattern> {
        self.rank_pattern.as_ref()
    }

    /// Run one allocator step. Returns the budget in force at `step`.
    ///
    /// Before `tfinal` this updates the importance EMAs and re-masks to
    /// the scheduled budget; at `tfinal` it freezes the final mask and
    /// resets all EMA state; afterwards it only re-applies the frozen
    /// pattern, guarding against anything re-enabling pruned directions.
    pub fn update_and_allocate(&mut self, model: &mut Module, step: usize) -> Result<usize> {
        let budget = self.schedule.budget_at(step);
        if step < self.schedule.tfinal {
            self.phase = if step < self.schedule.tinit {
                Phase::Warmup
            } else {
                Phase::Tuning
            };
            self.update_importance(model)?;
            self.mask_to_budget(model, budget, false)?;
        } else if step == self.schedule.tfinal {
            self.update_importance(model)?;
            self.mask_to_budget(model, budget, true)?;
            self.reset_importance();
            self.phase = Phase::Finalized;
            info!(
                adapter = %self.adapter_name,
                budget,
                "rank budget finalized; importance tracking stopped"
            );
        } else {
            self.phase = Phase::MaskOnly;
            self.apply_rank_pattern(model)?;
        }
        Ok(budget)
    }

    /// Sensitivity and uncertainty EMA update over retained directions.
    fn update_importance(&mut self, model: &mut Module) -> Result<()> {
        let beta1 = self.schedule.beta1;
        let beta2 = self.schedule.beta2;
        for path in model.adapted_paths() {
            let Some(layer) = model.get_mut(&path).and_then(Module::as_adapted_mut) else {
                continue;
            };
            let Some(unit) = layer.unit_mut(&self.adapter_name).and_then(|u| u.as_svd_mut())
            else {
                continue;
            };
            let Some(grad) = unit.grad_e.take() else {
                debug!(node = %path, "no E gradient recorded this step; keeping previous scores");
                continue;
            };
            let rank = unit.init_rank;
            let s = self
                .sensitivity
                .entry(path.clone())
                .or_insert_with(|| Array1::zeros(rank));
            let u = self
                .uncertainty
                .entry(path.clone())
                .or_insert_with(|| Array1::zeros(rank));
            for k in 0..rank {
                if unit.rank_mask[k] <= 0.0 {
                    continue;
                }
                let sensitivity = (unit.lora_e[k] * grad[k]).abs() as f64;
                s[k] = beta1 * s[k] + (1.0 - beta1) * sensitivity;
                u[k] = beta2 * u[k] + (1.0 - beta2) * (sensitivity - s[k]).abs();
            }
        }
        Ok(())
    }

    /// Rank every direction globally by combined importance and keep the
    /// top `budget`. With `freeze` set, the surviving indices become the
    /// frozen rank pattern.
    fn mask_to_budget(&mut self, model: &mut Module, budget: usize, freeze: bool) -> Result<()> {
        // (path, direction, combined importance), over all SVD units.
        let mut scored: Vec<(String, usize, f64)> = Vec::new();
        for (path, rank) in svd_unit_paths(model, &self.adapter_name) {
            for k in 0..rank {
                let score = match (self.sensitivity.get(&path), self.uncertainty.get(&path)) {
                    (Some(s), Some(u)) => s[k] * u[k],
                    _ => 0.0,
                };
                scored.push((path.clone(), k, score));
            }
        }
        scored.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));

        let mut retained: IndexMap<String, Vec<usize>> = IndexMap::new();
        for (path, k, _) in scored.iter().take(budget) {
            retained.entry(path.clone()).or_default().push(*k);
        }
        for indices in retained.values_mut() {
            indices.sort_unstable();
        }

        for (path, rank) in svd_unit_paths(model, &self.adapter_name) {
            let Some(unit) = model
                .get_mut(&path)
                .and_then(Module::as_adapted_mut)
                .and_then(|l| l.unit_mut(&self.adapter_name))
                .and_then(|u| u.as_svd_mut())
            else {
                continue;
            };
            let mut mask = Array1::zeros(rank);
            if let Some(indices) = retained.get(&path) {
                for &k in indices {
                    mask[k] = 1.0;
                }
            }
            unit.set_rank_mask(mask)?;
        }

        if freeze {
            self.rank_pattern = Some(retained);
        }
        Ok(())
    }

    /// Re-apply the frozen pattern. Used every step after finalization.
    fn apply_rank_pattern(&self, model: &mut Module) -> Result<()> {
        let pattern = self
            .rank_pattern
            .as_ref()
            .ok_or_else(|| Error::InvalidOperation("no frozen rank pattern to apply".into()))?;
        for (path, rank) in svd_unit_paths(model, &self.adapter_name) {
            let Some(unit) = model
                .get_mut(&path)
                .and_then(Module::as_adapted_mut)
                .and_then(|l| l.unit_mut(&self.adapter_name))
                .and_then(|u| u.as_svd_mut())
            else {
                continue;
            };
            let mut mask = Array1::zeros(rank);
            for &k in pattern.get(&path).map(Vec::as_slice).unwrap_or(&[]) {
                mask[k] = 1.0;
            }
            unit.set_rank_mask(mask)?;
        }
        Ok(())
    }

    fn reset_importance(&mut self) {
        self.sensitivity.clear();
        self.uncertainty.clear();
    }
}

/// Paths and maximum ranks of every SVD unit belonging to `adapter_name`.
fn svd_unit_paths(model: &Module, adapter_name: &str) -> Vec<(String, usize)> {
    model
        .named_leaves()
        .into_iter()
        .filter_map(|(path, node)| {
            let layer = node.as_adapted()?;
            let unit = layer.unit(adapter_name)?.as_svd()?;
            Some((path, unit.init_rank))
        })
        .collect()
}
