/// Adapter registry / container
///
/// Owns the surgically modified model graph and every adapter name
/// attached to it. Enforces the global invariant of the adaptive variant:
/// at most one adapter may be trainable (non-inference) at a time, because
/// the rank allocator's budget bookkeeping is scoped to a single adapter.

use crate::allocator::{RankAllocator, RankPattern};
use crate::config::AdapterConfig;
use crate::graph::Module;
use crate::surgeon::Surgeon;
use crate::tensor_utils::frobenius_distance_from_identity;
use crate::algebras::Unit;
use crate::{Error, Result};
use indexmap::IndexMap;

#[derive(Debug)]
pub struct AdapterModel {
    model: Module,
    surgeon: Surgeon,
    configs: IndexMap<String, AdapterConfig>,
    /// O(1) stand-in for scanning configs on every add.
    trainable_count: usize,
    trainable_adapter: Option<String>,
    allocator: Option<RankAllocator>,
    /// Frozen allocation exported after budget finalization.
    rank_pattern: Option<RankPattern>,
}

impl AdapterModel {
    /// Wrap a base model and inject a first adapter. Base parameters are
    /// frozen; only adapter units remain trainable.
    pub fn new(model: Module, adapter_name: &str, config: AdapterConfig) -> Result<Self> {
        Self::with_surgeon(model, adapter_name, config, Surgeon::new())
    }

    /// Like [`new`](Self::new) but with a surgeon that may have quantized
    /// backends registered.
    pub fn with_surgeon(
        mut model: Module,
        adapter_name: &str,
        config: AdapterConfig,
        surgeon: Surgeon,
    ) -> Result<Self> {
        model.freeze_base();
        let mut this = Self {
            model,
            surgeon,
            configs: IndexMap::new(),
            trainable_count: 0,
            trainable_adapter: None,
            allocator: None,
            rank_pattern: None,
        };
        this.add_adapter(adapter_name, config)?;
        Ok(this)
    }

    pub fn model(&self) -> &Module {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut Module {
        &mut self.model
    }

    pub fn config(&self, adapter_name: &str) -> Option<&AdapterConfig> {
        self.configs.get(adapter_name)
    }

    pub fn adapter_names(&self) -> impl Iterator<Item = &str> {
        self.configs.keys().map(String::as_str)
    }

    pub fn trainable_adapter(&self) -> Option<&str> {
        self.trainable_adapter.as_deref()
    }

    pub fn is_trainable(&self, adapter_name: &str) -> bool {
        self.configs
            .get(adapter_name)
            .map(|c| !c.inference_mode)
            .unwrap_or(false)
    }

    /// The frozen rank allocation, once the budget has been finalized.
    pub fn rank_pattern(&self) -> Option<&RankPattern> {
        self.rank_pattern.as_ref()
    }

    /// Register a new adapter and inject it into the graph.
    ///
    /// Rejects a second trainable adapter: the allocator's budget
    /// bookkeeping cannot span adapters, so all but one must be added in
    /// inference mode.
    pub fn add_adapter(&mut self, adapter_name: &str, config: AdapterConfig) -> Result<()> {
        config.validate()?;
        if self.configs.contains_key(adapter_name) {
            return Err(Error::Config(format!(
                "adapter {adapter_name:?} is already registered"
            )));
        }
        if !config.inference_mode && self.trainable_count >= 1 {
            return Err(Error::Config(
                "only one trainable adapter is supported; \
                 set inference_mode on all adapters except the one being trained"
                    .into(),
            ));
        }

        self.surgeon.inject(&mut self.model, adapter_name, &config)?;

        if !config.inference_mode {
            self.trainable_count += 1;
            self.trainable_adapter = Some(adapter_name.to_string());
            if let Some(schedule) = &config.schedule {
                self.allocator = Some(RankAllocator::new(
                    &self.model,
                    adapter_name,
                    schedule.clone(),
                )?);
            }
        }
        self.configs.insert(adapter_name.to_string(), config);
        Ok(())
    }

    /// Remove an adapter's units everywhere and drop its registration.
    pub fn remove_adapter(&mut self, adapter_name: &str) -> Result<()> {
        let config = self
            .configs
            .shift_remove(adapter_name)
            .ok_or_else(|| Error::UnknownAdapter(adapter_name.to_string()))?;
        if !config.inference_mode {
            self.trainable_count -= 1;
            self.trainable_adapter = None;
            self.allocator = None;
        }
        for path in self.model.adapted_paths() {
            let layer = self.adapted_mut(&path)?;
            layer.remove_unit(adapter_name);
        }
        Ok(())
    }

    /// Change which adapter names participate in forward computation on
    /// every wrapped node.
    pub fn set_active(&mut self, names: &[String]) -> Result<()> {
        for name in names {
            if !self.configs.contains_key(name) {
                return Err(Error::UnknownAdapter(name.clone()));
            }
        }
        for path in self.model.adapted_paths() {
            self.adapted_mut(&path)?.set_active(names);
        }
        Ok(())
    }

    pub fn enable_adapters(&mut self, enabled: bool) -> Result<()> {
        for path in self.model.adapted_paths() {
            self.adapted_mut(&path)?.set_disabled(!enabled)?;
        }
        Ok(())
    }

    /// Merge the active adapters into every wrapped node's base weight.
    pub fn merge_adapter(&mut self) -> Result<()> {
        for path in self.model.adapted_paths() {
            self.adapted_mut(&path)?.merge(None)?;
        }
        Ok(())
    }

    /// Reverse every merged adapter on every wrapped node.
    pub fn unmerge_adapter(&mut self) -> Result<()> {
        for path in self.model.adapted_paths() {
            self.adapted_mut(&path)?.unmerge()?;
        }
        Ok(())
    }

    /// Merge all active adapters and return the pure base model, with no
    /// adapter nodes remaining in the graph. Irreversible.
    pub fn merge_and_unload(mut self) -> Result<Module> {
        for path in self.model.adapted_paths() {
            let node = self.model.replace(&path, Module::container())?;
            let layer = match node {
                Module::Adapted(layer) => layer,
                other => {
                    self.model.replace(&path, other)?;
                    return Err(Error::UnknownModule(path));
                }
            };
            let restored = match layer.into_base_merged()? {
                crate::layer::BaseNode::Dense(p) => Module::Linear(p),
                crate::layer::BaseNode::Quant(q) => Module::Quantized(q),
            };
            self.model.replace(&path, restored)?;
        }
        Ok(self.model)
    }

    /// Orthogonality penalty over the trainable adapter's SVD factor
    /// pairs: mean of ||A Aᵀ − I||_F and ||Bᵀ B − I||_F across units,
    /// times the configured weight. Added to the task loss by the caller.
    pub fn orth_regularization(&self) -> Result<f32> {
        let name = self
            .trainable_adapter
            .as_deref()
            .ok_or_else(|| Error::Config("no trainable adapter registered".into()))?;
        let weight = self.configs[name].orth_reg_weight;
        if weight <= 0.0 {
            return Err(Error::Config(
                "orth_reg_weight must be greater than 0".into(),
            ));
        }
        let mut total = 0.0f32;
        let mut count = 0usize;
        for (_path, node) in self.model.named_leaves() {
            let Some(layer) = node.as_adapted() else {
                continue;
            };
            if layer.is_disabled() || !layer.active_names().any(|n| n == name) {
                continue;
            }
            if let Some(Unit::Svd(u)) = layer.unit(name) {
                total += frobenius_distance_from_identity(&u.lora_a.dot(&u.lora_a.t()));
                total += frobenius_distance_from_identity(&u.lora_b.t().dot(&u.lora_b));
                count += 2;
            }
        }
        if count == 0 {
            return Ok(0.0);
        }
        Ok(weight * total / count as f32)
    }

    /// Drive one allocator step after the optimizer update. Returns the
    /// budget in force, or `None` when no allocator is configured.
    pub fn update_and_allocate(&mut self, step: usize) -> Result<Option<usize>> {
        let Some(allocator) = self.allocator.as_mut() else {
            return Ok(None);
        };
        let budget = allocator.update_and_allocate(&mut self.model, step)?;
        if let Some(pattern) = allocator.rank_pattern() {
            self.rank_pattern = Some(pattern.clone());
        }
        Ok(Some(budget))
    }

    fn adapted_mut(&mut self, path: &str) -> Result<&mut crate::layer::AdapterLayer> {
        self.model
            .get_mut(path)
            .and_then(Module::as_adapted_mut)
            .ok_or_else(|| Error::UnknownModule(path.to_string()))
    }
}
