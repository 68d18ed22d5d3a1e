/// Model surgeon
///
/// Traverses the base model graph once, matches target nodes by name
/// pattern, and substitutes adapter-augmented nodes in place. The matched
/// node's frozen parameters and its parent wiring are preserved; only the
/// child slot in the parent container changes.

use crate::config::{AdapterConfig, Algebra};
use crate::graph::Module;
use crate::layer::{AdapterLayer, BaseNode};
use crate::{Error, Result};
use indexmap::IndexSet;
use tracing::{debug, warn};

/// Performs adapter injection. Quantized node kinds must be registered
/// before a config can target them; adapting an unregistered backend is
/// fatal at the point it is requested.
#[derive(Debug, Default)]
pub struct Surgeon {
    quant_backends: IndexSet<String>,
}

impl Surgeon {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare that kernels for the named quantized backend are available.
    pub fn register_quant_backend(&mut self, backend: &str) {
        self.quant_backends.insert(backend.to_string());
    }

    /// Inject `adapter_name` into every node of `model` matching the
    /// config's target patterns.
    ///
    /// Nodes already wrapped get a new unit via `update_layer` instead of
    /// being re-wrapped. Zero matches is a configuration error.
    pub fn inject(
        &self,
        model: &mut Module,
        adapter_name: &str,
        config: &AdapterConfig,
    ) -> Result<usize> {
        config.validate()?;
        let targets: Vec<String> = model
            .leaf_paths()
            .into_iter()
            .filter(|path| matches_any(path, &config.target_modules))
            .collect();
        if targets.is_empty() {
            return Err(Error::Config(format!(
                "no target modules matched patterns {:?}",
                config.target_modules
            )));
        }

        for path in &targets {
            self.adapt_node(model, path, adapter_name, config)?;
            debug!(node = %path, adapter = %adapter_name, "attached adapter unit");
        }
        Ok(targets.len())
    }

    fn adapt_node(
        &self,
        model: &mut Module,
        path: &str,
        adapter_name: &str,
        config: &AdapterConfig,
    ) -> Result<()> {
        let is_feedforward = config.algebra == Algebra::Scaling
            && matches_any(path, &config.feedforward_modules);

        let node = model
            .get_mut(path)
            .ok_or_else(|| Error::UnknownModule(path.to_string()))?;

        if let Module::Adapted(layer) = node {
            return layer.update_layer(adapter_name, config, is_feedforward);
        }

        // Correct a conflicting weight-orientation flag rather than letting
        // the merge algebra silently operate on the wrong axes.
        let mut config = config.clone();
        match node {
            Module::Linear(p) | Module::Quantized(crate::graph::QuantProjection { inner: p, .. }) => {
                if config.fan_in_fan_out && !p.transposed {
                    warn!(
                        node = %path,
                        "fan_in_fan_out is set but the target stores its weight [OUT, IN]; clearing the flag"
                    );
                    config.fan_in_fan_out = false;
                } else if !config.fan_in_fan_out && p.transposed {
                    warn!(
                        node = %path,
                        "target stores its weight [IN, OUT] but fan_in_fan_out is unset; setting the flag"
                    );
                    config.fan_in_fan_out = true;
                }
            }
            _ => {}
        }

        if let Module::Quantized(q) = node {
            if !self.quant_backends.contains(&q.backend) {
                return Err(Error::BackendUnavailable(format!(
                    "node {path:?} requires the {:?} quantized backend, which is not registered",
                    q.backend
                )));
            }
        }

        let old = model.replace(path, Module::container())?;
        let base = match old {
            Module::Linear(p) => BaseNode::Dense(p),
            Module::Quantized(q) => BaseNode::Quant(q),
            other => {
                // Put the node back before failing so the graph stays intact.
                let kind = kind_name(&other);
                model.replace(path, other)?;
                return Err(Error::Config(format!(
                    "target module {path:?} has unsupported kind {kind}; only projection nodes can be adapted"
                )));
            }
        };
        let layer = AdapterLayer::new(base, adapter_name, &config, is_feedforward)?;
        model.replace(path, Module::Adapted(layer))?;
        Ok(())
    }
}

/// Exact dotted-path match, or trailing-segment suffix match.
fn matches_any(path: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|pattern| {
        path == pattern
            || path.ends_with(&format!(".{pattern}"))
    })
}

fn kind_name(node: &Module) -> &'static str {
    match node {
        Module::Container(_) => "container",
        Module::Linear(_) => "linear",
        Module::Quantized(_) => "quantized",
        Module::Adapted(_) => "adapted",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Projection, QuantProjection};
    use ndarray::Array2;

    fn linear(out: usize, inp: usize) -> Module {
        Module::Linear(Projection::new(Array2::zeros((out, inp)), None))
    }

    fn toy_model() -> Module {
        let mut attn = Module::container();
        attn.insert("q_proj", linear(4, 4)).unwrap();
        attn.insert("k_proj", linear(4, 4)).unwrap();
        attn.insert("v_proj", linear(4, 4)).unwrap();
        let mut block = Module::container();
        block.insert("attn", attn).unwrap();
        block.insert("down_proj", linear(4, 8)).unwrap();
        let mut model = Module::container();
        model.insert("layer0", block).unwrap();
        model
    }

    fn config(patterns: &[&str]) -> AdapterConfig {
        AdapterConfig::low_rank(patterns.iter().map(|s| s.to_string()).collect(), 2, 4.0)
    }

    #[test]
    fn test_suffix_match_injection() {
        let mut model = toy_model();
        let n = Surgeon::new()
            .inject(&mut model, "default", &config(&["q_proj", "v_proj"]))
            .unwrap();
        assert_eq!(n, 2);
        assert!(model.get("layer0.attn.q_proj").unwrap().as_adapted().is_some());
        assert!(model.get("layer0.attn.k_proj").unwrap().as_linear().is_some());
        assert!(model.get("layer0.attn.v_proj").unwrap().as_adapted().is_some());
    }

    #[test]
    fn test_exact_path_match() {
        let mut model = toy_model();
        let n = Surgeon::new()
            .inject(&mut model, "default", &config(&["layer0.down_proj"]))
            .unwrap();
        assert_eq!(n, 1);
    }

    #[test]
    fn test_no_match_is_config_error() {
        let mut model = toy_model();
        let err = Surgeon::new()
            .inject(&mut model, "default", &config(&["o_proj"]))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_reinjection_updates_existing_layer() {
        let mut model = toy_model();
        let surgeon = Surgeon::new();
        surgeon
            .inject(&mut model, "first", &config(&["q_proj"]))
            .unwrap();
        surgeon
            .inject(&mut model, "second", &config(&["q_proj"]))
            .unwrap();
        let layer = model
            .get("layer0.attn.q_proj")
            .unwrap()
            .as_adapted()
            .unwrap();
        assert_eq!(layer.unit_names().count(), 2);
    }

    #[test]
    fn test_fan_in_fan_out_corrected() {
        let mut model = toy_model();
        let cfg = config(&["q_proj"]).with_fan_in_fan_out(true);
        // q_proj stores [OUT, IN]; the conflicting flag is corrected, not fatal.
        Surgeon::new().inject(&mut model, "default", &cfg).unwrap();
        assert!(model.get("layer0.attn.q_proj").unwrap().as_adapted().is_some());
    }

    #[test]
    fn test_unregistered_quant_backend_is_fatal() {
        let mut model = toy_model();
        model
            .get_mut("layer0.attn")
            .unwrap()
            .insert(
                "quant_proj",
                Module::Quantized(QuantProjection {
                    inner: Projection::new(Array2::zeros((4, 4)), None),
                    backend: "int8".into(),
                }),
            )
            .unwrap();
        let err = Surgeon::new()
            .inject(&mut model, "default", &config(&["quant_proj"]))
            .unwrap_err();
        assert!(matches!(err, Error::BackendUnavailable(_)));

        let mut surgeon = Surgeon::new();
        surgeon.register_quant_backend("int8");
        surgeon
            .inject(&mut model, "default", &config(&["quant_proj"]))
            .unwrap();
    }
}
