/// Base model graph
///
/// The surgeon operates on an externally assembled tree of named modules.
/// Only the leaf contract matters to this crate: a projection maps an input
/// row vector to an output row vector through a weight matrix and an
/// optional bias. Containers are opaque; attention blocks, embeddings and
/// the rest of the architecture live outside.

use crate::layer::AdapterLayer;
use crate::tensor_utils::as_out_in;
use crate::{Error, Result};
use indexmap::IndexMap;
use ndarray::{Array1, Array2};

/// A frozen dense projection node: `y = x Wᵀ + b`.
///
/// `transposed` marks Conv1D-style storage where the weight is kept
/// [IN, OUT] instead of the natural [OUT, IN].
#[derive(Debug, Clone)]
pub struct Projection {
    pub weight: Array2<f32>,
    pub bias: Option<Array1<f32>>,
    pub transposed: bool,
    /// Marked non-trainable once wrapped by the surgeon.
    pub frozen: bool,
}

impl Projection {
    pub fn new(weight: Array2<f32>, bias: Option<Array1<f32>>) -> Self {
        Self {
            weight,
            bias,
            transposed: false,
            frozen: false,
        }
    }

    /// Conv1D-style projection with [IN, OUT] weight storage.
    pub fn new_transposed(weight: Array2<f32>, bias: Option<Array1<f32>>) -> Self {
        Self {
            weight,
            bias,
            transposed: true,
            frozen: false,
        }
    }

    pub fn in_features(&self) -> usize {
        if self.transposed {
            self.weight.nrows()
        } else {
            self.weight.ncols()
        }
    }

    pub fn out_features(&self) -> usize {
        if self.transposed {
            self.weight.ncols()
        } else {
            self.weight.nrows()
        }
    }

    /// Forward a batch of row vectors: [N, IN] -> [N, OUT].
    pub fn forward(&self, x: &Array2<f32>) -> Result<Array2<f32>> {
        if x.ncols() != self.in_features() {
            return Err(Error::ShapeMismatch {
                expected: vec![x.nrows(), self.in_features()],
                got: vec![x.nrows(), x.ncols()],
            });
        }
        let w = as_out_in(&self.weight, self.transposed);
        let mut y = x.dot(&w.t());
        if let Some(bias) = &self.bias {
            y += bias;
        }
        Ok(y)
    }
}

/// An opaque quantized projection variant.
///
/// The dequantized weight view is carried so the wrapped node can still
/// run the forward contract; merge into quantized storage is rejected.
#[derive(Debug, Clone)]
pub struct QuantProjection {
    pub inner: Projection,
    /// Identifier of the kernel backend this node expects (e.g. "int8").
    pub backend: String,
}

/// One node of the externally defined model graph.
#[derive(Debug)]
pub enum Module {
    Container(IndexMap<String, Module>),
    Linear(Projection),
    Quantized(QuantProjection),
    Adapted(AdapterLayer),
}

impl Module {
    pub fn container() -> Self {
        Module::Container(IndexMap::new())
    }

    /// Insert a child under a container node, building the path as given.
    pub fn insert(&mut self, name: &str, child: Module) -> Result<()> {
        match self {
            Module::Container(children) => {
                children.insert(name.to_string(), child);
                Ok(())
            }
            _ => Err(Error::InvalidOperation(format!(
                "cannot insert child {name:?} into a leaf node"
            ))),
        }
    }

    /// Look up a node by dotted path. The empty path is the node itself.
    pub fn get(&self, path: &str) -> Option<&Module> {
        if path.is_empty() {
            return Some(self);
        }
        let mut node = self;
        for segment in path.split('.') {
            node = match node {
                Module::Container(children) => children.get(segment)?,
                _ => return None,
            };
        }
        Some(node)
    }

    pub fn get_mut(&mut self, path: &str) -> Option<&mut Module> {
        if path.is_empty() {
            return Some(self);
        }
        let mut node = self;
        for segment in path.split('.') {
            node = match node {
                Module::Container(children) => children.get_mut(segment)?,
                _ => return None,
            };
        }
        Some(node)
    }

    /// Replace the node at `path`, returning the previous occupant.
    /// The parent container keeps its wiring; only the child slot changes.
    pub fn replace(&mut self, path: &str, new: Module) -> Result<Module> {
        let (parent_path, name) = match path.rsplit_once('.') {
            Some((parent, name)) => (parent, name),
            None => ("", path),
        };
        let parent = self
            .get_mut(parent_path)
            .ok_or_else(|| Error::UnknownModule(parent_path.to_string()))?;
        match parent {
            Module::Container(children) => {
                let slot = children
                    .get_mut(name)
                    .ok_or_else(|| Error::UnknownModule(path.to_string()))?;
                Ok(std::mem::replace(slot, new))
            }
            _ => Err(Error::UnknownModule(path.to_string())),
        }
    }

    /// Depth-first iteration over all leaf nodes as `(dotted_path, node)`.
    pub fn named_leaves(&self) -> Vec<(String, &Module)> {
        let mut out = Vec::new();
        self.collect_leaves(String::new(), &mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, prefix: String, out: &mut Vec<(String, &'a Module)>) {
        match self {
            Module::Container(children) => {
                for (name, child) in children {
                    let path = if prefix.is_empty() {
                        name.clone()
                    } else {
                        format!("{prefix}.{name}")
                    };
                    child.collect_leaves(path, out);
                }
            }
            _ => out.push((prefix, self)),
        }
    }

    /// Paths of all leaves, in traversal order.
    pub fn leaf_paths(&self) -> Vec<String> {
        self.named_leaves().into_iter().map(|(p, _)| p).collect()
    }

    /// Paths of all adapter-wrapped nodes.
    pub fn adapted_paths(&self) -> Vec<String> {
        self.named_leaves()
            .into_iter()
            .filter(|(_, node)| matches!(node, Module::Adapted(_)))
            .map(|(p, _)| p)
            .collect()
    }

    /// Mark every base projection in the tree non-trainable.
    pub fn freeze_base(&mut self) {
        match self {
            Module::Container(children) => {
                for child in children.values_mut() {
                    child.freeze_base();
                }
            }
            Module::Linear(p) => p.frozen = true,
            Module::Quantized(q) => q.inner.frozen = true,
            Module::Adapted(layer) => layer.freeze_base(),
        }
    }

    pub fn as_adapted(&self) -> Option<&AdapterLayer> {
        match self {
            Module::Adapted(layer) => Some(layer),
            _ => None,
        }
    }

    pub fn as_adapted_mut(&mut self) -> Option<&mut AdapterLayer> {
        match self {
            Module::Adapted(layer) => Some(layer),
            _ => None,
        }
    }

    pub fn as_linear(&self) -> Option<&Projection> {
        match self {
            Module::Linear(p) => Some(p),
            _ => None,
        }
    }
}
