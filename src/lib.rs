//! petl-rs: parameter-efficient adapter injection with adaptive rank
//! budgeting
//!
//! Implements low-rank (LoRA-style), SVD-structured (AdaLoRA-style) and
//! per-channel scaling (IA3-style) adapters over an externally defined
//! model graph of frozen projection nodes.
//!
//! # Features
//! - Graph surgery: pattern-matched in-place substitution of projection
//!   nodes with adapter-augmented equivalents
//! - Exact-reversible merge/unmerge of adapter weights into base weights
//! - Global rank budgeting: importance-scored, schedule-driven pruning of
//!   SVD directions across the whole model
//! - Flat state-dict save/load with pluggable legacy-path remapping

pub mod algebras;
pub mod allocator;
pub mod config;
pub mod error;
pub mod graph;
pub mod layer;
pub mod registry;
pub mod state_dict;
pub mod surgeon;
pub mod tensor_utils;

pub use algebras::{Ia3Unit, LoraUnit, SvdUnit, Unit};
pub use allocator::{Phase, RankAllocator, RankPattern};
pub use config::{AdapterConfig, Algebra, RankSchedule};
pub use error::{Error, Result};
pub use graph::{Module, Projection, QuantProjection};
pub use layer::{AdapterLayer, BaseNode};
pub use registry::AdapterModel;
pub use state_dict::{
    load_adapter, save_adapter, strip_legacy_prefixes, KeyRemap, StateDict, TensorValue,
};
pub use surgeon::Surgeon;
