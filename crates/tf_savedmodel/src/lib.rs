//! TensorFlow SavedModel Reader
//!
//! Pure-Rust access to the parts of a SavedModel directory needed for
//! inspection: the meta graph and its signatures, the computation graph of
//! each signature, and the trained variable values stored in the checkpoint
//! bundle. Variable values are materialized as `candle_core::Tensor`s.

pub mod bundle;
pub mod dtype;
pub mod graph;
pub mod model;
pub mod proto;
pub mod table;

#[cfg(any(test, feature = "fixtures"))]
pub mod fixtures;


pub use bundle::TensorBundle;
pub use dtype::DataType;
pub use graph::{AttrValue, GraphNode, TensorShape};
pub use model::{
    SavedModel, Signature, TensorSpec, VariableInfo, DEFAULT_SIGNATURE, DEFAULT_TAGS,
};
