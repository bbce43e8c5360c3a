//! Model runtime seam
//!
//! The probe only needs four things from a loaded model. `SavedModelRuntime`
//! provides them from disk; tests substitute an in-memory runtime.

use anyhow::Result;
use candle_core::Tensor;
use std::path::Path;
use tf_savedmodel::{GraphNode, SavedModel, TensorSpec, VariableInfo};

pub trait ModelRuntime {
    type Model: LoadedModel;

    fn load(&self, path: &Path) -> Result<Self::Model>;
}

pub trait LoadedModel {
    /// Ordered node list of the named signature's graph. With
    /// `expand_functions`, nodes of called functions are appended.
    fn signature_graph(&self, signature: &str, expand_functions: bool) -> Result<Vec<GraphNode>>;

    fn signature_io(&self, signature: &str) -> Result<SignatureSummary>;

    fn trainable_variables(&self) -> Result<Vec<VariableInfo>>;

    fn read_variable(&self, var: &VariableInfo) -> Result<Tensor>;
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SignatureSummary {
    pub tensorflow_version: Option<String>,
    pub tags: Vec<String>,
    pub inputs: Vec<TensorSpec>,
    pub outputs: Vec<TensorSpec>,
}

/// Loads SavedModel directories, preferring meta graphs with `tags`.
#[derive(Clone, Debug)]
pub struct SavedModelRuntime {
    pub tags: Vec<String>,
}

impl SavedModelRuntime {
    pub fn new(tags: Vec<String>) -> Self {
        Self { tags }
    }
}

impl Default for SavedModelRuntime {
    fn default() -> Self {
        Self::new(
            tf_savedmodel::DEFAULT_TAGS
                .iter()
                .map(|t| t.to_string())
                .collect(),
        )
    }
}

impl ModelRuntime for SavedModelRuntime {
    type Model = SavedModel;

    fn load(&self, path: &Path) -> Result<SavedModel> {
        SavedModel::load_with_tags(path, &self.tags)
    }
}

impl LoadedModel for SavedModel {
    fn signature_graph(&self, signature: &str, expand_functions: bool) -> Result<Vec<GraphNode>> {
        let sig = self.signature(signature)?;
        if expand_functions {
            sig.expanded_graph_nodes()
        } else {
            sig.graph_nodes()
        }
    }

    fn signature_io(&self, signature: &str) -> Result<SignatureSummary> {
        let sig = self.signature(signature)?;
        Ok(SignatureSummary {
            tensorflow_version: self.tensorflow_version().map(str::to_string),
            tags: self.tags().to_vec(),
            inputs: sig.inputs(),
            outputs: sig.outputs(),
        })
    }

    fn trainable_variables(&self) -> Result<Vec<VariableInfo>> {
        SavedModel::trainable_variables(self)
    }

    fn read_variable(&self, var: &VariableInfo) -> Result<Tensor> {
        SavedModel::read_variable(self, var)
    }
}
