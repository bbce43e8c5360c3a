//! SavedModel - loader and signature/variable views
//!
//! Reads `saved_model.pb`, picks a meta graph by tag, and opens the
//! `variables/` bundle. Graph-only exports (variables as graph nodes) and
//! object-graph exports (signatures mapped to concrete functions, variables
//! tracked through the checkpoint object graph) are both understood.

use crate::bundle::{index_path, TensorBundle};
use crate::dtype::DataType;
use crate::graph::{AttrValue, GraphNode, TensorShape};
use crate::proto::{
    self, FunctionDef, MetaGraphDef, SavedObject, SavedObjectGraph, SignatureDef,
    TrackableObjectGraph, VariableDef,
};
use anyhow::{anyhow, bail, Context, Result};
use candle_core::Tensor;
use prost::Message;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Tried in order when picking a meta graph.
pub const DEFAULT_TAGS: &[&str] = &["serve", "inference", "predict"];
pub const DEFAULT_SIGNATURE: &str = "serving_default";

pub const SAVED_MODEL_FILENAME: &str = "saved_model.pb";
pub const SAVED_MODEL_TEXT_FILENAME: &str = "saved_model.pbtxt";
pub const OBJECT_GRAPH_KEY: &str = "_CHECKPOINTABLE_OBJECT_GRAPH";

const VARIABLE_VALUE_ATTR: &str = "VARIABLE_VALUE";
const TRAINABLE_COLLECTION: &str = "trainable_variables";

/// Signature input or output.
#[derive(Clone, Debug, PartialEq)]
pub struct TensorSpec {
    pub key: String,
    pub tensor_name: String,
    pub dtype: DataType,
    pub shape: TensorShape,
}

/// Trainable variable descriptor; values are read on demand.
#[derive(Clone, Debug, PartialEq)]
pub struct VariableInfo {
    /// Graph name with output suffix, e.g. `conv2d_1/kernel:0`
    pub name: String,
    pub shape: TensorShape,
    pub dtype: DataType,
    pub checkpoint_key: String,
}

pub struct SavedModel {
    dir: PathBuf,
    meta_graph: MetaGraphDef,
    bundle: Option<TensorBundle>,
}

impl SavedModel {
    pub fn load<P: AsRef<Path>>(dir: P) -> Result<Self> {
        Self::load_with_tags(dir, DEFAULT_TAGS)
    }

    pub fn load_with_tags<P: AsRef<Path>, S: AsRef<str>>(dir: P, tags: &[S]) -> Result<Self> {
        let dir = dir.as_ref();
        let pb_path = dir.join(SAVED_MODEL_FILENAME);
        if !pb_path.exists() {
            if dir.join(SAVED_MODEL_TEXT_FILENAME).exists() {
                bail!(
                    "{:?} holds a text-format SavedModel; only binary {} is supported",
                    dir,
                    SAVED_MODEL_FILENAME
                );
            }
            bail!("No {} found in {:?}", SAVED_MODEL_FILENAME, dir);
        }

        let bytes =
            std::fs::read(&pb_path).with_context(|| format!("Failed to read {:?}", pb_path))?;
        let saved = proto::SavedModel::decode(bytes.as_slice())
            .with_context(|| format!("Failed to decode {:?}", pb_path))?;
        let graph_count = saved.meta_graphs.len();
        let meta_graph = select_meta_graph(saved.meta_graphs, tags)
            .ok_or_else(|| anyhow!("{:?} contains no meta graphs", pb_path))?;

        let prefix = dir.join("variables").join("variables");
        let bundle = if index_path(&prefix).exists() {
            Some(TensorBundle::open(&prefix)?)
        } else {
            debug!("No variables bundle under {:?}", dir);
            None
        };

        let model = Self {
            dir: dir.to_path_buf(),
            meta_graph,
            bundle,
        };
        info!(
            "SavedModel: Loaded {:?} (Meta graphs: {}, Tags: {:?}, Signatures: {})",
            dir,
            graph_count,
            model.tags(),
            model.meta_graph.signature_def.len()
        );
        Ok(model)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn meta_graph(&self) -> &MetaGraphDef {
        &self.meta_graph
    }

    pub fn bundle(&self) -> Option<&TensorBundle> {
        self.bundle.as_ref()
    }

    pub fn tags(&self) -> &[String] {
        self.meta_graph
            .meta_info_def
            .as_ref()
            .map(|m| m.tags.as_slice())
            .unwrap_or_default()
    }

    pub fn tensorflow_version(&self) -> Option<&str> {
        self.meta_graph
            .meta_info_def
            .as_ref()
            .map(|m| m.tensorflow_version.as_str())
            .filter(|v| !v.is_empty())
    }

    /// Signature keys, sorted.
    pub fn signature_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .meta_graph
            .signature_def
            .keys()
            .map(String::as_str)
            .collect();
        names.sort_unstable();
        names
    }

    pub fn signature(&self, name: &str) -> Result<Signature<'_>> {
        let def = self.meta_graph.signature_def.get(name).ok_or_else(|| {
            anyhow!(
                "Signature {:?} not found in {:?} (available: [{}])",
                name,
                self.dir,
                self.signature_names().join(", ")
            )
        })?;
        Ok(Signature {
            model: self,
            name: name.to_string(),
            def,
        })
    }

    /// Trainable variables in model order.
    pub fn trainable_variables(&self) -> Result<Vec<VariableInfo>> {
        let Some(bundle) = &self.bundle else {
            return Ok(Vec::new());
        };
        if let Some(vars) = self.object_graph_variables(bundle)? {
            return Ok(vars);
        }
        if let Some(vars) = self.collection_variables(bundle)? {
            return Ok(vars);
        }
        debug!("No variable metadata; listing every numeric bundle entry");
        Ok(bundle_variables(bundle))
    }

    pub fn read_variable(&self, var: &VariableInfo) -> Result<Tensor> {
        let bundle = self
            .bundle
            .as_ref()
            .ok_or_else(|| anyhow!("{:?} has no variables bundle", self.dir))?;
        bundle
            .read_tensor(&var.checkpoint_key)
            .with_context(|| format!("Reading variable {:?}", var.name))
    }

    fn object_graph_variables(&self, bundle: &TensorBundle) -> Result<Option<Vec<VariableInfo>>> {
        let Some(graph) = self
            .meta_graph
            .object_graph_def
            .as_ref()
            .filter(|g| !g.nodes.is_empty())
        else {
            return Ok(None);
        };
        if !bundle.contains(OBJECT_GRAPH_KEY) {
            warn!("Object graph present but checkpoint has no {}", OBJECT_GRAPH_KEY);
            return Ok(None);
        }

        let raw = bundle.read_string_scalar(OBJECT_GRAPH_KEY)?;
        let trackable = TrackableObjectGraph::decode(raw.as_slice())
            .context("Decoding checkpoint object graph")?;

        let mut vars = Vec::new();
        for (id, object) in graph.nodes.iter().enumerate() {
            let Some(variable) = object.variable.as_ref().filter(|v| v.trainable) else {
                continue;
            };
            let attribute = trackable
                .nodes
                .get(id)
                .and_then(|t| t.attributes.iter().find(|a| a.name == VARIABLE_VALUE_ATTR))
                .ok_or_else(|| anyhow!("Variable node {} has no checkpointed value", id))?;

            let base = if variable.name.is_empty() {
                &attribute.full_name
            } else {
                &variable.name
            };
            vars.push(variable_info(bundle, output_name(base), &attribute.checkpoint_key)?);
        }
        Ok(Some(vars))
    }

    fn collection_variables(&self, bundle: &TensorBundle) -> Result<Option<Vec<VariableInfo>>> {
        let Some(list) = self
            .meta_graph
            .collection_def
            .get(TRAINABLE_COLLECTION)
            .and_then(|c| c.bytes_list.as_ref())
        else {
            return Ok(None);
        };

        let mut vars = Vec::new();
        for raw in &list.value {
            let def = VariableDef::decode(raw.as_slice()).context("Decoding trainable VariableDef")?;
            let key = strip_output_suffix(&def.variable_name);
            vars.push(variable_info(bundle, output_name(&def.variable_name), key)?);
        }
        Ok(Some(vars))
    }

    fn library(&self) -> HashMap<&str, &FunctionDef> {
        self.meta_graph
            .graph_def
            .as_ref()
            .and_then(|g| g.library.as_ref())
            .map(|lib| {
                lib.function
                    .iter()
                    .filter_map(|f| f.signature.as_ref().map(|s| (s.name.as_str(), f)))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Nodes of function `root` in graph form: a `Placeholder` per input
    /// argument, then the body. With `expand`, the bodies of every function
    /// reachable through `func` attributes follow, each once.
    fn function_nodes(&self, root: &str, expand: bool) -> Result<Vec<GraphNode>> {
        let library = self.library();
        let lookup = |name: &str| {
            library
                .get(name)
                .copied()
                .ok_or_else(|| anyhow!("Function {:?} is not in the graph library", name))
        };

        let mut nodes = arg_placeholders(lookup(root)?);
        let mut queue = VecDeque::from([root.to_string()]);
        let mut seen = HashSet::from([root.to_string()]);

        while let Some(name) = queue.pop_front() {
            for node_def in &lookup(&name)?.node_def {
                let node = function_body_node(node_def);
                if expand {
                    for callee in node.called_functions() {
                        if library.contains_key(callee) && seen.insert(callee.to_string()) {
                            queue.push_back(callee.to_string());
                        }
                    }
                }
                nodes.push(node);
            }
        }

        debug!(
            "Function {}: {} nodes across {} functions",
            root,
            nodes.len(),
            seen.len()
        );
        Ok(nodes)
    }
}

pub struct Signature<'a> {
    model: &'a SavedModel,
    name: String,
    def: &'a SignatureDef,
}

impl<'a> Signature<'a> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn method_name(&self) -> &str {
        &self.def.method_name
    }

    pub fn inputs(&self) -> Vec<TensorSpec> {
        tensor_specs(&self.def.inputs)
    }

    pub fn outputs(&self) -> Vec<TensorSpec> {
        tensor_specs(&self.def.outputs)
    }

    /// Concrete function backing this signature, when the model has an object graph.
    pub fn concrete_function(&self) -> Option<&'a str> {
        let graph = self.model.meta_graph.object_graph_def.as_ref()?;
        let root = graph.nodes.first()?;
        let signatures = child(graph, root, "signatures")?;
        let node = child(graph, signatures, &self.name)?;

        if let Some(bare) = &node.bare_concrete_function {
            return Some(bare.concrete_function_name.as_str()).filter(|s| !s.is_empty());
        }
        node.function
            .as_ref()?
            .concrete_functions
            .first()
            .map(String::as_str)
    }

    /// The signature's computation graph as an ordered node list. Functions
    /// called from it are not expanded.
    pub fn graph_nodes(&self) -> Result<Vec<GraphNode>> {
        self.collect_nodes(false)
    }

    /// Like [`Signature::graph_nodes`], followed by the nodes of every
    /// function the graph calls, directly or transitively.
    pub fn expanded_graph_nodes(&self) -> Result<Vec<GraphNode>> {
        self.collect_nodes(true)
    }

    fn collect_nodes(&self, expand: bool) -> Result<Vec<GraphNode>> {
        if let Some(function) = self.concrete_function() {
            debug!("Signature {} -> function {}", self.name, function);
            return self.model.function_nodes(function, expand);
        }

        let graph = self
            .model
            .meta_graph
            .graph_def
            .as_ref()
            .ok_or_else(|| anyhow!("Meta graph in {:?} has no graph_def", self.model.dir))?;
        Ok(graph.node.iter().map(GraphNode::from).collect())
    }
}

fn child<'g>(graph: &'g SavedObjectGraph, node: &SavedObject, name: &str) -> Option<&'g SavedObject> {
    let reference = node.children.iter().find(|c| c.local_name == name)?;
    graph.nodes.get(usize::try_from(reference.node_id).ok()?)
}

fn tensor_specs(map: &HashMap<String, proto::TensorInfo>) -> Vec<TensorSpec> {
    let mut specs: Vec<TensorSpec> = map
        .iter()
        .map(|(key, info)| TensorSpec {
            key: key.clone(),
            tensor_name: info.name.clone(),
            dtype: DataType::from_i32(info.dtype),
            shape: info
                .tensor_shape
                .as_ref()
                .map(|s| TensorShape::from_proto(Some(s)))
                .unwrap_or_else(TensorShape::unknown),
        })
        .collect();
    specs.sort_by(|a, b| a.key.cmp(&b.key));
    specs
}

fn select_meta_graph<S: AsRef<str>>(mut graphs: Vec<MetaGraphDef>, tags: &[S]) -> Option<MetaGraphDef> {
    let has_tag = |g: &MetaGraphDef, tag: &str| {
        g.meta_info_def
            .as_ref()
            .is_some_and(|m| m.tags.iter().any(|t| t == tag))
    };

    for tag in tags {
        if let Some(pos) = graphs.iter().position(|g| has_tag(g, tag.as_ref())) {
            return Some(graphs.swap_remove(pos));
        }
    }
    if graphs.is_empty() {
        return None;
    }
    warn!(
        "No meta graph tagged {:?}; using the first one",
        tags.iter().map(AsRef::as_ref).collect::<Vec<_>>()
    );
    Some(graphs.swap_remove(0))
}

fn variable_info(bundle: &TensorBundle, name: String, key: &str) -> Result<VariableInfo> {
    let entry = bundle.entry(key).ok_or_else(|| {
        anyhow!(
            "Checkpoint key {:?} for variable {:?} is missing from {:?}",
            key,
            name,
            bundle.prefix()
        )
    })?;
    Ok(VariableInfo {
        name,
        shape: TensorShape::from_proto(entry.shape.as_ref()),
        dtype: DataType::from_i32(entry.dtype),
        checkpoint_key: key.to_string(),
    })
}

fn bundle_variables(bundle: &TensorBundle) -> Vec<VariableInfo> {
    bundle
        .keys()
        .filter(|key| *key != OBJECT_GRAPH_KEY)
        .filter_map(|key| {
            let entry = bundle.entry(key)?;
            let dtype = DataType::from_i32(entry.dtype);
            dtype.is_numeric().then(|| VariableInfo {
                name: output_name(key),
                shape: TensorShape::from_proto(entry.shape.as_ref()),
                dtype,
                checkpoint_key: key.to_string(),
            })
        })
        .collect()
}

fn arg_placeholders(function: &FunctionDef) -> Vec<GraphNode> {
    let Some(signature) = &function.signature else {
        return Vec::new();
    };
    signature
        .input_arg
        .iter()
        .map(|arg| {
            let node = GraphNode::new(arg.name.as_str(), "Placeholder");
            match DataType::from_i32(arg.r#type) {
                DataType::Other(0) => node,
                dtype => node.with_attr("dtype", AttrValue::Type(dtype)),
            }
        })
        .collect()
}

fn function_body_node(node_def: &proto::NodeDef) -> GraphNode {
    let mut node = GraphNode::from(node_def);
    node.inputs = node.inputs.iter().map(|i| graph_input(i)).collect();
    node
}

/// Function-body input `node:output:idx` as a graph input `node[:idx]`.
/// Argument names and control inputs (`^node`) pass through.
fn graph_input(input: &str) -> String {
    if input.starts_with('^') {
        return input.to_string();
    }
    let mut parts = input.split(':');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(node), Some(_), Some("0"), None) => node.to_string(),
        (Some(node), Some(_), Some(idx), None) => format!("{}:{}", node, idx),
        _ => input.to_string(),
    }
}

fn split_output_suffix(name: &str) -> Option<(&str, &str)> {
    let (base, index) = name.rsplit_once(':')?;
    (!index.is_empty() && index.bytes().all(|b| b.is_ascii_digit())).then_some((base, index))
}

/// `conv2d_1/kernel` -> `conv2d_1/kernel:0`; names with a suffix are kept.
pub fn output_name(name: &str) -> String {
    match split_output_suffix(name) {
        Some(_) => name.to_string(),
        None => format!("{}:0", name),
    }
}

/// `conv2d_1/kernel:0` -> `conv2d_1/kernel`
pub fn strip_output_suffix(name: &str) -> &str {
    split_output_suffix(name).map_or(name, |(base, _)| base)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_suffix() {
        assert_eq!(output_name("conv2d_1/kernel"), "conv2d_1/kernel:0");
        assert_eq!(output_name("conv2d_1/kernel:0"), "conv2d_1/kernel:0");
        assert_eq!(output_name("scope:name"), "scope:name:0");
        assert_eq!(strip_output_suffix("conv2d_1/kernel:0"), "conv2d_1/kernel");
        assert_eq!(strip_output_suffix("conv2d_1/kernel"), "conv2d_1/kernel");
    }

    #[test]
    fn test_graph_input_form() {
        assert_eq!(graph_input("input_1"), "input_1");
        assert_eq!(graph_input("model/conv2d_1/Conv2D/ReadVariableOp:value:0"), "model/conv2d_1/Conv2D/ReadVariableOp");
        assert_eq!(graph_input("split:output:2"), "split:2");
        assert_eq!(graph_input("^model/conv2d_1/BiasAdd"), "^model/conv2d_1/BiasAdd");
    }

    #[test]
    fn test_select_meta_graph_by_tag() {
        let graph = |tags: &[&str]| MetaGraphDef {
            meta_info_def: Some(proto::MetaInfoDef {
                tags: tags.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            }),
            ..Default::default()
        };

        let picked = select_meta_graph(vec![graph(&["train"]), graph(&["serve", "gpu"])], DEFAULT_TAGS);
        assert_eq!(picked.and_then(|g| g.meta_info_def).map(|m| m.tags[0].clone()), Some("serve".to_string()));

        let fallback = select_meta_graph(vec![graph(&["train"])], DEFAULT_TAGS);
        assert!(fallback.is_some());

        assert!(select_meta_graph(Vec::new(), DEFAULT_TAGS).is_none());
    }
}
