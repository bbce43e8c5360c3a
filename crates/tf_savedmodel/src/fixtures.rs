//! Test fixtures - writers for synthetic SavedModel directories
//!
//! Produces the same on-disk layout TensorFlow writes (binary
//! `saved_model.pb`, uncompressed sorted-table index, single data shard),
//! small enough to build inside a test. Checksums are written as zero.

use crate::bundle::{index_path, shard_path};
use crate::dtype::DataType;
use crate::graph::TensorShape;
use crate::model::{OBJECT_GRAPH_KEY, SAVED_MODEL_FILENAME};
use crate::proto::{self, attr_value, collection_def};
use crate::table::{BlockHandle, TABLE_MAGIC};
use anyhow::{Context, Result};
use prost::encoding::encode_varint;
use prost::Message;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Single-data-block table writer. Keys must be added in sorted order.
#[derive(Default)]
pub struct TableWriter {
    entries: Vec<(Vec<u8>, Vec<u8>)>,
}

impl TableWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        self.entries.push((key.to_vec(), value.to_vec()));
    }

    pub fn finish(self) -> Vec<u8> {
        let mut out = Vec::new();
        let data = write_block(&mut out, &self.entries);
        let metaindex = write_block(&mut out, &[]);

        let last_key = self
            .entries
            .last()
            .map(|(k, _)| k.clone())
            .unwrap_or_default();
        let mut handle = Vec::new();
        encode_varint(data.offset, &mut handle);
        encode_varint(data.size, &mut handle);
        let index = write_block(&mut out, &[(last_key, handle)]);

        let mut footer = Vec::new();
        encode_varint(metaindex.offset, &mut footer);
        encode_varint(metaindex.size, &mut footer);
        encode_varint(index.offset, &mut footer);
        encode_varint(index.size, &mut footer);
        footer.resize(40, 0);
        footer.extend_from_slice(&TABLE_MAGIC.to_le_bytes());
        out.extend_from_slice(&footer);
        out
    }
}

fn write_block(out: &mut Vec<u8>, entries: &[(Vec<u8>, Vec<u8>)]) -> BlockHandle {
    let offset = out.len();
    // Every entry is a restart point (no prefix sharing)
    let mut restarts = Vec::new();
    for (key, value) in entries {
        restarts.push((out.len() - offset) as u32);
        encode_varint(0, out);
        encode_varint(key.len() as u64, out);
        encode_varint(value.len() as u64, out);
        out.extend_from_slice(key);
        out.extend_from_slice(value);
    }
    if restarts.is_empty() {
        restarts.push(0);
    }
    for restart in &restarts {
        out.extend_from_slice(&restart.to_le_bytes());
    }
    out.extend_from_slice(&(restarts.len() as u32).to_le_bytes());
    let size = out.len() - offset;

    out.push(0); // no compression
    out.extend_from_slice(&[0u8; 4]);

    BlockHandle {
        offset: offset as u64,
        size: size as u64,
    }
}

/// Single-shard tensor bundle writer.
#[derive(Default)]
pub struct BundleWriter {
    entries: BTreeMap<String, proto::BundleEntryProto>,
    data: Vec<u8>,
}

impl BundleWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_raw(&mut self, key: &str, dtype: DataType, shape: &[i64], bytes: &[u8]) -> &mut Self {
        let entry = proto::BundleEntryProto {
            dtype: dtype.code(),
            shape: Some(TensorShape::new(shape.to_vec()).to_proto()),
            shard_id: 0,
            offset: self.data.len() as i64,
            size: bytes.len() as i64,
            crc32c: 0,
            slices: Vec::new(),
        };
        self.data.extend_from_slice(bytes);
        self.entries.insert(key.to_string(), entry);
        self
    }

    pub fn add_f32(&mut self, key: &str, shape: &[i64], values: &[f32]) -> &mut Self {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.add_raw(key, DataType::Float, shape, &bytes)
    }

    pub fn add_string_scalar(&mut self, key: &str, value: &[u8]) -> &mut Self {
        let mut bytes = Vec::new();
        encode_varint(value.len() as u64, &mut bytes);
        bytes.extend_from_slice(&[0u8; 4]);
        bytes.extend_from_slice(value);
        self.add_raw(key, DataType::String, &[], &bytes)
    }

    /// Write `<prefix>.index` and `<prefix>.data-00000-of-00001`.
    pub fn write(&self, prefix: &Path) -> Result<()> {
        if let Some(parent) = prefix.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut table = TableWriter::new();
        let header = proto::BundleHeaderProto {
            num_shards: 1,
            endianness: 0,
        };
        table.add(b"", &header.encode_to_vec());
        for (key, entry) in &self.entries {
            table.add(key.as_bytes(), &entry.encode_to_vec());
        }

        fs::write(index_path(prefix), table.finish())
            .with_context(|| format!("Failed to write index for {:?}", prefix))?;
        fs::write(shard_path(prefix, 0, 1), &self.data)
            .with_context(|| format!("Failed to write shard for {:?}", prefix))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Proto builders
// ---------------------------------------------------------------------------

pub fn node(name: &str, op: &str, inputs: &[&str]) -> proto::NodeDef {
    proto::NodeDef {
        name: name.to_string(),
        op: op.to_string(),
        input: inputs.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    }
}

pub fn with_attr(mut node: proto::NodeDef, key: &str, value: attr_value::Value) -> proto::NodeDef {
    node.attr.insert(
        key.to_string(),
        proto::AttrValue { value: Some(value) },
    );
    node
}

pub fn shape_value(dims: &[i64]) -> attr_value::Value {
    attr_value::Value::Shape(TensorShape::new(dims.to_vec()).to_proto())
}

pub fn func_value(name: &str) -> attr_value::Value {
    attr_value::Value::Func(proto::NameAttrList {
        name: name.to_string(),
        ..Default::default()
    })
}

pub fn arg_def(name: &str, dtype: DataType) -> proto::ArgDef {
    proto::ArgDef {
        name: name.to_string(),
        r#type: dtype.code(),
    }
}

pub fn tensor_info(name: &str, dtype: DataType, dims: &[i64]) -> proto::TensorInfo {
    proto::TensorInfo {
        name: name.to_string(),
        dtype: dtype.code(),
        tensor_shape: Some(TensorShape::new(dims.to_vec()).to_proto()),
    }
}

pub fn meta_info(tags: &[&str], tensorflow_version: &str) -> proto::MetaInfoDef {
    proto::MetaInfoDef {
        tags: tags.iter().map(|s| s.to_string()).collect(),
        tensorflow_version: tensorflow_version.to_string(),
        ..Default::default()
    }
}

/// Write `saved_model.pb` into `dir`, creating it if needed.
pub fn write_saved_model(dir: &Path, saved_model: &proto::SavedModel) -> Result<()> {
    fs::create_dir_all(dir)?;
    fs::write(dir.join(SAVED_MODEL_FILENAME), saved_model.encode_to_vec())
        .with_context(|| format!("Failed to write saved_model.pb in {:?}", dir))?;
    Ok(())
}

pub fn variables_prefix(dir: &Path) -> std::path::PathBuf {
    dir.join("variables").join("variables")
}

/// Values stored for `conv2d_1/kernel` by the canned models: 0.01 * i.
pub fn conv1_kernel_values() -> Vec<f32> {
    (0..36).map(|i| i as f32 * 0.01).collect()
}

pub const CONV1_KERNEL_SHAPE: [i64; 4] = [3, 3, 1, 4];

fn conv2_kernel_values() -> Vec<f32> {
    (0..144).map(|i| -(i as f32) * 0.001).collect()
}

/// Graph-only (TF1 Keras export) model: variables are graph nodes and the
/// `trainable_variables` collection lists them.
pub fn write_graph_model(dir: &Path) -> Result<()> {
    let f32_type = attr_value::Value::Type(DataType::Float.code());
    let graph_def = proto::GraphDef {
        node: vec![
            with_attr(node("input", "Placeholder", &[]), "shape", shape_value(&[-1, -1, -1, 1])),
            with_attr(
                with_attr(node("conv2d_1/kernel", "VariableV2", &[]), "shape", shape_value(&CONV1_KERNEL_SHAPE)),
                "dtype",
                f32_type,
            ),
            node("conv2d_1/kernel/read", "Identity", &["conv2d_1/kernel"]),
            with_attr(node("conv2d_1/bias", "VariableV2", &[]), "shape", shape_value(&[4])),
            node("conv2d_1/convolution", "Conv2D", &["input", "conv2d_1/kernel/read"]),
            node("conv2d_1/BiasAdd", "BiasAdd", &["conv2d_1/convolution", "conv2d_1/bias/read"]),
            node("conv2d_1/Relu", "Relu", &["conv2d_1/BiasAdd"]),
            with_attr(node("conv2d_2/kernel", "VariableV2", &[]), "shape", shape_value(&[3, 3, 4, 4])),
            node("conv2d_2/convolution", "Conv2D", &["conv2d_1/Relu", "conv2d_2/kernel/read"]),
        ],
        library: None,
    };

    let variable_defs: Vec<Vec<u8>> = ["conv2d_1/kernel:0", "conv2d_1/bias:0", "conv2d_2/kernel:0"]
        .iter()
        .map(|name| {
            proto::VariableDef {
                variable_name: name.to_string(),
                initializer_name: format!("{}/Assign", name.trim_end_matches(":0")),
                snapshot_name: format!("{}/read:0", name.trim_end_matches(":0")),
                is_resource: false,
                trainable: true,
            }
            .encode_to_vec()
        })
        .collect();

    let mut meta_graph = proto::MetaGraphDef {
        meta_info_def: Some(meta_info(&["serve"], "1.15.0")),
        graph_def: Some(graph_def),
        ..Default::default()
    };
    meta_graph.collection_def.insert(
        "trainable_variables".to_string(),
        proto::CollectionDef {
            node_list: None,
            bytes_list: Some(collection_def::BytesList {
                value: variable_defs,
            }),
        },
    );
    let mut signature = proto::SignatureDef {
        method_name: "tensorflow/serving/predict".to_string(),
        ..Default::default()
    };
    signature.inputs.insert(
        "input".to_string(),
        tensor_info("input:0", DataType::Float, &[-1, -1, -1, 1]),
    );
    signature.outputs.insert(
        "output".to_string(),
        tensor_info("conv2d_2/convolution:0", DataType::Float, &[-1, -1, -1, 4]),
    );
    meta_graph
        .signature_def
        .insert("serving_default".to_string(), signature);

    write_saved_model(
        dir,
        &proto::SavedModel {
            saved_model_schema_version: 1,
            meta_graphs: vec![meta_graph],
        },
    )?;

    let mut bundle = BundleWriter::new();
    bundle.add_f32("conv2d_1/kernel", &CONV1_KERNEL_SHAPE, &conv1_kernel_values());
    bundle.add_f32("conv2d_1/bias", &[4], &[0.0; 4]);
    bundle.add_f32("conv2d_2/kernel", &[3, 3, 4, 4], &conv2_kernel_values());
    bundle.write(&variables_prefix(dir))
}

/// Object-graph (TF2) model: the signature maps to a concrete function that
/// calls the model body, and variables are tracked objects.
pub fn write_object_graph_model(dir: &Path) -> Result<()> {
    const WRAPPER: &str = "__inference_signature_wrapper_210";
    const BODY: &str = "__inference__wrapped_model_120";

    let wrapper = proto::FunctionDef {
        signature: Some(proto::OpDef {
            name: WRAPPER.to_string(),
            input_arg: vec![
                arg_def("input_1", DataType::Float),
                arg_def("unknown", DataType::Resource),
                arg_def("unknown_0", DataType::Resource),
            ],
            ..Default::default()
        }),
        node_def: vec![with_attr(
            node("StatefulPartitionedCall", "StatefulPartitionedCall", &["input_1", "unknown", "unknown_0"]),
            "f",
            func_value(BODY),
        )],
        ..Default::default()
    };
    let body = proto::FunctionDef {
        signature: Some(proto::OpDef {
            name: BODY.to_string(),
            ..Default::default()
        }),
        node_def: vec![
            node(
                "model/conv2d_1/Conv2D/ReadVariableOp",
                "ReadVariableOp",
                &["model_conv2d_1_conv2d_readvariableop_resource"],
            ),
            node(
                "model/conv2d_1/Conv2D",
                "Conv2D",
                &["input_1", "model/conv2d_1/Conv2D/ReadVariableOp:value:0"],
            ),
            node(
                "model/conv2d_1/BiasAdd",
                "BiasAdd",
                &["model/conv2d_1/Conv2D:output:0", "model/conv2d_1/BiasAdd/ReadVariableOp:value:0"],
            ),
        ],
        ..Default::default()
    };

    let graph_def = proto::GraphDef {
        node: vec![
            node("saver_filename", "Placeholder", &[]),
            node("StatefulPartitionedCall_1", "StatefulPartitionedCall", &["saver_filename"]),
        ],
        library: Some(proto::FunctionDefLibrary {
            function: vec![wrapper, body],
        }),
    };

    let child = |node_id: i32, local_name: &str| proto::ObjectReference {
        node_id,
        local_name: local_name.to_string(),
    };
    let user = |identifier: &str, children: Vec<proto::ObjectReference>| proto::SavedObject {
        children,
        user_object: Some(proto::SavedUserObject {
            identifier: identifier.to_string(),
        }),
        ..Default::default()
    };
    let variable = |name: &str, dims: &[i64], trainable: bool| proto::SavedObject {
        variable: Some(proto::SavedVariable {
            dtype: DataType::Float.code(),
            shape: Some(TensorShape::new(dims.to_vec()).to_proto()),
            trainable,
            name: name.to_string(),
        }),
        ..Default::default()
    };

    let object_graph = proto::SavedObjectGraph {
        nodes: vec![
            user(
                "_tf_keras_model",
                vec![child(1, "signatures"), child(3, "layer_with_weights-0"), child(6, "optimizer")],
            ),
            user("signature_map", vec![child(2, "serving_default")]),
            proto::SavedObject {
                bare_concrete_function: Some(proto::SavedBareConcreteFunction {
                    concrete_function_name: WRAPPER.to_string(),
                }),
                ..Default::default()
            },
            user("_tf_keras_layer", vec![child(4, "kernel"), child(5, "bias")]),
            variable("conv2d_1/kernel", &CONV1_KERNEL_SHAPE, true),
            variable("conv2d_1/bias", &[4], true),
            variable("iter", &[], false),
        ],
    };

    let kernel_key = "layer_with_weights-0/kernel/.ATTRIBUTES/VARIABLE_VALUE";
    let bias_key = "layer_with_weights-0/bias/.ATTRIBUTES/VARIABLE_VALUE";
    let iter_key = "optimizer/iter/.ATTRIBUTES/VARIABLE_VALUE";
    let tracked = |full_name: &str, key: &str| proto::TrackableObject {
        children: Vec::new(),
        attributes: vec![proto::SerializedTensor {
            name: "VARIABLE_VALUE".to_string(),
            full_name: full_name.to_string(),
            checkpoint_key: key.to_string(),
        }],
    };
    let trackable = proto::TrackableObjectGraph {
        nodes: vec![
            proto::TrackableObject::default(),
            proto::TrackableObject::default(),
            proto::TrackableObject::default(),
            proto::TrackableObject::default(),
            tracked("conv2d_1/kernel", kernel_key),
            tracked("conv2d_1/bias", bias_key),
            tracked("iter", iter_key),
        ],
    };

    let mut signature = proto::SignatureDef {
        method_name: "tensorflow/serving/predict".to_string(),
        ..Default::default()
    };
    signature.inputs.insert(
        "input_1".to_string(),
        tensor_info("serving_default_input_1:0", DataType::Float, &[-1, 32, 32, 1]),
    );
    signature.outputs.insert(
        "conv2d_1".to_string(),
        tensor_info("StatefulPartitionedCall:0", DataType::Float, &[-1, 30, 30, 4]),
    );

    let mut meta_graph = proto::MetaGraphDef {
        meta_info_def: Some(meta_info(&["serve"], "2.10.0")),
        graph_def: Some(graph_def),
        object_graph_def: Some(object_graph),
        ..Default::default()
    };
    meta_graph
        .signature_def
        .insert("serving_default".to_string(), signature);

    write_saved_model(
        dir,
        &proto::SavedModel {
            saved_model_schema_version: 1,
            meta_graphs: vec![meta_graph],
        },
    )?;

    let mut bundle = BundleWriter::new();
    bundle.add_f32(kernel_key, &CONV1_KERNEL_SHAPE, &conv1_kernel_values());
    bundle.add_f32(bias_key, &[4], &[0.1, 0.2, 0.3, 0.4]);
    bundle.add_f32(iter_key, &[], &[0.0]);
    bundle.add_string_scalar(OBJECT_GRAPH_KEY, &trackable.encode_to_vec());
    bundle.write(&variables_prefix(dir))
}
