//! Report contract checks against an in-memory runtime.

use anyhow::{anyhow, bail, Result};
use candle_core::{Device, Tensor};
use conv_probe::{Inspector, LoadedModel, ModelRuntime, ProbeConfig, ProbeOutcome, SignatureSummary};
use std::cell::Cell;
use std::path::Path;
use tf_savedmodel::{AttrValue, DataType, GraphNode, TensorShape, TensorSpec, VariableInfo};

#[derive(Clone, Default)]
struct StubModel {
    graph: Vec<GraphNode>,
    called_graph: Vec<GraphNode>,
    variables: Vec<(VariableInfo, Tensor)>,
    read_error: Option<String>,
}

impl LoadedModel for StubModel {
    fn signature_graph(&self, signature: &str, expand_functions: bool) -> Result<Vec<GraphNode>> {
        if signature != "serving_default" {
            bail!("Signature {:?} not found", signature);
        }
        let mut nodes = self.graph.clone();
        if expand_functions {
            nodes.extend(self.called_graph.iter().cloned());
        }
        Ok(nodes)
    }

    fn signature_io(&self, _signature: &str) -> Result<SignatureSummary> {
        Ok(SignatureSummary {
            tensorflow_version: Some("2.10.0".to_string()),
            tags: vec!["serve".to_string()],
            inputs: vec![TensorSpec {
                key: "input".to_string(),
                tensor_name: "input:0".to_string(),
                dtype: DataType::Float,
                shape: TensorShape::new(vec![-1, 256, 256, 3]),
            }],
            outputs: Vec::new(),
        })
    }

    fn trainable_variables(&self) -> Result<Vec<VariableInfo>> {
        Ok(self.variables.iter().map(|(info, _)| info.clone()).collect())
    }

    fn read_variable(&self, var: &VariableInfo) -> Result<Tensor> {
        if let Some(msg) = &self.read_error {
            bail!("{}", msg);
        }
        self.variables
            .iter()
            .find(|(info, _)| info.name == var.name)
            .map(|(_, t)| t.clone())
            .ok_or_else(|| anyhow!("no variable {}", var.name))
    }
}

#[derive(Default)]
struct StubRuntime {
    model: StubModel,
    load_error: Option<String>,
    loads: Cell<usize>,
}

impl ModelRuntime for StubRuntime {
    type Model = StubModel;

    fn load(&self, _path: &Path) -> Result<StubModel> {
        self.loads.set(self.loads.get() + 1);
        if let Some(msg) = &self.load_error {
            bail!("{}", msg);
        }
        Ok(self.model.clone())
    }
}

fn variable(name: &str, dims: &[usize], values: Vec<f32>) -> Result<(VariableInfo, Tensor)> {
    let info = VariableInfo {
        name: name.to_string(),
        shape: TensorShape::from(dims),
        dtype: DataType::Float,
        checkpoint_key: name.trim_end_matches(":0").to_string(),
    };
    let tensor = Tensor::from_vec(values, dims, &Device::Cpu)?;
    Ok((info, tensor))
}

fn run(runtime: StubRuntime, config: ProbeConfig) -> Result<(String, ProbeOutcome, usize)> {
    let inspector = Inspector::new(runtime, config);
    let mut out = Vec::new();
    let outcome = inspector.run(&mut out)?;
    let loads = inspector.runtime().loads.get();
    Ok((String::from_utf8(out)?, outcome, loads))
}

fn config_for(dir: &Path) -> ProbeConfig {
    ProbeConfig {
        model_path: dir.to_path_buf(),
        ..Default::default()
    }
}

#[test]
fn test_missing_model_path() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let missing = dir.path().join("he_heavy_augment");

    let (text, outcome, loads) = run(StubRuntime::default(), config_for(&missing))?;
    assert_eq!(text, format!("Model path not found: {}\n", missing.display()));
    assert_eq!(outcome, ProbeOutcome::MissingModel);
    assert_eq!(loads, 0);
    Ok(())
}

#[test]
fn test_conv_kernel_node_reported() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let runtime = StubRuntime {
        model: StubModel {
            graph: vec![
                GraphNode::new("input", "Placeholder"),
                GraphNode::new("conv2d_1/kernel", "Const").with_attr(
                    "shape",
                    AttrValue::Shape(TensorShape::new(vec![3, 3, 1, 32])),
                ),
            ],
            ..Default::default()
        },
        ..Default::default()
    };

    let (text, outcome, loads) = run(runtime, config_for(dir.path()))?;
    assert!(text.starts_with(
        "=== FIRST CONV LAYER INFO ===\nNode: conv2d_1/kernel\nOp: Const\nShape: (3, 3, 1, 32)\n"
    ));
    assert_eq!(outcome, ProbeOutcome::Completed);
    assert_eq!(loads, 2);
    Ok(())
}

#[test]
fn test_no_matching_node_prints_heading_only() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let runtime = StubRuntime {
        model: StubModel {
            graph: vec![
                GraphNode::new("dense/kernel", "VariableV2"),
                GraphNode::new("conv2d_1/bias", "VariableV2"),
                GraphNode::new("conv2d_2/convolution", "Conv2D"),
            ],
            ..Default::default()
        },
        ..Default::default()
    };

    let (text, outcome, _) = run(runtime, config_for(dir.path()))?;
    assert_eq!(text, "=== FIRST CONV LAYER INFO ===\n\n=== VARIABLES ===\n");
    assert_eq!(outcome, ProbeOutcome::Completed);
    Ok(())
}

#[test]
fn test_only_first_conv_op_printed() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let runtime = StubRuntime {
        model: StubModel {
            graph: vec![
                GraphNode::new("conv2d_1/convolution", "Conv2D")
                    .with_inputs(["input", "conv2d_1/kernel/read"]),
                GraphNode::new("conv2d_1/convolution_1", "Conv2D")
                    .with_inputs(["conv2d_1/Relu", "conv2d_1/kernel/read"]),
            ],
            ..Default::default()
        },
        ..Default::default()
    };

    let (text, _, _) = run(runtime, config_for(dir.path()))?;
    assert_eq!(text.matches("Conv2D node:").count(), 1);
    assert!(text.contains(
        "Conv2D node: conv2d_1/convolution\nInputs: [\"input\", \"conv2d_1/kernel/read\"]\n"
    ));
    assert!(!text.contains("conv2d_1/convolution_1"));
    Ok(())
}

#[test]
fn test_variable_sample_is_first_ten_values() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let values: Vec<f32> = (0..288).map(|i| i as f32 * 0.25).collect();
    let runtime = StubRuntime {
        model: StubModel {
            variables: vec![
                variable("conv2d_1/bias:0", &[32], vec![0.5; 32])?,
                variable("conv2d_1/kernel:0", &[3, 3, 1, 32], values.clone())?,
            ],
            ..Default::default()
        },
        ..Default::default()
    };

    let (text, _, _) = run(runtime, config_for(dir.path()))?;
    let expected = format!(
        "=== VARIABLES ===\nVariable: conv2d_1/kernel:0\nShape: (3, 3, 1, 32)\nFirst few values: {:?}\n",
        &values[..10]
    );
    assert!(text.ends_with(&expected), "unexpected report:\n{}", text);
    Ok(())
}

#[test]
fn test_load_failure_aborts_inspection() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let runtime = StubRuntime {
        load_error: Some("corrupt saved_model.pb".to_string()),
        ..Default::default()
    };

    let (text, outcome, loads) = run(runtime, config_for(dir.path()))?;
    assert!(text.starts_with("Error: corrupt saved_model.pb\nStack trace:\n"));
    assert!(!text.contains("=== FIRST CONV LAYER INFO ==="));
    assert!(!text.contains("=== VARIABLES ==="));
    assert_eq!(outcome, ProbeOutcome::Failed);
    assert_eq!(loads, 1);
    Ok(())
}

#[test]
fn test_missing_signature_is_reported() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = ProbeConfig {
        signature: "predict".to_string(),
        ..config_for(dir.path())
    };

    let (text, outcome, _) = run(StubRuntime::default(), config)?;
    assert!(text.starts_with("Error: Signature \"predict\" not found\n"));
    assert_eq!(outcome, ProbeOutcome::Failed);
    Ok(())
}

#[test]
fn test_variable_read_failure_after_graph_sections() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let runtime = StubRuntime {
        model: StubModel {
            graph: vec![GraphNode::new("conv2d_1/kernel", "VariableV2")],
            variables: vec![variable("conv2d_1/kernel:0", &[2], vec![1.0, 2.0])?],
            read_error: Some("shard truncated".to_string()),
            ..Default::default()
        },
        ..Default::default()
    };

    let (text, outcome, _) = run(runtime, config_for(dir.path()))?;
    assert!(text.contains("Node: conv2d_1/kernel\nOp: VariableV2\n"));
    assert!(text.contains(
        "=== VARIABLES ===\nVariable: conv2d_1/kernel:0\nShape: (2,)\nError: shard truncated\n"
    ));
    assert!(!text.contains("First few values:"));
    assert_eq!(outcome, ProbeOutcome::Failed);
    Ok(())
}

#[test]
fn test_called_functions_scanned_only_when_expanded() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let model = StubModel {
        graph: vec![
            GraphNode::new("input_1", "Placeholder"),
            GraphNode::new("StatefulPartitionedCall", "StatefulPartitionedCall"),
        ],
        called_graph: vec![GraphNode::new("model/conv2d_1/Conv2D", "Conv2D")
            .with_inputs(["input_1", "model/conv2d_1/Conv2D/ReadVariableOp"])],
        ..Default::default()
    };

    let runtime = StubRuntime {
        model: model.clone(),
        ..Default::default()
    };
    let (text, _, _) = run(runtime, config_for(dir.path()))?;
    assert_eq!(text, "=== FIRST CONV LAYER INFO ===\n\n=== VARIABLES ===\n");

    let runtime = StubRuntime {
        model,
        ..Default::default()
    };
    let config = ProbeConfig {
        expand_functions: true,
        ..config_for(dir.path())
    };
    let (text, _, _) = run(runtime, config)?;
    assert!(text.contains(
        "Conv2D node: model/conv2d_1/Conv2D\nInputs: [\"input_1\", \"model/conv2d_1/Conv2D/ReadVariableOp\"]\n"
    ));
    Ok(())
}

#[test]
fn test_custom_layer_and_sample_len() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let runtime = StubRuntime {
        model: StubModel {
            graph: vec![
                GraphNode::new("conv2d_1/convolution", "Conv2D"),
                GraphNode::new("conv2d_3/convolution", "Conv2D"),
            ],
            variables: vec![
                variable("conv2d_1/kernel:0", &[4], vec![1.0, 2.0, 3.0, 4.0])?,
                variable("conv2d_3/kernel:0", &[4], vec![5.0, 6.0, 7.0, 8.0])?,
            ],
            ..Default::default()
        },
        ..Default::default()
    };
    let config = ProbeConfig {
        layer_marker: "conv2d_3".to_string(),
        sample_len: 2,
        ..config_for(dir.path())
    };

    let (text, _, _) = run(runtime, config)?;
    assert!(text.contains("Conv2D node: conv2d_3/convolution\n"));
    assert!(text.contains("Variable: conv2d_3/kernel:0\nShape: (4,)\nFirst few values: [5.0, 6.0]\n"));
    Ok(())
}

#[test]
fn test_signature_section() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = ProbeConfig {
        show_signature: true,
        ..config_for(dir.path())
    };

    let (text, _, _) = run(StubRuntime::default(), config)?;
    assert!(text.starts_with(
        "=== SIGNATURE ===\nSignature: serving_default\nTensorFlow: 2.10.0\nTags: [\"serve\"]\nInputs:\n  input: input:0 float32 (?, 256, 256, 3)\nOutputs:\n\n=== FIRST CONV LAYER INFO ===\n"
    ));
    Ok(())
}
