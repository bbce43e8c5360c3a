//! Conv Layer Inspection
//!
//! Loads the model, reports the first conv weight node and the first
//! matching Conv2D op of the signature graph, then reloads the model and
//! samples the layer's kernel values. The first failure ends the report.

use crate::config::ProbeConfig;
use crate::runtime::{LoadedModel, ModelRuntime};
use anyhow::Result;
use candle_core::{DType, Tensor};
use std::backtrace::BacktraceStatus;
use std::io::{self, Write};
use tf_savedmodel::GraphNode;
use tracing::{debug, error, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProbeOutcome {
    MissingModel,
    Completed,
    Failed,
}

pub struct Inspector<R> {
    runtime: R,
    config: ProbeConfig,
}

impl<R: ModelRuntime> Inspector<R> {
    pub fn new(runtime: R, config: ProbeConfig) -> Self {
        Self { runtime, config }
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    /// Write the report to `out`. Only I/O errors on `out` itself escape.
    pub fn run<W: Write>(&self, out: &mut W) -> io::Result<ProbeOutcome> {
        let path = &self.config.model_path;
        if !path.exists() {
            warn!("Model path {:?} does not exist", path);
            writeln!(out, "Model path not found: {}", path.display())?;
            return Ok(ProbeOutcome::MissingModel);
        }

        match self.inspect(out) {
            Ok(()) => Ok(ProbeOutcome::Completed),
            Err(err) => {
                error!("Inspection of {:?} failed: {:#}", path, err);
                write_error(out, &err)?;
                Ok(ProbeOutcome::Failed)
            }
        }
    }

    fn inspect<W: Write>(&self, out: &mut W) -> Result<()> {
        let config = &self.config;

        info!("📂 Loading model from: {:?}", config.model_path);
        let model = self.runtime.load(&config.model_path)?;

        if config.show_signature {
            self.write_signature(&model, out)?;
        }

        let nodes = model.signature_graph(&config.signature, config.expand_functions)?;
        debug!("Signature {}: {} graph nodes", config.signature, nodes.len());

        writeln!(out, "=== FIRST CONV LAYER INFO ===")?;
        match self.find_conv_weight(&nodes) {
            Some(node) => {
                writeln!(out, "Node: {}", node.name)?;
                writeln!(out, "Op: {}", node.op)?;
                if let Some(shape) = node.attr("shape") {
                    writeln!(out, "Shape: {}", shape)?;
                }
            }
            None => warn!(
                "No graph node has {:?} and one of {:?} in its name",
                config.conv_marker, config.weight_markers
            ),
        }

        match self.find_layer_conv(&nodes) {
            Some(node) => {
                writeln!(out, "Conv2D node: {}", node.name)?;
                writeln!(out, "Inputs: {:?}", node.inputs)?;
            }
            None => warn!(
                "No {} op with {:?} in its name",
                config.conv_op, config.layer_marker
            ),
        }

        writeln!(out, "\n=== VARIABLES ===")?;
        // Independent second load for the variable scan
        let model = self.runtime.load(&config.model_path)?;
        let variables = model.trainable_variables()?;
        debug!("{} trainable variables", variables.len());

        match variables.iter().find(|v| config.is_layer_kernel(&v.name)) {
            Some(var) => {
                writeln!(out, "Variable: {}", var.name)?;
                writeln!(out, "Shape: {}", var.shape)?;
                let tensor = model.read_variable(var)?;
                let values = leading_values(&tensor, config.sample_len)?;
                writeln!(out, "First few values: {}", values)?;
            }
            None => warn!(
                "No trainable variable has {:?} and {:?} in its name",
                config.layer_marker, config.kernel_marker
            ),
        }

        Ok(())
    }

    fn write_signature<W: Write>(&self, model: &R::Model, out: &mut W) -> Result<()> {
        let summary = model.signature_io(&self.config.signature)?;

        writeln!(out, "=== SIGNATURE ===")?;
        writeln!(out, "Signature: {}", self.config.signature)?;
        if let Some(version) = &summary.tensorflow_version {
            writeln!(out, "TensorFlow: {}", version)?;
        }
        writeln!(out, "Tags: {:?}", summary.tags)?;
        writeln!(out, "Inputs:")?;
        for spec in &summary.inputs {
            writeln!(out, "  {}: {} {} {}", spec.key, spec.tensor_name, spec.dtype, spec.shape)?;
        }
        writeln!(out, "Outputs:")?;
        for spec in &summary.outputs {
            writeln!(out, "  {}: {} {} {}", spec.key, spec.tensor_name, spec.dtype, spec.shape)?;
        }
        writeln!(out)?;
        Ok(())
    }

    fn find_conv_weight<'n>(&self, nodes: &'n [GraphNode]) -> Option<&'n GraphNode> {
        nodes
            .iter()
            .find(|n| self.config.is_conv_weight_node(&n.name))
    }

    fn find_layer_conv<'n>(&self, nodes: &'n [GraphNode]) -> Option<&'n GraphNode> {
        nodes
            .iter()
            .find(|n| self.config.is_layer_conv_op(&n.name, &n.op))
    }
}

/// First `n` values of the flattened tensor in list form, e.g. `[0.5, 1.0]`.
/// Values keep their stored dtype; half types print as f32.
pub fn leading_values(tensor: &Tensor, n: usize) -> Result<String> {
    let flat = tensor.flatten_all()?;
    let len = flat.elem_count();
    let head = flat.narrow(0, 0, n.min(len))?;
    let text = match head.dtype() {
        DType::F64 => format!("{:?}", head.to_vec1::<f64>()?),
        DType::I64 => format!("{:?}", head.to_vec1::<i64>()?),
        DType::U32 => format!("{:?}", head.to_vec1::<u32>()?),
        DType::U8 => format!("{:?}", head.to_vec1::<u8>()?),
        _ => format!("{:?}", head.to_dtype(DType::F32)?.to_vec1::<f32>()?),
    };
    Ok(text)
}

/// `Error: <message>`, the cause chain, then the captured backtrace.
pub fn write_error<W: Write>(out: &mut W, err: &anyhow::Error) -> io::Result<()> {
    writeln!(out, "Error: {}", err)?;
    writeln!(out, "Stack trace:")?;
    for cause in err.chain().skip(1) {
        writeln!(out, "  caused by: {}", cause)?;
    }

    let backtrace = err.backtrace();
    match backtrace.status() {
        BacktraceStatus::Captured => writeln!(out, "{}", backtrace)?,
        _ => writeln!(
            out,
            "  <backtrace not captured; set RUST_LIB_BACKTRACE=1 to record one>"
        )?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_leading_values_truncates() -> Result<()> {
        let values: Vec<f32> = (0..36).map(|i| i as f32 * 0.01).collect();
        let t = Tensor::from_vec(values.clone(), (3, 3, 1, 4), &Device::Cpu)?;
        assert_eq!(leading_values(&t, 10)?, format!("{:?}", &values[..10]));
        Ok(())
    }

    #[test]
    fn test_leading_values_short_tensor() -> Result<()> {
        let t = Tensor::from_vec(vec![1i64, 2, 3], 3, &Device::Cpu)?;
        assert_eq!(leading_values(&t, 10)?, "[1, 2, 3]");
        Ok(())
    }

    #[test]
    fn test_leading_values_keep_precision() -> Result<()> {
        let doubles = Tensor::from_vec(vec![0.123456789012f64, 2.5, 3.0], 3, &Device::Cpu)?;
        assert_eq!(leading_values(&doubles, 2)?, "[0.123456789012, 2.5]");

        let big = Tensor::from_vec(vec![9_007_199_254_740_993i64], 1, &Device::Cpu)?;
        assert_eq!(leading_values(&big, 10)?, "[9007199254740993]");
        Ok(())
    }

    #[test]
    fn test_write_error_includes_causes() -> Result<()> {
        let err = anyhow::anyhow!("bad varint").context("Failed to decode saved_model.pb");
        let mut out = Vec::new();
        write_error(&mut out, &err)?;
        let text = String::from_utf8(out)?;
        assert!(text.starts_with("Error: Failed to decode saved_model.pb\n"));
        assert!(text.contains("Stack trace:"));
        assert!(text.contains("caused by: bad varint"));
        Ok(())
    }
}
