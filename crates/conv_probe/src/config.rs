//! Probe Configuration
//!
//! Built-in defaults, optionally overlaid by a JSON file, then by CLI flags.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

pub const DEFAULT_MODEL_PATH: &str = "src/main/resources/models/2D/he_heavy_augment";

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ProbeConfig {
    pub model_path: PathBuf,
    pub signature: String,
    /// Also scan the bodies of functions the signature graph calls
    pub expand_functions: bool,
    /// Tried in order when picking a meta graph
    pub tags: Vec<String>,
    // Graph scan: first node whose lower-cased name has conv_marker
    // and whose name has any weight marker
    pub conv_marker: String,
    pub weight_markers: Vec<String>,
    // Op scan
    pub conv_op: String,
    pub layer_marker: String,
    // Variable scan (uses layer_marker too)
    pub kernel_marker: String,
    pub sample_len: usize,
    pub show_signature: bool,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from(DEFAULT_MODEL_PATH),
            signature: tf_savedmodel::DEFAULT_SIGNATURE.to_string(),
            expand_functions: false,
            tags: tf_savedmodel::DEFAULT_TAGS
                .iter()
                .map(|t| t.to_string())
                .collect(),
            conv_marker: "conv2d".to_string(),
            weight_markers: vec!["kernel".to_string(), "weight".to_string()],
            conv_op: "Conv2D".to_string(),
            layer_marker: "conv2d_1".to_string(),
            kernel_marker: "kernel".to_string(),
            sample_len: 10,
            show_signature: false,
        }
    }
}

impl ProbeConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("Failed to open probe config {:?}", path))?;
        let config = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("Failed to parse probe config {:?}", path))?;
        tracing::debug!("Loaded probe config from {:?}", path);
        Ok(config)
    }

    /// Graph-node filter for the layer-info scan.
    pub fn is_conv_weight_node(&self, name: &str) -> bool {
        name.to_lowercase().contains(&self.conv_marker)
            && self.weight_markers.iter().any(|m| name.contains(m.as_str()))
    }

    /// Graph-node filter for the convolution-op scan.
    pub fn is_layer_conv_op(&self, name: &str, op: &str) -> bool {
        op == self.conv_op && name.contains(&self.layer_marker)
    }

    /// Variable filter for the kernel-values scan.
    pub fn is_layer_kernel(&self, name: &str) -> bool {
        name.contains(&self.layer_marker) && name.contains(&self.kernel_marker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_filters() {
        let config = ProbeConfig::default();
        assert!(config.is_conv_weight_node("Conv2D_3/kernel"));
        assert!(config.is_conv_weight_node("model/conv2d/weights"));
        assert!(!config.is_conv_weight_node("conv2d_1/bias"));
        assert!(!config.is_conv_weight_node("dense/kernel"));
        // markers other than the conv marker are case-sensitive
        assert!(!config.is_conv_weight_node("conv2d_1/KERNEL"));

        assert!(config.is_layer_conv_op("conv2d_1/convolution", "Conv2D"));
        assert!(!config.is_layer_conv_op("conv2d_1/convolution", "DepthwiseConv2dNative"));
        assert!(!config.is_layer_conv_op("conv2d_2/convolution", "Conv2D"));

        assert!(config.is_layer_kernel("conv2d_1/kernel:0"));
        assert!(!config.is_layer_kernel("conv2d_1/bias:0"));
    }

    #[test]
    fn test_partial_config_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("probe.json");
        let mut file = File::create(&path)?;
        writeln!(file, r#"{{ "layer_marker": "conv2d_7", "sample_len": 4 }}"#)?;

        let config = ProbeConfig::load(&path)?;
        assert_eq!(config.layer_marker, "conv2d_7");
        assert_eq!(config.sample_len, 4);
        assert_eq!(config.signature, "serving_default");
        assert!(!config.expand_functions);
        assert_eq!(config.model_path, PathBuf::from(DEFAULT_MODEL_PATH));
        Ok(())
    }

    #[test]
    fn test_bad_config_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("probe.json");
        std::fs::write(&path, "{ not json")?;

        let err = ProbeConfig::load(&path).unwrap_err();
        assert!(err.to_string().contains("Failed to parse probe config"));
        Ok(())
    }
}
