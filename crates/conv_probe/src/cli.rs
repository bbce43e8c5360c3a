use crate::config::ProbeConfig;
use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about = "Inspect a convolution layer of a trained SavedModel", long_about = None)]
pub struct Cli {
    /// SavedModel directory
    #[arg(short, long)]
    pub model: Option<PathBuf>,

    /// Signature to read the graph from
    #[arg(short, long)]
    pub signature: Option<String>,

    /// Include nodes of functions called from the signature graph
    #[arg(long)]
    pub expand_functions: bool,

    /// Layer name marker for the Conv2D and variable scans (e.g. conv2d_1)
    #[arg(short, long)]
    pub layer: Option<String>,

    /// Number of kernel values to print
    #[arg(long)]
    pub samples: Option<usize>,

    /// Meta graph tag to prefer (repeatable)
    #[arg(long = "tag")]
    pub tags: Vec<String>,

    /// Also print the signature's inputs and outputs
    #[arg(long)]
    pub signature_info: bool,

    /// JSON config file (CLI flags take precedence)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Also write logs to a daily rolling file in this directory
    #[arg(long)]
    pub log_dir: Option<PathBuf>,
}

impl Cli {
    pub fn resolve_config(&self) -> Result<ProbeConfig> {
        let mut config = match &self.config {
            Some(path) => ProbeConfig::load(path)?,
            None => ProbeConfig::default(),
        };

        if let Some(model) = &self.model {
            config.model_path = model.clone();
        }
        if let Some(signature) = &self.signature {
            config.signature = signature.clone();
        }
        if self.expand_functions {
            config.expand_functions = true;
        }
        if let Some(layer) = &self.layer {
            config.layer_marker = layer.clone();
        }
        if let Some(samples) = self.samples {
            config.sample_len = samples;
        }
        if !self.tags.is_empty() {
            config.tags = self.tags.clone();
        }
        if self.signature_info {
            config.show_signature = true;
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_flags() -> Result<()> {
        let cli = Cli::try_parse_from(["conv_probe"])?;
        assert_eq!(cli.resolve_config()?, ProbeConfig::default());
        Ok(())
    }

    #[test]
    fn test_flags_override() -> Result<()> {
        let cli = Cli::try_parse_from([
            "conv_probe",
            "--model",
            "models/unet",
            "--layer",
            "conv2d_3",
            "--samples",
            "5",
            "--tag",
            "serve",
            "--tag",
            "gpu",
            "--signature-info",
            "--expand-functions",
        ])?;
        let config = cli.resolve_config()?;
        assert_eq!(config.model_path, PathBuf::from("models/unet"));
        assert_eq!(config.layer_marker, "conv2d_3");
        assert_eq!(config.sample_len, 5);
        assert_eq!(config.tags, vec!["serve", "gpu"]);
        assert!(config.show_signature);
        assert!(config.expand_functions);
        assert_eq!(config.signature, "serving_default");
        Ok(())
    }
}
