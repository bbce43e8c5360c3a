//! End-to-end reports over SavedModel directories written to disk.

use anyhow::Result;
use conv_probe::{Inspector, ProbeConfig, ProbeOutcome, SavedModelRuntime};
use std::path::Path;
use tf_savedmodel::fixtures;

fn report(dir: &Path, config: ProbeConfig) -> Result<(String, ProbeOutcome)> {
    let config = ProbeConfig {
        model_path: dir.to_path_buf(),
        ..config
    };
    let inspector = Inspector::new(SavedModelRuntime::new(config.tags.clone()), config);
    let mut out = Vec::new();
    let outcome = inspector.run(&mut out)?;
    Ok((String::from_utf8(out)?, outcome))
}

#[test]
fn test_graph_model_report() -> Result<()> {
    let dir = tempfile::tempdir()?;
    fixtures::write_graph_model(dir.path())?;

    let (text, outcome) = report(dir.path(), ProbeConfig::default())?;
    let expected = format!(
        "=== FIRST CONV LAYER INFO ===\n\
         Node: conv2d_1/kernel\n\
         Op: VariableV2\n\
         Shape: (3, 3, 1, 4)\n\
         Conv2D node: conv2d_1/convolution\n\
         Inputs: [\"input\", \"conv2d_1/kernel/read\"]\n\
         \n\
         === VARIABLES ===\n\
         Variable: conv2d_1/kernel:0\n\
         Shape: (3, 3, 1, 4)\n\
         First few values: {:?}\n",
        &fixtures::conv1_kernel_values()[..10]
    );
    assert_eq!(text, expected);
    assert_eq!(outcome, ProbeOutcome::Completed);
    Ok(())
}

#[test]
fn test_object_graph_model_report() -> Result<()> {
    let dir = tempfile::tempdir()?;
    fixtures::write_object_graph_model(dir.path())?;

    // The signature function only calls the model body, and resource
    // variables never appear as graph nodes, so both scans come up empty.
    let (text, outcome) = report(dir.path(), ProbeConfig::default())?;
    let expected = format!(
        "=== FIRST CONV LAYER INFO ===\n\
         \n\
         === VARIABLES ===\n\
         Variable: conv2d_1/kernel:0\n\
         Shape: (3, 3, 1, 4)\n\
         First few values: {:?}\n",
        &fixtures::conv1_kernel_values()[..10]
    );
    assert_eq!(text, expected);
    assert_eq!(outcome, ProbeOutcome::Completed);
    Ok(())
}

#[test]
fn test_object_graph_model_expanded_functions() -> Result<()> {
    let dir = tempfile::tempdir()?;
    fixtures::write_object_graph_model(dir.path())?;

    let config = ProbeConfig {
        expand_functions: true,
        ..Default::default()
    };
    let (text, outcome) = report(dir.path(), config)?;
    assert!(
        text.starts_with(
            "=== FIRST CONV LAYER INFO ===\n\
             Conv2D node: model/conv2d_1/Conv2D\n\
             Inputs: [\"input_1\", \"model/conv2d_1/Conv2D/ReadVariableOp\"]\n\
             \n\
             === VARIABLES ===\n"
        ),
        "unexpected report:\n{}",
        text
    );
    assert_eq!(outcome, ProbeOutcome::Completed);
    Ok(())
}

#[test]
fn test_signature_info_section() -> Result<()> {
    let dir = tempfile::tempdir()?;
    fixtures::write_graph_model(dir.path())?;

    let config = ProbeConfig {
        show_signature: true,
        ..Default::default()
    };
    let (text, _) = report(dir.path(), config)?;
    assert!(text.starts_with(
        "=== SIGNATURE ===\n\
         Signature: serving_default\n\
         TensorFlow: 1.15.0\n\
         Tags: [\"serve\"]\n\
         Inputs:\n  input: input:0 float32 (?, ?, ?, 1)\n\
         Outputs:\n  output: conv2d_2/convolution:0 float32 (?, ?, ?, 4)\n\
         \n\
         === FIRST CONV LAYER INFO ===\n"
    ));
    Ok(())
}

#[test]
fn test_unknown_signature_fails_before_sections() -> Result<()> {
    let dir = tempfile::tempdir()?;
    fixtures::write_graph_model(dir.path())?;

    let config = ProbeConfig {
        signature: "serving".to_string(),
        ..Default::default()
    };
    let (text, outcome) = report(dir.path(), config)?;
    assert!(text.starts_with("Error: Signature \"serving\" not found"));
    assert!(!text.contains("=== FIRST CONV LAYER INFO ==="));
    assert_eq!(outcome, ProbeOutcome::Failed);
    Ok(())
}

#[test]
fn test_directory_without_saved_model() -> Result<()> {
    let dir = tempfile::tempdir()?;

    let (text, outcome) = report(dir.path(), ProbeConfig::default())?;
    assert!(text.starts_with("Error: No saved_model.pb found"));
    assert!(text.contains("Stack trace:\n"));
    assert_eq!(outcome, ProbeOutcome::Failed);
    Ok(())
}

#[test]
fn test_second_layer_via_config() -> Result<()> {
    let dir = tempfile::tempdir()?;
    fixtures::write_graph_model(dir.path())?;

    let config = ProbeConfig {
        layer_marker: "conv2d_2".to_string(),
        sample_len: 3,
        ..Default::default()
    };
    let (text, _) = report(dir.path(), config)?;
    assert!(text.contains("Conv2D node: conv2d_2/convolution\n"));
    assert!(text.contains("Variable: conv2d_2/kernel:0\nShape: (3, 3, 4, 4)\nFirst few values: [-0.0, -0.001, -0.002]\n"));
    Ok(())
}
