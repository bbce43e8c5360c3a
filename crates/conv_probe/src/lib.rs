//! Conv Probe
//!
//! Ad-hoc inspection of a trained image model's convolution layer: declared
//! shape metadata from the signature graph, the matching Conv2D op, and a
//! sample of the stored kernel weights.

pub mod cli;
pub mod config;
pub mod inspect;
pub mod runtime;

pub use config::ProbeConfig;
pub use inspect::{Inspector, ProbeOutcome};
pub use runtime::{LoadedModel, ModelRuntime, SavedModelRuntime, SignatureSummary};
