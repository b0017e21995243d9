//! Provisio Config
//!
//! This crate contains the serializable input types for provisio. These
//! types describe a provisioning run before the orchestrator turns it into a
//! persisted run record.
//!
//! Inputs can be loaded from:
//! - JSON files (via CLI with `provisio run steps.json --target target.json`)
//! - Any caller that builds them in code
//!
//! Step action identifiers and their parameter shapes belong to whoever
//! generates the step list; the orchestrator treats them as opaque.

mod error;
mod settings;
mod step;
mod target;

pub use error::ConfigError;
pub use settings::{OrchestratorConfig, RunOptions};
pub use step::StepDef;
pub use target::TargetDescriptor;

use std::path::Path;

use serde::de::DeserializeOwned;

/// Read and parse a JSON document from disk.
pub async fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
  let content = tokio::fs::read_to_string(path)
    .await
    .map_err(|source| ConfigError::Read {
      path: path.to_path_buf(),
      source,
    })?;

  serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
    path: path.to_path_buf(),
    source,
  })
}
