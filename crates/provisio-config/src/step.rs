use serde::{Deserialize, Serialize};

/// One entry of a submitted step list.
///
/// ```json
/// { "action": "sync_data", "label": "Sync project files", "params": { "delete": false } }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDef {
  /// Action identifier looked up in the step registry.
  pub action: String,

  /// Human label shown while the step runs.
  pub label: String,

  /// Opaque parameters handed to the action.
  #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
  pub params: serde_json::Value,
}

impl StepDef {
  pub fn new(action: impl Into<String>, label: impl Into<String>) -> Self {
    Self {
      action: action.into(),
      label: label.into(),
      params: serde_json::Value::Null,
    }
  }

  pub fn with_params(mut self, params: serde_json::Value) -> Self {
    self.params = params;
    self
  }
}
