use serde::{Deserialize, Serialize};

fn default_port() -> u16 {
  22
}

/// Addressing and credential context for the remote host a run operates on.
///
/// The orchestrator only reads `host`, `port` and `host_key_fingerprints`
/// (to build a trust prompt). Everything else is carried through untouched
/// in `extra` for the step actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetDescriptor {
  pub host: String,

  #[serde(default = "default_port")]
  pub port: u16,

  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub username: Option<String>,

  /// Fingerprints of the host keys the host presented when last contacted.
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub host_key_fingerprints: Vec<String>,

  #[serde(flatten)]
  pub extra: serde_json::Map<String, serde_json::Value>,
}

impl TargetDescriptor {
  pub fn new(host: impl Into<String>, port: u16) -> Self {
    Self {
      host: host.into(),
      port,
      username: None,
      host_key_fingerprints: Vec::new(),
      extra: serde_json::Map::new(),
    }
  }

  /// `host:port`, as used in logs and trust prompts.
  pub fn address(&self) -> String {
    format!("{}:{}", self.host, self.port)
  }
}
