use serde::{Deserialize, Serialize};

use crate::TargetDescriptor;

/// Why a run is waiting on a human.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
  /// The host presented a key that is not in the trust store yet.
  HostVerificationNeeded,
  /// The host presented a key that differs from the trusted one.
  HostKeyChanged,
}

impl BlockReason {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::HostVerificationNeeded => "host_verification_needed",
      Self::HostKeyChanged => "host_key_changed",
    }
  }
}

/// The pending decision of a blocked run.
///
/// Holds what a UI needs to render the trust prompt plus the target the
/// blocked step has to be retried against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockInfo {
  pub reason: BlockReason,
  pub host: String,
  pub port: u16,
  pub fingerprints: Vec<String>,
  pub target: TargetDescriptor,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub message: Option<String>,
}

impl BlockInfo {
  /// Host verification prompt for the fingerprints `target` presented.
  pub fn host_verification(target: &TargetDescriptor, fingerprints: Vec<String>) -> Self {
    Self {
      reason: BlockReason::HostVerificationNeeded,
      host: target.host.clone(),
      port: target.port,
      fingerprints,
      target: target.clone(),
      message: None,
    }
  }

  pub fn with_message(mut self, message: impl Into<String>) -> Self {
    self.message = Some(message.into());
    self
  }
}
