//! The blocking-resolution contract.
//!
//! A blocked run waits on a human decision. Whoever owns the run exposes
//! the pending decision through [`BlockResolver::get_block_info`] and takes
//! the answer through [`BlockResolver::resolve`]. The orchestrator
//! implements it; a sibling job queue with the same prompt can too.

use async_trait::async_trait;
use provisio_run::BlockInfo;
use provisio_trust::TrustDecision;
use serde::{Deserialize, Serialize};

use crate::error::OrchestratorError;

/// What happens to a run whose block was rejected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectAction {
  #[default]
  Cancel,
  Fail,
}

/// The answer to a pending block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Resolution {
  /// Trust the host and retry the blocked step.
  ///
  /// Without an explicit decision, the host and fingerprints from the
  /// block info are trusted as presented.
  Accept { decision: Option<TrustDecision> },
  /// Do not trust the host; the run ends.
  Reject { action: RejectAction },
}

impl Resolution {
  pub fn accept() -> Self {
    Self::Accept { decision: None }
  }

  pub fn reject() -> Self {
    Self::Reject {
      action: RejectAction::default(),
    }
  }

  pub fn is_accept(&self) -> bool {
    matches!(self, Self::Accept { .. })
  }
}

impl From<bool> for Resolution {
  fn from(accept: bool) -> Self {
    if accept {
      Self::accept()
    } else {
      Self::reject()
    }
  }
}

#[async_trait]
pub trait BlockResolver: Send + Sync {
  /// The pending decision, if the run is blocked.
  async fn get_block_info(&self, run_id: &str) -> Result<Option<BlockInfo>, OrchestratorError>;

  /// Answer the pending decision.
  async fn resolve(&self, run_id: &str, resolution: Resolution) -> Result<(), OrchestratorError>;
}

/// The decision an accept commits: the explicit one, checked against the
/// block, or the presented identity.
pub(crate) fn decision_for(
  info: &BlockInfo,
  decision: Option<TrustDecision>,
) -> Result<TrustDecision, OrchestratorError> {
  let Some(decision) = decision else {
    return Ok(TrustDecision::new(
      info.host.clone(),
      info.port,
      info.fingerprints.clone(),
    ));
  };

  if decision.host != info.host || decision.port != info.port {
    return Err(OrchestratorError::DecisionMismatch {
      expected: format!("{}:{}", info.host, info.port),
      actual: format!("{}:{}", decision.host, decision.port),
    });
  }
  Ok(decision)
}
