//! Orchestrator error types.

use provisio_run::{RunError, RunStatus};
use provisio_store::StoreError;
use provisio_trust::TrustError;

/// Errors returned synchronously by the control surface.
///
/// Step failures are not errors here: they are recorded on the run and
/// read back through `get_state`.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
  /// The submitted step list or target is malformed.
  #[error("invalid run: {0}")]
  InvalidRun(#[from] RunError),

  /// Another run occupies the active slot.
  #[error("run {run_id} is already active")]
  RunAlreadyActive { run_id: String },

  /// No run with this id is stored (or it has been purged).
  #[error("run not found: {0}")]
  RunNotFound(String),

  /// The run is not blocked, so there is nothing to resolve.
  #[error("run {run_id} is not blocked (status: {status})")]
  NotBlocked { run_id: String, status: RunStatus },

  /// The run has already finished.
  #[error("run {run_id} is not active (status: {status})")]
  NotActive { run_id: String, status: RunStatus },

  /// The run is still active and cannot be cleared.
  #[error("run {run_id} is still active; cancel it first")]
  StillActive { run_id: String },

  /// The supplied decision is for a different host than the pending one.
  #[error("decision is for {actual}, but the run is waiting on {expected}")]
  DecisionMismatch { expected: String, actual: String },

  /// Recording the trust decision failed; the run stays blocked.
  #[error("failed to record trust decision: {0}")]
  Trust(#[from] TrustError),

  /// The state store failed.
  #[error("store error: {0}")]
  Store(#[source] StoreError),
}

impl From<StoreError> for OrchestratorError {
  fn from(error: StoreError) -> Self {
    match error {
      StoreError::ActiveRunExists { run_id } => Self::RunAlreadyActive { run_id },
      StoreError::NotFound(run_id) => Self::RunNotFound(run_id),
      other => Self::Store(other),
    }
  }
}
