use provisio_trust::TrustError;

/// Errors an action can raise instead of reporting an outcome.
///
/// The orchestrator turns any of these into a failed step; they never reach
/// a polling client as an error.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
  #[error("invalid params for '{action}': {message}")]
  InvalidParams { action: String, message: String },

  #[error("remote operation failed: {0}")]
  Remote(String),

  #[error("trust store error: {0}")]
  Trust(#[from] TrustError),
}
