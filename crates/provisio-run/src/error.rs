use thiserror::Error;

use crate::status::RunStatus;

/// Validation errors for run construction and updates.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunError {
  #[error("step list is empty")]
  EmptySteps,

  #[error("step {index} is invalid: {message}")]
  InvalidStep { index: usize, message: String },

  #[error("target is invalid: {0}")]
  InvalidTarget(String),

  #[error("run is already {status}")]
  Finished { status: RunStatus },

  #[error("run is {actual}, expected {expected}")]
  UnexpectedStatus {
    expected: RunStatus,
    actual: RunStatus,
  },

  #[error("cannot move run from {from} to {to}")]
  InvalidTransition { from: RunStatus, to: RunStatus },

  #[error("current step index cannot move back from {from} to {to}")]
  IndexRegression { from: usize, to: usize },

  #[error("current step index is pinned while the run is blocked")]
  IndexPinned,

  #[error("step index {index} out of range ({len} steps)")]
  StepOutOfRange { index: usize, len: usize },

  #[error("run has a pending cancel request")]
  CancelRequested,

  #[error("blocked status requires block info")]
  MissingBlockInfo,
}
