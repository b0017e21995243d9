use std::fmt;

use serde::{Deserialize, Serialize};

/// Status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
  Pending,
  Running,
  Blocked,
  Completed,
  Failed,
  Cancelled,
}

impl RunStatus {
  /// Pending, running or blocked. Only one such run may exist at a time.
  pub fn is_active(self) -> bool {
    matches!(self, Self::Pending | Self::Running | Self::Blocked)
  }

  pub fn is_terminal(self) -> bool {
    !self.is_active()
  }

  pub fn as_str(self) -> &'static str {
    match self {
      Self::Pending => "pending",
      Self::Running => "running",
      Self::Blocked => "blocked",
      Self::Completed => "completed",
      Self::Failed => "failed",
      Self::Cancelled => "cancelled",
    }
  }

  /// Whether a run may move from `self` to `next`.
  pub fn can_transition_to(self, next: RunStatus) -> bool {
    use RunStatus::*;

    match (self, next) {
      (Pending, Running | Failed | Cancelled) => true,
      (Running, Running | Blocked | Completed | Failed | Cancelled) => true,
      (Blocked, Blocked | Running | Failed | Cancelled) => true,
      _ => false,
    }
  }
}

impl fmt::Display for RunStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Status of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
  Pending,
  InProgress,
  Completed,
  Failed,
}

impl StepStatus {
  pub fn is_settled(self) -> bool {
    matches!(self, Self::Completed | Self::Failed)
  }

  pub fn as_str(self) -> &'static str {
    match self {
      Self::Pending => "pending",
      Self::InProgress => "in_progress",
      Self::Completed => "completed",
      Self::Failed => "failed",
    }
  }
}
