use chrono::{DateTime, Utc};

use crate::block::BlockInfo;
use crate::error::RunError;
use crate::run::Run;
use crate::status::RunStatus;
use crate::step::Step;

/// A partial write to a run.
///
/// Fields left as `None` are untouched. Stores apply updates through
/// [`RunUpdate::apply`] inside their per-run critical section, so either the
/// whole update lands or none of it does.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunUpdate {
  /// Precondition: the update only applies if the run is in this status.
  pub expected_status: Option<RunStatus>,
  /// Precondition: the update only applies if no cancel is pending.
  pub expect_not_cancelled: bool,
  pub status: Option<RunStatus>,
  pub current_step_index: Option<usize>,
  pub steps: Vec<(usize, Step)>,
  pub error_message: Option<Option<String>>,
  pub block_info: Option<Option<BlockInfo>>,
  pub cancel_requested: Option<bool>,
}

impl RunUpdate {
  pub fn new() -> Self {
    Self::default()
  }

  /// Only apply if the run is currently in `status` (compare-and-swap).
  pub fn expect(mut self, status: RunStatus) -> Self {
    self.expected_status = Some(status);
    self
  }

  /// Only apply if nobody asked to cancel the run. Used for writes that
  /// start new work.
  pub fn expect_not_cancelled(mut self) -> Self {
    self.expect_not_cancelled = true;
    self
  }

  pub fn status(mut self, status: RunStatus) -> Self {
    self.status = Some(status);
    self
  }

  pub fn current_step_index(mut self, index: usize) -> Self {
    self.current_step_index = Some(index);
    self
  }

  pub fn step(mut self, index: usize, step: Step) -> Self {
    self.steps.push((index, step));
    self
  }

  pub fn error_message(mut self, message: impl Into<String>) -> Self {
    self.error_message = Some(Some(message.into()));
    self
  }

  pub fn block(mut self, info: BlockInfo) -> Self {
    self.status = Some(RunStatus::Blocked);
    self.block_info = Some(Some(info));
    self
  }

  pub fn cancel_requested(mut self, requested: bool) -> Self {
    self.cancel_requested = Some(requested);
    self
  }

  /// Apply the update to `run`, leaving it untouched on error.
  pub fn apply(self, run: &mut Run, now: DateTime<Utc>) -> Result<(), RunError> {
    if let Some(expected) = self.expected_status
      && expected != run.status
    {
      return Err(RunError::UnexpectedStatus {
        expected,
        actual: run.status,
      });
    }
    if run.status.is_terminal() {
      return Err(RunError::Finished { status: run.status });
    }
    if self.expect_not_cancelled && run.cancel_requested {
      return Err(RunError::CancelRequested);
    }

    let mut next = run.clone();

    if let Some(status) = self.status {
      if !run.status.can_transition_to(status) {
        return Err(RunError::InvalidTransition {
          from: run.status,
          to: status,
        });
      }
      next.status = status;
    }

    if let Some(index) = self.current_step_index {
      if index < run.current_step_index {
        return Err(RunError::IndexRegression {
          from: run.current_step_index,
          to: index,
        });
      }
      if index != run.current_step_index
        && (run.status == RunStatus::Blocked || next.status == RunStatus::Blocked)
      {
        return Err(RunError::IndexPinned);
      }
      if index > run.steps.len() {
        return Err(RunError::StepOutOfRange {
          index,
          len: run.steps.len(),
        });
      }
      next.current_step_index = index;
    }

    for (index, step) in self.steps {
      let len = next.steps.len();
      let slot = next
        .steps
        .get_mut(index)
        .ok_or(RunError::StepOutOfRange { index, len })?;
      *slot = step;
    }

    if let Some(message) = self.error_message {
      next.error_message = message;
    }
    if let Some(info) = self.block_info {
      next.block_info = info;
    }
    if let Some(requested) = self.cancel_requested {
      next.cancel_requested = requested;
    }

    // Block info lives exactly as long as the blocked status.
    if next.status == RunStatus::Blocked {
      if next.block_info.is_none() {
        return Err(RunError::MissingBlockInfo);
      }
    } else {
      next.block_info = None;
    }

    if next.status.is_terminal() {
      next.finished_at = Some(now);
    }
    next.updated_at = now;

    *run = next;
    Ok(())
  }
}
