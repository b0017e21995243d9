use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::block::BlockInfo;
use crate::error::RunError;
use crate::status::{RunStatus, StepStatus};
use crate::step::Step;
use crate::{RunOptions, StepDef, TargetDescriptor};

/// One full execution of an ordered step list against a target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
  pub run_id: String,
  pub status: RunStatus,
  pub steps: Vec<Step>,
  pub current_step_index: usize,
  pub target: TargetDescriptor,
  #[serde(default)]
  pub options: RunOptions,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub finished_at: Option<DateTime<Utc>>,
  /// Why the run failed, as `"<step label>: <fault text>"` for a step
  /// failure. The failed step's own `error` carries the bare fault text.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error_message: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub block_info: Option<BlockInfo>,
  /// Set by `cancel`; the worker acts on it at its next checkpoint.
  #[serde(default)]
  pub cancel_requested: bool,
}

impl Run {
  /// Validate a submitted step list and build a pending run from it.
  pub fn new(
    steps: Vec<StepDef>,
    target: TargetDescriptor,
    options: RunOptions,
  ) -> Result<Self, RunError> {
    if steps.is_empty() {
      return Err(RunError::EmptySteps);
    }
    for (index, def) in steps.iter().enumerate() {
      Step::validate(def, index)?;
    }
    if target.host.trim().is_empty() {
      return Err(RunError::InvalidTarget("host is empty".to_string()));
    }

    let now = Utc::now();
    Ok(Self {
      run_id: uuid::Uuid::new_v4().to_string(),
      status: RunStatus::Pending,
      steps: steps.into_iter().map(Step::from_def).collect(),
      current_step_index: 0,
      target,
      options,
      created_at: now,
      updated_at: now,
      finished_at: None,
      error_message: None,
      block_info: None,
      cancel_requested: false,
    })
  }

  pub fn is_active(&self) -> bool {
    self.status.is_active()
  }

  pub fn current_step(&self) -> Option<&Step> {
    self.steps.get(self.current_step_index)
  }

  /// Index of the step currently in progress, if any.
  pub fn in_progress_step(&self) -> Option<usize> {
    self
      .steps
      .iter()
      .position(|s| s.status == StepStatus::InProgress)
  }

  /// The step that made the run fail.
  pub fn failed_step(&self) -> Option<(usize, &Step)> {
    self
      .steps
      .iter()
      .enumerate()
      .find(|(_, s)| s.status == StepStatus::Failed)
  }

  pub fn summary(&self) -> RunSummary {
    RunSummary {
      run_id: self.run_id.clone(),
      is_running: self.is_active(),
      current_step: self.current_step_index,
      total_steps: self.steps.len(),
      status: self.status,
    }
  }
}

/// Lightweight view of a run for polling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
  pub run_id: String,
  pub is_running: bool,
  pub current_step: usize,
  pub total_steps: usize,
  pub status: RunStatus,
}
