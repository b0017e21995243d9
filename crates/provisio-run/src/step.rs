use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::StepDef;
use crate::status::StepStatus;

/// Named state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
  Pending,
  Running,
  Done,
  Failed,
  Skipped,
}

/// Progress marker of a task: a named state, or a countdown in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskStatus {
  State { state: TaskState },
  Countdown { seconds: u64 },
}

impl From<TaskState> for TaskStatus {
  fn from(state: TaskState) -> Self {
    Self::State { state }
  }
}

/// A display-only progress item reported by a step action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
  pub name: String,
  pub status: TaskStatus,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub note: Option<String>,
}

impl Task {
  pub fn new(name: impl Into<String>, status: impl Into<TaskStatus>) -> Self {
    Self {
      name: name.into(),
      status: status.into(),
      note: None,
    }
  }

  pub fn countdown(name: impl Into<String>, seconds: u64) -> Self {
    Self::new(name, TaskStatus::Countdown { seconds })
  }

  pub fn with_note(mut self, note: impl Into<String>) -> Self {
    self.note = Some(note.into());
    self
  }
}

/// One unit of remote work inside a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
  pub action: String,
  pub label: String,
  #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
  pub params: serde_json::Value,
  pub status: StepStatus,
  #[serde(default)]
  pub tasks: Vec<Task>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub completion_note: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub started_at: Option<DateTime<Utc>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub finished_at: Option<DateTime<Utc>>,
}

impl Step {
  pub fn from_def(def: StepDef) -> Self {
    Self {
      action: def.action,
      label: def.label,
      params: def.params,
      status: StepStatus::Pending,
      tasks: Vec::new(),
      completion_note: None,
      error: None,
      started_at: None,
      finished_at: None,
    }
  }

  pub(crate) fn validate(def: &StepDef, index: usize) -> Result<(), crate::RunError> {
    let invalid = |message: &str| crate::RunError::InvalidStep {
      index,
      message: message.to_string(),
    };

    if def.action.trim().is_empty() {
      return Err(invalid("action is empty"));
    }
    if def.label.trim().is_empty() {
      return Err(invalid("label is empty"));
    }
    if !(def.params.is_null() || def.params.is_object()) {
      return Err(invalid("params must be an object"));
    }
    Ok(())
  }

  /// Copy of this step marked in progress. Tasks from an earlier attempt
  /// (a step retried after a block) are kept until the new outcome lands.
  pub fn started(&self, now: DateTime<Utc>) -> Self {
    Self {
      status: StepStatus::InProgress,
      started_at: Some(self.started_at.unwrap_or(now)),
      ..self.clone()
    }
  }

  pub fn completed(&self, tasks: Vec<Task>, note: Option<String>, now: DateTime<Utc>) -> Self {
    Self {
      status: StepStatus::Completed,
      tasks,
      completion_note: note,
      error: None,
      finished_at: Some(now),
      ..self.clone()
    }
  }

  pub fn failed(&self, error: String, tasks: Vec<Task>, now: DateTime<Utc>) -> Self {
    Self {
      status: StepStatus::Failed,
      tasks,
      error: Some(error),
      finished_at: Some(now),
      ..self.clone()
    }
  }
}
