use std::fmt;

use provisio_run::{BlockInfo, Task, TargetDescriptor};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Where an action reports its task list while it is still running.
///
/// The default sink discards reports.
#[derive(Clone, Default)]
pub struct Progress {
  sender: Option<mpsc::UnboundedSender<Vec<Task>>>,
}

impl Progress {
  pub fn channel() -> (Self, mpsc::UnboundedReceiver<Vec<Task>>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (
      Self {
        sender: Some(sender),
      },
      receiver,
    )
  }

  /// Replace the step's task list. Best-effort.
  pub fn report(&self, tasks: Vec<Task>) {
    if let Some(sender) = &self.sender {
      let _ = sender.send(tasks);
    }
  }
}

impl fmt::Debug for Progress {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Progress")
      .field("connected", &self.sender.is_some())
      .finish()
  }
}

/// Everything an action gets to run one step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRequest {
  pub run_id: String,
  pub step_index: usize,
  pub action: String,
  pub label: String,
  pub params: serde_json::Value,
  pub target: TargetDescriptor,
  #[serde(skip)]
  pub progress: Progress,
}

impl StepRequest {
  /// Deserialize the step params into `T`; `null` params read as `{}`.
  pub fn params<T: serde::de::DeserializeOwned>(&self) -> Result<T, crate::StepError> {
    let value = if self.params.is_null() {
      serde_json::Value::Object(serde_json::Map::new())
    } else {
      self.params.clone()
    };

    serde_json::from_value(value).map_err(|e| crate::StepError::InvalidParams {
      action: self.action.clone(),
      message: e.to_string(),
    })
  }
}

/// What a step action reports back.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
  /// The remote work finished.
  Success {
    tasks: Vec<Task>,
    note: Option<String>,
  },
  /// The remote work failed. Not retried by the orchestrator.
  Failure { error: String, tasks: Vec<Task> },
  /// A human has to make a trust decision before the step can continue.
  Blocked(BlockInfo),
}

impl StepOutcome {
  pub fn success(note: impl Into<String>) -> Self {
    Self::Success {
      tasks: Vec::new(),
      note: Some(note.into()),
    }
  }

  pub fn failure(error: impl Into<String>) -> Self {
    Self::Failure {
      error: error.into(),
      tasks: Vec::new(),
    }
  }
}
