//! Run events and notifiers for observability.
//!
//! Events are emitted as the worker and the control surface move a run
//! through its states, so consumers can stream progress to a UI or assert
//! on the exact transition sequence in tests. The store stays the source of
//! truth; events are best-effort.

use provisio_run::{BlockReason, RunStatus};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Events emitted during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunEvent {
  /// The worker picked the run up and set it running.
  RunStarted { run_id: String },

  /// A step was dispatched to the step registry.
  StepStarted { run_id: String, step_index: usize },

  /// A step finished successfully.
  StepCompleted { run_id: String, step_index: usize },

  /// A step failed.
  StepFailed {
    run_id: String,
    step_index: usize,
    error: String,
  },

  /// The run is waiting on a human decision.
  RunBlocked {
    run_id: String,
    step_index: usize,
    reason: BlockReason,
  },

  /// A block was accepted and the run is running again.
  RunResumed { run_id: String, step_index: usize },

  /// The run reached a terminal status.
  RunFinished { run_id: String, status: RunStatus },
}

/// Trait for receiving run events.
pub trait RunNotifier: Send + Sync {
  fn notify(&self, event: RunEvent);
}

/// A no-op notifier that discards all events.
#[derive(Debug, Clone, Default)]
pub struct NoopNotifier;

impl RunNotifier for NoopNotifier {
  fn notify(&self, _event: RunEvent) {}
}

/// A notifier that sends events to an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
  sender: mpsc::UnboundedSender<RunEvent>,
}

impl ChannelNotifier {
  pub fn new(sender: mpsc::UnboundedSender<RunEvent>) -> Self {
    Self { sender }
  }
}

impl RunNotifier for ChannelNotifier {
  fn notify(&self, event: RunEvent) {
    // Ignore send errors - receiver may have been dropped
    let _ = self.sender.send(event);
  }
}
