use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use provisio_trust::TrustStore;
use tracing::warn;

use crate::builtin::{NoopAction, VerifyHostAction, WaitAction};
use crate::error::StepError;
use crate::types::{StepOutcome, StepRequest};

/// Executes the remote operation behind a step.
///
/// Implementations own per-step timeouts. A returned `Err` is treated the
/// same as [`StepOutcome::Failure`].
#[async_trait]
pub trait StepRegistry: Send + Sync {
  async fn execute(&self, request: StepRequest) -> Result<StepOutcome, StepError>;
}

/// A single action registered in an [`ActionRegistry`].
#[async_trait]
pub trait StepAction: Send + Sync {
  async fn run(&self, request: &StepRequest) -> Result<StepOutcome, StepError>;
}

/// Step registry backed by a map from action id to action.
#[derive(Default, Clone)]
pub struct ActionRegistry {
  actions: HashMap<String, Arc<dyn StepAction>>,
}

impl ActionRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// A registry with `noop`, `wait` and `verify_host` registered.
  pub fn with_builtins(trust: Arc<dyn TrustStore>) -> Self {
    let mut registry = Self::new();
    registry.register("noop", NoopAction);
    registry.register("wait", WaitAction);
    registry.register("verify_host", VerifyHostAction::new(trust));
    registry
  }

  /// Register an action, replacing any previous one with the same id.
  pub fn register(&mut self, action: impl Into<String>, handler: impl StepAction + 'static) {
    self.actions.insert(action.into(), Arc::new(handler));
  }

  pub fn contains(&self, action: &str) -> bool {
    self.actions.contains_key(action)
  }
}

#[async_trait]
impl StepRegistry for ActionRegistry {
  async fn execute(&self, request: StepRequest) -> Result<StepOutcome, StepError> {
    match self.actions.get(&request.action) {
      Some(action) => action.run(&request).await,
      None => {
        warn!(
          run_id = %request.run_id,
          action = %request.action,
          "unknown action"
        );
        Ok(StepOutcome::failure(format!(
          "unknown action '{}'",
          request.action
        )))
      }
    }
  }
}
