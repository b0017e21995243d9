//! Built-in step actions.
//!
//! - `noop`: succeeds immediately.
//! - `wait`: sleeps for `params.seconds` (default 0), e.g. after a reboot,
//!   reporting a countdown every second.
//! - `verify_host`: checks the target's presented host key fingerprints
//!   against the trust store and blocks the run if a human has to decide.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use provisio_run::{BlockInfo, BlockReason, Task, TaskState};
use provisio_trust::{TrustState, TrustStore};
use serde::Deserialize;
use tracing::info;

use crate::error::StepError;
use crate::registry::StepAction;
use crate::types::{StepOutcome, StepRequest};

pub struct NoopAction;

#[async_trait]
impl StepAction for NoopAction {
  async fn run(&self, request: &StepRequest) -> Result<StepOutcome, StepError> {
    Ok(StepOutcome::success(format!("{} skipped", request.label)))
  }
}

#[derive(Debug, Default, Deserialize)]
struct WaitParams {
  #[serde(default)]
  seconds: u64,
}

pub struct WaitAction;

#[async_trait]
impl StepAction for WaitAction {
  async fn run(&self, request: &StepRequest) -> Result<StepOutcome, StepError> {
    let params: WaitParams = request.params()?;
    for remaining in (1..=params.seconds).rev() {
      request
        .progress
        .report(vec![Task::countdown("wait", remaining)]);
      tokio::time::sleep(Duration::from_secs(1)).await;
    }

    Ok(StepOutcome::Success {
      tasks: vec![Task::new("wait", TaskState::Done)],
      note: Some(format!("waited {}s", params.seconds)),
    })
  }
}

/// Checks the target's host key fingerprints against the trust store.
pub struct VerifyHostAction {
  trust: Arc<dyn TrustStore>,
}

impl VerifyHostAction {
  pub fn new(trust: Arc<dyn TrustStore>) -> Self {
    Self { trust }
  }
}

#[async_trait]
impl StepAction for VerifyHostAction {
  async fn run(&self, request: &StepRequest) -> Result<StepOutcome, StepError> {
    let target = &request.target;
    if target.host_key_fingerprints.is_empty() {
      return Ok(StepOutcome::Failure {
        error: format!("{} presented no host key fingerprints", target.address()),
        tasks: vec![Task::new("host key", TaskState::Failed)],
      });
    }

    let mut changed = false;
    for fingerprint in &target.host_key_fingerprints {
      match self
        .trust
        .check(&target.host, target.port, fingerprint)
        .await?
      {
        TrustState::Trusted => {
          info!(
            run_id = %request.run_id,
            host = %target.address(),
            fingerprint = %fingerprint,
            "host key trusted"
          );
          return Ok(StepOutcome::Success {
            tasks: vec![Task::new("host key", TaskState::Done).with_note(fingerprint.clone())],
            note: Some(format!("{} verified", target.address())),
          });
        }
        TrustState::Mismatch => changed = true,
        TrustState::Unknown => {}
      }
    }

    let info = BlockInfo::host_verification(target, target.host_key_fingerprints.clone());
    let info = if changed {
      BlockInfo {
        reason: BlockReason::HostKeyChanged,
        ..info
      }
      .with_message(format!(
        "the host key for {} does not match the trusted one",
        target.address()
      ))
    } else {
      info.with_message(format!(
        "the authenticity of {} can't be established",
        target.address()
      ))
    };

    Ok(StepOutcome::Blocked(info))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{ActionRegistry, Progress, StepRegistry};
  use provisio_run::TargetDescriptor;
  use provisio_trust::{MemoryTrustStore, TrustDecision};
  use serde_json::json;

  fn request(action: &str, params: serde_json::Value, target: TargetDescriptor) -> StepRequest {
    StepRequest {
      run_id: "run-1".to_string(),
      step_index: 0,
      action: action.to_string(),
      label: action.to_string(),
      params,
      target,
      progress: Progress::default(),
    }
  }

  fn fingerprinted_target() -> TargetDescriptor {
    let mut target = TargetDescriptor::new("10.0.0.7", 22);
    target.host_key_fingerprints = vec!["SHA256:abc".to_string()];
    target
  }

  #[test]
  fn test_builtins_are_registered() {
    let registry = ActionRegistry::with_builtins(Arc::new(MemoryTrustStore::new()));
    for action in ["noop", "wait", "verify_host"] {
      assert!(registry.contains(action), "{action} missing");
    }
    assert!(!registry.contains("reboot"));
  }

  #[tokio::test]
  async fn test_unknown_action_is_a_failure_not_an_error() {
    let registry = ActionRegistry::new();
    let outcome = registry
      .execute(request("reboot", json!(null), fingerprinted_target()))
      .await
      .unwrap();
    assert_eq!(outcome, StepOutcome::failure("unknown action 'reboot'"));
  }

  #[tokio::test(start_paused = true)]
  async fn test_wait_counts_down_while_running() {
    let registry = ActionRegistry::with_builtins(Arc::new(MemoryTrustStore::new()));
    let (progress, mut reports) = Progress::channel();
    let mut request = request("wait", json!({ "seconds": 3 }), fingerprinted_target());
    request.progress = progress;

    let outcome = registry.execute(request).await.unwrap();

    let mut seen = Vec::new();
    while let Ok(tasks) = reports.try_recv() {
      seen.push(tasks);
    }
    assert_eq!(
      seen,
      vec![
        vec![Task::countdown("wait", 3)],
        vec![Task::countdown("wait", 2)],
        vec![Task::countdown("wait", 1)],
      ]
    );

    match outcome {
      StepOutcome::Success { tasks, note } => {
        assert_eq!(tasks, vec![Task::new("wait", TaskState::Done)]);
        assert_eq!(note.as_deref(), Some("waited 3s"));
      }
      other => panic!("unexpected outcome: {other:?}"),
    }
  }

  #[tokio::test]
  async fn test_wait_rejects_bad_params() {
    let registry = ActionRegistry::with_builtins(Arc::new(MemoryTrustStore::new()));
    let err = registry
      .execute(request("wait", json!({ "seconds": "soon" }), fingerprinted_target()))
      .await
      .unwrap_err();
    assert!(matches!(err, StepError::InvalidParams { .. }));
  }

  #[tokio::test]
  async fn test_verify_host_blocks_until_trusted() {
    let trust = Arc::new(MemoryTrustStore::new());
    let registry = ActionRegistry::with_builtins(trust.clone());

    let outcome = registry
      .execute(request("verify_host", json!(null), fingerprinted_target()))
      .await
      .unwrap();
    let StepOutcome::Blocked(info) = outcome else {
      panic!("expected blocked outcome");
    };
    assert_eq!(info.reason, BlockReason::HostVerificationNeeded);
    assert_eq!(info.fingerprints, vec!["SHA256:abc".to_string()]);

    trust
      .trust(&TrustDecision::new("10.0.0.7", 22, info.fingerprints.clone()))
      .await
      .unwrap();

    let outcome = registry
      .execute(request("verify_host", json!(null), fingerprinted_target()))
      .await
      .unwrap();
    assert!(matches!(outcome, StepOutcome::Success { .. }));
  }

  #[tokio::test]
  async fn test_verify_host_flags_changed_key() {
    let trust = Arc::new(MemoryTrustStore::new());
    trust
      .trust(&TrustDecision::new("10.0.0.7", 22, vec!["SHA256:old".to_string()]))
      .await
      .unwrap();
    let registry = ActionRegistry::with_builtins(trust);

    let outcome = registry
      .execute(request("verify_host", json!(null), fingerprinted_target()))
      .await
      .unwrap();
    let StepOutcome::Blocked(info) = outcome else {
      panic!("expected blocked outcome");
    };
    assert_eq!(info.reason, BlockReason::HostKeyChanged);
  }

  #[tokio::test]
  async fn test_verify_host_without_fingerprints_fails() {
    let registry = ActionRegistry::with_builtins(Arc::new(MemoryTrustStore::new()));
    let outcome = registry
      .execute(request(
        "verify_host",
        json!(null),
        TargetDescriptor::new("10.0.0.7", 22),
      ))
      .await
      .unwrap();
    assert!(matches!(outcome, StepOutcome::Failure { .. }));
  }
}
