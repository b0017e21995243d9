//! End-to-end behavior of the orchestrator against a scripted registry.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::*;
use provisio_config::{OrchestratorConfig, RunOptions};
use provisio_registry::StepOutcome;
use provisio_run::{BlockReason, Run, RunStatus, RunUpdate, StepStatus};
use provisio_runner::{BlockResolver, OrchestratorError, RejectAction, Resolution, RunEvent};
use provisio_store::{MemoryStore, Store, StoreError};
use provisio_trust::{TrustDecision, TrustState, TrustStore};
use tokio::sync::Notify;

/// Memory store that accepts a cancel request right before step `step` is
/// marked in progress, the narrowest window a caller can hit.
struct CancelBeforeStart {
  inner: MemoryStore,
  step: usize,
  fired: AtomicBool,
}

impl CancelBeforeStart {
  fn new(step: usize) -> Self {
    Self {
      inner: MemoryStore::new(),
      step,
      fired: AtomicBool::new(false),
    }
  }
}

#[async_trait]
impl Store for CancelBeforeStart {
  async fn create(&self, run: &Run) -> Result<(), StoreError> {
    self.inner.create(run).await
  }

  async fn update(&self, run_id: &str, update: RunUpdate) -> Result<Run, StoreError> {
    let starts_step = update
      .steps
      .iter()
      .any(|(index, step)| *index == self.step && step.status == StepStatus::InProgress);
    if starts_step && !self.fired.swap(true, Ordering::SeqCst) {
      let cancel = RunUpdate::new()
        .expect(RunStatus::Running)
        .cancel_requested(true);
      self.inner.update(run_id, cancel).await?;
    }
    self.inner.update(run_id, update).await
  }

  async fn read(&self, run_id: &str) -> Result<Option<Run>, StoreError> {
    self.inner.read(run_id).await
  }

  async fn read_active(&self) -> Result<Option<Run>, StoreError> {
    self.inner.read_active().await
  }

  async fn read_latest(&self) -> Result<Option<Run>, StoreError> {
    self.inner.read_latest().await
  }

  async fn list_unfinished(&self) -> Result<Vec<Run>, StoreError> {
    self.inner.list_unfinished().await
  }

  async fn clear(&self, run_id: &str) -> Result<bool, StoreError> {
    self.inner.clear(run_id).await
  }

  async fn purge_expired(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>, StoreError> {
    self.inner.purge_expired(cutoff).await
  }
}

#[tokio::test]
async fn test_all_steps_succeed() {
  let mut h = harness(ScriptedRegistry::new());
  let run_id = h
    .orchestrator
    .start(steps(&["check", "sync", "install"]), target(), None)
    .await
    .unwrap();

  let run = wait_for(&h.orchestrator, &run_id, |r| r.status.is_terminal()).await;
  assert_eq!(run.status, RunStatus::Completed);
  assert_eq!(run.current_step_index, 3);
  assert!(run.steps.iter().all(|s| s.status == StepStatus::Completed));
  assert_eq!(run.steps[1].completion_note.as_deref(), Some("Step sync done"));
  assert!(run.error_message.is_none());
  assert!(run.finished_at.is_some());
  assert_eq!(h.registry.calls(), vec!["check", "sync", "install"]);

  let events = events_until_finished(&mut h.events).await;
  assert_eq!(events.first(), Some(&RunEvent::RunStarted { run_id: run_id.clone() }));
  assert_eq!(
    events.last(),
    Some(&RunEvent::RunFinished {
      run_id,
      status: RunStatus::Completed
    })
  );
}

#[tokio::test]
async fn test_blocked_step_resumes_at_the_same_index() {
  let registry = ScriptedRegistry::new().script("b", Script::Outcome(host_verification()));
  let mut h = harness(registry);
  let run_id = h
    .orchestrator
    .start(
      steps(&["a", "b", "c"]),
      target(),
      Some(RunOptions { step_delay_secs: 0 }),
    )
    .await
    .unwrap();

  let blocked = wait_for(&h.orchestrator, &run_id, |r| r.status == RunStatus::Blocked).await;
  let info = blocked.block_info.as_ref().unwrap();
  assert_eq!(info.reason, BlockReason::HostVerificationNeeded);
  assert_eq!(info.host, "10.20.0.7");
  assert_eq!(info.fingerprints, vec![FINGERPRINT.to_string()]);
  assert_eq!(blocked.current_step_index, 1);
  assert_eq!(blocked.steps[0].status, StepStatus::Completed);
  assert_eq!(blocked.steps[1].status, StepStatus::InProgress);
  assert_eq!(blocked.steps[2].status, StepStatus::Pending);

  let summary = h.orchestrator.get_state_summary().await.unwrap().unwrap();
  assert_eq!(summary.run_id, run_id);
  assert_eq!(summary.status, RunStatus::Blocked);
  assert_eq!(summary.total_steps, 3);

  let pending = h.orchestrator.get_block_info(&run_id).await.unwrap();
  assert_eq!(pending.as_ref(), blocked.block_info.as_ref());

  let resumed = h.orchestrator.resolve_block(&run_id, true, None).await.unwrap();
  assert_eq!(resumed.status, RunStatus::Running);
  assert_eq!(resumed.current_step_index, 1);
  assert!(resumed.block_info.is_none());

  let run = wait_for(&h.orchestrator, &run_id, |r| r.status.is_terminal()).await;
  assert_eq!(run.status, RunStatus::Completed);
  assert!(run.steps.iter().all(|s| s.status == StepStatus::Completed));
  assert_eq!(h.registry.calls(), vec!["a", "b", "b", "c"]);

  let state = h.trust.check("10.20.0.7", 22, FINGERPRINT).await.unwrap();
  assert_eq!(state, TrustState::Trusted);

  let events = events_until_finished(&mut h.events).await;
  let id = || run_id.clone();
  assert_eq!(
    events,
    vec![
      RunEvent::RunStarted { run_id: id() },
      RunEvent::StepStarted { run_id: id(), step_index: 0 },
      RunEvent::StepCompleted { run_id: id(), step_index: 0 },
      RunEvent::StepStarted { run_id: id(), step_index: 1 },
      RunEvent::RunBlocked {
        run_id: id(),
        step_index: 1,
        reason: BlockReason::HostVerificationNeeded,
      },
      RunEvent::RunResumed { run_id: id(), step_index: 1 },
      RunEvent::StepStarted { run_id: id(), step_index: 1 },
      RunEvent::StepCompleted { run_id: id(), step_index: 1 },
      RunEvent::StepStarted { run_id: id(), step_index: 2 },
      RunEvent::StepCompleted { run_id: id(), step_index: 2 },
      RunEvent::RunFinished {
        run_id: id(),
        status: RunStatus::Completed,
      },
    ]
  );
}

#[tokio::test]
async fn test_second_start_is_rejected_while_active() {
  let registry = ScriptedRegistry::new().script("b", Script::Outcome(host_verification()));
  let h = harness(registry);
  let first = h
    .orchestrator
    .start(steps(&["a", "b"]), target(), None)
    .await
    .unwrap();
  let before = wait_for(&h.orchestrator, &first, |r| r.status == RunStatus::Blocked).await;

  let err = h
    .orchestrator
    .start(steps(&["x"]), target(), None)
    .await
    .unwrap_err();
  assert!(matches!(err, OrchestratorError::RunAlreadyActive { ref run_id } if *run_id == first));

  let after = h.orchestrator.get_state(Some(&first)).await.unwrap().unwrap();
  assert_eq!(after, before);
  assert_eq!(h.registry.calls(), vec!["a", "b"]);
}

#[tokio::test]
async fn test_start_after_finish_is_allowed() {
  let h = harness(ScriptedRegistry::new());
  let first = h.orchestrator.start(steps(&["a"]), target(), None).await.unwrap();
  wait_for(&h.orchestrator, &first, |r| r.status.is_terminal()).await;

  let second = h.orchestrator.start(steps(&["b"]), target(), None).await.unwrap();
  assert_ne!(first, second);
  wait_for(&h.orchestrator, &second, |r| r.status == RunStatus::Completed).await;

  let latest = h.orchestrator.get_state(None).await.unwrap().unwrap();
  assert_eq!(latest.run_id, second);
}

#[tokio::test]
async fn test_invalid_steps_are_rejected_without_state() {
  let h = harness(ScriptedRegistry::new());

  let err = h.orchestrator.start(Vec::new(), target(), None).await.unwrap_err();
  assert!(matches!(err, OrchestratorError::InvalidRun(_)));

  let err = h
    .orchestrator
    .start(steps(&["a", ""]), target(), None)
    .await
    .unwrap_err();
  assert!(matches!(err, OrchestratorError::InvalidRun(_)));

  assert!(h.orchestrator.get_state(None).await.unwrap().is_none());
  assert!(h.registry.calls().is_empty());
}

#[tokio::test]
async fn test_failed_step_stops_the_run() {
  let registry = ScriptedRegistry::new().script(
    "sync",
    Script::Outcome(StepOutcome::failure("rsync exited with status 23")),
  );
  let mut h = harness(registry);
  let run_id = h
    .orchestrator
    .start(steps(&["check", "sync", "install"]), target(), None)
    .await
    .unwrap();

  let run = wait_for(&h.orchestrator, &run_id, |r| r.status.is_terminal()).await;
  assert_eq!(run.status, RunStatus::Failed);
  assert_eq!(run.current_step_index, 1);
  assert_eq!(run.steps[0].status, StepStatus::Completed);
  assert_eq!(run.steps[1].status, StepStatus::Failed);
  assert_eq!(run.steps[1].error.as_deref(), Some("rsync exited with status 23"));
  assert_eq!(run.steps[2].status, StepStatus::Pending);
  assert_eq!(
    run.error_message.as_deref(),
    Some("Step sync: rsync exited with status 23")
  );
  assert_eq!(h.registry.calls(), vec!["check", "sync"]);

  let (index, _) = run.failed_step().unwrap();
  assert_eq!(index, 1);

  let events = events_until_finished(&mut h.events).await;
  assert!(events.contains(&RunEvent::StepFailed {
    run_id: run_id.clone(),
    step_index: 1,
    error: "rsync exited with status 23".to_string(),
  }));
}

#[tokio::test]
async fn test_registry_error_becomes_step_failure() {
  let registry = ScriptedRegistry::new().script("a", Script::Error("connection refused".to_string()));
  let h = harness(registry);
  let run_id = h.orchestrator.start(steps(&["a", "b"]), target(), None).await.unwrap();

  let run = wait_for(&h.orchestrator, &run_id, |r| r.status.is_terminal()).await;
  assert_eq!(run.status, RunStatus::Failed);
  assert_eq!(run.steps[0].status, StepStatus::Failed);
  assert!(run.steps[0].error.as_deref().unwrap().contains("connection refused"));
  assert_eq!(run.steps[1].status, StepStatus::Pending);
}

#[tokio::test]
async fn test_registry_panic_becomes_step_failure() {
  let registry = ScriptedRegistry::new().script("a", Script::Panic("remote helper crashed"));
  let h = harness(registry);
  let run_id = h.orchestrator.start(steps(&["a", "b"]), target(), None).await.unwrap();

  let run = wait_for(&h.orchestrator, &run_id, |r| r.status.is_terminal()).await;
  assert_eq!(run.status, RunStatus::Failed);
  assert_eq!(
    run.steps[0].error.as_deref(),
    Some("step panicked: remote helper crashed")
  );
  assert_eq!(h.registry.calls(), vec!["a"]);
}

#[tokio::test]
async fn test_cancel_during_step_keeps_its_outcome() {
  let gate = Arc::new(Notify::new());
  let registry = ScriptedRegistry::new().script(
    "sync",
    Script::Hold(gate.clone(), StepOutcome::success("synced")),
  );
  let mut h = harness(registry);
  let run_id = h
    .orchestrator
    .start(steps(&["sync", "install"]), target(), None)
    .await
    .unwrap();

  wait_for(&h.orchestrator, &run_id, |r| {
    r.steps[0].status == StepStatus::InProgress
  })
  .await;

  let flagged = h.orchestrator.cancel(&run_id).await.unwrap();
  assert_eq!(flagged.status, RunStatus::Running);
  assert!(flagged.cancel_requested);

  gate.notify_one();

  let run = wait_for(&h.orchestrator, &run_id, |r| r.status.is_terminal()).await;
  assert_eq!(run.status, RunStatus::Cancelled);
  assert_eq!(run.steps[0].status, StepStatus::Completed);
  assert_eq!(run.steps[0].completion_note.as_deref(), Some("synced"));
  assert_eq!(run.steps[1].status, StepStatus::Pending);
  assert_eq!(run.current_step_index, 1);
  assert_eq!(h.registry.calls(), vec!["sync"]);

  let events = events_until_finished(&mut h.events).await;
  assert_eq!(
    events.last(),
    Some(&RunEvent::RunFinished {
      run_id,
      status: RunStatus::Cancelled
    })
  );
}

#[tokio::test]
async fn test_cancel_cuts_the_step_delay_short() {
  let h = harness(ScriptedRegistry::new());
  let run_id = h
    .orchestrator
    .start(
      steps(&["reboot", "verify"]),
      target(),
      Some(RunOptions { step_delay_secs: 60 }),
    )
    .await
    .unwrap();

  wait_for(&h.orchestrator, &run_id, |r| r.current_step_index == 1).await;
  h.orchestrator.cancel(&run_id).await.unwrap();

  // Far less than the delay.
  let run = wait_for(&h.orchestrator, &run_id, |r| r.status.is_terminal()).await;
  assert_eq!(run.status, RunStatus::Cancelled);
  assert_eq!(h.registry.calls(), vec!["reboot"]);
}

#[tokio::test]
async fn test_cancel_blocked_run() {
  let registry = ScriptedRegistry::new().script("b", Script::Outcome(host_verification()));
  let h = harness(registry);
  let run_id = h.orchestrator.start(steps(&["a", "b"]), target(), None).await.unwrap();
  wait_for(&h.orchestrator, &run_id, |r| r.status == RunStatus::Blocked).await;

  let run = h.orchestrator.cancel(&run_id).await.unwrap();
  assert_eq!(run.status, RunStatus::Cancelled);
  assert!(run.block_info.is_none());
  assert_eq!(run.current_step_index, 1);
  assert_eq!(run.steps[1].status, StepStatus::Pending);
  assert!(h.orchestrator.get_block_info(&run_id).await.unwrap().is_none());

  let err = h.orchestrator.cancel(&run_id).await.unwrap_err();
  assert!(matches!(
    err,
    OrchestratorError::NotActive {
      status: RunStatus::Cancelled,
      ..
    }
  ));
}

#[tokio::test]
async fn test_reject_cancels_by_default() {
  let registry = ScriptedRegistry::new().script("b", Script::Outcome(host_verification()));
  let h = harness(registry);
  let run_id = h.orchestrator.start(steps(&["a", "b"]), target(), None).await.unwrap();
  wait_for(&h.orchestrator, &run_id, |r| r.status == RunStatus::Blocked).await;

  let run = h.orchestrator.resolve_block(&run_id, false, None).await.unwrap();
  assert_eq!(run.status, RunStatus::Cancelled);
  assert_eq!(h.registry.calls(), vec!["a", "b"]);

  let state = h.trust.check("10.20.0.7", 22, FINGERPRINT).await.unwrap();
  assert_eq!(state, TrustState::Unknown);
}

#[tokio::test]
async fn test_reject_can_fail_the_run() {
  let registry = ScriptedRegistry::new().script("b", Script::Outcome(host_verification()));
  let h = harness(registry);
  let run_id = h.orchestrator.start(steps(&["a", "b", "c"]), target(), None).await.unwrap();
  wait_for(&h.orchestrator, &run_id, |r| r.status == RunStatus::Blocked).await;

  let run = h
    .orchestrator
    .resolve_block_with(
      &run_id,
      Resolution::Reject {
        action: RejectAction::Fail,
      },
    )
    .await
    .unwrap();
  assert_eq!(run.status, RunStatus::Failed);
  assert_eq!(run.steps[1].status, StepStatus::Failed);
  assert_eq!(run.steps[1].error.as_deref(), Some("host verification rejected"));
  assert_eq!(run.steps[2].status, StepStatus::Pending);
  assert_eq!(h.registry.calls(), vec!["a", "b"]);
}

#[tokio::test]
async fn test_resolve_requires_a_blocked_run() {
  let gate = Arc::new(Notify::new());
  let registry =
    ScriptedRegistry::new().script("a", Script::Hold(gate.clone(), StepOutcome::success("ok")));
  let h = harness(registry);
  let run_id = h.orchestrator.start(steps(&["a"]), target(), None).await.unwrap();
  wait_for(&h.orchestrator, &run_id, |r| r.status == RunStatus::Running).await;

  let err = h.orchestrator.resolve_block(&run_id, true, None).await.unwrap_err();
  assert!(matches!(err, OrchestratorError::NotBlocked { .. }));

  let err = h.orchestrator.resolve_block("missing", true, None).await.unwrap_err();
  assert!(matches!(err, OrchestratorError::RunNotFound(_)));

  gate.notify_one();
  wait_for(&h.orchestrator, &run_id, |r| r.status == RunStatus::Completed).await;
}

#[tokio::test]
async fn test_decision_for_another_host_keeps_the_block() {
  let registry = ScriptedRegistry::new().script("b", Script::Outcome(host_verification()));
  let h = harness(registry);
  let run_id = h.orchestrator.start(steps(&["a", "b"]), target(), None).await.unwrap();
  wait_for(&h.orchestrator, &run_id, |r| r.status == RunStatus::Blocked).await;

  let decision = TrustDecision::new("10.20.0.8", 22, vec![FINGERPRINT.to_string()]);
  let err = h
    .orchestrator
    .resolve_block(&run_id, true, Some(decision))
    .await
    .unwrap_err();
  assert!(matches!(err, OrchestratorError::DecisionMismatch { .. }));

  let run = h.orchestrator.get_state(Some(&run_id)).await.unwrap().unwrap();
  assert_eq!(run.status, RunStatus::Blocked);
  assert_eq!(
    h.trust.check("10.20.0.8", 22, FINGERPRINT).await.unwrap(),
    TrustState::Unknown
  );
}

#[tokio::test]
async fn test_clear_only_removes_finished_runs() {
  let gate = Arc::new(Notify::new());
  let registry =
    ScriptedRegistry::new().script("a", Script::Hold(gate.clone(), StepOutcome::success("ok")));
  let h = harness(registry);
  let run_id = h.orchestrator.start(steps(&["a"]), target(), None).await.unwrap();

  let err = h.orchestrator.clear(&run_id).await.unwrap_err();
  assert!(matches!(err, OrchestratorError::StillActive { .. }));

  gate.notify_one();
  wait_for(&h.orchestrator, &run_id, |r| r.status.is_terminal()).await;

  h.orchestrator.clear(&run_id).await.unwrap();
  assert!(h.orchestrator.get_state(Some(&run_id)).await.unwrap().is_none());
  assert!(h.orchestrator.get_state_summary().await.unwrap().is_none());

  let err = h.orchestrator.clear(&run_id).await.unwrap_err();
  assert!(matches!(err, OrchestratorError::RunNotFound(_)));
}

#[tokio::test]
async fn test_finished_run_is_purged_after_retention() {
  let config = OrchestratorConfig {
    retention_secs: 1,
    ..OrchestratorConfig::default()
  };
  let h = harness_with(ScriptedRegistry::new(), Arc::new(MemoryStore::new()), config);
  let run_id = h.orchestrator.start(steps(&["a"]), target(), None).await.unwrap();

  wait_for(&h.orchestrator, &run_id, |r| r.status == RunStatus::Completed).await;

  // Still readable inside the grace window.
  tokio::time::sleep(Duration::from_millis(300)).await;
  assert!(h.orchestrator.get_state(Some(&run_id)).await.unwrap().is_some());

  let purged = tokio::time::timeout(Duration::from_secs(5), async {
    loop {
      if h.orchestrator.get_state(Some(&run_id)).await.unwrap().is_none() {
        break;
      }
      tokio::time::sleep(Duration::from_millis(50)).await;
    }
  })
  .await;
  assert!(purged.is_ok(), "run was not purged");
}

#[tokio::test]
async fn test_unknown_run_reads_as_absent() {
  let h = harness(ScriptedRegistry::new());

  assert!(h.orchestrator.get_state(Some("nope")).await.unwrap().is_none());
  assert!(h.orchestrator.get_state(None).await.unwrap().is_none());

  let err = h.orchestrator.get_block_info("nope").await.unwrap_err();
  assert!(matches!(err, OrchestratorError::RunNotFound(_)));
  let err = h.orchestrator.cancel("nope").await.unwrap_err();
  assert!(matches!(err, OrchestratorError::RunNotFound(_)));
}

#[tokio::test]
async fn test_cancel_just_before_a_step_starts_prevents_it() {
  let h = harness_with(
    ScriptedRegistry::new(),
    Arc::new(CancelBeforeStart::new(1)),
    OrchestratorConfig::default(),
  );
  let run_id = h
    .orchestrator
    .start(steps(&["a", "b", "c"]), target(), None)
    .await
    .unwrap();

  let run = wait_for(&h.orchestrator, &run_id, |r| r.status.is_terminal()).await;
  assert_eq!(run.status, RunStatus::Cancelled);
  assert_eq!(run.current_step_index, 1);
  assert_eq!(run.steps[0].status, StepStatus::Completed);
  assert_eq!(run.steps[1].status, StepStatus::Pending);
  assert_eq!(run.steps[2].status, StepStatus::Pending);
  assert_eq!(h.registry.calls(), vec!["a"]);
}

#[tokio::test]
async fn test_block_resolver_resumes_the_blocked_step() {
  let registry = ScriptedRegistry::new().script("b", Script::Outcome(host_verification()));
  let mut h = harness(registry);
  let run_id = h
    .orchestrator
    .start(steps(&["a", "b", "c"]), target(), None)
    .await
    .unwrap();
  let blocked = wait_for(&h.orchestrator, &run_id, |r| r.status == RunStatus::Blocked).await;

  let resolver: &dyn BlockResolver = &h.orchestrator;
  let info = resolver.get_block_info(&run_id).await.unwrap().unwrap();
  assert_eq!(Some(&info), blocked.block_info.as_ref());
  assert_eq!(info.reason, BlockReason::HostVerificationNeeded);
  assert_eq!(info.host, "10.20.0.7");

  resolver.resolve(&run_id, Resolution::accept()).await.unwrap();

  let run = wait_for(&h.orchestrator, &run_id, |r| r.status.is_terminal()).await;
  assert_eq!(run.status, RunStatus::Completed);
  assert_eq!(h.registry.calls(), vec!["a", "b", "b", "c"]);
  assert!(resolver.get_block_info(&run_id).await.unwrap().is_none());

  let events = events_until_finished(&mut h.events).await;
  let resumed = events
    .iter()
    .position(|e| *e == RunEvent::RunResumed { run_id: run_id.clone(), step_index: 1 })
    .unwrap();
  assert_eq!(
    events[resumed + 1],
    RunEvent::StepStarted {
      run_id: run_id.clone(),
      step_index: 1
    }
  );

  let err = resolver.resolve(&run_id, Resolution::reject()).await.unwrap_err();
  assert!(matches!(
    err,
    OrchestratorError::NotBlocked {
      status: RunStatus::Completed,
      ..
    }
  ));
}
