//! Shared fixtures for the orchestrator tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use provisio_config::OrchestratorConfig;
use provisio_registry::{StepError, StepOutcome, StepRegistry, StepRequest};
use provisio_run::{BlockInfo, Run, StepDef, TargetDescriptor};
use provisio_runner::{ChannelNotifier, Orchestrator, RunEvent};
use provisio_store::{MemoryStore, Store};
use provisio_trust::MemoryTrustStore;
use tokio::sync::{Notify, mpsc};

pub const FINGERPRINT: &str = "SHA256:nThbg6kXUpJWGl7E1IGOCspRomTxdCARLviKw6E5SY8";

/// One scripted answer of the test registry.
pub enum Script {
  Outcome(StepOutcome),
  Error(String),
  Panic(&'static str),
  /// Wait for the gate to be notified, then answer.
  Hold(Arc<Notify>, StepOutcome),
}

/// Step registry answering from a queue per action; an empty queue means
/// success.
#[derive(Default)]
pub struct ScriptedRegistry {
  scripts: Mutex<HashMap<String, VecDeque<Script>>>,
  calls: Mutex<Vec<String>>,
}

impl ScriptedRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn script(self, action: &str, script: Script) -> Self {
    self
      .scripts
      .lock()
      .unwrap()
      .entry(action.to_string())
      .or_default()
      .push_back(script);
    self
  }

  /// Actions invoked so far, in order.
  pub fn calls(&self) -> Vec<String> {
    self.calls.lock().unwrap().clone()
  }
}

#[async_trait]
impl StepRegistry for ScriptedRegistry {
  async fn execute(&self, request: StepRequest) -> Result<StepOutcome, StepError> {
    self.calls.lock().unwrap().push(request.action.clone());
    let script = self
      .scripts
      .lock()
      .unwrap()
      .get_mut(&request.action)
      .and_then(|queue| queue.pop_front());

    match script {
      None => Ok(StepOutcome::success(format!("{} done", request.label))),
      Some(Script::Outcome(outcome)) => Ok(outcome),
      Some(Script::Error(message)) => Err(StepError::Remote(message)),
      Some(Script::Panic(message)) => panic!("{}", message),
      Some(Script::Hold(gate, outcome)) => {
        gate.notified().await;
        Ok(outcome)
      }
    }
  }
}

pub struct Harness {
  pub orchestrator: Orchestrator,
  pub registry: Arc<ScriptedRegistry>,
  pub trust: Arc<MemoryTrustStore>,
  pub store: Arc<dyn Store>,
  pub events: mpsc::UnboundedReceiver<RunEvent>,
}

pub fn harness(registry: ScriptedRegistry) -> Harness {
  harness_with(registry, Arc::new(MemoryStore::new()), OrchestratorConfig::default())
}

pub fn harness_with(
  registry: ScriptedRegistry,
  store: Arc<dyn Store>,
  config: OrchestratorConfig,
) -> Harness {
  let registry = Arc::new(registry);
  let trust = Arc::new(MemoryTrustStore::new());
  let (sender, events) = mpsc::unbounded_channel();

  let orchestrator = Orchestrator::with_notifier(
    store.clone(),
    registry.clone(),
    trust.clone(),
    config,
    Arc::new(ChannelNotifier::new(sender)),
  );

  Harness {
    orchestrator,
    registry,
    trust,
    store,
    events,
  }
}

pub fn target() -> TargetDescriptor {
  let mut target = TargetDescriptor::new("10.20.0.7", 22);
  target.username = Some("ubuntu".to_string());
  target.host_key_fingerprints = vec![FINGERPRINT.to_string()];
  target
}

pub fn steps(actions: &[&str]) -> Vec<StepDef> {
  actions
    .iter()
    .map(|action| StepDef::new(*action, format!("Step {}", action)))
    .collect()
}

pub fn host_verification() -> StepOutcome {
  StepOutcome::Blocked(BlockInfo::host_verification(
    &target(),
    vec![FINGERPRINT.to_string()],
  ))
}

/// Poll until `done` holds for the stored run.
pub async fn wait_for(
  orchestrator: &Orchestrator,
  run_id: &str,
  done: impl Fn(&Run) -> bool,
) -> Run {
  let poll = async {
    loop {
      if let Some(run) = orchestrator.get_state(Some(run_id)).await.unwrap()
        && done(&run)
      {
        return run;
      }
      tokio::time::sleep(Duration::from_millis(5)).await;
    }
  };

  tokio::time::timeout(Duration::from_secs(5), poll)
    .await
    .expect("timed out waiting for run state")
}

/// Collect events up to and including the first `RunFinished`.
pub async fn events_until_finished(events: &mut mpsc::UnboundedReceiver<RunEvent>) -> Vec<RunEvent> {
  let collect = async {
    let mut seen = Vec::new();
    while let Some(event) = events.recv().await {
      let last = matches!(event, RunEvent::RunFinished { .. });
      seen.push(event);
      if last {
        break;
      }
    }
    seen
  };

  tokio::time::timeout(Duration::from_secs(5), collect)
    .await
    .expect("timed out waiting for events")
}
