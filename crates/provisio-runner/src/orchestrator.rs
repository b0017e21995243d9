//! The query/control surface.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use provisio_config::OrchestratorConfig;
use provisio_registry::StepRegistry;
use provisio_run::{
  BlockInfo, Run, RunError, RunOptions, RunStatus, RunSummary, RunUpdate, StepDef, StepStatus,
  TargetDescriptor,
};
use provisio_store::{Store, StoreError};
use provisio_trust::{TrustDecision, TrustStore};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::error::OrchestratorError;
use crate::events::{NoopNotifier, RunEvent, RunNotifier};
use crate::protocol::{BlockResolver, RejectAction, Resolution, decision_for};
use crate::retention::Reaper;
use crate::worker::{Worker, WorkerContext};

const INTERRUPTED_BY_RESTART: &str = "interrupted by restart";
const HOST_VERIFICATION_REJECTED: &str = "host verification rejected";

/// What [`Orchestrator::recover`] found in the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
  /// Runs left pending or running by a previous process, now failed.
  pub failed: Vec<String>,
  /// Runs left blocked; they resume once resolved.
  pub blocked: Vec<String>,
  /// Finished runs past their retention window, now deleted.
  pub purged: Vec<String>,
}

/// Entry point for starting, observing and steering runs.
///
/// Cloning is cheap; clones share the worker slot. Every operation goes
/// through the store, so it is safe to call from any task.
#[derive(Clone)]
pub struct Orchestrator {
  inner: Arc<Inner>,
}

struct Inner {
  store: Arc<dyn Store>,
  registry: Arc<dyn StepRegistry>,
  trust: Arc<dyn TrustStore>,
  notifier: Arc<dyn RunNotifier>,
  config: OrchestratorConfig,
  reaper: Reaper,
  shutdown: CancellationToken,
  /// The one live worker of this process, if any.
  slot: Mutex<Option<WorkerHandle>>,
}

struct WorkerHandle {
  run_id: String,
  cancel: CancellationToken,
  wake: Arc<Notify>,
  join: JoinHandle<()>,
}

impl WorkerHandle {
  fn is_live_for(&self, run_id: &str) -> bool {
    self.run_id == run_id && !self.join.is_finished()
  }
}

impl Drop for Inner {
  fn drop(&mut self) {
    self.shutdown.cancel();
  }
}

impl Orchestrator {
  /// Create an orchestrator that discards run events.
  pub fn new(
    store: Arc<dyn Store>,
    registry: Arc<dyn StepRegistry>,
    trust: Arc<dyn TrustStore>,
    config: OrchestratorConfig,
  ) -> Self {
    Self::with_notifier(store, registry, trust, config, Arc::new(NoopNotifier))
  }

  /// Create an orchestrator with a custom notifier.
  pub fn with_notifier(
    store: Arc<dyn Store>,
    registry: Arc<dyn StepRegistry>,
    trust: Arc<dyn TrustStore>,
    config: OrchestratorConfig,
    notifier: Arc<dyn RunNotifier>,
  ) -> Self {
    let shutdown = CancellationToken::new();
    let reaper = Reaper::new(store.clone(), config.retention(), shutdown.clone());

    Self {
      inner: Arc::new(Inner {
        store,
        registry,
        trust,
        notifier,
        config,
        reaper,
        shutdown,
        slot: Mutex::new(None),
      }),
    }
  }

  pub fn config(&self) -> &OrchestratorConfig {
    &self.inner.config
  }

  /// Create a run and start executing it in the background.
  ///
  /// Fails with [`OrchestratorError::RunAlreadyActive`] while another run
  /// is pending, running or blocked; that run is left untouched.
  #[instrument(name = "start_run", skip(self, steps, target, options), fields(host = %target.host))]
  pub async fn start(
    &self,
    steps: Vec<StepDef>,
    target: TargetDescriptor,
    options: Option<RunOptions>,
  ) -> Result<String, OrchestratorError> {
    let options = options.unwrap_or_else(|| self.inner.config.default_run_options());
    let run = Run::new(steps, target, options)?;

    self.inner.store.create(&run).await?;
    info!(
      run_id = %run.run_id,
      steps = run.steps.len(),
      step_delay_secs = run.options.step_delay_secs,
      "run_created"
    );

    self.ensure_worker(&run.run_id);
    Ok(run.run_id)
  }

  /// Full snapshot of a run. Without an id, the most recent run (the
  /// active one, if any).
  pub async fn get_state(&self, run_id: Option<&str>) -> Result<Option<Run>, OrchestratorError> {
    let run = match run_id {
      Some(run_id) => self.inner.store.read(run_id).await?,
      None => self.inner.store.read_latest().await?,
    };
    Ok(run)
  }

  /// Lightweight view of the most recent run, for polling.
  pub async fn get_state_summary(&self) -> Result<Option<RunSummary>, OrchestratorError> {
    Ok(self.get_state(None).await?.map(|run| run.summary()))
  }

  /// The pending decision of a run, or `None` if it is not blocked.
  pub async fn get_block_info(&self, run_id: &str) -> Result<Option<BlockInfo>, OrchestratorError> {
    Ok(self.read_existing(run_id).await?.block_info)
  }

  /// Ask a run to stop.
  ///
  /// A blocked run is cancelled right away. A pending or running run is
  /// flagged and stops at the worker's next checkpoint; a step already
  /// dispatched finishes and keeps its outcome.
  #[instrument(name = "cancel_run", skip(self))]
  pub async fn cancel(&self, run_id: &str) -> Result<Run, OrchestratorError> {
    loop {
      let run = self.read_existing(run_id).await?;

      let result = match run.status {
        RunStatus::Blocked => self.cancel_blocked(&run).await,
        RunStatus::Pending | RunStatus::Running => {
          let update = RunUpdate::new()
            .expect(run.status)
            .cancel_requested(true);
          self.inner.store.update(run_id, update).await
        }
        status => {
          return Err(OrchestratorError::NotActive {
            run_id: run_id.to_string(),
            status,
          });
        }
      };

      match result {
        Ok(run) => {
          info!(run_id = %run_id, status = %run.status, "run_cancel_requested");
          self.interrupt_worker(run_id);
          return Ok(run);
        }
        // The run moved under us; look again.
        Err(StoreError::Invalid(RunError::UnexpectedStatus { .. })) => continue,
        Err(e) => return Err(e.into()),
      }
    }
  }

  /// Answer a blocked run with a plain yes/no.
  ///
  /// `accept` records `decision` (or the presented identity when `None`)
  /// in the trust store and retries the blocked step. Rejecting cancels
  /// the run.
  pub async fn resolve_block(
    &self,
    run_id: &str,
    accept: bool,
    decision: Option<TrustDecision>,
  ) -> Result<Run, OrchestratorError> {
    let resolution = if accept {
      Resolution::Accept { decision }
    } else {
      Resolution::reject()
    };
    self.resolve_block_with(run_id, resolution).await
  }

  /// Answer a blocked run.
  #[instrument(name = "resolve_block", skip(self, resolution), fields(accept = resolution.is_accept()))]
  pub async fn resolve_block_with(
    &self,
    run_id: &str,
    resolution: Resolution,
  ) -> Result<Run, OrchestratorError> {
    let run = self.read_existing(run_id).await?;
    let Some(info) = run.block_info.clone().filter(|_| run.status == RunStatus::Blocked) else {
      return Err(OrchestratorError::NotBlocked {
        run_id: run_id.to_string(),
        status: run.status,
      });
    };

    let result = match resolution {
      Resolution::Accept { decision } => {
        let decision = decision_for(&info, decision)?;
        // Commit the decision first; if that fails the run stays blocked.
        self.inner.trust.trust(&decision).await?;
        info!(
          run_id = %run_id,
          host = %decision.host,
          port = decision.port,
          "trust_decision_recorded"
        );

        let update = RunUpdate::new()
          .expect(RunStatus::Blocked)
          .status(RunStatus::Running);
        self.inner.store.update(run_id, update).await
      }
      Resolution::Reject {
        action: RejectAction::Cancel,
      } => self.cancel_blocked(&run).await,
      Resolution::Reject {
        action: RejectAction::Fail,
      } => self.fail_blocked(&run).await,
    };

    let run = match result {
      Ok(run) => run,
      Err(StoreError::Invalid(RunError::UnexpectedStatus { actual, .. })) => {
        return Err(OrchestratorError::NotBlocked {
          run_id: run_id.to_string(),
          status: actual,
        });
      }
      Err(e) => return Err(e.into()),
    };

    if run.status == RunStatus::Running {
      info!(run_id = %run_id, step_index = run.current_step_index, "run_resumed");
      self.inner.notifier.notify(RunEvent::RunResumed {
        run_id: run_id.to_string(),
        step_index: run.current_step_index,
      });
      self.ensure_worker(run_id);
    } else {
      info!(run_id = %run_id, status = %run.status, "block_rejected");
      self.interrupt_worker(run_id);
    }

    Ok(run)
  }

  /// Delete a finished run before its retention window ends.
  #[instrument(name = "clear_run", skip(self))]
  pub async fn clear(&self, run_id: &str) -> Result<(), OrchestratorError> {
    let run = self.read_existing(run_id).await?;
    if run.is_active() {
      return Err(OrchestratorError::StillActive {
        run_id: run_id.to_string(),
      });
    }

    if self.inner.store.clear(run_id).await? {
      info!(run_id = %run_id, "run_cleared");
    }
    Ok(())
  }

  /// Reconcile the store after a process start.
  ///
  /// Runs left pending or running have no worker behind them any more and
  /// are failed rather than silently re-executed. Blocked runs keep their
  /// position and resume when resolved. Expired finished runs are purged.
  #[instrument(name = "recover", skip(self))]
  pub async fn recover(&self) -> Result<RecoveryReport, OrchestratorError> {
    let mut report = RecoveryReport::default();

    for run in self.inner.store.list_unfinished().await? {
      if self.has_live_worker(&run.run_id) {
        continue;
      }

      match run.status {
        RunStatus::Blocked => {
          info!(run_id = %run.run_id, step_index = run.current_step_index, "blocked run kept");
          report.blocked.push(run.run_id);
        }
        status => {
          let now = Utc::now();
          let mut update = RunUpdate::new()
            .expect(status)
            .status(RunStatus::Failed)
            .error_message(INTERRUPTED_BY_RESTART);
          if let Some(index) = run.in_progress_step() {
            let step = &run.steps[index];
            update = update.step(
              index,
              step.failed(INTERRUPTED_BY_RESTART.to_string(), step.tasks.clone(), now),
            );
          }

          match self.inner.store.update(&run.run_id, update).await {
            Ok(run) => {
              warn!(run_id = %run.run_id, "interrupted run marked failed");
              self.finished(&run);
              report.failed.push(run.run_id);
            }
            Err(StoreError::Invalid(e)) => {
              warn!(run_id = %run.run_id, error = %e, "run changed during recovery")
            }
            Err(e) => return Err(e.into()),
          }
        }
      }
    }

    report.purged = self.inner.reaper.purge().await?;
    info!(
      failed = report.failed.len(),
      blocked = report.blocked.len(),
      purged = report.purged.len(),
      "recovery_complete"
    );
    Ok(report)
  }

  /// Delete finished runs past the retention window now, without waiting
  /// for their timers. Returns the purged ids.
  pub async fn purge_expired(&self) -> Result<Vec<String>, OrchestratorError> {
    Ok(self.inner.reaper.purge().await?)
  }

  async fn read_existing(&self, run_id: &str) -> Result<Run, OrchestratorError> {
    self
      .inner
      .store
      .read(run_id)
      .await?
      .ok_or_else(|| OrchestratorError::RunNotFound(run_id.to_string()))
  }

  async fn cancel_blocked(&self, run: &Run) -> Result<Run, StoreError> {
    let mut update = RunUpdate::new()
      .expect(RunStatus::Blocked)
      .status(RunStatus::Cancelled);
    if let Some(index) = run.in_progress_step() {
      let mut step = run.steps[index].clone();
      step.status = StepStatus::Pending;
      update = update.step(index, step);
    }

    let run = self.inner.store.update(&run.run_id, update).await?;
    self.finished(&run);
    Ok(run)
  }

  async fn fail_blocked(&self, run: &Run) -> Result<Run, StoreError> {
    let index = run.current_step_index;
    let step = &run.steps[index];
    let label = step.label.clone();
    let failed = step.failed(
      HOST_VERIFICATION_REJECTED.to_string(),
      step.tasks.clone(),
      Utc::now(),
    );
    let update = RunUpdate::new()
      .expect(RunStatus::Blocked)
      .step(index, failed)
      .status(RunStatus::Failed)
      .error_message(format!("{}: {}", label, HOST_VERIFICATION_REJECTED));

    let run = self.inner.store.update(&run.run_id, update).await?;
    self.inner.notifier.notify(RunEvent::StepFailed {
      run_id: run.run_id.clone(),
      step_index: index,
      error: HOST_VERIFICATION_REJECTED.to_string(),
    });
    self.finished(&run);
    Ok(run)
  }

  fn finished(&self, run: &Run) {
    self.inner.notifier.notify(RunEvent::RunFinished {
      run_id: run.run_id.clone(),
      status: run.status,
    });
    self.inner.reaper.schedule(&run.run_id);
  }

  fn has_live_worker(&self, run_id: &str) -> bool {
    let slot = self.inner.slot.lock().unwrap();
    slot.as_ref().is_some_and(|w| w.is_live_for(run_id))
  }

  /// Wake the run's worker, spawning one if none is live in this process.
  fn ensure_worker(&self, run_id: &str) {
    let mut slot = self.inner.slot.lock().unwrap();
    if let Some(worker) = slot.as_ref()
      && worker.is_live_for(run_id)
    {
      worker.wake.notify_one();
      return;
    }

    let cancel = self.inner.shutdown.child_token();
    let wake = Arc::new(Notify::new());
    let ctx = WorkerContext {
      store: self.inner.store.clone(),
      registry: self.inner.registry.clone(),
      notifier: self.inner.notifier.clone(),
      reaper: self.inner.reaper.clone(),
    };
    let worker = Worker::new(run_id.to_string(), ctx, cancel.clone(), wake.clone());
    let join = tokio::spawn(async move {
      // Failures are logged and recorded on the run by the worker.
      let _ = worker.run().await;
    });

    info!(run_id = %run_id, "worker_spawned");
    // A stale worker can only be parked on a run finished elsewhere.
    if let Some(previous) = slot.take() {
      previous.cancel.cancel();
    }
    *slot = Some(WorkerHandle {
      run_id: run_id.to_string(),
      cancel,
      wake,
      join,
    });
  }

  /// Cut short the worker's inter-step delay and let it observe the store.
  fn interrupt_worker(&self, run_id: &str) {
    let slot = self.inner.slot.lock().unwrap();
    if let Some(worker) = slot.as_ref()
      && worker.is_live_for(run_id)
    {
      worker.cancel.cancel();
      worker.wake.notify_one();
    }
  }
}

#[async_trait]
impl BlockResolver for Orchestrator {
  async fn get_block_info(&self, run_id: &str) -> Result<Option<BlockInfo>, OrchestratorError> {
    Orchestrator::get_block_info(self, run_id).await
  }

  async fn resolve(&self, run_id: &str, resolution: Resolution) -> Result<(), OrchestratorError> {
    self.resolve_block_with(run_id, resolution).await.map(|_| ())
  }
}
