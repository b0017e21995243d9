//! The per-run worker.
//!
//! A [`Worker`] walks one run's steps in order on its own tokio task. It
//! re-reads the run from the store at every checkpoint, so control
//! operations only ever have to write the store and wake it.

use std::sync::Arc;

use chrono::Utc;
use provisio_registry::{Progress, StepOutcome, StepRegistry, StepRequest};
use provisio_run::{Run, RunStatus, RunUpdate, Step, StepStatus, Task};
use provisio_store::{Store, StoreError};
use tokio::sync::Notify;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::events::{RunEvent, RunNotifier};
use crate::retention::Reaper;

/// Shared handles a worker needs.
#[derive(Clone)]
pub(crate) struct WorkerContext {
  pub store: Arc<dyn Store>,
  pub registry: Arc<dyn StepRegistry>,
  pub notifier: Arc<dyn RunNotifier>,
  pub reaper: Reaper,
}

/// Drives one run to a terminal status, or parks on a block.
pub(crate) struct Worker {
  run_id: String,
  ctx: WorkerContext,
  /// Interrupts the inter-step delay and a parked block.
  cancel: CancellationToken,
  /// Wakes a parked worker after the stored state changed.
  wake: Arc<Notify>,
}

impl Worker {
  pub fn new(
    run_id: String,
    ctx: WorkerContext,
    cancel: CancellationToken,
    wake: Arc<Notify>,
  ) -> Self {
    Self {
      run_id,
      ctx,
      cancel,
      wake,
    }
  }

  /// Run until the run is finished (or gone). Returns the last status seen.
  #[instrument(name = "run_worker", skip(self), fields(run_id = %self.run_id))]
  pub async fn run(self) -> Result<Option<RunStatus>, StoreError> {
    let result = self.run_loop().await;

    if let Err(e) = &result {
      error!(run_id = %self.run_id, error = %e, "worker stopped on store error");
      // Best effort: the run stays readable as failed instead of running
      // with nobody behind it.
      let update = RunUpdate::new()
        .status(RunStatus::Failed)
        .error_message(format!("state store error: {}", e));
      if let Ok(run) = self.ctx.store.update(&self.run_id, update).await {
        self.finished(&run);
      }
    }

    result
  }

  async fn run_loop(&self) -> Result<Option<RunStatus>, StoreError> {
    loop {
      let Some(run) = self.ctx.store.read(&self.run_id).await? else {
        warn!(run_id = %self.run_id, "run disappeared from the store");
        return Ok(None);
      };

      match run.status {
        RunStatus::Pending => {
          let update = RunUpdate::new()
            .expect(RunStatus::Pending)
            .status(RunStatus::Running);
          match self.ctx.store.update(&self.run_id, update).await {
            Ok(_) => {}
            // Lost a race with a control operation; re-read.
            Err(StoreError::Invalid(_)) => continue,
            Err(e) => return Err(e),
          }
          info!(run_id = %self.run_id, steps = run.steps.len(), "run_started");
          self.notify(RunEvent::RunStarted {
            run_id: self.run_id.clone(),
          });
          continue;
        }
        RunStatus::Blocked => {
          if run.cancel_requested {
            match self.cancel_active(&run, RunStatus::Blocked).await {
              Ok(run) => return Ok(Some(run.status)),
              Err(StoreError::Invalid(_)) => continue,
              Err(e) => return Err(e),
            }
          }
          // Shutdown: leave the run blocked for a later worker.
          if self.cancel.is_cancelled() {
            return Ok(Some(RunStatus::Blocked));
          }
          self.park().await;
          continue;
        }
        RunStatus::Running => {}
        status => return Ok(Some(status)),
      }

      // Checkpoint: nothing left, or asked to stop.
      if run.current_step_index >= run.steps.len() {
        let run = self
          .ctx
          .store
          .update(&self.run_id, RunUpdate::new().status(RunStatus::Completed))
          .await?;
        info!(run_id = %self.run_id, "run_completed");
        self.finished(&run);
        return Ok(Some(run.status));
      }
      if run.cancel_requested {
        match self.cancel_active(&run, RunStatus::Running).await {
          Ok(run) => return Ok(Some(run.status)),
          Err(StoreError::Invalid(_)) => continue,
          Err(e) => return Err(e),
        }
      }

      let blocked = self.execute_step(&run).await?;
      if blocked {
        // Park before re-reading so a resume is always observed after it
        // was announced.
        self.park().await;
      }
    }
  }

  /// Dispatch the current step and persist its outcome. Returns whether the
  /// run is now blocked.
  #[instrument(
    name = "run_step",
    skip(self, run),
    fields(run_id = %self.run_id, step_index = run.current_step_index)
  )]
  async fn execute_step(&self, run: &Run) -> Result<bool, StoreError> {
    let index = run.current_step_index;
    let step = &run.steps[index];

    // Starting a step is the last point a cancel can still prevent it.
    let started = step.started(Utc::now());
    let update = RunUpdate::new()
      .expect(RunStatus::Running)
      .expect_not_cancelled()
      .step(index, started.clone());
    match self.ctx.store.update(&self.run_id, update).await {
      Ok(_) => {}
      // Cancelled (or otherwise moved) since the checkpoint; re-read.
      Err(StoreError::Invalid(_)) => return Ok(false),
      Err(e) => return Err(e),
    }
    info!(
      run_id = %self.run_id,
      step_index = index,
      action = %step.action,
      label = %step.label,
      "step_started"
    );
    self.notify(RunEvent::StepStarted {
      run_id: self.run_id.clone(),
      step_index: index,
    });

    let request = StepRequest {
      run_id: self.run_id.clone(),
      step_index: index,
      action: step.action.clone(),
      label: step.label.clone(),
      params: step.params.clone(),
      target: run.target.clone(),
      progress: Progress::default(),
    };
    let outcome = self.dispatch(request, &started).await;
    let now = Utc::now();

    match outcome {
      StepOutcome::Success { tasks, note } => {
        let done = started.completed(tasks, note, now);
        self
          .ctx
          .store
          .update(
            &self.run_id,
            RunUpdate::new().step(index, done).current_step_index(index + 1),
          )
          .await?;
        info!(run_id = %self.run_id, step_index = index, "step_completed");
        self.notify(RunEvent::StepCompleted {
          run_id: self.run_id.clone(),
          step_index: index,
        });

        if index + 1 < run.steps.len() {
          self.step_delay(run).await;
        }
      }
      StepOutcome::Failure { error, tasks } => {
        let failed = started.failed(error.clone(), tasks, now);
        let run = self
          .ctx
          .store
          .update(
            &self.run_id,
            RunUpdate::new()
              .step(index, failed)
              .status(RunStatus::Failed)
              .error_message(format!("{}: {}", step.label, error)),
          )
          .await?;
        error!(run_id = %self.run_id, step_index = index, error = %error, "step_failed");
        self.notify(RunEvent::StepFailed {
          run_id: self.run_id.clone(),
          step_index: index,
          error,
        });
        self.finished(&run);
      }
      StepOutcome::Blocked(info) => {
        let reason = info.reason;
        self
          .ctx
          .store
          .update(&self.run_id, RunUpdate::new().block(info))
          .await?;
        info!(
          run_id = %self.run_id,
          step_index = index,
          reason = reason.as_str(),
          "run_blocked"
        );
        self.notify(RunEvent::RunBlocked {
          run_id: self.run_id.clone(),
          step_index: index,
          reason,
        });
        return Ok(true);
      }
    }

    Ok(false)
  }

  /// Invoke the step registry on its own task so that neither an error nor
  /// a panic inside an action can escape the worker. Task progress reported
  /// meanwhile is written to the in-progress step.
  async fn dispatch(&self, mut request: StepRequest, started: &Step) -> StepOutcome {
    let index = request.step_index;
    let (progress, mut reports) = Progress::channel();
    request.progress = progress;

    let registry = self.ctx.registry.clone();
    let mut handle = tokio::spawn(async move { registry.execute(request).await });

    let joined = loop {
      tokio::select! {
        joined = &mut handle => break joined,
        Some(tasks) = reports.recv() => self.report_progress(index, started, tasks).await,
      }
    };

    match joined {
      Ok(Ok(outcome)) => outcome,
      Ok(Err(e)) => StepOutcome::failure(e.to_string()),
      Err(e) => StepOutcome::failure(join_error_message(e)),
    }
  }

  async fn report_progress(&self, index: usize, started: &Step, tasks: Vec<Task>) {
    let step = Step {
      tasks,
      ..started.clone()
    };
    let update = RunUpdate::new().expect(RunStatus::Running).step(index, step);
    if let Err(e) = self.ctx.store.update(&self.run_id, update).await {
      warn!(run_id = %self.run_id, step_index = index, error = %e, "progress update dropped");
    }
  }

  async fn step_delay(&self, run: &Run) {
    let delay = run.options.step_delay();
    if delay.is_zero() {
      return;
    }

    info!(run_id = %self.run_id, delay_secs = delay.as_secs(), "step delay");
    tokio::select! {
      _ = tokio::time::sleep(delay) => {}
      _ = self.cancel.cancelled() => {}
    }
  }

  /// Wait for the stored state to change while blocked. No polling.
  async fn park(&self) {
    info!(run_id = %self.run_id, "worker parked on block");
    tokio::select! {
      _ = self.wake.notified() => {}
      _ = self.cancel.cancelled() => {}
    }
  }

  /// Cancel at a checkpoint. An interrupted step goes back to pending.
  async fn cancel_active(&self, run: &Run, expected: RunStatus) -> Result<Run, StoreError> {
    let mut update = RunUpdate::new()
      .expect(expected)
      .status(RunStatus::Cancelled);
    if let Some(index) = run.in_progress_step() {
      let mut step = run.steps[index].clone();
      step.status = StepStatus::Pending;
      update = update.step(index, step);
    }

    let run = self.ctx.store.update(&self.run_id, update).await?;
    info!(run_id = %self.run_id, step_index = run.current_step_index, "run_cancelled");
    self.finished(&run);
    Ok(run)
  }

  fn finished(&self, run: &Run) {
    self.notify(RunEvent::RunFinished {
      run_id: run.run_id.clone(),
      status: run.status,
    });
    self.ctx.reaper.schedule(&run.run_id);
  }

  fn notify(&self, event: RunEvent) {
    self.ctx.notifier.notify(event);
  }
}

fn join_error_message(error: JoinError) -> String {
  if !error.is_panic() {
    return "step task was aborted".to_string();
  }

  let payload = error.into_panic();
  if let Some(message) = payload.downcast_ref::<&str>() {
    format!("step panicked: {}", message)
  } else if let Some(message) = payload.downcast_ref::<String>() {
    format!("step panicked: {}", message)
  } else {
    "step panicked".to_string()
  }
}
