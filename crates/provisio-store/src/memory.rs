use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use provisio_run::{Run, RunUpdate};

use crate::{Store, StoreError};

/// In-process store. Nothing survives a restart; used in tests and by
/// callers that embed the orchestrator without a database.
#[derive(Default)]
pub struct MemoryStore {
  runs: RwLock<HashMap<String, Run>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }
}

#[async_trait]
impl Store for MemoryStore {
  async fn create(&self, run: &Run) -> Result<(), StoreError> {
    let mut runs = self.runs.write().unwrap();

    if let Some(active) = runs.values().find(|r| r.is_active()) {
      return Err(StoreError::ActiveRunExists {
        run_id: active.run_id.clone(),
      });
    }

    runs.insert(run.run_id.clone(), run.clone());
    Ok(())
  }

  async fn update(&self, run_id: &str, update: RunUpdate) -> Result<Run, StoreError> {
    let mut runs = self.runs.write().unwrap();
    let run = runs
      .get_mut(run_id)
      .ok_or_else(|| StoreError::NotFound(run_id.to_string()))?;

    update.apply(run, Utc::now())?;
    Ok(run.clone())
  }

  async fn read(&self, run_id: &str) -> Result<Option<Run>, StoreError> {
    Ok(self.runs.read().unwrap().get(run_id).cloned())
  }

  async fn read_active(&self) -> Result<Option<Run>, StoreError> {
    let runs = self.runs.read().unwrap();
    Ok(runs.values().find(|r| r.is_active()).cloned())
  }

  async fn read_latest(&self) -> Result<Option<Run>, StoreError> {
    let runs = self.runs.read().unwrap();
    Ok(runs.values().max_by_key(|r| r.created_at).cloned())
  }

  async fn list_unfinished(&self) -> Result<Vec<Run>, StoreError> {
    let runs = self.runs.read().unwrap();
    Ok(runs.values().filter(|r| r.is_active()).cloned().collect())
  }

  async fn clear(&self, run_id: &str) -> Result<bool, StoreError> {
    Ok(self.runs.write().unwrap().remove(run_id).is_some())
  }

  async fn purge_expired(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>, StoreError> {
    let mut runs = self.runs.write().unwrap();
    let expired: Vec<String> = runs
      .values()
      .filter(|r| r.finished_at.is_some_and(|at| at <= cutoff))
      .map(|r| r.run_id.clone())
      .collect();

    for run_id in &expired {
      runs.remove(run_id);
    }
    Ok(expired)
  }
}
