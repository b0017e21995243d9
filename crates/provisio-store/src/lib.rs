//! Provisio Store
//!
//! This crate provides the storage trait and implementations for provisio
//! runs. The store holds the authoritative copy of the single active run and
//! a short trailing history of finished ones.
//!
//! The [`Store`] trait defines operations for:
//! - Creating a run, rejected while another run is active
//! - Applying partial updates atomically per run
//! - Reading a run by id, the active run, or the latest run
//! - Clearing runs, explicitly or once their retention has expired

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use provisio_run::{Run, RunError, RunUpdate};

/// Error type for storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
  /// The requested run was not found.
  #[error("run not found: {0}")]
  NotFound(String),

  /// Another run already occupies the active slot.
  #[error("run {run_id} is already active")]
  ActiveRunExists { run_id: String },

  /// The update would break a run invariant.
  #[error(transparent)]
  Invalid(#[from] RunError),

  /// A stored snapshot could not be (de)serialized.
  #[error("snapshot serialization failed: {0}")]
  Serialization(#[from] serde_json::Error),

  /// A database error occurred.
  #[error("database error: {0}")]
  Database(#[from] sqlx::Error),
}

/// Storage for runs.
///
/// Every operation is atomic per run id. Only one run may be active
/// (pending, running or blocked) at a time; `create` enforces this.
#[async_trait]
pub trait Store: Send + Sync {
  /// Insert a new run, failing with [`StoreError::ActiveRunExists`] if an
  /// active run is already stored.
  async fn create(&self, run: &Run) -> Result<(), StoreError>;

  /// Apply a partial update and return the run as written.
  async fn update(&self, run_id: &str, update: RunUpdate) -> Result<Run, StoreError>;

  /// Get a run by id.
  async fn read(&self, run_id: &str) -> Result<Option<Run>, StoreError>;

  /// Get the active run, if any.
  async fn read_active(&self) -> Result<Option<Run>, StoreError>;

  /// Get the most recently created run, active or not.
  async fn read_latest(&self) -> Result<Option<Run>, StoreError>;

  /// List runs that are still pending, running or blocked.
  async fn list_unfinished(&self) -> Result<Vec<Run>, StoreError>;

  /// Delete a run. Returns whether a run was removed.
  async fn clear(&self, run_id: &str) -> Result<bool, StoreError>;

  /// Delete finished runs whose `finished_at` is at or before `cutoff`.
  /// Returns the ids that were removed.
  async fn purge_expired(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>, StoreError>;
}
