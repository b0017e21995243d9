use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use provisio_run::{Run, RunUpdate};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tracing::debug;

use crate::{Store, StoreError};

const SCHEMA: &[&str] = &[
  r#"
  CREATE TABLE IF NOT EXISTS runs (
    run_id      TEXT PRIMARY KEY NOT NULL,
    status      TEXT NOT NULL,
    active      INTEGER,
    snapshot    TEXT NOT NULL,
    created_ms  INTEGER NOT NULL,
    finished_ms INTEGER
  )
  "#,
  // At most one row may hold the active slot.
  r#"
  CREATE UNIQUE INDEX IF NOT EXISTS runs_single_active
  ON runs (active) WHERE active IS NOT NULL
  "#,
];

/// SQLite-based store implementation.
///
/// Each run is one row holding a JSON snapshot plus the columns needed to
/// enforce the single active slot and to purge expired runs. The pool is
/// limited to one connection so read-modify-write updates never interleave.
pub struct SqliteStore {
  pool: SqlitePool,
}

impl SqliteStore {
  /// Create a new SQLite store with the given connection pool.
  pub fn new(pool: SqlitePool) -> Self {
    Self { pool }
  }

  /// Open (creating if needed) the database at `url` and run migrations.
  pub async fn connect(url: &str) -> Result<Self, StoreError> {
    let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
    let pool = SqlitePoolOptions::new()
      .max_connections(1)
      .connect_with(options)
      .await?;

    let store = Self::new(pool);
    store.migrate().await?;
    Ok(store)
  }

  /// Create the schema if it does not exist yet.
  pub async fn migrate(&self) -> Result<(), StoreError> {
    for statement in SCHEMA {
      sqlx::query(statement).execute(&self.pool).await?;
    }
    Ok(())
  }

  async fn active_run_id(&self) -> Result<Option<String>, StoreError> {
    let row: Option<(String,)> =
      sqlx::query_as("SELECT run_id FROM runs WHERE active IS NOT NULL LIMIT 1")
        .fetch_optional(&self.pool)
        .await?;
    Ok(row.map(|(run_id,)| run_id))
  }
}

fn active_flag(run: &Run) -> Option<i64> {
  run.is_active().then_some(1)
}

fn decode(snapshot: &str) -> Result<Run, StoreError> {
  Ok(serde_json::from_str(snapshot)?)
}

#[async_trait]
impl Store for SqliteStore {
  async fn create(&self, run: &Run) -> Result<(), StoreError> {
    let snapshot = serde_json::to_string(run)?;

    let result = sqlx::query(
      r#"
      INSERT INTO runs (run_id, status, active, snapshot, created_ms, finished_ms)
      VALUES (?, ?, ?, ?, ?, ?)
      "#,
    )
    .bind(&run.run_id)
    .bind(run.status.as_str())
    .bind(active_flag(run))
    .bind(&snapshot)
    .bind(run.created_at.timestamp_millis())
    .bind(run.finished_at.map(|at| at.timestamp_millis()))
    .execute(&self.pool)
    .await;

    match result {
      Ok(_) => Ok(()),
      Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
        match self.active_run_id().await? {
          Some(run_id) => Err(StoreError::ActiveRunExists { run_id }),
          None => Err(StoreError::Database(sqlx::Error::Database(db))),
        }
      }
      Err(e) => Err(e.into()),
    }
  }

  async fn update(&self, run_id: &str, update: RunUpdate) -> Result<Run, StoreError> {
    let mut tx = self.pool.begin().await?;

    let row: Option<(String,)> = sqlx::query_as("SELECT snapshot FROM runs WHERE run_id = ?")
      .bind(run_id)
      .fetch_optional(&mut *tx)
      .await?;
    let (snapshot,) = row.ok_or_else(|| StoreError::NotFound(run_id.to_string()))?;

    let mut run = decode(&snapshot)?;
    update.apply(&mut run, Utc::now())?;

    sqlx::query(
      r#"
      UPDATE runs
      SET status = ?, active = ?, snapshot = ?, finished_ms = ?
      WHERE run_id = ?
      "#,
    )
    .bind(run.status.as_str())
    .bind(active_flag(&run))
    .bind(serde_json::to_string(&run)?)
    .bind(run.finished_at.map(|at| at.timestamp_millis()))
    .bind(run_id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    debug!(run_id = %run_id, status = %run.status, "run_updated");
    Ok(run)
  }

  async fn read(&self, run_id: &str) -> Result<Option<Run>, StoreError> {
    let row: Option<(String,)> = sqlx::query_as("SELECT snapshot FROM runs WHERE run_id = ?")
      .bind(run_id)
      .fetch_optional(&self.pool)
      .await?;
    row.map(|(snapshot,)| decode(&snapshot)).transpose()
  }

  async fn read_active(&self) -> Result<Option<Run>, StoreError> {
    let row: Option<(String,)> =
      sqlx::query_as("SELECT snapshot FROM runs WHERE active IS NOT NULL LIMIT 1")
        .fetch_optional(&self.pool)
        .await?;
    row.map(|(snapshot,)| decode(&snapshot)).transpose()
  }

  async fn read_latest(&self) -> Result<Option<Run>, StoreError> {
    let row: Option<(String,)> = sqlx::query_as(
      "SELECT snapshot FROM runs ORDER BY created_ms DESC, rowid DESC LIMIT 1",
    )
    .fetch_optional(&self.pool)
    .await?;
    row.map(|(snapshot,)| decode(&snapshot)).transpose()
  }

  async fn list_unfinished(&self) -> Result<Vec<Run>, StoreError> {
    let rows: Vec<(String,)> =
      sqlx::query_as("SELECT snapshot FROM runs WHERE active IS NOT NULL ORDER BY created_ms")
        .fetch_all(&self.pool)
        .await?;
    rows.iter().map(|(snapshot,)| decode(snapshot)).collect()
  }

  async fn clear(&self, run_id: &str) -> Result<bool, StoreError> {
    let result = sqlx::query("DELETE FROM runs WHERE run_id = ?")
      .bind(run_id)
      .execute(&self.pool)
      .await?;
    Ok(result.rows_affected() > 0)
  }

  async fn purge_expired(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>, StoreError> {
    let rows: Vec<(String,)> = sqlx::query_as(
      "DELETE FROM runs WHERE finished_ms IS NOT NULL AND finished_ms <= ? RETURNING run_id",
    )
    .bind(cutoff.timestamp_millis())
    .fetch_all(&self.pool)
    .await?;
    Ok(rows.into_iter().map(|(run_id,)| run_id).collect())
  }
}
