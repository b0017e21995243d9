//! Retention of finished runs.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use provisio_store::Store;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Purges finished runs once their grace window has passed.
///
/// Each finished run gets a one-shot timer. Timers purge everything that has
/// expired by the time they fire, so a run whose timer was lost (process
/// restart) is picked up by the next timer or by restart recovery.
#[derive(Clone)]
pub(crate) struct Reaper {
  store: Arc<dyn Store>,
  retention: Duration,
  shutdown: CancellationToken,
}

impl Reaper {
  pub fn new(store: Arc<dyn Store>, retention: Duration, shutdown: CancellationToken) -> Self {
    Self {
      store,
      retention,
      shutdown,
    }
  }

  /// Arm a timer for a run that just reached a terminal status.
  pub fn schedule(&self, run_id: &str) {
    let reaper = self.clone();
    let run_id = run_id.to_string();

    tokio::spawn(async move {
      tokio::select! {
        _ = tokio::time::sleep(reaper.retention) => {}
        _ = reaper.shutdown.cancelled() => return,
      }

      match reaper.purge().await {
        Ok(purged) if purged.iter().any(|id| *id == run_id) => {}
        Ok(_) => info!(run_id = %run_id, "run already gone at retention deadline"),
        Err(e) => warn!(run_id = %run_id, error = %e, "retention purge failed"),
      }
    });
  }

  /// Delete every finished run older than the retention window.
  pub async fn purge(&self) -> Result<Vec<String>, provisio_store::StoreError> {
    let retention = chrono::Duration::from_std(self.retention).unwrap_or(chrono::Duration::MAX);
    let cutoff = Utc::now()
      .checked_sub_signed(retention)
      .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);

    let purged = self.store.purge_expired(cutoff).await?;
    for run_id in &purged {
      info!(run_id = %run_id, "run_purged");
    }
    Ok(purged)
  }
}
