use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Per-run options supplied with `start`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOptions {
  /// Pause after each successful step, e.g. to let a rebooted host settle.
  #[serde(default)]
  pub step_delay_secs: u64,
}

impl RunOptions {
  pub fn step_delay(&self) -> Duration {
    Duration::from_secs(self.step_delay_secs)
  }
}

/// Orchestrator settings, usually read from `<data-dir>/config.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
  /// How long a terminal run stays readable before it is purged.
  pub retention_secs: u64,

  /// Step delay used when the caller does not supply one.
  pub default_step_delay_secs: u64,

  /// Interval clients should poll `get_state` at while a run is live.
  pub poll_interval_ms: u64,

  /// SQLite connection string. Defaults to `runs.db` in the data directory.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub database_url: Option<String>,
}

impl Default for OrchestratorConfig {
  fn default() -> Self {
    Self {
      retention_secs: 30,
      default_step_delay_secs: 0,
      poll_interval_ms: 1500,
      database_url: None,
    }
  }
}

impl OrchestratorConfig {
  pub fn retention(&self) -> Duration {
    Duration::from_secs(self.retention_secs)
  }

  pub fn poll_interval(&self) -> Duration {
    Duration::from_millis(self.poll_interval_ms)
  }

  pub fn default_run_options(&self) -> RunOptions {
    RunOptions {
      step_delay_secs: self.default_step_delay_secs,
    }
  }
}
