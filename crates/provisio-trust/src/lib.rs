//! Provisio Trust
//!
//! Trust material for remote hosts. Step actions consult a [`TrustStore`]
//! before talking to a host; when a presented host key is unknown the run
//! blocks, and a human-affirmed [`TrustDecision`] is recorded here before
//! the run resumes.

mod fs;
mod memory;

pub use fs::FsTrustStore;
pub use memory::MemoryTrustStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Error type for trust store operations.
#[derive(Debug, thiserror::Error)]
pub enum TrustError {
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  #[error("invalid known hosts file: {0}")]
  Parse(#[from] serde_json::Error),

  #[error("invalid trust decision: {0}")]
  InvalidDecision(String),
}

/// Result of checking a presented fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustState {
  /// The fingerprint is trusted for this host.
  Trusted,
  /// Nothing is known about this host.
  Unknown,
  /// The host is known, but under different fingerprints.
  Mismatch,
}

/// A human-affirmed decision to trust a host's keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustDecision {
  pub host: String,
  pub port: u16,
  pub fingerprints: Vec<String>,
}

impl TrustDecision {
  pub fn new(host: impl Into<String>, port: u16, fingerprints: Vec<String>) -> Self {
    Self {
      host: host.into(),
      port,
      fingerprints,
    }
  }

  pub(crate) fn key(&self) -> String {
    host_key(&self.host, self.port)
  }

  pub(crate) fn validate(&self) -> Result<(), TrustError> {
    if self.host.trim().is_empty() {
      return Err(TrustError::InvalidDecision("host is empty".to_string()));
    }
    if self.fingerprints.is_empty() || self.fingerprints.iter().any(|f| f.trim().is_empty()) {
      return Err(TrustError::InvalidDecision(
        "at least one non-empty fingerprint is required".to_string(),
      ));
    }
    Ok(())
  }
}

pub(crate) fn host_key(host: &str, port: u16) -> String {
  format!("{}:{}", host, port)
}

pub(crate) fn classify<'a>(
  known: Option<impl IntoIterator<Item = &'a String>>,
  fingerprint: &str,
) -> TrustState {
  match known {
    None => TrustState::Unknown,
    Some(known) => {
      if known.into_iter().any(|k| k == fingerprint) {
        TrustState::Trusted
      } else {
        TrustState::Mismatch
      }
    }
  }
}

/// Storage for trusted host identities.
#[async_trait]
pub trait TrustStore: Send + Sync {
  /// Check a fingerprint presented by `host:port`.
  async fn check(&self, host: &str, port: u16, fingerprint: &str)
  -> Result<TrustState, TrustError>;

  /// Record a decision. Replaces whatever was trusted for that host before.
  async fn trust(&self, decision: &TrustDecision) -> Result<(), TrustError>;
}
