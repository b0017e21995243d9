use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::info;

use crate::{TrustDecision, TrustError, TrustState, TrustStore, classify, host_key};

#[derive(Debug, Default, Serialize, Deserialize)]
struct KnownHosts {
  #[serde(default)]
  hosts: BTreeMap<String, BTreeSet<String>>,
}

/// Filesystem-based trust store.
///
/// Trusted hosts live in a single JSON file:
/// ```text
/// { "hosts": { "10.0.0.5:22": ["SHA256:..."] } }
/// ```
/// Writes go to a sibling temp file that is renamed over the original, so a
/// crash never leaves a half-written file behind.
pub struct FsTrustStore {
  path: PathBuf,
  write_lock: Mutex<()>,
}

impl FsTrustStore {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self {
      path: path.into(),
      write_lock: Mutex::new(()),
    }
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  async fn load(&self) -> Result<KnownHosts, TrustError> {
    match fs::read_to_string(&self.path).await {
      Ok(content) => Ok(serde_json::from_str(&content)?),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(KnownHosts::default()),
      Err(e) => Err(e.into()),
    }
  }

  async fn save(&self, known: &KnownHosts) -> Result<(), TrustError> {
    if let Some(parent) = self.path.parent() {
      fs::create_dir_all(parent).await?;
    }

    let tmp = self.path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_vec_pretty(known)?).await?;
    fs::rename(&tmp, &self.path).await?;
    Ok(())
  }
}

#[async_trait]
impl TrustStore for FsTrustStore {
  async fn check(
    &self,
    host: &str,
    port: u16,
    fingerprint: &str,
  ) -> Result<TrustState, TrustError> {
    let known = self.load().await?;
    Ok(classify(known.hosts.get(&host_key(host, port)), fingerprint))
  }

  async fn trust(&self, decision: &TrustDecision) -> Result<(), TrustError> {
    decision.validate()?;

    let _guard = self.write_lock.lock().await;
    let mut known = self.load().await?;
    known.hosts.insert(
      decision.key(),
      decision.fingerprints.iter().cloned().collect(),
    );
    self.save(&known).await?;

    info!(
      host = %decision.host,
      port = decision.port,
      fingerprints = ?decision.fingerprints,
      "host_trusted"
    );
    Ok(())
  }
}
