use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;

use crate::{TrustDecision, TrustError, TrustState, TrustStore, classify, host_key};

/// In-memory trust store.
#[derive(Default)]
pub struct MemoryTrustStore {
  hosts: RwLock<HashMap<String, BTreeSet<String>>>,
}

impl MemoryTrustStore {
  pub fn new() -> Self {
    Self::default()
  }
}

#[async_trait]
impl TrustStore for MemoryTrustStore {
  async fn check(
    &self,
    host: &str,
    port: u16,
    fingerprint: &str,
  ) -> Result<TrustState, TrustError> {
    let hosts = self.hosts.read().unwrap();
    Ok(classify(hosts.get(&host_key(host, port)), fingerprint))
  }

  async fn trust(&self, decision: &TrustDecision) -> Result<(), TrustError> {
    decision.validate()?;
    let mut hosts = self.hosts.write().unwrap();
    hosts.insert(
      decision.key(),
      decision.fingerprints.iter().cloned().collect(),
    );
    Ok(())
  }
}
