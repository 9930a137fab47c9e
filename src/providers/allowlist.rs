//! Per-site destination allowlist.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::{Error, Result};

use super::traits::AllowlistProvider;

/// Site key → trusted destination hosts, all lower-case.
///
/// Serializes as a plain JSON object `{ "site": ["host", ...] }`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Allowlist {
    sites: BTreeMap<String, Vec<String>>,
}

impl Allowlist {
    /// Empty allowlist.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `host` is trusted for `site`.
    pub fn contains(&self, site: &str, host: &str) -> bool {
        let host = host.to_lowercase();
        self.sites
            .get(&site.to_lowercase())
            .is_some_and(|hosts| hosts.contains(&host))
    }

    /// Add a rule. Returns `false` if it was already present.
    pub fn insert(&mut self, site: &str, host: &str) -> bool {
        let host = host.to_lowercase();
        let hosts = self.sites.entry(site.to_lowercase()).or_default();
        if hosts.contains(&host) {
            return false;
        }
        hosts.push(host);
        true
    }

    /// Remove a rule; a site left with no hosts is dropped. Returns whether anything changed.
    pub fn remove(&mut self, site: &str, host: &str) -> bool {
        let site = site.to_lowercase();
        let host = host.to_lowercase();
        let Some(hosts) = self.sites.get_mut(&site) else {
            return false;
        };
        let before = hosts.len();
        hosts.retain(|h| *h != host);
        let changed = hosts.len() != before;
        if hosts.is_empty() {
            self.sites.remove(&site);
        }
        changed
    }

    /// Hosts trusted for `site`.
    pub fn hosts(&self, site: &str) -> &[String] {
        self.sites
            .get(&site.to_lowercase())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Sites with at least one rule.
    pub fn sites(&self) -> impl Iterator<Item = &str> {
        self.sites.keys().map(String::as_str)
    }

    /// Drop every rule.
    pub fn clear(&mut self) {
        self.sites.clear();
    }

    /// Whether there are no rules.
    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }
}

/// In-memory allowlist store. Clones share state; writes are last-write-wins.
#[derive(Debug, Clone)]
pub struct MemoryAllowlist {
    tx: Arc<watch::Sender<Allowlist>>,
}

impl MemoryAllowlist {
    /// Store holding `list`.
    pub fn new(list: Allowlist) -> Self {
        let (tx, _rx) = watch::channel(list);
        Self { tx: Arc::new(tx) }
    }

    /// Remove every rule.
    pub fn clear(&self) {
        self.tx.send_modify(Allowlist::clear);
    }
}

impl Default for MemoryAllowlist {
    fn default() -> Self {
        Self::new(Allowlist::new())
    }
}

impl AllowlistProvider for MemoryAllowlist {
    fn is_allowlisted(&self, site: &str, host: &str) -> bool {
        self.tx.borrow().contains(site, host)
    }

    fn add(&self, site: &str, host: &str) -> Result<()> {
        if site.trim().is_empty() || host.trim().is_empty() {
            return Err(Error::Collaborator(format!(
                "allow rule needs a site and a host (site '{}', host '{}')",
                site, host
            )));
        }
        let added = self.tx.send_if_modified(|list| list.insert(site, host));
        if added {
            tracing::info!(site, host, "allow rule added");
        }
        Ok(())
    }

    fn remove(&self, site: &str, host: &str) -> Result<()> {
        if self.tx.send_if_modified(|list| list.remove(site, host)) {
            tracing::info!(site, host, "allow rule removed");
        }
        Ok(())
    }

    fn snapshot(&self) -> Allowlist {
        self.tx.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<Allowlist> {
        self.tx.subscribe()
    }
}
