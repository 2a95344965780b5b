//! Registration binding store
//!
//! Maps an AOR to its contact bindings. Each binding remembers the
//! transport-layer source address of the REGISTER that installed it; that
//! address supersedes the contact URI host for all downstream routing, which
//! is what makes the proxy work for endpoints behind NAT.
//!
//! Policy: one device per AOR. A REGISTER carrying a live binding purges
//! every binding whose source address differs from the registering one.

use crate::types::epoch_secs;
use std::collections::HashMap;
use std::net::SocketAddr;

/// A single contact binding
#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    /// Contact URI after the NAT-safe host rewrite
    pub contact: String,
    /// Absolute expiry, seconds since the epoch
    pub expires_at: u64,
    /// Transport-layer peer that sent the REGISTER
    pub source: SocketAddr,
}

impl Binding {
    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_at <= now
    }

    /// Remaining lifetime in seconds
    pub fn remaining(&self, now: u64) -> u64 {
        self.expires_at.saturating_sub(now)
    }
}

/// AOR -> bindings
#[derive(Debug, Default)]
pub struct RegistrationStore {
    bindings: HashMap<String, Vec<Binding>>,
}

impl RegistrationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install or refresh a binding; contact URIs are unique within an AOR
    pub fn upsert(&mut self, aor: &str, contact: &str, expires_secs: u64, source: SocketAddr) {
        let expires_at = epoch_secs() + expires_secs;
        let entry = self.bindings.entry(aor.to_string()).or_default();
        if let Some(existing) = entry.iter_mut().find(|b| b.contact == contact) {
            existing.expires_at = expires_at;
            existing.source = source;
        } else {
            entry.push(Binding {
                contact: contact.to_string(),
                expires_at,
                source,
            });
        }
    }

    /// De-register one contact; true when something was removed
    pub fn remove_contact(&mut self, aor: &str, contact: &str) -> bool {
        let mut removed = false;
        if let Some(entry) = self.bindings.get_mut(aor) {
            let before = entry.len();
            entry.retain(|b| b.contact != contact);
            removed = entry.len() != before;
            if entry.is_empty() {
                self.bindings.remove(aor);
            }
        }
        removed
    }

    /// Drop expired bindings for one AOR
    pub fn purge_expired(&mut self, aor: &str) {
        let now = epoch_secs();
        if let Some(entry) = self.bindings.get_mut(aor) {
            entry.retain(|b| !b.is_expired(now));
            if entry.is_empty() {
                self.bindings.remove(aor);
            }
        }
    }

    /// Drop expired bindings everywhere; returns the purged AORs
    pub fn purge_expired_all(&mut self) -> Vec<String> {
        let now = epoch_secs();
        let mut purged = Vec::new();
        for (aor, entry) in self.bindings.iter_mut() {
            let before = entry.len();
            entry.retain(|b| !b.is_expired(now));
            if entry.len() != before {
                purged.push(aor.clone());
            }
        }
        self.bindings.retain(|_, entry| !entry.is_empty());
        purged
    }

    /// Single-device policy: remove bindings registered from another source
    pub fn purge_foreign_sources(&mut self, aor: &str, source: SocketAddr) {
        if let Some(entry) = self.bindings.get_mut(aor) {
            entry.retain(|b| b.source == source);
            if entry.is_empty() {
                self.bindings.remove(aor);
            }
        }
    }

    /// Unexpired bindings for an AOR, freshest expiry first
    pub fn active_bindings(&self, aor: &str) -> Vec<Binding> {
        let now = epoch_secs();
        let mut out: Vec<Binding> = self
            .bindings
            .get(aor)
            .map(|entry| {
                entry
                    .iter()
                    .filter(|b| !b.is_expired(now))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        out.sort_by(|a, b| b.expires_at.cmp(&a.expires_at));
        out
    }

    pub fn has_active_binding(&self, aor: &str) -> bool {
        !self.active_bindings(aor).is_empty()
    }

    /// The real source address recorded for a contact matching `addr`
    ///
    /// Used to prefer the NAT-observed peer over whatever a Via or Contact
    /// claims when routing responses.
    pub fn source_for(&self, addr: SocketAddr) -> Option<SocketAddr> {
        let now = epoch_secs();
        for entry in self.bindings.values() {
            for binding in entry {
                if binding.is_expired(now) {
                    continue;
                }
                let (host, port) = crate::types::host_port_from_uri(&binding.contact);
                if host.parse::<std::net::IpAddr>().ok() == Some(addr.ip()) && port == addr.port()
                {
                    return Some(binding.source);
                }
            }
        }
        None
    }

    /// Read-only snapshot for external observers (admin surfaces, keepalive)
    pub fn snapshot(&self) -> Vec<(String, Vec<Binding>)> {
        self.bindings
            .iter()
            .map(|(aor, entry)| (aor.clone(), entry.clone()))
            .collect()
    }

    pub fn aor_count(&self) -> usize {
        self.bindings.len()
    }
}
