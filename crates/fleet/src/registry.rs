//! Authoritative in-memory registry of live instances.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use {
    chrono::{DateTime, Duration, Utc},
    serde::Serialize,
    tracing::debug,
};

use crate::{
    error::{Error, Result},
    quota::QuotaSpec,
};

/// An outbound tunnel exposing one container port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TunnelBinding {
    pub tunnel_id: String,
    pub public_url: String,
    pub container_port: u16,
    /// Host port the tunnel forwards to.
    pub local_port: u16,
    /// Advisory port shown next to the URL; nothing listens on it.
    pub advertised_port: u16,
}

/// A running instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceRecord {
    pub id: String,
    pub owner: String,
    pub created_at: DateTime<Utc>,
    pub quota: QuotaSpec,
    pub tunnels: Vec<TunnelBinding>,
}

impl InstanceRecord {
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        owner: impl Into<String>,
        created_at: DateTime<Utc>,
        quota: QuotaSpec,
    ) -> Self {
        Self {
            id: id.into(),
            owner: owner.into(),
            created_at,
            quota,
            tunnels: Vec::new(),
        }
    }

    /// Whether the record is older than `ttl` at `now`.
    #[must_use]
    pub fn is_expired(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        now - self.created_at > ttl
    }
}

#[derive(Default)]
struct RegistryState {
    records: HashMap<String, InstanceRecord>,
    reserved: HashSet<String>,
}

impl RegistryState {
    fn is_taken(&self, id: &str) -> bool {
        self.records.contains_key(id) || self.reserved.contains(id)
    }
}

/// Instance id → record map. Cheap to clone; clones share state.
///
/// Every operation takes the lock once and never across an `.await`.
#[derive(Clone, Default)]
pub struct InstanceRegistry {
    inner: Arc<Mutex<RegistryState>>,
}

impl InstanceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `id` for an in-flight deploy.
    pub fn reserve(&self, id: &str) -> Result<Reservation> {
        let mut state = self.state();
        if state.is_taken(id) {
            return Err(Error::DuplicateInstance(id.to_string()));
        }
        state.reserved.insert(id.to_string());
        debug!(instance = id, "instance id reserved");
        Ok(Reservation {
            registry: self.clone(),
            id: id.to_string(),
            active: true,
        })
    }

    /// Insert a record. Fails if the id is live or reserved.
    pub fn register(&self, record: InstanceRecord) -> Result<()> {
        let mut state = self.state();
        if state.is_taken(&record.id) {
            return Err(Error::DuplicateInstance(record.id));
        }
        state.records.insert(record.id.clone(), record);
        Ok(())
    }

    pub fn unregister(&self, id: &str) -> Option<InstanceRecord> {
        self.state().records.remove(id)
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<InstanceRecord> {
        self.state().records.get(id).cloned()
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.state().records.contains_key(id)
    }

    /// Records owned by `owner`, sorted by id.
    #[must_use]
    pub fn list_owned_by(&self, owner: &str) -> Vec<InstanceRecord> {
        let mut out: Vec<InstanceRecord> = self
            .state()
            .records
            .values()
            .filter(|r| r.owner == owner)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// All records, sorted by id.
    #[must_use]
    pub fn list_all(&self) -> Vec<InstanceRecord> {
        let mut out: Vec<InstanceRecord> = self.state().records.values().cloned().collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Records with `now - created_at > ttl`, sorted by id.
    #[must_use]
    pub fn list_expired(&self, ttl: Duration, now: DateTime<Utc>) -> Vec<InstanceRecord> {
        let mut out: Vec<InstanceRecord> = self
            .state()
            .records
            .values()
            .filter(|r| r.is_expired(ttl, now))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub fn add_tunnel(&self, id: &str, binding: TunnelBinding) -> Result<()> {
        let mut state = self.state();
        let record = state
            .records
            .get_mut(id)
            .ok_or_else(|| Error::InstanceNotFound(id.to_string()))?;
        record.tunnels.push(binding);
        Ok(())
    }

    pub fn remove_tunnel(&self, id: &str, tunnel_id: &str) -> Option<TunnelBinding> {
        let mut state = self.state();
        let tunnels = &mut state.records.get_mut(id)?.tunnels;
        let pos = tunnels.iter().position(|t| t.tunnel_id == tunnel_id)?;
        Some(tunnels.remove(pos))
    }

    /// Detach every binding of `id`; empty if the instance is unknown.
    pub fn remove_all_tunnels(&self, id: &str) -> Vec<TunnelBinding> {
        self.state()
            .records
            .get_mut(id)
            .map(|r| std::mem::take(&mut r.tunnels))
            .unwrap_or_default()
    }

    /// Live ids, sorted.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.state().records.keys().cloned().collect();
        ids.sort();
        ids
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state().records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state().records.is_empty()
    }

    fn release(&self, id: &str) {
        self.state().reserved.remove(id);
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A claimed id whose container is still being provisioned.
///
/// Dropping it without [`Reservation::commit`] releases the id.
#[must_use = "dropping a reservation releases the id"]
pub struct Reservation {
    registry: InstanceRegistry,
    id: String,
    active: bool,
}

impl Reservation {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Register `record` and release the claim in one step.
    pub fn commit(mut self, record: InstanceRecord) -> Result<()> {
        if record.id != self.id {
            return Err(Error::InvalidCommand(format!(
                "record {} does not match reservation {}",
                record.id, self.id
            )));
        }
        let mut state = self.registry.state();
        state.reserved.remove(&self.id);
        self.active = false;
        if state.records.contains_key(&record.id) {
            return Err(Error::DuplicateInstance(record.id));
        }
        state.records.insert(record.id.clone(), record);
        Ok(())
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.active {
            self.registry.release(&self.id);
            debug!(instance = %self.id, "instance reservation released");
        }
    }
}
