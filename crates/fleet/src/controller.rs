//! Instance lifecycle: deploy, reconcile, adopt, reclaim and node stats.
//!
//! The controller is the only component that talks to the container
//! runtime on behalf of users. Registry state is authoritative for
//! reclamation and tunnels; the runtime listing is consulted only by the
//! reconciliation and adoption passes.

use std::{collections::HashSet, future::Future, sync::Arc, time::Duration};

use {
    chrono::{DateTime, Utc},
    serde::Serialize,
    tokio::task::JoinHandle,
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use crate::{
    access::AccessPolicy,
    error::{Error, Result},
    host::HostMetrics,
    launch::{Credentials, LaunchTemplate},
    quota::{PromoCode, QuotaCatalog, QuotaSpec},
    registry::{InstanceRecord, InstanceRegistry, TunnelBinding},
    runtime::{ContainerHandle, ContainerRuntime, NameConflict},
    tunnel::{TunnelBroker, TunnelProvider, TunnelSettings},
};

/// Timeouts and lifecycle policy.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// Upper bound for any single runtime call.
    pub call_timeout: Duration,
    /// Instance time-to-live.
    pub ttl: chrono::Duration,
    /// Pause between maintenance passes.
    pub reclaim_interval: Duration,
    /// How many instances [`NodeStats::top`] keeps.
    pub top_instances: usize,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self::from(&deskfarm_config::DeskfarmConfig::default())
    }
}

impl From<&deskfarm_config::DeskfarmConfig> for ControllerSettings {
    fn from(config: &deskfarm_config::DeskfarmConfig) -> Self {
        let hours = i64::try_from(config.lifecycle.ttl_hours).unwrap_or(i64::MAX);
        Self {
            call_timeout: Duration::from_secs(config.runtime.call_timeout_secs),
            ttl: chrono::Duration::try_hours(hours).unwrap_or(chrono::Duration::MAX),
            reclaim_interval: Duration::from_secs(config.lifecycle.reclaim_interval_secs),
            top_instances: config.lifecycle.top_instances,
        }
    }
}

/// The external collaborators a controller drives.
#[derive(Clone)]
pub struct Collaborators {
    pub runtime: Arc<dyn ContainerRuntime>,
    pub tunnels: Arc<dyn TunnelProvider>,
    pub metrics: Arc<dyn HostMetrics>,
}

/// Per-instance resource usage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceUsage {
    pub id: String,
    pub owner: String,
    pub cpu_percent: f64,
    pub memory_percent: f64,
}

/// Host utilisation plus the busiest instances.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeStats {
    pub cpu_percent: f64,
    pub ram_percent: f64,
    /// Sorted by CPU descending, ties by id.
    pub top: Vec<InstanceUsage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReclaimFailure {
    pub id: String,
    pub reason: String,
}

/// Outcome of one reclamation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReclaimReport {
    pub removed: Vec<String>,
    pub failures: Vec<ReclaimFailure>,
}

impl ReclaimReport {
    #[must_use]
    pub fn count(&self) -> usize {
        self.removed.len()
    }
}

/// Container names from one runtime listing, split by state.
#[derive(Default)]
struct Liveness {
    running: HashSet<String>,
    stopped: HashSet<String>,
}

/// Orchestrates instance lifecycles against the runtime.
pub struct LifecycleController {
    access: AccessPolicy,
    catalog: QuotaCatalog,
    template: LaunchTemplate,
    registry: InstanceRegistry,
    runtime: Arc<dyn ContainerRuntime>,
    metrics: Arc<dyn HostMetrics>,
    tunnels: TunnelBroker,
    settings: ControllerSettings,
}

impl LifecycleController {
    /// Wire a controller from config and its collaborators.
    pub fn new(
        config: &deskfarm_config::DeskfarmConfig,
        collaborators: Collaborators,
    ) -> Result<Self> {
        let registry = InstanceRegistry::new();
        let tunnels = TunnelBroker::new(
            registry.clone(),
            Arc::clone(&collaborators.runtime),
            collaborators.tunnels,
            TunnelSettings::from(&config.tunnel)
                .with_lookup_timeout(Duration::from_secs(config.runtime.call_timeout_secs)),
        );
        let access = AccessPolicy::from_config(&config.access);
        if access.is_empty() {
            warn!("allow-list is empty, privileged commands are disabled");
        }
        Ok(Self {
            access,
            catalog: QuotaCatalog::from_config(config)?,
            template: LaunchTemplate::from(&config.runtime),
            registry,
            runtime: collaborators.runtime,
            metrics: collaborators.metrics,
            tunnels,
            settings: ControllerSettings::from(config),
        })
    }

    /// Replace the timeouts and lifecycle policy.
    #[must_use]
    pub fn with_settings(mut self, settings: ControllerSettings) -> Self {
        self.settings = settings;
        self
    }

    #[must_use]
    pub fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    #[must_use]
    pub fn access(&self) -> &AccessPolicy {
        &self.access
    }

    #[must_use]
    pub fn catalog(&self) -> &QuotaCatalog {
        &self.catalog
    }

    #[must_use]
    pub fn registry(&self) -> &InstanceRegistry {
        &self.registry
    }

    #[must_use]
    pub fn runtime_backend(&self) -> &'static str {
        self.runtime.backend_name()
    }

    /// Provision a new instance for `owner`.
    ///
    /// Nothing touches the runtime until access, quota and credentials have
    /// been validated and the instance id is reserved.
    pub async fn deploy(
        &self,
        owner: &str,
        credentials: &Credentials,
        promo: Option<&str>,
    ) -> Result<InstanceRecord> {
        self.access.check(owner)?;
        let quota = self.catalog.resolve_quota(promo)?;
        let result = self.provision(owner, credentials, quota).await;
        if result.is_err()
            && let Some(code) = promo
        {
            self.catalog.restore(code);
        }
        result
    }

    async fn provision(
        &self,
        owner: &str,
        credentials: &Credentials,
        quota: QuotaSpec,
    ) -> Result<InstanceRecord> {
        let spec = self.template.build(owner, credentials, &quota)?;
        let reservation = self.registry.reserve(&spec.name)?;
        info!(instance = %spec.name, owner, quota = %quota, "deploying instance");

        let created = self
            .bounded("create", self.runtime.create(&spec))
            .await;
        let handle = match created {
            Ok(handle) => handle,
            Err(Error::Runtime(e)) if e.downcast_ref::<NameConflict>().is_some() => {
                warn!(instance = %spec.name, "container name already taken, leaving it alone");
                return Err(Error::DuplicateInstance(spec.name));
            },
            Err(e) => {
                warn!(instance = %spec.name, error = %e, "create failed, removing partial container");
                self.remove_best_effort(&spec.name).await;
                return Err(e);
            },
        };

        let record = InstanceRecord::new(spec.name.clone(), owner, Utc::now(), quota);
        if let Err(e) = reservation.commit(record.clone()) {
            warn!(instance = %spec.name, error = %e, "registry commit failed, removing container");
            self.remove_best_effort(&spec.name).await;
            return Err(e);
        }
        info!(instance = %record.id, container_id = %handle.id, owner, "instance running");
        Ok(record)
    }

    /// `owner`'s instances, after dropping any whose container is gone or
    /// no longer running.
    pub async fn list_active(&self, owner: &str) -> Result<Vec<InstanceRecord>> {
        let started = Utc::now();
        let live = self.liveness().await?;
        for record in self.registry.list_owned_by(owner) {
            self.forget_if_gone(&record, &live, started).await;
        }
        Ok(self.registry.list_owned_by(owner))
    }

    /// Drop every record whose container is gone or stopped. Returns how many.
    pub async fn reconcile(&self) -> Result<usize> {
        let started = Utc::now();
        let live = self.liveness().await?;
        let mut dropped = 0;
        for record in self.registry.list_all() {
            if self.forget_if_gone(&record, &live, started).await {
                dropped += 1;
            }
        }
        if dropped > 0 {
            info!(dropped, "reconciliation dropped vanished instances");
        }
        Ok(dropped)
    }

    /// Register managed containers that survived a restart.
    pub async fn adopt_existing(&self) -> Result<usize> {
        let handles = self.bounded("list", self.runtime.list()).await?;
        let mut adopted = 0;
        for handle in handles.iter().filter(|h| h.is_managed()) {
            if self.registry.contains(&handle.name) {
                continue;
            }
            let Some(record) = self.record_from_handle(handle) else {
                warn!(container = %handle.name, "managed container has no owner label, skipping");
                continue;
            };
            match self.registry.register(record) {
                Ok(()) => {
                    adopted += 1;
                    info!(instance = %handle.name, "adopted existing container");
                },
                Err(e) => debug!(instance = %handle.name, error = %e, "not adopting container"),
            }
        }
        Ok(adopted)
    }

    fn record_from_handle(&self, handle: &ContainerHandle) -> Option<InstanceRecord> {
        let owner = handle.owner().filter(|o| !o.is_empty())?;
        let quota = handle
            .quota_label()
            .and_then(QuotaSpec::from_label)
            .unwrap_or_else(|| self.catalog.defaults());
        Some(InstanceRecord::new(
            handle.name.clone(),
            owner,
            handle.created_at.unwrap_or_else(Utc::now),
            quota,
        ))
    }

    /// Remove every instance older than `ttl` at `now`.
    ///
    /// Each instance is claimed by unregistering it, so concurrent passes
    /// never remove the same instance twice. A failed removal puts the
    /// record back for the next pass.
    pub async fn reclaim_expired(&self, ttl: chrono::Duration, now: DateTime<Utc>) -> ReclaimReport {
        let mut report = ReclaimReport::default();
        for candidate in self.registry.list_expired(ttl, now) {
            let Some(mut record) = self.registry.unregister(&candidate.id) else {
                continue;
            };
            let tunnels = std::mem::take(&mut record.tunnels);
            self.tunnels.close_all(&tunnels).await;

            match self
                .bounded("remove", self.runtime.remove(&record.id, true))
                .await
            {
                Ok(()) => {
                    info!(instance = %record.id, owner = %record.owner, "instance reclaimed");
                    report.removed.push(record.id);
                },
                Err(e) => {
                    warn!(instance = %record.id, error = %e, "reclaim failed, will retry");
                    report.failures.push(ReclaimFailure {
                        id: record.id.clone(),
                        reason: e.to_string(),
                    });
                    let id = record.id.clone();
                    if let Err(e) = self.registry.register(record) {
                        warn!(instance = %id, error = %e, "could not restore record after failed reclaim");
                    }
                },
            }
        }
        report
    }

    /// Reclaim with the configured TTL at the current time.
    pub async fn reclaim_now(&self) -> ReclaimReport {
        self.reclaim_expired(self.settings.ttl, Utc::now()).await
    }

    /// Host utilisation and the busiest instances.
    pub async fn node_stats(&self) -> Result<NodeStats> {
        let (cpu, ram) = tokio::join!(
            self.metrics.host_cpu_percent(),
            self.metrics.host_ram_percent()
        );
        let cpu_percent = cpu.map_err(Error::Runtime)?;
        let ram_percent = ram.map_err(Error::Runtime)?;

        let records = self.registry.list_all();
        let usages = futures::future::join_all(
            records
                .iter()
                .map(|r| self.bounded("stats", self.runtime.stats(&r.id))),
        )
        .await;

        let mut top: Vec<InstanceUsage> = records
            .into_iter()
            .zip(usages)
            .filter_map(|(record, usage)| match usage {
                Ok(usage) => Some(InstanceUsage {
                    id: record.id,
                    owner: record.owner,
                    cpu_percent: usage.cpu_percent,
                    memory_percent: usage.memory_percent,
                }),
                Err(e) => {
                    warn!(instance = %record.id, error = %e, "skipping instance without stats");
                    None
                },
            })
            .collect();
        top.sort_by(|a, b| {
            b.cpu_percent
                .total_cmp(&a.cpu_percent)
                .then_with(|| a.id.cmp(&b.id))
        });
        top.truncate(self.settings.top_instances);

        Ok(NodeStats {
            cpu_percent,
            ram_percent,
            top,
        })
    }

    pub fn set_defaults(&self, quota: QuotaSpec) -> Result<()> {
        self.catalog.set_defaults(quota)
    }

    pub fn issue_promo(&self, grant: QuotaSpec) -> Result<PromoCode> {
        self.catalog.issue_promo_code(grant)
    }

    /// Look up `instance_id` and check `caller` owns it or is allow-listed.
    pub fn authorize_instance(&self, caller: &str, instance_id: &str) -> Result<InstanceRecord> {
        let record = self
            .registry
            .get(instance_id)
            .ok_or_else(|| Error::InstanceNotFound(instance_id.to_string()))?;
        self.access.check_owner_or_allowed(caller, &record.owner)?;
        Ok(record)
    }

    pub async fn open_tunnel(&self, instance_id: &str, container_port: u16) -> Result<TunnelBinding> {
        self.tunnels.open_tunnel(instance_id, container_port).await
    }

    /// Close every tunnel of `instance_id`. Returns how many closed cleanly.
    pub async fn close_tunnels(&self, instance_id: &str) -> Result<usize> {
        if !self.registry.contains(instance_id) {
            return Err(Error::InstanceNotFound(instance_id.to_string()));
        }
        Ok(self.tunnels.close_instance_tunnels(instance_id).await)
    }

    pub fn tunnels(&self, instance_id: &str) -> Result<Vec<TunnelBinding>> {
        self.tunnels.tunnels(instance_id)
    }

    /// Run reconcile + reclaim every `interval` until `cancel` fires.
    pub fn spawn_maintenance(
        self: &Arc<Self>,
        interval: Duration,
        ttl: chrono::Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "starting maintenance loop");
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        info!("maintenance loop stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = controller.reconcile().await {
                            warn!(error = %e, "reconciliation failed");
                        }
                        let report = controller.reclaim_expired(ttl, Utc::now()).await;
                        if report.count() > 0 || !report.failures.is_empty() {
                            info!(
                                removed = report.count(),
                                failed = report.failures.len(),
                                "maintenance reclaimed expired instances"
                            );
                        }
                    }
                }
            }
        })
    }

    async fn liveness(&self) -> Result<Liveness> {
        let handles = self.bounded("list", self.runtime.list()).await?;
        let mut live = Liveness::default();
        for handle in handles {
            if handle.running {
                live.running.insert(handle.name);
            } else {
                live.stopped.insert(handle.name);
            }
        }
        Ok(live)
    }

    /// Unregister `record` unless the listing taken at `listed_at` shows it
    /// running. Records committed after the listing started are kept. A
    /// stopped container is removed so its name can be deployed again.
    async fn forget_if_gone(
        &self,
        record: &InstanceRecord,
        live: &Liveness,
        listed_at: DateTime<Utc>,
    ) -> bool {
        if live.running.contains(&record.id) || record.created_at >= listed_at {
            return false;
        }
        let Some(gone) = self.registry.unregister(&record.id) else {
            return false;
        };
        self.tunnels.close_all(&gone.tunnels).await;
        if live.stopped.contains(&gone.id) {
            warn!(instance = %gone.id, owner = %gone.owner, "container stopped, dropping record");
            self.remove_best_effort(&gone.id).await;
        } else {
            warn!(instance = %gone.id, owner = %gone.owner, "container disappeared, dropping record");
        }
        true
    }

    async fn remove_best_effort(&self, name: &str) {
        if let Err(e) = self.bounded("remove", self.runtime.remove(name, true)).await {
            warn!(instance = name, error = %e, "best-effort removal failed");
        }
    }

    /// Await a runtime call under the call timeout.
    async fn bounded<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = anyhow::Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.settings.call_timeout, call).await {
            Ok(result) => result.map_err(Error::Runtime),
            Err(_) => Err(Error::Timeout {
                operation,
                after: self.settings.call_timeout,
            }),
        }
    }
}
