//! Outbound tunnels and their binding to instances.

use std::{ops::RangeInclusive, sync::Arc, time::Duration};

use {
    anyhow::Result as AnyResult,
    async_trait::async_trait,
    rand::Rng,
    tracing::{info, warn},
};

use crate::{
    error::{Error, Result},
    registry::{InstanceRegistry, TunnelBinding},
    runtime::{ContainerMissing, ContainerRuntime},
};

/// A tunnel just opened by a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenedTunnel {
    pub tunnel_id: String,
    pub public_url: String,
}

/// Something that can expose a local port at a public URL.
#[async_trait]
pub trait TunnelProvider: Send + Sync {
    fn provider_name(&self) -> &'static str;

    async fn open(&self, local_port: u16) -> AnyResult<OpenedTunnel>;

    /// Close a tunnel. Closing an unknown tunnel succeeds.
    async fn close(&self, tunnel_id: &str) -> AnyResult<()>;
}

/// Tunnel broker timeouts and advisory port range.
#[derive(Debug, Clone)]
pub struct TunnelSettings {
    pub open_timeout: Duration,
    pub close_timeout: Duration,
    /// Upper bound for the runtime's published-port lookup.
    pub lookup_timeout: Duration,
    pub advertised_ports: RangeInclusive<u16>,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self::from(&deskfarm_config::TunnelConfig::default())
    }
}

impl From<&deskfarm_config::TunnelConfig> for TunnelSettings {
    fn from(cfg: &deskfarm_config::TunnelConfig) -> Self {
        let (lo, hi) = if cfg.advertised_port_min <= cfg.advertised_port_max {
            (cfg.advertised_port_min, cfg.advertised_port_max)
        } else {
            (cfg.advertised_port_max, cfg.advertised_port_min)
        };
        Self {
            open_timeout: Duration::from_secs(cfg.open_timeout_secs),
            close_timeout: Duration::from_secs(cfg.close_timeout_secs),
            lookup_timeout: Duration::from_secs(
                deskfarm_config::RuntimeConfig::default().call_timeout_secs,
            ),
            advertised_ports: lo.max(1)..=hi.max(1),
        }
    }
}

impl TunnelSettings {
    /// Bound the published-port lookup like every other runtime call.
    #[must_use]
    pub fn with_lookup_timeout(mut self, timeout: Duration) -> Self {
        self.lookup_timeout = timeout;
        self
    }
}

/// Opens tunnels for instances and keeps the registry bindings in step.
pub struct TunnelBroker {
    registry: InstanceRegistry,
    runtime: Arc<dyn ContainerRuntime>,
    provider: Arc<dyn TunnelProvider>,
    settings: TunnelSettings,
}

impl TunnelBroker {
    pub fn new(
        registry: InstanceRegistry,
        runtime: Arc<dyn ContainerRuntime>,
        provider: Arc<dyn TunnelProvider>,
        settings: TunnelSettings,
    ) -> Self {
        Self {
            registry,
            runtime,
            provider,
            settings,
        }
    }

    /// Expose `container_port` of `instance_id` and record the binding.
    pub async fn open_tunnel(
        &self,
        instance_id: &str,
        container_port: u16,
    ) -> Result<TunnelBinding> {
        if !self.registry.contains(instance_id) {
            return Err(Error::InstanceNotFound(instance_id.to_string()));
        }
        if container_port == 0 {
            return Err(Error::tunnel("port must be between 1 and 65535"));
        }

        let local_port = self.published_port(instance_id, container_port).await?;

        let opened = tokio::time::timeout(self.settings.open_timeout, self.provider.open(local_port))
            .await
            .map_err(|_| Error::Timeout {
                operation: "tunnel open",
                after: self.settings.open_timeout,
            })?
            .map_err(Error::TunnelProvider)?;

        let binding = TunnelBinding {
            tunnel_id: opened.tunnel_id,
            public_url: opened.public_url,
            container_port,
            local_port,
            advertised_port: rand::rng().random_range(self.settings.advertised_ports.clone()),
        };

        if let Err(e) = self.registry.add_tunnel(instance_id, binding.clone()) {
            // The instance went away while the tunnel was opening.
            warn!(instance = instance_id, tunnel = %binding.tunnel_id, "instance vanished, closing fresh tunnel");
            if let Err(close_err) = self.close_tunnel(&binding).await {
                warn!(tunnel = %binding.tunnel_id, error = %close_err, "failed to close orphaned tunnel");
            }
            return Err(e);
        }

        info!(
            instance = instance_id,
            tunnel = %binding.tunnel_id,
            url = %binding.public_url,
            local_port,
            "tunnel opened"
        );
        Ok(binding)
    }

    /// Host port the runtime published for `container_port`.
    ///
    /// Only published ports are tunnelled; anything else would expose the
    /// host's own service listening on that port.
    async fn published_port(&self, instance_id: &str, container_port: u16) -> Result<u16> {
        let lookup = tokio::time::timeout(
            self.settings.lookup_timeout,
            self.runtime.host_port(instance_id, container_port),
        )
        .await
        .map_err(|_| Error::Timeout {
            operation: "host port",
            after: self.settings.lookup_timeout,
        })?;
        match lookup {
            Ok(Some(port)) => Ok(port),
            Ok(None) => Err(Error::tunnel(format!(
                "port {container_port} is not published by {instance_id}"
            ))),
            Err(e) if e.downcast_ref::<ContainerMissing>().is_some() => {
                Err(Error::InstanceNotFound(instance_id.to_string()))
            },
            Err(e) => Err(Error::TunnelProvider(e)),
        }
    }

    /// Close one tunnel, bounded by the close timeout.
    pub async fn close_tunnel(&self, binding: &TunnelBinding) -> Result<()> {
        tokio::time::timeout(
            self.settings.close_timeout,
            self.provider.close(&binding.tunnel_id),
        )
        .await
        .map_err(|_| Error::Timeout {
            operation: "tunnel close",
            after: self.settings.close_timeout,
        })?
        .map_err(Error::TunnelProvider)?;
        info!(tunnel = %binding.tunnel_id, "tunnel closed");
        Ok(())
    }

    /// Close every binding. Failures are logged; returns how many failed.
    pub async fn close_all(&self, bindings: &[TunnelBinding]) -> usize {
        let results =
            futures::future::join_all(bindings.iter().map(|b| self.close_tunnel(b))).await;
        let mut failed = 0;
        for (binding, result) in bindings.iter().zip(results) {
            if let Err(e) = result {
                failed += 1;
                warn!(tunnel = %binding.tunnel_id, error = %e, "failed to close tunnel");
            }
        }
        failed
    }

    /// Detach and close every tunnel of `instance_id`. Returns how many closed cleanly.
    pub async fn close_instance_tunnels(&self, instance_id: &str) -> usize {
        let bindings = self.registry.remove_all_tunnels(instance_id);
        let failed = self.close_all(&bindings).await;
        bindings.len() - failed
    }

    /// Bindings currently attached to `instance_id`.
    pub fn tunnels(&self, instance_id: &str) -> Result<Vec<TunnelBinding>> {
        self.registry
            .get(instance_id)
            .map(|r| r.tunnels)
            .ok_or_else(|| Error::InstanceNotFound(instance_id.to_string()))
    }
}
