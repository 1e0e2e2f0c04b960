//! Config schema types (access, default quota, runtime, lifecycle, tunnel, promo).
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeskfarmConfig {
    pub access: AccessConfig,
    pub defaults: QuotaConfig,
    pub runtime: RuntimeConfig,
    pub lifecycle: LifecycleConfig,
    pub tunnel: TunnelConfig,
    pub promo: PromoConfig,
}

/// Who may run privileged commands.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessConfig {
    /// Owner ids allowed to deploy, change defaults, issue promo codes and
    /// trigger reclamation. Empty means nobody.
    pub allowlist: Vec<String>,
}

/// Resource preset applied when a deploy carries no promo code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    pub ram_gib: u32,
    pub cpu_cores: u32,
    pub disk_gib: u32,
    pub secondary_disk_gib: u32,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            ram_gib: 4,
            cpu_cores: 4,
            disk_gib: 400,
            secondary_disk_gib: 100,
        }
    }
}

/// Container runtime settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Container CLI binary (`docker` or a compatible drop-in such as `podman`).
    pub cli: String,
    pub image: String,
    /// Prefix of every managed container name (`{prefix}_{owner-slug}-{hash}`).
    pub name_prefix: String,
    /// Remote-desktop port inside the container.
    pub container_port: u16,
    /// Additional container ports to publish (e.g. the 8006 web viewer).
    pub extra_ports: Vec<u16>,
    /// Host devices passed through (`/dev/kvm` for hardware virtualization).
    pub devices: Vec<String>,
    pub cap_add: Vec<String>,
    /// Extra environment variables merged into every launch spec.
    pub extra_env: BTreeMap<String, String>,
    /// Upper bound for any single runtime call, in seconds.
    pub call_timeout_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            cli: "docker".into(),
            image: "dockurr/windows".into(),
            name_prefix: "win".into(),
            container_port: 3389,
            extra_ports: vec![8006],
            devices: vec!["/dev/kvm".into()],
            cap_add: vec!["NET_ADMIN".into()],
            extra_env: BTreeMap::new(),
            call_timeout_secs: 120,
        }
    }
}

/// Instance time-to-live and the background maintenance cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    pub ttl_hours: u64,
    /// Seconds between reconcile + reclaim passes. `0` disables the loop.
    pub reclaim_interval_secs: u64,
    /// How many instances `node` reports.
    pub top_instances: usize,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            ttl_hours: 8,
            reclaim_interval_secs: 600,
            top_instances: 5,
        }
    }
}

/// Outbound tunnel provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Tunnel client binary.
    pub binary: String,
    /// Scheme of the local origin handed to the tunnel (`http`, `tcp`, `rdp`).
    pub scheme: String,
    /// Suffix identifying the public URL in the client's output.
    pub url_suffix: String,
    pub open_timeout_secs: u64,
    pub close_timeout_secs: u64,
    /// Range of the advisory public port shown next to a tunnel.
    pub advertised_port_min: u16,
    pub advertised_port_max: u16,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            binary: "cloudflared".into(),
            scheme: "http".into(),
            url_suffix: ".trycloudflare.com".into(),
            open_timeout_secs: 30,
            close_timeout_secs: 10,
            advertised_port_min: 1000,
            advertised_port_max: 9999,
        }
    }
}

/// Promo code behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PromoConfig {
    /// `"reusable"` (default) or `"single-use"`.
    pub redemption: String,
    /// Generate-and-check attempts before giving up on a fresh code.
    pub max_attempts: u32,
}

impl Default for PromoConfig {
    fn default() -> Self {
        Self {
            redemption: "reusable".into(),
            max_attempts: 64,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_original_preset() {
        let cfg = DeskfarmConfig::default();
        assert_eq!(cfg.defaults.ram_gib, 4);
        assert_eq!(cfg.defaults.cpu_cores, 4);
        assert_eq!(cfg.defaults.disk_gib, 400);
        assert_eq!(cfg.defaults.secondary_disk_gib, 100);
        assert_eq!(cfg.lifecycle.ttl_hours, 8);
        assert_eq!(cfg.runtime.image, "dockurr/windows");
        assert!(cfg.access.allowlist.is_empty());
    }

    #[test]
    fn partial_toml_keeps_section_defaults() {
        let cfg: DeskfarmConfig = toml::from_str(
            r#"
            [access]
            allowlist = ["42"]

            [defaults]
            ram_gib = 8
            "#,
        )
        .unwrap();
        assert_eq!(cfg.access.allowlist, vec!["42".to_string()]);
        assert_eq!(cfg.defaults.ram_gib, 8);
        assert_eq!(cfg.defaults.cpu_cores, 4);
        assert_eq!(cfg.runtime.container_port, 3389);
        assert_eq!(cfg.tunnel.binary, "cloudflared");
    }

    #[test]
    fn round_trips_through_toml() {
        let mut cfg = DeskfarmConfig::default();
        cfg.runtime
            .extra_env
            .insert("VERSION".into(), "11".into());
        let text = toml::to_string_pretty(&cfg).unwrap();
        let back: DeskfarmConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.runtime.extra_env.get("VERSION").unwrap(), "11");
        assert_eq!(back.promo.redemption, "reusable");
    }
}
