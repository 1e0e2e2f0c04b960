//! Immutable launch specifications for desktop containers.
//!
//! Replaces editing a shared compose file: every deploy gets its own
//! [`LaunchSpec`] value that is handed straight to the runtime.

use std::collections::BTreeMap;

use {
    secrecy::{ExposeSecret, SecretString},
    sha2::{Digest, Sha256},
};

use crate::{
    error::{Error, Result},
    quota::QuotaSpec,
};

/// Label marking containers this service manages.
pub const LABEL_MANAGED: &str = "deskfarm.managed";
/// Label carrying the owner id.
pub const LABEL_OWNER: &str = "deskfarm.owner";
/// Label carrying the quota in `ram,cpu,disk,disk2` form.
pub const LABEL_QUOTA: &str = "deskfarm.quota";

const MAX_USERNAME_LEN: usize = 64;
const MAX_SLUG_LEN: usize = 32;
const HASH_HEX_LEN: usize = 10;

/// Login for the desktop inside the container.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: SecretString,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: SecretString::new(password.into()),
        }
    }

    /// Non-empty username and password, no control characters.
    pub fn validate(&self) -> Result<()> {
        let username = self.username.trim();
        if username.is_empty() {
            return Err(Error::InvalidCredentials("username must not be empty".into()));
        }
        if username.chars().count() > MAX_USERNAME_LEN {
            return Err(Error::InvalidCredentials(format!(
                "username must be at most {MAX_USERNAME_LEN} characters"
            )));
        }
        if self.password.expose_secret().trim().is_empty() {
            return Err(Error::InvalidCredentials("password must not be empty".into()));
        }
        if self.username.chars().any(char::is_control)
            || self.password.expose_secret().chars().any(char::is_control)
        {
            return Err(Error::InvalidCredentials(
                "credentials must not contain control characters".into(),
            ));
        }
        Ok(())
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Everything the runtime needs to start one instance.
#[derive(Clone)]
pub struct LaunchSpec {
    /// Container name; doubles as the instance id.
    pub name: String,
    pub image: String,
    pub env: BTreeMap<String, String>,
    /// Environment values that must never appear in logs or argv.
    pub secret_env: BTreeMap<String, SecretString>,
    pub labels: BTreeMap<String, String>,
    /// Container ports to publish on random host ports.
    pub published_ports: Vec<u16>,
    pub devices: Vec<String>,
    pub cap_add: Vec<String>,
}

impl std::fmt::Debug for LaunchSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaunchSpec")
            .field("name", &self.name)
            .field("image", &self.image)
            .field("env", &self.env)
            .field("secret_env", &self.secret_env.keys().collect::<Vec<_>>())
            .field("labels", &self.labels)
            .field("published_ports", &self.published_ports)
            .field("devices", &self.devices)
            .field("cap_add", &self.cap_add)
            .finish()
    }
}

/// Fixed parts of every launch spec, taken from `[runtime]`.
#[derive(Debug, Clone)]
pub struct LaunchTemplate {
    pub image: String,
    pub name_prefix: String,
    pub container_port: u16,
    pub extra_ports: Vec<u16>,
    pub devices: Vec<String>,
    pub cap_add: Vec<String>,
    pub extra_env: BTreeMap<String, String>,
}

impl From<&deskfarm_config::RuntimeConfig> for LaunchTemplate {
    fn from(cfg: &deskfarm_config::RuntimeConfig) -> Self {
        Self {
            image: cfg.image.clone(),
            name_prefix: cfg.name_prefix.clone(),
            container_port: cfg.container_port,
            extra_ports: cfg.extra_ports.clone(),
            devices: cfg.devices.clone(),
            cap_add: cfg.cap_add.clone(),
            extra_env: cfg.extra_env.clone(),
        }
    }
}

impl LaunchTemplate {
    /// Name of the instance `owner` gets.
    #[must_use]
    pub fn instance_name(&self, owner: &str) -> String {
        instance_name(&self.name_prefix, owner)
    }

    /// Validate inputs and produce the launch spec. Never touches the runtime.
    pub fn build(
        &self,
        owner: &str,
        credentials: &Credentials,
        quota: &QuotaSpec,
    ) -> Result<LaunchSpec> {
        if owner.trim().is_empty() {
            return Err(Error::InvalidCommand("owner id must not be empty".into()));
        }
        credentials.validate()?;
        quota.validate()?;

        // Template extras first so the quota-derived keys always win.
        let mut env = self.extra_env.clone();
        env.insert("USERNAME".into(), credentials.username.trim().to_string());
        env.insert("RAM_SIZE".into(), format!("{}G", quota.ram_gib));
        env.insert("CPU_CORES".into(), quota.cpu_cores.to_string());
        env.insert("DISK_SIZE".into(), format!("{}G", quota.disk_gib));
        env.insert("DISK2_SIZE".into(), format!("{}G", quota.secondary_disk_gib));
        env.remove("PASSWORD");

        let secret_env = BTreeMap::from([("PASSWORD".to_string(), credentials.password.clone())]);

        let labels = BTreeMap::from([
            (LABEL_MANAGED.to_string(), "true".to_string()),
            (LABEL_OWNER.to_string(), owner.to_string()),
            (LABEL_QUOTA.to_string(), quota.to_label()),
        ]);

        let mut published_ports = vec![self.container_port];
        for port in &self.extra_ports {
            if !published_ports.contains(port) {
                published_ports.push(*port);
            }
        }

        Ok(LaunchSpec {
            name: self.instance_name(owner),
            image: self.image.clone(),
            env,
            secret_env,
            labels,
            published_ports,
            devices: self.devices.clone(),
            cap_add: self.cap_add.clone(),
        })
    }
}

/// Derive the stable container name for `owner`.
///
/// `{prefix}_{slug}-{hash}`: the slug keeps names readable, the SHA-256
/// prefix keeps owners whose slugs collide apart.
#[must_use]
pub fn instance_name(prefix: &str, owner: &str) -> String {
    let digest = Sha256::digest(owner.as_bytes());
    let hash: String = digest
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<String>()
        .chars()
        .take(HASH_HEX_LEN)
        .collect();
    format!("{prefix}_{}-{hash}", owner_slug(owner))
}

fn owner_slug(owner: &str) -> String {
    let mut out = String::new();
    let mut last_dash = false;
    for ch in owner.to_lowercase().chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch);
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    let out: String = out.trim_matches('-').chars().take(MAX_SLUG_LEN).collect();
    let out = out.trim_end_matches('-');
    if out.is_empty() {
        "user".to_string()
    } else {
        out.to_string()
    }
}
