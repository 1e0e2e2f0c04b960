//! Configuration loading, validation and env substitution.
//!
//! Config files: `deskfarm.toml`, `deskfarm.yaml`, `deskfarm.yml` or
//! `deskfarm.json`. Searched in `./` then `~/.config/deskfarm/`, unless
//! `DESKFARM_CONFIG` points at a file.
//!
//! Supports `${ENV_VAR}` substitution in all string values, so secrets and
//! allow-lists can live in the environment.

pub mod env_subst;
pub mod loader;
pub mod schema;
pub mod validate;

pub use {
    loader::{config_dir, discover_and_load, find_config_file, load_config},
    schema::{
        AccessConfig, DeskfarmConfig, LifecycleConfig, PromoConfig, QuotaConfig, RuntimeConfig,
        TunnelConfig,
    },
    validate::{Diagnostic, Severity, ValidationResult},
};
