use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::{env_subst::substitute_env, schema::DeskfarmConfig};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &[
    "deskfarm.toml",
    "deskfarm.yaml",
    "deskfarm.yml",
    "deskfarm.json",
];

/// Environment variable pointing at an explicit config file.
pub const CONFIG_ENV_VAR: &str = "DESKFARM_CONFIG";

/// Load config from the given path (any supported format).
pub fn load_config(path: &Path) -> anyhow::Result<DeskfarmConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    let raw = substitute_env(&raw);
    parse_config(&raw, path)
}

/// Discover and load config from standard locations.
///
/// Search order:
/// 1. `$DESKFARM_CONFIG`
/// 2. `./deskfarm.{toml,yaml,yml,json}` (project-local)
/// 3. `~/.config/deskfarm/deskfarm.{toml,yaml,yml,json}` (user-global)
///
/// Returns `DeskfarmConfig::default()` if no config file is found or the
/// file fails to parse.
pub fn discover_and_load() -> DeskfarmConfig {
    if let Some(path) = find_config_file() {
        debug!(path = %path.display(), "loading config");
        match load_config(&path) {
            Ok(cfg) => return cfg,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
            },
        }
    } else {
        debug!("no config file found, using defaults");
    }
    DeskfarmConfig::default()
}

/// Find the first config file in standard locations.
pub fn find_config_file() -> Option<PathBuf> {
    if let Some(explicit) = std::env::var_os(CONFIG_ENV_VAR) {
        let p = PathBuf::from(explicit);
        if p.exists() {
            return Some(p);
        }
        warn!(path = %p.display(), "{CONFIG_ENV_VAR} points at a missing file, ignoring");
    }

    if let Some(p) = first_existing(Path::new(".")) {
        return Some(p);
    }

    config_dir().and_then(|dir| first_existing(&dir))
}

/// Returns the user-global config directory (`~/.config/deskfarm/`).
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "deskfarm").map(|d| d.config_dir().to_path_buf())
}

fn first_existing(dir: &Path) -> Option<PathBuf> {
    CONFIG_FILENAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|p| p.exists())
}

fn parse_config(raw: &str, path: &Path) -> anyhow::Result<DeskfarmConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match ext {
        "toml" => Ok(toml::from_str(raw)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(raw)?),
        "json" => Ok(serde_json::from_str(raw)?),
        _ => anyhow::bail!("unsupported config format: .{ext}"),
    }
}
