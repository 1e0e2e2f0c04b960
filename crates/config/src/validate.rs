//! Configuration validation engine.
//!
//! Detects unknown or misspelled fields in TOML files and reports semantic
//! problems (zero quotas, empty allow-list, inverted port ranges) on any
//! parsed configuration.

use std::{collections::HashMap, path::Path};

use crate::schema::DeskfarmConfig;

/// Severity level for a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
            Self::Info => write!(f, "info"),
        }
    }
}

/// A single validation diagnostic.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Category: "syntax", "unknown-field", "type-error", "quota", "access",
    /// "lifecycle", "runtime", "tunnel", "promo", "file-ref"
    pub category: &'static str,
    /// Dotted path, e.g. "defaults.ram_gib"
    pub path: String,
    pub message: String,
}

impl Diagnostic {
    fn new(
        severity: Severity,
        category: &'static str,
        path: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            severity,
            category,
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Result of validating a configuration.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub diagnostics: Vec<Diagnostic>,
    pub config_path: Option<std::path::PathBuf>,
}

impl ValidationResult {
    /// Returns `true` if any diagnostic is an error.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

    /// Count diagnostics by severity.
    #[must_use]
    pub fn count(&self, severity: Severity) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == severity)
            .count()
    }
}

// ── Schema tree for unknown-field detection ─────────────────────────────────

/// Expected shape of the configuration schema.
enum KnownKeys {
    /// A struct with fixed field names.
    Struct(HashMap<&'static str, KnownKeys>),
    /// A map with dynamic keys (e.g. `runtime.extra_env`).
    Map,
    /// Scalar or array value - stop recursion.
    Leaf,
}

/// Build the schema map mirroring every field in `schema.rs`.
fn build_schema_map() -> KnownKeys {
    use KnownKeys::{Leaf, Map, Struct};

    Struct(HashMap::from([
        ("access", Struct(HashMap::from([("allowlist", Leaf)]))),
        (
            "defaults",
            Struct(HashMap::from([
                ("ram_gib", Leaf),
                ("cpu_cores", Leaf),
                ("disk_gib", Leaf),
                ("secondary_disk_gib", Leaf),
            ])),
        ),
        (
            "runtime",
            Struct(HashMap::from([
                ("cli", Leaf),
                ("image", Leaf),
                ("name_prefix", Leaf),
                ("container_port", Leaf),
                ("extra_ports", Leaf),
                ("devices", Leaf),
                ("cap_add", Leaf),
                ("extra_env", Map),
                ("call_timeout_secs", Leaf),
            ])),
        ),
        (
            "lifecycle",
            Struct(HashMap::from([
                ("ttl_hours", Leaf),
                ("reclaim_interval_secs", Leaf),
                ("top_instances", Leaf),
            ])),
        ),
        (
            "tunnel",
            Struct(HashMap::from([
                ("binary", Leaf),
                ("scheme", Leaf),
                ("url_suffix", Leaf),
                ("open_timeout_secs", Leaf),
                ("close_timeout_secs", Leaf),
                ("advertised_port_min", Leaf),
                ("advertised_port_max", Leaf),
            ])),
        ),
        (
            "promo",
            Struct(HashMap::from([("redemption", Leaf), ("max_attempts", Leaf)])),
        ),
    ]))
}

// ── Core validation ─────────────────────────────────────────────────────────

/// Validate a config file at the given path, or discover the default config
/// file location if `path` is `None`.
#[must_use]
pub fn validate(path: Option<&Path>) -> ValidationResult {
    let config_path = match path {
        Some(p) => Some(p.to_path_buf()),
        None => crate::loader::find_config_file(),
    };

    let Some(actual_path) = config_path else {
        let mut result = validate_config(&DeskfarmConfig::default());
        result.diagnostics.insert(
            0,
            Diagnostic::new(
                Severity::Info,
                "file-ref",
                "",
                "no config file found; using defaults",
            ),
        );
        return result;
    };

    let is_toml = actual_path
        .extension()
        .and_then(|e| e.to_str())
        .is_none_or(|ext| ext == "toml");

    let mut result = if is_toml {
        match std::fs::read_to_string(&actual_path) {
            Ok(content) => validate_toml_str(&crate::env_subst::substitute_env(&content)),
            Err(e) => ValidationResult {
                diagnostics: vec![Diagnostic::new(
                    Severity::Error,
                    "syntax",
                    "",
                    format!("failed to read config file: {e}"),
                )],
                config_path: None,
            },
        }
    } else {
        match crate::loader::load_config(&actual_path) {
            Ok(config) => validate_config(&config),
            Err(e) => ValidationResult {
                diagnostics: vec![Diagnostic::new(
                    Severity::Error,
                    "type-error",
                    "",
                    e.to_string(),
                )],
                config_path: None,
            },
        }
    };
    result.config_path = Some(actual_path);
    result
}

/// Validate a TOML string without file-system side effects.
#[must_use]
pub fn validate_toml_str(toml_str: &str) -> ValidationResult {
    let mut diagnostics = Vec::new();

    let toml_value: toml::Value = match toml::from_str(toml_str) {
        Ok(v) => v,
        Err(e) => {
            diagnostics.push(Diagnostic::new(
                Severity::Error,
                "syntax",
                "",
                format!("TOML syntax error: {e}"),
            ));
            return ValidationResult {
                diagnostics,
                config_path: None,
            };
        },
    };

    let schema = build_schema_map();
    check_unknown_fields(&toml_value, &schema, "", &mut diagnostics);

    match toml::from_str::<DeskfarmConfig>(toml_str) {
        Ok(config) => check_semantics(&config, &mut diagnostics),
        Err(e) => diagnostics.push(Diagnostic::new(
            Severity::Error,
            "type-error",
            "",
            format!("type error: {e}"),
        )),
    }

    ValidationResult {
        diagnostics,
        config_path: None,
    }
}

/// Run the semantic checks on an already parsed configuration.
#[must_use]
pub fn validate_config(config: &DeskfarmConfig) -> ValidationResult {
    let mut diagnostics = Vec::new();
    check_semantics(config, &mut diagnostics);
    ValidationResult {
        diagnostics,
        config_path: None,
    }
}

/// Walk the TOML value tree against the schema tree and flag unknown keys.
fn check_unknown_fields(
    value: &toml::Value,
    schema: &KnownKeys,
    prefix: &str,
    diagnostics: &mut Vec<Diagnostic>,
) {
    let (toml::Value::Table(table), KnownKeys::Struct(fields)) = (value, schema) else {
        return;
    };

    let known_keys: Vec<&str> = fields.keys().copied().collect();
    for (key, child_value) in table {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        if let Some(child_schema) = fields.get(key.as_str()) {
            check_unknown_fields(child_value, child_schema, &path, diagnostics);
            continue;
        }
        let message = match suggest(key, &known_keys, 3) {
            Some(s) => format!("unknown field (did you mean \"{s}\"?)"),
            None => "unknown field".to_string(),
        };
        diagnostics.push(Diagnostic::new(
            Severity::Error,
            "unknown-field",
            path,
            message,
        ));
    }
}

fn check_semantics(config: &DeskfarmConfig, diagnostics: &mut Vec<Diagnostic>) {
    let quota = &config.defaults;
    for (field, value) in [
        ("ram_gib", quota.ram_gib),
        ("cpu_cores", quota.cpu_cores),
        ("disk_gib", quota.disk_gib),
    ] {
        if value == 0 {
            diagnostics.push(Diagnostic::new(
                Severity::Error,
                "quota",
                format!("defaults.{field}"),
                "must be greater than zero",
            ));
        }
    }

    if config.access.allowlist.is_empty() {
        diagnostics.push(Diagnostic::new(
            Severity::Warning,
            "access",
            "access.allowlist",
            "allow-list is empty; nobody can deploy instances",
        ));
    }
    if config.access.allowlist.iter().any(|id| id.trim().is_empty()) {
        diagnostics.push(Diagnostic::new(
            Severity::Error,
            "access",
            "access.allowlist",
            "allow-list contains an empty owner id",
        ));
    }

    if config.lifecycle.ttl_hours == 0 {
        diagnostics.push(Diagnostic::new(
            Severity::Error,
            "lifecycle",
            "lifecycle.ttl_hours",
            "a zero TTL would reclaim every instance immediately",
        ));
    }
    if config.lifecycle.reclaim_interval_secs == 0 {
        diagnostics.push(Diagnostic::new(
            Severity::Info,
            "lifecycle",
            "lifecycle.reclaim_interval_secs",
            "background reclamation disabled; run `cleanup` manually",
        ));
    }
    if config.lifecycle.top_instances == 0 {
        diagnostics.push(Diagnostic::new(
            Severity::Warning,
            "lifecycle",
            "lifecycle.top_instances",
            "node stats will list no instances",
        ));
    }

    let runtime = &config.runtime;
    for (field, value) in [
        ("cli", &runtime.cli),
        ("image", &runtime.image),
        ("name_prefix", &runtime.name_prefix),
    ] {
        if value.trim().is_empty() {
            diagnostics.push(Diagnostic::new(
                Severity::Error,
                "runtime",
                format!("runtime.{field}"),
                "must not be empty",
            ));
        }
    }
    if !runtime
        .name_prefix
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-')
    {
        diagnostics.push(Diagnostic::new(
            Severity::Error,
            "runtime",
            "runtime.name_prefix",
            "only ASCII letters, digits and '-' are allowed in container names",
        ));
    }
    if runtime.container_port == 0 {
        diagnostics.push(Diagnostic::new(
            Severity::Error,
            "runtime",
            "runtime.container_port",
            "must be a valid port",
        ));
    }
    if runtime.call_timeout_secs == 0 {
        diagnostics.push(Diagnostic::new(
            Severity::Error,
            "runtime",
            "runtime.call_timeout_secs",
            "must be greater than zero",
        ));
    }

    let tunnel = &config.tunnel;
    if tunnel.advertised_port_min == 0 || tunnel.advertised_port_min > tunnel.advertised_port_max {
        diagnostics.push(Diagnostic::new(
            Severity::Error,
            "tunnel",
            "tunnel.advertised_port_min",
            format!(
                "invalid advertised port range {}..={}",
                tunnel.advertised_port_min, tunnel.advertised_port_max
            ),
        ));
    }
    if tunnel.open_timeout_secs == 0 || tunnel.close_timeout_secs == 0 {
        diagnostics.push(Diagnostic::new(
            Severity::Error,
            "tunnel",
            "tunnel",
            "tunnel timeouts must be greater than zero",
        ));
    }
    if tunnel.url_suffix.trim().is_empty() {
        diagnostics.push(Diagnostic::new(
            Severity::Warning,
            "tunnel",
            "tunnel.url_suffix",
            "empty suffix matches the first https URL the tunnel client prints",
        ));
    }

    match config.promo.redemption.as_str() {
        "reusable" | "single-use" => {},
        other => diagnostics.push(Diagnostic::new(
            Severity::Error,
            "promo",
            "promo.redemption",
            format!("unknown redemption policy '{other}' (expected reusable or single-use)"),
        )),
    }
    if config.promo.max_attempts == 0 {
        diagnostics.push(Diagnostic::new(
            Severity::Error,
            "promo",
            "promo.max_attempts",
            "must be greater than zero",
        ));
    }
}

// ── Levenshtein distance ────────────────────────────────────────────────────

/// Compute the Levenshtein edit distance between two strings.
fn levenshtein(a: &str, b: &str) -> usize {
    let b_chars: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b_chars.len()).collect();
    let mut curr = vec![0; b_chars.len() + 1];

    for (i, ca) in a.chars().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b_chars.iter().enumerate() {
            let cost = usize::from(ca != *cb);
            curr[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b_chars.len()]
}

/// Find the closest candidate within `max_distance` edits.
fn suggest<'a>(needle: &str, candidates: &[&'a str], max_distance: usize) -> Option<&'a str> {
    candidates
        .iter()
        .map(|&c| (c, levenshtein(needle, c)))
        .filter(|&(_, d)| d > 0 && d <= max_distance)
        .min_by_key(|&(c, d)| (d, c))
        .map(|(c, _)| c)
}
