//! [`ContainerRuntime`] backed by the `docker` CLI.

use std::{collections::BTreeMap, process::Output, time::Duration};

use {
    anyhow::{Context, Result},
    async_trait::async_trait,
    chrono::{DateTime, Utc},
    secrecy::ExposeSecret,
    serde::Deserialize,
    tracing::{debug, info},
};

use crate::{
    launch::{LABEL_MANAGED, LaunchSpec},
    runtime::{ContainerHandle, ContainerMissing, ContainerRuntime, NameConflict, ResourceUsage},
};

/// Shells out to `docker` (or a CLI-compatible drop-in such as `podman`).
pub struct DockerRuntime {
    cli: String,
    call_timeout: Duration,
}

impl DockerRuntime {
    pub fn new(cli: impl Into<String>, call_timeout: Duration) -> Self {
        Self {
            cli: cli.into(),
            call_timeout,
        }
    }

    #[must_use]
    pub fn from_config(config: &deskfarm_config::RuntimeConfig) -> Self {
        Self::new(
            config.cli.clone(),
            Duration::from_secs(config.call_timeout_secs),
        )
    }

    async fn run(&self, args: &[String], envs: &[(&str, &str)]) -> Result<Output> {
        debug!(cli = %self.cli, ?args, "invoking container cli");
        let mut cmd = tokio::process::Command::new(&self.cli);
        cmd.args(args)
            .envs(envs.iter().copied())
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        let child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.cli))?;
        match tokio::time::timeout(self.call_timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => anyhow::bail!("{} {} failed: {e}", self.cli, subcommand(args)),
            Err(_) => anyhow::bail!(
                "{} {} timed out after {}s",
                self.cli,
                subcommand(args),
                self.call_timeout.as_secs()
            ),
        }
    }
}

fn subcommand(args: &[String]) -> &str {
    args.first().map_or("", String::as_str)
}

fn stderr_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

/// Arguments for `docker run`. Secret values are passed by name only.
fn run_args(spec: &LaunchSpec) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "-d".to_string(),
        "--name".to_string(),
        spec.name.clone(),
    ];
    for (k, v) in &spec.labels {
        args.extend(["--label".to_string(), format!("{k}={v}")]);
    }
    for (k, v) in &spec.env {
        args.extend(["-e".to_string(), format!("{k}={v}")]);
    }
    for k in spec.secret_env.keys() {
        args.extend(["-e".to_string(), k.clone()]);
    }
    for device in &spec.devices {
        args.extend(["--device".to_string(), device.clone()]);
    }
    for cap in &spec.cap_add {
        args.extend(["--cap-add".to_string(), cap.clone()]);
    }
    for port in &spec.published_ports {
        args.extend(["-p".to_string(), port.to_string()]);
    }
    args.push(spec.image.clone());
    args
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PsLine {
    #[serde(rename = "ID")]
    id: String,
    names: String,
    #[serde(default)]
    created_at: String,
    #[serde(default)]
    state: String,
    #[serde(default)]
    labels: String,
}

impl From<PsLine> for ContainerHandle {
    fn from(line: PsLine) -> Self {
        Self {
            id: line.id,
            name: line.names.split(',').next().unwrap_or_default().to_string(),
            created_at: parse_created_at(&line.created_at),
            running: line.state.eq_ignore_ascii_case("running"),
            labels: parse_labels(&line.labels),
        }
    }
}

#[derive(Debug, Deserialize)]
struct StatsLine {
    #[serde(rename = "CPUPerc")]
    cpu_perc: String,
    #[serde(rename = "MemPerc")]
    mem_perc: String,
}

/// Parse `docker ps --format '{{json .}}'` output, one object per line.
fn parse_ps_output(stdout: &str) -> Result<Vec<ContainerHandle>> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|l| {
            serde_json::from_str::<PsLine>(l)
                .map(ContainerHandle::from)
                .with_context(|| format!("unexpected ps line: {l}"))
        })
        .collect()
}

/// `2025-01-01 12:00:00 +0000 UTC` → UTC timestamp.
fn parse_created_at(raw: &str) -> Option<DateTime<Utc>> {
    let head: Vec<&str> = raw.split_whitespace().take(3).collect();
    if head.len() < 3 {
        return None;
    }
    DateTime::parse_from_str(&head.join(" "), "%Y-%m-%d %H:%M:%S %z")
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Parse the comma-joined `k=v` label list.
///
/// Label values may themselves contain commas (the quota label does), so a
/// segment without `=` continues the previous value.
fn parse_labels(raw: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    let mut last: Option<String> = None;
    for segment in raw.split(',') {
        match segment.split_once('=') {
            Some((k, v)) => {
                labels.insert(k.to_string(), v.to_string());
                last = Some(k.to_string());
            },
            None => {
                if let Some(value) = last.as_ref().and_then(|k| labels.get_mut(k)) {
                    value.push(',');
                    value.push_str(segment);
                }
            },
        }
    }
    labels
}

fn parse_percent(raw: &str) -> Option<f64> {
    raw.trim().trim_end_matches('%').trim().parse().ok()
}

fn parse_stats_output(stdout: &str) -> Result<ResourceUsage> {
    let line = stdout
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .context("empty stats output")?;
    let stats: StatsLine =
        serde_json::from_str(line).with_context(|| format!("unexpected stats line: {line}"))?;
    Ok(ResourceUsage {
        cpu_percent: parse_percent(&stats.cpu_perc)
            .with_context(|| format!("bad CPUPerc: {}", stats.cpu_perc))?,
        memory_percent: parse_percent(&stats.mem_perc)
            .with_context(|| format!("bad MemPerc: {}", stats.mem_perc))?,
    })
}

/// First host port in `docker port` output (`0.0.0.0:49153`, `[::]:49153`).
fn parse_port_output(stdout: &str) -> Option<u16> {
    stdout
        .lines()
        .filter_map(|l| l.trim().rsplit_once(':'))
        .find_map(|(_, port)| port.parse().ok())
}

fn is_missing_container(stderr: &str) -> bool {
    stderr.contains("No such container") || stderr.contains("no such container")
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn backend_name(&self) -> &'static str {
        "docker"
    }

    async fn create(&self, spec: &LaunchSpec) -> Result<ContainerHandle> {
        let args = run_args(spec);
        let secrets: Vec<(&str, &str)> = spec
            .secret_env
            .iter()
            .map(|(k, v)| (k.as_str(), v.expose_secret().as_str()))
            .collect();
        let output = self.run(&args, &secrets).await?;
        if !output.status.success() {
            let stderr = stderr_of(&output);
            if stderr.contains("is already in use") {
                return Err(NameConflict {
                    name: spec.name.clone(),
                }
                .into());
            }
            anyhow::bail!("{} run failed: {stderr}", self.cli);
        }
        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        info!(instance = %spec.name, container_id = %id, "container started");
        Ok(ContainerHandle {
            id,
            name: spec.name.clone(),
            created_at: Some(Utc::now()),
            running: true,
            labels: spec.labels.clone(),
        })
    }

    async fn list(&self) -> Result<Vec<ContainerHandle>> {
        let args: Vec<String> = [
            "ps",
            "--all",
            "--no-trunc",
            "--filter",
            format!("label={LABEL_MANAGED}=true").as_str(),
            "--format",
            "{{json .}}",
        ]
        .into_iter()
        .map(String::from)
        .collect();
        let output = self.run(&args, &[]).await?;
        if !output.status.success() {
            anyhow::bail!("{} ps failed: {}", self.cli, stderr_of(&output));
        }
        parse_ps_output(&String::from_utf8_lossy(&output.stdout))
    }

    async fn remove(&self, name: &str, force: bool) -> Result<()> {
        let mut args = vec!["rm".to_string()];
        if force {
            args.push("-f".to_string());
        }
        args.push(name.to_string());
        let output = self.run(&args, &[]).await?;
        if output.status.success() {
            info!(instance = name, "container removed");
            return Ok(());
        }
        let stderr = stderr_of(&output);
        if is_missing_container(&stderr) {
            debug!(instance = name, "container already gone");
            return Ok(());
        }
        anyhow::bail!("{} rm failed for {name}: {stderr}", self.cli)
    }

    async fn stats(&self, name: &str) -> Result<ResourceUsage> {
        let args: Vec<String> = ["stats", "--no-stream", "--format", "{{json .}}", name]
            .into_iter()
            .map(String::from)
            .collect();
        let output = self.run(&args, &[]).await?;
        if !output.status.success() {
            anyhow::bail!("{} stats failed for {name}: {}", self.cli, stderr_of(&output));
        }
        parse_stats_output(&String::from_utf8_lossy(&output.stdout))
    }

    async fn host_port(&self, name: &str, container_port: u16) -> Result<Option<u16>> {
        let args = vec![
            "port".to_string(),
            name.to_string(),
            format!("{container_port}/tcp"),
        ];
        let output = self.run(&args, &[]).await?;
        if !output.status.success() {
            let stderr = stderr_of(&output);
            if is_missing_container(&stderr) {
                return Err(ContainerMissing {
                    name: name.to_string(),
                }
                .into());
            }
            // Port not published.
            return Ok(None);
        }
        Ok(parse_port_output(&String::from_utf8_lossy(&output.stdout)))
    }
}
