//! Fakes for the fleet collaborators, shared by the integration tests.
#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use {
    async_trait::async_trait,
    chrono::{DateTime, Utc},
    deskfarm_config::DeskfarmConfig,
    deskfarm_fleet::{
        Collaborators, CommandRouter, ContainerHandle, ContainerRuntime, ControllerSettings,
        ContainerMissing, HostMetrics, LaunchSpec, LifecycleController, NameConflict, OpenedTunnel,
        ResourceUsage, TunnelProvider,
    },
};

pub const ADMIN: &str = "admin";
pub const ALICE: &str = "1001";
pub const BOB: &str = "1002";

// ── Fake runtime ─────────────────────────────────────────────────────────────

#[derive(Default)]
struct RuntimeState {
    containers: BTreeMap<String, ContainerHandle>,
    specs: Vec<LaunchSpec>,
    usage: HashMap<String, ResourceUsage>,
    fail_create: Option<String>,
    fail_remove: HashSet<String>,
    foreign: HashSet<String>,
    create_delay: Option<Duration>,
    host_ports: HashMap<(String, u16), u16>,
    stall_host_port: bool,
    next_host_port: u16,
}

/// In-memory container runtime that records every call.
#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<RuntimeState>,
    pub create_calls: AtomicUsize,
    pub remove_calls: AtomicUsize,
    pub list_calls: AtomicUsize,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> std::sync::MutexGuard<'_, RuntimeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn fail_create(&self, message: &str) {
        self.state().fail_create = Some(message.to_string());
    }

    pub fn delay_create(&self, delay: Duration) {
        self.state().create_delay = Some(delay);
    }

    pub fn fail_remove(&self, name: &str) {
        self.state().fail_remove.insert(name.to_string());
    }

    pub fn heal_remove(&self, name: &str) {
        self.state().fail_remove.remove(name);
    }

    /// Pretend a container nobody here created already holds `name`.
    pub fn add_foreign(&self, name: &str) {
        self.state().foreign.insert(name.to_string());
    }

    /// Seed a container as if it survived a restart.
    pub fn seed(&self, name: &str, labels: &[(&str, &str)], created_at: DateTime<Utc>) {
        self.state().containers.insert(name.to_string(), ContainerHandle {
            id: format!("id-{name}"),
            name: name.to_string(),
            created_at: Some(created_at),
            running: true,
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        });
    }

    /// Mark a container as exited without removing it.
    pub fn stop(&self, name: &str) {
        if let Some(handle) = self.state().containers.get_mut(name) {
            handle.running = false;
        }
    }

    /// Make every published-port lookup hang.
    pub fn stall_host_port(&self) {
        self.state().stall_host_port = true;
    }

    /// Remove a container behind the controller's back.
    pub fn vanish(&self, name: &str) {
        self.state().containers.remove(name);
    }

    pub fn set_usage(&self, name: &str, cpu_percent: f64, memory_percent: f64) {
        self.state().usage.insert(name.to_string(), ResourceUsage {
            cpu_percent,
            memory_percent,
        });
    }

    pub fn publish(&self, name: &str, container_port: u16, host_port: u16) {
        self.state()
            .host_ports
            .insert((name.to_string(), container_port), host_port);
    }

    pub fn has(&self, name: &str) -> bool {
        self.state().containers.contains_key(name)
    }

    pub fn container_count(&self) -> usize {
        self.state().containers.len()
    }

    pub fn last_spec(&self) -> Option<LaunchSpec> {
        self.state().specs.last().cloned()
    }

    pub fn creates(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    fn backend_name(&self) -> &'static str {
        "fake"
    }

    async fn create(&self, spec: &LaunchSpec) -> anyhow::Result<ContainerHandle> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let delay = {
            let mut state = self.state();
            if state.foreign.contains(&spec.name) {
                return Err(NameConflict {
                    name: spec.name.clone(),
                }
                .into());
            }
            if let Some(message) = &state.fail_create {
                anyhow::bail!("{message}");
            }
            state.specs.push(spec.clone());
            let handle = ContainerHandle {
                id: format!("id-{}", spec.name),
                name: spec.name.clone(),
                created_at: Some(Utc::now()),
                running: true,
                labels: spec.labels.clone(),
            };
            state.containers.insert(spec.name.clone(), handle);
            // Like `docker run -p`: each port lands on a fresh host port.
            for port in &spec.published_ports {
                let host_port = 40000 + state.next_host_port;
                state.next_host_port += 1;
                state.host_ports.insert((spec.name.clone(), *port), host_port);
            }
            state.create_delay
        };
        // The container exists before the call returns, like a slow CLI.
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let state = self.state();
        state
            .containers
            .get(&spec.name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("container vanished during create"))
    }

    async fn list(&self) -> anyhow::Result<Vec<ContainerHandle>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.state().containers.values().cloned().collect())
    }

    async fn remove(&self, name: &str, _force: bool) -> anyhow::Result<()> {
        self.remove_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state();
        if state.fail_remove.contains(name) {
            anyhow::bail!("device or resource busy");
        }
        state.containers.remove(name);
        Ok(())
    }

    async fn stats(&self, name: &str) -> anyhow::Result<ResourceUsage> {
        self.state()
            .usage
            .get(name)
            .copied()
            .ok_or_else(|| anyhow::anyhow!("no stats for {name}"))
    }

    async fn host_port(&self, name: &str, container_port: u16) -> anyhow::Result<Option<u16>> {
        let stall = self.state().stall_host_port;
        if stall {
            std::future::pending::<()>().await;
        }
        let state = self.state();
        if !state.containers.contains_key(name) {
            return Err(ContainerMissing {
                name: name.to_string(),
            }
            .into());
        }
        Ok(state
            .host_ports
            .get(&(name.to_string(), container_port))
            .copied())
    }
}

// ── Fake tunnel provider ─────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeTunnels {
    next: AtomicUsize,
    open_calls: AtomicUsize,
    open: Mutex<HashMap<String, u16>>,
    closed: Mutex<Vec<String>>,
    fail_open: Mutex<bool>,
    fail_close: Mutex<bool>,
    open_delay: Mutex<Option<Duration>>,
}

impl FakeTunnels {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_open(&self) {
        *self.fail_open.lock().unwrap() = true;
    }

    pub fn fail_close(&self) {
        *self.fail_close.lock().unwrap() = true;
    }

    pub fn delay_open(&self, delay: Duration) {
        *self.open_delay.lock().unwrap() = Some(delay);
    }

    /// How many times `open` was called, failed calls included.
    pub fn open_calls(&self) -> usize {
        self.open_calls.load(Ordering::SeqCst)
    }

    pub fn open_count(&self) -> usize {
        self.open.lock().unwrap().len()
    }

    /// Every tunnel id `close` was called with, failed calls included.
    pub fn closed(&self) -> Vec<String> {
        self.closed.lock().unwrap().clone()
    }

    pub fn local_port_of(&self, tunnel_id: &str) -> Option<u16> {
        self.open.lock().unwrap().get(tunnel_id).copied()
    }
}

#[async_trait]
impl TunnelProvider for FakeTunnels {
    fn provider_name(&self) -> &'static str {
        "fake"
    }

    async fn open(&self, local_port: u16) -> anyhow::Result<OpenedTunnel> {
        self.open_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.open_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if *self.fail_open.lock().unwrap() {
            anyhow::bail!("edge unreachable");
        }
        let n = self.next.fetch_add(1, Ordering::SeqCst);
        let tunnel_id = format!("tun-{n}");
        self.open.lock().unwrap().insert(tunnel_id.clone(), local_port);
        Ok(OpenedTunnel {
            public_url: format!("https://t{n}.trycloudflare.com"),
            tunnel_id,
        })
    }

    async fn close(&self, tunnel_id: &str) -> anyhow::Result<()> {
        self.closed.lock().unwrap().push(tunnel_id.to_string());
        if *self.fail_close.lock().unwrap() {
            anyhow::bail!("tunnel process did not exit");
        }
        self.open.lock().unwrap().remove(tunnel_id);
        Ok(())
    }
}

// ── Fake host metrics ────────────────────────────────────────────────────────

pub struct FakeMetrics {
    pub cpu: f64,
    pub ram: f64,
}

#[async_trait]
impl HostMetrics for FakeMetrics {
    async fn host_cpu_percent(&self) -> anyhow::Result<f64> {
        Ok(self.cpu)
    }

    async fn host_ram_percent(&self) -> anyhow::Result<f64> {
        Ok(self.ram)
    }
}

// ── Harness ──────────────────────────────────────────────────────────────────

pub struct Harness {
    pub runtime: Arc<FakeRuntime>,
    pub tunnels: Arc<FakeTunnels>,
    pub controller: Arc<LifecycleController>,
}

impl Harness {
    pub fn router(&self) -> CommandRouter {
        CommandRouter::new(Arc::clone(&self.controller))
    }
}

pub fn config() -> DeskfarmConfig {
    let mut config = DeskfarmConfig::default();
    config.access.allowlist = vec![ADMIN.into(), ALICE.into(), BOB.into()];
    config
}

pub fn harness() -> Harness {
    harness_with(config(), None)
}

pub fn harness_with(config: DeskfarmConfig, settings: Option<ControllerSettings>) -> Harness {
    let runtime = FakeRuntime::new();
    let tunnels = FakeTunnels::new();
    let controller = LifecycleController::new(&config, Collaborators {
        runtime: Arc::clone(&runtime) as Arc<dyn ContainerRuntime>,
        tunnels: Arc::clone(&tunnels) as Arc<dyn TunnelProvider>,
        metrics: Arc::new(FakeMetrics {
            cpu: 37.5,
            ram: 62.0,
        }),
    })
    .unwrap();
    let controller = match settings {
        Some(settings) => controller.with_settings(settings),
        None => controller,
    };
    Harness {
        runtime,
        tunnels,
        controller: Arc::new(controller),
    }
}
