//! Instance lifecycle and quota management for virtual desktop containers.
//!
//! Core: quota catalog, launch spec builder, instance registry, lifecycle
//! controller and tunnel broker.
//!
//! Collaborators: container runtime (`docker` CLI), tunnel provider
//! (`cloudflared` quick tunnels) and host metrics (`sysinfo`), each behind a
//! trait so tests can swap in fakes.

pub mod access;
pub mod cloudflared;
pub mod commands;
pub mod controller;
pub mod docker;
pub mod error;
pub mod host;
pub mod launch;
pub mod quota;
pub mod registry;
pub mod runtime;
pub mod tunnel;

pub use {
    access::AccessPolicy,
    cloudflared::CloudflaredTunnelProvider,
    commands::{Command, CommandRouter},
    controller::{
        Collaborators, ControllerSettings, InstanceUsage, LifecycleController, NodeStats,
        ReclaimFailure, ReclaimReport,
    },
    docker::DockerRuntime,
    error::{Error, Result},
    host::{HostMetrics, SysinfoHostMetrics},
    launch::{Credentials, LaunchSpec, LaunchTemplate, instance_name},
    quota::{PromoCode, QuotaCatalog, QuotaSpec, RedemptionPolicy},
    registry::{InstanceRecord, InstanceRegistry, Reservation, TunnelBinding},
    runtime::{ContainerHandle, ContainerMissing, ContainerRuntime, NameConflict, ResourceUsage},
    tunnel::{OpenedTunnel, TunnelBroker, TunnelProvider, TunnelSettings},
};
