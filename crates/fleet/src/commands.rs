//! Text command surface shared by every front end.

use std::{fmt::Write as _, sync::Arc};

use tracing::{debug, warn};

use crate::{
    controller::LifecycleController,
    error::{Error, Result},
    launch::Credentials,
    quota::QuotaSpec,
};

/// A recognised command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Deploy,
    SetDefaults,
    IssuePromo,
    List,
    NodeStats,
    Reclaim,
    OpenTunnel,
    Tunnels,
    CloseTunnels,
    Help,
}

impl Command {
    pub const ALL: [Self; 10] = [
        Self::Deploy,
        Self::SetDefaults,
        Self::IssuePromo,
        Self::List,
        Self::NodeStats,
        Self::Reclaim,
        Self::OpenTunnel,
        Self::Tunnels,
        Self::CloseTunnels,
        Self::Help,
    ];

    /// Accepted names; the first is canonical.
    #[must_use]
    pub fn names(self) -> &'static [&'static str] {
        match self {
            Self::Deploy => &["deploy", "deploy-win"],
            Self::SetDefaults => &["set-defaults", "setup"],
            Self::IssuePromo => &["promo", "issue-promo"],
            Self::List => &["list"],
            Self::NodeStats => &["node", "node-stats"],
            Self::Reclaim => &["cleanup", "reclaim"],
            Self::OpenTunnel => &["port-forward", "port_forward_win", "open-tunnel"],
            Self::Tunnels => &["tunnels", "port_forward_win_url"],
            Self::CloseTunnels => &["close-tunnels"],
            Self::Help => &["help"],
        }
    }

    /// Parse a command name, with or without a leading `/`.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        let name = name.trim().trim_start_matches('/').to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|cmd| cmd.names().contains(&name.as_str()))
    }

    /// Requires the caller to be allow-listed.
    #[must_use]
    pub fn is_privileged(self) -> bool {
        matches!(
            self,
            Self::Deploy | Self::SetDefaults | Self::IssuePromo | Self::Reclaim
        )
    }

    fn usage(self) -> &'static str {
        match self {
            Self::Deploy => "deploy <username> <password> [promo] - start your desktop",
            Self::SetDefaults => "set-defaults <ram> <cpu> <disk> <disk2> - change the default quota",
            Self::IssuePromo => "promo <ram> <cpu> <disk> <disk2> - issue a promo code",
            Self::List => "list - your running instances",
            Self::NodeStats => "node - host usage and busiest instances",
            Self::Reclaim => "cleanup - remove expired instances now",
            Self::OpenTunnel => "port-forward <instance> <port> - expose a port publicly",
            Self::Tunnels => "tunnels <instance> - show public URLs",
            Self::CloseTunnels => "close-tunnels <instance> - close all tunnels",
            Self::Help => "help - this text",
        }
    }
}

/// Routes `(user, command, args)` requests to the controller and renders
/// replies as plain text.
#[derive(Clone)]
pub struct CommandRouter {
    controller: Arc<LifecycleController>,
}

impl CommandRouter {
    pub fn new(controller: Arc<LifecycleController>) -> Self {
        Self { controller }
    }

    #[must_use]
    pub fn controller(&self) -> &Arc<LifecycleController> {
        &self.controller
    }

    /// Run one command and return the reply text. Never fails: errors are
    /// logged and rendered as a user-safe message.
    pub async fn submit_command(&self, user_id: &str, command: &str, args: &[&str]) -> String {
        debug!(user = user_id, command, argc = args.len(), "command received");
        match self.dispatch(user_id, command, args).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(user = user_id, command, kind = e.kind(), error = %e, "command failed");
                format!("❌ {}", e.user_message())
            },
        }
    }

    /// Split a `command arg...` line and run it.
    pub async fn submit_line(&self, user_id: &str, line: &str) -> String {
        let mut words = line.split_whitespace();
        let Some(command) = words.next() else {
            return help_text();
        };
        let args: Vec<&str> = words.collect();
        self.submit_command(user_id, command, &args).await
    }

    async fn dispatch(&self, user: &str, command: &str, args: &[&str]) -> Result<String> {
        let cmd = Command::parse(command).ok_or_else(|| {
            Error::InvalidCommand(format!("unknown command '{command}', try help"))
        })?;
        if cmd.is_privileged() {
            self.controller.access().check(user)?;
        }
        let ctl = &self.controller;
        match cmd {
            Command::Deploy => {
                let (username, password, promo) = match args {
                    [u, p] => (*u, *p, None),
                    [u, p, code] => (*u, *p, Some(*code)),
                    _ => return Err(usage_error(cmd)),
                };
                let record = ctl
                    .deploy(user, &Credentials::new(username, password), promo)
                    .await?;
                Ok(format!(
                    "✅ Instance `{}` deployed ({}).",
                    record.id, record.quota
                ))
            },
            Command::SetDefaults => {
                let quota = QuotaSpec::from_args(args)?;
                ctl.set_defaults(quota)?;
                Ok(format!("✅ Default settings updated: {quota}."))
            },
            Command::IssuePromo => {
                let grant = QuotaSpec::from_args(args)?;
                let promo = ctl.issue_promo(grant)?;
                Ok(format!("✅ Promo code `{}` created for {}.", promo.code, promo.grant))
            },
            Command::List => {
                let records = ctl.list_active(user).await?;
                if records.is_empty() {
                    return Ok("No running instances.".into());
                }
                Ok(records
                    .iter()
                    .map(|r| format!("{} (since {})", r.id, r.created_at.format("%Y-%m-%d %H:%M UTC")))
                    .collect::<Vec<_>>()
                    .join("\n"))
            },
            Command::NodeStats => {
                let stats = ctl.node_stats().await?;
                let mut out = format!(
                    "🖥 Node Stats\n- CPU: {:.1}%\n- RAM: {:.1}%\n",
                    stats.cpu_percent, stats.ram_percent
                );
                if stats.top.is_empty() {
                    out.push_str("No running instances.");
                } else {
                    out.push_str("Top instances:");
                    for usage in &stats.top {
                        let _ = write!(
                            out,
                            "\n- {}: CPU {:.1}%, RAM {:.1}%",
                            usage.id, usage.cpu_percent, usage.memory_percent
                        );
                    }
                }
                Ok(out)
            },
            Command::Reclaim => {
                let report = ctl.reclaim_now().await;
                let mut out = format!("✅ Removed {} expired instances.", report.count());
                if !report.failures.is_empty() {
                    let _ = write!(
                        out,
                        " {} could not be removed and will be retried.",
                        report.failures.len()
                    );
                }
                Ok(out)
            },
            Command::OpenTunnel => {
                let [instance, port] = args else {
                    return Err(usage_error(cmd));
                };
                let port: u16 = port.parse().map_err(|_| {
                    Error::InvalidCommand(format!("port must be 1-65535, got '{port}'"))
                })?;
                ctl.authorize_instance(user, instance)?;
                let binding = ctl.open_tunnel(instance, port).await?;
                Ok(format!(
                    "✅ Port {} of `{instance}` forwarded: {} (port {})",
                    binding.container_port, binding.public_url, binding.advertised_port
                ))
            },
            Command::Tunnels => {
                let [instance] = args else {
                    return Err(usage_error(cmd));
                };
                ctl.authorize_instance(user, instance)?;
                let tunnels = ctl.tunnels(instance)?;
                if tunnels.is_empty() {
                    return Ok(format!("No open tunnels for `{instance}`."));
                }
                Ok(tunnels
                    .iter()
                    .map(|t| format!("🔗 {} → port {}", t.public_url, t.container_port))
                    .collect::<Vec<_>>()
                    .join("\n"))
            },
            Command::CloseTunnels => {
                let [instance] = args else {
                    return Err(usage_error(cmd));
                };
                ctl.authorize_instance(user, instance)?;
                let closed = ctl.close_tunnels(instance).await?;
                Ok(format!("✅ Closed {closed} tunnels for `{instance}`."))
            },
            Command::Help => Ok(help_text()),
        }
    }
}

fn usage_error(cmd: Command) -> Error {
    Error::InvalidCommand(format!("usage: {}", cmd.usage()))
}

/// One usage line per command.
#[must_use]
pub fn help_text() -> String {
    let mut out = String::from("Available commands:");
    for cmd in Command::ALL {
        let _ = write!(out, "\n{}", cmd.usage());
    }
    out
}
