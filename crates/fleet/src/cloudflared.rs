//! Quick tunnels through the `cloudflared` client.

use std::{
    collections::HashMap,
    process::Stdio,
    sync::{Mutex, MutexGuard, PoisonError},
};

use {
    anyhow::{Context, Result},
    async_trait::async_trait,
    rand::Rng,
    tokio::{
        io::{AsyncBufReadExt, AsyncRead, BufReader},
        process::{Child, Command},
        sync::mpsc,
    },
    tracing::{debug, info, trace},
};

use crate::tunnel::{OpenedTunnel, TunnelProvider};

/// Spawns one `cloudflared tunnel --url ...` child per tunnel.
///
/// The child is owned by the provider, keyed by tunnel id, and killed on
/// close or when the provider is dropped.
pub struct CloudflaredTunnelProvider {
    binary: String,
    scheme: String,
    url_suffix: String,
    children: Mutex<HashMap<String, Child>>,
}

impl CloudflaredTunnelProvider {
    pub fn new(
        binary: impl Into<String>,
        scheme: impl Into<String>,
        url_suffix: impl Into<String>,
    ) -> Self {
        Self {
            binary: binary.into(),
            scheme: scheme.into(),
            url_suffix: url_suffix.into(),
            children: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn from_config(config: &deskfarm_config::TunnelConfig) -> Self {
        Self::new(
            config.binary.clone(),
            config.scheme.clone(),
            config.url_suffix.clone(),
        )
    }

    fn children(&self) -> MutexGuard<'_, HashMap<String, Child>> {
        self.children.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Forward every line of `stream` to `tx` until EOF.
///
/// Keeps reading after the receiver is gone so the child never blocks on a
/// full pipe.
async fn drain_lines(stream: impl AsyncRead + Unpin, tx: mpsc::UnboundedSender<String>) {
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        trace!(line = %line, "cloudflared");
        let _ = tx.send(line);
    }
}

/// Find the public quick-tunnel URL in one line of client output.
pub fn extract_public_url(line: &str, suffix: &str) -> Option<String> {
    line.split(|c: char| c.is_whitespace() || c == '|' || c == '"')
        .map(|token| token.trim_end_matches(['/', '.', ',']))
        .find(|token| {
            token.starts_with("https://")
                && token.ends_with(suffix)
                && !token.starts_with("https://api.")
                && token.len() > "https://".len() + suffix.len()
        })
        .map(str::to_string)
}

#[async_trait]
impl TunnelProvider for CloudflaredTunnelProvider {
    fn provider_name(&self) -> &'static str {
        "cloudflared"
    }

    async fn open(&self, local_port: u16) -> Result<OpenedTunnel> {
        let origin = format!("{}://localhost:{local_port}", self.scheme);
        debug!(binary = %self.binary, %origin, "starting quick tunnel");
        let mut child = Command::new(&self.binary)
            .args(["tunnel", "--no-autoupdate", "--url", &origin])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.binary))?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(drain_lines(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain_lines(stderr, tx));
        }

        let mut last_line = String::new();
        let public_url = loop {
            match rx.recv().await {
                Some(line) => {
                    if let Some(url) = extract_public_url(&line, &self.url_suffix) {
                        break url;
                    }
                    last_line = line;
                },
                None => {
                    let status = child.wait().await.ok();
                    anyhow::bail!(
                        "{} exited ({}) before publishing a URL: {last_line}",
                        self.binary,
                        status.map_or_else(|| "unknown status".to_string(), |s| s.to_string())
                    );
                },
            }
        };

        let tunnel_id = format!("tun-{:016x}", rand::rng().random::<u64>());
        self.children().insert(tunnel_id.clone(), child);
        info!(tunnel = %tunnel_id, url = %public_url, local_port, "quick tunnel ready");
        Ok(OpenedTunnel {
            tunnel_id,
            public_url,
        })
    }

    async fn close(&self, tunnel_id: &str) -> Result<()> {
        let held = self.children().remove(tunnel_id);
        let Some(mut child) = held else {
            debug!(tunnel = tunnel_id, "tunnel not held, nothing to close");
            return Ok(());
        };
        child
            .kill()
            .await
            .with_context(|| format!("failed to stop tunnel {tunnel_id}"))?;
        Ok(())
    }
}
