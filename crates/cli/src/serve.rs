//! Line-oriented front end: one `<user_id> <command> [args...]` request per
//! stdin line, replies on stdout.

use std::{future::Future, io::Write as _, path::Path, time::Duration};

use {
    anyhow::{Context, Result},
    deskfarm_fleet::CommandRouter,
    tokio::{
        io::{AsyncBufRead, AsyncBufReadExt, BufReader},
        task::JoinSet,
    },
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use crate::{config_commands, fleet_commands};

pub async fn run(path: Option<&Path>) -> Result<()> {
    let config = config_commands::load(path)?;
    let controller = fleet_commands::build_controller(&config)?;

    match controller.adopt_existing().await {
        Ok(adopted) => info!(adopted, "adopted existing instances"),
        Err(e) => warn!(error = %e, "could not list existing containers"),
    }

    let cancel = CancellationToken::new();
    let interval = Duration::from_secs(config.lifecycle.reclaim_interval_secs);
    let maintenance = if interval.is_zero() {
        info!("background reclamation disabled");
        None
    } else {
        Some(controller.spawn_maintenance(interval, controller.settings().ttl, cancel.clone()))
    };

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "could not listen for interrupts");
            std::future::pending::<()>().await;
        }
        info!("interrupt received, shutting down");
    };

    info!("reading requests from stdin");
    let outcome = serve_lines(
        BufReader::new(tokio::io::stdin()),
        CommandRouter::new(controller),
        shutdown,
        |text| emit(&text),
    )
    .await;

    cancel.cancel();
    if let Some(handle) = maintenance {
        handle.await?;
    }
    outcome
}

/// Answer requests from `input` until EOF, `shutdown` or a read error.
///
/// Requests run concurrently; every in-flight request is finished before
/// this returns, whatever ended the loop. Lines that are not UTF-8 are
/// skipped.
async fn serve_lines<R, F>(
    mut input: R,
    router: CommandRouter,
    shutdown: impl Future<Output = ()>,
    reply: F,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    F: Fn(String) + Clone + Send + 'static,
{
    let mut inflight = JoinSet::new();
    let mut buf = Vec::new();
    tokio::pin!(shutdown);

    let outcome = loop {
        tokio::select! {
            read = input.read_until(b'\n', &mut buf) => {
                match read {
                    Ok(0) => {
                        debug!("stdin closed");
                        break Ok(());
                    },
                    Ok(_) => {},
                    Err(e) => break Err(e).context("failed to read request"),
                }
                let raw = std::mem::take(&mut buf);
                let Ok(line) = String::from_utf8(raw) else {
                    warn!("skipping request that is not valid UTF-8");
                    continue;
                };
                let Some((user, request)) = parse_request(&line) else {
                    continue;
                };
                let (user, request) = (user.to_string(), request.to_string());
                let router = router.clone();
                let reply = reply.clone();
                inflight.spawn(async move {
                    let text = router.submit_line(&user, &request).await;
                    reply(format_reply(&user, &text));
                });
            }
            () = &mut shutdown => break Ok(()),
            Some(joined) = inflight.join_next(), if !inflight.is_empty() => {
                if let Err(e) = joined {
                    warn!(error = %e, "request task failed");
                }
            }
        }
    };

    while let Some(joined) = inflight.join_next().await {
        if let Err(e) = joined {
            warn!(error = %e, "request task failed");
        }
    }
    outcome
}

/// Split `<user_id> <command...>`. Blank lines and `#` comments are skipped.
fn parse_request(line: &str) -> Option<(&str, &str)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    match line.split_once(char::is_whitespace) {
        Some((user, rest)) => Some((user, rest.trim())),
        None => Some((line, "")),
    }
}

/// Prefix every reply line with the user it answers.
fn format_reply(user: &str, reply: &str) -> String {
    reply
        .lines()
        .map(|l| format!("{user}> {l}"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn emit(text: &str) {
    let mut out = std::io::stdout().lock();
    let _ = writeln!(out, "{text}");
    let _ = out.flush();
}
