mod config_commands;
mod fleet_commands;
mod serve;

use std::path::PathBuf;

use {
    clap::{Parser, Subcommand},
    tracing::info,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "deskfarm", about = "deskfarm: short-lived virtual desktops on demand")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Config file (overrides discovery in ./ and ~/.config/deskfarm/).
    #[arg(long, global = true, env = "DESKFARM_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer `<user_id> <command> [args...]` lines from stdin (default).
    Serve,
    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: config_commands::ConfigAction,
    },
    /// List managed containers known to the runtime.
    List,
    /// Remove expired instances once and exit.
    Reclaim {
        /// Override the configured time-to-live.
        #[arg(long)]
        ttl_hours: Option<u64>,
    },
}

/// Initialise tracing. Logs go to stderr so stdout stays free for replies.
fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let registry = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    init_telemetry(&cli);

    info!(version = env!("CARGO_PKG_VERSION"), "deskfarm starting");

    let config_path = cli.config.as_deref();
    match cli.command {
        None | Some(Commands::Serve) => serve::run(config_path).await,
        Some(Commands::Config { action }) => config_commands::handle_config(action, config_path),
        Some(Commands::List) => fleet_commands::list(config_path).await,
        Some(Commands::Reclaim { ttl_hours }) => {
            fleet_commands::reclaim(config_path, ttl_hours).await
        },
    }
}
