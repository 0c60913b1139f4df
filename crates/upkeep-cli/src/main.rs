mod cmd;
mod output;
mod root;
mod signals;

use clap::{Parser, Subcommand};
use cmd::{collections::CollectionsSubcommand, config::ConfigSubcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "upkeep",
    about = "Self-update orchestrator: pull code, swap the asset bundle, restart the service",
    version,
    propagate_version = true
)]
struct Cli {
    /// Source tree to manage (default: auto-detect from .upkeep/ or .git/)
    #[arg(long, global = true, env = "UPKEEP_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write .upkeep/config.yaml for this source tree
    Init {
        /// systemd unit that runs the service (default: directory name)
        #[arg(long)]
        service: Option<String>,

        /// Use `systemctl --user`
        #[arg(long)]
        user: bool,

        /// Asset bundle locator with a {version} placeholder
        #[arg(long, requires = "live_dir")]
        assets_url: Option<String>,

        /// Directory the service serves assets from
        #[arg(long, requires = "assets_url")]
        live_dir: Option<PathBuf>,
    },

    /// Report whether an update is pending, without changing anything
    Check,

    /// Run one update cycle now
    Run,

    /// Run update cycles periodically until interrupted (SIGHUP triggers a cycle)
    Watch {
        /// Seconds between checks (default: schedule.interval_minutes)
        #[arg(long)]
        interval_secs: Option<u64>,
    },

    /// Show service state, installed assets and the last cycle
    Status,

    /// List recent update cycles
    History {
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Inspect and validate the configuration
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },

    /// Browse recorded collections in the application database
    Collections {
        #[command(subcommand)]
        subcommand: CollectionsSubcommand,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Run | Commands::Watch { .. } => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let root = root::resolve_root(cli.root.as_deref());

    let result = match cli.command {
        Commands::Init {
            service,
            user,
            assets_url,
            live_dir,
        } => cmd::init::run(
            &root,
            service.as_deref(),
            user,
            assets_url.as_deref(),
            live_dir.as_deref(),
        )
        .map(|()| 0),
        Commands::Check => cmd::check::run(&root, cli.json).map(|()| 0),
        Commands::Run => cmd::run::run(&root, cli.json),
        Commands::Watch { interval_secs } => {
            cmd::watch::run(&root, interval_secs, cli.json).map(|()| 0)
        }
        Commands::Status => cmd::status::run(&root, cli.json).map(|()| 0),
        Commands::History { limit } => cmd::history::run(&root, limit, cli.json).map(|()| 0),
        Commands::Config { subcommand } => cmd::config::run(&root, subcommand, cli.json).map(|()| 0),
        Commands::Collections { subcommand } => {
            cmd::collections::run(&root, subcommand, cli.json).map(|()| 0)
        }
    };

    match result {
        Ok(0) => {}
        Ok(code) => std::process::exit(code),
        Err(e) => {
            // Print the full error chain (anyhow's alternate Display)
            eprintln!("error: {e:#}");
            std::process::exit(1);
        }
    }
}
