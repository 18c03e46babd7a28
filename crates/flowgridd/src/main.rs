//! flowgridd — the flowgrid daemon.
//!
//! Assembles the scheduler against a simulated cluster and offers the
//! offline tools around it:
//! - Graph validation
//! - Config scaffolding
//! - Session simulation (SimCluster + session manager + redb telemetry)
//! - Session history from a telemetry store
//!
//! # Usage
//!
//! ```text
//! flowgridd validate --graph capture.json
//! flowgridd simulate --cluster cluster.toml --graphs graphs/ --graph capture --name run-1
//! flowgridd history --data-dir /var/lib/flowgrid
//! ```

mod inspect;
mod simulate;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "flowgridd", about = "flowgrid daemon")]
struct Cli {
    /// Log as JSON lines instead of human-readable text.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check a logical graph file and print its execution plan.
    Validate {
        /// Graph definition (JSON).
        #[arg(long)]
        graph: PathBuf,

        /// Also resolve this flowgrid.toml.
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Print a flowgrid.toml with every setting at its default.
    InitConfig,

    /// Run one session of a graph on a simulated cluster.
    Simulate {
        /// Simulated nodes (TOML, `[[nodes]]` tables).
        #[arg(long)]
        cluster: PathBuf,

        /// Directory of graph definitions (`*.json`).
        #[arg(long)]
        graphs: PathBuf,

        /// Graph to run, `name` or `name@version`.
        #[arg(long)]
        graph: String,

        /// Session name.
        #[arg(long)]
        name: String,

        /// Scheduler settings.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Override `[launch] max_attempts`.
        #[arg(long)]
        max_attempts: Option<u32>,

        /// Override `[failure] policy` with `abort_subtree`.
        #[arg(long)]
        abort_subtree: bool,

        /// Record transitions into a redb store under this directory.
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Keep the session running until Ctrl-C instead of stopping it
        /// once it is running.
        #[arg(long)]
        hold: bool,

        /// Give up waiting for the session to run after this many seconds.
        #[arg(long, default_value = "60")]
        timeout: u64,
    },

    /// Show recorded sessions and their transitions.
    History {
        /// Directory holding the telemetry store.
        #[arg(long)]
        data_dir: PathBuf,

        /// Only this session, with every transition.
        #[arg(long)]
        session: Option<String>,

        /// Output format: `text` or `json`.
        #[arg(long, default_value = "text")]
        format: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,flowgridd=debug,flowgrid=debug"));
    if cli.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    match cli.command {
        Command::Validate { graph, config } => inspect::validate(&graph, config.as_deref()),
        Command::InitConfig => inspect::init_config(),
        Command::Simulate {
            cluster,
            graphs,
            graph,
            name,
            config,
            max_attempts,
            abort_subtree,
            data_dir,
            hold,
            timeout,
        } => {
            simulate::run(simulate::SimulateArgs {
                cluster,
                graphs,
                graph,
                name,
                config,
                max_attempts,
                abort_subtree,
                data_dir,
                hold,
                timeout: std::time::Duration::from_secs(timeout),
            })
            .await
        }
        Command::History {
            data_dir,
            session,
            format,
        } => inspect::history(&data_dir, session.as_deref(), &format),
    }
}
