//! Simulation mode — one session on an in-memory cluster.
//!
//! In this mode, the daemon:
//! 1. Loads scheduler settings, the simulated nodes and the graph catalog
//! 2. Opens a telemetry store if a data directory is given
//! 3. Starts the session manager on a `SimCluster` and offers every node
//! 4. Runs the session until it is running (or has closed)
//! 5. Stops it, or holds it until Ctrl-C, and prints the final status

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use flowgrid_core::{FailurePolicy, FlowgridConfig, SchedulerSettings};
use flowgrid_health::ProbeCheck;
use flowgrid_lifecycle::{NullSink, SessionState, SessionStatus, TelemetrySink};
use flowgrid_scheduler::{
    ClusterFramework, DirectoryCatalog, GraphRef, ManagerParts, SessionManager, SimCluster, SimClusterConfig,
};
use flowgrid_state::{StateStore, TelemetryRecorder};
use tracing::{info, warn};

use crate::inspect::STORE_FILE;

pub struct SimulateArgs {
    pub cluster: PathBuf,
    pub graphs: PathBuf,
    pub graph: String,
    pub name: String,
    pub config: Option<PathBuf>,
    pub max_attempts: Option<u32>,
    pub abort_subtree: bool,
    pub data_dir: Option<PathBuf>,
    pub hold: bool,
    pub timeout: Duration,
}

/// Highest numeric suffix among recorded `sess-NNNN` ids.
fn last_recorded_seq(store: &StateStore) -> anyhow::Result<u64> {
    Ok(store
        .list_sessions()?
        .iter()
        .filter_map(|r| r.id.strip_prefix("sess-")?.parse::<u64>().ok())
        .max()
        .unwrap_or(0))
}

/// Settings from `--config` (or defaults) with command-line overrides applied.
fn resolve_settings(args: &SimulateArgs) -> anyhow::Result<SchedulerSettings> {
    let mut settings = match &args.config {
        Some(path) => FlowgridConfig::from_file(path)?.settings()?,
        None => SchedulerSettings::default(),
    };
    if let Some(attempts) = args.max_attempts {
        anyhow::ensure!(attempts > 0, "--max-attempts must be at least 1");
        settings.max_launch_attempts = attempts;
    }
    if args.abort_subtree {
        settings.failure_policy = FailurePolicy::AbortSubtree;
    }
    Ok(settings)
}

pub async fn run(args: SimulateArgs) -> anyhow::Result<()> {
    info!("flowgrid daemon starting in simulation mode");

    let settings = resolve_settings(&args)?;
    let cluster = SimClusterConfig::from_file(&args.cluster)?;
    info!(nodes = cluster.nodes.len(), "simulated cluster loaded");
    let catalog = Arc::new(DirectoryCatalog::load(&args.graphs)?);
    let graph: GraphRef = args.graph.parse()?;

    // ── Telemetry ──────────────────────────────────────────────
    let mut recorder = None;
    let mut resume_seq = 0;
    let telemetry: Arc<dyn TelemetrySink> = match &args.data_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let path = dir.join(STORE_FILE);
            let store = StateStore::open(&path)?;
            resume_seq = last_recorded_seq(&store)?;
            info!(path = ?path, resume_seq, "telemetry store opened");
            let (handle, _writer) = TelemetryRecorder::spawn(store);
            let handle = Arc::new(handle);
            recorder = Some(handle.clone());
            handle
        }
        None => Arc::new(NullSink),
    };

    // ── Scheduler ──────────────────────────────────────────────
    let (sim, events) = SimCluster::from_config(cluster);
    let sim = Arc::new(sim);
    let framework: Arc<dyn ClusterFramework> = sim.clone();
    let manager = SessionManager::start(
        framework,
        events,
        ManagerParts {
            catalog,
            readiness: Arc::new(ProbeCheck::new(settings.readiness_timeout)),
            telemetry,
            settings,
        },
    )
    .resume_after(resume_seq);

    let id = manager.create_session(&graph, &args.name).await?;
    let offered = sim.offer_all().await;
    info!(session = %id, offers = offered.len(), "session submitted");

    let settled = manager
        .wait_until(
            &id,
            |s| matches!(s.state, SessionState::Running | SessionState::Closed),
            args.timeout,
        )
        .await?;
    match &settled {
        Some(status) => print_status(status)?,
        None => warn!(session = %id, timeout = ?args.timeout, "session did not reach running in time"),
    }

    if args.hold && settled.as_ref().is_some_and(|s| s.state == SessionState::Running) {
        info!(session = %id, "holding session, press Ctrl-C to stop");
        tokio::signal::ctrl_c().await?;
        info!("shutdown signal received");
    }

    let final_status = manager.stop_session(&id).await?;
    print_status(&final_status)?;
    manager.shutdown().await;

    if let Some(recorder) = recorder {
        recorder.flush().await;
    }
    info!(session = %id, state = %final_status.state, "simulation finished");
    Ok(())
}

fn print_status(status: &SessionStatus) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(status)?);
    Ok(())
}
