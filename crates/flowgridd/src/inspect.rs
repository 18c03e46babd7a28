//! Offline commands: graph validation, config scaffolding, history.

use std::path::Path;

use flowgrid_core::{FlowgridConfig, LogicalGraph};
use flowgrid_lifecycle::Transition;
use flowgrid_state::StateStore;

/// File name of the telemetry store inside a data directory.
pub const STORE_FILE: &str = "flowgrid.redb";

pub fn validate(graph_path: &Path, config: Option<&Path>) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(graph_path)?;
    let graph = LogicalGraph::from_json(&content)?;

    println!("graph {} version {} ({} tasks)", graph.name(), graph.version(), graph.len());
    println!("launch order: {}", graph.topological_ids().join(" → "));

    for class in graph.colocation_classes().iter().filter(|c| c.len() > 1) {
        let members: Vec<&str> = class.iter().map(|&i| graph.task(i).id.as_str()).collect();
        println!("co-located: {{{}}}", members.join(", "));
    }
    for (idx, task) in graph.tasks().iter().enumerate() {
        let apart = graph.anti_colocated(idx);
        if apart.iter().any(|&other| other > idx) {
            let peers: Vec<&str> = apart
                .iter()
                .filter(|&&other| other > idx)
                .map(|&other| graph.task(other).id.as_str())
                .collect();
            println!("kept apart: {} ≠ {}", task.id, peers.join(", "));
        }
    }

    let infeasible = graph.validate_requests();
    for (task, reason) in &infeasible {
        println!("✗ {task}: {reason}");
    }

    if let Some(path) = config {
        let settings = FlowgridConfig::from_file(path)?.settings()?;
        println!("config {}: {settings:?}", path.display());
    }

    if !infeasible.is_empty() {
        anyhow::bail!("{} task(s) can never be placed", infeasible.len());
    }
    println!("✓ {} is valid", graph_path.display());
    Ok(())
}

pub fn init_config() -> anyhow::Result<()> {
    print!("{}", FlowgridConfig::scaffold().to_toml_string()?);
    Ok(())
}

pub fn history(data_dir: &Path, session: Option<&str>, format: &str) -> anyhow::Result<()> {
    let path = data_dir.join(STORE_FILE);
    if !path.exists() {
        anyhow::bail!("no telemetry store at {}", path.display());
    }
    let store = StateStore::open(&path)?;

    let Some(id) = session else {
        let sessions = store.list_sessions()?;
        if format == "json" {
            println!("{}", serde_json::to_string_pretty(&sessions)?);
            return Ok(());
        }
        for record in sessions {
            println!(
                "{}  {:<20} {}@{}  {}  failures={}",
                record.id,
                record.name,
                record.graph,
                record.version,
                record.state,
                record.failures.len()
            );
        }
        return Ok(());
    };

    let record = store
        .get_session(id)?
        .ok_or_else(|| anyhow::anyhow!("session {id} not recorded"))?;
    let transitions = store.transitions_for_session(id)?;
    if format == "json" {
        let mut output = serde_json::Map::new();
        output.insert("session".into(), serde_json::to_value(&record)?);
        output.insert("transitions".into(), serde_json::to_value(&transitions)?);
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("{} ({}) {}@{}: {}", record.id, record.name, record.graph, record.version, record.state);
    for failure in &record.failures {
        println!("  failure {}: {:?} {}", failure.task, failure.kind, failure.reason);
    }
    for t in transitions {
        let reason = t.event.reason.as_deref().unwrap_or("");
        match t.event.transition {
            Transition::Task { task, from, to } => {
                println!("  [{:>4}] {} task {task}: {from} → {to} {reason}", t.seq, t.event.at);
            }
            Transition::Session { from, to } => {
                println!("  [{:>4}] {} session: {from} → {to} {reason}", t.seq, t.event.at);
            }
        }
    }
    Ok(())
}
