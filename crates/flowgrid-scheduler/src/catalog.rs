//! Graph catalogs — where session requests resolve logical graphs.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use flowgrid_core::LogicalGraph;
use tracing::{debug, info};

use crate::error::{SchedulerError, SchedulerResult};

/// `name` or `name@version`. Without a version the newest one is used.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GraphRef {
    pub name: String,
    pub version: Option<String>,
}

impl GraphRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }
}

impl FromStr for GraphRef {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, version) = match s.split_once('@') {
            Some((name, version)) => (name, Some(version)),
            None => (s, None),
        };
        if name.is_empty() || version.is_some_and(str::is_empty) {
            return Err(SchedulerError::GraphNotFound(s.to_string()));
        }
        Ok(Self {
            name: name.to_string(),
            version: version.map(str::to_string),
        })
    }
}

impl fmt::Display for GraphRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(v) => write!(f, "{}@{v}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

pub trait GraphCatalog: Send + Sync {
    fn get(&self, graph: &GraphRef) -> Option<Arc<LogicalGraph>>;

    /// `(name, version)` of every graph, sorted.
    fn list(&self) -> Vec<(String, String)>;
}

/// Compare dotted versions numerically where both sides are numbers.
fn compare_versions(a: &str, b: &str) -> Ordering {
    let mut left = a.split('.');
    let mut right = b.split('.');
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => {
                let ord = match (x.parse::<u64>(), y.parse::<u64>()) {
                    (Ok(x), Ok(y)) => x.cmp(&y),
                    _ => x.cmp(y),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

/// Graphs registered in memory.
#[derive(Default)]
pub struct MemoryCatalog {
    graphs: RwLock<BTreeMap<String, BTreeMap<String, Arc<LogicalGraph>>>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a graph under its own name and version, replacing any previous one.
    pub fn insert(&self, graph: LogicalGraph) -> Arc<LogicalGraph> {
        let graph = Arc::new(graph);
        if let Ok(mut graphs) = self.graphs.write() {
            graphs
                .entry(graph.name().to_string())
                .or_default()
                .insert(graph.version().to_string(), graph.clone());
        }
        debug!(graph = %graph.name(), version = %graph.version(), "graph registered");
        graph
    }
}

impl GraphCatalog for MemoryCatalog {
    fn get(&self, graph: &GraphRef) -> Option<Arc<LogicalGraph>> {
        let graphs = self.graphs.read().ok()?;
        let versions = graphs.get(&graph.name)?;
        match &graph.version {
            Some(v) => versions.get(v).cloned(),
            None => versions
                .iter()
                .max_by(|(a, _), (b, _)| compare_versions(a, b))
                .map(|(_, g)| g.clone()),
        }
    }

    fn list(&self) -> Vec<(String, String)> {
        let Ok(graphs) = self.graphs.read() else {
            return Vec::new();
        };
        graphs
            .iter()
            .flat_map(|(name, versions)| versions.keys().map(move |v| (name.clone(), v.clone())))
            .collect()
    }
}

/// Graphs loaded from the `*.json` files of a directory.
pub struct DirectoryCatalog {
    inner: MemoryCatalog,
}

impl DirectoryCatalog {
    /// Load every `*.json` file. Any invalid file fails the whole load.
    pub fn load(dir: &Path) -> SchedulerResult<Self> {
        let inner = MemoryCatalog::new();
        let mut paths: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();

        for path in &paths {
            let content = std::fs::read_to_string(path)?;
            let graph = LogicalGraph::from_json(&content).map_err(|e| SchedulerError::Catalog {
                path: path.clone(),
                reason: format!("{e:#}"),
            })?;
            inner.insert(graph);
        }
        info!(dir = %dir.display(), graphs = paths.len(), "graph catalog loaded");
        Ok(Self { inner })
    }
}

impl GraphCatalog for DirectoryCatalog {
    fn get(&self, graph: &GraphRef) -> Option<Arc<LogicalGraph>> {
        self.inner.get(graph)
    }

    fn list(&self) -> Vec<(String, String)> {
        self.inner.list()
    }
}

#[cfg(test)]
mod tests {
    use flowgrid_core::LogicalTask;

    use super::*;

    fn graph(name: &str, version: &str) -> LogicalGraph {
        LogicalGraph::new(name, version, vec![LogicalTask::new("a")]).unwrap()
    }

    #[test]
    fn parses_graph_refs() {
        let r: GraphRef = "capture@2".parse().unwrap();
        assert_eq!(r, GraphRef::new("capture").with_version("2"));
        assert_eq!(r.to_string(), "capture@2");
        assert_eq!("capture".parse::<GraphRef>().unwrap().version, None);
        assert!("capture@".parse::<GraphRef>().is_err());
        assert!("@1".parse::<GraphRef>().is_err());
    }

    #[test]
    fn latest_version_compares_numerically() {
        let catalog = MemoryCatalog::new();
        catalog.insert(graph("capture", "9"));
        catalog.insert(graph("capture", "10"));
        catalog.insert(graph("capture", "1.2"));

        let latest = catalog.get(&GraphRef::new("capture")).unwrap();
        assert_eq!(latest.version(), "10");
        let pinned = catalog.get(&GraphRef::new("capture").with_version("9")).unwrap();
        assert_eq!(pinned.version(), "9");
        assert!(catalog.get(&GraphRef::new("other")).is_none());
        assert_eq!(catalog.list().len(), 3);
    }

    #[test]
    fn directory_catalog_loads_json_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("capture.json"),
            r#"{"name": "capture", "version": "3", "tasks": [{"id": "a"}, {"id": "b", "depends_on": ["a"]}]}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let catalog = DirectoryCatalog::load(dir.path()).unwrap();
        let g = catalog.get(&GraphRef::new("capture")).unwrap();
        assert_eq!(g.len(), 2);
        assert_eq!(catalog.list(), vec![("capture".to_string(), "3".to_string())]);
    }

    #[test]
    fn directory_catalog_rejects_invalid_graph() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("cyclic.json"),
            r#"{"name": "cyclic", "tasks": [{"id": "a", "depends_on": ["b"]}, {"id": "b", "depends_on": ["a"]}]}"#,
        )
        .unwrap();

        let err = DirectoryCatalog::load(dir.path()).err().unwrap();
        assert!(matches!(err, SchedulerError::Catalog { .. }));
    }
}
