//! Logical graphs.
//!
//! A [`LogicalGraph`] is validated once at construction: task ids are
//! unique, every edge points at a known task, and `depends_on` is acyclic.
//! The topological order, reverse-dependency index and co-location classes
//! are computed up front so that sessions never re-check the structure.
//!
//! Tasks are addressed by their declaration index inside the graph; the
//! index doubles as the allocator's declaration-order priority.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::descriptor::{LaunchDescriptor, ReadinessDescriptor};
use crate::error::{GraphError, InfeasibleRequest};
use crate::resources::ResourceRequest;
use crate::types::TaskId;

fn default_true() -> bool {
    true
}

fn default_version() -> String {
    "1".to_string()
}

/// One task template in a logical graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogicalTask {
    pub id: TaskId,
    #[serde(default)]
    pub request: ResourceRequest,
    #[serde(default)]
    pub launch: LaunchDescriptor,
    #[serde(default)]
    pub readiness: ReadinessDescriptor,
    /// Tasks that must be READY before this one may start.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<TaskId>,
    /// Tasks that must land on the same node as this one.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub colocate_with: Vec<TaskId>,
    /// Tasks that must not land on the same node as this one.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub anti_colocate_with: Vec<TaskId>,
    /// Whether the session counts as running only once this task is READY.
    #[serde(default = "default_true")]
    pub required: bool,
}

impl LogicalTask {
    pub fn new(id: impl Into<TaskId>) -> Self {
        Self {
            id: id.into(),
            request: ResourceRequest::default(),
            launch: LaunchDescriptor::default(),
            readiness: ReadinessDescriptor::default(),
            depends_on: Vec::new(),
            colocate_with: Vec::new(),
            anti_colocate_with: Vec::new(),
            required: true,
        }
    }

    pub fn with_request(mut self, request: ResourceRequest) -> Self {
        self.request = request;
        self
    }

    pub fn with_launch(mut self, launch: LaunchDescriptor) -> Self {
        self.launch = launch;
        self
    }

    pub fn with_readiness(mut self, readiness: ReadinessDescriptor) -> Self {
        self.readiness = readiness;
        self
    }

    pub fn depends_on(mut self, task: impl Into<TaskId>) -> Self {
        self.depends_on.push(task.into());
        self
    }

    pub fn colocate_with(mut self, task: impl Into<TaskId>) -> Self {
        self.colocate_with.push(task.into());
        self
    }

    pub fn anti_colocate_with(mut self, task: impl Into<TaskId>) -> Self {
        self.anti_colocate_with.push(task.into());
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }
}

/// Serialized form of a logical graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphDefinition {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    pub tasks: Vec<LogicalTask>,
}

/// A validated, immutable logical graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "GraphDefinition", into = "GraphDefinition")]
pub struct LogicalGraph {
    name: String,
    version: String,
    tasks: Vec<LogicalTask>,
    index: HashMap<TaskId, usize>,
    topo: Vec<usize>,
    predecessors: Vec<Vec<usize>>,
    dependents: Vec<Vec<usize>>,
    classes: Vec<Vec<usize>>,
    class_of: Vec<Option<usize>>,
    anti: Vec<Vec<usize>>,
}

impl TryFrom<GraphDefinition> for LogicalGraph {
    type Error = GraphError;

    fn try_from(def: GraphDefinition) -> Result<Self, Self::Error> {
        LogicalGraph::new(def.name, def.version, def.tasks)
    }
}

impl From<LogicalGraph> for GraphDefinition {
    fn from(graph: LogicalGraph) -> Self {
        GraphDefinition {
            name: graph.name,
            version: graph.version,
            tasks: graph.tasks,
        }
    }
}

fn valid_task_id(id: &str) -> bool {
    !id.is_empty() && !id.contains('/') && !id.chars().any(char::is_whitespace)
}

fn resolve(
    index: &HashMap<TaskId, usize>,
    task: &str,
    target: &str,
    unknown: impl Fn(TaskId, TaskId) -> GraphError,
) -> Result<usize, GraphError> {
    index
        .get(target)
        .copied()
        .ok_or_else(|| unknown(task.to_string(), target.to_string()))
}

fn find(parent: &mut [usize], mut i: usize) -> usize {
    while parent[i] != i {
        parent[i] = parent[parent[i]];
        i = parent[i];
    }
    i
}

impl LogicalGraph {
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        tasks: Vec<LogicalTask>,
    ) -> Result<Self, GraphError> {
        let name = name.into();
        let version = version.into();
        if tasks.is_empty() {
            return Err(GraphError::EmptyGraph(name));
        }

        let mut index = HashMap::with_capacity(tasks.len());
        for (i, task) in tasks.iter().enumerate() {
            if !valid_task_id(&task.id) {
                return Err(GraphError::InvalidTaskId(task.id.clone()));
            }
            if index.insert(task.id.clone(), i).is_some() {
                return Err(GraphError::DuplicateTask(task.id.clone()));
            }
        }

        let n = tasks.len();
        let mut predecessors = vec![Vec::new(); n];
        let mut dependents = vec![Vec::new(); n];
        let mut parent: Vec<usize> = (0..n).collect();
        let mut anti = vec![Vec::new(); n];

        for (i, task) in tasks.iter().enumerate() {
            for dep in &task.depends_on {
                if *dep == task.id {
                    return Err(GraphError::SelfDependency(task.id.clone()));
                }
                let d = resolve(&index, &task.id, dep, |task, missing| {
                    GraphError::UnknownDependency { task, missing }
                })?;
                if !predecessors[i].contains(&d) {
                    predecessors[i].push(d);
                    dependents[d].push(i);
                }
            }
            for peer in &task.colocate_with {
                let p = resolve(&index, &task.id, peer, |task, missing| {
                    GraphError::UnknownColocation { task, missing }
                })?;
                let (a, b) = (find(&mut parent, i), find(&mut parent, p));
                if a != b {
                    parent[a.max(b)] = a.min(b);
                }
            }
            for peer in &task.anti_colocate_with {
                let p = resolve(&index, &task.id, peer, |task, missing| {
                    GraphError::UnknownAntiColocation { task, missing }
                })?;
                if p != i && !anti[i].contains(&p) {
                    anti[i].push(p);
                    anti[p].push(i);
                }
            }
        }
        for list in predecessors.iter_mut().chain(dependents.iter_mut()).chain(anti.iter_mut()) {
            list.sort_unstable();
        }

        // Co-location classes: union-find roots with at least two members.
        let mut by_root: HashMap<usize, Vec<usize>> = HashMap::new();
        for i in 0..n {
            let root = find(&mut parent, i);
            by_root.entry(root).or_default().push(i);
        }
        let mut classes: Vec<Vec<usize>> = by_root.into_values().filter(|m| m.len() > 1).collect();
        classes.sort();
        let mut class_of = vec![None; n];
        for (c, members) in classes.iter().enumerate() {
            for &m in members {
                class_of[m] = Some(c);
            }
        }

        for (i, peers) in anti.iter().enumerate() {
            for &p in peers {
                if class_of[i].is_some() && class_of[i] == class_of[p] {
                    return Err(GraphError::ConflictingPlacement {
                        a: tasks[i.min(p)].id.clone(),
                        b: tasks[i.max(p)].id.clone(),
                    });
                }
            }
        }

        // Kahn's algorithm; ready tasks are taken in declaration order.
        let mut indegree: Vec<usize> = predecessors.iter().map(Vec::len).collect();
        let mut ready: BTreeSet<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
        let mut topo = Vec::with_capacity(n);
        while let Some(i) = ready.pop_first() {
            topo.push(i);
            for &d in &dependents[i] {
                indegree[d] -= 1;
                if indegree[d] == 0 {
                    ready.insert(d);
                }
            }
        }
        if topo.len() < n {
            let tasks = (0..n)
                .filter(|&i| indegree[i] > 0)
                .map(|i| tasks[i].id.clone())
                .collect();
            return Err(GraphError::Cycle { tasks });
        }

        Ok(Self {
            name,
            version,
            tasks,
            index,
            topo,
            predecessors,
            dependents,
            classes,
            class_of,
            anti,
        })
    }

    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn tasks(&self) -> &[LogicalTask] {
        &self.tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn task(&self, idx: usize) -> &LogicalTask {
        &self.tasks[idx]
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn get(&self, id: &str) -> Option<&LogicalTask> {
        self.index_of(id).map(|i| &self.tasks[i])
    }

    /// Task indices such that every task follows all of its dependencies.
    pub fn topological_order(&self) -> &[usize] {
        &self.topo
    }

    pub fn topological_ids(&self) -> Vec<&str> {
        self.topo.iter().map(|&i| self.tasks[i].id.as_str()).collect()
    }

    /// Direct `depends_on` targets of a task.
    pub fn predecessors(&self, idx: usize) -> &[usize] {
        &self.predecessors[idx]
    }

    /// Tasks that directly depend on `idx`.
    pub fn dependents(&self, idx: usize) -> &[usize] {
        &self.dependents[idx]
    }

    /// All tasks that transitively depend on `idx`, ascending.
    pub fn descendants(&self, idx: usize) -> Vec<usize> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<usize> = self.dependents[idx].to_vec();
        while let Some(i) = stack.pop() {
            if seen.insert(i) {
                stack.extend_from_slice(&self.dependents[i]);
            }
        }
        seen.into_iter().collect()
    }

    /// Co-location classes with two or more members, each sorted.
    pub fn colocation_classes(&self) -> &[Vec<usize>] {
        &self.classes
    }

    pub fn colocation_class(&self, idx: usize) -> Option<usize> {
        self.class_of[idx]
    }

    /// Tasks that must not share a node with `idx`.
    pub fn anti_colocated(&self, idx: usize) -> &[usize] {
        &self.anti[idx]
    }

    /// Every task whose request can never be satisfied, with the reason.
    pub fn validate_requests(&self) -> Vec<(TaskId, InfeasibleRequest)> {
        self.tasks
            .iter()
            .filter_map(|t| t.request.validate().err().map(|e| (t.id.clone(), e)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(graph: &LogicalGraph, idxs: &[usize]) -> Vec<String> {
        idxs.iter().map(|&i| graph.task(i).id.clone()).collect()
    }

    #[test]
    fn topological_order_respects_dependencies() {
        let graph = LogicalGraph::new(
            "pipeline",
            "1",
            vec![
                LogicalTask::new("sink").depends_on("proc"),
                LogicalTask::new("proc").depends_on("ingest"),
                LogicalTask::new("ingest"),
                LogicalTask::new("monitor"),
            ],
        )
        .unwrap();

        assert_eq!(graph.topological_ids(), vec!["ingest", "monitor", "proc", "sink"]);
        assert_eq!(ids(&graph, graph.dependents(2)), vec!["proc"]);
        assert_eq!(ids(&graph, graph.predecessors(0)), vec!["proc"]);
    }

    #[test]
    fn cycle_is_rejected() {
        let err = LogicalGraph::new(
            "loop",
            "1",
            vec![
                LogicalTask::new("a").depends_on("c"),
                LogicalTask::new("b").depends_on("a"),
                LogicalTask::new("c").depends_on("b"),
                LogicalTask::new("d"),
            ],
        )
        .unwrap_err();
        assert_eq!(
            err,
            GraphError::Cycle {
                tasks: vec!["a".into(), "b".into(), "c".into()]
            }
        );
    }

    #[test]
    fn structural_errors() {
        assert_eq!(
            LogicalGraph::new("g", "1", vec![]).unwrap_err(),
            GraphError::EmptyGraph("g".into())
        );
        assert_eq!(
            LogicalGraph::new("g", "1", vec![LogicalTask::new("a"), LogicalTask::new("a")]).unwrap_err(),
            GraphError::DuplicateTask("a".into())
        );
        assert_eq!(
            LogicalGraph::new("g", "1", vec![LogicalTask::new("a").depends_on("x")]).unwrap_err(),
            GraphError::UnknownDependency {
                task: "a".into(),
                missing: "x".into()
            }
        );
        assert_eq!(
            LogicalGraph::new("g", "1", vec![LogicalTask::new("a").depends_on("a")]).unwrap_err(),
            GraphError::SelfDependency("a".into())
        );
        assert_eq!(
            LogicalGraph::new("g", "1", vec![LogicalTask::new("a/b")]).unwrap_err(),
            GraphError::InvalidTaskId("a/b".into())
        );
        assert!(matches!(
            LogicalGraph::new("g", "1", vec![LogicalTask::new("a").colocate_with("zz")]),
            Err(GraphError::UnknownColocation { .. })
        ));
    }

    #[test]
    fn colocation_classes_are_transitive() {
        let graph = LogicalGraph::new(
            "g",
            "1",
            vec![
                LogicalTask::new("a").colocate_with("b"),
                LogicalTask::new("b"),
                LogicalTask::new("c").colocate_with("b"),
                LogicalTask::new("d"),
                LogicalTask::new("e").colocate_with("d"),
            ],
        )
        .unwrap();

        assert_eq!(graph.colocation_classes(), &[vec![0, 1, 2], vec![3, 4]]);
        assert_eq!(graph.colocation_class(2), Some(0));
        assert_eq!(graph.colocation_class(4), Some(1));
    }

    #[test]
    fn anti_colocation_is_symmetric_and_checked() {
        let graph = LogicalGraph::new(
            "g",
            "1",
            vec![
                LogicalTask::new("a").anti_colocate_with("b"),
                LogicalTask::new("b"),
            ],
        )
        .unwrap();
        assert_eq!(graph.anti_colocated(1), &[0]);

        let err = LogicalGraph::new(
            "g",
            "1",
            vec![
                LogicalTask::new("a").colocate_with("b").anti_colocate_with("b"),
                LogicalTask::new("b"),
            ],
        )
        .unwrap_err();
        assert_eq!(
            err,
            GraphError::ConflictingPlacement {
                a: "a".into(),
                b: "b".into()
            }
        );
    }

    #[test]
    fn descendants_are_transitive() {
        let graph = LogicalGraph::new(
            "g",
            "1",
            vec![
                LogicalTask::new("a"),
                LogicalTask::new("b").depends_on("a"),
                LogicalTask::new("c").depends_on("b"),
                LogicalTask::new("d"),
            ],
        )
        .unwrap();
        assert_eq!(graph.descendants(0), vec![1, 2]);
        assert!(graph.descendants(3).is_empty());
    }

    #[test]
    fn parses_from_json() {
        let json = r#"{
            "name": "capture",
            "tasks": [
                { "id": "ingest", "request": { "scalars": { "millicores": 2000 }, "ports": 1 },
                  "readiness": { "kind": "tcp" } },
                { "id": "writer", "depends_on": ["ingest"], "required": false,
                  "launch": { "image": "writer:2" } }
            ]
        }"#;
        let graph = LogicalGraph::from_json(json).unwrap();
        assert_eq!(graph.version(), "1");
        assert_eq!(graph.get("ingest").unwrap().request.ports, 1);
        assert!(!graph.get("writer").unwrap().required);
        assert_eq!(graph.topological_ids(), vec!["ingest", "writer"]);
    }

    #[test]
    fn json_with_cycle_fails_to_parse() {
        let json = r#"{ "name": "g", "tasks": [
            { "id": "a", "depends_on": ["b"] },
            { "id": "b", "depends_on": ["a"] }
        ] }"#;
        assert!(LogicalGraph::from_json(json).is_err());
    }

    #[test]
    fn validate_requests_lists_offenders() {
        let graph = LogicalGraph::new(
            "g",
            "1",
            vec![
                LogicalTask::new("ok").with_request(ResourceRequest::new().with_cores(100)),
                LogicalTask::new("bad").with_request(ResourceRequest::new().with_ports(70_000)),
            ],
        )
        .unwrap();
        let problems = graph.validate_requests();
        assert_eq!(problems.len(), 1);
        assert_eq!(problems[0].0, "bad");
    }
}
