//! The federated graph: every loaded project's [`TaskGraph`] plus the edges
//! that cross from one project (or instantiation context) into another.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt::{self, Display, Formatter};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::core::normalize_path;
use crate::error::SchedulerError;
use crate::graph::{EdgeKind, TaskGraph, TaskId};
use crate::name::NameTable;
use crate::plugin::NativeRules;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProjectId(pub u32);

impl ProjectId {
    pub const MAIN: ProjectId = ProjectId(1);
    pub const PRELUDE: ProjectId = ProjectId(2);
}

/// Identifies one instantiation of a project: a set of var redefinitions
/// and, for class cast rules, a bound `this`. Allocated by the evaluator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstanceId(pub u32);

/// The context a task is evaluated in. `instance: None` is the project's
/// plain context, without redefinitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskContext {
    pub project: ProjectId,
    pub instance: Option<InstanceId>,
}

impl TaskContext {
    pub fn plain(project: ProjectId) -> Self {
        TaskContext {
            project,
            instance: None,
        }
    }

    /// No instance data: the context of a project's own definitions.
    pub fn is_plain(&self) -> bool {
        self.instance.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GlobalTaskId {
    pub context: TaskContext,
    pub task: TaskId,
}

impl GlobalTaskId {
    pub fn new(context: TaskContext, task: TaskId) -> Self {
        GlobalTaskId { context, task }
    }
}

impl Display for GlobalTaskId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.context.project.0, self.task.index())?;
        if let Some(instance) = self.context.instance {
            write!(f, "@{}", instance.0)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GlobalTaskEdge {
    pub start: GlobalTaskId,
    pub end: GlobalTaskId,
    pub kind: EdgeKind,
}

impl Display for GlobalTaskEdge {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} -{:?}-> {}", self.start, self.kind, self.end)
    }
}

/// Where a project's script lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProjectLocation {
    pub root: Utf8PathBuf,
    pub script_name: String,
}

impl ProjectLocation {
    pub const DEFAULT_SCRIPT: &'static str = "build.bbx";

    pub fn new(root: impl AsRef<Utf8Path>) -> Self {
        Self::with_script(root, Self::DEFAULT_SCRIPT)
    }

    pub fn with_script(root: impl AsRef<Utf8Path>, script_name: impl Into<String>) -> Self {
        ProjectLocation {
            root: normalize_path(root.as_ref()),
            script_name: script_name.into(),
        }
    }

    pub fn script_path(&self) -> Utf8PathBuf {
        self.root.join(&self.script_name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProjectKind {
    Main,
    Prelude,
    Preloaded(String),
    Imported,
}

pub struct Project {
    pub id: ProjectId,
    pub kind: ProjectKind,
    pub location: Option<ProjectLocation>,
    /// Package declared by the script.
    pub package: Option<String>,
    pub names: Arc<NameTable>,
    pub graph: TaskGraph,
    /// Native rule implementations, for built-in projects only.
    pub natives: Option<Arc<dyn NativeRules>>,
}

impl Project {
    /// The package name used for class, enum and rule identities.
    pub fn package_name(&self) -> String {
        if let Some(package) = &self.package {
            return package.clone();
        }
        match (&self.kind, &self.location) {
            (ProjectKind::Main, _) => "main".into(),
            (ProjectKind::Prelude, _) => "prelude".into(),
            (ProjectKind::Preloaded(name), _) => name.clone(),
            (ProjectKind::Imported, Some(location)) => location.root.to_string(),
            (ProjectKind::Imported, None) => format!("project{}", self.id.0),
        }
    }

    /// Base directory that relative paths of this project resolve against.
    pub fn base_dir(&self) -> Option<&Utf8Path> {
        self.location.as_ref().map(|location| location.root.as_path())
    }
}

impl fmt::Debug for Project {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Project")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("location", &self.location)
            .field("package", &self.package)
            .field("nodes", &self.graph.node_count())
            .finish()
    }
}

#[derive(Debug, Default)]
struct GlobalEdges {
    all: HashSet<GlobalTaskEdge>,
    by_start: HashMap<GlobalTaskId, Vec<GlobalTaskEdge>>,
    by_end: HashMap<GlobalTaskId, Vec<GlobalTaskEdge>>,
}

/// All projects known to a run.
///
/// Projects are registered lazily: imports are resolved while the build is
/// already running, so every collection here is behind its own lock and
/// the graph is shared by reference between workers.
#[derive(Debug)]
pub struct GlobalTaskGraph {
    projects: RwLock<BTreeMap<ProjectId, Arc<Project>>>,
    by_location: RwLock<HashMap<ProjectLocation, ProjectId>>,
    by_package: RwLock<HashMap<String, ProjectId>>,
    preloaded: RwLock<HashMap<String, ProjectId>>,
    edges: RwLock<GlobalEdges>,
    next_id: AtomicU32,
}

impl Default for GlobalTaskGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl GlobalTaskGraph {
    pub fn new() -> Self {
        GlobalTaskGraph {
            projects: RwLock::new(BTreeMap::new()),
            by_location: RwLock::new(HashMap::new()),
            by_package: RwLock::new(HashMap::new()),
            preloaded: RwLock::new(HashMap::new()),
            edges: RwLock::new(GlobalEdges::default()),
            next_id: AtomicU32::new(3),
        }
    }

    /// Picks the id a project of `kind` will be registered under.
    pub fn allocate_id(&self, kind: &ProjectKind) -> ProjectId {
        match kind {
            ProjectKind::Main => ProjectId::MAIN,
            ProjectKind::Prelude => ProjectId::PRELUDE,
            _ => ProjectId(self.next_id.fetch_add(1, Ordering::Relaxed)),
        }
    }

    /// Registers `project`. When another project was already registered at
    /// the same location that one wins and is returned instead.
    pub fn add_project(&self, project: Project) -> Arc<Project> {
        let mut by_location = self.by_location.write().unwrap_or_else(PoisonError::into_inner);
        let mut projects = self.projects.write().unwrap_or_else(PoisonError::into_inner);

        if let Some(location) = &project.location
            && let Some(existing) = by_location.get(location).and_then(|id| projects.get(id))
        {
            return existing.clone();
        }

        let project = Arc::new(project);
        if let Some(location) = &project.location {
            by_location.insert(location.clone(), project.id);
        }
        self.by_package
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(project.package_name())
            .or_insert(project.id);
        if let ProjectKind::Preloaded(name) = &project.kind {
            self.preloaded
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(name.clone(), project.id);
        }

        tracing::debug!(id = project.id.0, package = %project.package_name(), "registered project");
        projects.insert(project.id, project.clone());
        project
    }

    pub fn project(&self, id: ProjectId) -> Option<Arc<Project>> {
        self.projects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    pub fn project_at(&self, location: &ProjectLocation) -> Option<Arc<Project>> {
        let id = *self
            .by_location
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(location)?;
        self.project(id)
    }

    pub fn project_by_package(&self, package: &str) -> Option<Arc<Project>> {
        let id = *self
            .by_package
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(package)?;
        self.project(id)
    }

    pub fn preloaded(&self, name: &str) -> Option<Arc<Project>> {
        let id = *self
            .preloaded
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)?;
        self.project(id)
    }

    pub fn project_count(&self) -> usize {
        self.projects.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Adds an edge crossing contexts. Both projects must be registered.
    /// Returns `false` when the edge was already known.
    pub fn add_global_edge(&self, edge: GlobalTaskEdge) -> Result<bool, SchedulerError> {
        for project in [edge.start.context.project, edge.end.context.project] {
            if self.project(project).is_none() {
                return Err(SchedulerError::UnknownProject(project.0));
            }
        }
        if edge.start.context == edge.end.context {
            return Err(SchedulerError::SameContextEdge(edge.to_string()));
        }

        let mut edges = self.edges.write().unwrap_or_else(PoisonError::into_inner);
        if edges.all.contains(&edge) {
            return Ok(false);
        }
        let conflicting = edges
            .by_start
            .get(&edge.start)
            .is_some_and(|known| known.iter().any(|e| e.end == edge.end && e.kind != edge.kind));
        if conflicting {
            return Err(SchedulerError::ConflictingEdge(edge.to_string()));
        }

        edges.all.insert(edge);
        edges.by_start.entry(edge.start).or_default().push(edge);
        edges.by_end.entry(edge.end).or_default().push(edge);
        Ok(true)
    }

    /// Outgoing edges of `id`: the project's local edges, translated into
    /// `id`'s context, followed by global edges starting at `id`.
    pub fn edges_by_start(&self, id: GlobalTaskId) -> Vec<GlobalTaskEdge> {
        let mut out = Vec::new();
        if let Some(project) = self.project(id.context.project) {
            out.extend(project.graph.edges_from(id.task).map(|edge| GlobalTaskEdge {
                start: id,
                end: GlobalTaskId::new(id.context, edge.end),
                kind: edge.kind,
            }));
        }
        let edges = self.edges.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(global) = edges.by_start.get(&id) {
            out.extend(global.iter().copied());
        }
        out
    }

    /// Incoming edges of `id`, see [`GlobalTaskGraph::edges_by_start`].
    pub fn edges_by_end(&self, id: GlobalTaskId) -> Vec<GlobalTaskEdge> {
        let mut out = Vec::new();
        if let Some(project) = self.project(id.context.project) {
            out.extend(project.graph.edges_to(id.task).map(|edge| GlobalTaskEdge {
                start: GlobalTaskId::new(id.context, edge.start),
                end: id,
                kind: edge.kind,
            }));
        }
        let edges = self.edges.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(global) = edges.by_end.get(&id) {
            out.extend(global.iter().copied());
        }
        out
    }

    /// Every node reachable from `roots` over required edges, roots
    /// included.
    pub fn reachable_nodes_from(&self, roots: impl IntoIterator<Item = GlobalTaskId>) -> HashSet<GlobalTaskId> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<_> = roots.into_iter().collect();
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            for edge in self.edges_by_start(id) {
                if edge.kind.is_required() && !seen.contains(&edge.end) {
                    queue.push_back(edge.end);
                }
            }
        }
        seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{AstId, Script};
    use crate::graph::{NodeKey, TaskNode};
    use crate::value::Value;

    fn project(globals: &GlobalTaskGraph, kind: ProjectKind, location: Option<&str>) -> Arc<Project> {
        let mut graph = TaskGraph::new();
        let a = graph
            .add_node(NodeKey::Expr(AstId(1)), TaskNode::Literal(Value::Boolean(true)))
            .unwrap();
        let b = graph
            .add_node(NodeKey::Expr(AstId(2)), TaskNode::Literal(Value::None))
            .unwrap();
        let c = graph
            .add_node(NodeKey::Expr(AstId(3)), TaskNode::Literal(Value::None))
            .unwrap();
        graph.add_edge(a, b, EdgeKind::Value);
        graph.add_edge(a, c, EdgeKind::Reference);

        let script = Script {
            package: None,
            defs: vec![],
        };
        globals.add_project(Project {
            id: globals.allocate_id(&kind),
            kind,
            location: location.map(ProjectLocation::new),
            package: None,
            names: Arc::new(NameTable::build(&script, None).unwrap()),
            graph,
            natives: None,
        })
    }

    fn gid(project: ProjectId, index: usize) -> GlobalTaskId {
        GlobalTaskId::new(TaskContext::plain(project), TaskId::new(index))
    }

    #[test]
    fn test_local_edges_are_translated_into_context() {
        let globals = GlobalTaskGraph::new();
        project(&globals, ProjectKind::Main, Some("/work/main"));

        let instance = GlobalTaskId::new(
            TaskContext {
                project: ProjectId::MAIN,
                instance: Some(InstanceId(4)),
            },
            TaskId::new(0),
        );
        let edges = globals.edges_by_start(instance);
        assert_eq!(edges.len(), 2);
        assert!(edges.iter().all(|edge| edge.end.context == instance.context));

        let reachable = globals.reachable_nodes_from([gid(ProjectId::MAIN, 0)]);
        assert_eq!(reachable.len(), 2, "reference edges are not followed");
    }

    #[test]
    fn test_global_edges() {
        let globals = GlobalTaskGraph::new();
        project(&globals, ProjectKind::Main, Some("/work/main"));
        let lib = project(&globals, ProjectKind::Imported, Some("/work/lib"));
        assert_eq!(lib.id, ProjectId(3));

        let edge = GlobalTaskEdge {
            start: gid(ProjectId::MAIN, 1),
            end: gid(lib.id, 0),
            kind: EdgeKind::Import,
        };
        assert_eq!(globals.add_global_edge(edge), Ok(true));
        assert_eq!(globals.add_global_edge(edge), Ok(false));

        let conflicting = GlobalTaskEdge {
            kind: EdgeKind::Value,
            ..edge
        };
        assert!(matches!(
            globals.add_global_edge(conflicting),
            Err(SchedulerError::ConflictingEdge(_))
        ));

        let same_context = GlobalTaskEdge {
            end: gid(ProjectId::MAIN, 2),
            ..edge
        };
        assert!(matches!(
            globals.add_global_edge(same_context),
            Err(SchedulerError::SameContextEdge(_))
        ));

        let unknown = GlobalTaskEdge {
            end: gid(ProjectId(99), 0),
            ..edge
        };
        assert_eq!(
            globals.add_global_edge(unknown),
            Err(SchedulerError::UnknownProject(99))
        );

        assert_eq!(globals.edges_by_end(gid(lib.id, 0)), vec![edge]);
        let reachable = globals.reachable_nodes_from([gid(ProjectId::MAIN, 1)]);
        assert!(reachable.contains(&gid(lib.id, 1)));
    }

    #[test]
    fn test_same_location_registers_once() {
        let globals = GlobalTaskGraph::new();
        let first = project(&globals, ProjectKind::Imported, Some("/work/lib/./"));
        let second = project(&globals, ProjectKind::Imported, Some("/work/lib"));
        assert_eq!(first.id, second.id);
        assert_eq!(globals.project_count(), 1);
        assert_eq!(
            globals.project_at(&ProjectLocation::new("/work/lib")).map(|p| p.id),
            Some(first.id)
        );
    }
}
