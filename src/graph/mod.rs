//! Task graphs: one per project, federated by [`global::GlobalTaskGraph`].

pub mod builder;
pub mod global;

use std::collections::HashMap;

use petgraph::Direction;
use petgraph::Graph;
use petgraph::graph::NodeIndex;
use petgraph::visit::EdgeRef;

use crate::ast::AstId;
use crate::error::ConstructionError;
use crate::name::Name;
use crate::value::{Type, Value};

/// Local node id, unique within one project's graph.
pub type TaskId = NodeIndex;

/// Stable identity of a node. Nodes that come straight from the syntax tree
/// are keyed by their [`AstId`]; structural nodes are keyed by their content
/// so that identical ones collapse into one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NodeKey {
    Expr(AstId),
    Type(AstId),
    Def(AstId),
    Basic(Type),
    Coerce { value: TaskId, ty: TaskId },
    Member { target: TaskId, name: String },
    EnumValue { def: TaskId, value: String },
    Imported { import: TaskId, path: Vec<String> },
    Prelude(Vec<String>),
    PreloadedImport(String),
    Native(String),
    ClassType(TaskId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EdgeKind {
    Definition,
    Value,
    Rule,
    Import,
    Type,
    /// Informative only: the start refers to the end without needing its
    /// result first.
    Reference,
    /// Default expressions are evaluated on demand, in the callee's context.
    DefaultValue,
}

impl EdgeKind {
    pub fn is_required(self) -> bool {
        !matches!(self, EdgeKind::Reference | EdgeKind::DefaultValue)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskEdge {
    pub start: TaskId,
    pub end: TaskId,
    pub kind: EdgeKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StrPart {
    Text(String),
    /// Node already coerced to a string.
    Value(TaskId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListItem {
    pub node: TaskId,
    pub spread: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParamNode {
    pub name: String,
    pub ty: TaskId,
    pub optional: bool,
    pub default: Option<TaskId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RuleNode {
    pub name: Name,
    pub action: bool,
    pub params: Vec<ParamNode>,
    pub return_type: TaskId,
    /// A [`TaskNode::NativeImpl`] or an expression whose value identifies
    /// the implementation.
    pub implementation: TaskId,
    pub class: String,
    pub method: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DataClassNode {
    pub name: Name,
    pub fields: Vec<ParamNode>,
    /// `(type, expression)` pairs; expressions are evaluated with `this`.
    pub casts: Vec<(TaskId, TaskId)>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ImportSource {
    /// A built-in plugin, referenced by name.
    Preloaded(String),
    /// A path inside another import of the same script.
    Local { import: TaskId, path: Vec<String> },
    /// An expression evaluating to a project location.
    Expr(TaskId),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImportNode {
    pub name: Name,
    pub source: ImportSource,
    /// Path inside the imported project; empty imports the whole project.
    pub importing: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskNode {
    // expressions
    Literal(Value),
    Str(Vec<StrPart>),
    List(Vec<ListItem>),
    Tuple(Vec<TaskId>),
    NamedTuple(Vec<(String, TaskId)>),
    This,
    Member {
        target: TaskId,
        name: String,
    },
    Merge {
        lhs: TaskId,
        rhs: TaskId,
    },
    Coerce {
        value: TaskId,
        ty: TaskId,
    },
    Call {
        callee: TaskId,
        positional: Vec<TaskId>,
        named: Vec<(String, TaskId)>,
    },
    EnumValue {
        def: TaskId,
        value: String,
    },
    Imported {
        import: TaskId,
        path: Vec<String>,
    },
    Prelude {
        path: Vec<String>,
    },

    // types
    BasicType(Type),
    CollectionType {
        set: bool,
        elem: TaskId,
    },
    TupleType(Vec<TaskId>),
    NamedTupleType(Vec<(String, TaskId)>),
    UnionType(Vec<TaskId>),
    ClassType {
        name: Name,
        superclass: bool,
    },

    // definitions
    Target {
        name: Name,
        value: TaskId,
    },
    Action {
        name: Name,
        body: TaskId,
    },
    Rule(RuleNode),
    NativeImpl {
        class: String,
    },
    DataClass(DataClassNode),
    SuperClass {
        name: Name,
        subs: Vec<Name>,
    },
    Enum {
        name: Name,
        values: Vec<String>,
    },
    Var {
        name: Name,
        ty: TaskId,
        default: Option<TaskId>,
    },
    Import(ImportNode),
}

impl TaskNode {
    /// Short human readable description used in logs and error chains.
    pub fn label(&self) -> String {
        match self {
            TaskNode::Literal(value) => format!("literal {value}"),
            TaskNode::Str(_) => "string".into(),
            TaskNode::List(_) => "list".into(),
            TaskNode::Tuple(_) => "tuple".into(),
            TaskNode::NamedTuple(_) => "named tuple".into(),
            TaskNode::This => "this".into(),
            TaskNode::Member { name, .. } => format!("member .{name}"),
            TaskNode::Merge { .. } => "merge".into(),
            TaskNode::Coerce { .. } => "coercion".into(),
            TaskNode::Call { .. } => "call".into(),
            TaskNode::EnumValue { value, .. } => format!("enum value {value}"),
            TaskNode::Imported { path, .. } => format!("imported {}", path.join(".")),
            TaskNode::Prelude { path } => format!("prelude {}", path.join(".")),
            TaskNode::BasicType(ty) => format!("type {ty}"),
            TaskNode::CollectionType { set: true, .. } => "set type".into(),
            TaskNode::CollectionType { set: false, .. } => "list type".into(),
            TaskNode::TupleType(_) => "tuple type".into(),
            TaskNode::NamedTupleType(_) => "named tuple type".into(),
            TaskNode::UnionType(_) => "union type".into(),
            TaskNode::ClassType { name, .. } => format!("class type {name}"),
            TaskNode::Target { name, .. } => format!("target {name}"),
            TaskNode::Action { name, .. } => format!("action {name}"),
            TaskNode::Rule(rule) => format!("rule {}", rule.name),
            TaskNode::NativeImpl { class } => format!("native {class}"),
            TaskNode::DataClass(class) => format!("class {}", class.name),
            TaskNode::SuperClass { name, .. } => format!("super class {name}"),
            TaskNode::Enum { name, .. } => format!("enum {name}"),
            TaskNode::Var { name, .. } => format!("var {name}"),
            TaskNode::Import(import) => format!("import {}", import.name),
        }
    }
}

/// The graph of one project's script.
///
/// Node slots are reserved by key before their content is known, so that
/// definitions can refer to each other regardless of declaration order.
/// [`TaskGraph::validate`] rejects graphs with slots that were never filled.
#[derive(Debug, Default)]
pub struct TaskGraph {
    graph: Graph<Option<TaskNode>, EdgeKind>,
    keys: HashMap<NodeKey, TaskId>,
    defs: HashMap<Name, TaskId>,
    var_redefs: HashMap<Name, Vec<(Name, TaskId)>>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the id for `key`, reserving an empty slot if it is new.
    pub fn id(&mut self, key: NodeKey) -> TaskId {
        if let Some(&id) = self.keys.get(&key) {
            return id;
        }
        let id = self.graph.add_node(None);
        self.keys.insert(key, id);
        id
    }

    pub fn lookup_key(&self, key: &NodeKey) -> Option<TaskId> {
        self.keys.get(key).copied()
    }

    /// Inserts `node` under `key`. Inserting an equal node again is a no-op,
    /// a different one is a construction bug.
    pub fn add_node(&mut self, key: NodeKey, node: TaskNode) -> Result<TaskId, ConstructionError> {
        let id = self.id(key.clone());
        if let Some(existing) = &self.graph[id] {
            return if *existing == node {
                Ok(id)
            } else {
                Err(ConstructionError::InconsistentNode(format!("{key:?}")))
            };
        }
        self.graph[id] = Some(node);
        Ok(id)
    }

    pub fn add_edge(&mut self, start: TaskId, end: TaskId, kind: EdgeKind) {
        let exists = self
            .graph
            .edges_connecting(start, end)
            .any(|edge| *edge.weight() == kind);
        if !exists {
            self.graph.add_edge(start, end, kind);
        }
    }

    pub fn node(&self, id: TaskId) -> Option<&TaskNode> {
        self.graph.node_weight(id).and_then(Option::as_ref)
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn edges_from(&self, id: TaskId) -> impl Iterator<Item = TaskEdge> + '_ {
        self.graph
            .edges_directed(id, Direction::Outgoing)
            .map(|edge| TaskEdge {
                start: edge.source(),
                end: edge.target(),
                kind: *edge.weight(),
            })
    }

    pub fn edges_to(&self, id: TaskId) -> impl Iterator<Item = TaskEdge> + '_ {
        self.graph
            .edges_directed(id, Direction::Incoming)
            .map(|edge| TaskEdge {
                start: edge.source(),
                end: edge.target(),
                kind: *edge.weight(),
            })
    }

    pub(crate) fn register_def(&mut self, name: Name, id: TaskId) {
        self.defs.insert(name, id);
    }

    /// Finds a definition by its full name.
    pub fn def(&self, name: &Name) -> Option<TaskId> {
        self.defs.get(name).copied()
    }

    pub(crate) fn add_var_redef(&mut self, import: Name, var: Name, value: TaskId) {
        self.var_redefs.entry(import).or_default().push((var, value));
    }

    /// Var redefinitions the script applies to the project bound to `import`.
    pub fn var_redefs(&self, import: &Name) -> &[(Name, TaskId)] {
        self.var_redefs.get(import).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn validate(&self) -> Result<(), ConstructionError> {
        for (key, &id) in &self.keys {
            if self.graph[id].is_none() {
                return Err(ConstructionError::Dangling(format!("{key:?}")));
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for TaskGraph {
    /// Renders the graph as a Mermaid diagram. Dashed arrows are edges that
    /// do not gate scheduling.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "graph LR")?;

        for index in self.graph.node_indices() {
            let label = match &self.graph[index] {
                Some(node) => node.label().replace('"', "\\\""),
                None => "?".to_string(),
            };
            writeln!(f, "    {}[\"{}\"]", index.index(), label)?;
        }

        for edge in self.graph.edge_references() {
            let arrow = if edge.weight().is_required() { "-->" } else { "-.->" };
            writeln!(
                f,
                "    {} {} {}",
                edge.source().index(),
                arrow,
                edge.target().index()
            )?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_node_is_deduplicated() {
        let mut graph = TaskGraph::new();
        let a = graph
            .add_node(NodeKey::Basic(Type::String), TaskNode::BasicType(Type::String))
            .unwrap();
        let b = graph
            .add_node(NodeKey::Basic(Type::String), TaskNode::BasicType(Type::String))
            .unwrap();

        assert_eq!(a, b);
        assert_eq!(graph.node_count(), 1);
    }

    #[test]
    fn test_conflicting_node_is_rejected() {
        let mut graph = TaskGraph::new();
        let key = NodeKey::Expr(AstId(1));
        graph
            .add_node(key.clone(), TaskNode::Literal(Value::Boolean(true)))
            .unwrap();

        let err = graph
            .add_node(key, TaskNode::Literal(Value::Boolean(false)))
            .unwrap_err();
        assert!(matches!(err, ConstructionError::InconsistentNode(_)));
    }

    #[test]
    fn test_reserved_slot_must_be_filled() {
        let mut graph = TaskGraph::new();
        let target = graph.id(NodeKey::Def(AstId(7)));
        let value = graph
            .add_node(NodeKey::Expr(AstId(8)), TaskNode::Literal(Value::None))
            .unwrap();
        graph.add_edge(target, value, EdgeKind::Definition);
        graph.add_edge(target, value, EdgeKind::Definition);

        assert_eq!(graph.edge_count(), 1);
        assert!(matches!(graph.validate(), Err(ConstructionError::Dangling(_))));
    }
}
