//! What tasks evaluate to, and where those results are kept.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use crate::error::EvalError;
use crate::graph::TaskId;
use crate::graph::global::{GlobalTaskId, InstanceId, ProjectId, TaskContext};
use crate::name::Name;
use crate::plugin::RuleIdentity;
use crate::value::{RuleRef, Type, Value};

#[derive(Debug, Clone, PartialEq)]
pub struct ParamDesc {
    pub name: String,
    pub ty: Type,
    pub optional: bool,
    /// Default expression, evaluated in the context of the definition.
    pub default: Option<TaskId>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ImplProvider {
    /// Implemented by the native rule table of this project.
    Native(ProjectId),
    /// Implemented outside the engine, identified by this value.
    Value(Value),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RuleDescriptor {
    /// Context the rule was defined in; defaults are evaluated here.
    pub context: TaskContext,
    pub name: Name,
    pub package: String,
    pub action: bool,
    pub params: Vec<ParamDesc>,
    pub return_type: Type,
    pub implementation: ImplProvider,
    pub class: String,
    pub method: Option<String>,
}

impl RuleDescriptor {
    pub fn identity(&self) -> RuleIdentity {
        RuleIdentity {
            package: self.package.clone(),
            name: self.name.to_string(),
            class: self.class.clone(),
            method: self.method.clone(),
            implementation: match &self.implementation {
                ImplProvider::Native(_) => None,
                ImplProvider::Value(value) => Some(value.clone()),
            },
        }
    }

    pub fn rule_ref(&self) -> RuleRef {
        RuleRef {
            package: self.package.clone(),
            name: self.name.to_string(),
            action: self.action,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DataClassDescriptor {
    pub context: TaskContext,
    pub package: String,
    pub name: Name,
    pub fields: Vec<ParamDesc>,
    /// `(target type, expression)`; the expression sees the instance as `this`.
    pub casts: Vec<(Type, TaskId)>,
}

impl DataClassDescriptor {
    pub fn ty(&self) -> Type {
        Type::DataClass {
            package: self.package.clone(),
            name: self.name.to_string(),
        }
    }
}

/// A resolved import: names are looked up under `prefix` in `project`, and
/// evaluated in `context`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportResult {
    pub project: ProjectId,
    pub context: TaskContext,
    pub prefix: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeResult {
    Value { value: Value, context_free: bool },
    Type(Type),
    Rule(Arc<RuleDescriptor>),
    DataClass(Arc<DataClassDescriptor>),
    Import(Arc<ImportResult>),
}

impl NodeResult {
    pub fn bound(value: Value) -> Self {
        NodeResult::Value {
            value,
            context_free: false,
        }
    }

    pub fn free(value: Value) -> Self {
        NodeResult::Value {
            value,
            context_free: true,
        }
    }

    /// Whether the result is the same in every context of its project.
    pub fn is_context_free(&self) -> bool {
        match self {
            NodeResult::Value { context_free, .. } => *context_free,
            NodeResult::Type(_) => true,
            NodeResult::Rule(_) | NodeResult::DataClass(_) | NodeResult::Import(_) => false,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            NodeResult::Value { .. } => "value",
            NodeResult::Type(_) => "type",
            NodeResult::Rule(_) => "rule",
            NodeResult::DataClass(_) => "data class",
            NodeResult::Import(_) => "import",
        }
    }
}

/// Results of finished tasks.
///
/// Context-free results are stored once per project node and shared by all
/// contexts; everything else is stored per context.
#[derive(Debug, Default)]
pub struct Results {
    free: RwLock<HashMap<(ProjectId, TaskId), NodeResult>>,
    bound: RwLock<HashMap<GlobalTaskId, NodeResult>>,
    failed: RwLock<HashMap<GlobalTaskId, Arc<EvalError>>>,
}

impl Results {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: GlobalTaskId) -> Option<NodeResult> {
        if let Some(result) = self
            .bound
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
        {
            return Some(result.clone());
        }
        self.free
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(id.context.project, id.task))
            .cloned()
    }

    pub fn insert(&self, id: GlobalTaskId, result: NodeResult) {
        self.failed
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        if result.is_context_free() {
            self.free
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert((id.context.project, id.task), result);
        } else {
            self.bound
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(id, result);
        }
    }

    pub fn fail(&self, id: GlobalTaskId, error: Arc<EvalError>) {
        self.failed
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, error);
    }

    pub fn failure(&self, id: GlobalTaskId) -> Option<Arc<EvalError>> {
        self.failed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    /// `Some(Ok)` when finished, `Some(Err)` when failed, `None` while the
    /// task hasn't run.
    pub fn lookup(&self, id: GlobalTaskId) -> Option<Result<NodeResult, Arc<EvalError>>> {
        match self.failure(id) {
            Some(error) => Some(Err(error)),
            None => self.get(id).map(Ok),
        }
    }
}

/// What distinguishes an instance context from its project's plain one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceData {
    pub project: ProjectId,
    /// Var name in the project, mapped to the task holding its new value.
    pub var_redefs: BTreeMap<Name, GlobalTaskId>,
    pub this: Option<Value>,
}

#[derive(Debug, Default)]
struct Registry {
    ids: HashMap<Arc<InstanceData>, InstanceId>,
    data: Vec<Arc<InstanceData>>,
}

/// Interns instance contexts so that equal instantiations share results.
#[derive(Debug, Default)]
pub struct Contexts {
    registry: Mutex<Registry>,
}

impl Contexts {
    pub fn new() -> Self {
        Self::default()
    }

    /// The context for `data`. An instantiation without redefinitions and
    /// without `this` is the project's plain context.
    pub fn intern(&self, data: InstanceData) -> TaskContext {
        let project = data.project;
        if data.var_redefs.is_empty() && data.this.is_none() {
            return TaskContext::plain(project);
        }

        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        let data = Arc::new(data);
        let id = match registry.ids.get(&data) {
            Some(id) => *id,
            None => {
                let id = InstanceId(registry.data.len() as u32);
                registry.data.push(data.clone());
                registry.ids.insert(data, id);
                id
            }
        };

        TaskContext {
            project,
            instance: Some(id),
        }
    }

    pub fn get(&self, context: TaskContext) -> Option<Arc<InstanceData>> {
        let id = context.instance?;
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .data
            .get(id.0 as usize)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gid(project: u32, instance: Option<u32>, task: usize) -> GlobalTaskId {
        GlobalTaskId::new(
            TaskContext {
                project: ProjectId(project),
                instance: instance.map(InstanceId),
            },
            TaskId::new(task),
        )
    }

    #[test]
    fn test_context_free_results_are_shared() {
        let results = Results::new();
        results.insert(gid(1, None, 3), NodeResult::free(Value::string("a")));
        results.insert(gid(1, None, 4), NodeResult::bound(Value::string("b")));

        assert_eq!(
            results.get(gid(1, Some(0), 3)),
            Some(NodeResult::free(Value::string("a")))
        );
        assert_eq!(results.get(gid(1, Some(0), 4)), None);
        assert_eq!(results.get(gid(2, None, 3)), None);
    }

    #[test]
    fn test_failure_wins_lookup() {
        let results = Results::new();
        let id = gid(1, None, 0);
        assert!(results.lookup(id).is_none());

        results.fail(id, Arc::new(EvalError::ThisUnbound));
        assert!(matches!(results.lookup(id), Some(Err(_))));
    }

    #[test]
    fn test_contexts_are_interned() {
        let contexts = Contexts::new();
        let data = |value: &str| InstanceData {
            project: ProjectId(3),
            var_redefs: BTreeMap::from([(Name::parse("version"), gid(1, None, 9))]),
            this: Some(Value::string(value)),
        };

        let a = contexts.intern(data("x"));
        let b = contexts.intern(data("x"));
        let c = contexts.intern(data("y"));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(contexts.get(c).and_then(|d| d.this.clone()), Some(Value::string("y")));

        let plain = contexts.intern(InstanceData {
            project: ProjectId(3),
            var_redefs: BTreeMap::new(),
            this: None,
        });
        assert_eq!(plain, TaskContext::plain(ProjectId(3)));
    }
}
