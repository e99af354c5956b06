//! Evaluation of single tasks.
//!
//! A task is evaluated from its node and the results of the tasks it depends
//! on. When a result it needs isn't there yet the evaluation stops with
//! [`TaskRunResult::Unfulfilled`] and is simply run again later; evaluation
//! of every node is therefore written to be restartable and side effect
//! free, except for rule invocations, which keep their progress in a
//! [`Suspension`](super::call::Suspension).

use std::cell::Cell;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::sync::{Arc, Mutex, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};

use crate::coerce::{CoercionEnv, Coerced, Need, coerce};
use crate::engine::call::Suspension;
use crate::engine::results::{
    Contexts, DataClassDescriptor, ImplProvider, ImportResult, InstanceData, NodeResult, ParamDesc,
    Results, RuleDescriptor,
};
use crate::engine::register_project;
use crate::error::{CoercionError, ConstructionError, EvalError, SchedulerError};
use crate::graph::builder::BuildPolicy;
use crate::graph::global::{GlobalTaskGraph, GlobalTaskId, Project, ProjectId, ProjectKind, ProjectLocation, TaskContext};
use crate::graph::{EdgeKind, ImportNode, ImportSource, ParamNode, StrPart, TaskId, TaskNode};
use crate::name::{DefRef, ImportResolution, Lookup, Name, Origin, ScopeId};
use crate::plugin::{PluginInvoker, ScriptParser};
use crate::repo::{Repo, TargetId};
use crate::value::{Type, Value};

pub type LongRunning = Box<dyn FnOnce() -> Result<TaskRunResult, EvalError> + Send>;

pub enum TaskRunResult {
    Immediate(NodeResult),
    /// The task has to wait for these; it runs again once they finished.
    Unfulfilled(Vec<(GlobalTaskId, EdgeKind)>),
    /// Work that may block, to be run off the compute pool.
    LongRunning(LongRunning),
}

impl std::fmt::Debug for TaskRunResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskRunResult::Immediate(result) => f.debug_tuple("Immediate").field(result).finish(),
            TaskRunResult::Unfulfilled(needs) => f.debug_tuple("Unfulfilled").field(needs).finish(),
            TaskRunResult::LongRunning(_) => f.write_str("LongRunning"),
        }
    }
}

/// Why an evaluation stopped early.
#[derive(Debug)]
pub(crate) enum Step {
    Wait(Vec<(GlobalTaskId, EdgeKind)>),
    Fail(EvalError),
}

pub(crate) type StepResult<T> = Result<T, Step>;

impl From<EvalError> for Step {
    fn from(err: EvalError) -> Self {
        Step::Fail(err)
    }
}

impl From<CoercionError> for Step {
    fn from(err: CoercionError) -> Self {
        Step::Fail(err.into())
    }
}

impl From<ConstructionError> for Step {
    fn from(err: ConstructionError) -> Self {
        Step::Fail(err.into())
    }
}

pub struct Evaluator {
    pub(crate) globals: Arc<GlobalTaskGraph>,
    pub(crate) results: Results,
    pub(crate) contexts: Contexts,
    pub(crate) repo: Arc<Repo>,
    pub(crate) invoker: Arc<dyn PluginInvoker>,
    pub(crate) parser: Option<Arc<dyn ScriptParser>>,
    pub(crate) env: BTreeMap<String, String>,
    pub(crate) main_base_dir: Utf8PathBuf,
    pub(crate) preloaded: Vec<String>,
    /// Which task runs the rule invocation behind each target.
    pub(crate) claims: Mutex<HashMap<TargetId, GlobalTaskId>>,
    pub(crate) suspended: Mutex<HashMap<GlobalTaskId, Suspension>>,
    /// Targets invoked on behalf of each call task, innermost last.
    pub(crate) call_targets: Mutex<HashMap<GlobalTaskId, Vec<TargetId>>>,
}

impl Evaluator {
    pub(crate) fn new(
        globals: Arc<GlobalTaskGraph>,
        repo: Arc<Repo>,
        invoker: Arc<dyn PluginInvoker>,
        parser: Option<Arc<dyn ScriptParser>>,
        env: BTreeMap<String, String>,
        main_base_dir: Utf8PathBuf,
        preloaded: Vec<String>,
    ) -> Self {
        Evaluator {
            globals,
            results: Results::new(),
            contexts: Contexts::new(),
            repo,
            invoker,
            parser,
            env,
            main_base_dir,
            preloaded,
            claims: Mutex::new(HashMap::new()),
            suspended: Mutex::new(HashMap::new()),
            call_targets: Mutex::new(HashMap::new()),
        }
    }

    pub fn globals(&self) -> &Arc<GlobalTaskGraph> {
        &self.globals
    }

    pub fn results(&self) -> &Results {
        &self.results
    }

    pub fn run_task(self: &Arc<Self>, gid: GlobalTaskId) -> Result<TaskRunResult, EvalError> {
        let suspension = self
            .suspended
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&gid);
        if let Some(suspension) = suspension {
            let this = self.clone();
            return Ok(TaskRunResult::LongRunning(Box::new(move || this.resume(gid, suspension))));
        }

        if let Some(result) = self.results.get(gid) {
            return Ok(TaskRunResult::Immediate(result));
        }

        let project = self.project(gid.context.project)?;
        let node = project
            .graph
            .node(gid.task)
            .ok_or_else(|| ConstructionError::Dangling(gid.to_string()))?;

        match self.eval_node(gid, &project, node) {
            Ok(result) => Ok(result),
            Err(Step::Wait(needs)) => Ok(TaskRunResult::Unfulfilled(needs)),
            Err(Step::Fail(err)) => Err(err),
        }
    }

    pub(crate) fn project(&self, id: ProjectId) -> Result<Arc<Project>, EvalError> {
        self.globals
            .project(id)
            .ok_or(EvalError::Invariant(SchedulerError::UnknownProject(id.0)))
    }

    /// `package:node` description of a task, for error chains and logs.
    pub fn label(&self, gid: GlobalTaskId) -> String {
        match self.globals.project(gid.context.project) {
            Some(project) => {
                let node = project
                    .graph
                    .node(gid.task)
                    .map(TaskNode::label)
                    .unwrap_or_else(|| format!("node {}", gid.task.index()));
                format!("{}:{}", project.package_name(), node)
            }
            None => gid.to_string(),
        }
    }

    pub(crate) fn need(&self, id: GlobalTaskId, kind: EdgeKind) -> StepResult<NodeResult> {
        match self.results.lookup(id) {
            Some(Ok(result)) => Ok(result),
            Some(Err(source)) => Err(Step::Fail(EvalError::Dependency {
                task: self.label(id),
                source,
            })),
            None => Err(Step::Wait(vec![(id, kind)])),
        }
    }

    /// Like [`Evaluator::need`] for several tasks, waiting on all the missing
    /// ones at once.
    pub(crate) fn need_all(
        &self,
        ids: impl IntoIterator<Item = (GlobalTaskId, EdgeKind)>,
    ) -> StepResult<Vec<NodeResult>> {
        let mut out = Vec::new();
        let mut waits = Vec::new();
        for (id, kind) in ids {
            match self.need(id, kind) {
                Ok(result) => out.push(result),
                Err(Step::Wait(more)) => waits.extend(more),
                Err(fail) => return Err(fail),
            }
        }
        if waits.is_empty() { Ok(out) } else { Err(Step::Wait(waits)) }
    }

    /// Values of local nodes, with whether they are all context free.
    fn values(&self, ctx: TaskContext, ids: impl IntoIterator<Item = TaskId>) -> StepResult<(Vec<Value>, bool)> {
        let results = self.need_all(ids.into_iter().map(|id| (GlobalTaskId::new(ctx, id), EdgeKind::Value)))?;
        let mut values = Vec::with_capacity(results.len());
        let mut free = true;
        for result in results {
            let (value, context_free) = as_value(result)?;
            free &= context_free;
            values.push(value);
        }
        Ok((values, free))
    }

    fn local_type(&self, ctx: TaskContext, id: TaskId) -> StepResult<Type> {
        Ok(as_type(self.need(GlobalTaskId::new(ctx, id), EdgeKind::Type)?)?)
    }

    fn eval_node(self: &Arc<Self>, gid: GlobalTaskId, project: &Arc<Project>, node: &TaskNode) -> StepResult<TaskRunResult> {
        let ctx = gid.context;
        let local = |id: TaskId| GlobalTaskId::new(ctx, id);
        let immediate = |result: NodeResult| Ok(TaskRunResult::Immediate(result));

        match node {
            TaskNode::Literal(value) => immediate(NodeResult::free(value.clone())),
            TaskNode::Str(parts) => {
                let ids = parts.iter().filter_map(|part| match part {
                    StrPart::Value(id) => Some(*id),
                    StrPart::Text(_) => None,
                });
                let (values, free) = self.values(ctx, ids)?;
                let mut values = values.into_iter();
                let mut out = String::new();
                for part in parts {
                    match part {
                        StrPart::Text(text) => out.push_str(text),
                        StrPart::Value(_) => match values.next() {
                            Some(Value::String(s)) => out.push_str(&s),
                            Some(other) => out.push_str(&other.to_string()),
                            None => {}
                        },
                    }
                }
                immediate(NodeResult::Value {
                    value: Value::String(out),
                    context_free: free,
                })
            }
            TaskNode::List(items) => {
                let (values, free) = self.values(ctx, items.iter().map(|item| item.node))?;
                let mut out = Vec::with_capacity(values.len());
                for (item, value) in items.iter().zip(values) {
                    match value {
                        Value::List(inner) | Value::Set(inner) if item.spread => out.extend(inner),
                        other if item.spread => {
                            return Err(EvalError::SpreadNonCollection(other.kind().into()).into());
                        }
                        other => out.push(other),
                    }
                }
                immediate(NodeResult::Value {
                    value: Value::List(out),
                    context_free: free,
                })
            }
            TaskNode::Tuple(elems) => {
                let (values, free) = self.values(ctx, elems.iter().copied())?;
                immediate(NodeResult::Value {
                    value: Value::Tuple(values),
                    context_free: free,
                })
            }
            TaskNode::NamedTuple(pairs) => {
                let (values, free) = self.values(ctx, pairs.iter().map(|(_, id)| *id))?;
                let pairs = pairs.iter().map(|(name, _)| name.clone()).zip(values).collect();
                immediate(NodeResult::Value {
                    value: Value::NamedTuple(pairs),
                    context_free: free,
                })
            }
            TaskNode::This => {
                let this = self
                    .contexts
                    .get(ctx)
                    .and_then(|data| data.this.clone())
                    .ok_or(EvalError::ThisUnbound)?;
                immediate(NodeResult::bound(this))
            }
            TaskNode::Member { target, name } => {
                let (value, free) = as_value(self.need(local(*target), EdgeKind::Value)?)?;
                immediate(NodeResult::Value {
                    value: member(&value, name)?,
                    context_free: free,
                })
            }
            TaskNode::Merge { lhs, rhs } => {
                let (values, free) = self.values(ctx, [*lhs, *rhs])?;
                let mut values = values.into_iter();
                let (Some(lhs), Some(rhs)) = (values.next(), values.next()) else {
                    return Err(EvalError::UnexpectedResult {
                        expected: "two operands",
                        found: "fewer".into(),
                    }
                    .into());
                };
                immediate(NodeResult::Value {
                    value: merge(lhs, rhs)?,
                    context_free: free,
                })
            }
            TaskNode::Coerce { value, ty } => {
                let (value, free) = as_value(self.need(local(*value), EdgeKind::Value)?)?;
                let ty = self.local_type(ctx, *ty)?;
                let env = EvalEnv::new(self, project, ctx);
                match coerce(&value, &ty, &env)? {
                    Coerced::Done(value) => immediate(NodeResult::Value {
                        value,
                        context_free: free && !env.touched.get(),
                    }),
                    Coerced::Pending(tasks) => Err(wait_values(tasks)),
                }
            }
            TaskNode::Call {
                callee,
                positional,
                named,
            } => self.eval_call(gid, project, *callee, positional, named),
            TaskNode::EnumValue { def, value } => match self.local_type(ctx, *def)? {
                Type::Enum { package, name } => immediate(NodeResult::free(Value::Enum {
                    package,
                    name,
                    value: value.clone(),
                })),
                other => Err(EvalError::UnexpectedResult {
                    expected: "enum",
                    found: other.to_string(),
                }
                .into()),
            },
            TaskNode::Imported { import, path } => {
                let base = as_import(self.need(local(*import), EdgeKind::Import)?)?;
                immediate(self.resolve_path(&base, path)?)
            }
            TaskNode::Prelude { path } => {
                let base = ImportResult {
                    project: ProjectId::PRELUDE,
                    context: TaskContext::plain(ProjectId::PRELUDE),
                    prefix: Vec::new(),
                };
                immediate(self.resolve_path(&base, path)?)
            }

            TaskNode::BasicType(ty) => immediate(NodeResult::Type(ty.clone())),
            TaskNode::CollectionType { set, elem } => {
                let elem = Box::new(self.local_type(ctx, *elem)?);
                immediate(NodeResult::Type(if *set { Type::Set(elem) } else { Type::List(elem) }))
            }
            TaskNode::TupleType(elems) => {
                let types = self.types(ctx, elems.iter().copied())?;
                immediate(NodeResult::Type(Type::Tuple(types)))
            }
            TaskNode::NamedTupleType(pairs) => {
                let types = self.types(ctx, pairs.iter().map(|(_, id)| *id))?;
                let pairs = pairs.iter().map(|(name, _)| name.clone()).zip(types).collect();
                immediate(NodeResult::Type(Type::NamedTuple(pairs)))
            }
            TaskNode::UnionType(members) => {
                let types = self.types(ctx, members.iter().copied())?;
                immediate(NodeResult::Type(Type::Union(types)))
            }
            TaskNode::ClassType { name, superclass } => {
                let package = project.package_name();
                let name = name.to_string();
                immediate(NodeResult::Type(if *superclass {
                    Type::SuperClass { package, name }
                } else {
                    Type::DataClass { package, name }
                }))
            }

            TaskNode::Target { value, .. } => immediate(self.need(local(*value), EdgeKind::Definition)?),
            TaskNode::Action { body, .. } => immediate(self.need(local(*body), EdgeKind::Definition)?),
            TaskNode::Rule(rule) => {
                let params = self.params(ctx, &rule.params)?;
                let return_type = self.local_type(ctx, rule.return_type)?;
                let implementation = match project.graph.node(rule.implementation) {
                    Some(TaskNode::NativeImpl { .. }) => ImplProvider::Native(project.id),
                    _ => {
                        let result = self.need(local(rule.implementation), EdgeKind::Rule)?;
                        ImplProvider::Value(as_value(result)?.0)
                    }
                };
                immediate(NodeResult::Rule(Arc::new(RuleDescriptor {
                    context: ctx,
                    name: rule.name.clone(),
                    package: project.package_name(),
                    action: rule.action,
                    params,
                    return_type,
                    implementation,
                    class: rule.class.clone(),
                    method: rule.method.clone(),
                })))
            }
            TaskNode::NativeImpl { class } => immediate(NodeResult::free(Value::string(class.clone()))),
            TaskNode::DataClass(class) => {
                let fields = self.params(ctx, &class.fields)?;
                let cast_types = self.types(ctx, class.casts.iter().map(|(ty, _)| *ty))?;
                let casts = cast_types
                    .into_iter()
                    .zip(class.casts.iter().map(|(_, expr)| *expr))
                    .collect();
                immediate(NodeResult::DataClass(Arc::new(DataClassDescriptor {
                    context: ctx,
                    package: project.package_name(),
                    name: class.name.clone(),
                    fields,
                    casts,
                })))
            }
            TaskNode::SuperClass { name, .. } => immediate(NodeResult::Type(Type::SuperClass {
                package: project.package_name(),
                name: name.to_string(),
            })),
            TaskNode::Enum { name, .. } => immediate(NodeResult::Type(Type::Enum {
                package: project.package_name(),
                name: name.to_string(),
            })),
            TaskNode::Var { name, ty, default } => {
                let ty = self.local_type(ctx, *ty)?;
                let redef = self
                    .contexts
                    .get(ctx)
                    .and_then(|data| data.var_redefs.get(name).copied());
                let source = match (redef, default) {
                    (Some(redef), _) => (redef, EdgeKind::Value),
                    (None, Some(default)) => (local(*default), EdgeKind::DefaultValue),
                    (None, None) => return Err(EvalError::VarUnset(name.to_string()).into()),
                };
                let (value, _) = as_value(self.need(source.0, source.1)?)?;
                let env = EvalEnv::new(self, project, ctx);
                match coerce(&value, &ty, &env)? {
                    Coerced::Done(value) => immediate(NodeResult::bound(value)),
                    Coerced::Pending(tasks) => Err(wait_values(tasks)),
                }
            }
            TaskNode::Import(import) => self.eval_import(gid, project, import),
        }
    }

    fn types(&self, ctx: TaskContext, ids: impl IntoIterator<Item = TaskId>) -> StepResult<Vec<Type>> {
        let results = self.need_all(ids.into_iter().map(|id| (GlobalTaskId::new(ctx, id), EdgeKind::Type)))?;
        Ok(results.into_iter().map(as_type).collect::<Result<_, _>>()?)
    }

    fn params(&self, ctx: TaskContext, params: &[ParamNode]) -> StepResult<Vec<ParamDesc>> {
        let types = self.types(ctx, params.iter().map(|param| param.ty))?;
        Ok(params
            .iter()
            .zip(types)
            .map(|(param, ty)| ParamDesc {
                name: param.name.clone(),
                ty,
                optional: param.optional,
                default: param.default,
            })
            .collect())
    }

    /// Resolves `path` inside an import, following further imports and
    /// target members on the way.
    pub(crate) fn resolve_path(&self, base: &ImportResult, path: &[String]) -> StepResult<NodeResult> {
        let mut base = base.clone();
        let mut path = path.to_vec();
        loop {
            let project = self.project(base.project)?;
            let mut tokens = base.prefix.clone();
            tokens.extend(path.iter().cloned());
            if tokens.is_empty() {
                return Ok(NodeResult::Import(Arc::new(base)));
            }

            match project.names.lookup(ScopeId::ROOT, &tokens) {
                Lookup::NamespaceFound(_) => {
                    return Ok(NodeResult::Import(Arc::new(ImportResult { prefix: tokens, ..base })));
                }
                Lookup::Found(def) => {
                    let target = self.def_task(&project, base.context, &def)?;
                    return Ok(match self.need(target, EdgeKind::Import)? {
                        NodeResult::Value { value, .. } => NodeResult::bound(value),
                        other => other,
                    });
                }
                Lookup::ImportRequired { import, remaining } => {
                    let memo = (import.origin == Origin::Local)
                        .then(|| project.names.resolved_import(&import.name, base.context))
                        .flatten();
                    base = match memo {
                        Some(resolution) => ImportResult {
                            project: resolution.project,
                            context: resolution.context,
                            prefix: resolution.prefix,
                        },
                        None => {
                            let target = self.def_task(&project, base.context, &import)?;
                            as_import(self.need(target, EdgeKind::Import)?)?
                        }
                    };
                    path = remaining;
                }
                Lookup::TargetMember { target, remaining } => {
                    let target = self.def_task(&project, base.context, &target)?;
                    let (mut value, _) = as_value(self.need(target, EdgeKind::Import)?)?;
                    for name in &remaining {
                        value = member(&value, name)?;
                    }
                    return Ok(NodeResult::bound(value));
                }
                Lookup::EnumValue { def, value } => {
                    let def = self.def_task(&project, base.context, &def)?;
                    return match as_type(self.need(def, EdgeKind::Import)?)? {
                        Type::Enum { package, name } => Ok(NodeResult::free(Value::Enum { package, name, value })),
                        other => Err(EvalError::UnexpectedResult {
                            expected: "enum",
                            found: other.to_string(),
                        }
                        .into()),
                    };
                }
                Lookup::NotFound => return Err(EvalError::NameNotFound(tokens.join(".")).into()),
            }
        }
    }

    /// The task of a definition found in `project`'s name table, which may
    /// live in the prelude.
    fn def_task(&self, project: &Project, context: TaskContext, def: &DefRef) -> Result<GlobalTaskId, EvalError> {
        let (owner, context) = match def.origin {
            Origin::Local => (None, context),
            Origin::Prelude => (
                Some(self.project(ProjectId::PRELUDE)?),
                TaskContext::plain(ProjectId::PRELUDE),
            ),
        };
        let graph = &owner.as_deref().unwrap_or(project).graph;
        let task = graph
            .def(&def.name)
            .ok_or_else(|| EvalError::NameNotFound(def.name.to_string()))?;
        Ok(GlobalTaskId::new(context, task))
    }

    fn eval_import(
        self: &Arc<Self>,
        gid: GlobalTaskId,
        project: &Arc<Project>,
        import: &ImportNode,
    ) -> StepResult<TaskRunResult> {
        let ctx = gid.context;
        let base = match &import.source {
            ImportSource::Preloaded(name) => {
                let plugin = self
                    .globals
                    .preloaded(name)
                    .ok_or_else(|| EvalError::Import(format!("unknown plugin `{name}`")))?;
                ImportResult {
                    project: plugin.id,
                    context: TaskContext::plain(plugin.id),
                    prefix: Vec::new(),
                }
            }
            ImportSource::Local { import: inner, path } => {
                let inner = as_import(self.need(GlobalTaskId::new(ctx, *inner), EdgeKind::Import)?)?;
                as_import(self.resolve_path(&inner, path)?)?
            }
            ImportSource::Expr(expr) => {
                let (value, _) = as_value(self.need(GlobalTaskId::new(ctx, *expr), EdgeKind::Value)?)?;
                let base_dir = project.base_dir().unwrap_or(&self.main_base_dir);
                let location = location_of(&value, base_dir)?;
                match self.globals.project_at(&location) {
                    Some(imported) => ImportResult {
                        project: imported.id,
                        context: TaskContext::plain(imported.id),
                        prefix: Vec::new(),
                    },
                    None => {
                        let this = self.clone();
                        return Ok(TaskRunResult::LongRunning(Box::new(move || {
                            this.load_project(location)?;
                            this.run_task(gid)
                        })));
                    }
                }
            }
        };

        let base = ImportResult {
            context: self.with_redefs(project, ctx, &import.name, &base),
            ..base
        };
        project.names.memoize_import(
            import.name.clone(),
            ctx,
            ImportResolution {
                project: base.project,
                context: base.context,
                prefix: base.prefix.clone(),
            },
        );

        let result = if import.importing.is_empty() {
            NodeResult::Import(Arc::new(base))
        } else {
            self.resolve_path(&base, &import.importing)?
        };
        Ok(TaskRunResult::Immediate(result))
    }

    /// The context the project behind `import` is evaluated in, given the
    /// var redefinitions `importer` applies to it.
    fn with_redefs(&self, importer: &Project, ctx: TaskContext, import: &Name, base: &ImportResult) -> TaskContext {
        let redefs = importer.graph.var_redefs(import);
        if redefs.is_empty() {
            return base.context;
        }

        let mut data = match self.contexts.get(base.context) {
            Some(data) => (*data).clone(),
            None => InstanceData {
                project: base.project,
                var_redefs: BTreeMap::new(),
                this: None,
            },
        };
        for (var, value) in redefs {
            let mut tokens = base.prefix.clone();
            tokens.extend(var.tokens().iter().cloned());
            data.var_redefs.insert(Name::new(tokens), GlobalTaskId::new(ctx, *value));
        }
        self.contexts.intern(data)
    }

    fn load_project(&self, location: ProjectLocation) -> Result<Arc<Project>, EvalError> {
        let parser = self.parser.as_ref().ok_or_else(|| {
            EvalError::Import(format!("no script parser configured, can't load {}", location.root))
        })?;
        let path = location.script_path();
        let source = fs::read_to_string(&path).map_err(|err| EvalError::Import(format!("{path}: {err}")))?;
        let script = parser
            .parse(&location, &source)
            .map_err(|err| EvalError::Import(format!("{path}: {err:#}")))?;

        tracing::info!(root = %location.root, "loading imported project");
        let policy = BuildPolicy {
            native_allowed: false,
            preloaded: self.preloaded.clone(),
        };
        let prelude = self.globals.project(ProjectId::PRELUDE).map(|prelude| prelude.names.clone());
        let project = register_project(&self.globals, ProjectKind::Imported, Some(location), &script, prelude, &policy, None)?;
        Ok(project)
    }

    /// Drops the in-flight rule invocation of a task that won't run again.
    pub(crate) fn abandon(&self, gid: GlobalTaskId) {
        let suspension = self
            .suspended
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&gid);
        if let Some(suspension) = suspension {
            suspension.fail(&self.repo, "a dependency failed");
        }
    }

    /// The target whose object directory holds the output of goal `gid`.
    pub(crate) fn goal_target(&self, gid: GlobalTaskId) -> Option<TargetId> {
        let project = self.globals.project(gid.context.project)?;
        let value = match project.graph.node(gid.task)? {
            TaskNode::Target { value, .. } | TaskNode::Action { body: value, .. } => *value,
            _ => return None,
        };
        self.call_targets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&GlobalTaskId::new(gid.context, value))
            .and_then(|targets| targets.last().copied())
    }

    pub(crate) fn record_target(&self, gid: GlobalTaskId, target: TargetId) {
        self.call_targets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(gid)
            .or_default()
            .push(target);
    }
}

pub(crate) fn wait_values(tasks: Vec<GlobalTaskId>) -> Step {
    Step::Wait(tasks.into_iter().map(|task| (task, EdgeKind::Value)).collect())
}

/// Reads a task result as a value, with whether it is context free.
pub(crate) fn as_value(result: NodeResult) -> Result<(Value, bool), EvalError> {
    match result {
        NodeResult::Value { value, context_free } => Ok((value, context_free)),
        NodeResult::Type(ty) => Ok((Value::Type(ty), true)),
        NodeResult::Rule(rule) => Ok((Value::Rule(rule.rule_ref()), false)),
        NodeResult::DataClass(class) => Ok((Value::Type(class.ty()), false)),
        NodeResult::Import(_) => Err(EvalError::UnexpectedResult {
            expected: "value",
            found: "import".into(),
        }),
    }
}

pub(crate) fn as_type(result: NodeResult) -> Result<Type, EvalError> {
    match result {
        NodeResult::Type(ty) => Ok(ty),
        NodeResult::DataClass(class) => Ok(class.ty()),
        NodeResult::Value {
            value: Value::Type(ty), ..
        } => Ok(ty),
        other => Err(EvalError::UnexpectedResult {
            expected: "type",
            found: other.kind().into(),
        }),
    }
}

fn as_import(result: NodeResult) -> Result<ImportResult, EvalError> {
    match result {
        NodeResult::Import(import) => Ok((*import).clone()),
        other => Err(EvalError::UnexpectedResult {
            expected: "import",
            found: other.kind().into(),
        }),
    }
}

fn member(value: &Value, name: &str) -> Result<Value, EvalError> {
    match value {
        Value::ClassInstance { .. } | Value::NamedTuple(_) => {
            value.member(name).cloned().ok_or_else(|| EvalError::NoSuchMember {
                member: name.into(),
                value: value.to_string(),
            })
        }
        other => Err(EvalError::NotAClassOrTuple(other.kind().into())),
    }
}

/// `lhs + rhs`.
fn merge(lhs: Value, rhs: Value) -> Result<Value, EvalError> {
    match (lhs, rhs) {
        (Value::String(a), Value::String(b)) => Ok(Value::String(a + &b)),
        (Value::Set(a), Value::List(b) | Value::Set(b)) => Ok(Value::set(a.into_iter().chain(b))),
        (Value::List(mut a), Value::List(b) | Value::Set(b)) => {
            a.extend(b);
            Ok(Value::List(a))
        }
        (Value::NamedTuple(mut pairs), Value::NamedTuple(overrides)) => {
            for (name, value) in overrides {
                match pairs.iter_mut().find(|(k, _)| *k == name) {
                    Some(slot) => slot.1 = value,
                    None => pairs.push((name, value)),
                }
            }
            Ok(Value::NamedTuple(pairs))
        }
        (
            Value::ClassInstance {
                package,
                class,
                mut fields,
            },
            Value::NamedTuple(overrides),
        ) => {
            fields.extend(overrides);
            Ok(Value::ClassInstance { package, class, fields })
        }
        (
            Value::ClassInstance {
                package,
                class,
                mut fields,
            },
            Value::ClassInstance {
                package: other_package,
                class: other_class,
                fields: overrides,
            },
        ) if package == other_package && class == other_class => {
            fields.extend(overrides);
            Ok(Value::ClassInstance { package, class, fields })
        }
        (lhs, rhs) => Err(EvalError::UnexpectedResult {
            expected: "operands that can be merged",
            found: format!("{} + {}", lhs.kind(), rhs.kind()),
        }),
    }
}

/// Where an import expression points: a directory, relative to the
/// importing project.
fn location_of(value: &Value, base_dir: &Utf8Path) -> Result<ProjectLocation, EvalError> {
    let path = match value {
        Value::String(path) => Utf8PathBuf::from(path),
        Value::Path(path) | Value::Directory(path) => path.clone(),
        other => {
            return Err(EvalError::Import(format!(
                "expected a project directory, found {}",
                other.kind()
            )));
        }
    };
    let path = if path.is_relative() { base_dir.join(path) } else { path };
    Ok(ProjectLocation::new(path))
}

/// Coercion environment of one evaluation, in the context of `project`.
pub(crate) struct EvalEnv<'a> {
    evaluator: &'a Evaluator,
    project: &'a Project,
    context: TaskContext,
    /// Set once the coercion read another task's result; such coercions
    /// aren't context free.
    pub(crate) touched: Cell<bool>,
}

impl<'a> EvalEnv<'a> {
    pub(crate) fn new(evaluator: &'a Evaluator, project: &'a Project, context: TaskContext) -> Self {
        EvalEnv {
            evaluator,
            project,
            context,
            touched: Cell::new(false),
        }
    }

    fn class_project(&self, package: &str) -> Option<Arc<Project>> {
        self.evaluator.globals.project_by_package(package)
    }

    fn lookup_value(&self, task: GlobalTaskId) -> Result<Need<Value>, CoercionError> {
        match self.evaluator.results.lookup(task) {
            Some(Ok(result)) => as_value(result).map(|(value, _)| Need::Ready(value)).map_err(|err| CoercionError {
                value: self.evaluator.label(task),
                ty: "value".into(),
                reason: err.to_string(),
            }),
            Some(Err(err)) => Err(CoercionError {
                value: self.evaluator.label(task),
                ty: "value".into(),
                reason: err.to_string(),
            }),
            None => Ok(Need::Pending(task)),
        }
    }
}

fn unknown_class(package: &str, name: &str, reason: &str) -> CoercionError {
    CoercionError {
        value: "class instance".into(),
        ty: format!("{package}:{name}"),
        reason: reason.into(),
    }
}

impl CoercionEnv for EvalEnv<'_> {
    fn project_root(&self) -> Option<&Utf8Path> {
        Some(self.project.base_dir().unwrap_or(&self.evaluator.main_base_dir))
    }

    fn data_class(&self, package: &str, name: &str) -> Result<Need<Arc<DataClassDescriptor>>, CoercionError> {
        self.touched.set(true);
        let project = self
            .class_project(package)
            .ok_or_else(|| unknown_class(package, name, "unknown package"))?;
        let task = project
            .graph
            .def(&Name::parse(name))
            .ok_or_else(|| unknown_class(package, name, "unknown class"))?;
        let gid = GlobalTaskId::new(TaskContext::plain(project.id), task);
        match self.evaluator.results.get(gid) {
            Some(NodeResult::DataClass(class)) => Ok(Need::Ready(class)),
            Some(_) => Err(unknown_class(package, name, "not a data class")),
            None => Ok(Need::Pending(gid)),
        }
    }

    fn super_class_subs(&self, package: &str, name: &str) -> Option<Vec<Name>> {
        let project = self.class_project(package)?;
        match project.graph.node(project.graph.def(&Name::parse(name))?)? {
            TaskNode::SuperClass { subs, .. } => Some(subs.clone()),
            _ => None,
        }
    }

    fn enum_values(&self, package: &str, name: &str) -> Option<Vec<String>> {
        let project = self.class_project(package)?;
        match project.graph.node(project.graph.def(&Name::parse(name))?)? {
            TaskNode::Enum { values, .. } => Some(values.clone()),
            _ => None,
        }
    }

    fn field_default(&self, class: &DataClassDescriptor, field: &str) -> Result<Need<Value>, CoercionError> {
        self.touched.set(true);
        let default = class
            .fields
            .iter()
            .find(|param| param.name == field)
            .and_then(|param| param.default)
            .ok_or_else(|| unknown_class(&class.package, &class.name.to_string(), "field has no default"))?;
        self.lookup_value(GlobalTaskId::new(class.context, default))
    }

    fn cast(&self, class: &DataClassDescriptor, index: usize, instance: &Value) -> Result<Need<Value>, CoercionError> {
        self.touched.set(true);
        let Some((_, expr)) = class.casts.get(index) else {
            return Err(unknown_class(&class.package, &class.name.to_string(), "no such cast"));
        };
        let var_redefs = self
            .evaluator
            .contexts
            .get(class.context)
            .map(|data| data.var_redefs.clone())
            .unwrap_or_default();
        let context = self.evaluator.contexts.intern(InstanceData {
            project: class.context.project,
            var_redefs,
            this: Some(instance.clone()),
        });
        tracing::trace!(caller = ?self.context, class = %class.name, "evaluating cast");
        self.lookup_value(GlobalTaskId::new(context, *expr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge() {
        let list = |items: &[&str]| Value::List(items.iter().map(|s| Value::string(*s)).collect());
        assert_eq!(merge(list(&["a"]), list(&["b", "a"])).unwrap(), list(&["a", "b", "a"]));
        assert_eq!(
            merge(Value::set([Value::string("a")]), list(&["b", "a"])).unwrap(),
            Value::Set(vec![Value::string("a"), Value::string("b")])
        );
        assert_eq!(
            merge(Value::string("ab"), Value::string("cd")).unwrap(),
            Value::string("abcd")
        );

        let instance = Value::ClassInstance {
            package: "main".into(),
            class: "Pair".into(),
            fields: BTreeMap::from([
                ("a".to_string(), Value::string("1")),
                ("b".to_string(), Value::string("2")),
            ]),
        };
        let merged = merge(
            instance.clone(),
            Value::NamedTuple(vec![("b".into(), Value::string("3"))]),
        )
        .unwrap();
        assert_eq!(merged.member("a"), Some(&Value::string("1")));
        assert_eq!(merged.member("b"), Some(&Value::string("3")));

        assert!(matches!(
            merge(instance, Value::Boolean(true)),
            Err(EvalError::UnexpectedResult { .. })
        ));
    }

    #[test]
    fn test_member_access_errors() {
        let tuple = Value::NamedTuple(vec![("a".into(), Value::Boolean(true))]);
        assert_eq!(member(&tuple, "a").unwrap(), Value::Boolean(true));
        assert!(matches!(member(&tuple, "b"), Err(EvalError::NoSuchMember { .. })));
        assert!(matches!(
            member(&Value::string("x"), "a"),
            Err(EvalError::NotAClassOrTuple(_))
        ));
    }

    #[test]
    fn test_import_locations_resolve_against_the_importer() {
        let base = Utf8Path::new("/work/main");
        assert_eq!(
            location_of(&Value::string("../lib"), base).unwrap(),
            ProjectLocation::new("/work/lib")
        );
        assert_eq!(
            location_of(&Value::Directory("/opt/plugin".into()), base).unwrap(),
            ProjectLocation::new("/opt/plugin")
        );
        assert!(location_of(&Value::Boolean(true), base).is_err());
    }
}
