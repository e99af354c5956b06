//! Calls: data class construction and rule invocation.
//!
//! A rule invocation is identified by its [`TargetId`]. Within one run every
//! target is built at most once: the first task to get there claims it, the
//! others wait for its result. Rule implementations may ask for more work
//! before they finish (another rule call, a directory lock); the chain of
//! unfinished invocations of one task is kept as a stack of [`Frame`]s and
//! parked in a [`Suspension`] whenever the task has to wait.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError};

use crate::ast::split_dotted;
use crate::coerce::{CoercionEnv, Coerced, coerce};
use crate::engine::eval::{EvalEnv, Evaluator, Step, StepResult, TaskRunResult, as_value, wait_values};
use crate::engine::results::{DataClassDescriptor, ImplProvider, ImportResult, NodeResult, ParamDesc, RuleDescriptor};
use crate::error::{EvalError, RepoError};
use crate::graph::global::{GlobalTaskId, Project, TaskContext};
use crate::graph::{EdgeKind, TaskId};
use crate::name::Name;
use crate::plugin::{BuildContext, PluginReturn, ThenWith};
use crate::repo::{InputHashes, ObjectHash, Repo, StartedTarget, TargetId, TargetIdData};
use crate::value::{RuleRef, Value};

/// One rule invocation in progress.
pub(crate) struct Frame {
    target: TargetId,
    desc: Arc<RuleDescriptor>,
    transient: bool,
    /// Whether the task's result may be shared by all contexts. Only read
    /// on the bottom frame.
    context_free: bool,
    /// Continuation of this frame's implementation, waiting for the result
    /// of the frame above it.
    then: Option<ThenWith>,
}

pub(crate) enum Pending {
    /// The returned value still has to be coerced to the return type.
    Drive(Value),
    /// A nested call still has to be resolved.
    Nested {
        rule: String,
        args: BTreeMap<String, Value>,
    },
}

/// The invocations of a task that had to wait, innermost at `top`.
pub(crate) struct Suspension {
    top: Frame,
    parents: Vec<Frame>,
    pending: Pending,
}

impl Suspension {
    pub(crate) fn fail(&self, repo: &Repo, message: &str) {
        fail_frames(repo, &self.top, &self.parents, message);
    }
}

fn fail_frames(repo: &Repo, top: &Frame, parents: &[Frame], message: &str) {
    for frame in std::iter::once(top).chain(parents) {
        if !frame.desc.action {
            repo.target_failed(frame.target, message);
        }
    }
}

/// Matches call arguments to parameters. Defaults are not applied here.
pub(crate) fn organize(
    params: &[ParamDesc],
    positional: Vec<Value>,
    named: Vec<(String, Value)>,
) -> Result<BTreeMap<String, Value>, EvalError> {
    if positional.len() > params.len() {
        return Err(EvalError::TooManyPositional {
            expected: params.len(),
            got: positional.len(),
        });
    }

    let unknown: Vec<_> = named
        .iter()
        .filter(|(name, _)| !params.iter().any(|param| &param.name == name))
        .map(|(name, _)| name.as_str())
        .collect();
    if !unknown.is_empty() {
        return Err(EvalError::UnknownParameters(unknown.join(", ")));
    }

    let mut args: BTreeMap<_, _> = params
        .iter()
        .zip(positional)
        .map(|(param, value)| (param.name.clone(), value))
        .collect();
    for (name, value) in named {
        if args.contains_key(&name) {
            return Err(EvalError::DuplicateArgument(name));
        }
        args.insert(name, value);
    }
    Ok(args)
}

impl Evaluator {
    pub(crate) fn eval_call(
        self: &Arc<Self>,
        gid: GlobalTaskId,
        project: &Arc<Project>,
        callee: TaskId,
        positional: &[TaskId],
        named: &[(String, TaskId)],
    ) -> StepResult<TaskRunResult> {
        let ctx = gid.context;
        let callee = self.need(GlobalTaskId::new(ctx, callee), EdgeKind::Rule)?;
        let ids = positional.iter().chain(named.iter().map(|(_, id)| id));
        let results = self.need_all(ids.map(|id| (GlobalTaskId::new(ctx, *id), EdgeKind::Value)))?;
        let mut values = Vec::with_capacity(results.len());
        let mut free = true;
        for result in results {
            let (value, context_free) = as_value(result)?;
            free &= context_free;
            values.push(value);
        }
        let named_values = values.split_off(positional.len());
        let named = named.iter().map(|(name, _)| name.clone()).zip(named_values).collect();

        // descriptors defined in a plain context behave the same for every caller
        match callee {
            NodeResult::Rule(desc) => {
                let free = free && desc.context.is_plain();
                self.call_rule(gid, project, desc, values, named, free)
            }
            NodeResult::DataClass(desc) => {
                let env = EvalEnv::new(self, project, ctx);
                let instance = self.construct(&desc, values, named, &env)?;
                Ok(TaskRunResult::Immediate(NodeResult::Value {
                    value: instance,
                    context_free: free && desc.context.is_plain(),
                }))
            }
            NodeResult::Value {
                value: Value::Rule(rule),
                context_free,
            } => {
                let desc = self.rule_by_ref(&rule)?;
                let free = free && context_free && desc.context.is_plain();
                self.call_rule(gid, project, desc, values, named, free)
            }
            other => Err(EvalError::NotCallable(other.kind().into()).into()),
        }
    }

    /// The descriptor of a rule passed around as a value.
    fn rule_by_ref(&self, rule: &RuleRef) -> StepResult<Arc<RuleDescriptor>> {
        let project = self
            .globals
            .project_by_package(&rule.package)
            .ok_or_else(|| EvalError::NameNotFound(format!("{}:{}", rule.package, rule.name)))?;
        let task = project
            .graph
            .def(&Name::parse(&rule.name))
            .ok_or_else(|| EvalError::NameNotFound(format!("{}:{}", rule.package, rule.name)))?;
        match self.need(GlobalTaskId::new(TaskContext::plain(project.id), task), EdgeKind::Rule)? {
            NodeResult::Rule(desc) => Ok(desc),
            other => Err(EvalError::NotCallable(other.kind().into()).into()),
        }
    }

    /// Builds a class instance; field defaults and field coercion are left
    /// to the coercion to the class type.
    fn construct(
        &self,
        desc: &DataClassDescriptor,
        positional: Vec<Value>,
        named: Vec<(String, Value)>,
        env: &dyn CoercionEnv,
    ) -> StepResult<Value> {
        let fields = organize(&desc.fields, positional, named)?;
        let instance = Value::ClassInstance {
            package: desc.package.clone(),
            class: desc.name.to_string(),
            fields,
        };
        match coerce(&instance, &desc.ty(), env)? {
            Coerced::Done(value) => Ok(value),
            Coerced::Pending(tasks) => Err(wait_values(tasks)),
        }
    }

    /// Fills in defaults and coerces every argument to its parameter type.
    fn complete_args(
        &self,
        desc: &RuleDescriptor,
        mut args: BTreeMap<String, Value>,
        env: &dyn CoercionEnv,
    ) -> StepResult<BTreeMap<String, Value>> {
        let mut out = BTreeMap::new();
        let mut waits = Vec::new();
        let mut missing = Vec::new();

        for param in &desc.params {
            let value = match (args.remove(&param.name), param.default) {
                (Some(value), _) => value,
                (None, Some(default)) => {
                    let default = GlobalTaskId::new(desc.context, default);
                    match self.need(default, EdgeKind::DefaultValue) {
                        Ok(result) => as_value(result)?.0,
                        Err(Step::Wait(more)) => {
                            waits.extend(more);
                            continue;
                        }
                        Err(fail) => return Err(fail),
                    }
                }
                (None, None) if param.optional => Value::None,
                (None, None) => {
                    missing.push(param.name.as_str());
                    continue;
                }
            };

            match coerce(&value, &param.ty, env)? {
                Coerced::Done(value) => {
                    out.insert(param.name.clone(), value);
                }
                Coerced::Pending(tasks) => waits.extend(tasks.into_iter().map(|task| (task, EdgeKind::Value))),
            }
        }

        if !missing.is_empty() {
            return Err(EvalError::MissingParameters(missing.join(", ")).into());
        }
        if !waits.is_empty() {
            return Err(Step::Wait(waits));
        }
        Ok(out)
    }

    fn target_of(caller: &Project, desc: &RuleDescriptor, args: BTreeMap<String, Value>) -> Result<(TargetIdData, TargetId), EvalError> {
        let data = TargetIdData {
            source: caller.package_name(),
            rule: desc.identity(),
            args,
        };
        let target = data
            .target_id()
            .map_err(|err| RepoError::Encode(err.to_string()))?;
        Ok((data, target))
    }

    fn call_rule(
        self: &Arc<Self>,
        gid: GlobalTaskId,
        project: &Arc<Project>,
        desc: Arc<RuleDescriptor>,
        positional: Vec<Value>,
        named: Vec<(String, Value)>,
        context_free: bool,
    ) -> StepResult<TaskRunResult> {
        let args = organize(&desc.params, positional, named)?;
        let env = EvalEnv::new(self, project, gid.context);
        let args = self.complete_args(&desc, args, &env)?;
        let (data, target) = Self::target_of(project, &desc, args)?;

        if !desc.action
            && let Some(value) = self.claim(gid, target)?
        {
            self.record_target(gid, target);
            return Ok(TaskRunResult::Immediate(NodeResult::Value { value, context_free }));
        }

        let this = self.clone();
        let caller = project.clone();
        Ok(TaskRunResult::LongRunning(Box::new(move || {
            this.invoke_frame(gid, Vec::new(), &caller, desc, data, target, context_free)
        })))
    }

    /// Claims `target` for `gid`. `None` means `gid` builds it; when another
    /// task got there first this waits for it and returns the value it
    /// recorded.
    fn claim(&self, gid: GlobalTaskId, target: TargetId) -> StepResult<Option<Value>> {
        let owner = {
            let mut claims = self.claims.lock().unwrap_or_else(PoisonError::into_inner);
            *claims.entry(target).or_insert(gid)
        };
        if owner == gid {
            return Ok(None);
        }
        if let Some(value) = self.repo.run_result(target) {
            return Ok(Some(value));
        }

        tracing::debug!(%target, %owner, "target is built by another task");
        self.need(owner, EdgeKind::Value)?;
        // a finished owner that left no result of this run reused an older
        // one, which reusing again is as cheap
        Ok(self.repo.run_result(target))
    }

    fn is_transient(&self, desc: &RuleDescriptor) -> bool {
        match &desc.implementation {
            ImplProvider::Native(project) => self
                .globals
                .project(*project)
                .and_then(|project| project.natives.clone())
                .and_then(|natives| natives.rule(&desc.class))
                .is_some_and(|rule| rule.transient()),
            ImplProvider::Value(_) => false,
        }
    }

    /// Starts the invocation of `desc` on top of `parents`.
    fn invoke_frame(
        self: &Arc<Self>,
        gid: GlobalTaskId,
        parents: Vec<Frame>,
        caller: &Project,
        desc: Arc<RuleDescriptor>,
        data: TargetIdData,
        target: TargetId,
        context_free: bool,
    ) -> Result<TaskRunResult, EvalError> {
        let inputs = InputHashes::compute(&data.args).map_err(RepoError::from)?;
        let transient = self.is_transient(&desc);
        let started = if desc.action {
            StartedTarget {
                hash_changed: true,
                prev_build_time: None,
                prev_result: None,
                reusable: None,
                object_hash: ObjectHash::new(target, &inputs),
            }
        } else {
            self.repo.target_started(&data, target, &inputs)
        };

        let frame = Frame {
            target,
            desc: desc.clone(),
            transient,
            context_free,
            then: None,
        };
        if !transient && let Some(value) = started.reusable {
            tracing::debug!(rule = %desc.name, %target, "reusing result");
            return self.complete(gid, frame, parents, value, false);
        }

        let rule_project = self.project(desc.context.project)?;
        let logger = tracing::info_span!("rule", name = %desc.name, %target);
        let context = BuildContext {
            env: self.env.clone(),
            source_project: data.source,
            rule_base_dir: rule_project.base_dir().map(Into::into),
            caller_base_dir: caller.base_dir().map(Into::into),
            main_base_dir: self.main_base_dir.clone(),
            arguments: data.args,
            hash_changed: started.hash_changed,
            prev_build_time: started.prev_build_time,
            prev_result: started.prev_result,
            target_id: target,
            object_hash: started.object_hash,
            logger,
            repo: self.repo.clone(),
        };

        let ret = self.invoke_rule(&desc, context);
        self.drive(gid, frame, parents, ret)
    }

    fn invoke_rule(&self, desc: &RuleDescriptor, context: BuildContext) -> PluginReturn {
        let result = match &desc.implementation {
            ImplProvider::Native(project) => {
                let rule = self
                    .globals
                    .project(*project)
                    .and_then(|project| project.natives.clone())
                    .and_then(|natives| natives.rule(&desc.class));
                match rule {
                    Some(rule) => {
                        let _entered = context.logger.enter();
                        rule.build(&context)
                    }
                    None => Err(anyhow::anyhow!("No native implementation `{}`", desc.class)),
                }
            }
            ImplProvider::Value(_) => self.invoker.invoke(&desc.identity(), context),
        };
        result.unwrap_or_else(PluginReturn::Failed)
    }

    /// Acts on what the implementation of `top` returned.
    fn drive(
        self: &Arc<Self>,
        gid: GlobalTaskId,
        mut top: Frame,
        parents: Vec<Frame>,
        ret: PluginReturn,
    ) -> Result<TaskRunResult, EvalError> {
        match ret {
            PluginReturn::Value(value) => {
                let project = self.project(top.desc.context.project)?;
                let env = EvalEnv::new(self, &project, top.desc.context);
                match coerce(&value, &top.desc.return_type, &env) {
                    Ok(Coerced::Done(value)) => self.complete(gid, top, parents, value, true),
                    Ok(Coerced::Pending(tasks)) => {
                        self.suspend(gid, top, parents, Pending::Drive(value));
                        Ok(TaskRunResult::Unfulfilled(
                            tasks.into_iter().map(|task| (task, EdgeKind::Value)).collect(),
                        ))
                    }
                    Err(err) => Err(self.fail(&top, &parents, err.to_string())),
                }
            }
            PluginReturn::Failed(err) => Err(self.fail(&top, &parents, format!("{err:#}"))),
            PluginReturn::WithDirectoryLock { dir, then } => {
                let this = self.clone();
                Ok(TaskRunResult::LongRunning(Box::new(move || {
                    let ret = this.repo.locker().with_lock(&dir, then);
                    this.drive(gid, top, parents, ret)
                })))
            }
            PluginReturn::EvalAndThen { rule, args, then } => {
                top.then = Some(then);
                self.nested_call(gid, top, parents, rule, args)
            }
        }
    }

    fn fail(&self, top: &Frame, parents: &[Frame], message: String) -> EvalError {
        fail_frames(&self.repo, top, parents, &message);
        EvalError::Rule {
            rule: top.desc.name.to_string(),
            message,
        }
    }

    /// `top` produced `value`: hand it to the frame below, or finish the
    /// task with it.
    fn complete(
        self: &Arc<Self>,
        gid: GlobalTaskId,
        top: Frame,
        mut parents: Vec<Frame>,
        value: Value,
        record: bool,
    ) -> Result<TaskRunResult, EvalError> {
        if record && !top.desc.action {
            self.repo.target_succeeded(top.target, value.clone(), top.transient);
        }
        self.record_target(gid, top.target);

        let Some(mut parent) = parents.pop() else {
            return Ok(TaskRunResult::Immediate(NodeResult::Value {
                value,
                context_free: top.context_free,
            }));
        };
        match parent.then.take() {
            Some(then) => {
                let ret = then(value);
                self.drive(gid, parent, parents, ret)
            }
            None => Err(self.fail(&parent, &parents, "nested call returned without a continuation".into())),
        }
    }

    /// Calls `rule`, as seen from the project of `top`'s rule, on behalf
    /// of `top`.
    fn nested_call(
        self: &Arc<Self>,
        gid: GlobalTaskId,
        top: Frame,
        mut parents: Vec<Frame>,
        rule: String,
        args: BTreeMap<String, Value>,
    ) -> Result<TaskRunResult, EvalError> {
        let context = top.desc.context;
        let project = self.project(context.project)?;
        let base = ImportResult {
            project: context.project,
            context,
            prefix: Vec::new(),
        };

        let step = self.resolve_path(&base, &split_dotted(&rule)).and_then(|callee| {
            let env = EvalEnv::new(self, &project, context);
            let named: Vec<_> = args.clone().into_iter().collect();
            match callee {
                NodeResult::Rule(desc) => {
                    let args = organize(&desc.params, Vec::new(), named)?;
                    let args = self.complete_args(&desc, args, &env)?;
                    Ok(Nested::Rule(desc, args))
                }
                NodeResult::DataClass(desc) => Ok(Nested::Value(self.construct(&desc, Vec::new(), named, &env)?)),
                other => Err(EvalError::NotCallable(other.kind().into()).into()),
            }
        });

        match step {
            Ok(Nested::Rule(desc, nested_args)) => {
                let (data, target) = Self::target_of(&project, &desc, nested_args)?;
                if !desc.action {
                    match self.claim(gid, target) {
                        Ok(None) => {}
                        Ok(Some(value)) => {
                            self.record_target(gid, target);
                            return self.complete_nested(gid, top, parents, value);
                        }
                        Err(Step::Wait(needs)) => {
                            self.suspend(gid, top, parents, Pending::Nested { rule, args });
                            return Ok(TaskRunResult::Unfulfilled(needs));
                        }
                        Err(Step::Fail(err)) => return Err(self.fail(&top, &parents, err.to_string())),
                    }
                }
                parents.push(top);
                self.invoke_frame(gid, parents, &project, desc, data, target, false)
            }
            Ok(Nested::Value(value)) => self.complete_nested(gid, top, parents, value),
            Err(Step::Wait(needs)) => {
                self.suspend(gid, top, parents, Pending::Nested { rule, args });
                Ok(TaskRunResult::Unfulfilled(needs))
            }
            Err(Step::Fail(err)) => Err(self.fail(&top, &parents, err.to_string())),
        }
    }

    /// Feeds the result of a nested call that didn't need a frame of its
    /// own to the continuation of `top`.
    fn complete_nested(
        self: &Arc<Self>,
        gid: GlobalTaskId,
        mut top: Frame,
        parents: Vec<Frame>,
        value: Value,
    ) -> Result<TaskRunResult, EvalError> {
        match top.then.take() {
            Some(then) => {
                let ret = then(value);
                self.drive(gid, top, parents, ret)
            }
            None => Err(self.fail(&top, &parents, "nested call returned without a continuation".into())),
        }
    }

    fn suspend(&self, gid: GlobalTaskId, top: Frame, parents: Vec<Frame>, pending: Pending) {
        tracing::debug!(task = %gid, rule = %top.desc.name, "rule invocation suspended");
        self.suspended
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(gid, Suspension { top, parents, pending });
    }

    pub(crate) fn resume(self: &Arc<Self>, gid: GlobalTaskId, suspension: Suspension) -> Result<TaskRunResult, EvalError> {
        let Suspension { top, parents, pending } = suspension;
        match pending {
            Pending::Drive(value) => self.drive(gid, top, parents, PluginReturn::Value(value)),
            Pending::Nested { rule, args } => self.nested_call(gid, top, parents, rule, args),
        }
    }
}

enum Nested {
    Rule(Arc<RuleDescriptor>, BTreeMap<String, Value>),
    Value(Value),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Type;

    fn params() -> Vec<ParamDesc> {
        ["a", "b", "c"]
            .into_iter()
            .map(|name| ParamDesc {
                name: name.into(),
                ty: Type::String,
                optional: false,
                default: None,
            })
            .collect()
    }

    #[test]
    fn test_organize_matches_positional_then_named() {
        let args = organize(
            &params(),
            vec![Value::string("1")],
            vec![("c".into(), Value::string("3"))],
        )
        .unwrap();
        assert_eq!(
            args,
            BTreeMap::from([
                ("a".to_string(), Value::string("1")),
                ("c".to_string(), Value::string("3")),
            ])
        );
    }

    #[test]
    fn test_organize_rejects_bad_arguments() {
        let four = vec![Value::None; 4];
        assert!(matches!(
            organize(&params(), four, vec![]),
            Err(EvalError::TooManyPositional { expected: 3, got: 4 })
        ));
        assert!(matches!(
            organize(&params(), vec![], vec![("d".into(), Value::None)]),
            Err(EvalError::UnknownParameters(names)) if names == "d"
        ));
        assert!(matches!(
            organize(&params(), vec![Value::None], vec![("a".into(), Value::None)]),
            Err(EvalError::DuplicateArgument(name)) if name == "a"
        ));
    }
}
