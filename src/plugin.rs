//! The boundary between the engine and rule implementations.
//!
//! Rules declared `native:<Class>` run through the [`NativeRules`] table of
//! the project that declares them, every other rule goes through the engine's
//! [`PluginInvoker`]. Either way the implementation gets a [`BuildContext`]
//! and answers with a [`PluginReturn`], which may ask the engine for more
//! work before the rule can finish.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::ast::Script;
use crate::graph::global::ProjectLocation;
use crate::repo::{ObjectHash, Repo, TargetId};
use crate::value::Value;

/// Which rule implementation a call runs. Part of every
/// [`TargetIdData`](crate::repo::TargetIdData).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RuleIdentity {
    pub package: String,
    pub name: String,
    pub class: String,
    pub method: Option<String>,
    /// Value of the implementation target, absent for native rules.
    pub implementation: Option<Value>,
}

pub type Then = Box<dyn FnOnce() -> PluginReturn + Send>;
pub type ThenWith = Box<dyn FnOnce(Value) -> PluginReturn + Send>;

/// What a rule implementation answers.
pub enum PluginReturn {
    Value(Value),
    Failed(anyhow::Error),
    /// Run `then` while holding the lock of `dir`.
    WithDirectoryLock { dir: Utf8PathBuf, then: Then },
    /// Call the rule `rule`, visible from the calling rule's project, with
    /// named `args`, and continue with its result.
    EvalAndThen {
        rule: String,
        args: BTreeMap<String, Value>,
        then: ThenWith,
    },
}

impl PluginReturn {
    pub fn with_lock(dir: impl Into<Utf8PathBuf>, then: impl FnOnce() -> PluginReturn + Send + 'static) -> Self {
        PluginReturn::WithDirectoryLock {
            dir: dir.into(),
            then: Box::new(then),
        }
    }

    pub fn eval_and_then(
        rule: impl Into<String>,
        args: BTreeMap<String, Value>,
        then: impl FnOnce(Value) -> PluginReturn + Send + 'static,
    ) -> Self {
        PluginReturn::EvalAndThen {
            rule: rule.into(),
            args,
            then: Box::new(then),
        }
    }
}

impl From<anyhow::Result<Value>> for PluginReturn {
    fn from(result: anyhow::Result<Value>) -> Self {
        match result {
            Ok(value) => PluginReturn::Value(value),
            Err(err) => PluginReturn::Failed(err),
        }
    }
}

impl fmt::Debug for PluginReturn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluginReturn::Value(value) => f.debug_tuple("Value").field(value).finish(),
            PluginReturn::Failed(err) => f.debug_tuple("Failed").field(err).finish(),
            PluginReturn::WithDirectoryLock { dir, .. } => {
                f.debug_struct("WithDirectoryLock").field("dir", dir).finish_non_exhaustive()
            }
            PluginReturn::EvalAndThen { rule, args, .. } => f
                .debug_struct("EvalAndThen")
                .field("rule", rule)
                .field("args", args)
                .finish_non_exhaustive(),
        }
    }
}

/// Everything a rule implementation gets to see.
#[derive(Debug, Clone)]
pub struct BuildContext {
    pub env: BTreeMap<String, String>,
    /// Package of the project containing the call.
    pub source_project: String,
    pub rule_base_dir: Option<Utf8PathBuf>,
    pub caller_base_dir: Option<Utf8PathBuf>,
    pub main_base_dir: Utf8PathBuf,
    pub arguments: BTreeMap<String, Value>,
    /// Whether any file reachable from the arguments changed since the last
    /// time this target started.
    pub hash_changed: bool,
    pub prev_build_time: Option<i64>,
    pub prev_result: Option<Value>,
    pub target_id: TargetId,
    pub object_hash: ObjectHash,
    pub logger: tracing::Span,
    pub repo: Arc<Repo>,
}

impl BuildContext {
    pub fn arg(&self, name: &str) -> Option<&Value> {
        self.arguments.get(name)
    }

    /// The object directory of this target, created on first use.
    pub fn dest_dir(&self) -> std::io::Result<Utf8PathBuf> {
        let dir = self.repo.object_dir(self.target_id);
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Directory relative paths are resolved against: the caller's project
    /// root, or the main project's.
    pub fn base_dir(&self) -> &Utf8Path {
        self.caller_base_dir.as_deref().unwrap_or(&self.main_base_dir)
    }
}

pub trait NativeRule: Send + Sync {
    fn build(&self, context: &BuildContext) -> anyhow::Result<PluginReturn>;

    /// Results of transient rules depend on more than their arguments; they
    /// are never reused from an earlier run and never persisted.
    fn transient(&self) -> bool {
        false
    }
}

impl<F> NativeRule for F
where
    F: Fn(&BuildContext) -> anyhow::Result<PluginReturn> + Send + Sync,
{
    fn build(&self, context: &BuildContext) -> anyhow::Result<PluginReturn> {
        self(context)
    }
}

/// The native rules of one project, by implementation class name.
pub trait NativeRules: Send + Sync {
    fn rule(&self, class: &str) -> Option<Arc<dyn NativeRule>>;
}

impl NativeRules for HashMap<String, Arc<dyn NativeRule>> {
    fn rule(&self, class: &str) -> Option<Arc<dyn NativeRule>> {
        self.get(class).cloned()
    }
}

/// Runs rules whose implementation is not native.
pub trait PluginInvoker: Send + Sync {
    fn invoke(&self, rule: &RuleIdentity, context: BuildContext) -> anyhow::Result<PluginReturn>;
}

/// Invoker for engines that only run native rules.
#[derive(Debug, Default)]
pub struct NoInvoker;

impl PluginInvoker for NoInvoker {
    fn invoke(&self, rule: &RuleIdentity, _: BuildContext) -> anyhow::Result<PluginReturn> {
        Err(anyhow::anyhow!(
            "No plugin invoker configured, can't run `{}` implemented by {}",
            rule.name,
            rule.class
        ))
    }
}

/// Turns build script sources into syntax trees. Needed to load projects
/// that are imported by location.
pub trait ScriptParser: Send + Sync {
    fn parse(&self, location: &ProjectLocation, source: &str) -> anyhow::Result<Script>;
}

/// A built-in project, usable from every script by its name.
pub struct PreloadedPlugin {
    pub name: String,
    pub script: Script,
    pub natives: Arc<dyn NativeRules>,
}

impl fmt::Debug for PreloadedPlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreloadedPlugin")
            .field("name", &self.name)
            .field("script", &self.script)
            .finish_non_exhaustive()
    }
}
