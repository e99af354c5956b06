use std::sync::Arc;

use thiserror::Error;

/// Errors found while turning a script into a task graph. These are fatal
/// for the whole project and never retried.
#[derive(Debug, Error)]
pub enum ConstructionError {
    #[error("Duplicate name `{0}`")]
    DuplicateName(String),

    #[error("Node {0} was redefined with different content")]
    InconsistentNode(String),

    #[error("Node {0} is referenced but never defined")]
    Dangling(String),

    #[error("Name `{0}` not found")]
    NameNotFound(String),

    #[error("`{0}` is a namespace, not a value")]
    NamespaceNotValue(String),

    #[error("Unknown type `{0}`")]
    UnknownType(String),

    #[error("Unsupported collection type `{0}`")]
    BadCollection(String),

    #[error("Super class `{name}`: {reason}")]
    SuperClass { name: String, reason: String },

    #[error("Var redefinition `{name}`: {reason}")]
    VarRedef { name: String, reason: String },

    #[error("Native implementation is not allowed for rule `{0}`")]
    NativeNotAllowed(String),

    #[error("`this` is only allowed inside a class body")]
    ThisNotAllowed,

    #[error("Cannot infer the type of var `{0}`, declare it")]
    VarType(String),

    #[error("Import needs an explicit name, use `as`")]
    ImportName,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Cannot coerce {value} to {ty}: {reason}")]
pub struct CoercionError {
    pub value: String,
    pub ty: String,
    pub reason: String,
}

impl CoercionError {
    pub(crate) fn new(
        value: &crate::Value,
        ty: &crate::Type,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            value: value.to_string(),
            ty: ty.to_string(),
            reason: reason.into(),
        }
    }
}

/// Broken scheduler or graph bookkeeping. These indicate a bug and abort the
/// run instead of failing a single task.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("Task {0} finished twice")]
    NodeFinishedTwice(String),

    #[error("Edge {0} finished twice")]
    EdgeFinishedTwice(String),

    #[error("Pending counter of {0} would drop below zero")]
    CounterUnderflow(String),

    #[error("Project {0} is not registered")]
    UnknownProject(u32),

    #[error("Edge {0} does not cross contexts")]
    SameContextEdge(String),

    #[error("Edge {0} conflicts with an existing edge")]
    ConflictingEdge(String),

    #[error("Scheduler stalled with {0} pending tasks and no cycle among them")]
    Stalled(usize),
}

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("Repo i/o failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid run config: {0}")]
    Config(#[from] serde_json::Error),

    #[error("Couldn't encode repo data: {0}")]
    Encode(String),
}

/// Errors raised while evaluating a single task.
#[derive(Debug, Error)]
pub enum EvalError {
    #[error("Name `{0}` not found")]
    NameNotFound(String),

    #[error("Import failed: {0}")]
    Import(String),

    #[error(transparent)]
    Coercion(#[from] CoercionError),

    #[error("Expected a class instance or named tuple, found {0}")]
    NotAClassOrTuple(String),

    #[error("No member `{member}` in {value}")]
    NoSuchMember { member: String, value: String },

    #[error("Cannot spread {0} into a list")]
    SpreadNonCollection(String),

    #[error("`this` is not bound in this context")]
    ThisUnbound,

    #[error("Unknown parameters: {0}")]
    UnknownParameters(String),

    #[error("Too many positional arguments: expected at most {expected}, got {got}")]
    TooManyPositional { expected: usize, got: usize },

    #[error("Parameter `{0}` is given both by position and by name")]
    DuplicateArgument(String),

    #[error("Missing parameters: {0}")]
    MissingParameters(String),

    #[error("{0} is not callable")]
    NotCallable(String),

    #[error("Expected {expected}, found {found}")]
    UnexpectedResult {
        expected: &'static str,
        found: String,
    },

    #[error("Var `{0}` has no value")]
    VarUnset(String),

    #[error("Rule `{rule}` failed: {message}")]
    Rule { rule: String, message: String },

    #[error("Dependency cycle through {}", .0.join(" -> "))]
    Cycle(Vec<String>),

    #[error("{task} failed")]
    Dependency {
        task: String,
        #[source]
        source: Arc<EvalError>,
    },

    #[error("Task panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Construction(#[from] ConstructionError),

    #[error(transparent)]
    Repo(#[from] RepoError),

    #[error(transparent)]
    Invariant(#[from] SchedulerError),
}

impl EvalError {
    /// Names of the tasks this error travelled through, outermost first.
    pub fn chain(&self) -> Vec<&str> {
        let mut chain = Vec::new();
        let mut current = self;
        while let EvalError::Dependency { task, source } = current {
            chain.push(task.as_str());
            current = source.as_ref();
        }
        chain
    }

    /// The error that started the chain.
    pub fn root_cause(&self) -> &EvalError {
        match self {
            EvalError::Dependency { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

/// Errors that stop a whole build. Failures of individual goals are reported
/// through [`BuildReport`](crate::BuildReport) instead.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Construction(#[from] ConstructionError),

    #[error(transparent)]
    Repo(#[from] RepoError),

    #[error("Scheduler invariant violated: {0}")]
    Invariant(#[from] SchedulerError),

    #[error("Goal `{0}` is not defined in the main project")]
    GoalNotFound(String),

    #[error("Couldn't start the worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}
