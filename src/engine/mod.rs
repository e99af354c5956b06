//! Running builds: the [`Engine`] registers the projects of a run and drives
//! the scheduler and evaluator over them.

mod call;
pub(crate) mod eval;
pub(crate) mod results;
mod runner;
pub mod scheduler;

use std::collections::BTreeMap;
use std::sync::Arc;

use camino::Utf8Path;

use crate::ast::Script;
use crate::error::{BuildError, ConstructionError, EvalError};
use crate::graph::builder::{BuildPolicy, build_graph};
use crate::graph::global::{GlobalTaskGraph, GlobalTaskId, Project, ProjectId, ProjectKind, ProjectLocation, TaskContext};
use crate::name::{Name, NameTable};
use crate::plugin::{NativeRules, NoInvoker, PluginInvoker, PreloadedPlugin, ScriptParser};
use crate::plugins::prelude;
use crate::repo::Repo;
use crate::value::Value;

pub use runner::{Diagnostics, TaskExecution};

use eval::Evaluator;

/// Builds the graph of `script` and adds it to `globals`. When a project
/// was already registered at `location`, that one is returned instead.
pub(crate) fn register_project(
    globals: &GlobalTaskGraph,
    kind: ProjectKind,
    location: Option<ProjectLocation>,
    script: &Script,
    prelude: Option<Arc<NameTable>>,
    policy: &BuildPolicy,
    natives: Option<Arc<dyn NativeRules>>,
) -> Result<Arc<Project>, ConstructionError> {
    let names = NameTable::build(script, prelude)?;
    let graph = build_graph(script, &names, policy)?;
    tracing::debug!(nodes = graph.node_count(), edges = graph.edge_count(), ?kind, "built project graph");

    let project = Project {
        id: globals.allocate_id(&kind),
        kind,
        location,
        package: script.package.clone(),
        names: Arc::new(names),
        graph,
        natives,
    };
    Ok(globals.add_project(project))
}

/// Everything about a run that isn't in the main script.
pub struct EngineOptions {
    /// Identifies the run in the target store; random when absent.
    pub run_id: Option<String>,
    /// Handed to rule implementations as [`BuildContext::env`](crate::BuildContext::env).
    pub env: BTreeMap<String, String>,
    /// Built-in projects visible from every script by name.
    pub preloaded: Vec<PreloadedPlugin>,
    /// Needed to import projects by location.
    pub parser: Option<Arc<dyn ScriptParser>>,
    pub invoker: Arc<dyn PluginInvoker>,
    /// Worker count, `RunConfig::max_threads` when absent.
    pub threads: Option<usize>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions {
            run_id: None,
            env: BTreeMap::new(),
            preloaded: Vec::new(),
            parser: None,
            invoker: Arc::new(NoInvoker),
            threads: None,
        }
    }
}

/// The outcome of [`Engine::build`], per requested goal.
#[derive(Debug, Default)]
pub struct BuildReport {
    pub values: BTreeMap<String, Value>,
    pub failures: BTreeMap<String, Arc<EvalError>>,
    pub diagnostics: Diagnostics,
}

impl BuildReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

pub struct Engine {
    evaluator: Arc<Evaluator>,
    main: Arc<Project>,
    repo: Arc<Repo>,
    threads: usize,
}

impl Engine {
    /// Opens the repo of the project at `location` and registers the
    /// prelude, the preloaded plugins and `script` as the main project.
    pub fn new(location: ProjectLocation, script: &Script, options: EngineOptions) -> Result<Self, BuildError> {
        let repo = Arc::new(Repo::open(location.root.join(Repo::DIR), options.run_id)?);
        let globals = Arc::new(GlobalTaskGraph::new());

        let prelude = register_project(
            &globals,
            ProjectKind::Prelude,
            None,
            &prelude::script(),
            None,
            &BuildPolicy {
                native_allowed: true,
                preloaded: Vec::new(),
            },
            Some(prelude::natives()),
        )?;

        let preloaded: Vec<String> = options.preloaded.iter().map(|plugin| plugin.name.clone()).collect();
        for plugin in &options.preloaded {
            register_project(
                &globals,
                ProjectKind::Preloaded(plugin.name.clone()),
                None,
                &plugin.script,
                Some(prelude.names.clone()),
                &BuildPolicy {
                    native_allowed: true,
                    preloaded: preloaded.clone(),
                },
                Some(plugin.natives.clone()),
            )?;
        }

        let main = register_project(
            &globals,
            ProjectKind::Main,
            Some(location.clone()),
            script,
            Some(prelude.names.clone()),
            &BuildPolicy {
                native_allowed: false,
                preloaded: preloaded.clone(),
            },
            None,
        )?;
        tracing::info!(projects = globals.project_count(), root = %location.root, "projects registered");

        let threads = options.threads.unwrap_or(repo.config().max_threads).max(1);
        let evaluator = Arc::new(Evaluator::new(
            globals,
            repo.clone(),
            options.invoker,
            options.parser,
            options.env,
            location.root,
            preloaded,
        ));

        Ok(Engine {
            evaluator,
            main,
            repo,
            threads,
        })
    }

    /// Evaluates the named definitions of the main project.
    ///
    /// A failing goal doesn't stop the others; its error, with the chain of
    /// tasks it travelled through, ends up in [`BuildReport::failures`].
    /// Goals backed by a rule invocation get their object directory linked
    /// under `outputs/<goal>`.
    pub fn build(&self, goals: &[&str]) -> Result<BuildReport, BuildError> {
        let ids = goals
            .iter()
            .map(|goal| {
                self.main
                    .graph
                    .def(&Name::parse(goal))
                    .map(|task| GlobalTaskId::new(TaskContext::plain(ProjectId::MAIN), task))
                    .ok_or_else(|| BuildError::GoalNotFound(goal.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let diagnostics = runner::run(&self.evaluator, &ids, self.threads)?;
        diagnostics.log_summary();

        let mut report = BuildReport {
            diagnostics,
            ..BuildReport::default()
        };
        for (goal, gid) in goals.iter().zip(ids) {
            let outcome = match self.evaluator.results().lookup(gid) {
                Some(Ok(result)) => eval::as_value(result).map_err(Arc::new),
                Some(Err(err)) => Err(err),
                None => {
                    tracing::warn!(goal, "goal never finished");
                    continue;
                }
            };

            match outcome {
                Ok((value, _)) => {
                    self.link(goal, gid);
                    report.values.insert(goal.to_string(), value);
                }
                Err(err) => {
                    tracing::error!(goal, "{err}");
                    report.failures.insert(goal.to_string(), err);
                }
            }
        }

        self.repo.commit()?;
        Ok(report)
    }

    fn link(&self, goal: &str, gid: GlobalTaskId) {
        let Some(target) = self.evaluator.goal_target(gid) else {
            return;
        };
        match self.repo.link_output(goal, target) {
            Ok(true) => tracing::debug!(goal, %target, "linked output"),
            Ok(false) => {}
            Err(err) => tracing::warn!(goal, %target, "couldn't link output: {err}"),
        }
    }

    pub fn repo(&self) -> &Arc<Repo> {
        &self.repo
    }

    pub fn globals(&self) -> &Arc<GlobalTaskGraph> {
        self.evaluator.globals()
    }

    pub fn main_dir(&self) -> &Utf8Path {
        self.main.base_dir().unwrap_or(self.repo.root())
    }

    /// Writes the target store. The engine can't be used afterwards.
    pub fn shutdown(self) -> Result<(), BuildError> {
        self.repo.shutdown()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use camino::Utf8PathBuf;

    use super::*;
    use crate::ast::{AstIds, DataClassDef, Def, ImplDef, RuleDef};
    use crate::engine::results::NodeResult;
    use crate::graph::TaskNode;
    use crate::graph::global::InstanceId;
    use crate::plugin::{BuildContext, NativeRule, PluginReturn};

    fn scratch() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        (dir, root)
    }

    fn options() -> EngineOptions {
        EngineOptions {
            threads: Some(4),
            ..EngineOptions::default()
        }
    }

    fn pair_class(ids: &AstIds) -> Def {
        Def::DataClass(DataClassDef {
            id: ids.next(),
            name: "Pair".into(),
            fields: vec![
                ids.param("a", ids.type_name("string"), None),
                ids.param("b", ids.type_name("string"), Some(ids.string("dflt"))),
            ],
            body: vec![],
        })
    }

    fn pair(a: &str, b: &str) -> Value {
        Value::ClassInstance {
            package: "sample".into(),
            class: "Pair".into(),
            fields: BTreeMap::from([("a".to_string(), Value::string(a)), ("b".to_string(), Value::string(b))]),
        }
    }

    #[test]
    fn test_builds_class_instances_with_defaults() {
        let (_dir, root) = scratch();
        let ids = AstIds::new();
        let script = Script {
            package: Some("sample".into()),
            defs: vec![
                pair_class(&ids),
                ids.target("x", ids.call("Pair", vec![ids.string("hello"), ids.string("world")], vec![])),
                ids.target("y", ids.call("Pair", vec![ids.string("hello")], vec![])),
                ids.target("z", ids.call("Pair", vec![], vec![("b", ids.string("only"))])),
            ],
        };

        let engine = Engine::new(ProjectLocation::new(&root), &script, options()).unwrap();
        let report = engine.build(&["x", "y", "z"]).unwrap();

        assert_eq!(report.values.get("x"), Some(&pair("hello", "world")));
        assert_eq!(report.values.get("y"), Some(&pair("hello", "dflt")));
        assert!(!report.is_success());
        assert!(!report.values.contains_key("z"));
        assert!(report.failures.contains_key("z"));
        assert!(!report.diagnostics.execution_times.is_empty());
    }

    #[test]
    fn test_unknown_goal_is_an_error() {
        let (_dir, root) = scratch();
        let script = Script {
            package: None,
            defs: vec![],
        };
        let engine = Engine::new(ProjectLocation::new(&root), &script, options()).unwrap();
        assert!(matches!(engine.build(&["nope"]), Err(BuildError::GoalNotFound(goal)) if goal == "nope"));
    }

    #[test]
    fn test_prelude_glob_resolves_against_main_project() {
        let (_dir, root) = scratch();
        fs::create_dir(root.join("src")).unwrap();
        for name in ["src/a.txt", "src/b.txt", "src/c.md"] {
            fs::write(root.join(name), name).unwrap();
        }

        let ids = AstIds::new();
        let script = Script {
            package: None,
            defs: vec![ids.target("srcs", ids.call("glob", vec![ids.string("src/*.txt")], vec![]))],
        };
        let engine = Engine::new(ProjectLocation::new(&root), &script, options()).unwrap();
        let report = engine.build(&["srcs"]).unwrap();

        let Some(Value::Set(files)) = report.values.get("srcs") else {
            panic!("unexpected report {report:?}");
        };
        assert_eq!(files.len(), 2);
        assert!(files.contains(&Value::File(engine.main_dir().join("src/a.txt"))));
        assert!(files.contains(&Value::File(engine.main_dir().join("src/b.txt"))));
    }

    /// `def <name>(text: string): string = native:<class>`
    fn text_rule(ids: &AstIds, name: &str, class: &str) -> Def {
        Def::BuildRule(RuleDef {
            id: ids.next(),
            name: name.into(),
            params: vec![ids.param("text", ids.type_name("string"), None)],
            return_type: ids.type_name("string"),
            implementation: ImplDef {
                target: vec!["native".into()],
                class: class.into(),
                method: None,
            },
        })
    }

    /// `tools.upper(text)` and `tools.shout(text)`, which calls `upper` and
    /// then writes its object directory under a lock.
    fn tools(ids: &AstIds) -> PreloadedPlugin {
        let rule = |name: &str, class: &str| text_rule(ids, name, class);

        let upper = |context: &BuildContext| -> anyhow::Result<PluginReturn> {
            match context.arg("text") {
                Some(Value::String(text)) => Ok(PluginReturn::Value(Value::string(text.to_uppercase()))),
                other => anyhow::bail!("bad text {other:?}"),
            }
        };
        let shout = |context: &BuildContext| -> anyhow::Result<PluginReturn> {
            let text = context.arg("text").cloned().unwrap_or(Value::None);
            let dest = context.dest_dir()?;
            Ok(PluginReturn::eval_and_then(
                "upper",
                BTreeMap::from([("text".to_string(), text)]),
                move |upper| {
                    let upper = match upper {
                        Value::String(upper) => upper,
                        other => return PluginReturn::Failed(anyhow::anyhow!("upper returned {other}")),
                    };
                    let dir = dest.clone();
                    PluginReturn::with_lock(dest, move || {
                        let shouted = format!("{upper}!");
                        match fs::write(dir.join("out.txt"), &shouted) {
                            Ok(()) => PluginReturn::Value(Value::String(shouted)),
                            Err(err) => PluginReturn::Failed(err.into()),
                        }
                    })
                },
            ))
        };

        let mut natives: HashMap<String, Arc<dyn NativeRule>> = HashMap::new();
        natives.insert("tools.Upper".into(), Arc::new(upper));
        natives.insert("tools.Shout".into(), Arc::new(shout));

        PreloadedPlugin {
            name: "tools".into(),
            script: Script {
                package: Some("tools".into()),
                defs: vec![rule("upper", "tools.Upper"), rule("shout", "tools.Shout")],
            },
            natives: Arc::new(natives),
        }
    }

    #[test]
    fn test_preloaded_rules_nest_calls_and_link_outputs() {
        let (_dir, root) = scratch();
        let ids = AstIds::new();
        let script = Script {
            package: None,
            defs: vec![
                ids.target("x", ids.call("tools.shout", vec![ids.string("hey")], vec![])),
                ids.target("y", ids.call("tools.shout", vec![ids.string("hey")], vec![])),
                ids.target("bad", ids.call("tools.upper", vec![], vec![])),
            ],
        };
        let options = EngineOptions {
            preloaded: vec![tools(&ids)],
            ..options()
        };

        let engine = Engine::new(ProjectLocation::new(&root), &script, options).unwrap();
        let report = engine.build(&["x", "y", "bad"]).unwrap();

        assert_eq!(report.values.get("x"), Some(&Value::string("HEY!")));
        assert_eq!(report.values.get("y"), Some(&Value::string("HEY!")));
        assert!(matches!(
            report.failures.get("bad").map(|err| err.root_cause()),
            Some(EvalError::MissingParameters(names)) if names == "text"
        ));

        let target = engine.repo().output_target("x").unwrap();
        let written = fs::read_to_string(engine.repo().object_dir(target).join("out.txt")).unwrap();
        assert_eq!(written, "HEY!");
        assert!(engine.repo().root().join("outputs/x").exists());
        engine.shutdown().unwrap();
    }

    #[test]
    fn test_dependency_cycles_fail_their_goals() {
        let (_dir, root) = scratch();
        let ids = AstIds::new();
        let script = Script {
            package: None,
            defs: vec![
                ids.target("a", ids.name("b")),
                ids.target("b", ids.name("a")),
                ids.target("fine", ids.string("ok")),
            ],
        };
        let engine = Engine::new(ProjectLocation::new(&root), &script, options()).unwrap();
        let report = engine.build(&["a", "fine"]).unwrap();

        assert_eq!(report.values.get("fine"), Some(&Value::string("ok")));
        let cycle = report.failures.get("a").map(|err| err.root_cause());
        assert!(matches!(cycle, Some(EvalError::Cycle(tasks)) if tasks.len() == 2));
    }

    #[test]
    fn test_calls_on_context_free_inputs_are_shared() {
        let (_dir, root) = scratch();
        let ids = AstIds::new();
        let script = Script {
            package: Some("sample".into()),
            defs: vec![
                pair_class(&ids),
                ids.target("x", ids.call("Pair", vec![ids.string("hello")], vec![])),
                ids.target("y", ids.call("tools.upper", vec![ids.string("hey")], vec![])),
            ],
        };
        let options = EngineOptions {
            preloaded: vec![tools(&ids)],
            ..options()
        };

        let engine = Engine::new(ProjectLocation::new(&root), &script, options).unwrap();
        let report = engine.build(&["x", "y"]).unwrap();
        assert!(report.is_success());

        let other = TaskContext {
            project: ProjectId::MAIN,
            instance: Some(InstanceId(7)),
        };
        for goal in ["x", "y"] {
            let def = engine.main.graph.def(&Name::parse(goal)).unwrap();
            let Some(TaskNode::Target { value, .. }) = engine.main.graph.node(def) else {
                panic!("{goal} is not a target");
            };
            let shared = engine.evaluator.results().get(GlobalTaskId::new(other, *value));
            assert!(
                matches!(shared, Some(NodeResult::Value { context_free: true, .. })),
                "{goal}: {shared:?}"
            );
        }
    }

    /// Appends `suffix` to what `slow` makes of the text.
    fn suffixed(suffix: &'static str) -> impl Fn(&BuildContext) -> anyhow::Result<PluginReturn> + Send + Sync {
        move |context| {
            let text = context.arg("text").cloned().unwrap_or(Value::None);
            Ok(PluginReturn::eval_and_then(
                "slow",
                BTreeMap::from([("text".to_string(), text)]),
                move |value| match value {
                    Value::String(text) => PluginReturn::Value(Value::String(format!("{text}{suffix}"))),
                    other => PluginReturn::Failed(anyhow::anyhow!("slow returned {other}")),
                },
            ))
        }
    }

    #[test]
    fn test_nested_calls_build_shared_targets_once() {
        let (_dir, root) = scratch();
        let ids = AstIds::new();
        let runs = Arc::new(AtomicUsize::new(0));

        let slow = {
            let runs = runs.clone();
            move |context: &BuildContext| -> anyhow::Result<PluginReturn> {
                runs.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(100));
                Ok(PluginReturn::Value(context.arg("text").cloned().unwrap_or(Value::None)))
            }
        };
        let mut natives: HashMap<String, Arc<dyn NativeRule>> = HashMap::new();
        natives.insert("steps.Slow".into(), Arc::new(slow));
        natives.insert("steps.Ask".into(), Arc::new(suffixed("?")));
        natives.insert("steps.Shout".into(), Arc::new(suffixed("!")));
        let steps = PreloadedPlugin {
            name: "steps".into(),
            script: Script {
                package: Some("steps".into()),
                defs: vec![
                    text_rule(&ids, "slow", "steps.Slow"),
                    text_rule(&ids, "ask", "steps.Ask"),
                    text_rule(&ids, "shout", "steps.Shout"),
                ],
            },
            natives: Arc::new(natives),
        };

        let script = Script {
            package: None,
            defs: vec![
                ids.target("a", ids.call("steps.ask", vec![ids.string("hey")], vec![])),
                ids.target("b", ids.call("steps.shout", vec![ids.string("hey")], vec![])),
            ],
        };
        let options = EngineOptions {
            preloaded: vec![steps],
            ..options()
        };

        let engine = Engine::new(ProjectLocation::new(&root), &script, options).unwrap();
        let report = engine.build(&["a", "b"]).unwrap();

        assert_eq!(report.values.get("a"), Some(&Value::string("hey?")));
        assert_eq!(report.values.get("b"), Some(&Value::string("hey!")));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
