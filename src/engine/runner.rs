mod diagnostics;

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, LazyLock, Mutex, PoisonError};
use std::time::{Duration, Instant};

use indicatif::ProgressStyle;
use rayon::{Scope, ThreadPoolBuilder};
use tracing::{Level, Span};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::engine::eval::{Evaluator, LongRunning, TaskRunResult};
use crate::engine::scheduler::{DepsGraph, Failure, Settled};
use crate::error::{BuildError, EvalError, SchedulerError};
use crate::graph::EdgeKind;
use crate::graph::global::{GlobalTaskEdge, GlobalTaskId};

pub use diagnostics::Diagnostics;

static BUILD_STYLE: LazyLock<ProgressStyle> = LazyLock::new(|| {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
        .map(|style| style.progress_chars("=>-"))
        .unwrap_or_else(|_| ProgressStyle::default_bar())
});

static TASK_STYLE: LazyLock<ProgressStyle> = LazyLock::new(|| {
    ProgressStyle::default_spinner()
        .template("{spinner:.green} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
});

#[derive(Debug, Clone)]
pub struct TaskExecution {
    pub start: Instant,
    pub duration: Duration,
}

/// State shared by every worker of one run.
struct Run {
    evaluator: Arc<Evaluator>,
    deps: DepsGraph,
    span: Span,
    times: Mutex<HashMap<GlobalTaskId, TaskExecution>>,
}

/// Runs `goals` and everything they need to completion.
///
/// Tasks come out of the scheduler's ready queue and are evaluated on a
/// compute pool. Evaluations that may block (rule invocations, directory
/// locks, loading imported scripts) are moved to a second pool so that
/// they never hold a compute thread. The call returns once the queue is
/// closed, which happens when every registered task has finished or the
/// run was aborted.
pub(crate) fn run(
    evaluator: &Arc<Evaluator>,
    goals: &[GlobalTaskId],
    threads: usize,
) -> Result<Diagnostics, BuildError> {
    let compute = ThreadPoolBuilder::new()
        .num_threads(threads)
        .thread_name(|i| format!("bibix-compute-{i}"))
        .build()?;
    let blocking = ThreadPoolBuilder::new()
        .num_threads(threads)
        .thread_name(|i| format!("bibix-blocking-{i}"))
        .build()?;

    let root_span = tracing::span!(Level::INFO, "build");
    root_span.pb_set_style(&BUILD_STYLE);
    root_span.pb_set_message("Building tasks...");
    let _enter = root_span.enter();

    let (deps, ready) = DepsGraph::new(evaluator.globals().clone());
    let run = Arc::new(Run {
        evaluator: evaluator.clone(),
        deps,
        span: root_span.clone(),
        times: Mutex::new(HashMap::new()),
    });

    match run.deps.add_nodes_and_reachables(goals.iter().copied()) {
        Ok(failures) => run.record_failures(&failures),
        Err(err) => run.deps.abort(err),
    }
    let stalled = run.deps.check_stalled();
    run.apply(stalled);
    run.update_progress();

    blocking.in_place_scope(|blocking| {
        compute.in_place_scope(|compute| {
            for gid in ready {
                let run = run.clone();
                compute.spawn(move |_| run.execute(gid, blocking));
            }
        })
    });

    if let Some(err) = run.deps.error() {
        return Err(BuildError::Invariant(err));
    }

    tracing::info!(tasks = run.deps.node_count(), "Build complete!");
    let execution_times = std::mem::take(&mut *run.times.lock().unwrap_or_else(PoisonError::into_inner));
    let edges = run.deps.edges();
    let labels = execution_times
        .keys()
        .copied()
        .chain(edges.iter().flat_map(|edge| [edge.start, edge.end]))
        .map(|gid| (gid, evaluator.label(gid)))
        .collect();
    Ok(Diagnostics {
        execution_times,
        edges,
        labels,
    })
}

impl Run {
    fn execute<'scope>(self: Arc<Self>, gid: GlobalTaskId, blocking: &Scope<'scope>) {
        let span = self.task_span(gid);
        let result = {
            let _enter = span.enter();
            self.timed(gid, || self.evaluator.run_task(gid))
        };

        match result {
            Ok(TaskRunResult::LongRunning(work)) => {
                blocking.spawn(move |_| self.execute_long(gid, work, span));
            }
            other => {
                self.handle(gid, other);
                self.settle();
            }
        }
    }

    /// Runs blocking work, and whatever blocking work it leads to, on the
    /// current thread.
    fn execute_long(&self, gid: GlobalTaskId, mut work: LongRunning, span: Span) {
        let _enter = span.enter();
        loop {
            match self.timed(gid, work) {
                Ok(TaskRunResult::LongRunning(next)) => work = next,
                other => {
                    self.handle(gid, other);
                    break;
                }
            }
        }
        self.settle();
    }

    fn task_span(&self, gid: GlobalTaskId) -> Span {
        let label = self.evaluator.label(gid);
        let span = tracing::span!(parent: &self.span, Level::INFO, "task", name = %label);
        span.pb_set_style(&TASK_STYLE);
        span.pb_set_message(&format!("Running {label}"));
        span
    }

    /// Runs `f`, turning a panic into a task failure, and adds the time it
    /// took to the task's total.
    fn timed(
        &self,
        gid: GlobalTaskId,
        f: impl FnOnce() -> Result<TaskRunResult, EvalError>,
    ) -> Result<TaskRunResult, EvalError> {
        let start = Instant::now();
        let result = match catch_unwind(AssertUnwindSafe(f)) {
            Ok(result) => result,
            Err(panic) => {
                let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic.downcast_ref::<String>() {
                    s.clone()
                } else {
                    String::from("unknown payload")
                };
                Err(EvalError::Panicked(msg))
            }
        };
        let duration = start.elapsed();

        self.times
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(gid)
            .and_modify(|exec| exec.duration += duration)
            .or_insert(TaskExecution { start, duration });
        result
    }

    fn handle(&self, gid: GlobalTaskId, result: Result<TaskRunResult, EvalError>) {
        let outcome = match result {
            Ok(TaskRunResult::Immediate(value)) => {
                self.evaluator.results.insert(gid, value);
                self.deps.finish_node(gid).map(|()| Vec::new())
            }
            Ok(TaskRunResult::Unfulfilled(needs)) => self.wait(gid, needs),
            Ok(TaskRunResult::LongRunning(_)) => {
                // `execute_long` unrolls these
                self.fail(gid, EvalError::Panicked("unexpected blocking work".into()))
            }
            Err(err) => self.fail(gid, err),
        };

        match outcome {
            Ok(failures) => self.record_failures(&failures),
            Err(err) => self.deps.abort(err),
        }
    }

    fn wait(&self, gid: GlobalTaskId, needs: Vec<(GlobalTaskId, EdgeKind)>) -> Result<Vec<Failure>, SchedulerError> {
        let mut edges = Vec::with_capacity(needs.len());
        for (end, kind) in needs {
            let edge = GlobalTaskEdge { start: gid, end, kind };
            if kind == EdgeKind::Import
                && gid.context != end.context
                && let Err(err) = self.evaluator.globals().add_global_edge(edge)
            {
                tracing::warn!(%edge, "couldn't record import edge: {err}");
            }
            edges.push(edge);
        }
        tracing::debug!(task = %gid, needs = edges.len(), "task waits");
        self.deps.add_edges(edges)
    }

    fn fail(&self, gid: GlobalTaskId, err: EvalError) -> Result<Vec<Failure>, SchedulerError> {
        tracing::debug!(task = %gid, "task failed: {err}");
        self.evaluator.results.fail(gid, Arc::new(err));
        self.evaluator.abandon(gid);
        self.deps.fail_node(gid)
    }

    /// Stores the errors of tasks the scheduler failed on behalf of their
    /// dependencies. `failures` is ordered so that causes come first.
    fn record_failures(&self, failures: &[Failure]) {
        for failure in failures {
            let Some(source) = self.evaluator.results.failure(failure.cause) else {
                tracing::warn!(task = %failure.task, cause = %failure.cause, "failed cause has no error");
                continue;
            };
            let err = EvalError::Dependency {
                task: self.evaluator.label(failure.cause),
                source,
            };
            self.evaluator.results.fail(failure.task, Arc::new(err));
            self.evaluator.abandon(failure.task);
        }
    }

    fn settle(&self) {
        if let Err(err) = self.evaluator.repo.flush() {
            tracing::warn!("couldn't write the target store: {err}");
        }
        let settled = self.deps.settle();
        self.apply(settled);
        self.update_progress();
    }

    fn apply(&self, settled: Result<Settled, SchedulerError>) {
        let settled = match settled {
            Ok(settled) => settled,
            Err(err) => {
                self.deps.abort(err);
                return;
            }
        };

        for cycle in &settled.cycles {
            let labels: Vec<_> = cycle.iter().map(|gid| self.evaluator.label(*gid)).collect();
            tracing::error!("dependency cycle: {}", labels.join(" -> "));
            for member in cycle {
                self.evaluator.results.fail(*member, Arc::new(EvalError::Cycle(labels.clone())));
                self.evaluator.abandon(*member);
            }
        }
        self.record_failures(&settled.failures);
    }

    fn update_progress(&self) {
        self.span.pb_set_length(self.deps.node_count() as u64);
        self.span.pb_set_position(self.deps.finished_count() as u64);
    }
}
