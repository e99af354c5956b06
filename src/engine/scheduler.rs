//! Dependency counting over the lazily grown task graph.
//!
//! Every registered task has a counter of required edges whose end hasn't
//! finished yet. A task whose counter drops to zero is sent to the ready
//! queue exactly once; evaluating it may register more edges from it, which
//! parks it again until those finish. Counters are only kept for parked
//! tasks: a task absent from the map is queued, running or finished.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use petgraph::algo::tarjan_scc;
use petgraph::graphmap::DiGraphMap;

use crate::error::SchedulerError;
use crate::graph::global::{GlobalTaskEdge, GlobalTaskGraph, GlobalTaskId};

/// `task` failed because `cause` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Failure {
    pub task: GlobalTaskId,
    pub cause: GlobalTaskId,
}

/// What [`DepsGraph::settle`] had to do to keep the run going.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Settled {
    /// Cycles of tasks waiting on each other. Their members were failed.
    pub cycles: Vec<Vec<GlobalTaskId>>,
    /// Tasks failed because they depended on a cycle member.
    pub failures: Vec<Failure>,
}

#[derive(Debug, Default)]
struct DepsState {
    nodes: HashSet<GlobalTaskId>,
    edges: HashSet<GlobalTaskEdge>,
    by_end: HashMap<GlobalTaskId, Vec<GlobalTaskEdge>>,
    finished_nodes: HashSet<GlobalTaskId>,
    finished_edges: HashSet<GlobalTaskEdge>,
    failed: HashSet<GlobalTaskId>,
    counts: HashMap<GlobalTaskId, usize>,
    /// Tasks sent to the queue and not yet settled by the runner.
    outstanding: usize,
    ready: Option<Sender<GlobalTaskId>>,
    error: Option<SchedulerError>,
}

#[derive(Debug)]
pub struct DepsGraph {
    globals: Arc<GlobalTaskGraph>,
    state: Mutex<DepsState>,
}

impl DepsGraph {
    /// Creates an empty scheduler and the receiving end of its ready queue.
    /// The queue is closed once every registered task finished, or when the
    /// run is aborted.
    pub fn new(globals: Arc<GlobalTaskGraph>) -> (Self, Receiver<GlobalTaskId>) {
        let (sender, receiver) = channel();
        let state = DepsState {
            ready: Some(sender),
            ..DepsState::default()
        };
        let deps = DepsGraph {
            globals,
            state: Mutex::new(state),
        };
        (deps, receiver)
    }

    fn lock(&self) -> MutexGuard<'_, DepsState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers `roots` and every task reachable from them through required
    /// edges. Tasks with nothing to wait for are queued.
    pub fn add_nodes_and_reachables(
        &self,
        roots: impl IntoIterator<Item = GlobalTaskId>,
    ) -> Result<Vec<Failure>, SchedulerError> {
        let mut state = self.lock();
        let mut pending_failures = Vec::new();
        let added = self.register_reachables(&mut state, roots, &mut pending_failures);

        let mut failures = Vec::new();
        for (task, cause) in pending_failures {
            state.fail_with_cause(task, cause, &mut failures);
        }
        for node in added {
            state.enqueue_if_ready(node);
        }
        state.close_if_finished();
        Ok(failures)
    }

    /// Registers edges found while evaluating their start tasks. Unknown end
    /// tasks are registered with everything reachable from them.
    pub fn add_edges(&self, edges: Vec<GlobalTaskEdge>) -> Result<Vec<Failure>, SchedulerError> {
        let mut state = self.lock();
        let mut starts = Vec::new();
        let mut fresh = Vec::new();
        for edge in edges {
            if !starts.contains(&edge.start) {
                starts.push(edge.start);
            }
            if !state.edges.contains(&edge) && !fresh.contains(&edge) {
                fresh.push(edge);
            }
        }

        let new_ends: Vec<_> = fresh
            .iter()
            .map(|edge| edge.end)
            .filter(|end| !state.nodes.contains(end))
            .collect();

        let mut pending_failures = Vec::new();
        let added = self.register_reachables(&mut state, new_ends, &mut pending_failures);
        for edge in fresh {
            state.nodes.insert(edge.start);
            state.register_edge(edge, &mut pending_failures);
        }

        let mut failures = Vec::new();
        for (task, cause) in pending_failures {
            state.fail_with_cause(task, cause, &mut failures);
        }
        for node in added.into_iter().chain(starts) {
            state.enqueue_if_ready(node);
        }
        state.close_if_finished();
        Ok(failures)
    }

    fn register_reachables(
        &self,
        state: &mut DepsState,
        roots: impl IntoIterator<Item = GlobalTaskId>,
        pending_failures: &mut Vec<(GlobalTaskId, GlobalTaskId)>,
    ) -> Vec<GlobalTaskId> {
        let mut added = Vec::new();
        let mut queue: VecDeque<_> = roots.into_iter().collect();
        while let Some(id) = queue.pop_front() {
            if !state.nodes.insert(id) {
                continue;
            }
            state.counts.insert(id, 0);
            added.push(id);

            for edge in self.globals.edges_by_start(id) {
                if !edge.kind.is_required() {
                    continue;
                }
                state.register_edge(edge, pending_failures);
                if !state.nodes.contains(&edge.end) {
                    queue.push_back(edge.end);
                }
            }
        }
        tracing::debug!(added = added.len(), total = state.nodes.len(), "registered tasks");
        added
    }

    /// Marks `id` finished and releases the tasks waiting on it.
    pub fn finish_node(&self, id: GlobalTaskId) -> Result<(), SchedulerError> {
        let mut state = self.lock();
        if !state.finished_nodes.insert(id) {
            return Err(SchedulerError::NodeFinishedTwice(id.to_string()));
        }

        let incoming = state.by_end.get(&id).cloned().unwrap_or_default();
        for edge in incoming {
            if !state.finished_edges.insert(edge) {
                continue;
            }
            let start = edge.start;
            if state.finished_nodes.contains(&start) {
                continue;
            }
            match state.counts.get_mut(&start) {
                Some(count) if *count > 0 => {
                    *count -= 1;
                    if *count == 0 {
                        state.counts.remove(&start);
                        state.enqueue(start);
                    }
                }
                _ => return Err(SchedulerError::CounterUnderflow(start.to_string())),
            }
        }

        state.close_if_finished();
        Ok(())
    }

    /// Marks `id` failed and finished, along with every task that waits on
    /// it, directly or not. Returns the tasks failed on the way.
    pub fn fail_node(&self, id: GlobalTaskId) -> Result<Vec<Failure>, SchedulerError> {
        let mut state = self.lock();
        if state.failed.contains(&id) {
            return Ok(Vec::new());
        }
        if !state.mark_failed(id) {
            return Err(SchedulerError::NodeFinishedTwice(id.to_string()));
        }

        let mut failures = Vec::new();
        state.cascade(vec![id], &mut failures);
        state.close_if_finished();
        Ok(failures)
    }

    /// Called by the runner once it is done with a task taken from the
    /// queue. Fails cycles when nothing else can make progress.
    pub fn settle(&self) -> Result<Settled, SchedulerError> {
        let mut state = self.lock();
        state.outstanding = state.outstanding.saturating_sub(1);
        self.resolve_stall(&mut state)
    }

    /// Fails cycles if no task is queued or running but some are still
    /// waiting.
    pub fn check_stalled(&self) -> Result<Settled, SchedulerError> {
        let mut state = self.lock();
        self.resolve_stall(&mut state)
    }

    fn resolve_stall(&self, state: &mut DepsState) -> Result<Settled, SchedulerError> {
        if state.outstanding > 0 || state.ready.is_none() || state.all_finished() {
            return Ok(Settled::default());
        }

        let pending: HashSet<_> = state.nodes.difference(&state.finished_nodes).copied().collect();
        let mut graph = DiGraphMap::<GlobalTaskId, ()>::new();
        for node in &pending {
            graph.add_node(*node);
        }
        for edge in &state.edges {
            if !state.finished_edges.contains(edge) && pending.contains(&edge.start) && pending.contains(&edge.end) {
                graph.add_edge(edge.start, edge.end, ());
            }
        }

        let cycles: Vec<Vec<GlobalTaskId>> = tarjan_scc(&graph)
            .into_iter()
            .filter(|scc| scc.len() > 1 || graph.contains_edge(scc[0], scc[0]))
            .collect();

        if cycles.is_empty() {
            let err = SchedulerError::Stalled(pending.len());
            state.abort(err.clone());
            return Err(err);
        }

        tracing::warn!(cycles = cycles.len(), pending = pending.len(), "scheduler stalled on dependency cycles");
        let mut settled = Settled::default();
        let members: Vec<_> = cycles.iter().flatten().copied().collect();
        for member in &members {
            state.mark_failed(*member);
        }
        state.cascade(members, &mut settled.failures);
        settled.cycles = cycles;

        if !state.all_finished() && state.outstanding == 0 {
            let err = SchedulerError::Stalled(state.nodes.len() - state.finished_nodes.len());
            state.abort(err.clone());
            return Err(err);
        }
        state.close_if_finished();
        Ok(settled)
    }

    /// Stops the run: the queue is closed and `err` is kept for the caller.
    pub fn abort(&self, err: SchedulerError) {
        self.lock().abort(err);
    }

    pub fn error(&self) -> Option<SchedulerError> {
        self.lock().error.clone()
    }

    /// Whether every registered edge has finished.
    pub fn is_done(&self) -> bool {
        let state = self.lock();
        state.finished_edges.len() == state.edges.len()
    }

    pub fn is_finished(&self, id: GlobalTaskId) -> bool {
        self.lock().finished_nodes.contains(&id)
    }

    pub fn node_count(&self) -> usize {
        self.lock().nodes.len()
    }

    pub fn finished_count(&self) -> usize {
        self.lock().finished_nodes.len()
    }

    pub fn edges(&self) -> Vec<GlobalTaskEdge> {
        self.lock().edges.iter().copied().collect()
    }
}

impl DepsState {
    fn register_edge(&mut self, edge: GlobalTaskEdge, pending_failures: &mut Vec<(GlobalTaskId, GlobalTaskId)>) {
        if !self.edges.insert(edge) {
            return;
        }
        self.by_end.entry(edge.end).or_default().push(edge);

        if self.failed.contains(&edge.end) {
            self.finished_edges.insert(edge);
            pending_failures.push((edge.start, edge.end));
        } else if self.finished_nodes.contains(&edge.end) {
            self.finished_edges.insert(edge);
        } else {
            *self.counts.entry(edge.start).or_insert(0) += 1;
        }
    }

    fn enqueue_if_ready(&mut self, node: GlobalTaskId) {
        if self.finished_nodes.contains(&node) {
            return;
        }
        if self.counts.get(&node).copied().unwrap_or(0) == 0 {
            self.counts.remove(&node);
            self.enqueue(node);
        }
    }

    fn enqueue(&mut self, node: GlobalTaskId) {
        self.outstanding += 1;
        tracing::debug!(%node, "task ready");
        if let Some(ready) = &self.ready {
            // the receiver only goes away with the whole run
            let _ = ready.send(node);
        }
    }

    fn mark_failed(&mut self, node: GlobalTaskId) -> bool {
        if !self.finished_nodes.insert(node) {
            return false;
        }
        self.failed.insert(node);
        self.counts.remove(&node);
        true
    }

    fn fail_with_cause(&mut self, task: GlobalTaskId, cause: GlobalTaskId, out: &mut Vec<Failure>) {
        if self.mark_failed(task) {
            out.push(Failure { task, cause });
            self.cascade(vec![task], out);
        }
    }

    /// Fails everything waiting on `roots`, which are already failed.
    fn cascade(&mut self, roots: Vec<GlobalTaskId>, out: &mut Vec<Failure>) {
        let mut stack = roots;
        while let Some(node) = stack.pop() {
            let incoming = self.by_end.get(&node).cloned().unwrap_or_default();
            for edge in incoming {
                if !self.finished_edges.insert(edge) {
                    continue;
                }
                if self.mark_failed(edge.start) {
                    out.push(Failure {
                        task: edge.start,
                        cause: node,
                    });
                    stack.push(edge.start);
                }
            }
        }
    }

    fn all_finished(&self) -> bool {
        self.finished_nodes.len() == self.nodes.len()
    }

    fn close_if_finished(&mut self) {
        if self.all_finished() && self.ready.take().is_some() {
            tracing::debug!(tasks = self.nodes.len(), "all tasks finished");
        }
    }

    fn abort(&mut self, err: SchedulerError) {
        tracing::error!("aborting run: {err}");
        self.error.get_or_insert(err);
        self.ready = None;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc::TryRecvError;

    use super::*;
    use crate::ast::{AstId, Script};
    use crate::graph::global::{Project, ProjectId, ProjectKind, TaskContext};
    use crate::graph::{EdgeKind, NodeKey, TaskGraph, TaskId, TaskNode};
    use crate::name::NameTable;
    use crate::value::Value;

    /// Registers a main project with `count` literal nodes and the given
    /// required edges.
    fn globals(count: usize, edges: &[(usize, usize)]) -> Arc<GlobalTaskGraph> {
        let mut graph = TaskGraph::new();
        for i in 0..count {
            graph
                .add_node(NodeKey::Expr(AstId(i as u32)), TaskNode::Literal(Value::None))
                .unwrap();
        }
        for &(start, end) in edges {
            graph.add_edge(TaskId::new(start), TaskId::new(end), EdgeKind::Value);
        }

        let globals = Arc::new(GlobalTaskGraph::new());
        let script = Script {
            package: None,
            defs: vec![],
        };
        globals.add_project(Project {
            id: ProjectId::MAIN,
            kind: ProjectKind::Main,
            location: None,
            package: None,
            names: Arc::new(NameTable::build(&script, None).unwrap()),
            graph,
            natives: None,
        });
        globals
    }

    fn gid(index: usize) -> GlobalTaskId {
        GlobalTaskId::new(TaskContext::plain(ProjectId::MAIN), TaskId::new(index))
    }

    fn drain(rx: &Receiver<GlobalTaskId>) -> (Vec<GlobalTaskId>, bool) {
        let mut out = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(id) => out.push(id),
                Err(TryRecvError::Empty) => return (out, false),
                Err(TryRecvError::Disconnected) => return (out, true),
            }
        }
    }

    struct Rng(u64);

    impl Rng {
        fn below(&mut self, n: usize) -> usize {
            self.0 ^= self.0 << 13;
            self.0 ^= self.0 >> 7;
            self.0 ^= self.0 << 17;
            (self.0 % n as u64) as usize
        }
    }

    #[test]
    fn test_random_dags_finish_every_node_once() {
        for seed in 1..=40u64 {
            let mut rng = Rng(seed.wrapping_mul(0x9E37_79B9_7F4A_7C15));
            // ready order comes from its own stream so it doesn't follow the shape
            let mut order = Rng(seed.wrapping_mul(0xD1B5_4A32_D192_ED03) | 1);
            let count = 2 + rng.below(30);
            let mut edges = Vec::new();
            for start in 0..count {
                for end in start + 1..count {
                    if rng.below(4) == 0 {
                        edges.push((start, end));
                    }
                }
            }

            let (deps, rx) = DepsGraph::new(globals(count, &edges));
            deps.add_nodes_and_reachables((0..count).map(gid)).unwrap();

            let mut ready = Vec::new();
            let mut seen = HashSet::new();
            let mut finished = HashSet::new();
            loop {
                let (fresh, closed) = drain(&rx);
                for id in fresh {
                    assert!(seen.insert(id), "seed {seed}: {id} queued twice");
                    let deps_done = edges
                        .iter()
                        .filter(|(start, _)| gid(*start) == id)
                        .all(|(_, end)| finished.contains(&gid(*end)));
                    assert!(deps_done, "seed {seed}: {id} queued before its dependencies");
                    ready.push(id);
                }
                if ready.is_empty() {
                    assert!(closed, "seed {seed}: queue stalled");
                    break;
                }

                let id = ready.swap_remove(order.below(ready.len()));
                deps.finish_node(id).unwrap();
                assert_eq!(deps.settle().unwrap(), Settled::default());
                finished.insert(id);
            }

            assert_eq!(finished.len(), count, "seed {seed}");
            assert!(deps.is_done());
        }
    }

    #[test]
    fn test_finishing_twice_is_an_error() {
        let (deps, rx) = DepsGraph::new(globals(2, &[]));
        deps.add_nodes_and_reachables([gid(0)]).unwrap();
        assert_eq!(drain(&rx).0, vec![gid(0)]);

        deps.finish_node(gid(0)).unwrap();
        assert!(matches!(
            deps.finish_node(gid(0)),
            Err(SchedulerError::NodeFinishedTwice(_))
        ));
    }

    #[test]
    fn test_added_edges_park_the_task_again() {
        // 1 -> 2 is a local edge, 0 -> 1 is only found while evaluating 0
        let (deps, rx) = DepsGraph::new(globals(3, &[(1, 2)]));
        deps.add_nodes_and_reachables([gid(0)]).unwrap();
        assert_eq!(drain(&rx).0, vec![gid(0)]);

        let edge = GlobalTaskEdge {
            start: gid(0),
            end: gid(1),
            kind: EdgeKind::Value,
        };
        deps.add_edges(vec![edge]).unwrap();
        deps.settle().unwrap();
        assert_eq!(drain(&rx).0, vec![gid(2)]);

        deps.finish_node(gid(2)).unwrap();
        deps.settle().unwrap();
        assert_eq!(drain(&rx).0, vec![gid(1)]);

        deps.finish_node(gid(1)).unwrap();
        deps.settle().unwrap();
        assert_eq!(drain(&rx).0, vec![gid(0)]);

        // asking again for a finished task queues the start right away
        deps.add_edges(vec![edge]).unwrap();
        deps.settle().unwrap();
        assert_eq!(drain(&rx).0, vec![gid(0)]);

        deps.finish_node(gid(0)).unwrap();
        deps.settle().unwrap();
        let (rest, closed) = drain(&rx);
        assert!(rest.is_empty());
        assert!(closed);
        assert!(deps.is_done());
    }

    #[test]
    fn test_failure_propagates_to_waiting_tasks() {
        let (deps, rx) = DepsGraph::new(globals(3, &[(0, 1), (1, 2)]));
        deps.add_nodes_and_reachables([gid(0)]).unwrap();
        assert_eq!(drain(&rx).0, vec![gid(2)]);

        let failures = deps.fail_node(gid(2)).unwrap();
        assert_eq!(
            failures,
            vec![
                Failure {
                    task: gid(1),
                    cause: gid(2)
                },
                Failure {
                    task: gid(0),
                    cause: gid(1)
                },
            ]
        );
        deps.settle().unwrap();
        assert!(drain(&rx).1);

        // a late edge to a failed task fails its start
        let (deps, _rx) = DepsGraph::new(globals(3, &[]));
        deps.add_nodes_and_reachables([gid(0), gid(1)]).unwrap();
        deps.fail_node(gid(1)).unwrap();
        let failures = deps
            .add_edges(vec![GlobalTaskEdge {
                start: gid(0),
                end: gid(1),
                kind: EdgeKind::Value,
            }])
            .unwrap();
        assert_eq!(
            failures,
            vec![Failure {
                task: gid(0),
                cause: gid(1)
            }]
        );
    }

    #[test]
    fn test_cycles_fail_instead_of_hanging() {
        let (deps, rx) = DepsGraph::new(globals(4, &[(0, 1), (1, 2), (2, 1), (3, 3)]));
        deps.add_nodes_and_reachables([gid(0), gid(3)]).unwrap();
        assert!(drain(&rx).0.is_empty());

        let settled = deps.check_stalled().unwrap();
        let mut cycles: Vec<Vec<_>> = settled
            .cycles
            .into_iter()
            .map(|mut cycle| {
                cycle.sort();
                cycle
            })
            .collect();
        cycles.sort();
        assert_eq!(cycles, vec![vec![gid(1), gid(2)], vec![gid(3)]]);
        assert_eq!(settled.failures.len(), 1);
        assert_eq!(settled.failures[0].task, gid(0));
        assert!(drain(&rx).1);
        assert_eq!(deps.error(), None);
    }
}
