use std::collections::HashMap;
use std::fmt::Write;
use std::time::Duration;

use crate::engine::runner::TaskExecution;
use crate::graph::global::{GlobalTaskEdge, GlobalTaskId};

/// Timing of one [`Engine::build`](crate::Engine::build) call.
#[derive(Debug, Default)]
pub struct Diagnostics {
    /// Wall-clock time spent evaluating each task, summed over its runs.
    pub execution_times: HashMap<GlobalTaskId, TaskExecution>,
    /// Every edge the scheduler knew of at the end of the run.
    pub edges: Vec<GlobalTaskEdge>,
    /// `package:node` labels of the tasks above.
    pub labels: HashMap<GlobalTaskId, String>,
}

impl Diagnostics {
    fn label(&self, id: GlobalTaskId) -> String {
        self.labels.get(&id).cloned().unwrap_or_else(|| id.to_string())
    }

    /// Total time spent evaluating tasks, across all workers.
    pub fn total_time(&self) -> Duration {
        self.execution_times.values().map(|exec| exec.duration).sum()
    }

    /// Renders the tasks of the run as a Mermaid diagram, color-coded by
    /// execution duration.
    ///
    /// * **Green**: Fast
    /// * **Yellow**: Moderate
    /// * **Red**: Slow
    /// * **Blue**: Not evaluated (failed along with a dependency)
    pub fn render_mermaid(&self) -> String {
        let mut f = String::new();
        let _ = self.write_mermaid(&mut f);
        f
    }

    fn write_mermaid(&self, f: &mut String) -> std::fmt::Result {
        writeln!(f, "graph LR")?;

        let times = &self.execution_times;
        let mut min_time = f64::MAX;
        let mut max_time = f64::MIN;
        for t in times.values() {
            let secs = t.duration.as_secs_f64();
            min_time = min_time.min(secs);
            max_time = max_time.max(secs);
        }

        if min_time > max_time {
            min_time = 0.0;
            max_time = 0.0;
        }
        if (max_time - min_time).abs() < f64::EPSILON {
            max_time = min_time + 1.0;
        }

        let mut nodes: Vec<GlobalTaskId> = self.labels.keys().copied().collect();
        nodes.sort();
        let index: HashMap<GlobalTaskId, usize> = nodes.iter().enumerate().map(|(i, id)| (*id, i)).collect();

        for (i, id) in nodes.iter().enumerate() {
            let name = self.label(*id).replace('"', "\\\"");

            let (label_extra, color_code) = match times.get(id) {
                Some(exec) => {
                    let t = (exec.duration.as_secs_f64() - min_time) / (max_time - min_time);
                    (format!("{:.2?}", exec.duration), heat(t))
                }
                None => ("Skipped".to_string(), "#ADD8E6".to_string()),
            };

            writeln!(f, "    {i}[\"{name}\\n{label_extra}\"]")?;
            writeln!(f, "    style {i} fill:{color_code}")?;
        }

        let mut edges = self.edges.clone();
        edges.sort_by_key(|edge| (edge.start, edge.end));
        for edge in edges {
            if let (Some(start), Some(end)) = (index.get(&edge.start), index.get(&edge.end)) {
                writeln!(f, "    {end} -- \"{:?}\" --> {start}", edge.kind)?;
            }
        }

        Ok(())
    }
}

/// Green (0.0) to yellow (0.5) to red (1.0).
fn heat(t: f64) -> String {
    let (r, g, b) = if t < 0.5 {
        ((255.0 * t * 2.0) as u8, 255, 0)
    } else {
        (255, (255.0 * (1.0 - (t - 0.5) * 2.0)) as u8, 0)
    };
    format!("#{r:02X}{g:02X}{b:02X}")
}

impl Diagnostics {
    /// The `n` tasks that took longest, slowest first.
    pub fn slowest(&self, n: usize) -> Vec<(String, Duration)> {
        let mut ran: Vec<_> = self
            .execution_times
            .iter()
            .map(|(id, exec)| (exec.duration, *id))
            .collect();
        ran.sort_by(|a, b| b.cmp(a));
        ran.into_iter()
            .take(n)
            .map(|(duration, id)| (self.label(id), duration))
            .collect()
    }

    /// Logs a one-line summary and the slowest tasks of the run.
    pub fn log_summary(&self) {
        tracing::info!(
            tasks = self.execution_times.len(),
            edges = self.edges.len(),
            busy = ?self.total_time(),
            "build finished"
        );
        for (label, duration) in self.slowest(5) {
            tracing::debug!(task = %label, ?duration, "slow task");
        }
    }
}
