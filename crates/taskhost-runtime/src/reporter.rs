//! Human-readable run progress lines.

use std::collections::HashMap;
use std::io::Write;
use std::sync::{Mutex, PoisonError};

use tracing::debug;

use taskhost_core::{Run, RunId};

/// Lifecycle events the reporter renders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunEvent {
    Enqueued,
    Running,
    Completed,
    Failed,
}

impl RunEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Enqueued => "enqueued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone)]
struct Placement {
    task_name: String,
    depth: usize,
}

/// Writes one line per run event, nesting subtasks under their parent.
///
/// Purely cosmetic: nothing reads its state back.
pub struct StatusReporter {
    out: Mutex<Box<dyn Write + Send>>,
    placements: Mutex<HashMap<RunId, Placement>>,
}

impl StatusReporter {
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self {
            out: Mutex::new(out),
            placements: Mutex::new(HashMap::new()),
        }
    }

    pub fn stderr() -> Self {
        Self::new(Box::new(std::io::stderr()))
    }

    pub fn report(&self, run: &Run, event: RunEvent) {
        let (depth, parent_task) = {
            let mut placements = self.placements.lock().unwrap_or_else(PoisonError::into_inner);
            let parent = run
                .parent_run_id
                .as_ref()
                .and_then(|id| placements.get(id))
                .cloned();
            let depth = parent.as_ref().map_or(0, |p| p.depth + 1);

            if event.is_terminal() {
                placements.remove(&run.id);
            } else {
                placements.insert(
                    run.id.clone(),
                    Placement {
                        task_name: run.task_name.clone(),
                        depth,
                    },
                );
            }
            (depth, parent.map(|p| p.task_name))
        };

        let line = format_event(run, event, depth, parent_task.as_deref());
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = writeln!(out, "{line}") {
            debug!(error = %e, "Failed to write status line");
        }
    }
}

/// Render one status line.
pub fn format_event(run: &Run, event: RunEvent, depth: usize, parent_task: Option<&str>) -> String {
    let mut line = "  ".repeat(depth);
    if depth > 0 {
        line.push_str("└ ");
    }
    line.push_str(&run.task_name);
    if let Some(parent) = parent_task {
        line.push_str(&format!(" (subtask of {parent})"));
    }
    line.push(' ');
    line.push_str(event.label());

    if event.is_terminal() {
        if let Some(elapsed) = run.duration() {
            line.push_str(&format!(" in {}", format_elapsed(elapsed)));
        }
        if let (RunEvent::Failed, Some(error)) = (event, &run.error) {
            line.push_str(&format!(": {error}"));
        }
    }
    line
}

fn format_elapsed(elapsed: chrono::Duration) -> String {
    let ms = elapsed.num_milliseconds().max(0);
    if ms < 1000 {
        format!("{ms}ms")
    } else {
        format!("{:.1}s", ms as f64 / 1000.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use taskhost_core::RunOutcome;

    #[derive(Clone, Default)]
    struct Buffer(Arc<Mutex<Vec<u8>>>);

    impl Write for Buffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Buffer {
        fn lines(&self) -> Vec<String> {
            String::from_utf8(self.0.lock().unwrap().clone())
                .unwrap()
                .lines()
                .map(str::to_string)
                .collect()
        }
    }

    #[test]
    fn test_format_top_level_and_failure() {
        let mut run = Run::new("flaky", Vec::new(), None);
        assert_eq!(format_event(&run, RunEvent::Running, 0, None), "flaky running");

        run.started_at = run.started_at - chrono::Duration::milliseconds(1500);
        run.finish(RunOutcome::Failed("boom".into())).unwrap();
        let line = format_event(&run, RunEvent::Failed, 0, None);
        assert!(line.starts_with("flaky failed in "));
        assert!(line.ends_with(": boom"));
    }

    #[test]
    fn test_subtasks_are_nested_under_parent() {
        let buffer = Buffer::default();
        let reporter = StatusReporter::new(Box::new(buffer.clone()));

        let parent = Run::new("parent", Vec::new(), None);
        let mut child = Run::new("child", Vec::new(), Some(parent.id.clone()));

        reporter.report(&parent, RunEvent::Running);
        reporter.report(&child, RunEvent::Running);
        child.finish(RunOutcome::Complete(Vec::new())).unwrap();
        reporter.report(&child, RunEvent::Completed);

        let lines = buffer.lines();
        assert_eq!(lines[0], "parent running");
        assert_eq!(lines[1], "  └ child (subtask of parent) running");
        assert!(lines[2].starts_with("  └ child (subtask of parent) completed in "));
    }
}
