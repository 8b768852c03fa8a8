//! Task catalogue and run records.

use std::collections::HashMap;

use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

use taskhost_core::{CoreError, DiscoveredTask, Run, RunId, RunOutcome, Task};

#[derive(Default)]
struct StoreInner {
    /// Every task ever discovered, by name. Entries are never removed.
    known: HashMap<String, Task>,

    /// Names from the latest discovery pass, in reported order.
    catalogue: Vec<String>,

    /// Runs in start order.
    runs: Vec<Run>,

    /// Position of each run in `runs`.
    run_index: HashMap<RunId, usize>,
}

impl StoreInner {
    fn current_tasks(&self) -> impl Iterator<Item = &Task> {
        self.catalogue.iter().filter_map(|name| self.known.get(name))
    }
}

/// In-memory registry of tasks and runs.
///
/// Terminal run transitions are published to completion subscribers after
/// the lock is released. Publishing never waits on a subscriber.
pub struct TaskRunStore {
    inner: RwLock<StoreInner>,
    completed_tx: broadcast::Sender<Run>,
}

impl TaskRunStore {
    /// Create a store whose completion subscribers each buffer up to `capacity` runs.
    pub fn new(capacity: usize) -> Self {
        let (completed_tx, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: RwLock::new(StoreInner::default()),
            completed_tx,
        }
    }

    /// Replace the catalogue with a discovery result.
    ///
    /// Names seen before keep their id. Duplicate names keep the first entry.
    pub async fn set_tasks(&self, discovered: &[DiscoveredTask]) -> Vec<Task> {
        let mut inner = self.inner.write().await;

        let mut catalogue = Vec::with_capacity(discovered.len());
        for entry in discovered {
            if catalogue.contains(&entry.name) {
                continue;
            }
            if !inner.known.contains_key(&entry.name) {
                let task = Task::new(entry.name.clone());
                debug!(task = %task.name, task_id = %task.id, "New task discovered");
                inner.known.insert(entry.name.clone(), task);
            }
            catalogue.push(entry.name.clone());
        }
        inner.catalogue = catalogue;

        let tasks: Vec<Task> = inner.current_tasks().cloned().collect();
        info!(count = tasks.len(), "Task catalogue updated");
        tasks
    }

    /// Resolve an id or `workflow/taskName` identifier against the catalogue.
    pub async fn get_task(&self, identifier: &str) -> Option<Task> {
        let inner = self.inner.read().await;
        let task = inner
            .current_tasks()
            .find(|t| t.id.as_str() == identifier)
            .or_else(|| inner.current_tasks().find(|t| t.matches_identifier(identifier)))
            .cloned();
        task
    }

    pub async fn get_task_by_name(&self, name: &str) -> Option<Task> {
        let inner = self.inner.read().await;
        let task = inner.current_tasks().find(|t| t.name == name).cloned();
        task
    }

    /// Current catalogue in discovery order.
    pub async fn get_tasks(&self) -> Vec<Task> {
        self.inner.read().await.current_tasks().cloned().collect()
    }

    /// Runs of a task, oldest first.
    ///
    /// Resolves against every task ever discovered, so history survives a
    /// task disappearing from the catalogue.
    pub async fn get_task_runs(&self, identifier: &str) -> Result<Vec<Run>, CoreError> {
        let inner = self.inner.read().await;
        let task = inner
            .known
            .values()
            .find(|t| t.id.as_str() == identifier)
            .or_else(|| inner.known.values().find(|t| t.matches_identifier(identifier)))
            .ok_or_else(|| CoreError::TaskNotFound(identifier.to_string()))?;

        Ok(inner
            .runs
            .iter()
            .filter(|r| r.task_name == task.name)
            .cloned()
            .collect())
    }

    /// Record a new run in the `Running` state.
    ///
    /// The parent, if any, must already exist.
    pub async fn start_task_run(
        &self,
        task_name: &str,
        input: Vec<u8>,
        parent_run_id: Option<RunId>,
    ) -> Result<Run, CoreError> {
        let mut inner = self.inner.write().await;

        if let Some(parent) = &parent_run_id {
            if !inner.run_index.contains_key(parent) {
                return Err(CoreError::RunNotFound(parent.to_string()));
            }
        }

        let run = Run::new(task_name, input, parent_run_id);
        let position = inner.runs.len();
        inner.run_index.insert(run.id.clone(), position);
        inner.runs.push(run.clone());

        info!(
            run_id = %run.id,
            task = %run.task_name,
            parent_run_id = ?run.parent_run_id.as_ref().map(RunId::as_str),
            "Run started"
        );
        Ok(run)
    }

    pub async fn complete_task_run(&self, run_id: &RunId, output: Vec<u8>) -> Result<Run, CoreError> {
        self.finish_task_run(run_id, RunOutcome::Complete(output)).await
    }

    pub async fn fail_task_run(
        &self,
        run_id: &RunId,
        message: impl Into<String>,
    ) -> Result<Run, CoreError> {
        self.finish_task_run(run_id, RunOutcome::Failed(message.into()))
            .await
    }

    /// Apply a terminal outcome and notify completion subscribers.
    pub async fn finish_task_run(&self, run_id: &RunId, outcome: RunOutcome) -> Result<Run, CoreError> {
        let run = {
            let mut inner = self.inner.write().await;
            let position = *inner
                .run_index
                .get(run_id)
                .ok_or_else(|| CoreError::RunNotFound(run_id.to_string()))?;
            let run = &mut inner.runs[position];
            run.finish(outcome)?;
            run.clone()
        };

        info!(
            run_id = %run.id,
            task = %run.task_name,
            status = %run.status,
            error = ?run.error,
            "Run finished"
        );
        self.publish(run.clone());
        Ok(run)
    }

    /// Fail every run still `Running`. Used when the orchestrator shuts down.
    pub async fn fail_running_runs(&self, message: &str) -> Vec<Run> {
        let failed: Vec<Run> = {
            let mut inner = self.inner.write().await;
            inner
                .runs
                .iter_mut()
                .filter(|r| r.status.is_active())
                .filter_map(|r| {
                    r.finish(RunOutcome::Failed(message.to_string())).ok()?;
                    Some(r.clone())
                })
                .collect()
        };

        if !failed.is_empty() {
            warn!(count = failed.len(), reason = %message, "Failed in-flight runs");
        }
        for run in &failed {
            self.publish(run.clone());
        }
        failed
    }

    pub async fn get_run(&self, run_id: &RunId) -> Option<Run> {
        let inner = self.inner.read().await;
        inner
            .run_index
            .get(run_id)
            .and_then(|&position| inner.runs.get(position))
            .cloned()
    }

    /// Register a completion subscriber. Drop it (or pass it to
    /// [`remove_task_run_subscriber`](Self::remove_task_run_subscriber)) to unregister.
    pub fn add_task_run_subscriber(&self) -> RunSubscription {
        RunSubscription {
            rx: self.completed_tx.subscribe(),
        }
    }

    pub fn remove_task_run_subscriber(&self, subscription: RunSubscription) {
        drop(subscription);
        debug!(
            remaining = self.completed_tx.receiver_count(),
            "Completion subscriber removed"
        );
    }

    pub fn subscriber_count(&self) -> usize {
        self.completed_tx.receiver_count()
    }

    fn publish(&self, run: Run) {
        // No subscribers is not an error.
        let _ = self.completed_tx.send(run);
    }
}

/// Receives every run that reaches a terminal state after subscription.
pub struct RunSubscription {
    rx: broadcast::Receiver<Run>,
}

impl RunSubscription {
    /// Next completed run. Returns `None` once the store is gone.
    ///
    /// A subscriber that falls behind skips the oldest notifications.
    pub async fn recv(&mut self) -> Option<Run> {
        loop {
            match self.rx.recv().await {
                Ok(run) => return Some(run),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Completion subscriber lagged, skipping runs");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn into_receiver(self) -> broadcast::Receiver<Run> {
        self.rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskhost_core::RunStatus;

    fn discovered(names: &[&str]) -> Vec<DiscoveredTask> {
        names.iter().map(|n| DiscoveredTask::new(*n)).collect()
    }

    #[tokio::test]
    async fn test_set_tasks_preserves_ids() {
        let store = TaskRunStore::new(8);
        let first = store.set_tasks(&discovered(&["double", "flaky"])).await;
        let second = store.set_tasks(&discovered(&["double", "flaky"])).await;

        assert_eq!(first, second);
        assert_eq!(second.len(), 2);
    }

    #[tokio::test]
    async fn test_set_tasks_replaces_catalogue_but_keeps_identity() {
        let store = TaskRunStore::new(8);
        let first = store.set_tasks(&discovered(&["a", "b"])).await;
        store.set_tasks(&discovered(&["b"])).await;
        assert!(store.get_task("a").await.is_none());

        let again = store.set_tasks(&discovered(&["a", "b", "a"])).await;
        assert_eq!(again.len(), 2);
        assert_eq!(again[0].id, first[0].id);
    }

    #[tokio::test]
    async fn test_get_task_by_id_or_suffix() {
        let store = TaskRunStore::new(8);
        let tasks = store.set_tasks(&discovered(&["double"])).await;
        let id = tasks[0].id.clone();

        assert_eq!(store.get_task(id.as_str()).await.unwrap().name, "double");
        assert_eq!(store.get_task("math/double").await.unwrap().id, id);
        assert_eq!(store.get_task_by_name("double").await.unwrap().id, id);
        assert!(store.get_task("math/triple").await.is_none());
    }

    #[tokio::test]
    async fn test_resolves_task_names_with_slashes() {
        let store = TaskRunStore::new(8);
        let tasks = store.set_tasks(&discovered(&["math/double"])).await;
        let id = tasks[0].id.clone();

        assert_eq!(store.get_task("math/double").await.unwrap().id, id);
        assert_eq!(store.get_task("wf/math/double").await.unwrap().id, id);
        assert_eq!(store.get_task_by_name("math/double").await.unwrap().id, id);

        store.start_task_run("math/double", Vec::new(), None).await.unwrap();
        assert_eq!(store.get_task_runs("math/double").await.unwrap().len(), 1);
        assert_eq!(store.get_task_runs("wf/math/double").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_run_lifecycle() {
        let store = TaskRunStore::new(8);
        store.set_tasks(&discovered(&["double"])).await;

        let run = store
            .start_task_run("double", b"[21]".to_vec(), None)
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Running);

        let done = store
            .complete_task_run(&run.id, b"[42]".to_vec())
            .await
            .unwrap();
        assert_eq!(done.status, RunStatus::Complete);
        assert!(done.completed_at.is_some());

        let again = store.fail_task_run(&run.id, "late failure").await;
        assert!(matches!(again, Err(CoreError::InvalidStateTransition { .. })));
        assert_eq!(
            store.get_run(&run.id).await.unwrap().status,
            RunStatus::Complete
        );
    }

    #[tokio::test]
    async fn test_unknown_run_and_parent() {
        let store = TaskRunStore::new(8);
        let missing = RunId::new("missing");

        assert!(matches!(
            store.complete_task_run(&missing, Vec::new()).await,
            Err(CoreError::RunNotFound(_))
        ));
        assert!(matches!(
            store.start_task_run("x", Vec::new(), Some(missing)).await,
            Err(CoreError::RunNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_task_runs_are_scoped_to_task() {
        let store = TaskRunStore::new(8);
        store.set_tasks(&discovered(&["a", "b"])).await;
        let parent = store.start_task_run("a", Vec::new(), None).await.unwrap();
        let child = store
            .start_task_run("b", Vec::new(), Some(parent.id.clone()))
            .await
            .unwrap();

        let runs = store.get_task_runs("b").await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].id, child.id);
        assert_eq!(runs[0].parent_run_id.as_ref(), Some(&parent.id));
        assert!(matches!(
            store.get_task_runs("zzz").await,
            Err(CoreError::TaskNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_completion_fan_out_to_all_subscribers() {
        let store = TaskRunStore::new(8);
        let mut first = store.add_task_run_subscriber();
        let mut second = store.add_task_run_subscriber();
        assert_eq!(store.subscriber_count(), 2);

        let run = store.start_task_run("t", Vec::new(), None).await.unwrap();
        store.fail_task_run(&run.id, "boom").await.unwrap();

        assert_eq!(first.recv().await.unwrap().id, run.id);
        assert_eq!(second.recv().await.unwrap().error.as_deref(), Some("boom"));

        store.remove_task_run_subscriber(second);
        assert_eq!(store.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_slow_subscriber_does_not_block_store() {
        let store = TaskRunStore::new(1);
        let mut slow = store.add_task_run_subscriber();

        let mut ids = Vec::new();
        for _ in 0..3 {
            let run = store.start_task_run("t", Vec::new(), None).await.unwrap();
            store.complete_task_run(&run.id, Vec::new()).await.unwrap();
            ids.push(run.id);
        }

        // Only the newest notification survives; the older ones were dropped.
        assert_eq!(slow.recv().await.unwrap().id, ids[2]);
    }

    #[tokio::test]
    async fn test_fail_running_runs() {
        let store = TaskRunStore::new(8);
        let done = store.start_task_run("t", Vec::new(), None).await.unwrap();
        store.complete_task_run(&done.id, Vec::new()).await.unwrap();
        let running = store.start_task_run("t", Vec::new(), None).await.unwrap();

        let failed = store.fail_running_runs("shutting down").await;
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, running.id);
        assert_eq!(
            store.get_run(&done.id).await.unwrap().status,
            RunStatus::Complete
        );
    }
}
