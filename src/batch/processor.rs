//! Concurrency-limited batch task processor.
//!
//! Tasks are admitted synchronously and run on the tokio runtime, at most
//! `max_concurrent` at a time. Whenever a running slot frees up (completion,
//! failure or cancellation) the backlog is scanned in submission order and
//! the first pending tasks are promoted until the slots are full again.
//! Slot bookkeeping and the promotion scan share one critical section.

use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::handler::{HandlerRegistry, ProgressReporter, TaskError, TaskHandler};
use super::task::{NewTask, Task, TaskId, TaskKind, TaskStatus};
use crate::config::BatchConfig;
use crate::error::{PressgateError, Result};

/// Counts of tasks by lifecycle state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProcessorStats {
    pub max_concurrent: usize,
    pub running: usize,
    pub pending: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub total: usize,
}

/// Admits tasks and runs them with bounded concurrency.
///
/// Cloning is cheap; clones share the same state. Submitting requires a
/// tokio runtime.
#[derive(Clone)]
pub struct BatchProcessor {
    inner: Arc<Inner>,
}

struct Inner {
    max_concurrent: usize,
    task_timeout: Option<Duration>,
    registry: HandlerRegistry,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    tasks: HashMap<TaskId, TaskEntry>,
    /// Task ids per owner, in submission order
    owners: HashMap<String, Vec<TaskId>>,
    /// Ids awaiting promotion, in submission order. Cancelled ids are skipped
    /// when reached.
    backlog: VecDeque<TaskId>,
    running: HashSet<TaskId>,
}

struct TaskEntry {
    task: Task,
    cancel: CancellationToken,
}

/// A task promoted to running, ready to be spawned.
struct Launch {
    id: TaskId,
    handler: Arc<dyn TaskHandler>,
    parameters: Value,
    cancel: CancellationToken,
}

enum Outcome {
    Completed(Value),
    Failed(String),
    Cancelled,
}

impl BatchProcessor {
    /// Create a processor from configuration and a handler registry.
    pub fn new(config: &BatchConfig, registry: HandlerRegistry) -> Result<Self> {
        config.validate()?;
        Ok(Self::with_limits(
            config.max_concurrent,
            config.task_timeout(),
            registry,
        ))
    }

    fn with_limits(
        max_concurrent: usize,
        task_timeout: Option<Duration>,
        registry: HandlerRegistry,
    ) -> Self {
        info!(
            max_concurrent,
            timeout_secs = task_timeout.map(|t| t.as_secs()),
            kinds = ?registry.kinds(),
            "Batch processor initialized"
        );
        Self {
            inner: Arc::new(Inner {
                max_concurrent,
                task_timeout,
                registry,
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Admit a task and return its id.
    ///
    /// The task starts right away if a slot is free, otherwise it waits in
    /// the backlog. Invalid input is rejected before any state changes.
    pub fn submit(&self, new_task: NewTask) -> Result<TaskId> {
        let kind: TaskKind = new_task.kind.parse()?;
        if new_task.owner.trim().is_empty() {
            return Err(PressgateError::InvalidTask(
                "owner must not be empty".to_string(),
            ));
        }
        if !new_task.parameters.is_object() {
            return Err(PressgateError::InvalidTask(
                "parameters must be a JSON object".to_string(),
            ));
        }
        if !self.inner.registry.contains(kind) {
            return Err(PressgateError::NoHandler(kind));
        }

        let task = Task::pending(
            Uuid::new_v4(),
            kind,
            new_task.owner,
            new_task.parameters,
            new_task.created_at.unwrap_or_else(Utc::now),
        );
        let id = task.id;

        let launches = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            state
                .owners
                .entry(task.owner.clone())
                .or_default()
                .push(id);
            state.tasks.insert(
                id,
                TaskEntry {
                    task,
                    cancel: CancellationToken::new(),
                },
            );
            state.backlog.push_back(id);
            self.inner.promote(state)
        };

        info!(task_id = %id, kind = %kind, "Task submitted");
        self.inner.launch(launches);
        Ok(id)
    }

    /// Snapshot of one task.
    pub fn get_status(&self, id: TaskId) -> Option<Task> {
        let state = self.inner.state.lock();
        state.tasks.get(&id).map(|entry| entry.task.clone())
    }

    /// Every task submitted by `owner`, in submission order.
    pub fn list_for_owner(&self, owner: &str) -> Vec<Task> {
        let state = self.inner.state.lock();
        state
            .owners
            .get(owner)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| state.tasks.get(id))
                    .map(|entry| entry.task.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Cancel a task that has not finished yet.
    ///
    /// A pending task goes straight to `cancelled`. A running task is marked
    /// `cancelled` at once, its slot is handed to the backlog, and its
    /// handler is signalled; the handler future is dropped at its next
    /// suspension point. Work that never yields keeps running until it does,
    /// but its progress and outcome are no longer recorded. Returns `false`
    /// for unknown or already finished tasks.
    pub fn cancel(&self, id: TaskId) -> bool {
        let launches = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            let Some(entry) = state.tasks.get_mut(&id) else {
                return false;
            };

            match entry.task.status {
                TaskStatus::Pending => {
                    entry.task.cancel(Utc::now());
                    Vec::new()
                }
                TaskStatus::Running => {
                    entry.cancel.cancel();
                    entry.task.cancel(Utc::now());
                    state.running.remove(&id);
                    self.inner.promote(state)
                }
                _ => return false,
            }
        };

        info!(task_id = %id, "Task cancelled");
        self.inner.launch(launches);
        true
    }

    /// Counts of tasks by state.
    pub fn stats(&self) -> ProcessorStats {
        let state = self.inner.state.lock();
        let mut stats = ProcessorStats {
            max_concurrent: self.inner.max_concurrent,
            running: state.running.len(),
            total: state.tasks.len(),
            ..ProcessorStats::default()
        };
        for entry in state.tasks.values() {
            match entry.task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
                TaskStatus::Cancelled => stats.cancelled += 1,
                TaskStatus::Running => {}
            }
        }
        stats
    }

    /// The configured concurrency limit.
    pub fn max_concurrent(&self) -> usize {
        self.inner.max_concurrent
    }
}

impl Inner {
    /// Fill free slots from the backlog, oldest first.
    ///
    /// Must be called with the state lock held; the returned launches are
    /// spawned after the lock is released.
    fn promote(&self, state: &mut State) -> Vec<Launch> {
        let mut launches = Vec::new();

        while state.running.len() < self.max_concurrent {
            let Some(id) = state.backlog.pop_front() else {
                break;
            };
            let Some(entry) = state.tasks.get_mut(&id) else {
                continue;
            };
            if entry.task.status != TaskStatus::Pending {
                continue;
            }

            let now = Utc::now();
            let Some(handler) = self.registry.get(entry.task.kind) else {
                // The registry is fixed at construction and checked on submit
                entry.task.start(now);
                entry
                    .task
                    .fail(format!("no handler registered for {}", entry.task.kind), now);
                continue;
            };

            entry.task.start(now);
            state.running.insert(id);
            debug!(task_id = %id, running = state.running.len(), "Task promoted");

            launches.push(Launch {
                id,
                handler,
                parameters: entry.task.parameters.clone(),
                cancel: entry.cancel.clone(),
            });
        }

        launches
    }

    fn launch(self: &Arc<Self>, launches: Vec<Launch>) {
        for launch in launches {
            tokio::spawn(Arc::clone(self).run(launch));
        }
    }

    async fn run(self: Arc<Self>, launch: Launch) {
        let Launch {
            id,
            handler,
            parameters,
            cancel,
        } = launch;

        let reporter = {
            let inner = Arc::downgrade(&self);
            ProgressReporter::new(move |percent| {
                if let Some(inner) = inner.upgrade() {
                    inner.report_progress(id, percent);
                }
            })
        };

        let timeout = self.task_timeout;
        let execution = async {
            let guarded = AssertUnwindSafe(handler.execute(&parameters, &reporter, &cancel))
                .catch_unwind();
            let result = match timeout {
                Some(limit) => match tokio::time::timeout(limit, guarded).await {
                    Ok(result) => result,
                    Err(_) => {
                        return Outcome::Failed(format!(
                            "task timed out after {}s",
                            limit.as_secs()
                        ))
                    }
                },
                None => guarded.await,
            };

            match result {
                Ok(Ok(value)) => Outcome::Completed(value),
                Ok(Err(TaskError::Cancelled)) => Outcome::Cancelled,
                Ok(Err(e)) => Outcome::Failed(e.to_string()),
                Err(_) => Outcome::Failed("handler panicked".to_string()),
            }
        };

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Outcome::Cancelled,
            outcome = execution => outcome,
        };

        self.finish(id, outcome);
    }

    fn report_progress(&self, id: TaskId, percent: u8) {
        let mut state = self.state.lock();
        if let Some(entry) = state.tasks.get_mut(&id) {
            entry.task.advance(percent);
        }
    }

    /// Record a task's outcome, free its slot and promote from the backlog.
    fn finish(self: &Arc<Self>, id: TaskId, outcome: Outcome) {
        let launches = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let Some(entry) = state.tasks.get_mut(&id) else {
                return;
            };

            let now = Utc::now();
            match outcome {
                Outcome::Completed(value) => {
                    if entry.task.complete(value, now) {
                        info!(task_id = %id, "Task completed");
                    }
                }
                Outcome::Failed(error) => {
                    warn!(task_id = %id, error = %error, "Task failed");
                    entry.task.fail(error, now);
                }
                Outcome::Cancelled => {
                    entry.task.cancel(now);
                }
            }

            // Already released if the task was cancelled while running
            if !state.running.remove(&id) {
                return;
            }
            self.promote(state)
        };

        self.launch(launches);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::Notify;

    /// Blocks each task until its named gate is opened.
    #[derive(Default)]
    struct GateHandler {
        gates: Mutex<HashMap<String, Arc<Notify>>>,
    }

    impl GateHandler {
        fn gate(&self, name: &str) -> Arc<Notify> {
            self.gates
                .lock()
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Notify::new()))
                .clone()
        }

        fn open(&self, name: &str) {
            self.gate(name).notify_one();
        }
    }

    #[async_trait]
    impl TaskHandler for GateHandler {
        async fn execute(
            &self,
            parameters: &Value,
            progress: &ProgressReporter,
            _cancel: &CancellationToken,
        ) -> std::result::Result<Value, TaskError> {
            if parameters.get("panic").is_some() {
                panic!("handler blew up");
            }

            let name = parameters["gate"].as_str().unwrap_or_default().to_string();
            progress.report(10);
            self.gate(&name).notified().await;

            if parameters.get("fail").is_some() {
                return Err(TaskError::Failed("boom".to_string()));
            }
            Ok(json!({ "gate": name }))
        }
    }

    fn processor(max_concurrent: usize) -> (BatchProcessor, Arc<GateHandler>) {
        processor_with_timeout(max_concurrent, None)
    }

    fn processor_with_timeout(
        max_concurrent: usize,
        timeout: Option<Duration>,
    ) -> (BatchProcessor, Arc<GateHandler>) {
        let gates = Arc::new(GateHandler::default());
        let registry = HandlerRegistry::new().with(TaskKind::ContentGeneration, gates.clone());
        (
            BatchProcessor::with_limits(max_concurrent, timeout, registry),
            gates,
        )
    }

    fn gated(owner: &str, gate: &str) -> NewTask {
        NewTask::new("content-generation", owner, json!({ "gate": gate }))
    }

    fn status(processor: &BatchProcessor, id: TaskId) -> TaskStatus {
        processor.get_status(id).unwrap().status
    }

    async fn wait_for<F>(processor: &BatchProcessor, id: TaskId, predicate: F) -> Task
    where
        F: Fn(&Task) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(task) = processor.get_status(id) {
                    if predicate(&task) {
                        return task;
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("task did not reach the expected state")
    }

    #[tokio::test]
    async fn test_fifo_promotion_scenario() {
        let (processor, gates) = processor(2);

        let a = processor.submit(gated("u1", "a")).unwrap();
        let b = processor.submit(gated("u1", "b")).unwrap();
        let c = processor.submit(gated("u1", "c")).unwrap();

        assert_eq!(status(&processor, a), TaskStatus::Running);
        assert_eq!(status(&processor, b), TaskStatus::Running);
        assert_eq!(status(&processor, c), TaskStatus::Pending);

        gates.open("a");
        let done = wait_for(&processor, a, |t| t.status == TaskStatus::Completed).await;
        assert_eq!(done.progress, 100);
        assert_eq!(done.result, Some(json!({"gate": "a"})));
        assert!(done.completed_at.is_some());

        assert_eq!(status(&processor, c), TaskStatus::Running);
        assert_eq!(status(&processor, b), TaskStatus::Running);
        assert_eq!(processor.stats().running, 2);

        gates.open("b");
        gates.open("c");
        wait_for(&processor, b, |t| t.status == TaskStatus::Completed).await;
        wait_for(&processor, c, |t| t.status == TaskStatus::Completed).await;
        assert_eq!(processor.stats().running, 0);
    }

    #[tokio::test]
    async fn test_one_more_than_capacity_leaves_one_pending() {
        let (processor, _gates) = processor(3);

        let ids: Vec<_> = (0..4)
            .map(|i| processor.submit(gated("u1", &format!("g{}", i))).unwrap())
            .collect();

        let statuses: Vec<_> = ids.iter().map(|id| status(&processor, *id)).collect();
        assert_eq!(
            statuses.iter().filter(|s| **s == TaskStatus::Running).count(),
            3
        );
        assert_eq!(statuses[3], TaskStatus::Pending);

        let stats = processor.stats();
        assert_eq!(stats.running, 3);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.total, 4);
    }

    #[tokio::test]
    async fn test_backlog_drains_in_submission_order() {
        let (processor, gates) = processor(1);

        let first = processor.submit(gated("u1", "first")).unwrap();
        let second = processor.submit(gated("u1", "second")).unwrap();
        let third = processor.submit(gated("u1", "third")).unwrap();

        gates.open("first");
        wait_for(&processor, second, |t| t.status == TaskStatus::Running).await;
        assert_eq!(status(&processor, first), TaskStatus::Completed);
        assert_eq!(status(&processor, third), TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_cancel_pending_task() {
        let (processor, gates) = processor(1);

        let running = processor.submit(gated("u1", "a")).unwrap();
        let queued = processor.submit(gated("u1", "b")).unwrap();
        let after = processor.submit(gated("u1", "c")).unwrap();

        assert!(processor.cancel(queued));
        let task = processor.get_status(queued).unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert!(task.started_at.is_none());
        assert!(task.completed_at.is_some());

        // The cancelled task is skipped when the slot frees up
        gates.open("a");
        wait_for(&processor, after, |t| t.status == TaskStatus::Running).await;
        assert_eq!(status(&processor, running), TaskStatus::Completed);
        assert_eq!(status(&processor, queued), TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_running_task_frees_slot() {
        let (processor, gates) = processor(1);

        let running = processor.submit(gated("u1", "a")).unwrap();
        let queued = processor.submit(gated("u1", "b")).unwrap();

        assert!(processor.cancel(running));
        assert_eq!(status(&processor, running), TaskStatus::Cancelled);
        assert_eq!(status(&processor, queued), TaskStatus::Running);

        // Opening the cancelled task's gate must not resurrect it
        gates.open("a");
        tokio::time::sleep(Duration::from_millis(20)).await;
        let task = processor.get_status(running).unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert!(task.result.is_none());
        assert_eq!(processor.stats().running, 1);
    }

    #[tokio::test]
    async fn test_cancel_terminal_or_unknown_task() {
        let (processor, gates) = processor(1);

        let id = processor.submit(gated("u1", "a")).unwrap();
        gates.open("a");
        wait_for(&processor, id, |t| t.status == TaskStatus::Completed).await;

        assert!(!processor.cancel(id));
        assert!(!processor.cancel(Uuid::new_v4()));
        assert_eq!(status(&processor, id), TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_failure_is_isolated() {
        let (processor, gates) = processor(1);

        let failing = processor
            .submit(NewTask::new(
                "content-generation",
                "u1",
                json!({"gate": "a", "fail": true}),
            ))
            .unwrap();
        let next = processor.submit(gated("u1", "b")).unwrap();

        gates.open("a");
        let task = wait_for(&processor, failing, |t| t.status == TaskStatus::Failed).await;
        assert_eq!(task.error.as_deref(), Some("boom"));
        assert!(task.completed_at.is_some());
        assert!(task.progress < 100);

        gates.open("b");
        wait_for(&processor, next, |t| t.status == TaskStatus::Completed).await;
    }

    #[tokio::test]
    async fn test_panicking_handler_fails_task() {
        let (processor, gates) = processor(1);

        let panicking = processor
            .submit(NewTask::new("content-generation", "u1", json!({"panic": true})))
            .unwrap();
        let next = processor.submit(gated("u1", "b")).unwrap();

        let task = wait_for(&processor, panicking, |t| t.status == TaskStatus::Failed).await;
        assert_eq!(task.error.as_deref(), Some("handler panicked"));

        gates.open("b");
        wait_for(&processor, next, |t| t.status == TaskStatus::Completed).await;
    }

    #[tokio::test]
    async fn test_task_timeout() {
        let (processor, _gates) = processor_with_timeout(1, Some(Duration::from_secs(1)));

        let id = processor.submit(gated("u1", "never")).unwrap();
        let task = wait_for(&processor, id, |t| t.status == TaskStatus::Failed).await;
        assert_eq!(task.error.as_deref(), Some("task timed out after 1s"));
    }

    #[tokio::test]
    async fn test_progress_is_tracked() {
        let (processor, gates) = processor(1);

        let id = processor.submit(gated("u1", "a")).unwrap();
        let task = wait_for(&processor, id, |t| t.progress == 10).await;
        assert_eq!(task.status, TaskStatus::Running);

        gates.open("a");
        let task = wait_for(&processor, id, |t| t.status == TaskStatus::Completed).await;
        assert_eq!(task.progress, 100);
    }

    #[tokio::test]
    async fn test_list_for_owner() {
        let (processor, gates) = processor(2);

        let first = processor.submit(gated("u1", "a")).unwrap();
        let other = processor.submit(gated("u2", "b")).unwrap();
        let second = processor.submit(gated("u1", "c")).unwrap();

        gates.open("a");
        wait_for(&processor, first, |t| t.status == TaskStatus::Completed).await;

        let tasks = processor.list_for_owner("u1");
        let ids: Vec<_> = tasks.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![first, second]);
        assert_eq!(tasks[0].status, TaskStatus::Completed);

        let tasks = processor.list_for_owner("u2");
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id, other);

        assert!(processor.list_for_owner("nobody").is_empty());
    }

    #[tokio::test]
    async fn test_invalid_submissions_change_nothing() {
        let (processor, _gates) = processor(1);

        let err = processor
            .submit(NewTask::new("image-generation", "u1", json!({})))
            .unwrap_err();
        assert!(matches!(err, PressgateError::UnknownKind(_)));

        let err = processor
            .submit(NewTask::new("content-generation", "  ", json!({})))
            .unwrap_err();
        assert!(matches!(err, PressgateError::InvalidTask(_)));

        let err = processor
            .submit(NewTask::new("content-generation", "u1", json!([1, 2])))
            .unwrap_err();
        assert!(matches!(err, PressgateError::InvalidTask(_)));

        let err = processor
            .submit(NewTask::new("keyword-analysis", "u1", json!({})))
            .unwrap_err();
        assert!(matches!(err, PressgateError::NoHandler(TaskKind::KeywordAnalysis)));

        assert_eq!(processor.stats().total, 0);
        assert!(processor.list_for_owner("u1").is_empty());
    }

    #[tokio::test]
    async fn test_created_at_is_preserved() {
        let (processor, _gates) = processor(1);
        let created_at = Utc::now() - chrono::Duration::minutes(5);

        let id = processor
            .submit(gated("u1", "a").with_created_at(created_at))
            .unwrap();
        assert_eq!(processor.get_status(id).unwrap().created_at, created_at);
    }

    #[test]
    fn test_new_rejects_zero_concurrency() {
        let config = BatchConfig {
            max_concurrent: 0,
            ..BatchConfig::default()
        };
        assert!(BatchProcessor::new(&config, HandlerRegistry::new()).is_err());
    }

    #[tokio::test]
    async fn test_builtin_handlers_end_to_end() {
        let config = BatchConfig {
            max_concurrent: 2,
            step_delay_ms: 1,
            ..BatchConfig::default()
        };
        let processor =
            BatchProcessor::new(&config, HandlerRegistry::with_builtin(config.step_delay())).unwrap();

        let id = processor
            .submit(NewTask::new(
                "composite-workflow",
                "u1",
                json!({"keywords": ["rust", "tokio"]}),
            ))
            .unwrap();
        let bad = processor
            .submit(NewTask::new("keyword-analysis", "u1", json!({})))
            .unwrap();

        let task = wait_for(&processor, id, |t| t.status == TaskStatus::Completed).await;
        assert_eq!(task.result.unwrap()["articles"].as_array().unwrap().len(), 2);

        let task = wait_for(&processor, bad, |t| t.status == TaskStatus::Failed).await;
        assert!(task.error.unwrap().starts_with("invalid parameters"));
    }
}
