//! Task handler abstraction and registry.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::task::TaskKind;

/// Errors a handler can finish with.
#[derive(Debug, Error)]
pub enum TaskError {
    /// The task parameters do not fit the handler
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    /// The work itself failed
    #[error("{0}")]
    Failed(String),

    /// The handler observed the cancellation signal and stopped
    #[error("task cancelled")]
    Cancelled,
}

/// Executes tasks of one kind.
///
/// Handlers should report progress as they go and check the cancellation
/// token at convenient points. The processor also drops the handler's future
/// at its next suspension point once the task is cancelled.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn execute(
        &self,
        parameters: &Value,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<Value, TaskError>;
}

/// Reports a running task's progress back to its owner.
#[derive(Clone)]
pub struct ProgressReporter {
    sink: Arc<dyn Fn(u8) + Send + Sync>,
}

impl ProgressReporter {
    pub fn new<F>(sink: F) -> Self
    where
        F: Fn(u8) + Send + Sync + 'static,
    {
        Self {
            sink: Arc::new(sink),
        }
    }

    /// A reporter that discards every update.
    pub fn noop() -> Self {
        Self::new(|_| {})
    }

    /// Report a percentage, clamped to 100.
    pub fn report(&self, percent: u8) {
        (self.sink)(percent.min(100));
    }

    /// Report `done` out of `total` steps.
    pub fn report_fraction(&self, done: usize, total: usize) {
        if total == 0 {
            return;
        }
        let percent = (done.min(total) * 100 / total) as u8;
        self.report(percent);
    }
}

impl fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressReporter").finish_non_exhaustive()
    }
}

/// Maps each task kind to the handler that executes it.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskKind, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for a kind, replacing any previous one.
    pub fn register(&mut self, kind: TaskKind, handler: Arc<dyn TaskHandler>) -> &mut Self {
        self.handlers.insert(kind, handler);
        self
    }

    /// Builder-style variant of [`register`](Self::register).
    pub fn with(mut self, kind: TaskKind, handler: Arc<dyn TaskHandler>) -> Self {
        self.register(kind, handler);
        self
    }

    pub fn get(&self, kind: TaskKind) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(&kind).cloned()
    }

    pub fn contains(&self, kind: TaskKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    /// Registered kinds, in declaration order.
    pub fn kinds(&self) -> Vec<TaskKind> {
        TaskKind::ALL
            .into_iter()
            .filter(|kind| self.contains(*kind))
            .collect()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}
