//! Batch task processing.
//!
//! Callers submit [`NewTask`]s; the [`BatchProcessor`] runs them through the
//! [`TaskHandler`] registered for their kind with bounded concurrency and
//! tracks each task's status and progress.

mod handler;
mod handlers;
mod processor;
mod task;

pub use handler::{HandlerRegistry, ProgressReporter, TaskError, TaskHandler};
pub use handlers::{
    CompositeWorkflowHandler, ContentGenerationHandler, KeywordAnalysisHandler,
    TitleGenerationHandler,
};
pub use processor::{BatchProcessor, ProcessorStats};
pub use task::{NewTask, Task, TaskId, TaskKind, TaskStatus};
