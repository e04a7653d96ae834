//! Task records and their lifecycle.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::PressgateError;

/// Unique task identifier.
pub type TaskId = Uuid;

/// The kinds of work the processor accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskKind {
    KeywordAnalysis,
    TitleGeneration,
    ContentGeneration,
    CompositeWorkflow,
}

impl TaskKind {
    pub const ALL: [TaskKind; 4] = [
        TaskKind::KeywordAnalysis,
        TaskKind::TitleGeneration,
        TaskKind::ContentGeneration,
        TaskKind::CompositeWorkflow,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::KeywordAnalysis => "keyword-analysis",
            TaskKind::TitleGeneration => "title-generation",
            TaskKind::ContentGeneration => "content-generation",
            TaskKind::CompositeWorkflow => "composite-workflow",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = PressgateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| PressgateError::UnknownKind(s.to_string()))
    }
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Whether no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// A unit of work owned by the batch processor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub kind: TaskKind,
    pub owner: String,
    pub parameters: Value,
    pub status: TaskStatus,
    /// Percentage complete, 0 to 100
    pub progress: u8,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub result: Option<Value>,
}

impl Task {
    /// Create a pending task.
    pub(crate) fn pending(
        id: TaskId,
        kind: TaskKind,
        owner: String,
        parameters: Value,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            kind,
            owner,
            parameters,
            status: TaskStatus::Pending,
            progress: 0,
            created_at,
            started_at: None,
            completed_at: None,
            error: None,
            result: None,
        }
    }

    /// pending -> running
    pub(crate) fn start(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != TaskStatus::Pending {
            return false;
        }
        self.status = TaskStatus::Running;
        self.started_at = Some(now);
        true
    }

    /// running -> completed
    pub(crate) fn complete(&mut self, result: Value, now: DateTime<Utc>) -> bool {
        if self.status != TaskStatus::Running {
            return false;
        }
        self.status = TaskStatus::Completed;
        self.progress = 100;
        self.result = Some(result);
        self.completed_at = Some(now);
        true
    }

    /// running -> failed
    pub(crate) fn fail(&mut self, error: String, now: DateTime<Utc>) -> bool {
        if self.status != TaskStatus::Running {
            return false;
        }
        self.status = TaskStatus::Failed;
        self.error = Some(error);
        self.completed_at = Some(now);
        true
    }

    /// pending | running -> cancelled
    pub(crate) fn cancel(&mut self, now: DateTime<Utc>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = TaskStatus::Cancelled;
        self.completed_at = Some(now);
        true
    }

    /// Raise progress while running. 100 is reserved for completion.
    pub(crate) fn advance(&mut self, percent: u8) -> bool {
        let percent = percent.min(99);
        if self.status != TaskStatus::Running || percent <= self.progress {
            return false;
        }
        self.progress = percent;
        true
    }
}

/// A submission request.
#[derive(Debug, Clone, Deserialize)]
pub struct NewTask {
    pub kind: String,
    pub owner: String,
    #[serde(default = "empty_parameters")]
    pub parameters: Value,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl NewTask {
    pub fn new(kind: impl Into<String>, owner: impl Into<String>, parameters: Value) -> Self {
        Self {
            kind: kind.into(),
            owner: owner.into(),
            parameters,
            created_at: None,
        }
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }
}

fn empty_parameters() -> Value {
    Value::Object(Map::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn task() -> Task {
        Task::pending(
            Uuid::new_v4(),
            TaskKind::KeywordAnalysis,
            "u1".to_string(),
            json!({}),
            Utc::now(),
        )
    }

    #[test]
    fn test_kind_round_trips_through_str() {
        for kind in TaskKind::ALL {
            assert_eq!(kind.as_str().parse::<TaskKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_unknown_kind() {
        let err = "image-generation".parse::<TaskKind>().unwrap_err();
        assert!(matches!(err, PressgateError::UnknownKind(ref k) if k == "image-generation"));
    }

    #[test]
    fn test_kind_serializes_kebab_case() {
        assert_eq!(
            serde_json::to_value(TaskKind::CompositeWorkflow).unwrap(),
            json!("composite-workflow")
        );
        assert_eq!(serde_json::to_value(TaskStatus::Cancelled).unwrap(), json!("cancelled"));
    }

    #[test]
    fn test_successful_lifecycle() {
        let mut task = task();
        assert!(task.start(Utc::now()));
        assert!(task.advance(40));
        assert!(task.complete(json!({"ok": true}), Utc::now()));

        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.progress, 100);
        assert!(task.started_at.is_some());
        assert!(task.completed_at.is_some());
        assert_eq!(task.result, Some(json!({"ok": true})));
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut task = task();
        task.start(Utc::now());
        task.fail("boom".to_string(), Utc::now());

        assert!(!task.complete(json!(null), Utc::now()));
        assert!(!task.cancel(Utc::now()));
        assert!(!task.start(Utc::now()));
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_pending_cannot_complete() {
        let mut task = task();
        assert!(!task.complete(json!(null), Utc::now()));
        assert!(!task.fail("x".to_string(), Utc::now()));
        assert!(task.cancel(Utc::now()));
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert!(task.started_at.is_none());
    }

    #[test]
    fn test_progress_is_monotonic_and_capped() {
        let mut task = task();
        assert!(!task.advance(10));

        task.start(Utc::now());
        assert!(task.advance(30));
        assert!(!task.advance(20));
        assert_eq!(task.progress, 30);

        assert!(task.advance(100));
        assert_eq!(task.progress, 99);

        task.cancel(Utc::now());
        assert!(!task.advance(50));
    }

    #[test]
    fn test_new_task_defaults_parameters() {
        let new_task: NewTask =
            serde_json::from_value(json!({"kind": "title-generation", "owner": "u1"})).unwrap();
        assert_eq!(new_task.parameters, json!({}));
        assert!(new_task.created_at.is_none());
    }
}
