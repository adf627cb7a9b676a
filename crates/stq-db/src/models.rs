use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Which of the three queues a task currently sits in.
///
/// Persisted as the integer discriminant shown below; never renumber these,
/// the schema documents them as part of the on-disk contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[repr(i64)]
pub enum QueueState {
    ToDo = 1,
    InProcess = 2,
    Done = 3,
}

impl QueueState {
    pub fn as_i64(self) -> i64 {
        self as i64
    }
}

/// Status of a single attempt at running a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[repr(i64)]
pub enum AttemptStatus {
    InProcess = 0,
    Completed = 50,
    Failed = 100,
}

impl AttemptStatus {
    pub fn as_i64(self) -> i64 {
        self as i64
    }
}

/// A unit of work together with its queue placement.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Task {
    pub task_id: i64,
    pub cmd: String,
    pub name: String,
    pub description: String,
    pub duration: Option<f64>,
    pub max_attempts: i64,
    pub created_time: DateTime<Utc>,
    pub queue: QueueState,
}

impl Task {
    pub fn is_todo(&self) -> bool {
        matches!(self.queue, QueueState::ToDo)
    }

    pub fn is_in_process(&self) -> bool {
        matches!(self.queue, QueueState::InProcess)
    }

    pub fn is_done(&self) -> bool {
        matches!(self.queue, QueueState::Done)
    }
}

/// One execution attempt by a specific runner.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Attempt {
    pub attempt_id: i64,
    pub task_id: i64,
    pub runner: String,
    pub start_time: DateTime<Utc>,
    pub done_time: Option<DateTime<Utc>>,
    pub status: AttemptStatus,
    pub fail_reason: Option<String>,
}

impl Attempt {
    pub fn is_in_process(&self) -> bool {
        matches!(self.status, AttemptStatus::InProcess)
    }

    pub fn is_completed(&self) -> bool {
        matches!(self.status, AttemptStatus::Completed)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, AttemptStatus::Failed)
    }
}

/// A directed dependency edge: `task_id` cannot start until
/// `dependent_on_task_id` is Done with a Completed attempt.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Dependency {
    pub dependency_id: i64,
    pub task_id: i64,
    pub dependent_on_task_id: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_state_discriminants_match_persisted_encoding() {
        assert_eq!(QueueState::ToDo.as_i64(), 1);
        assert_eq!(QueueState::InProcess.as_i64(), 2);
        assert_eq!(QueueState::Done.as_i64(), 3);
    }

    #[test]
    fn attempt_status_discriminants_match_persisted_encoding() {
        assert_eq!(AttemptStatus::InProcess.as_i64(), 0);
        assert_eq!(AttemptStatus::Completed.as_i64(), 50);
        assert_eq!(AttemptStatus::Failed.as_i64(), 100);
    }

    #[test]
    fn task_predicates() {
        let t = Task {
            task_id: 1,
            cmd: "echo hi".into(),
            name: String::new(),
            description: String::new(),
            duration: None,
            max_attempts: 1,
            created_time: Utc::now(),
            queue: QueueState::InProcess,
        };
        assert!(t.is_in_process());
        assert!(!t.is_todo());
        assert!(!t.is_done());
    }
}
