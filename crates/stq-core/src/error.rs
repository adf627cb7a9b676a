use thiserror::Error;

/// Errors the engine can report back to a caller without tearing down the
/// process. Distinct from `anyhow::Error`, which `stq-db` uses internally
/// for genuinely unexpected storage failures — callers that need to branch
/// on *which* thing went wrong match on this enum instead.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown dependency: task {dependent_on_task_id} does not exist")]
    UnknownDependency { dependent_on_task_id: i64 },

    #[error("attempt {attempt_id} does not belong to task {task_id}")]
    AttemptMismatch { task_id: i64, attempt_id: i64 },

    #[error("storage error: {0}")]
    StorageError(#[from] anyhow::Error),
}
