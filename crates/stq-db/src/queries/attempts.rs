use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::Sqlite;

use crate::models::{Attempt, AttemptStatus};

pub async fn insert_attempt<'c, E>(
    executor: E,
    task_id: i64,
    runner: &str,
    start_time: DateTime<Utc>,
) -> Result<i64>
where
    E: sqlx::Executor<'c, Database = Sqlite>,
{
    let attempt_id = sqlx::query_scalar::<_, i64>(
        "INSERT INTO attempts (task_id, runner, start_time, status) \
         VALUES (?, ?, ?, ?) \
         RETURNING attempt_id",
    )
    .bind(task_id)
    .bind(runner)
    .bind(start_time)
    .bind(AttemptStatus::InProcess)
    .fetch_one(executor)
    .await
    .context("failed to insert attempt")?;
    Ok(attempt_id)
}

pub async fn get_attempt<'c, E>(executor: E, attempt_id: i64) -> Result<Option<Attempt>>
where
    E: sqlx::Executor<'c, Database = Sqlite>,
{
    let attempt = sqlx::query_as::<_, Attempt>(
        "SELECT attempt_id, task_id, runner, start_time, done_time, status, fail_reason \
         FROM attempts WHERE attempt_id = ?",
    )
    .bind(attempt_id)
    .fetch_optional(executor)
    .await
    .context("failed to fetch attempt")?;
    Ok(attempt)
}

pub async fn list_attempts<'c, E>(executor: E, task_id: i64) -> Result<Vec<Attempt>>
where
    E: sqlx::Executor<'c, Database = Sqlite>,
{
    let attempts = sqlx::query_as::<_, Attempt>(
        "SELECT attempt_id, task_id, runner, start_time, done_time, status, fail_reason \
         FROM attempts WHERE task_id = ? ORDER BY attempt_id ASC",
    )
    .bind(task_id)
    .fetch_all(executor)
    .await
    .context("failed to list attempts")?;
    Ok(attempts)
}

/// The attempt with the highest `attempt_id` for the task, if any.
pub async fn most_recent_attempt<'c, E>(executor: E, task_id: i64) -> Result<Option<Attempt>>
where
    E: sqlx::Executor<'c, Database = Sqlite>,
{
    let attempt = sqlx::query_as::<_, Attempt>(
        "SELECT attempt_id, task_id, runner, start_time, done_time, status, fail_reason \
         FROM attempts WHERE task_id = ? ORDER BY attempt_id DESC LIMIT 1",
    )
    .bind(task_id)
    .fetch_optional(executor)
    .await
    .context("failed to fetch most recent attempt")?;
    Ok(attempt)
}

/// Count of attempts for a task, optionally filtered by status.
pub async fn count_attempts<'c, E>(
    executor: E,
    task_id: i64,
    status: Option<AttemptStatus>,
) -> Result<i64>
where
    E: sqlx::Executor<'c, Database = Sqlite>,
{
    let count = match status {
        Some(status) => {
            sqlx::query_scalar::<_, i64>(
                "SELECT COUNT(*) FROM attempts WHERE task_id = ? AND status = ?",
            )
            .bind(task_id)
            .bind(status)
            .fetch_one(executor)
            .await
        }
        None => {
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM attempts WHERE task_id = ?")
                .bind(task_id)
                .fetch_one(executor)
                .await
        }
    }
    .context("failed to count attempts")?;
    Ok(count)
}

/// Transition an attempt to Failed. No-op (zero rows affected) unless the
/// attempt is currently InProcess — terminal attempts never flip.
pub async fn set_attempt_failed<'c, E>(
    executor: E,
    attempt_id: i64,
    fail_reason: &str,
    done_time: DateTime<Utc>,
) -> Result<bool>
where
    E: sqlx::Executor<'c, Database = Sqlite>,
{
    let result = sqlx::query(
        "UPDATE attempts SET status = ?, fail_reason = ?, done_time = ? \
         WHERE attempt_id = ? AND status = ?",
    )
    .bind(AttemptStatus::Failed)
    .bind(fail_reason)
    .bind(done_time)
    .bind(attempt_id)
    .bind(AttemptStatus::InProcess)
    .execute(executor)
    .await
    .context("failed to mark attempt failed")?;
    Ok(result.rows_affected() > 0)
}

/// Transition an attempt to Completed. No-op unless currently InProcess.
pub async fn set_attempt_completed<'c, E>(
    executor: E,
    attempt_id: i64,
    done_time: DateTime<Utc>,
) -> Result<bool>
where
    E: sqlx::Executor<'c, Database = Sqlite>,
{
    let result = sqlx::query(
        "UPDATE attempts SET status = ?, done_time = ? WHERE attempt_id = ? AND status = ?",
    )
    .bind(AttemptStatus::Completed)
    .bind(done_time)
    .bind(attempt_id)
    .bind(AttemptStatus::InProcess)
    .execute(executor)
    .await
    .context("failed to mark attempt completed")?;
    Ok(result.rows_affected() > 0)
}

/// Earliest `start_time` across all attempts for a task, if any exist.
pub async fn task_start_time<'c, E>(
    executor: E,
    task_id: i64,
) -> Result<Option<DateTime<Utc>>>
where
    E: sqlx::Executor<'c, Database = Sqlite>,
{
    let start = sqlx::query_scalar::<_, Option<DateTime<Utc>>>(
        "SELECT MIN(start_time) FROM attempts WHERE task_id = ?",
    )
    .bind(task_id)
    .fetch_one(executor)
    .await
    .context("failed to fetch task start time")?;
    Ok(start)
}

/// Earliest `done_time` across terminal attempts for a task, if any.
pub async fn task_done_time<'c, E>(executor: E, task_id: i64) -> Result<Option<DateTime<Utc>>>
where
    E: sqlx::Executor<'c, Database = Sqlite>,
{
    let done = sqlx::query_scalar::<_, Option<DateTime<Utc>>>(
        "SELECT MIN(done_time) FROM attempts WHERE task_id = ? AND done_time IS NOT NULL",
    )
    .bind(task_id)
    .fetch_one(executor)
    .await
    .context("failed to fetch task done time")?;
    Ok(done)
}
