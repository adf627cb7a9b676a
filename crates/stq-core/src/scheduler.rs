use anyhow::Context;
use chrono::{DateTime, Utc};
use sqlx::Sqlite;
use stq_db::models::{Attempt, AttemptStatus, QueueState, Task};
use stq_db::queries::{attempts, dependencies, tasks};
use stq_db::StorePool;
use tracing::warn;

use crate::error::EngineError;

/// Selects the next attempt to hand to a polling runner and applies the
/// report transitions for attempts already in flight.
///
/// Every public method runs inside a single write transaction against the
/// store's writer pool, so the selection/assignment sequence is atomic: two
/// concurrent callers can never be handed the same attempt.
pub struct Scheduler;

impl Scheduler {
    /// Retry-before-new selection. See the two-pass sweep in
    /// `select_and_assign` for the algorithm.
    pub async fn start_next_attempt(
        pool: &StorePool,
        runner: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<(Task, Attempt)>, EngineError> {
        let mut tx = pool
            .writer
            .begin()
            .await
            .context("failed to begin scheduling transaction")?;

        let selected = select_and_assign(&mut tx, runner, now).await?;

        tx.commit()
            .await
            .context("failed to commit scheduling transaction")?;

        Ok(selected)
    }

    /// Returns `true` if this report actually transitioned the attempt,
    /// `false` if the attempt was already terminal and the report was a
    /// no-op (e.g. a duplicate report, or one that lost a race against a
    /// timeout reassignment).
    pub async fn complete_attempt(
        pool: &StorePool,
        task_id: i64,
        attempt_id: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, EngineError> {
        let mut tx = pool
            .writer
            .begin()
            .await
            .context("failed to begin complete-attempt transaction")?;

        let attempt = attempts::get_attempt(&mut *tx, attempt_id)
            .await
            .context("failed to load attempt")?
            .ok_or(EngineError::AttemptMismatch { task_id, attempt_id })?;
        if attempt.task_id != task_id {
            return Err(EngineError::AttemptMismatch { task_id, attempt_id });
        }

        let transitioned = attempts::set_attempt_completed(&mut *tx, attempt_id, now)
            .await
            .context("failed to mark attempt completed")?;
        if !transitioned {
            warn!(attempt_id, "ignoring completion report for terminal attempt");
            tx.commit()
                .await
                .context("failed to commit complete-attempt transaction")?;
            return Ok(false);
        }

        tasks::set_queue(&mut *tx, task_id, QueueState::Done)
            .await
            .context("failed to move task to done")?;

        tx.commit()
            .await
            .context("failed to commit complete-attempt transaction")?;
        Ok(true)
    }

    /// Returns `true` if this report actually transitioned the attempt,
    /// `false` if the attempt was already terminal and the report was a
    /// no-op.
    pub async fn fail_attempt(
        pool: &StorePool,
        task_id: i64,
        attempt_id: i64,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, EngineError> {
        let mut tx = pool
            .writer
            .begin()
            .await
            .context("failed to begin fail-attempt transaction")?;

        let attempt = attempts::get_attempt(&mut *tx, attempt_id)
            .await
            .context("failed to load attempt")?
            .ok_or(EngineError::AttemptMismatch { task_id, attempt_id })?;
        if attempt.task_id != task_id {
            return Err(EngineError::AttemptMismatch { task_id, attempt_id });
        }

        let transitioned = attempts::set_attempt_failed(&mut *tx, attempt_id, reason, now)
            .await
            .context("failed to mark attempt failed")?;
        if !transitioned {
            warn!(attempt_id, "ignoring failure report for terminal attempt");
            tx.commit()
                .await
                .context("failed to commit fail-attempt transaction")?;
            return Ok(false);
        }

        let task = tasks::get_task(&mut *tx, task_id)
            .await
            .context("failed to load task")?
            .ok_or(EngineError::AttemptMismatch { task_id, attempt_id })?;
        let attempt_count = attempts::count_attempts(&mut *tx, task_id, None)
            .await
            .context("failed to count attempts")?;
        if attempt_count >= task.max_attempts {
            tasks::set_queue(&mut *tx, task_id, QueueState::Done)
                .await
                .context("failed to move exhausted task to done")?;
        }

        tx.commit()
            .await
            .context("failed to commit fail-attempt transaction")?;
        Ok(true)
    }
}

/// Selection outcome for one pass of the Step A sweep.
enum SweepOutcome {
    /// Task is exhausted; move it to Done without a new attempt.
    Exhausted(Task),
    /// Task is a retry candidate.
    Candidate(Task),
    /// Nothing to do for this task.
    None,
}

async fn evaluate_no_duration_task(
    conn: &mut sqlx::SqliteConnection,
    task: Task,
) -> anyhow::Result<SweepOutcome> {
    let Some(attempt) = attempts::most_recent_attempt(&mut *conn, task.task_id).await? else {
        return Ok(SweepOutcome::None);
    };
    if !attempt.is_failed() {
        return Ok(SweepOutcome::None);
    }
    let count = attempts::count_attempts(&mut *conn, task.task_id, None).await?;
    if count >= task.max_attempts {
        Ok(SweepOutcome::Exhausted(task))
    } else {
        Ok(SweepOutcome::Candidate(task))
    }
}

/// Like `evaluate_no_duration_task` but also detects duration timeouts and,
/// when a timeout (not a prior failure) is the reason, marks the stale
/// attempt Failed("timed out") in the same transaction before the caller
/// issues a replacement.
async fn evaluate_duration_task(
    conn: &mut sqlx::SqliteConnection,
    task: Task,
    now: DateTime<Utc>,
) -> anyhow::Result<SweepOutcome> {
    let Some(attempt) = attempts::most_recent_attempt(&mut *conn, task.task_id).await? else {
        return Ok(SweepOutcome::None);
    };
    let duration = task.duration.expect("duration-partitioned task has a duration");
    let failed = attempt.is_failed();
    let timed_out = attempt.is_in_process()
        && (now - attempt.start_time).num_milliseconds() as f64 / 1000.0 > duration;

    if !failed && !timed_out {
        return Ok(SweepOutcome::None);
    }

    let count = attempts::count_attempts(&mut *conn, task.task_id, None).await?;
    if count >= task.max_attempts {
        return Ok(SweepOutcome::Exhausted(task));
    }

    if timed_out {
        attempts::set_attempt_failed(&mut *conn, attempt.attempt_id, "timed out", now).await?;
    }
    Ok(SweepOutcome::Candidate(task))
}

/// The Step A / Step B selection, executed against a live transaction.
async fn select_and_assign(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    runner: &str,
    now: DateTime<Utc>,
) -> anyhow::Result<Option<(Task, Attempt)>> {
    let mut failed_tasks = Vec::new();

    // Step A, pass 1: InProcess tasks without a duration.
    let mut no_duration_candidate = None;
    for task in tasks::list_tasks_by_duration(&mut **tx, QueueState::InProcess, false).await? {
        match evaluate_no_duration_task(&mut *tx, task).await? {
            SweepOutcome::Exhausted(t) => failed_tasks.push(t),
            SweepOutcome::Candidate(t) => {
                no_duration_candidate = Some(t);
                break;
            }
            SweepOutcome::None => {}
        }
    }

    // Step A, pass 2: InProcess tasks with a duration.
    let mut with_duration_candidate = None;
    for task in tasks::list_tasks_by_duration(&mut **tx, QueueState::InProcess, true).await? {
        match evaluate_duration_task(&mut *tx, task, now).await? {
            SweepOutcome::Exhausted(t) => failed_tasks.push(t),
            SweepOutcome::Candidate(t) => {
                with_duration_candidate = Some(t);
                break;
            }
            SweepOutcome::None => {}
        }
    }

    for task in &failed_tasks {
        tasks::set_queue(&mut **tx, task.task_id, QueueState::Done).await?;
    }

    let retry_candidate = match (no_duration_candidate, with_duration_candidate) {
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (Some(a), Some(b)) => {
            if a.created_time <= b.created_time {
                Some(a)
            } else {
                Some(b)
            }
        }
        (None, None) => None,
    };

    if let Some(task) = retry_candidate {
        let attempt_id = attempts::insert_attempt(&mut **tx, task.task_id, runner, now).await?;
        let attempt = attempts::get_attempt(&mut **tx, attempt_id)
            .await?
            .expect("attempt just inserted must exist");
        return Ok(Some((task, attempt)));
    }

    // Step B: promote from ToDo, gated on dependencies.
    for task_id in tasks::list_task_ids(&mut **tx, QueueState::ToDo).await? {
        let deps = dependencies::list_dependent_on(&mut **tx, task_id).await?;
        let mut all_satisfied = true;
        for dep_id in deps {
            let completed = attempts::count_attempts(&mut **tx, dep_id, Some(AttemptStatus::Completed)).await?;
            if completed == 0 {
                all_satisfied = false;
                break;
            }
        }
        if !all_satisfied {
            continue;
        }

        let task = tasks::get_task(&mut **tx, task_id)
            .await?
            .expect("task id came from a live query over the same table");
        tasks::set_queue(&mut **tx, task_id, QueueState::InProcess).await?;
        let attempt_id = attempts::insert_attempt(&mut **tx, task_id, runner, now).await?;
        let attempt = attempts::get_attempt(&mut **tx, attempt_id)
            .await?
            .expect("attempt just inserted must exist");
        return Ok(Some((task, attempt)));
    }

    Ok(None)
}
