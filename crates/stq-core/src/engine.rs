use anyhow::Context;
use chrono::{DateTime, Utc};
use stq_db::models::{Attempt, AttemptStatus, QueueState, Task};
use stq_db::queries::{attempts, dependencies, tasks};
use stq_db::StorePool;
use tracing::warn;

use crate::error::EngineError;
use crate::scheduler::Scheduler;

/// Public operations over the store, validated and wired up the way the
/// HTTP transport and any other caller should use them.
pub struct EngineFacade {
    pool: StorePool,
}

impl EngineFacade {
    pub fn new(pool: StorePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &StorePool {
        &self.pool
    }

    /// Add a task. Every id in `dependent_on` must already exist, across
    /// any of the three queues, or the whole insert is refused.
    pub async fn add_task(
        &self,
        cmd: &str,
        name: &str,
        description: &str,
        duration: Option<f64>,
        max_attempts: i64,
        dependent_on: &[i64],
        now: DateTime<Utc>,
    ) -> Result<Task, EngineError> {
        let mut tx = self
            .pool
            .writer
            .begin()
            .await
            .context("failed to begin add-task transaction")?;

        for &dep_id in dependent_on {
            if tasks::get_task(&mut *tx, dep_id).await.context("failed to validate dependency")?.is_none() {
                return Err(EngineError::UnknownDependency {
                    dependent_on_task_id: dep_id,
                });
            }
        }

        let task_id = tasks::insert_task(
            &mut *tx,
            cmd,
            name,
            description,
            duration,
            max_attempts,
            now,
        )
        .await
        .context("failed to insert task")?;

        for &dep_id in dependent_on {
            dependencies::insert_dependency(&mut *tx, task_id, dep_id)
                .await
                .context("failed to insert dependency edge")?;
        }

        let task = tasks::get_task(&mut *tx, task_id)
            .await
            .context("failed to reload inserted task")?
            .expect("task just inserted must exist");

        tx.commit().await.context("failed to commit add-task transaction")?;
        Ok(task)
    }

    /// Delete a task. Refuses (returns `false`, logs) if any non-done task
    /// still depends on it. Deleting an in-process task is allowed but
    /// logged, since it orphans whatever runner currently holds its
    /// attempt.
    pub async fn delete_task(&self, task_id: i64) -> Result<bool, EngineError> {
        let mut tx = self
            .pool
            .writer
            .begin()
            .await
            .context("failed to begin delete-task transaction")?;

        let dependents = dependencies::list_dependents(&mut *tx, task_id)
            .await
            .context("failed to list dependents")?;
        for dependent_id in dependents {
            let dependent = tasks::get_task(&mut *tx, dependent_id)
                .await
                .context("failed to load dependent task")?;
            if let Some(dependent) = dependent {
                if !dependent.is_done() {
                    warn!(task_id, dependent_id, "refusing to delete task with a live dependent");
                    return Ok(false);
                }
            }
        }

        if let Some(task) = tasks::get_task(&mut *tx, task_id).await.context("failed to load task")? {
            if task.is_in_process() {
                warn!(task_id, "deleting an in-process task; its runner's next report will be rejected");
            }
        }

        let deleted = tasks::delete_task(&mut *tx, task_id)
            .await
            .context("failed to delete task")?;

        tx.commit().await.context("failed to commit delete-task transaction")?;
        Ok(deleted)
    }

    pub async fn start_next_attempt(
        &self,
        runner: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<(Task, Attempt)>, EngineError> {
        Scheduler::start_next_attempt(&self.pool, runner, now).await
    }

    /// Returns `true` if the report transitioned the attempt, `false` if it
    /// was already terminal.
    pub async fn complete_attempt(
        &self,
        task_id: i64,
        attempt_id: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, EngineError> {
        Scheduler::complete_attempt(&self.pool, task_id, attempt_id, now).await
    }

    /// Returns `true` if the report transitioned the attempt, `false` if it
    /// was already terminal.
    pub async fn fail_attempt(
        &self,
        task_id: i64,
        attempt_id: i64,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, EngineError> {
        Scheduler::fail_attempt(&self.pool, task_id, attempt_id, reason, now).await
    }

    pub async fn list_tasks(&self, queue: QueueState) -> Result<Vec<Task>, EngineError> {
        let tasks = tasks::list_tasks(&self.pool.reader, queue)
            .await
            .context("failed to list tasks")?;
        Ok(tasks)
    }

    /// Tasks that have failed permanently: in queue Done with no Completed
    /// attempt.
    pub async fn list_failed_tasks(&self) -> Result<Vec<Task>, EngineError> {
        let done = tasks::list_tasks(&self.pool.reader, QueueState::Done)
            .await
            .context("failed to list done tasks")?;
        let mut failed = Vec::new();
        for task in done {
            let completed =
                attempts::count_attempts(&self.pool.reader, task.task_id, Some(AttemptStatus::Completed))
                    .await
                    .context("failed to count completed attempts")?;
            if completed == 0 {
                failed.push(task);
            }
        }
        Ok(failed)
    }

    /// Tasks that have completed successfully: in queue Done with at least
    /// one Completed attempt.
    pub async fn list_completed_tasks(&self) -> Result<Vec<Task>, EngineError> {
        let done = tasks::list_tasks(&self.pool.reader, QueueState::Done)
            .await
            .context("failed to list done tasks")?;
        let mut completed_tasks = Vec::new();
        for task in done {
            let completed =
                attempts::count_attempts(&self.pool.reader, task.task_id, Some(AttemptStatus::Completed))
                    .await
                    .context("failed to count completed attempts")?;
            if completed > 0 {
                completed_tasks.push(task);
            }
        }
        Ok(completed_tasks)
    }

    /// Tasks that depend on `task_id` — the reverse edge.
    pub async fn dependents(&self, task_id: i64) -> Result<Vec<i64>, EngineError> {
        let deps = dependencies::list_dependents(&self.pool.reader, task_id)
            .await
            .context("failed to list dependents")?;
        Ok(deps)
    }

    /// Tasks that `task_id` itself depends on — the forward edge, and the
    /// meaning of the `dependent_on` field on a task's external
    /// representation.
    pub async fn dependent_on(&self, task_id: i64) -> Result<Vec<i64>, EngineError> {
        let deps = dependencies::list_dependent_on(&self.pool.reader, task_id)
            .await
            .context("failed to list dependencies")?;
        Ok(deps)
    }
}
