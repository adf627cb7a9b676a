use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::Sqlite;

use crate::models::{QueueState, Task};

/// Insert a new task row in queue `ToDo`. Caller is responsible for
/// inserting any dependency edges in the same transaction.
pub async fn insert_task<'c, E>(
    executor: E,
    cmd: &str,
    name: &str,
    description: &str,
    duration: Option<f64>,
    max_attempts: i64,
    created_time: DateTime<Utc>,
) -> Result<i64>
where
    E: sqlx::Executor<'c, Database = Sqlite>,
{
    let task_id = sqlx::query_scalar::<_, i64>(
        "INSERT INTO tasks (cmd, name, description, duration, max_attempts, created_time, queue) \
         VALUES (?, ?, ?, ?, ?, ?, ?) \
         RETURNING task_id",
    )
    .bind(cmd)
    .bind(name)
    .bind(description)
    .bind(duration)
    .bind(max_attempts)
    .bind(created_time)
    .bind(QueueState::ToDo)
    .fetch_one(executor)
    .await
    .context("failed to insert task")?;
    Ok(task_id)
}

pub async fn get_task<'c, E>(executor: E, task_id: i64) -> Result<Option<Task>>
where
    E: sqlx::Executor<'c, Database = Sqlite>,
{
    let task = sqlx::query_as::<_, Task>(
        "SELECT task_id, cmd, name, description, duration, max_attempts, created_time, queue \
         FROM tasks WHERE task_id = ?",
    )
    .bind(task_id)
    .fetch_optional(executor)
    .await
    .context("failed to fetch task")?;
    Ok(task)
}

/// Task ids in the given queue, ascending insertion order.
pub async fn list_task_ids<'c, E>(executor: E, queue: QueueState) -> Result<Vec<i64>>
where
    E: sqlx::Executor<'c, Database = Sqlite>,
{
    let ids = sqlx::query_scalar::<_, i64>(
        "SELECT task_id FROM tasks WHERE queue = ? ORDER BY task_id ASC",
    )
    .bind(queue)
    .fetch_all(executor)
    .await
    .context("failed to list task ids")?;
    Ok(ids)
}

/// Full task rows in the given queue, ascending task_id order.
pub async fn list_tasks<'c, E>(executor: E, queue: QueueState) -> Result<Vec<Task>>
where
    E: sqlx::Executor<'c, Database = Sqlite>,
{
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT task_id, cmd, name, description, duration, max_attempts, created_time, queue \
         FROM tasks WHERE queue = ? ORDER BY task_id ASC",
    )
    .bind(queue)
    .fetch_all(executor)
    .await
    .context("failed to list tasks")?;
    Ok(tasks)
}

/// Tasks in the given queue partitioned by whether `duration` is set,
/// ascending task_id order — used by the scheduler's two-pass sweep.
pub async fn list_tasks_by_duration<'c, E>(
    executor: E,
    queue: QueueState,
    with_duration: bool,
) -> Result<Vec<Task>>
where
    E: sqlx::Executor<'c, Database = Sqlite>,
{
    let predicate = if with_duration {
        "duration IS NOT NULL"
    } else {
        "duration IS NULL"
    };
    let query = format!(
        "SELECT task_id, cmd, name, description, duration, max_attempts, created_time, queue \
         FROM tasks WHERE queue = ? AND {predicate} ORDER BY task_id ASC"
    );
    let tasks = sqlx::query_as::<_, Task>(&query)
        .bind(queue)
        .fetch_all(executor)
        .await
        .context("failed to list tasks by duration")?;
    Ok(tasks)
}

pub async fn set_queue<'c, E>(executor: E, task_id: i64, queue: QueueState) -> Result<()>
where
    E: sqlx::Executor<'c, Database = Sqlite>,
{
    sqlx::query("UPDATE tasks SET queue = ? WHERE task_id = ?")
        .bind(queue)
        .bind(task_id)
        .execute(executor)
        .await
        .context("failed to update task queue")?;
    Ok(())
}

/// Delete a task and every attempt row it owns. Does not check dependency
/// edges for deletability; callers validate that before calling this.
pub async fn delete_task<'c, E>(executor: E, task_id: i64) -> Result<bool>
where
    E: sqlx::Executor<'c, Database = Sqlite> + Copy,
{
    sqlx::query("DELETE FROM attempts WHERE task_id = ?")
        .bind(task_id)
        .execute(executor)
        .await
        .context("failed to delete task's attempts")?;
    sqlx::query("DELETE FROM dependencies WHERE task_id = ? OR dependent_on_task_id = ?")
        .bind(task_id)
        .bind(task_id)
        .execute(executor)
        .await
        .context("failed to delete task's dependency edges")?;
    let result = sqlx::query("DELETE FROM tasks WHERE task_id = ?")
        .bind(task_id)
        .execute(executor)
        .await
        .context("failed to delete task")?;
    Ok(result.rows_affected() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use stq_test_utils::create_test_db;

    #[tokio::test]
    async fn insert_and_get_round_trip() {
        let (pool, _guard) = create_test_db().await;
        let now = Utc::now();
        let id = insert_task(&pool, "echo hi", "greet", "", None, 1, now)
            .await
            .unwrap();
        let task = get_task(&pool, id).await.unwrap().unwrap();
        assert_eq!(task.cmd, "echo hi");
        assert!(task.is_todo());
    }

    #[tokio::test]
    async fn set_queue_moves_task() {
        let (pool, _guard) = create_test_db().await;
        let id = insert_task(&pool, "echo hi", "", "", None, 1, Utc::now())
            .await
            .unwrap();
        set_queue(&pool, id, QueueState::InProcess).await.unwrap();
        let task = get_task(&pool, id).await.unwrap().unwrap();
        assert!(task.is_in_process());
    }

    #[tokio::test]
    async fn list_tasks_by_duration_partitions() {
        let (pool, _guard) = create_test_db().await;
        let no_dur = insert_task(&pool, "a", "", "", None, 1, Utc::now())
            .await
            .unwrap();
        let with_dur = insert_task(&pool, "b", "", "", Some(5.0), 1, Utc::now())
            .await
            .unwrap();
        let without = list_tasks_by_duration(&pool, QueueState::ToDo, false)
            .await
            .unwrap();
        let with = list_tasks_by_duration(&pool, QueueState::ToDo, true)
            .await
            .unwrap();
        assert_eq!(without.iter().map(|t| t.task_id).collect::<Vec<_>>(), vec![
            no_dur
        ]);
        assert_eq!(with.iter().map(|t| t.task_id).collect::<Vec<_>>(), vec![
            with_dur
        ]);
    }

    #[tokio::test]
    async fn delete_task_removes_row() {
        let (pool, _guard) = create_test_db().await;
        let id = insert_task(&pool, "a", "", "", None, 1, Utc::now())
            .await
            .unwrap();
        assert!(delete_task(&pool, id).await.unwrap());
        assert!(get_task(&pool, id).await.unwrap().is_none());
    }
}
