use anyhow::{Context, Result};
use sqlx::Sqlite;

/// Insert a dependency edge: `task_id` depends on `dependent_on_task_id`.
/// Idempotent — a duplicate edge is silently ignored.
pub async fn insert_dependency<'c, E>(
    executor: E,
    task_id: i64,
    dependent_on_task_id: i64,
) -> Result<()>
where
    E: sqlx::Executor<'c, Database = Sqlite>,
{
    sqlx::query(
        "INSERT INTO dependencies (task_id, dependent_on_task_id) VALUES (?, ?) \
         ON CONFLICT (task_id, dependent_on_task_id) DO NOTHING",
    )
    .bind(task_id)
    .bind(dependent_on_task_id)
    .execute(executor)
    .await
    .context("failed to insert dependency edge")?;
    Ok(())
}

/// Task ids that `task_id` depends on.
pub async fn list_dependent_on<'c, E>(executor: E, task_id: i64) -> Result<Vec<i64>>
where
    E: sqlx::Executor<'c, Database = Sqlite>,
{
    let ids = sqlx::query_scalar::<_, i64>(
        "SELECT dependent_on_task_id FROM dependencies WHERE task_id = ?",
    )
    .bind(task_id)
    .fetch_all(executor)
    .await
    .context("failed to list dependent_on ids")?;
    Ok(ids)
}

/// Task ids that depend on `task_id`.
pub async fn list_dependents<'c, E>(executor: E, task_id: i64) -> Result<Vec<i64>>
where
    E: sqlx::Executor<'c, Database = Sqlite>,
{
    let ids = sqlx::query_scalar::<_, i64>(
        "SELECT task_id FROM dependencies WHERE dependent_on_task_id = ?",
    )
    .bind(task_id)
    .fetch_all(executor)
    .await
    .context("failed to list dependents")?;
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queries::tasks::insert_task;
    use chrono::Utc;
    use stq_test_utils::create_test_db;

    #[tokio::test]
    async fn insert_is_idempotent() {
        let (pool, _guard) = create_test_db().await;
        let a = insert_task(&pool, "a", "", "", None, 1, Utc::now()).await.unwrap();
        let b = insert_task(&pool, "b", "", "", None, 1, Utc::now()).await.unwrap();
        insert_dependency(&pool, a, b).await.unwrap();
        insert_dependency(&pool, a, b).await.unwrap();
        assert_eq!(list_dependent_on(&pool, a).await.unwrap(), vec![b]);
        assert_eq!(list_dependents(&pool, b).await.unwrap(), vec![a]);
    }
}
