//! HTTP/JSON transport over [`EngineFacade`]: the external interface
//! runners and operators talk to.

use std::sync::Arc;

use axum::extract::{Form, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use stq_core::{EngineError, EngineFacade};
use stq_db::models::{QueueState, Task};
use tower_http::cors::CorsLayer;

/// Uniform error response shape for every route.
pub struct AppError {
    status: StatusCode,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status, Json(serde_json::json!({ "message": self.message }))).into_response()
    }
}

impl From<EngineError> for AppError {
    fn from(err: EngineError) -> Self {
        let status = match err {
            EngineError::UnknownDependency { .. } => StatusCode::BAD_REQUEST,
            EngineError::AttemptMismatch { .. } => StatusCode::BAD_REQUEST,
            EngineError::StorageError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        AppError {
            status,
            message: err.to_string(),
        }
    }
}

#[derive(Serialize)]
struct TaskResponse {
    task_id: i64,
    name: String,
    command: String,
    description: String,
    duration: Option<f64>,
    max_attempts: i64,
    dependent_on: Vec<i64>,
}

fn task_response(task: Task, dependent_on: Vec<i64>) -> TaskResponse {
    TaskResponse {
        task_id: task.task_id,
        name: task.name,
        command: task.cmd,
        description: task.description,
        duration: task.duration,
        max_attempts: task.max_attempts,
        dependent_on,
    }
}

#[derive(Deserialize)]
pub struct AddTaskForm {
    command: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    description: String,
    duration: Option<f64>,
    #[serde(default = "default_max_attempts")]
    max_attempts: i64,
    /// Repeated form field, e.g. `dependent_on=1&dependent_on=2`.
    #[serde(default)]
    dependent_on: Vec<i64>,
}

fn default_max_attempts() -> i64 {
    1
}

async fn post_task(
    State(engine): State<Arc<EngineFacade>>,
    Form(form): Form<AddTaskForm>,
) -> Result<Response, AppError> {
    let task = engine
        .add_task(
            &form.command,
            &form.name,
            &form.description,
            form.duration,
            form.max_attempts,
            &form.dependent_on,
            Utc::now(),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(task_response(task, form.dependent_on))).into_response())
}

#[derive(Deserialize)]
pub struct DeleteTaskForm {
    task_id: i64,
}

async fn delete_task(
    State(engine): State<Arc<EngineFacade>>,
    Form(form): Form<DeleteTaskForm>,
) -> Result<Response, AppError> {
    let deleted = engine.delete_task(form.task_id).await?;
    if deleted {
        Ok(Json(serde_json::json!({ "status": "task deleted", "task_id": form.task_id })).into_response())
    } else {
        Ok((
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "message": format!("no such task {}", form.task_id) })),
        )
            .into_response())
    }
}

#[derive(Deserialize)]
pub struct AttemptQuery {
    runner_id: String,
}

#[derive(Serialize)]
#[serde(tag = "status")]
enum AttemptResponse {
    #[serde(rename = "attempt")]
    Attempt {
        task_id: i64,
        command: String,
        attempt_id: i64,
    },
    #[serde(rename = "no attempt")]
    NoAttempt,
}

async fn get_attempt(
    State(engine): State<Arc<EngineFacade>>,
    Query(query): Query<AttemptQuery>,
) -> Result<Json<AttemptResponse>, AppError> {
    let picked = engine.start_next_attempt(&query.runner_id, Utc::now()).await?;
    let body = match picked {
        Some((task, attempt)) => AttemptResponse::Attempt {
            task_id: task.task_id,
            command: task.cmd,
            attempt_id: attempt.attempt_id,
        },
        None => AttemptResponse::NoAttempt,
    };
    Ok(Json(body))
}

#[derive(Deserialize)]
pub struct AttemptReportForm {
    #[serde(rename = "runner_id")]
    _runner_id: String,
    task_id: i64,
    attempt_id: i64,
    status: String,
    message: Option<String>,
}

async fn put_attempt(
    State(engine): State<Arc<EngineFacade>>,
    Form(form): Form<AttemptReportForm>,
) -> Result<Response, AppError> {
    let now = Utc::now();
    match form.status.as_str() {
        "completed" => {
            let transitioned = engine.complete_attempt(form.task_id, form.attempt_id, now).await?;
            Ok(Json(serde_json::json!({ "status": "ok", "transitioned": transitioned })).into_response())
        }
        "failed" => {
            let reason = form.message.unwrap_or_default();
            let transitioned = engine.fail_attempt(form.task_id, form.attempt_id, &reason, now).await?;
            Ok(Json(serde_json::json!({ "status": "ok", "transitioned": transitioned })).into_response())
        }
        other => {
            // Unknown status: fail-as-fallback, but still surface a 400 so
            // the caller knows its request was malformed.
            let reason = format!("unknown status {other:?}, recorded as failed");
            engine
                .fail_attempt(form.task_id, form.attempt_id, &reason, now)
                .await?;
            Ok((
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "message": reason })),
            )
                .into_response())
        }
    }
}

async fn list_tasks(
    State(engine): State<Arc<EngineFacade>>,
    axum::extract::Path(list_type): axum::extract::Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let tasks = match list_type.as_str() {
        "todo" => engine.list_tasks(QueueState::ToDo).await?,
        "inprocess" => engine.list_tasks(QueueState::InProcess).await?,
        "failed" => engine.list_failed_tasks().await?,
        "completed" => engine.list_completed_tasks().await?,
        other => {
            return Err(AppError {
                status: StatusCode::BAD_REQUEST,
                message: format!("unknown list type {other:?}"),
            });
        }
    };
    let mut data = Vec::with_capacity(tasks.len());
    for task in tasks {
        let dependent_on = engine.dependent_on(task.task_id).await?;
        data.push(task_response(task, dependent_on));
    }
    Ok(Json(serde_json::json!({ "data": data })))
}

async fn healthz(State(engine): State<Arc<EngineFacade>>) -> Result<Json<serde_json::Value>, AppError> {
    engine.list_tasks(QueueState::ToDo).await?;
    Ok(Json(serde_json::json!({ "status": "ok" })))
}

pub fn build_router(engine: Arc<EngineFacade>) -> Router {
    Router::new()
        .route("/task", post(post_task).delete(delete_task))
        .route("/attempt", get(get_attempt).put(put_attempt))
        .route("/listtasks/{list_type}", get(list_tasks))
        .route("/healthz", get(healthz))
        .layer(CorsLayer::permissive())
        .with_state(engine)
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use stq_db::StorePool;
    use tower::ServiceExt;

    use super::*;

    async fn test_engine() -> (Arc<EngineFacade>, stq_test_utils::TestDbGuard) {
        let (pool, guard) = stq_test_utils::create_test_db().await;
        let store = StorePool {
            writer: pool.clone(),
            reader: pool,
        };
        (Arc::new(EngineFacade::new(store)), guard)
    }

    async fn send(engine: Arc<EngineFacade>, req: Request<Body>) -> Response {
        build_router(engine).oneshot(req).await.unwrap()
    }

    fn form_request(method: &str, uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/x-www-form-urlencoded")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1_048_576).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn healthz_reports_ok() {
        let (engine, _guard) = test_engine().await;
        let resp = send(engine, Request::builder().uri("/healthz").body(Body::empty()).unwrap()).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn post_task_creates_and_returns_forward_dependencies() {
        let (engine, _guard) = test_engine().await;

        let resp = send(
            engine.clone(),
            form_request("POST", "/task", "command=echo+a&name=a&max_attempts=1"),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let a = body_json(resp).await;
        let a_id = a["task_id"].as_i64().unwrap();

        let resp = send(
            engine.clone(),
            form_request(
                "POST",
                "/task",
                &format!("command=echo+b&name=b&max_attempts=1&dependent_on={a_id}"),
            ),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let b = body_json(resp).await;
        assert_eq!(b["dependent_on"], serde_json::json!([a_id]));
    }

    #[tokio::test]
    async fn post_task_rejects_unknown_dependency() {
        let (engine, _guard) = test_engine().await;
        let resp = send(
            engine,
            form_request("POST", "/task", "command=echo+a&name=a&max_attempts=1&dependent_on=999"),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn list_tasks_reports_forward_not_reverse_dependencies() {
        let (engine, _guard) = test_engine().await;

        let a = send(
            engine.clone(),
            form_request("POST", "/task", "command=echo+a&name=a&max_attempts=1"),
        )
        .await;
        let a_id = body_json(a).await["task_id"].as_i64().unwrap();

        send(
            engine.clone(),
            form_request(
                "POST",
                "/task",
                &format!("command=echo+b&name=b&max_attempts=1&dependent_on={a_id}"),
            ),
        )
        .await;

        let resp = send(
            engine.clone(),
            Request::builder().uri("/listtasks/todo").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        let data = json["data"].as_array().unwrap();

        let task_a = data.iter().find(|t| t["task_id"] == a_id).unwrap();
        assert_eq!(
            task_a["dependent_on"],
            serde_json::json!([]),
            "a depends on nothing, it must not list b (the reverse edge)"
        );

        let task_b = data.iter().find(|t| t["name"] == "b").unwrap();
        assert_eq!(
            task_b["dependent_on"],
            serde_json::json!([a_id]),
            "b depends on a (the forward edge)"
        );
    }

    #[tokio::test]
    async fn attempt_lifecycle_dispatches_completes_and_goes_quiet() {
        let (engine, _guard) = test_engine().await;
        send(
            engine.clone(),
            form_request("POST", "/task", "command=echo+a&name=a&max_attempts=1"),
        )
        .await;

        let resp = send(
            engine.clone(),
            Request::builder()
                .uri("/attempt?runner_id=r1")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let picked = body_json(resp).await;
        assert_eq!(picked["status"], "attempt");
        let task_id = picked["task_id"].as_i64().unwrap();
        let attempt_id = picked["attempt_id"].as_i64().unwrap();

        let resp = send(
            engine.clone(),
            form_request(
                "PUT",
                "/attempt",
                &format!("runner_id=r1&task_id={task_id}&attempt_id={attempt_id}&status=completed"),
            ),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = send(
            engine.clone(),
            Request::builder()
                .uri("/attempt?runner_id=r1")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        let body = body_json(resp).await;
        assert_eq!(body["status"], "no attempt");
    }

    #[tokio::test]
    async fn delete_task_refused_while_a_live_dependent_exists() {
        let (engine, _guard) = test_engine().await;
        let a = send(
            engine.clone(),
            form_request("POST", "/task", "command=echo+a&name=a&max_attempts=1"),
        )
        .await;
        let a_id = body_json(a).await["task_id"].as_i64().unwrap();
        send(
            engine.clone(),
            form_request(
                "POST",
                "/task",
                &format!("command=echo+b&name=b&max_attempts=1&dependent_on={a_id}"),
            ),
        )
        .await;

        let resp = send(
            engine.clone(),
            form_request("DELETE", "/task", &format!("task_id={a_id}")),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = send(
            engine.clone(),
            Request::builder().uri("/listtasks/todo").body(Body::empty()).unwrap(),
        )
        .await;
        let json = body_json(resp).await;
        assert!(json["data"].as_array().unwrap().iter().any(|t| t["task_id"] == a_id));
    }

    #[tokio::test]
    async fn list_tasks_rejects_unknown_type() {
        let (engine, _guard) = test_engine().await;
        let resp = send(
            engine,
            Request::builder().uri("/listtasks/bogus").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
