use axum::{Extension, Json, extract::Path, http::StatusCode};
use serde_json::{Value, json};
use std::sync::Arc;

use super::protocol::*;
use crate::cache::single_object::CacheError;
use crate::cluster::service::ClusterStateService;
use crate::cluster::state::{ClusterState, PERSISTENT_TASKS_METADATA};
use crate::error::TaskError;
use crate::stats::{TaskStats, TaskStatsCache};
use crate::tasks::client::TaskClient;
use crate::tasks::coordinator::CoordinatorService;
use crate::tasks::node_service::PersistentTasksNodeService;
use crate::tasks::types::{TaskId, TaskRecord};

pub fn status_for(error: &TaskError) -> StatusCode {
    match error {
        TaskError::DuplicateTask(_) | TaskError::StaleRequest { .. } => StatusCode::CONFLICT,
        TaskError::TaskNotFound(_) => StatusCode::NOT_FOUND,
        TaskError::Unsupported(_)
        | TaskError::UnknownTaskName(_)
        | TaskError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        TaskError::NotCoordinator(_) | TaskError::NodeClosed => StatusCode::SERVICE_UNAVAILABLE,
        TaskError::TaskCancelled => StatusCode::GONE,
        TaskError::Transport(_) => StatusCode::BAD_GATEWAY,
    }
}

fn reply<T>(result: Result<T, TaskError>) -> (StatusCode, Json<Result<T, TaskError>>) {
    let status = match &result {
        Ok(_) => StatusCode::OK,
        Err(e) => status_for(e),
    };
    (status, Json(result))
}

pub async fn handle_coordinator_request(
    Extension(coordinator): Extension<Arc<CoordinatorService>>,
    Json(req): Json<CoordinatorRequest>,
) -> (StatusCode, Json<Result<CoordinatorResponse, TaskError>>) {
    let action = req.action.name();
    let result = coordinator.handle(req).await;
    if let Err(e) = &result {
        tracing::debug!("Coordinator request [{}] failed: {}", action, e);
    }
    reply(result)
}

pub async fn handle_local_cancel(
    Extension(node_service): Extension<Arc<PersistentTasksNodeService>>,
    Json(req): Json<LocalCancelRequest>,
) -> (StatusCode, Json<Result<bool, TaskError>>) {
    reply(Ok(node_service.cancel_local(&req)))
}

pub async fn handle_publish_state(
    Extension(cluster): Extension<Arc<ClusterStateService>>,
    Json(req): Json<PublishStateRequest>,
) -> StatusCode {
    match req {
        PublishStateRequest::Full(state) => {
            cluster.apply_published(state).await;
            StatusCode::OK
        }
        PublishStateRequest::Diff(diff) => match cluster.apply_diff(diff).await {
            Ok(_) => StatusCode::OK,
            Err(e) => {
                tracing::debug!("Rejected cluster state diff: {}", e);
                StatusCode::CONFLICT
            }
        },
    }
}

/// The raw local snapshot, read by a node taking over as master.
pub async fn handle_get_state(
    Extension(cluster): Extension<Arc<ClusterStateService>>,
) -> Json<ClusterState> {
    Json(ClusterState::clone(&cluster.state()))
}

/// JSON export of the local cluster state, tasks included.
pub async fn handle_list_tasks(
    Extension(cluster): Extension<Arc<ClusterStateService>>,
) -> Json<Value> {
    let state = cluster.state();
    Json(json!({
        "term": state.term,
        "version": state.version,
        "master_node": state.master_node,
        "nodes": state.nodes,
        (PERSISTENT_TASKS_METADATA): state.tasks,
    }))
}

pub async fn handle_get_task(
    Extension(cluster): Extension<Arc<ClusterStateService>>,
    Path(task_id): Path<String>,
) -> (StatusCode, Json<Option<Arc<TaskRecord>>>) {
    match cluster.state().tasks.get(&TaskId(task_id)) {
        Some(record) => (StatusCode::OK, Json(Some(record.clone()))),
        None => (StatusCode::NOT_FOUND, Json(None)),
    }
}

pub async fn handle_start_task(
    Extension(client): Extension<TaskClient>,
    Json(req): Json<StartTaskRequest>,
) -> (StatusCode, Json<Result<Arc<TaskRecord>, TaskError>>) {
    let result = client.send_start_request(req.task_id, &req.task_name, req.params).await;
    if let Ok(record) = &result {
        tracing::info!("Task submitted successfully: {}", record.id);
    }
    reply(result)
}

pub async fn handle_remove_task(
    Extension(client): Extension<TaskClient>,
    Path(task_id): Path<String>,
) -> (StatusCode, Json<Result<Arc<TaskRecord>, TaskError>>) {
    reply(client.send_remove_request(&TaskId(task_id)).await)
}

pub async fn handle_task_stats(
    Extension(cache): Extension<Arc<TaskStatsCache>>,
    Extension(cluster): Extension<Arc<ClusterStateService>>,
) -> (StatusCode, Json<Result<TaskStats, String>>) {
    // A dropped connection drops this future, which releases the listener.
    match cache.get(cluster.state(), || false).await {
        Ok(stats) => (StatusCode::OK, Json(Ok(stats))),
        Err(e @ CacheError::Cancelled) => {
            (StatusCode::SERVICE_UNAVAILABLE, Json(Err(e.to_string())))
        }
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, Json(Err(e.to_string()))),
    }
}
