//! Transport Module Tests
//!
//! ## Test Scopes
//! - **Protocol**: Wire shape of coordinator requests and publication payloads.
//! - **Handlers**: Status mapping and direct handler calls.
//! - **In-Process Transport**: Routing and unreachable targets.
//! - **HTTP Transport**: Requests to a real `axum` server on an ephemeral port.

#[cfg(test)]
mod tests {
    use crate::cluster::nodes::{DiscoveryNodes, NodeInfo};
    use crate::cluster::service::{ClusterStateService, PeerStateSource};
    use crate::cluster::state::{ClusterState, PERSISTENT_TASKS_METADATA};
    use crate::error::TaskError;
    use crate::membership::types::NodeId;
    use crate::tasks::client::TaskClient;
    use crate::tasks::coordinator::{CoordinatorService, CoordinatorSettings};
    use crate::tasks::executor::{ExecutorRegistry, ExecutorRegistryBuilder};
    use crate::tasks::types::{Assignment, TaskId};
    use crate::transport::ClusterTransport;
    use crate::transport::handlers::*;
    use crate::transport::http::HttpTransport;
    use crate::transport::local::InProcessTransport;
    use crate::transport::protocol::*;
    use axum::extract::{Extension, Path};
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::json;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;

    fn noop_executors() -> Arc<ExecutorRegistry> {
        ExecutorRegistryBuilder::new()
            .register_fn("noop", |_task, _params, _state| async { Ok::<(), anyhow::Error>(()) })
            .build()
            .unwrap()
    }

    fn state_with(nodes: Vec<NodeInfo>) -> ClusterState {
        let set = DiscoveryNodes::new(nodes);
        let master = set.elect_master();
        ClusterState::default().with_nodes(set, master)
    }

    fn coordinator_on(cluster: &Arc<ClusterStateService>, local: &str) -> Arc<CoordinatorService> {
        CoordinatorService::new(
            NodeId::from(local),
            cluster.clone(),
            noop_executors(),
            InProcessTransport::new(),
            CoordinatorSettings::default(),
        )
    }

    async fn serve(app: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    // ============================================================
    // TEST 1: Protocol wire shape
    // ============================================================

    #[test]
    fn test_coordinator_request_is_tagged_by_action() {
        let request = CoordinatorRequest {
            origin: "persistent_tasks".into(),
            action: CoordinatorAction::Complete {
                task_id: TaskId::from("t1"),
                allocation_id: 4,
                failure: None,
                local_abort_reason: Some("disk full".into()),
            },
        };

        let value = serde_json::to_value(&request).unwrap();

        assert_eq!(value["action"]["type"], "complete");
        assert_eq!(value["action"]["task_id"], "t1");
        assert_eq!(value["action"]["allocation_id"], 4);
        assert_eq!(request.action.name(), "complete");
        let decoded: CoordinatorRequest = serde_json::from_value(value).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_error_results_survive_the_wire() {
        let result: Result<CoordinatorResponse, TaskError> = Err(TaskError::StaleRequest {
            id: TaskId::from("t1"),
            requested: 1,
            current: 3,
        });

        let encoded = serde_json::to_string(&result).unwrap();
        let decoded: Result<CoordinatorResponse, TaskError> =
            serde_json::from_str(&encoded).unwrap();

        assert_eq!(decoded, result);
    }

    #[test]
    fn test_start_request_params_default_to_null() {
        let request: StartTaskRequest =
            serde_json::from_value(json!({"task_id": "t1", "task_name": "noop"})).unwrap();

        assert_eq!(request.params, serde_json::Value::Null);
    }

    // ============================================================
    // TEST 2: Handlers
    // ============================================================

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(&TaskError::DuplicateTask(TaskId::from("a"))), StatusCode::CONFLICT);
        assert_eq!(status_for(&TaskError::TaskNotFound(TaskId::from("a"))), StatusCode::NOT_FOUND);
        assert_eq!(status_for(&TaskError::Unsupported("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(
            status_for(&TaskError::NotCoordinator("n".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(status_for(&TaskError::Transport("x".into())), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_publish_handler_applies_full_and_rejects_wrong_diff() {
        // ARRANGE
        let follower = ClusterStateService::new();
        let mut published = state_with(vec![NodeInfo::local("node-a", 2)]);
        published.version = 5;
        let mut next = published.with_tasks(
            published
                .tasks
                .add_task(TaskId::from("t1"), "noop", json!({}), Assignment::initial())
                .unwrap(),
        );
        next.version = 6;
        let mut unrelated = next.clone();
        unrelated.version = 9;

        // ACT
        let full = handle_publish_state(
            Extension(follower.clone()),
            Json(PublishStateRequest::Full(published.clone())),
        )
        .await;
        let diff = handle_publish_state(
            Extension(follower.clone()),
            Json(PublishStateRequest::Diff(next.diff(&published))),
        )
        .await;
        let wrong_base = handle_publish_state(
            Extension(follower.clone()),
            Json(PublishStateRequest::Diff(unrelated.diff(&published))),
        )
        .await;

        // ASSERT
        assert_eq!(full, StatusCode::OK);
        assert_eq!(diff, StatusCode::OK);
        assert_eq!(wrong_base, StatusCode::CONFLICT);
        assert_eq!(follower.state().version, 6);
        assert!(follower.state().tasks.contains(&TaskId::from("t1")));
    }

    #[tokio::test]
    async fn test_list_and_get_handlers() {
        let cluster =
            ClusterStateService::with_state(state_with(vec![NodeInfo::local("node-a", 2)]));
        let coordinator = coordinator_on(&cluster, "node-a");
        coordinator
            .create_task(TaskId::from("t1"), "noop", json!({"k": 1}))
            .await
            .unwrap();

        let Json(listed) = handle_list_tasks(Extension(cluster.clone())).await;
        let (found, Json(record)) =
            handle_get_task(Extension(cluster.clone()), Path("t1".to_string())).await;
        let (missing, _) =
            handle_get_task(Extension(cluster.clone()), Path("nope".to_string())).await;

        assert!(listed[PERSISTENT_TASKS_METADATA]["tasks"]["t1"].is_object());
        assert_eq!(found, StatusCode::OK);
        assert_eq!(record.unwrap().params, json!({"k": 1}));
        assert_eq!(missing, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_coordinator_handler_reports_errors_with_status() {
        let cluster =
            ClusterStateService::with_state(state_with(vec![NodeInfo::local("node-a", 2)]));
        let follower = coordinator_on(&cluster, "node-b");
        let request = CoordinatorRequest {
            origin: "test".into(),
            action: CoordinatorAction::Remove {
                task_id: TaskId::from("t1"),
            },
        };

        let (status, Json(result)) =
            handle_coordinator_request(Extension(follower), Json(request)).await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(matches!(result, Err(TaskError::NotCoordinator(_))));
    }

    // ============================================================
    // TEST 3: InProcessTransport
    // ============================================================

    #[tokio::test]
    async fn test_in_process_transport_without_targets() {
        let transport = InProcessTransport::new();
        let request = CoordinatorRequest {
            origin: "test".into(),
            action: CoordinatorAction::Remove {
                task_id: TaskId::from("t1"),
            },
        };
        let cancel = LocalCancelRequest {
            origin: "test".into(),
            task_id: TaskId::from("t1"),
            allocation_id: 0,
            reason: "by user request".into(),
        };

        assert!(matches!(
            transport.send_to_coordinator(request).await,
            Err(TaskError::Transport(_))
        ));
        assert!(matches!(
            transport.send_to_node(&NodeId::from("node-a"), cancel).await,
            Err(TaskError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_in_process_transport_drops_released_coordinator() {
        // ARRANGE
        let cluster =
            ClusterStateService::with_state(state_with(vec![NodeInfo::local("node-a", 2)]));
        let transport = InProcessTransport::new();
        let coordinator = coordinator_on(&cluster, "node-a");
        transport.set_coordinator(&coordinator);
        let client = TaskClient::new(cluster.clone(), transport.clone());
        client
            .send_start_request(TaskId::from("t1"), "noop", json!({}))
            .await
            .unwrap();

        // ACT
        drop(coordinator);
        let result = client.send_start_request(TaskId::from("t2"), "noop", json!({})).await;

        // ASSERT
        assert!(matches!(result, Err(TaskError::Transport(_))));
    }

    #[tokio::test]
    async fn test_in_process_transport_reads_registered_state() {
        let transport = InProcessTransport::new();
        let mut state = state_with(vec![NodeInfo::local("node-b", 2)]);
        state.term = 3;
        let cluster = ClusterStateService::with_state(state.clone());
        transport.register_state(NodeId::from("node-b"), &cluster);

        let fetched = transport.fetch_state(&NodeInfo::local("node-b", 2)).await.unwrap();
        let missing = transport.fetch_state(&NodeInfo::local("node-c", 2)).await;

        assert_eq!(fetched, state);
        assert!(matches!(missing, Err(TaskError::Transport(_))));
    }

    // ============================================================
    // TEST 4: HttpTransport
    // ============================================================

    #[tokio::test]
    async fn test_http_requests_reach_remote_coordinator() {
        // ARRANGE
        let leader_cluster = ClusterStateService::with_state(state_with(vec![
            NodeInfo::local("node-a", 2),
            NodeInfo::local("node-b", 2),
        ]));
        let coordinator = coordinator_on(&leader_cluster, "node-a");
        let app = Router::new()
            .route(ENDPOINT_COORDINATOR, post(handle_coordinator_request))
            .layer(Extension(coordinator));
        let leader_addr = serve(app).await;

        let follower_cluster = ClusterStateService::with_state(state_with(vec![
            NodeInfo {
                id: NodeId::from("node-a"),
                http_addr: Some(leader_addr),
                protocol_version: 2,
            },
            NodeInfo::local("node-b", 2),
        ]));
        let transport = HttpTransport::new(follower_cluster.clone(), Duration::from_secs(2));
        let client = TaskClient::new(follower_cluster, transport);

        // ACT
        let created = client
            .send_start_request(TaskId::from("t1"), "noop", json!({}))
            .await
            .unwrap();
        let duplicate = client.send_start_request(TaskId::from("t1"), "noop", json!({})).await;
        let missing = client.send_remove_request(&TaskId::from("nope")).await;

        // ASSERT
        assert!(created.assignment.is_assigned_to(&NodeId::from("node-a")));
        assert!(leader_cluster.state().tasks.contains(&TaskId::from("t1")));
        assert_eq!(duplicate.unwrap_err(), TaskError::DuplicateTask(TaskId::from("t1")));
        assert_eq!(missing.unwrap_err(), TaskError::TaskNotFound(TaskId::from("nope")));
    }

    #[tokio::test]
    async fn test_http_publish_full_and_diff_fallback() {
        // ARRANGE
        let follower = ClusterStateService::new();
        let app = Router::new()
            .route(ENDPOINT_PUBLISH_STATE, post(handle_publish_state))
            .layer(Extension(follower.clone()));
        let addr = serve(app).await;
        let target = NodeInfo {
            id: NodeId::from("node-b"),
            http_addr: Some(addr),
            protocol_version: 2,
        };
        let transport = HttpTransport::new(ClusterStateService::new(), Duration::from_secs(2));
        let mut state = state_with(vec![NodeInfo::local("node-a", 2), target.clone()]);
        state.version = 3;
        let mut unrelated = state.clone();
        unrelated.version = 10;

        // ACT
        let full = transport
            .publish(&target, &PublishStateRequest::Full(state.clone()))
            .await
            .unwrap();
        let mismatched = transport
            .publish(&target, &PublishStateRequest::Diff(unrelated.diff(&ClusterState::default())))
            .await
            .unwrap();

        // ASSERT
        assert!(full);
        assert!(!mismatched);
        assert_eq!(follower.state().version, 3);
        assert_eq!(follower.state().master_node, Some(NodeId::from("node-a")));
    }

    #[tokio::test]
    async fn test_http_transport_needs_known_addresses() {
        let cluster =
            ClusterStateService::with_state(state_with(vec![NodeInfo::local("node-a", 2)]));
        let transport = HttpTransport::new(cluster, Duration::from_millis(200));
        let cancel = LocalCancelRequest {
            origin: "test".into(),
            task_id: TaskId::from("t1"),
            allocation_id: 0,
            reason: "by user request".into(),
        };

        let result = transport.send_to_node(&NodeId::from("node-a"), cancel).await;

        assert!(matches!(result, Err(TaskError::Transport(_))));
    }

    #[tokio::test]
    async fn test_http_fetch_state_returns_peer_snapshot() {
        // ARRANGE
        let mut state = state_with(vec![NodeInfo::local("node-b", 2)]);
        state.term = 2;
        state.version = 7;
        state.tasks = state
            .tasks
            .add_task(TaskId::from("t1"), "noop", json!({"n": 1}), Assignment::initial())
            .unwrap();
        let peer = ClusterStateService::with_state(state.clone());
        let app = Router::new()
            .route(ENDPOINT_PUBLISH_STATE, get(handle_get_state))
            .layer(Extension(peer));
        let addr = serve(app).await;
        let target = NodeInfo {
            id: NodeId::from("node-b"),
            http_addr: Some(addr),
            protocol_version: 2,
        };
        let transport = HttpTransport::new(ClusterStateService::new(), Duration::from_secs(2));

        // ACT
        let fetched = transport.fetch_state(&target).await.unwrap();
        let unaddressed = transport.fetch_state(&NodeInfo::local("node-c", 2)).await;

        // ASSERT
        assert_eq!(fetched, state);
        assert!(matches!(unaddressed, Err(TaskError::Transport(_))));
    }
}
