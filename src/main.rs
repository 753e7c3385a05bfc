use axum::{
    Router,
    extract::Extension,
    routing::{get, post},
};
use clap::Parser;
use persistent_cluster::cluster::nodes::ClusterMembership;
use persistent_cluster::cluster::service::{ClusterStateService, PeerStateSource};
use persistent_cluster::config::NodeConfig;
use persistent_cluster::membership::service::MembershipService;
use persistent_cluster::stats::task_stats_cache;
use persistent_cluster::tasks::builtin::ProgressExecutor;
use persistent_cluster::tasks::client::TaskClient;
use persistent_cluster::tasks::coordinator::CoordinatorService;
use persistent_cluster::tasks::executor::ExecutorRegistryBuilder;
use persistent_cluster::tasks::node_service::PersistentTasksNodeService;
use persistent_cluster::tasks::tracking::LocalTaskManager;
use persistent_cluster::transport::ClusterTransport;
use persistent_cluster::transport::handlers::*;
use persistent_cluster::transport::http::HttpTransport;
use persistent_cluster::transport::protocol::*;
use persistent_cluster::transport::publisher::run_state_publisher;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const TOPOLOGY_SYNC_INTERVAL: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = NodeConfig::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let http_addr = config.http_addr()?;
    tracing::info!("Starting node on {}", config.bind);
    if !config.seeds.is_empty() {
        tracing::info!("Seed nodes: {:?}", config.seeds);
    } else {
        tracing::info!("Starting as seed node (founder)");
    }

    // 1. Membership (UDP gossip):
    let membership = MembershipService::new(
        config.bind,
        http_addr,
        config.seeds.clone(),
        config.protocol_version,
    )
    .await?;
    let local_node = membership.local_node_id();
    tracing::info!("Node ID: {}", local_node);

    // 2. Cluster state, executors and transport:
    let cluster = ClusterStateService::new();
    let executors = ExecutorRegistryBuilder::new().register(ProgressExecutor).build()?;
    let http_transport = HttpTransport::new(cluster.clone(), config.http_timeout());
    let transport: Arc<dyn ClusterTransport> = http_transport.clone();
    let client = TaskClient::new(cluster.clone(), transport.clone());
    let task_manager = Arc::new(LocalTaskManager::new());

    // 3. Persistent task services:
    let coordinator = CoordinatorService::new(
        local_node.clone(),
        cluster.clone(),
        executors.clone(),
        transport,
        config.coordinator_settings(),
    );
    let node_service = PersistentTasksNodeService::new(
        local_node.clone(),
        cluster.clone(),
        executors,
        task_manager,
        client.clone(),
    );
    let stats_cache = Arc::new(task_stats_cache());

    // 4. HTTP Router:
    let app = Router::new()
        .route(ENDPOINT_COORDINATOR, post(handle_coordinator_request))
        .route(ENDPOINT_LOCAL_CANCEL, post(handle_local_cancel))
        .route(ENDPOINT_PUBLISH_STATE, get(handle_get_state).post(handle_publish_state))
        .route(ENDPOINT_TASKS, get(handle_list_tasks).post(handle_start_task))
        .route(ENDPOINT_TASK, get(handle_get_task).delete(handle_remove_task))
        .route(ENDPOINT_TASK_STATS, get(handle_task_stats))
        .layer(Extension(coordinator.clone()))
        .layer(Extension(node_service.clone()))
        .layer(Extension(cluster.clone()))
        .layer(Extension(client))
        .layer(Extension(stats_cache));

    // 5. Background loops:
    membership.clone().start().await;

    let sync_membership: Arc<dyn ClusterMembership> = membership.clone();
    let peer_states: Arc<dyn PeerStateSource> = http_transport.clone();
    tokio::spawn(
        cluster
            .clone()
            .run_topology_sync(sync_membership, peer_states, TOPOLOGY_SYNC_INTERVAL),
    );
    tokio::spawn(coordinator.run());
    tokio::spawn(node_service.run());
    tokio::spawn(run_state_publisher(cluster.clone(), http_transport, local_node));

    // 6. Start HTTP server:
    tracing::info!("HTTP server listening on {}", http_addr);
    tracing::info!("Press Ctrl+C to shutdown");

    let listener = tokio::net::TcpListener::bind(http_addr).await?;
    let shutdown_cluster = cluster.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            shutdown_cluster.close();
        })
        .await?;

    Ok(())
}
