//! Cluster State Module Tests
//!
//! ## Test Scopes
//! - **Nodes**: Election and protocol version queries over the live node set.
//! - **State Service**: Version bumps, no-op updates, rejected updates, close.
//! - **Publication**: Diff application on followers and change events.
//! - **Master Change**: Term ordering and registry recovery by a newly elected master.

#[cfg(test)]
mod tests {
    use crate::cluster::nodes::{ClusterMembership, DiscoveryNodes, NodeInfo, StaticMembership};
    use crate::cluster::service::{ClusterStateService, PeerStateSource};
    use crate::cluster::state::{ClusterChangedEvent, ClusterState, PERSISTENT_TASKS_METADATA};
    use crate::error::TaskError;
    use crate::membership::types::NodeId;
    use crate::tasks::types::{Assignment, TaskId};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;

    /// Fixed snapshots per peer; unknown peers are unreachable.
    #[derive(Default)]
    struct PeerSnapshots(HashMap<NodeId, ClusterState>);

    #[async_trait]
    impl PeerStateSource for PeerSnapshots {
        async fn fetch_state(&self, node: &NodeInfo) -> Result<ClusterState, TaskError> {
            self.0
                .get(&node.id)
                .cloned()
                .ok_or_else(|| TaskError::Transport(format!("node [{}] is not reachable", node.id)))
        }
    }

    fn registry_state(term: u64, version: u64, master: &str, task_ids: &[&str]) -> ClusterState {
        let mut tasks = crate::tasks::registry::TaskRegistry::default();
        for id in task_ids {
            tasks = tasks
                .add_task(TaskId::from(*id), "echo", json!({}), Assignment::initial())
                .unwrap();
        }
        let mut state = ClusterState::default()
            .with_nodes(nodes(&[("node-a", 2), ("node-b", 2)]), Some(NodeId::from(master)))
            .with_tasks(tasks);
        state.term = term;
        state.version = version;
        state
    }

    fn task_ids(state: &ClusterState) -> Vec<String> {
        let mut ids: Vec<String> = state.tasks.tasks().map(|t| t.id.0.clone()).collect();
        ids.sort();
        ids
    }

    fn nodes(ids: &[(&str, u32)]) -> DiscoveryNodes {
        DiscoveryNodes::new(ids.iter().map(|(id, v)| NodeInfo::local(*id, *v)))
    }

    // ============================================================
    // TEST 1: DiscoveryNodes - election and protocol versions
    // ============================================================

    #[test]
    fn test_discovery_nodes_elects_lowest_id() {
        let set = nodes(&[("node-b", 2), ("node-a", 1), ("node-c", 2)]);

        assert_eq!(set.elect_master(), Some(NodeId::from("node-a")));
        assert_eq!(set.min_protocol_version(), Some(1));
        assert!(set.supports_protocol(1));
        assert!(!set.supports_protocol(2));
    }

    #[test]
    fn test_empty_cluster_supports_nothing() {
        let set = DiscoveryNodes::default();

        assert_eq!(set.elect_master(), None);
        assert!(!set.supports_protocol(0));
    }

    // ============================================================
    // TEST 2: ClusterStateService - submit_update
    // ============================================================

    #[tokio::test]
    async fn test_submit_update_bumps_version() {
        // ARRANGE
        let service = ClusterStateService::new();
        let mut rx = service.subscribe();

        // ACT
        let state = service
            .submit_update("test", |s| {
                let tasks = s
                    .tasks
                    .add_task(TaskId::from("t1"), "echo", json!({}), Assignment::initial())?;
                Ok(s.with_tasks(tasks))
            })
            .await
            .unwrap();

        // ASSERT
        assert_eq!(state.version, 1);
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().version, 1);
        assert!(service.state().tasks.contains(&TaskId::from("t1")));
    }

    #[tokio::test]
    async fn test_noop_update_keeps_version() {
        let service = ClusterStateService::new();

        let state = service.submit_update("noop", |s| Ok(s.clone())).await.unwrap();

        assert_eq!(state.version, 0);
    }

    #[tokio::test]
    async fn test_rejected_update_does_not_publish() {
        let service = ClusterStateService::new();
        let rx = service.subscribe();

        let result = service
            .submit_update("bad", |s| {
                let tasks = s.tasks.remove_task(&TaskId::from("missing"))?;
                Ok(s.with_tasks(tasks))
            })
            .await;

        assert_eq!(result.unwrap_err(), TaskError::TaskNotFound(TaskId::from("missing")));
        assert!(!rx.has_changed().unwrap());
        assert_eq!(service.state().version, 0);
    }

    #[tokio::test]
    async fn test_closed_service_rejects_updates() {
        let service = ClusterStateService::new();
        service.close();

        let result = service.submit_update("late", |s| Ok(s.clone())).await;

        assert_eq!(result.unwrap_err(), TaskError::NodeClosed);
        assert!(service.closed_token().is_cancelled());
    }

    // ============================================================
    // TEST 3: Topology sync only on the elected master
    // ============================================================

    #[tokio::test]
    async fn test_sync_topology_on_master() {
        let service = ClusterStateService::new();
        let membership = StaticMembership {
            local: NodeId::from("node-a"),
            nodes: vec![NodeInfo::local("node-a", 2), NodeInfo::local("node-b", 2)],
        };

        let state = service
            .sync_topology(&membership, &PeerSnapshots::default())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(state.nodes.len(), 2);
        assert!(state.is_master(&membership.local_node_id()));
        assert_eq!(state.term, 1);

        // Staying master keeps the term
        let again = service
            .sync_topology(&membership, &PeerSnapshots::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.term, 1);
    }

    #[tokio::test]
    async fn test_sync_topology_skipped_on_follower() {
        let service = ClusterStateService::new();
        let membership = StaticMembership {
            local: NodeId::from("node-b"),
            nodes: vec![NodeInfo::local("node-a", 2), NodeInfo::local("node-b", 2)],
        };

        assert!(
            service
                .sync_topology(&membership, &PeerSnapshots::default())
                .await
                .unwrap()
                .is_none()
        );
        assert_eq!(service.state().version, 0);
    }

    // ============================================================
    // TEST 4: Diff publication to a follower
    // ============================================================

    #[tokio::test]
    async fn test_follower_applies_diff() {
        // ARRANGE: master with two versions, follower at the first one
        let master = ClusterStateService::new();
        let v1 = master
            .submit_update("nodes", |s| {
                Ok(s.with_nodes(nodes(&[("node-a", 2)]), Some(NodeId::from("node-a"))))
            })
            .await
            .unwrap();
        let follower = ClusterStateService::with_state(ClusterState::clone(&v1));
        let v2 = master
            .submit_update("add", |s| {
                let tasks = s
                    .tasks
                    .add_task(TaskId::from("t1"), "echo", json!({"n": 1}), Assignment::initial())?;
                Ok(s.with_tasks(tasks))
            })
            .await
            .unwrap();

        // ACT
        let diff = v2.diff(&v1);
        let applied = follower.apply_diff(diff.clone()).await.unwrap();

        // ASSERT
        assert!(applied);
        assert_eq!(diff.tasks.upserted.len(), 1);
        assert_eq!(*follower.state(), *v2);

        // Replaying the same diff is ignored
        assert!(!follower.apply_diff(diff).await.unwrap());
    }

    #[tokio::test]
    async fn test_diff_against_wrong_base_is_rejected() {
        let follower = ClusterStateService::new();
        let mut target = ClusterState::default();
        target.version = 5;
        let mut base = ClusterState::default();
        base.version = 4;

        let result = follower.apply_diff(target.diff(&base)).await;

        assert!(matches!(result, Err(TaskError::InvalidRequest(_))));
        assert!(follower.apply_published(target).await);
        assert_eq!(follower.state().version, 5);
    }

    // ============================================================
    // TEST 5: Change events and JSON export
    // ============================================================

    #[test]
    fn test_changed_event_reports_node_delta() {
        let mut previous = ClusterState::default();
        previous.nodes = nodes(&[("node-a", 2), ("node-b", 2)]);
        let mut current = previous.clone();
        current.nodes = nodes(&[("node-a", 2), ("node-c", 2)]);
        current.master_node = Some(NodeId::from("node-a"));

        let event = ClusterChangedEvent::new(previous.into(), current.into());

        assert_eq!(event.nodes_added(), vec![NodeId::from("node-c")]);
        assert_eq!(event.nodes_removed(), vec![NodeId::from("node-b")]);
        assert!(event.nodes_changed());
        assert!(event.master_changed());
        assert!(!event.tasks_changed());
        assert!(event.local_node_master(&NodeId::from("node-a")));
    }

    #[test]
    fn test_state_exports_tasks_block() {
        let state = ClusterState::default();
        let tasks = state
            .tasks
            .add_task(TaskId::from("t1"), "echo", json!({"x": 1}), Assignment::initial())
            .unwrap();
        let state = state.with_tasks(tasks);

        let value = serde_json::to_value(&state).unwrap();

        assert_eq!(value[PERSISTENT_TASKS_METADATA]["tasks"]["t1"]["task_name"], "echo");
        let restored: ClusterState = serde_json::from_value(value).unwrap();
        assert_eq!(restored, state);
    }

    // ============================================================
    // TEST 6: Master change keeps the task registry
    // ============================================================

    #[tokio::test]
    async fn test_new_master_adopts_freshest_peer_state() {
        // ARRANGE: node-b holds the registry at version 5; node-a joins empty
        // and has the lowest id
        let held_by_b = registry_state(0, 5, "node-b", &["t0", "t1", "t2", "t3"]);
        let follower = ClusterStateService::with_state(held_by_b.clone());
        let new_master = ClusterStateService::new();
        let membership = StaticMembership {
            local: NodeId::from("node-a"),
            nodes: vec![NodeInfo::local("node-a", 2), NodeInfo::local("node-b", 2)],
        };
        let peers = PeerSnapshots(HashMap::from([(NodeId::from("node-b"), held_by_b)]));
        let before_election = new_master.state();

        // ACT
        let elected = new_master.sync_topology(&membership, &peers).await.unwrap().unwrap();

        // ASSERT: registry carried over in a new term
        assert_eq!(elected.term, 1);
        assert_eq!(elected.version, 6);
        assert!(elected.is_master(&NodeId::from("node-a")));
        assert_eq!(task_ids(&elected), vec!["t0", "t1", "t2", "t3"]);

        // A diff from the new master's pre-election base does not fit the follower
        let stale_diff = elected.diff(&before_election);
        assert!(matches!(
            follower.apply_diff(stale_diff).await,
            Err(TaskError::InvalidRequest(_))
        ));

        // The full state is accepted, after which diffs apply again
        assert!(follower.apply_published(ClusterState::clone(&elected)).await);
        let next = new_master
            .submit_update("add", |s| {
                let tasks = s
                    .tasks
                    .add_task(TaskId::from("n1"), "echo", json!({}), Assignment::initial())?;
                Ok(s.with_tasks(tasks))
            })
            .await
            .unwrap();
        assert!(follower.apply_diff(next.diff(&elected)).await.unwrap());
        assert_eq!(*follower.state(), *next);
    }

    #[tokio::test]
    async fn test_unreachable_peers_do_not_block_election() {
        let new_master = ClusterStateService::with_state(registry_state(2, 3, "node-b", &["t0"]));
        let membership = StaticMembership {
            local: NodeId::from("node-a"),
            nodes: vec![NodeInfo::local("node-a", 2), NodeInfo::local("node-b", 2)],
        };

        let elected = new_master
            .sync_topology(&membership, &PeerSnapshots::default())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(elected.term, 3);
        assert_eq!(task_ids(&elected), vec!["t0"]);
    }

    #[tokio::test]
    async fn test_later_term_replaces_state_with_higher_version() {
        // ARRANGE
        let follower =
            ClusterStateService::with_state(registry_state(1, 9, "node-b", &["t0", "t1"]));

        // ACT
        let older_term = follower
            .apply_published(registry_state(0, 20, "node-c", &["x"]))
            .await;
        let newer_term = follower
            .apply_published(registry_state(2, 4, "node-a", &["n1"]))
            .await;

        // ASSERT
        assert!(!older_term);
        assert!(newer_term);
        assert_eq!(follower.state().freshness(), (2, 4));
        assert_eq!(task_ids(&follower.state()), vec!["n1"]);
    }

    #[tokio::test]
    async fn test_diff_needs_matching_term_not_just_version() {
        // ARRANGE: same version number, reached under different masters
        let follower = ClusterStateService::with_state(registry_state(1, 5, "node-b", &["t0"]));
        let other_base = registry_state(2, 5, "node-a", &["n1"]);
        let mut target = other_base.clone();
        target.version = 6;

        // ACT
        let result = follower.apply_diff(target.diff(&other_base)).await;

        // ASSERT
        assert!(matches!(result, Err(TaskError::InvalidRequest(_))));
        assert_eq!(task_ids(&follower.state()), vec!["t0"]);
    }
}
