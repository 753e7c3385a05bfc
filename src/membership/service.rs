use anyhow::Result;
use dashmap::DashMap;
use rand::seq::SliceRandom;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;

use super::types::{GossipMessage, Node, NodeId, NodeState};
use crate::cluster::nodes::{ClusterMembership, NodeInfo};

const GOSSIP_INTERVAL: Duration = Duration::from_millis(500);
const FAILURE_DETECTION_INTERVAL: Duration = Duration::from_secs(2);
const SUSPECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEAD_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_DATAGRAM: usize = 64 * 1024;

/// UDP gossip membership for one node.
///
/// Keeps the member table the task coordinator reads its live node set from. Peers
/// are pinged at random, acks carry the full table, and silent peers move through
/// `Suspect` to `Dead` on timeouts.
pub struct MembershipService {
    pub local_node: Node,
    pub members: Arc<DashMap<NodeId, Node>>,
    socket: Arc<UdpSocket>,
    incarnation: AtomicU64,
}

impl MembershipService {
    /// Binds the gossip socket and announces this node to every seed.
    pub async fn new(
        bind_addr: SocketAddr,
        http_addr: SocketAddr,
        seed_nodes: Vec<SocketAddr>,
        protocol_version: u32,
    ) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(bind_addr).await?;
        // Port 0 binds are resolved here so peers learn the real address.
        let gossip_addr = socket.local_addr()?;

        let local_node = Node {
            id: NodeId::new(),
            gossip_addr,
            http_addr,
            state: NodeState::Alive,
            incarnation: 1,
            protocol_version,
            last_seen: Some(Instant::now()),
        };
        let members = Arc::new(DashMap::new());
        members.insert(local_node.id.clone(), local_node.clone());

        if !seed_nodes.is_empty() {
            let join = bincode::serialize(&GossipMessage::Join { node: local_node.clone() })?;
            for seed in &seed_nodes {
                socket.send_to(&join, seed).await?;
                tracing::info!("Join sent to seed {}", seed);
            }
        }

        Ok(Arc::new(Self {
            incarnation: AtomicU64::new(local_node.incarnation),
            local_node,
            members,
            socket: Arc::new(socket),
        }))
    }

    /// Spawns the ping, receive and failure detection loops.
    pub async fn start(self: Arc<Self>) {
        tokio::spawn(self.clone().gossip_loop());
        tokio::spawn(self.clone().receive_loop());
        tokio::spawn(self.clone().failure_detection_loop());
        tracing::info!(
            "Membership service for {} started on {}",
            self.local_node.id,
            self.local_node.gossip_addr
        );
    }

    pub fn get_alive_members(&self) -> Vec<Node> {
        self.members
            .iter()
            .filter(|entry| entry.value().state == NodeState::Alive)
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn get_member(&self, node_id: &NodeId) -> Option<Node> {
        self.members.get(node_id).map(|entry| entry.value().clone())
    }

    /// Alive members other than this node, as `(id, gossip address)` pairs.
    fn alive_peers(&self) -> Vec<(NodeId, SocketAddr)> {
        self.members
            .iter()
            .map(|entry| entry.value().clone())
            .filter(|member| member.id != self.local_node.id && member.state == NodeState::Alive)
            .map(|member| (member.id, member.gossip_addr))
            .collect()
    }

    fn current_incarnation(&self) -> u64 {
        self.incarnation.load(Ordering::Acquire)
    }

    async fn send(&self, msg: &GossipMessage, addr: SocketAddr) -> Result<()> {
        let encoded = bincode::serialize(msg)?;
        self.socket.send_to(&encoded, addr).await?;
        Ok(())
    }

    async fn broadcast(&self, msg: GossipMessage) {
        for (id, addr) in self.alive_peers() {
            if let Err(e) = self.send(&msg, addr).await {
                tracing::warn!("Gossip broadcast to {} failed: {}", id, e);
            }
        }
    }

    /// Records direct contact from a peer.
    fn observe(&self, from: &NodeId, incarnation: u64) {
        if let Some(mut member) = self.members.get_mut(from) {
            member.last_seen = Some(Instant::now());
            member.incarnation = member.incarnation.max(incarnation);
        }
    }

    async fn gossip_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(GOSSIP_INTERVAL);
        loop {
            ticker.tick().await;

            let peers = self.alive_peers();
            let Some((target, addr)) = peers.choose(&mut rand::thread_rng()).cloned() else {
                continue;
            };
            let ping = GossipMessage::Ping {
                from: self.local_node.id.clone(),
                incarnation: self.current_incarnation(),
            };
            match self.send(&ping, addr).await {
                Ok(()) => tracing::trace!("Ping -> {}", target),
                Err(e) => tracing::warn!("Ping to {} failed: {}", target, e),
            }
        }
    }

    async fn receive_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (len, src) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    tracing::error!("Gossip socket receive failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };

            let msg = match bincode::deserialize::<GossipMessage>(&buf[..len]) {
                Ok(msg) => msg,
                Err(e) => {
                    tracing::warn!("Dropping malformed gossip datagram from {}: {}", src, e);
                    continue;
                }
            };

            if let Err(e) = self.dispatch(msg, src).await {
                tracing::error!("Gossip message from {} not handled: {}", src, e);
            }
        }
    }

    async fn dispatch(&self, msg: GossipMessage, src: SocketAddr) -> Result<()> {
        match msg {
            GossipMessage::Ping { from, incarnation } => {
                // Unknown senders are learned from Join or Ack, which carry their addresses.
                self.observe(&from, incarnation);
                let ack = GossipMessage::Ack {
                    from: self.local_node.id.clone(),
                    incarnation: self.current_incarnation(),
                    members: self.members.iter().map(|entry| entry.value().clone()).collect(),
                };
                self.send(&ack, src).await?;
            }
            GossipMessage::Ack { from, incarnation, members } => {
                tracing::trace!("Ack <- {} with {} members", from, members.len());
                self.observe(&from, incarnation);
                members.into_iter().for_each(|member| self.merge_member(member));
            }
            GossipMessage::Join { mut node } => {
                node.state = NodeState::Alive;
                node.last_seen = Some(Instant::now());
                tracing::info!(
                    "{} joined from {} (protocol v{})",
                    node.id,
                    node.gossip_addr,
                    node.protocol_version
                );
                self.members.insert(node.id.clone(), node);
            }
            GossipMessage::Suspect { node_id, incarnation } if node_id == self.local_node.id => {
                self.refute(incarnation).await;
            }
            GossipMessage::Suspect { node_id, incarnation } => {
                if let Some(mut member) = self.members.get_mut(&node_id)
                    && member.state == NodeState::Alive
                    && incarnation >= member.incarnation
                {
                    tracing::info!("{} reported suspect by a peer", node_id);
                    member.state = NodeState::Suspect;
                    member.incarnation = incarnation;
                    member.last_seen = Some(Instant::now());
                }
            }
            GossipMessage::Alive { node_id, incarnation } => {
                if let Some(mut member) = self.members.get_mut(&node_id) {
                    let refutes =
                        incarnation == member.incarnation && member.state == NodeState::Suspect;
                    if incarnation > member.incarnation || refutes {
                        tracing::info!("{} alive again at incarnation {}", node_id, incarnation);
                        member.state = NodeState::Alive;
                        member.incarnation = incarnation;
                        member.last_seen = Some(Instant::now());
                    }
                }
            }
        }
        Ok(())
    }

    /// Outbids a suspicion about this node and tells every peer.
    async fn refute(&self, accused_at: u64) {
        let bumped = self.incarnation.fetch_max(accused_at, Ordering::AcqRel).max(accused_at) + 1;
        self.incarnation.store(bumped, Ordering::Release);

        if let Some(mut me) = self.members.get_mut(&self.local_node.id) {
            me.incarnation = bumped;
            me.state = NodeState::Alive;
            me.last_seen = Some(Instant::now());
        }

        tracing::info!("Refuting suspicion at incarnation {}", bumped);
        self.broadcast(GossipMessage::Alive {
            node_id: self.local_node.id.clone(),
            incarnation: bumped,
        })
        .await;
    }

    /// Folds one entry of a peer's member table into ours.
    fn merge_member(&self, incoming: Node) {
        if incoming.id == self.local_node.id {
            return;
        }

        let Some(mut known) = self.members.get_mut(&incoming.id) else {
            tracing::info!(
                "Learned of {} at {} (protocol v{})",
                incoming.id,
                incoming.gossip_addr,
                incoming.protocol_version
            );
            let id = incoming.id.clone();
            self.members.insert(id, Node { last_seen: Some(Instant::now()), ..incoming });
            return;
        };

        if incoming.incarnation > known.incarnation {
            tracing::debug!(
                "{} incarnation {} -> {}",
                incoming.id,
                known.incarnation,
                incoming.incarnation
            );
            known.state = incoming.state;
            known.incarnation = incoming.incarnation;
            known.protocol_version = incoming.protocol_version;
            known.last_seen = Some(Instant::now());
        } else if incoming.incarnation == known.incarnation
            && incoming.state == NodeState::Alive
            && known.state == NodeState::Suspect
        {
            known.state = NodeState::Alive;
            known.last_seen = Some(Instant::now());
        }
    }

    async fn failure_detection_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(FAILURE_DETECTION_INTERVAL);
        loop {
            ticker.tick().await;
            for suspicion in self.sweep(Instant::now()) {
                self.broadcast(suspicion).await;
            }
        }
    }

    /// Advances silent members through the failure states and returns the
    /// suspicions to broadcast.
    fn sweep(&self, now: Instant) -> Vec<GossipMessage> {
        let mut suspicions = Vec::new();
        for mut entry in self.members.iter_mut() {
            let member = entry.value_mut();
            if member.id == self.local_node.id {
                continue;
            }
            let silence = now.duration_since(*member.last_seen.get_or_insert(now));

            match member.state {
                NodeState::Alive if silence > SUSPECT_TIMEOUT => {
                    tracing::warn!("{} silent for {:?}, marking suspect", member.id, silence);
                    member.state = NodeState::Suspect;
                    suspicions.push(GossipMessage::Suspect {
                        node_id: member.id.clone(),
                        incarnation: member.incarnation,
                    });
                }
                NodeState::Suspect if silence > DEAD_TIMEOUT => {
                    tracing::warn!("{} silent for {:?}, marking dead", member.id, silence);
                    member.state = NodeState::Dead;
                }
                _ => {}
            }
        }
        suspicions
    }
}

impl From<&Node> for NodeInfo {
    fn from(node: &Node) -> Self {
        NodeInfo {
            id: node.id.clone(),
            http_addr: Some(node.http_addr),
            protocol_version: node.protocol_version,
        }
    }
}

impl ClusterMembership for MembershipService {
    fn local_node_id(&self) -> NodeId {
        self.local_node.id.clone()
    }

    fn live_nodes(&self) -> Vec<NodeInfo> {
        self.get_alive_members().iter().map(NodeInfo::from).collect()
    }
}
