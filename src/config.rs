//! Node configuration.
//!
//! Every flag can also be set through a `PT_*` environment variable.

use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;

use crate::membership::types::CURRENT_PROTOCOL_VERSION;
use crate::tasks::coordinator::CoordinatorSettings;
use crate::tasks::types::CompletionPolicy;

#[derive(Debug, Clone, Parser)]
#[command(name = "persistent-node", about = "Cluster node running persistent tasks")]
pub struct NodeConfig {
    /// UDP address for gossip membership.
    #[arg(long, env = "PT_BIND", default_value = "127.0.0.1:5000")]
    pub bind: SocketAddr,

    /// Gossip address of an existing member. Repeat for several seeds.
    #[arg(long = "seed", env = "PT_SEEDS", value_delimiter = ',')]
    pub seeds: Vec<SocketAddr>,

    /// The HTTP API listens on the gossip port plus this offset.
    #[arg(long, env = "PT_HTTP_PORT_OFFSET", default_value_t = 1000)]
    pub http_port_offset: u16,

    #[arg(long, env = "PT_PROTOCOL_VERSION", default_value_t = CURRENT_PROTOCOL_VERSION)]
    pub protocol_version: u32,

    /// Seconds between reassignment checks on the coordinator.
    #[arg(long, env = "PT_RECHECK_SECS", default_value_t = 30)]
    pub recheck_secs: u64,

    /// Remove failed tasks instead of keeping them with their failure.
    #[arg(long, env = "PT_REMOVE_FAILED")]
    pub remove_failed: bool,

    #[arg(long, env = "PT_HTTP_TIMEOUT_MS", default_value_t = 2000)]
    pub http_timeout_ms: u64,

    /// `tracing_subscriber::EnvFilter` directives.
    #[arg(long, env = "PT_LOG", default_value = "info")]
    pub log_filter: String,
}

impl NodeConfig {
    pub fn http_addr(&self) -> anyhow::Result<SocketAddr> {
        let port = self
            .bind
            .port()
            .checked_add(self.http_port_offset)
            .ok_or_else(|| anyhow::anyhow!("HTTP port overflows for bind {}", self.bind))?;
        Ok(SocketAddr::new(self.bind.ip(), port))
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    pub fn coordinator_settings(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            completion_policy: if self.remove_failed {
                CompletionPolicy::RemoveFailed
            } else {
                CompletionPolicy::RetainFailed
            },
            recheck_interval: Duration::from_secs(self.recheck_secs.max(1)),
        }
    }
}
