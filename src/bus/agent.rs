//! Typed node agent calls.
//!
//! Thin wrappers over [`MessageBus::request_with_retry`] that build the
//! command and check the reply shape, so callers never match on raw replies.
//! Agents apply every command idempotently, so a timed out call is resent.
//! Rebuild progress is polled and goes out once per poll.

use super::client::MessageBus;
use super::protocol::{Command, PoolReport, RebuildState, Reply};
use crate::domain::model::{Nexus, NexusId, NodeId, PoolId, Replica};
use crate::error::{Error, Result};

fn unexpected(node: &NodeId, command: &str, reply: Reply) -> Error {
    Error::Protocol(format!(
        "node {} answered {} with unexpected reply {:?}",
        node, command, reply
    ))
}

/// Treat NotFound as success for destroy-style commands.
fn absent_ok(result: Result<Reply>) -> Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e),
    }
}

impl MessageBus {
    pub async fn create_pool(
        &self,
        node: &NodeId,
        pool: &PoolId,
        disks: &[String],
    ) -> Result<PoolReport> {
        let command = Command::CreatePool {
            pool: pool.clone(),
            disks: disks.to_vec(),
        };
        match self.request_with_retry(node, command).await? {
            Reply::Pool(report) => Ok(report),
            other => Err(unexpected(node, "create_pool", other)),
        }
    }

    pub async fn destroy_pool(&self, node: &NodeId, pool: &PoolId) -> Result<()> {
        absent_ok(
            self.request_with_retry(node, Command::DestroyPool { pool: pool.clone() })
                .await,
        )
    }

    /// Create and share a replica, returning its NVMe-oF URI.
    pub async fn create_replica(&self, replica: &Replica) -> Result<String> {
        let command = Command::CreateReplica {
            replica: replica.id.clone(),
            pool: replica.pool.clone(),
            volume: replica.volume.clone(),
            size: replica.size,
        };
        match self.request_with_retry(&replica.node, command).await? {
            Reply::Replica { uri } => Ok(uri),
            other => Err(unexpected(&replica.node, "create_replica", other)),
        }
    }

    pub async fn destroy_replica(&self, replica: &Replica) -> Result<()> {
        absent_ok(
            self.request_with_retry(
                &replica.node,
                Command::DestroyReplica {
                    replica: replica.id.clone(),
                    pool: replica.pool.clone(),
                },
            )
            .await,
        )
    }

    pub async fn create_nexus(&self, nexus: &Nexus, children: Vec<String>) -> Result<()> {
        let command = Command::CreateNexus {
            nexus: nexus.id.clone(),
            volume: nexus.volume.clone(),
            size: nexus.size,
            children,
        };
        match self.request_with_retry(&nexus.node, command).await? {
            Reply::Nexus { .. } | Reply::Ack => Ok(()),
            other => Err(unexpected(&nexus.node, "create_nexus", other)),
        }
    }

    pub async fn destroy_nexus(&self, node: &NodeId, nexus: &NexusId) -> Result<()> {
        absent_ok(
            self.request_with_retry(
                node,
                Command::DestroyNexus {
                    nexus: nexus.clone(),
                },
            )
            .await,
        )
    }

    /// Export the nexus, returning the target URI.
    pub async fn share_nexus(&self, node: &NodeId, nexus: &NexusId) -> Result<String> {
        match self
            .request_with_retry(
                node,
                Command::ShareNexus {
                    nexus: nexus.clone(),
                },
            )
            .await?
        {
            Reply::Shared { uri } => Ok(uri),
            other => Err(unexpected(node, "share_nexus", other)),
        }
    }

    pub async fn unshare_nexus(&self, node: &NodeId, nexus: &NexusId) -> Result<()> {
        absent_ok(
            self.request_with_retry(
                node,
                Command::UnshareNexus {
                    nexus: nexus.clone(),
                },
            )
            .await,
        )
    }

    pub async fn add_nexus_child(&self, node: &NodeId, nexus: &NexusId, child: String) -> Result<()> {
        self.request_with_retry(
            node,
            Command::AddNexusChild {
                nexus: nexus.clone(),
                child,
            },
        )
        .await
        .map(|_| ())
    }

    pub async fn remove_nexus_child(
        &self,
        node: &NodeId,
        nexus: &NexusId,
        child: String,
    ) -> Result<()> {
        absent_ok(
            self.request_with_retry(
                node,
                Command::RemoveNexusChild {
                    nexus: nexus.clone(),
                    child,
                },
            )
            .await,
        )
    }

    pub async fn start_rebuild(&self, node: &NodeId, nexus: &NexusId, child: String) -> Result<RebuildState> {
        let command = Command::StartRebuild {
            nexus: nexus.clone(),
            child,
        };
        match self.request_with_retry(node, command).await? {
            Reply::Rebuild(state) => Ok(state),
            Reply::Ack => Ok(RebuildState::Running { percent: 0 }),
            other => Err(unexpected(node, "start_rebuild", other)),
        }
    }

    /// Single attempt; the caller polls again on its next pass.
    pub async fn rebuild_progress(
        &self,
        node: &NodeId,
        nexus: &NexusId,
        child: String,
    ) -> Result<RebuildState> {
        let command = Command::RebuildProgress {
            nexus: nexus.clone(),
            child,
        };
        match self.request(node, command).await? {
            Reply::Rebuild(state) => Ok(state),
            other => Err(unexpected(node, "rebuild_progress", other)),
        }
    }
}
