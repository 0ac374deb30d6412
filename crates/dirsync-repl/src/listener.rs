//! The single reader of a domain's broker.

use crate::broker::ReceiveOptions;
use crate::domain::ReplicationDomain;
use crate::error::BrokerError;
use crate::protocol::{AckMsg, ReplicationMsg, UpdateMsg};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Spawn the listener of `domain`. The task ends when the broker stops.
pub fn spawn_listener(domain: Arc<ReplicationDomain>) -> JoinHandle<()> {
    tokio::spawn(run_listener(domain))
}

/// Receive and dispatch messages until the broker stops.
///
/// Updates are replayed, credited back to the relay and acknowledged when
/// assured. Acknowledgments wake the publisher waiting for them.
pub async fn run_listener(domain: Arc<ReplicationDomain>) {
    let broker = domain.broker().clone();
    let server_id = domain.server_id();
    info!(server_id, "replication listener started");
    loop {
        let options = ReceiveOptions::from_config(&broker.config());
        match broker.receive(options).await {
            Ok(Some(ReplicationMsg::Update(update))) => {
                let applied = domain.process_update(&update);
                broker.update_window_after_replay().await;
                if update.assured {
                    acknowledge(&domain, &update, applied).await;
                }
            }
            Ok(Some(ReplicationMsg::Ack(ack))) => domain.on_ack(ack),
            Ok(Some(other)) => {
                debug!(server_id, kind = ?other.message_type(), "message ignored");
            }
            Ok(None) => break,
            Err(BrokerError::Timeout) => continue,
            Err(e) if e.is_retryable() => {
                debug!(server_id, error = %e, "receive failed");
            }
            Err(_) => break,
        }
    }
    info!(server_id, "replication listener stopped");
}

async fn acknowledge(domain: &ReplicationDomain, update: &UpdateMsg, applied: bool) {
    let mut ack = AckMsg::ok(update.clock);
    if !applied {
        ack.has_replay_error = true;
        ack.failed_servers.push(domain.server_id());
    }
    if let Err(e) = domain
        .broker()
        .publish_control(&ReplicationMsg::Ack(ack))
        .await
    {
        debug!(clock = %update.clock, error = %e, "acknowledgment not sent");
    }
}
