use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::AgentError;
use crate::id_types::RoomId;
use crate::protocol::ExistingPeer;

/// `self_description` used by automated participants.
pub const AGENT_DESCRIPTION: &str = "Agent";

const INVITE_TIMEOUT: Duration = Duration::from_secs(10);

pub fn has_agent(peers: &[ExistingPeer]) -> bool {
    peers.iter().any(|p| p.self_description == AGENT_DESCRIPTION)
}

#[derive(Serialize)]
struct InviteRequest<'a> {
    context_id: &'a RoomId,
}

/// Wakes an agent for a room through the agent server's HTTP API.
pub struct AgentInviter {
    client: reqwest::Client,
    endpoint: String,
}

impl AgentInviter {
    pub fn new(base_url: &str) -> Result<Self, AgentError> {
        let client = reqwest::Client::builder().timeout(INVITE_TIMEOUT).build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/invite-agent", base_url.trim_end_matches('/')),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// `POST {base}/invite-agent` with `{"context_id": room_id}`.
    pub async fn invite(&self, room_id: &RoomId) -> Result<(), AgentError> {
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&InviteRequest {
                context_id: room_id,
            })
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(AgentError::Status(status.as_u16()));
        }
        info!(room_id = %room_id, "Agent invited");
        Ok(())
    }

    /// Invites in the background unless an agent is already in the room.
    /// Failures are logged and not retried.
    pub fn invite_if_absent(
        self: &Arc<Self>,
        room_id: RoomId,
        existing: &[ExistingPeer],
    ) -> Option<JoinHandle<()>> {
        if has_agent(existing) {
            debug!(room_id = %room_id, "Agent already present, not inviting");
            return None;
        }

        let this = Arc::clone(self);
        Some(tokio::spawn(async move {
            if let Err(e) = this.invite(&room_id).await {
                warn!(room_id = %room_id, error = %e, "Failed to invite agent");
            }
        }))
    }
}
