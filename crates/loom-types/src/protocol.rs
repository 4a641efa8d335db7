//! Uplink wire messages between a local uplink and a remote space host.
//!
//! These are plain serde types; the transport picks the encoding. Payloads
//! carry `serde_json::Value`, so the self-describing JSON encoding is the one
//! every transport must support.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::event::Event;
use crate::ids::{BranchId, EventId, ObjectId, PrincipalId, SessionId, SpaceId};
use crate::state::ObjectState;

/// What an agent presents when connecting.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentCredentials {
    pub principal_id: PrincipalId,
    /// Bearer token issued out of band.
    pub token: String,
    /// Proof of key possession. Opaque to the core.
    pub signature: String,
}

impl AgentCredentials {
    /// Credentials for `principal_id`, signed with the secret it shares with
    /// the host.
    pub fn sign(principal_id: PrincipalId, token: impl Into<String>, secret: &str) -> Self {
        let token = token.into();
        let signature = signature_for(principal_id, &token, secret);
        Self { principal_id, token, signature }
    }

    /// Whether the signature matches `secret`.
    pub fn verify(&self, secret: &str) -> bool {
        self.signature == signature_for(self.principal_id, &self.token, secret)
    }
}

fn signature_for(principal: PrincipalId, token: &str, secret: &str) -> String {
    let key = uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_OID, secret.as_bytes());
    uuid::Uuid::new_v5(&key, format!("{}:{token}", principal.to_hex()).as_bytes())
        .simple()
        .to_string()
}

/// Requested access level.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConnectionType {
    /// Read history and receive broadcasts.
    Observer,
    /// Observer plus `ActionRequest`.
    Participant,
}

/// Stable rejection reasons a host may send. Clients surface them verbatim.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RejectReason {
    InvalidSignature,
    InvalidToken,
    InsufficientPermissions,
    UnknownSpace,
    UnknownSession,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectRequest {
    pub agent_credentials: AgentCredentials,
    pub target_space_id: SpaceId,
    pub connection_type: ConnectionType,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConnectStatus {
    Accepted,
    Rejected,
}

/// Session parameters granted on accept.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionParams {
    pub session_id: SessionId,
    pub connection_type: ConnectionType,
    /// The remote branch this session is attached to (the space's primary).
    pub branch_id: BranchId,
    /// Remote head at accept time. Spans anchor here.
    pub head_event_id: EventId,
    /// Largest page a `HistoryRequest` will be answered with.
    pub max_page_size: u32,
}

/// Cheap overview of the remote space, sent with the accept.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceSummary {
    pub space_id: SpaceId,
    pub label: Option<String>,
    pub primary_branch_id: BranchId,
    pub head_event_id: EventId,
    pub branch_count: usize,
    pub event_count: usize,
    pub object_ids: Vec<ObjectId>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectResponse {
    pub status: ConnectStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_params: Option<ConnectionParams>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub space_summary: Option<SpaceSummary>,
}

impl ConnectResponse {
    pub fn accepted(params: ConnectionParams, summary: SpaceSummary) -> Self {
        Self {
            status: ConnectStatus::Accepted,
            reason: None,
            connection_params: Some(params),
            space_summary: Some(summary),
        }
    }

    pub fn rejected(reason: RejectReason) -> Self {
        Self {
            status: ConnectStatus::Rejected,
            reason: Some(reason.to_string()),
            connection_params: None,
            space_summary: None,
        }
    }
}

/// Page through a remote branch, oldest first.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRequest {
    pub space_id: SpaceId,
    pub session_id: SessionId,
    pub max_events: u32,
    /// Exclusive lower bound: return events after this one. `None` starts at
    /// the branch root. A `continuation_token` from a previous page is
    /// accepted here too.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_from: Option<String>,
    /// Branch to read. `None` reads the session's attached branch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_id: Option<BranchId>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub events: Vec<Event>,
    /// Current state of every object touched by `events`.
    pub object_states: BTreeMap<ObjectId, ObjectState>,
    pub has_more: bool,
    /// Feed back as `start_from` to fetch the next page.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continuation_token: Option<String>,
}

/// Submit an action into the remote space's attached branch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
    pub space_id: SpaceId,
    pub action_type: String,
    pub action_data: serde_json::Value,
    pub session_id: SessionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_id: Option<ObjectId>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ActionStatus {
    Accepted,
    Rejected,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionResponse {
    pub status: ActionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_id: Option<EventId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Pushed to every active session of a space when its primary branch grows.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BroadcastEvent {
    pub space_id: SpaceId,
    pub event: Event,
}
