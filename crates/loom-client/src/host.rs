//! The remote side of an uplink.
//!
//! [`RemoteHost`] is the transport seam: an in-process host (as in
//! `loom-server`) implements it directly, a networked one would wrap a
//! connection. Every method maps to one message of the uplink protocol.

use async_trait::async_trait;
use tokio::sync::mpsc;

use loom_types::{
    ActionRequest, ActionResponse, BroadcastEvent, ConnectRequest, ConnectResponse, HistoryRequest,
    HistoryResponse, SessionId, SpaceId,
};

use crate::error::ConnectionError;

#[async_trait]
pub trait RemoteHost: Send + Sync {
    /// Handshake. A rejection is a normal response, not an error.
    async fn connect(&self, request: ConnectRequest) -> Result<ConnectResponse, ConnectionError>;

    /// One page of history.
    async fn history(&self, request: HistoryRequest) -> Result<HistoryResponse, ConnectionError>;

    async fn action(&self, request: ActionRequest) -> Result<ActionResponse, ConnectionError>;

    /// The session's broadcast stream. Events published after the handshake
    /// are buffered until this is called; it can be taken once.
    async fn broadcasts(
        &self,
        space_id: SpaceId,
        session_id: SessionId,
    ) -> Result<mpsc::UnboundedReceiver<BroadcastEvent>, ConnectionError>;

    /// End the session. Unknown sessions are ignored.
    async fn disconnect(&self, space_id: SpaceId, session_id: SessionId) -> Result<(), ConnectionError>;
}
