//! In-process host for remote uplinks.
//!
//! [`SpaceHost`] answers the uplink protocol for every space in a [`Loom`].
//! Sessions are attached to a space's primary branch at handshake time and
//! receive that space's primary changes as [`BroadcastEvent`]s. Non-primary
//! changes never reach a session: the forwarder subscribes as an external
//! subscriber.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use loom_client::{ConnectionError, RemoteHost};
use loom_kernel::{Loom, LoomError, Space, Subscription};
use loom_types::{
    ActionRequest, ActionResponse, ActionStatus, BranchId, BroadcastEvent, ConnectRequest, ConnectResponse,
    ConnectionParams, ConnectionType, EventId, EventKind, HistoryRequest, HistoryResponse, NewEvent, PrincipalId,
    RejectReason, SessionId, SpaceId,
};

/// Default cap on one history page.
pub const DEFAULT_MAX_PAGE_SIZE: u32 = 512;

/// What a principal is allowed to connect with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Grant {
    pub token: String,
    /// Shared secret the credential signature is keyed with.
    pub secret: String,
    /// Highest connection type the principal may request.
    pub max_access: ConnectionType,
}

impl Grant {
    pub fn new(token: impl Into<String>, secret: impl Into<String>, max_access: ConnectionType) -> Self {
        Self { token: token.into(), secret: secret.into(), max_access }
    }

    fn permits(&self, requested: ConnectionType) -> bool {
        match requested {
            ConnectionType::Observer => true,
            ConnectionType::Participant => self.max_access == ConnectionType::Participant,
        }
    }
}

struct HostSession {
    space_id: SpaceId,
    principal: PrincipalId,
    connection_type: ConnectionType,
    branch_id: BranchId,
    broadcasts: Mutex<Option<mpsc::UnboundedReceiver<BroadcastEvent>>>,
    forwarder: JoinHandle<()>,
}

pub struct SpaceHost {
    loom: Arc<Loom>,
    grants: DashMap<PrincipalId, Grant>,
    sessions: DashMap<SessionId, HostSession>,
    max_page_size: u32,
}

impl std::fmt::Debug for SpaceHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpaceHost")
            .field("grants", &self.grants.len())
            .field("sessions", &self.sessions.len())
            .field("max_page_size", &self.max_page_size)
            .finish_non_exhaustive()
    }
}

impl SpaceHost {
    pub fn new(loom: Arc<Loom>) -> Self {
        Self {
            loom,
            grants: DashMap::new(),
            sessions: DashMap::new(),
            max_page_size: DEFAULT_MAX_PAGE_SIZE,
        }
    }

    pub fn with_max_page_size(mut self, max: u32) -> Self {
        self.max_page_size = max.max(1);
        self
    }

    pub fn loom(&self) -> &Arc<Loom> {
        &self.loom
    }

    /// Allow `principal` to connect. Replaces any earlier grant.
    pub fn grant(&self, principal: PrincipalId, grant: Grant) {
        self.grants.insert(principal, grant);
    }

    /// Withdraw a grant. Live sessions are not cut off.
    pub fn revoke(&self, principal: PrincipalId) -> bool {
        self.grants.remove(&principal).is_some()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn authorize(&self, request: &ConnectRequest) -> Result<(), RejectReason> {
        let credentials = &request.agent_credentials;
        let grant = self
            .grants
            .get(&credentials.principal_id)
            .ok_or(RejectReason::InvalidToken)?;
        if grant.token != credentials.token {
            return Err(RejectReason::InvalidToken);
        }
        if !credentials.verify(&grant.secret) {
            return Err(RejectReason::InvalidSignature);
        }
        if !grant.permits(request.connection_type) {
            return Err(RejectReason::InsufficientPermissions);
        }
        Ok(())
    }

    fn session_space(&self, session: SessionId, space: SpaceId) -> Result<Arc<Space>, ConnectionError> {
        match self.sessions.get(&session) {
            Some(s) if s.space_id == space => {}
            _ => return Err(RejectReason::UnknownSession.into()),
        }
        self.loom.space(space).map_err(rejection)
    }
}

/// Kernel failures go back to the caller as a rejection with the stable
/// code when there is one.
fn rejection(err: LoomError) -> ConnectionError {
    match err {
        LoomError::UnknownSpace(_) => RejectReason::UnknownSpace.into(),
        other => ConnectionError::Rejected(reason_for(&other)),
    }
}

fn reason_for(err: &LoomError) -> String {
    err.code().map(str::to_ascii_lowercase).unwrap_or_else(|| err.to_string())
}

fn action_rejected(reason: impl Into<String>) -> ActionResponse {
    ActionResponse { status: ActionStatus::Rejected, result_id: None, timestamp: None, reason: Some(reason.into()) }
}

/// Push each primary event of `space` to `tx` once. A merge publishes one
/// change per touched object plus the branch change, all with the same
/// event id, so consecutive repeats are dropped.
async fn forward(mut changes: Subscription, space: Arc<Space>, tx: mpsc::UnboundedSender<BroadcastEvent>) {
    let mut last: Option<EventId> = None;
    while let Some(change) = changes.recv().await {
        let Some(id) = change.event_id else { continue };
        if last == Some(id) {
            continue;
        }
        last = Some(id);
        let Some(event) = space.log().get(id) else {
            warn!(space = %space.id(), event = %id, "broadcast for an event missing from the log");
            continue;
        };
        let broadcast = BroadcastEvent { space_id: space.id(), event: (*event).clone() };
        if tx.send(broadcast).is_err() {
            break;
        }
    }
}

#[async_trait]
impl RemoteHost for SpaceHost {
    #[instrument(skip(self, request), name = "loom.host.connect", fields(space = %request.target_space_id, principal = %request.agent_credentials.principal_id))]
    async fn connect(&self, request: ConnectRequest) -> Result<ConnectResponse, ConnectionError> {
        if let Err(reason) = self.authorize(&request) {
            warn!(%reason, "connect rejected");
            return Ok(ConnectResponse::rejected(reason));
        }
        let Ok(space) = self.loom.space(request.target_space_id) else {
            return Ok(ConnectResponse::rejected(RejectReason::UnknownSpace));
        };

        // Subscribe before reading the head so nothing after it is missed.
        let changes = space.hub().subscribe_external(">");
        let Some(summary) = space.summary() else {
            return Ok(ConnectResponse::rejected(RejectReason::UnknownSpace));
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let forwarder = tokio::spawn(forward(changes, space.clone(), tx));
        let session_id = SessionId::new();
        self.sessions.insert(
            session_id,
            HostSession {
                space_id: space.id(),
                principal: request.agent_credentials.principal_id,
                connection_type: request.connection_type,
                branch_id: summary.primary_branch_id,
                broadcasts: Mutex::new(Some(rx)),
                forwarder,
            },
        );

        let params = ConnectionParams {
            session_id,
            connection_type: request.connection_type,
            branch_id: summary.primary_branch_id,
            head_event_id: summary.head_event_id,
            max_page_size: self.max_page_size,
        };
        info!(session = %session_id, connection_type = %request.connection_type, head = %summary.head_event_id, "session opened");
        Ok(ConnectResponse::accepted(params, summary))
    }

    async fn history(&self, request: HistoryRequest) -> Result<HistoryResponse, ConnectionError> {
        let space = self.session_space(request.session_id, request.space_id)?;
        let attached = self
            .sessions
            .get(&request.session_id)
            .map(|s| s.branch_id)
            .ok_or(ConnectionError::from(RejectReason::UnknownSession))?;
        // Only the session's branch leaves the host, and only while it is primary.
        let branch = request.branch_id.unwrap_or(attached);
        if branch != attached {
            return Err(ConnectionError::Rejected("branch_not_attached".into()));
        }
        if !space.branches().get(branch).is_some_and(|b| b.is_primary) {
            return Err(ConnectionError::Rejected("branch_not_primary".into()));
        }
        let after = request
            .start_from
            .as_deref()
            .map(EventId::parse)
            .transpose()
            .map_err(|_| ConnectionError::Rejected("invalid_continuation_token".into()))?;
        let limit = request.max_events.clamp(1, self.max_page_size) as usize;

        let (page, has_more) = space.history(branch, after, limit).map_err(rejection)?;

        let mut object_states = BTreeMap::new();
        for object in page.iter().filter_map(|e| e.object_id.as_ref()) {
            if object_states.contains_key(object) {
                continue;
            }
            let state = space.projector().state_of(space.log(), object, branch).map_err(rejection)?;
            object_states.insert(object.clone(), state);
        }
        let continuation_token = page.last().filter(|_| has_more).map(|e| e.id.to_string());
        debug!(space = %request.space_id, %branch, events = page.len(), has_more, "history page");

        Ok(HistoryResponse {
            events: page.iter().map(|e| (**e).clone()).collect(),
            object_states,
            has_more,
            continuation_token,
        })
    }

    async fn action(&self, request: ActionRequest) -> Result<ActionResponse, ConnectionError> {
        let space = self.session_space(request.session_id, request.space_id)?;
        let (principal, connection_type, branch) = self
            .sessions
            .get(&request.session_id)
            .map(|s| (s.principal, s.connection_type, s.branch_id))
            .ok_or(ConnectionError::from(RejectReason::UnknownSession))?;

        if connection_type == ConnectionType::Observer {
            return Ok(action_rejected(RejectReason::InsufficientPermissions.to_string()));
        }
        let kind = EventKind::parse(&request.action_type);
        if kind.is_structural() {
            return Ok(action_rejected("invalid_action"));
        }

        let ctx = match space.context_for(branch) {
            Ok(ctx) => ctx,
            Err(e) => return Ok(action_rejected(reason_for(&e))),
        };
        let mut candidate = NewEvent::new(kind, request.action_data).by(principal);
        if let Some(object) = request.object_id {
            candidate = candidate.on_object(object);
        }
        match space.submit(candidate, &ctx) {
            Ok(submission) => Ok(ActionResponse {
                status: ActionStatus::Accepted,
                result_id: Some(submission.event_id),
                timestamp: space.log().get(submission.event_id).map(|e| e.timestamp),
                reason: None,
            }),
            Err(e) => {
                debug!(session = %request.session_id, error = %e, "action rejected");
                Ok(action_rejected(reason_for(&e)))
            }
        }
    }

    async fn broadcasts(
        &self,
        space_id: SpaceId,
        session_id: SessionId,
    ) -> Result<mpsc::UnboundedReceiver<BroadcastEvent>, ConnectionError> {
        let session = self
            .sessions
            .get(&session_id)
            .filter(|s| s.space_id == space_id)
            .ok_or(ConnectionError::from(RejectReason::UnknownSession))?;
        let taken = session.broadcasts.lock().take();
        taken.ok_or_else(|| ConnectionError::Rejected("broadcasts_taken".into()))
    }

    async fn disconnect(&self, space_id: SpaceId, session_id: SessionId) -> Result<(), ConnectionError> {
        let removed = self.sessions.remove_if(&session_id, |_, s| s.space_id == space_id);
        if let Some((_, session)) = removed {
            session.forwarder.abort();
            info!(space = %space_id, session = %session_id, "session closed");
        }
        Ok(())
    }
}

impl Drop for SpaceHost {
    fn drop(&mut self) {
        for session in self.sessions.iter() {
            session.forwarder.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loom_kernel::LoomConfig;
    use loom_types::AgentCredentials;
    use serde_json::json;

    const SECRET: &str = "hunter2";

    fn host() -> (SpaceHost, SpaceId, PrincipalId) {
        let loom = Arc::new(Loom::new(LoomConfig::default()));
        let (space, _) = loom.create_space(Some("remote".into()), PrincipalId::system()).unwrap();
        let host = SpaceHost::new(loom).with_max_page_size(4);
        let principal = PrincipalId::new();
        host.grant(principal, Grant::new("tok", SECRET, ConnectionType::Participant));
        (host, space.id(), principal)
    }

    fn connect_request(principal: PrincipalId, space: SpaceId, token: &str, secret: &str) -> ConnectRequest {
        ConnectRequest {
            agent_credentials: AgentCredentials::sign(principal, token, secret),
            target_space_id: space,
            connection_type: ConnectionType::Participant,
        }
    }

    async fn session(host: &SpaceHost, space: SpaceId, principal: PrincipalId) -> ConnectionParams {
        let response = host.connect(connect_request(principal, space, "tok", SECRET)).await.unwrap();
        response.connection_params.unwrap()
    }

    #[tokio::test]
    async fn test_connect_rejections() {
        let (host, space, principal) = host();

        let bad_token = host.connect(connect_request(principal, space, "nope", SECRET)).await.unwrap();
        assert_eq!(bad_token.reason.as_deref(), Some("invalid_token"));

        let bad_sig = host.connect(connect_request(principal, space, "tok", "wrong")).await.unwrap();
        assert_eq!(bad_sig.reason.as_deref(), Some("invalid_signature"));

        let stranger = host.connect(connect_request(PrincipalId::new(), space, "tok", SECRET)).await.unwrap();
        assert_eq!(stranger.reason.as_deref(), Some("invalid_token"));

        let nowhere = host.connect(connect_request(principal, SpaceId::new(), "tok", SECRET)).await.unwrap();
        assert_eq!(nowhere.reason.as_deref(), Some("unknown_space"));

        let observer = PrincipalId::new();
        host.grant(observer, Grant::new("obs", SECRET, ConnectionType::Observer));
        let escalate = host.connect(connect_request(observer, space, "obs", SECRET)).await.unwrap();
        assert_eq!(escalate.reason.as_deref(), Some("insufficient_permissions"));
        assert_eq!(host.session_count(), 0);
    }

    #[tokio::test]
    async fn test_history_pages_and_clamps() {
        let (host, space_id, principal) = host();
        let params = session(&host, space_id, principal).await;
        let space = host.loom().space(space_id).unwrap();
        let mut ctx = space.context_for(params.branch_id).unwrap();
        for n in 0..6 {
            ctx = space.submit_event("doc:a".into(), json!({"n": n}), &ctx, principal).unwrap().updated_context;
        }

        let request = HistoryRequest {
            space_id,
            session_id: params.session_id,
            max_events: 100,
            start_from: Some(params.head_event_id.to_string()),
            branch_id: None,
        };
        let first = host.history(request.clone()).await.unwrap();
        assert_eq!(first.events.len(), 4);
        assert!(first.has_more);
        assert_eq!(first.object_states.len(), 1);

        let second = host
            .history(HistoryRequest { start_from: first.continuation_token.clone(), ..request })
            .await
            .unwrap();
        assert_eq!(second.events.len(), 2);
        assert!(!second.has_more);
        assert_eq!(second.continuation_token, None);
        assert_eq!(second.events.last().map(|e| e.id), Some(ctx.last_event_id));
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let (host, space, _) = host();
        let request = HistoryRequest {
            space_id: space,
            session_id: SessionId::new(),
            max_events: 10,
            start_from: None,
            branch_id: None,
        };
        let err = host.history(request).await.unwrap_err();
        assert_eq!(err, ConnectionError::Rejected("unknown_session".into()));
    }

    #[tokio::test]
    async fn test_actions_and_broadcasts() {
        let (host, space_id, principal) = host();
        let params = session(&host, space_id, principal).await;
        let mut rx = host.broadcasts(space_id, params.session_id).await.unwrap();
        assert!(host.broadcasts(space_id, params.session_id).await.is_err());

        let response = host
            .action(ActionRequest {
                space_id,
                action_type: "action".into(),
                action_data: json!({"text": "hi"}),
                session_id: params.session_id,
                object_id: Some("doc:a".into()),
            })
            .await
            .unwrap();
        assert_eq!(response.status, ActionStatus::Accepted);

        let pushed = rx.recv().await.unwrap();
        assert_eq!(Some(pushed.event.id), response.result_id);
        assert_eq!(pushed.event.author, principal);

        let structural = host
            .action(ActionRequest {
                space_id,
                action_type: "timeline_fork".into(),
                action_data: json!({}),
                session_id: params.session_id,
                object_id: None,
            })
            .await
            .unwrap();
        assert_eq!(structural.status, ActionStatus::Rejected);
        assert_eq!(structural.reason.as_deref(), Some("invalid_action"));

        host.disconnect(space_id, params.session_id).await.unwrap();
        assert_eq!(host.session_count(), 0);
    }

    #[tokio::test]
    async fn test_history_stays_on_the_primary() {
        let (host, space_id, principal) = host();
        let params = session(&host, space_id, principal).await;
        let space = host.loom().space(space_id).unwrap();
        let root = space.context_for(params.branch_id).unwrap();
        let fork = space.fork(&root, loom_kernel::ForkOptions::new(PrincipalId::system())).unwrap();
        space.submit_event("doc:a".into(), json!({"draft": true}), &fork, PrincipalId::system()).unwrap();

        let request = HistoryRequest {
            space_id,
            session_id: params.session_id,
            max_events: 10,
            start_from: None,
            branch_id: Some(fork.branch_id),
        };
        let err = host.history(request.clone()).await.unwrap_err();
        assert_eq!(err, ConnectionError::Rejected("branch_not_attached".into()));

        let own = host
            .history(HistoryRequest { branch_id: Some(params.branch_id), ..request.clone() })
            .await
            .unwrap();
        assert!(own.events.iter().all(|e| e.branch_id == params.branch_id));

        space.demote(params.branch_id).unwrap();
        let err = host.history(HistoryRequest { branch_id: None, ..request }).await.unwrap_err();
        assert_eq!(err, ConnectionError::Rejected("branch_not_primary".into()));
    }

    #[tokio::test]
    async fn test_non_primary_changes_stay_home() {
        let (host, space_id, principal) = host();
        let params = session(&host, space_id, principal).await;
        let mut rx = host.broadcasts(space_id, params.session_id).await.unwrap();
        let space = host.loom().space(space_id).unwrap();

        let root = space.context_for(params.branch_id).unwrap();
        let fork = space.fork(&root, loom_kernel::ForkOptions::new(PrincipalId::system())).unwrap();
        space.submit_event("doc:a".into(), json!({"draft": true}), &fork, PrincipalId::system()).unwrap();
        let primary = space
            .submit_event("doc:a".into(), json!({"final": true}), &root, PrincipalId::system())
            .unwrap();

        let pushed = rx.recv().await.unwrap();
        assert_eq!(pushed.event.id, primary.event_id);
        assert!(rx.try_recv().is_err());
    }
}
