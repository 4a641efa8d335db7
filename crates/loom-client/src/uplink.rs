//! Outbound connections to remote spaces.
//!
//! ```text
//!   attach ──connect──▶ host            span opened at remote head
//!     │                   │
//!     │  ◀──broadcasts────┘             span head follows broadcasts
//!     │
//!   detach ──history (catch up)──▶      span closed at remote head
//!
//!   history_bundle(span) ──history pages──▶   start..=end, fetched on demand
//! ```
//!
//! Every request runs under `history_timeout_ms`. A timeout or transport
//! failure is returned as is; the uplink never retries on its own.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use loom_compress::{ConversationMessage, ElementKind, RenderElement};
use loom_kernel::UplinkConfig;
use loom_types::{
    ActionRequest, ActionResponse, ActionStatus, AgentCredentials, BranchId, BroadcastEvent, ConnectRequest,
    ConnectStatus, ConnectionSpan, ConnectionType, Event, EventId, HistoryRequest, HistoryResponse, ObjectId,
    SessionId, SpaceId, SpaceSummary, SpanId, now_millis,
};

use crate::error::ConnectionError;
use crate::host::RemoteHost;
use crate::spans::ConnectionSpanTracker;

/// A live session with one remote space.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attachment {
    pub space_id: SpaceId,
    pub session_id: SessionId,
    pub connection_type: ConnectionType,
    pub branch_id: BranchId,
    pub span_id: SpanId,
    pub summary: SpaceSummary,
}

struct Session {
    attachment: Attachment,
    broadcasts: mpsc::UnboundedReceiver<BroadcastEvent>,
}

pub struct Uplink {
    host: Arc<dyn RemoteHost>,
    credentials: AgentCredentials,
    config: UplinkConfig,
    spans: Arc<ConnectionSpanTracker>,
    sessions: Mutex<HashMap<SpaceId, Session>>,
}

impl std::fmt::Debug for Uplink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Uplink")
            .field("principal", &self.credentials.principal_id)
            .field("attached", &self.attached())
            .field("spans", &self.spans.len())
            .finish_non_exhaustive()
    }
}

impl Uplink {
    pub fn new(host: Arc<dyn RemoteHost>, credentials: AgentCredentials, config: UplinkConfig) -> Self {
        Self::with_tracker(host, credentials, config, Arc::new(ConnectionSpanTracker::new()))
    }

    /// Share a tracker, e.g. one restored from saved spans.
    pub fn with_tracker(
        host: Arc<dyn RemoteHost>,
        credentials: AgentCredentials,
        config: UplinkConfig,
        spans: Arc<ConnectionSpanTracker>,
    ) -> Self {
        Self { host, credentials, config, spans, sessions: Mutex::new(HashMap::new()) }
    }

    pub fn spans(&self) -> &Arc<ConnectionSpanTracker> {
        &self.spans
    }

    pub fn attachment(&self, space: SpaceId) -> Option<Attachment> {
        self.sessions.lock().get(&space).map(|s| s.attachment.clone())
    }

    pub fn attached(&self) -> Vec<SpaceId> {
        self.sessions.lock().keys().copied().collect()
    }

    async fn deadline<T>(&self, request: impl Future<Output = Result<T, ConnectionError>>) -> Result<T, ConnectionError> {
        let ms = self.config.history_timeout_ms;
        tokio::time::timeout(Duration::from_millis(ms), request)
            .await
            .map_err(|_| ConnectionError::Timeout(ms))?
    }

    async fn handshake(
        &self,
        space: SpaceId,
        connection_type: ConnectionType,
    ) -> Result<(loom_types::ConnectionParams, SpaceSummary), ConnectionError> {
        let request = ConnectRequest {
            agent_credentials: self.credentials.clone(),
            target_space_id: space,
            connection_type,
        };
        let response = self.deadline(self.host.connect(request)).await?;
        match response.status {
            ConnectStatus::Rejected => {
                let reason = response.reason.unwrap_or_else(|| "rejected".to_string());
                warn!(%space, %reason, "connection rejected");
                Err(ConnectionError::from_reason(&reason))
            }
            ConnectStatus::Accepted => match (response.connection_params, response.space_summary) {
                (Some(params), Some(summary)) => Ok((params, summary)),
                _ => Err(ConnectionError::Transport("accepted without connection parameters".into())),
            },
        }
    }

    /// Connect to `space` and open a span at its current primary head.
    /// Attaching to an already attached space returns the live attachment.
    #[instrument(skip(self), name = "loom.attach", fields(space = %space))]
    pub async fn attach(&self, space: SpaceId, connection_type: ConnectionType) -> Result<Attachment, ConnectionError> {
        if let Some(existing) = self.attachment(space) {
            return Ok(existing);
        }
        let (params, summary) = self.handshake(space, connection_type).await?;
        let broadcasts = self.deadline(self.host.broadcasts(space, params.session_id)).await?;

        let raced = {
            let mut sessions = self.sessions.lock();
            match sessions.get(&space) {
                Some(existing) => Some(existing.attachment.clone()),
                None => {
                    let span = self.spans.open(space, params.branch_id, params.head_event_id, now_millis());
                    let attachment = Attachment {
                        space_id: space,
                        session_id: params.session_id,
                        connection_type: params.connection_type,
                        branch_id: params.branch_id,
                        span_id: span.id,
                        summary,
                    };
                    sessions.insert(space, Session { attachment, broadcasts });
                    None
                }
            }
        };
        if let Some(existing) = raced {
            self.release(space, params.session_id).await;
            return Ok(existing);
        }

        info!(%space, session = %params.session_id, head = %params.head_event_id, "attached");
        self.attachment(space).ok_or(ConnectionError::NotConnected(space))
    }

    async fn release(&self, space: SpaceId, session: SessionId) {
        if let Err(e) = self.deadline(self.host.disconnect(space, session)).await {
            warn!(%space, %session, error = %e, "disconnect failed");
        }
    }

    /// Drain broadcasts received for `space`, moving its span head along.
    pub fn poll_broadcasts(&self, space: SpaceId) -> Result<Vec<BroadcastEvent>, ConnectionError> {
        let received = {
            let mut sessions = self.sessions.lock();
            let session = sessions.get_mut(&space).ok_or(ConnectionError::NotConnected(space))?;
            let mut received = Vec::new();
            while let Ok(event) = session.broadcasts.try_recv() {
                received.push(event);
            }
            received
        };
        for event in &received {
            self.spans.observe(event);
        }
        Ok(received)
    }

    /// Submit an action to the attached space.
    pub async fn act(
        &self,
        space: SpaceId,
        action_type: &str,
        action_data: serde_json::Value,
        object: Option<ObjectId>,
    ) -> Result<ActionResponse, ConnectionError> {
        let attachment = self.attachment(space).ok_or(ConnectionError::NotConnected(space))?;
        let request = ActionRequest {
            space_id: space,
            action_type: action_type.to_string(),
            action_data,
            session_id: attachment.session_id,
            object_id: object,
        };
        let response = self.deadline(self.host.action(request)).await?;
        match response.status {
            ActionStatus::Accepted => Ok(response),
            ActionStatus::Rejected => Err(ConnectionError::from_reason(response.reason.as_deref().unwrap_or("rejected"))),
        }
    }

    /// Close the span at the remote head as of now and end the session.
    ///
    /// Broadcasts may lag, so the head is confirmed by paging history
    /// forward from the last one seen. If that fails the session stays
    /// attached and the call can be repeated.
    #[instrument(skip(self), name = "loom.detach", fields(space = %space))]
    pub async fn detach(&self, space: SpaceId) -> Result<ConnectionSpan, ConnectionError> {
        self.poll_broadcasts(space)?;
        let attachment = self.attachment(space).ok_or(ConnectionError::NotConnected(space))?;
        let span_id = attachment.span_id;

        let mut head = self.spans.remote_head(span_id).ok_or(ConnectionError::UnknownSpan(span_id))?;
        loop {
            let page = self.page(space, attachment.session_id, attachment.branch_id, head).await?;
            if let Some(last) = page.events.last() {
                head = last.id;
            }
            if !page.has_more || page.events.is_empty() {
                break;
            }
        }
        self.spans.advance(span_id, head)?;
        let span = self.spans.close(span_id, now_millis())?;

        self.sessions.lock().remove(&space);
        self.release(space, attachment.session_id).await;
        info!(%space, span = %span_id, end = %head, "detached");
        Ok(span)
    }

    async fn page(
        &self,
        space: SpaceId,
        session: SessionId,
        branch: BranchId,
        after: EventId,
    ) -> Result<HistoryResponse, ConnectionError> {
        let request = HistoryRequest {
            space_id: space,
            session_id: session,
            max_events: self.config.history_page_size,
            start_from: Some(after.to_string()),
            branch_id: Some(branch),
        };
        self.deadline(self.host.history(request)).await
    }

    /// The remote events a span covers, oldest first: everything after its
    /// start event up to and including its end event. Active spans run to the
    /// remote head at call time.
    ///
    /// Uses the live session when attached, otherwise a short observer
    /// session.
    #[instrument(skip(self), name = "loom.history_bundle", fields(span = %span_id))]
    pub async fn history_bundle(&self, span_id: SpanId) -> Result<Vec<Event>, ConnectionError> {
        let span = self.spans.get(span_id).ok_or(ConnectionError::UnknownSpan(span_id))?;
        if span.is_empty() {
            return Ok(Vec::new());
        }
        let space = span.remote_space_id;
        match self.attachment(space) {
            Some(attachment) => self.collect(&span, attachment.session_id).await,
            None => {
                let (params, _) = self.handshake(space, ConnectionType::Observer).await?;
                let bundle = self.collect(&span, params.session_id).await;
                self.release(space, params.session_id).await;
                bundle
            }
        }
    }

    async fn collect(&self, span: &ConnectionSpan, session: SessionId) -> Result<Vec<Event>, ConnectionError> {
        let end = span.end_event_id;
        let mut events = Vec::new();
        let mut cursor = span.start_event_id;
        loop {
            let page = self.page(span.remote_space_id, session, span.remote_branch_id, cursor).await?;
            let has_more = page.has_more && !page.events.is_empty();
            for event in page.events {
                let last = Some(event.id) == end;
                cursor = event.id;
                events.push(event);
                if last {
                    debug!(events = events.len(), "bundle complete");
                    return Ok(events);
                }
            }
            if !has_more {
                break;
            }
        }
        if let Some(end) = end {
            warn!(%end, events = events.len(), "span end not on remote branch; bundle is partial");
        }
        Ok(events)
    }
}

/// A span's history as a render element for the compression engine.
pub fn bundle_element(span: &ConnectionSpan, events: &[Event]) -> RenderElement {
    let messages: Vec<ConversationMessage> = events.iter().map(ConversationMessage::from_event).collect();
    let mut element = RenderElement::conversation(format!("span:{}", span.id.short()), ElementKind::RemoteBundle, messages)
        .backed_by(span.id, span.end_time);
    if let Some(end) = span.end_time {
        element.timestamp = element.timestamp.max(end);
    }
    element
}
