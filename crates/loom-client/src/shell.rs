//! Per-session coordinator.
//!
//! A [`Shell`] owns everything one agent session needs: its current timeline
//! context, the changes it has not looked at yet, and what it is doing right
//! now. All of it lives in one [`ShellContext`] value that callers can
//! inspect; nothing is global.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use strum::Display;
use tracing::{debug, info};

use loom_compress::{CompressedAssembly, CompressionEngine, CompressionRequest, RenderOptions, RendererRegistry};
use loom_kernel::{ChangeDescriptor, ForkOptions, LoomError, Space, Submission, Subscription};
use loom_types::{ObjectId, PrincipalId, SpanId, TimelineContext, now_millis};

use crate::error::{ConnectionError, ShellError};
use crate::uplink::{Uplink, bundle_element};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ShellPhase {
    #[default]
    Idle,
    Submitting,
    Rendering,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ShellContext {
    pub phase: ShellPhase,
    /// Changes on the current branch not yet handed to the caller.
    pub pending: Vec<ChangeDescriptor>,
    pub timeline: TimelineContext,
}

pub struct Shell {
    space: Arc<Space>,
    principal: PrincipalId,
    uplink: Option<Arc<Uplink>>,
    renderers: RendererRegistry,
    engine: CompressionEngine,
    subscription: Subscription,
    context: ShellContext,
}

impl std::fmt::Debug for Shell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shell")
            .field("space", &self.space.id())
            .field("principal", &self.principal)
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

impl Shell {
    pub fn new(space: Arc<Space>, principal: PrincipalId, timeline: TimelineContext, engine: CompressionEngine) -> Self {
        let subscription = space.hub().subscribe_branch(">", timeline.branch_id);
        Self {
            space,
            principal,
            uplink: None,
            renderers: RendererRegistry::default(),
            engine,
            subscription,
            context: ShellContext { phase: ShellPhase::Idle, pending: Vec::new(), timeline },
        }
    }

    pub fn with_uplink(mut self, uplink: Arc<Uplink>) -> Self {
        self.uplink = Some(uplink);
        self
    }

    pub fn with_renderers(mut self, renderers: RendererRegistry) -> Self {
        self.renderers = renderers;
        self
    }

    pub fn context(&self) -> &ShellContext {
        &self.context
    }

    pub fn timeline(&self) -> TimelineContext {
        self.context.timeline
    }

    pub fn space(&self) -> &Arc<Space> {
        &self.space
    }

    fn collect(&mut self) {
        let fresh = self.subscription.drain();
        self.context.pending.extend(fresh.into_iter().map(Arc::unwrap_or_clone));
    }

    /// Take every change seen on the current branch since the last call.
    pub fn drain_notifications(&mut self) -> Vec<ChangeDescriptor> {
        self.collect();
        std::mem::take(&mut self.context.pending)
    }

    /// Submit an action on the current branch and advance the context.
    /// A lagging cursor fails with `STALE_PARENT`; call [`refresh`](Self::refresh)
    /// before trying again.
    pub fn submit(&mut self, object: ObjectId, payload: serde_json::Value) -> Result<Submission, ShellError> {
        self.context.phase = ShellPhase::Submitting;
        let result = self
            .space
            .submit_event(object, payload, &self.context.timeline, self.principal);
        self.context.phase = ShellPhase::Idle;
        let submission = result?;
        self.context.timeline = submission.updated_context;
        Ok(submission)
    }

    /// Move the cursor to the branch's current head.
    pub fn refresh(&mut self) -> Result<TimelineContext, ShellError> {
        let fresh = self.space.context_for(self.context.timeline.branch_id)?;
        self.context.timeline = fresh;
        Ok(fresh)
    }

    /// Fork at the current cursor and switch to the new branch.
    pub fn fork(&mut self, reason: &str) -> Result<TimelineContext, ShellError> {
        let child = self
            .space
            .fork(&self.context.timeline, ForkOptions::new(self.principal).reason(reason))?;
        self.switch_to(child)?;
        info!(branch = %child.branch_id, reason, "shell forked");
        Ok(child)
    }

    /// Make `ctx` current. Changes pending for the old branch are dropped.
    pub fn switch_to(&mut self, ctx: TimelineContext) -> Result<(), ShellError> {
        self.space.validator().validate(&ctx).map_err(LoomError::from)?;
        if ctx.branch_id != self.context.timeline.branch_id {
            self.subscription = self.space.hub().subscribe_branch(">", ctx.branch_id);
            self.context.pending.clear();
        }
        self.context.timeline = ctx;
        Ok(())
    }

    /// Render `objects` on the current branch plus the history of
    /// `remote_spans`, compressed to `request.budget`.
    pub async fn render(
        &mut self,
        objects: &[ObjectId],
        remote_spans: &[SpanId],
        request: &CompressionRequest,
    ) -> Result<CompressedAssembly, ShellError> {
        self.context.phase = ShellPhase::Rendering;
        let result = self.assemble(objects, remote_spans, request).await;
        self.context.phase = ShellPhase::Idle;
        result
    }

    async fn assemble(
        &self,
        objects: &[ObjectId],
        remote_spans: &[SpanId],
        request: &CompressionRequest,
    ) -> Result<CompressedAssembly, ShellError> {
        let mut elements = Vec::with_capacity(objects.len() + remote_spans.len());
        for object in objects {
            let state = self.space.read_state(object, &self.context.timeline, self.principal)?;
            let timestamp = state
                .last_event_id
                .and_then(|id| self.space.log().get(id))
                .map(|e| e.timestamp)
                .unwrap_or_else(now_millis);
            let options = RenderOptions { hint: request.hints.get(object.as_str()).cloned(), timestamp };
            elements.push(self.renderers.render(&state, &options));
        }

        if !remote_spans.is_empty() {
            let uplink = self.uplink.as_ref().ok_or(ShellError::NoUplink)?;
            for &span_id in remote_spans {
                let span = uplink.spans().get(span_id).ok_or(ConnectionError::UnknownSpan(span_id))?;
                let events = uplink.history_bundle(span_id).await?;
                debug!(span = %span_id, events = events.len(), "bundle fetched");
                elements.push(bundle_element(&span, &events));
            }
        }

        Ok(self.engine.compress(elements, request))
    }
}
