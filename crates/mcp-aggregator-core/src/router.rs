//! The aggregating protocol router: translates each inbound MCP request into
//! zero-or-more upstream requests, merges results, and propagates
//! notifications in both directions while honoring the inbound session's
//! filter.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use rmcp::model::{
    CallToolRequestParam, CallToolResult, Content, ErrorCode, ErrorData, GetPromptRequestParam,
    GetPromptResult, Implementation, InitializeResult, ListPromptsResult,
    ListResourceTemplatesResult, ListResourcesResult, ListToolsResult, PaginatedRequestParam,
    ProtocolVersion, ReadResourceRequestParam, ReadResourceResult, ServerCapabilities,
    SubscribeRequestParam, UnsubscribeRequestParam,
};
use rmcp::service::Peer;
use rmcp::RoleServer;

use crate::aggregator::{denamespace, denamespace_resource_uri, AggregateNamespace};
use crate::errors::RouterError;
use crate::logging;
use crate::notify_bus::NotifyBus;
use crate::session::InboundSession;
use crate::upstream::{LoadingState, UpstreamManager};

pub const PROXY_NAME: &str = "mcp-aggregator";

/// Per-request deadline overhead subtracted before forwarding to upstreams,
/// leaving slack for the response to travel back.
const DEADLINE_OVERHEAD: Duration = Duration::from_millis(250);

#[derive(Clone)]
pub struct Router {
    pub upstreams: UpstreamManager,
    pub bus: NotifyBus,
    pub coalesce_window: Duration,
}

/// Per-upstream outcome attached to a fan-out call's response metadata so a
/// partial failure never fails the whole aggregated call.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PartialFailure {
    pub upstream: String,
    pub error: String,
}

impl Router {
    pub fn new(upstreams: UpstreamManager, bus: NotifyBus) -> Self {
        Self {
            upstreams,
            bus,
            coalesce_window: Duration::from_secs(2),
        }
    }

    /// Overrides the default 2s `tools/list_changed` coalescing window (see
    /// `--coalesce-window-ms` / `ONE_MCP_COALESCE_WINDOW_MS`).
    pub fn with_coalesce_window(mut self, window: Duration) -> Self {
        self.coalesce_window = window;
        self
    }

    pub fn initialize_result(&self) -> InitializeResult {
        InitializeResult {
            protocol_version: ProtocolVersion::LATEST,
            capabilities: ServerCapabilities::builder()
                .enable_tools()
                .enable_tool_list_changed()
                .enable_resources()
                .enable_resource_subscribe()
                .enable_prompts()
                .enable_prompt_list_changed()
                .enable_logging()
                .build(),
            server_info: Implementation {
                name: PROXY_NAME.to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            instructions: None,
        }
    }

    async fn admitted_ready(
        &self,
        session: &InboundSession,
    ) -> BTreeMap<String, Arc<crate::upstream::ReadyClient>> {
        let ready = self.upstreams.ready_clients().await;
        let statuses: std::collections::HashMap<String, Vec<String>> = self
            .upstreams
            .statuses()
            .await
            .into_iter()
            .map(|s| (s.name, s.tags))
            .collect();
        ready
            .into_iter()
            .filter(|(name, _)| {
                statuses
                    .get(name)
                    .map(|tags| session.admits(tags))
                    .unwrap_or(false)
            })
            .collect()
    }

    pub async fn list_tools(
        &self,
        session: &InboundSession,
        params: Option<PaginatedRequestParam>,
    ) -> ListToolsResult {
        let admitted = self.admitted_ready(session).await;
        let all = AggregateNamespace::list_tools(&admitted).await;
        if session.enable_pagination {
            let cursor = params.as_ref().and_then(|p| p.cursor.as_deref());
            let (page, next_cursor) = AggregateNamespace::paginate_tools(&all, cursor, 100);
            ListToolsResult {
                tools: page,
                next_cursor,
            }
        } else {
            ListToolsResult {
                tools: all,
                next_cursor: None,
            }
        }
    }

    pub async fn list_resources(
        &self,
        session: &InboundSession,
        params: Option<PaginatedRequestParam>,
    ) -> ListResourcesResult {
        let admitted = self.admitted_ready(session).await;
        let all = AggregateNamespace::list_resources(&admitted).await;
        if session.enable_pagination {
            let cursor = params.as_ref().and_then(|p| p.cursor.as_deref());
            let (page, next_cursor) = AggregateNamespace::paginate_resources(&all, cursor, 100);
            ListResourcesResult {
                resources: page,
                next_cursor,
            }
        } else {
            ListResourcesResult {
                resources: all,
                next_cursor: None,
            }
        }
    }

    pub async fn list_resource_templates(
        &self,
        session: &InboundSession,
        params: Option<PaginatedRequestParam>,
    ) -> ListResourceTemplatesResult {
        let admitted = self.admitted_ready(session).await;
        let all = AggregateNamespace::list_resource_templates(&admitted).await;
        if session.enable_pagination {
            let cursor = params.as_ref().and_then(|p| p.cursor.as_deref());
            let (page, next_cursor) =
                AggregateNamespace::paginate_resource_templates(&all, cursor, 100);
            ListResourceTemplatesResult {
                resource_templates: page,
                next_cursor,
            }
        } else {
            ListResourceTemplatesResult {
                resource_templates: all,
                next_cursor: None,
            }
        }
    }

    pub async fn list_prompts(
        &self,
        session: &InboundSession,
        params: Option<PaginatedRequestParam>,
    ) -> ListPromptsResult {
        let admitted = self.admitted_ready(session).await;
        let all = AggregateNamespace::list_prompts(&admitted).await;
        if session.enable_pagination {
            let cursor = params.as_ref().and_then(|p| p.cursor.as_deref());
            let (page, next_cursor) = AggregateNamespace::paginate_prompts(&all, cursor, 100);
            ListPromptsResult {
                prompts: page,
                next_cursor,
            }
        } else {
            ListPromptsResult {
                prompts: all,
                next_cursor: None,
            }
        }
    }

    pub async fn call_tool(
        &self,
        session: &InboundSession,
        params: CallToolRequestParam,
        deadline: Duration,
    ) -> Result<CallToolResult, ErrorData> {
        let (upstream, original) = denamespace(&params.name).map_err(to_error_data)?;
        self.bus.record_touch(&upstream, &session.session_id).await;
        let client = self
            .ready_and_admitted(session, &upstream)
            .await
            .ok_or_else(|| {
                to_error_data(RouterError::InvalidParams(format!(
                    "upstream `{upstream}` is not ready or not admitted"
                )))
            })?;
        let inner_params = CallToolRequestParam {
            name: original.clone().into(),
            arguments: params.arguments,
        };
        let mut event = logging::Event::new("tools/call", session.session_id.clone());
        event.upstream = Some(upstream.clone());
        let started = logging::now_millis();
        let fut = client.service.call_tool(inner_params);
        let outcome = tokio::time::timeout(deadline.saturating_sub(DEADLINE_OVERHEAD), fut).await;
        event.duration_ms = Some(logging::now_millis() - started);
        let result = match outcome {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => {
                event.ok = false;
                event.error = Some(e.to_string());
                Ok(CallToolResult {
                    content: vec![Content::text(e.to_string())],
                    is_error: Some(true),
                    structured_content: None,
                    meta: None,
                })
            }
            Err(_) => {
                event.ok = false;
                event.error = Some("deadline exceeded".to_string());
                Err(ErrorData::new(
                    ErrorCode::REQUEST_TIMEOUT,
                    "request cancelled: upstream deadline exceeded".to_string(),
                    None,
                ))
            }
        };
        event.emit();
        result
    }

    pub async fn get_prompt(
        &self,
        session: &InboundSession,
        params: GetPromptRequestParam,
    ) -> Result<GetPromptResult, ErrorData> {
        let (upstream, original) = denamespace(&params.name).map_err(to_error_data)?;
        self.bus.record_touch(&upstream, &session.session_id).await;
        let client = self
            .ready_and_admitted(session, &upstream)
            .await
            .ok_or_else(|| {
                to_error_data(RouterError::InvalidParams(format!(
                    "upstream `{upstream}` is not ready or not admitted"
                )))
            })?;
        client
            .service
            .get_prompt(GetPromptRequestParam {
                name: original.into(),
                arguments: params.arguments,
            })
            .await
            .map_err(|e| ErrorData::new(ErrorCode::INTERNAL_ERROR, e.to_string(), None))
    }

    pub async fn read_resource(
        &self,
        session: &InboundSession,
        params: ReadResourceRequestParam,
    ) -> Result<ReadResourceResult, ErrorData> {
        let (upstream, original_uri) =
            denamespace_resource_uri(&params.uri).map_err(to_error_data)?;
        self.bus.record_touch(&upstream, &session.session_id).await;
        let client = self
            .ready_and_admitted(session, &upstream)
            .await
            .ok_or_else(|| {
                to_error_data(RouterError::InvalidParams(format!(
                    "upstream `{upstream}` is not ready or not admitted"
                )))
            })?;
        client
            .service
            .read_resource(ReadResourceRequestParam {
                uri: original_uri.into(),
            })
            .await
            .map_err(|e| ErrorData::new(ErrorCode::INTERNAL_ERROR, e.to_string(), None))
    }

    async fn ready_and_admitted(
        &self,
        session: &InboundSession,
        upstream: &str,
    ) -> Option<Arc<crate::upstream::ReadyClient>> {
        let admitted = self.admitted_ready(session).await;
        admitted.get(upstream).cloned()
    }

    /// Best-effort fan-out ping to every admitted Ready upstream. Failures
    /// are logged and never surfaced, per the "ping never fails" contract.
    pub async fn ping_all(&self, session: &InboundSession) {
        let admitted = self.admitted_ready(session).await;
        for (name, client) in admitted {
            let name = name.clone();
            let client = client.clone();
            tokio::spawn(async move {
                if let Err(e) =
                    tokio::time::timeout(Duration::from_secs(3), client.service.ping()).await
                {
                    tracing::debug!(target: "router", upstream = %name, error = %e, "ping timed out");
                }
            });
        }
    }

    /// Records this session's peer handle in the bus so upstream workers can
    /// reach it for reverse-direction requests and notification delivery.
    /// Cheap; called on every inbound request.
    pub async fn touch_session(&self, peer: Peer<RoleServer>, session: &InboundSession) {
        self.bus.register_peer(peer, session.clone()).await;
    }

    pub async fn session_disconnected(&self, session_id: &str) {
        self.bus.unregister_peer(session_id).await;
    }

    /// Routes `resources/subscribe` to the single upstream owning the
    /// resource URI.
    pub async fn subscribe_resource(
        &self,
        session: &InboundSession,
        params: SubscribeRequestParam,
    ) -> Result<(), ErrorData> {
        let (upstream, uri) = denamespace_resource_uri(&params.uri).map_err(to_error_data)?;
        self.bus.record_touch(&upstream, &session.session_id).await;
        let client = self
            .ready_and_admitted(session, &upstream)
            .await
            .ok_or_else(|| {
                to_error_data(RouterError::InvalidParams(format!(
                    "upstream `{upstream}` is not ready or not admitted"
                )))
            })?;
        client
            .service
            .subscribe(SubscribeRequestParam { uri })
            .await
            .map_err(|e| ErrorData::new(ErrorCode::INTERNAL_ERROR, e.to_string(), None))
    }

    /// Routes `resources/unsubscribe` to the single upstream owning the
    /// resource URI.
    pub async fn unsubscribe_resource(
        &self,
        session: &InboundSession,
        params: UnsubscribeRequestParam,
    ) -> Result<(), ErrorData> {
        let (upstream, uri) = denamespace_resource_uri(&params.uri).map_err(to_error_data)?;
        let client = self
            .ready_and_admitted(session, &upstream)
            .await
            .ok_or_else(|| {
                to_error_data(RouterError::InvalidParams(format!(
                    "upstream `{upstream}` is not ready or not admitted"
                )))
            })?;
        client
            .service
            .unsubscribe(UnsubscribeRequestParam { uri })
            .await
            .map_err(|e| ErrorData::new(ErrorCode::INTERNAL_ERROR, e.to_string(), None))
    }

    /// Forwards a client→upstream notification (`initialized`,
    /// `roots/list_changed`, `cancelled`, `progress`) to every upstream
    /// admitted by the session's filter, best-effort.
    pub async fn forward_client_notification(
        &self,
        session: &InboundSession,
        notification: rmcp::model::ClientNotification,
    ) {
        let admitted = self.admitted_ready(session).await;
        let session_id = session.session_id.clone();
        for (name, client) in admitted {
            let notification = notification.clone();
            let client = client.clone();
            let session_id = session_id.clone();
            tokio::spawn(async move {
                tracing::debug!(target: "router", upstream = %name, session_id = %session_id, "forwarding client notification");
                if let Err(e) = client.service.send_notification(notification).await {
                    tracing::debug!(
                        target: "router",
                        upstream = %name,
                        error = %e,
                        "failed to forward client notification to upstream"
                    );
                }
            });
        }
    }
}

fn to_error_data(e: RouterError) -> ErrorData {
    ErrorData::new(ErrorCode::INVALID_PARAMS, e.to_string(), None)
}

/// Tracks per-upstream Ready→Loading→Ready flaps so the router can suppress
/// the intermediate `list_changed` notification within the coalescing window.
pub struct Coalescer {
    window: Duration,
    pending: std::collections::HashMap<String, tokio::time::Instant>,
}

impl Coalescer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: std::collections::HashMap::new(),
        }
    }

    /// Call when an upstream leaves Ready. Returns true if a notification
    /// should be suppressed pending stabilization.
    pub fn mark_unready(&mut self, upstream: &str) {
        self.pending
            .insert(upstream.to_string(), tokio::time::Instant::now());
    }

    /// Call when an upstream (re)becomes Ready. Returns true if this
    /// transition is still within the coalescing window of a prior flap.
    pub fn is_within_window(&mut self, upstream: &str) -> bool {
        match self.pending.remove(upstream) {
            Some(since) => since.elapsed() <= self.window,
            None => false,
        }
    }
}

#[derive(Default, Clone, PartialEq, Eq)]
struct CapabilitySnapshot {
    tools: HashSet<String>,
    resources: HashSet<String>,
    prompts: HashSet<String>,
}

async fn snapshot_for(router: &Router, name: &str) -> CapabilitySnapshot {
    let ready = router.upstreams.ready_clients().await;
    let Some(client) = ready.get(name) else {
        return CapabilitySnapshot::default();
    };
    let timeout = Duration::from_secs(10);
    let tools = tokio::time::timeout(timeout, client.service.list_all_tools())
        .await
        .ok()
        .and_then(|r| r.ok())
        .unwrap_or_default();
    let resources = tokio::time::timeout(timeout, client.service.list_all_resources())
        .await
        .ok()
        .and_then(|r| r.ok())
        .unwrap_or_default();
    let prompts = tokio::time::timeout(timeout, client.service.list_all_prompts())
        .await
        .ok()
        .and_then(|r| r.ok())
        .unwrap_or_default();
    CapabilitySnapshot {
        tools: tools.into_iter().map(|t| t.name.to_string()).collect(),
        resources: resources.into_iter().map(|r| r.uri).collect(),
        prompts: prompts.into_iter().map(|p| p.name).collect(),
    }
}

/// Spawns the background task that watches upstream lifecycle transitions
/// and fans `tools/list_changed`, `resources/list_changed`, and
/// `prompts/list_changed` out to every admitting session — but only once a
/// flap has settled and the capability set on the far side actually
/// differs from the set before the flap. A bare Ready→Loading→Ready
/// restart with no capability drift is never surfaced to clients.
pub fn spawn_notification_bridge(router: Arc<Router>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut events = router.upstreams.events();
        let mut coalescer = Coalescer::new(router.coalesce_window);
        let mut snapshots: HashMap<String, CapabilitySnapshot> = HashMap::new();
        loop {
            let change = match events.recv().await {
                Ok(c) => c,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            };
            match &change.state {
                LoadingState::Ready => {
                    let flapped = coalescer.is_within_window(&change.name);
                    let snapshot = snapshot_for(&router, &change.name).await;
                    let prior = snapshots.insert(change.name.clone(), snapshot.clone());
                    // A brand new upstream (no prior snapshot) growing the
                    // aggregate namespace always notifies, regardless of the
                    // coalescing window; a reconnect flap only notifies if
                    // the capability set actually drifted across it.
                    let notify = match &prior {
                        None => !snapshot.tools.is_empty()
                            || !snapshot.resources.is_empty()
                            || !snapshot.prompts.is_empty(),
                        Some(_) if !flapped => false,
                        Some(_) => true,
                    };
                    if !notify {
                        continue;
                    }
                    let prior = prior.unwrap_or_default();
                    if prior.tools != snapshot.tools {
                        router
                            .bus
                            .for_each_admitting(&change.tags, |peer| async move {
                                let _ = peer.notify_tool_list_changed().await;
                            })
                            .await;
                    }
                    if prior.resources != snapshot.resources {
                        router
                            .bus
                            .for_each_admitting(&change.tags, |peer| async move {
                                let _ = peer.notify_resource_list_changed().await;
                            })
                            .await;
                    }
                    if prior.prompts != snapshot.prompts {
                        router
                            .bus
                            .for_each_admitting(&change.tags, |peer| async move {
                                let _ = peer.notify_prompt_list_changed().await;
                            })
                            .await;
                    }
                }
                LoadingState::Cancelled => {
                    coalescer.mark_unready(&change.name);
                    let prior = snapshots.remove(&change.name);
                    // Removal always shrinks the aggregate namespace (unless
                    // the upstream never reached Ready / never had anything
                    // to offer), so it always notifies admitting sessions.
                    if let Some(prior) = prior {
                        if !prior.tools.is_empty() {
                            router
                                .bus
                                .for_each_admitting(&change.tags, |peer| async move {
                                    let _ = peer.notify_tool_list_changed().await;
                                })
                                .await;
                        }
                        if !prior.resources.is_empty() {
                            router
                                .bus
                                .for_each_admitting(&change.tags, |peer| async move {
                                    let _ = peer.notify_resource_list_changed().await;
                                })
                                .await;
                        }
                        if !prior.prompts.is_empty() {
                            router
                                .bus
                                .for_each_admitting(&change.tags, |peer| async move {
                                    let _ = peer.notify_prompt_list_changed().await;
                                })
                                .await;
                        }
                    }
                }
                LoadingState::Failed { .. } => {
                    coalescer.mark_unready(&change.name);
                    snapshots.remove(&change.name);
                }
                LoadingState::Loading | LoadingState::Pending | LoadingState::AwaitingOAuth { .. } => {
                    coalescer.mark_unready(&change.name);
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coalescer_detects_rapid_flap() {
        let mut c = Coalescer::new(Duration::from_secs(2));
        c.mark_unready("a");
        assert!(c.is_within_window("a"));
    }

    #[test]
    fn coalescer_ignores_unrelated_upstream() {
        let mut c = Coalescer::new(Duration::from_secs(2));
        c.mark_unready("a");
        assert!(!c.is_within_window("b"));
    }
}
