//! Wires the `Router` into an `rmcp` `Service<RoleServer>` so it can be
//! served over any inbound transport (stdio, streamable HTTP, SSE).

use std::sync::Arc;
use std::time::Duration;

use rmcp::model::{ClientNotification, ClientRequest, InitializeResult, ServerResult};
use rmcp::service::{NotificationContext, RequestContext, RoleServer, Service};
use rmcp::ErrorData;

use crate::router::Router;
use crate::session::InboundSession;

const DEFAULT_REQUEST_DEADLINE: Duration = Duration::from_secs(30);

/// One `AggregatingService` is constructed per inbound session; it shares the
/// `Router` (and therefore the upstream fleet) with every other session.
#[derive(Clone)]
pub struct AggregatingService {
    pub router: Arc<Router>,
    pub session: InboundSession,
}

impl AggregatingService {
    pub fn new(router: Arc<Router>, session: InboundSession) -> Self {
        Self { router, session }
    }

    pub async fn handle_request(
        &self,
        request: ClientRequest,
        ctx: RequestContext<RoleServer>,
    ) -> Result<ServerResult, ErrorData> {
        self.router.touch_session(ctx.peer.clone(), &self.session).await;
        match request {
            ClientRequest::InitializeRequest(_) => {
                Ok(ServerResult::InitializeResult(self.router.initialize_result()))
            }
            ClientRequest::PingRequest(_) => {
                self.router.ping_all(&self.session).await;
                Ok(ServerResult::empty(()))
            }
            ClientRequest::ListToolsRequest(req) => Ok(ServerResult::ListToolsResult(
                self.router.list_tools(&self.session, req.params).await,
            )),
            ClientRequest::ListResourcesRequest(req) => Ok(ServerResult::ListResourcesResult(
                self.router.list_resources(&self.session, req.params).await,
            )),
            ClientRequest::ListResourceTemplatesRequest(req) => {
                Ok(ServerResult::ListResourceTemplatesResult(
                    self.router
                        .list_resource_templates(&self.session, req.params)
                        .await,
                ))
            }
            ClientRequest::ListPromptsRequest(req) => Ok(ServerResult::ListPromptsResult(
                self.router.list_prompts(&self.session, req.params).await,
            )),
            ClientRequest::CallToolRequest(req) => self
                .router
                .call_tool(&self.session, req.params, DEFAULT_REQUEST_DEADLINE)
                .await
                .map(ServerResult::CallToolResult),
            ClientRequest::GetPromptRequest(req) => self
                .router
                .get_prompt(&self.session, req.params)
                .await
                .map(ServerResult::GetPromptResult),
            ClientRequest::ReadResourceRequest(req) => self
                .router
                .read_resource(&self.session, req.params)
                .await
                .map(ServerResult::ReadResourceResult),
            ClientRequest::SubscribeRequest(req) => self
                .router
                .subscribe_resource(&self.session, req.params)
                .await
                .map(|_| ServerResult::empty(())),
            ClientRequest::UnsubscribeRequest(req) => self
                .router
                .unsubscribe_resource(&self.session, req.params)
                .await
                .map(|_| ServerResult::empty(())),
            _ => Ok(ServerResult::empty(())),
        }
    }

    async fn forward_notification(&self, notification: ClientNotification) {
        match &notification {
            ClientNotification::CancelledNotification(n) => {
                tracing::debug!(
                    target: "router",
                    session_id = %self.session.session_id,
                    request_id = ?n.params.request_id,
                    "inbound cancelled notification"
                );
            }
            _ => {}
        }
        match notification {
            ClientNotification::InitializedNotification(_)
            | ClientNotification::RootsListChangedNotification(_)
            | ClientNotification::CancelledNotification(_)
            | ClientNotification::ProgressNotification(_) => {
                self.router
                    .forward_client_notification(&self.session, notification)
                    .await;
            }
            _ => {}
        }
    }
}

impl Service<RoleServer> for AggregatingService {
    async fn handle_request(
        &self,
        request: ClientRequest,
        context: RequestContext<RoleServer>,
    ) -> Result<ServerResult, ErrorData> {
        AggregatingService::handle_request(self, request, context).await
    }

    async fn handle_notification(
        &self,
        notification: ClientNotification,
        _context: NotificationContext<RoleServer>,
    ) -> Result<(), ErrorData> {
        self.forward_notification(notification).await;
        Ok(())
    }

    fn get_info(&self) -> InitializeResult {
        self.router.initialize_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify_bus::NotifyBus;
    use crate::session::InboundSession;
    use crate::tagfilter::TagFilter;
    use crate::upstream::UpstreamManager;
    use std::collections::HashSet;

    #[tokio::test]
    async fn list_tools_on_empty_fleet_returns_empty() {
        let bus = NotifyBus::new();
        let router = Arc::new(Router::new(
            UpstreamManager::new("proxy-under-test", bus.clone()),
            bus,
        ));
        let session = InboundSession::new(
            "s1",
            HashSet::new(),
            TagFilter::Always,
            false,
            None,
        );
        let svc = AggregatingService::new(router, session);
        let result = svc.router.list_tools(&svc.session, None).await;
        assert!(result.tools.is_empty());
    }
}
