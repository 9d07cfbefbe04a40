//! Single inbound session bound to the process's own stdin/stdout, used when
//! the proxy is itself launched as a subprocess. No auth; the session's tag
//! filter admits everything.

use std::collections::HashSet;
use std::sync::Arc;

use mcp_aggregator_core::router::Router;
use mcp_aggregator_core::service::AggregatingService;
use mcp_aggregator_core::session::InboundSession;
use mcp_aggregator_core::tagfilter::TagFilter;
use rmcp::transport::io::stdio;
use rmcp::ServiceExt;

pub async fn serve(router: Arc<Router>) -> anyhow::Result<()> {
    let session = InboundSession::new(
        "stdio",
        HashSet::new(),
        TagFilter::Always,
        false,
        None,
    );
    let session_id = session.session_id.clone();
    let service = AggregatingService::new(router.clone(), session);
    let transport = stdio();
    let running = service
        .serve(transport)
        .await
        .map_err(|e| anyhow::anyhow!("stdio transport failed: {e}"))?;
    let result = running
        .waiting()
        .await
        .map_err(|e| anyhow::anyhow!("stdio session ended with error: {e}"));
    router.session_disconnected(&session_id).await;
    result?;
    Ok(())
}
