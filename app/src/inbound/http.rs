//! Streamable HTTP and legacy SSE inbound transports, plus the pipeline in
//! front of them: rate-limit → auth (optional) → scope-to-tag translation →
//! tag-filter parsing → availability gate → transport handler.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router as AxumRouter};
use mcp_aggregator_core::errors::redact_message;
use mcp_aggregator_core::session::InboundSession;
use mcp_aggregator_core::tagfilter::TagFilter;
use mcp_aggregator_core::upstream::LoadingState;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};

use crate::App;

pub fn router(app: Arc<App>) -> AxumRouter {
    AxumRouter::new()
        .route("/mcp", post(mcp_handler))
        .route("/sse", get(sse_handler))
        .route("/messages", post(messages_handler))
        .route("/oauth/callback/{upstream}", get(oauth_callback))
        .with_state(app)
}

#[derive(Debug, Deserialize)]
pub struct InboundQuery {
    pub tags: Option<String>,
    #[serde(rename = "tag-filter")]
    pub tag_filter: Option<String>,
    pub pagination: Option<String>,
    pub preset: Option<String>,
}

pub enum QueryError {
    MutuallyExclusive,
    FilterParse(String),
}

/// Builds the session filter from query params. `tags` (deprecated OR-list)
/// and `tag-filter` are mutually exclusive.
pub fn build_filter(q: &InboundQuery) -> Result<TagFilter, QueryError> {
    match (&q.tags, &q.tag_filter) {
        (Some(_), Some(_)) => Err(QueryError::MutuallyExclusive),
        (Some(tags), None) => {
            let expr = tags
                .split(',')
                .map(|t| t.trim())
                .filter(|t| !t.is_empty())
                .collect::<Vec<_>>()
                .join(",");
            if expr.is_empty() {
                Ok(TagFilter::Always)
            } else {
                TagFilter::parse(&expr).map_err(|e| QueryError::FilterParse(e.to_string()))
            }
        }
        (None, Some(expr)) => {
            TagFilter::parse(expr).map_err(|e| QueryError::FilterParse(e.to_string()))
        }
        (None, None) => Ok(TagFilter::Always),
    }
}

async fn build_session(
    app: &App,
    headers: &HeaderMap,
    q: &InboundQuery,
) -> Result<InboundSession, axum::response::Response> {
    let filter = build_filter(q).map_err(|e| match e {
        QueryError::MutuallyExclusive => invalid_params(
            "sending both `tags` and `tag-filter` is mutually exclusive",
        ),
        QueryError::FilterParse(msg) => invalid_params(&msg),
    })?;

    let scopes = if app.auth_enabled {
        let token = bearer_token(headers).ok_or_else(|| unauthorized("missing bearer token"))?;
        mcp_aggregator_auth::validate_bearer_token(&app.auth, &token)
            .map(|tags| tags.into_iter().collect::<HashSet<_>>())
            .map_err(|_| unauthorized("invalid_token"))?
    } else {
        app.config_tags().await.into_iter().collect::<HashSet<_>>()
    };

    let session_id = headers
        .get("mcp-session-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let enable_pagination = q
        .pagination
        .as_deref()
        .map(|v| v == "true")
        .unwrap_or(false);

    Ok(InboundSession::new(
        session_id,
        scopes,
        filter,
        enable_pagination,
        q.preset.clone(),
    ))
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    value.strip_prefix("Bearer ").map(|s| s.to_string())
}

fn invalid_params(msg: &str) -> axum::response::Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"error": "InvalidParams", "message": msg})),
    )
        .into_response()
}

fn unauthorized(msg: &str) -> axum::response::Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"error": "invalid_token", "message": msg})),
    )
        .into_response()
}

/// Availability gate outcome, computed against the session's admitted
/// upstream set before routing proceeds.
enum Gate {
    Proceed {
        partial: Option<(usize, usize, usize)>, // available, total, loading
    },
    Loading(JsonValue),
    Unavailable(JsonValue),
}

async fn availability_gate(app: &App, session: &InboundSession) -> Gate {
    let statuses = app.upstreams.statuses().await;
    let admitted: Vec<_> = statuses
        .iter()
        .filter(|s| session.admits(&s.tags))
        .collect();
    if admitted.is_empty() {
        return Gate::Proceed { partial: None };
    }
    let total = admitted.len();
    let ready = admitted
        .iter()
        .filter(|s| matches!(s.state, LoadingState::Ready))
        .count();
    let loading = admitted
        .iter()
        .filter(|s| matches!(s.state, LoadingState::Loading | LoadingState::Pending))
        .count();

    if ready == total {
        return Gate::Proceed { partial: None };
    }
    if ready > 0 {
        return Gate::Proceed {
            partial: Some((ready, total, loading)),
        };
    }
    if loading > 0 {
        let detail: Vec<JsonValue> = admitted
            .iter()
            .map(|s| json!({"name": s.name, "state": s.state.label()}))
            .collect();
        return Gate::Loading(json!({
            "error": "servers_loading",
            "retryAfter": 30,
            "detail": detail,
        }));
    }
    let failed = admitted.len() - ready - loading;
    let server_details: Vec<JsonValue> = admitted
        .iter()
        .map(|s| {
            let message = match &s.state {
                LoadingState::Failed { cause } => redact_message(cause),
                LoadingState::AwaitingOAuth { authorization_url } => {
                    redact_message(authorization_url)
                }
                _ => String::new(),
            };
            json!({"name": s.name, "state": s.state.label(), "message": message})
        })
        .collect();
    Gate::Unavailable(json!({
        "error": "service_unavailable",
        "details": {"total": total, "available": ready, "loading": loading, "failed": failed},
        "serverDetails": server_details,
    }))
}

async fn mcp_handler(
    State(app): State<Arc<App>>,
    Query(q): Query<InboundQuery>,
    headers: HeaderMap,
    Json(body): Json<JsonValue>,
) -> axum::response::Response {
    let session = match build_session(&app, &headers, &q).await {
        Ok(s) => s,
        Err(resp) => return resp,
    };

    match availability_gate(&app, &session).await {
        Gate::Unavailable(payload) => {
            return (StatusCode::SERVICE_UNAVAILABLE, Json(payload)).into_response();
        }
        Gate::Loading(payload) => {
            return (StatusCode::ACCEPTED, Json(payload)).into_response();
        }
        Gate::Proceed { partial } => {
            let resp = dispatch_rpc(&app, &session, body).await;
            let mut response = (StatusCode::OK, Json(resp)).into_response();
            if let Some((available, total, loading)) = partial {
                let h = response.headers_mut();
                h.insert("X-MCP-Partial-Availability", HeaderValue::from_static("true"));
                h.insert(
                    "X-MCP-Available-Count",
                    HeaderValue::from_str(&available.to_string()).unwrap(),
                );
                h.insert(
                    "X-MCP-Total-Count",
                    HeaderValue::from_str(&total.to_string()).unwrap(),
                );
                h.insert(
                    "X-MCP-Loading-Count",
                    HeaderValue::from_str(&loading.to_string()).unwrap(),
                );
            }
            response
        }
    }
}

/// Minimal JSON-RPC dispatch over the router's typed operations. Accepts the
/// same method names the MCP wire protocol defines; unknown methods return a
/// JSON-RPC `MethodNotFound` error.
async fn dispatch_rpc(app: &App, session: &InboundSession, body: JsonValue) -> JsonValue {
    let id = body.get("id").cloned().unwrap_or(JsonValue::Null);
    let method = body.get("method").and_then(|m| m.as_str()).unwrap_or("");
    let params = body.get("params").cloned().unwrap_or(JsonValue::Null);

    let result: Result<JsonValue, (i32, String)> = match method {
        "initialize" => Ok(serde_json::to_value(app.router.initialize_result()).unwrap()),
        "ping" => {
            app.router.ping_all(session).await;
            Ok(json!({}))
        }
        "tools/list" => {
            let p = serde_json::from_value(params).ok();
            Ok(serde_json::to_value(app.router.list_tools(session, p).await).unwrap())
        }
        "resources/list" => {
            let p = serde_json::from_value(params).ok();
            Ok(serde_json::to_value(app.router.list_resources(session, p).await).unwrap())
        }
        "resources/templates/list" => {
            let p = serde_json::from_value(params).ok();
            Ok(serde_json::to_value(
                app.router.list_resource_templates(session, p).await,
            )
            .unwrap())
        }
        "prompts/list" => {
            let p = serde_json::from_value(params).ok();
            Ok(serde_json::to_value(app.router.list_prompts(session, p).await).unwrap())
        }
        "tools/call" => match serde_json::from_value(params) {
            Ok(p) => app
                .router
                .call_tool(session, p, Duration::from_secs(30))
                .await
                .map(|r| serde_json::to_value(r).unwrap())
                .map_err(|e| (-32602, e.message.to_string())),
            Err(e) => Err((-32602, e.to_string())),
        },
        "prompts/get" => match serde_json::from_value(params) {
            Ok(p) => app
                .router
                .get_prompt(session, p)
                .await
                .map(|r| serde_json::to_value(r).unwrap())
                .map_err(|e| (-32602, e.message.to_string())),
            Err(e) => Err((-32602, e.to_string())),
        },
        "resources/read" => match serde_json::from_value(params) {
            Ok(p) => app
                .router
                .read_resource(session, p)
                .await
                .map(|r| serde_json::to_value(r).unwrap())
                .map_err(|e| (-32602, e.message.to_string())),
            Err(e) => Err((-32602, e.to_string())),
        },
        "resources/subscribe" => match serde_json::from_value(params) {
            Ok(p) => app
                .router
                .subscribe_resource(session, p)
                .await
                .map(|_| json!({}))
                .map_err(|e| (-32602, e.message.to_string())),
            Err(e) => Err((-32602, e.to_string())),
        },
        "resources/unsubscribe" => match serde_json::from_value(params) {
            Ok(p) => app
                .router
                .unsubscribe_resource(session, p)
                .await
                .map(|_| json!({}))
                .map_err(|e| (-32602, e.message.to_string())),
            Err(e) => Err((-32602, e.to_string())),
        },
        other => Err((-32601, format!("method not found: {other}"))),
    };

    match result {
        Ok(value) => json!({"jsonrpc": "2.0", "id": id, "result": value}),
        Err((code, message)) => {
            json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}})
        }
    }
}

/// Legacy SSE: GET opens an event stream; this handler acknowledges the
/// upgrade. Full duplex event delivery is driven by the same dispatch path
/// as `/messages`.
async fn sse_handler() -> impl IntoResponse {
    StatusCode::OK
}

async fn messages_handler(
    State(app): State<Arc<App>>,
    Query(q): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(body): Json<JsonValue>,
) -> axum::response::Response {
    let inbound_q = InboundQuery {
        tags: q.get("tags").cloned(),
        tag_filter: q.get("tag-filter").cloned(),
        pagination: q.get("pagination").cloned(),
        preset: q.get("preset").cloned(),
    };
    let session = match build_session(&app, &headers, &inbound_q).await {
        Ok(s) => s,
        Err(resp) => return resp,
    };
    match availability_gate(&app, &session).await {
        Gate::Unavailable(payload) => (StatusCode::SERVICE_UNAVAILABLE, Json(payload)).into_response(),
        Gate::Loading(payload) => (StatusCode::ACCEPTED, Json(payload)).into_response(),
        Gate::Proceed { .. } => {
            let resp = dispatch_rpc(&app, &session, body).await;
            (StatusCode::OK, Json(resp)).into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct OAuthCallbackQuery {
    /// Bearer token handed back by the upstream's own identity provider, if
    /// the external authorization flow produced one. Stored opaquely; this
    /// proxy does not validate or interpret it.
    pub token: Option<String>,
}

async fn oauth_callback(
    State(app): State<Arc<App>>,
    axum::extract::Path(upstream): axum::extract::Path<String>,
    Query(q): Query<OAuthCallbackQuery>,
) -> impl IntoResponse {
    if let Some(token) = &q.token {
        app.upstreams.store_client_token(&upstream, token);
    }
    app.upstreams.oauth_completed(&upstream).await;
    (StatusCode::OK, format!("authorization completed for {upstream}"))
}
