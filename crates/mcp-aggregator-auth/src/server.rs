use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{ConnectInfo, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Redirect};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::model::{
    new_code, new_refresh_token, new_request_id, new_token, AuthRequest, AuthorizationCode,
    ClientRegistration, Session,
};
use crate::pkce::verify_s256;
use crate::ratelimit::IpRateLimiter;
use crate::scope::{parse_scope_string, validate_scopes};
use crate::storage::Storage;

const AUTH_REQUEST_TTL_SECS: i64 = 600;
const CODE_TTL_SECS: i64 = 300;

pub struct AuthConfig {
    pub token_ttl_secs: i64,
    pub cleanup_interval: Duration,
    pub rate_limit_max: u32,
    pub rate_limit_window_secs: u64,
    pub trust_proxy_hops: usize,
    pub issuer: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_ttl_secs: 3600,
            cleanup_interval: Duration::from_secs(5 * 60),
            rate_limit_max: 20,
            rate_limit_window_secs: 60,
            trust_proxy_hops: 0,
            issuer: "http://localhost:8091".to_string(),
        }
    }
}

pub struct AuthState {
    pub clients: Storage,
    pub auth_requests: Storage,
    pub codes: Storage,
    pub sessions: Storage,
    pub known_tags: Arc<std::sync::RwLock<Vec<String>>>,
    pub limiter: IpRateLimiter,
    pub config: AuthConfig,
}

impl AuthState {
    pub fn new(base_dir: std::path::PathBuf, known_tags: Vec<String>, config: AuthConfig) -> std::io::Result<Self> {
        Ok(Self {
            clients: Storage::new(base_dir.join("clients"))?,
            auth_requests: Storage::new(base_dir.join("auth_requests"))?,
            codes: Storage::new(base_dir.join("codes"))?,
            sessions: Storage::new(base_dir.join("sessions"))?,
            known_tags: Arc::new(std::sync::RwLock::new(known_tags)),
            limiter: IpRateLimiter::new(config.rate_limit_max, config.rate_limit_window_secs),
            config,
        })
    }
}

pub fn router(state: Arc<AuthState>) -> Router {
    Router::new()
        .route("/register", post(register))
        .route("/authorize", get(authorize))
        .route("/token", post(token))
        .route("/revoke", post(revoke))
        .route(
            "/.well-known/oauth-authorization-server",
            get(well_known),
        )
        .with_state(state)
}

/// Runs the background cleanup sweep until the returned handle is aborted;
/// graceful shutdown simply drops/aborts the handle.
pub fn spawn_cleanup_sweep(state: Arc<AuthState>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(state.config.cleanup_interval);
        loop {
            ticker.tick().await;
            sweep_expired(&state);
        }
    })
}

fn sweep_expired(state: &AuthState) {
    for id in state.auth_requests.list_ids() {
        match state.auth_requests.read::<AuthRequest>(&id) {
            Some(req) if req.is_expired() => state.auth_requests.delete(&id),
            None => state.auth_requests.delete(&id),
            _ => {}
        }
    }
    for id in state.codes.list_ids() {
        match state.codes.read::<AuthorizationCode>(&id) {
            Some(code) if code.is_expired() => state.codes.delete(&id),
            None => state.codes.delete(&id),
            _ => {}
        }
    }
    for id in state.sessions.list_ids() {
        match state.sessions.read::<Session>(&id) {
            Some(session) if session.is_expired() => state.sessions.delete(&id),
            None => state.sessions.delete(&id),
            _ => {}
        }
    }
}

#[derive(Deserialize)]
struct RegisterRequest {
    client_name: Option<String>,
    #[serde(default)]
    redirect_uris: Vec<String>,
}

async fn register(
    State(state): State<Arc<AuthState>>,
    ConnectInfo(addr): ConnectInfo<std::net::SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<RegisterRequest>,
) -> impl IntoResponse {
    let ip = state.limiter_ip(addr.ip(), forwarded_for(&headers).as_deref());
    if state.limiter.check(ip).is_err() {
        return oauth_error(StatusCode::TOO_MANY_REQUESTS, "rate_limited", "too many requests");
    }
    let reg = ClientRegistration::new(body.client_name, body.redirect_uris);
    if state.clients.write(&reg.client_id, &reg).is_err() {
        return (StatusCode::INTERNAL_SERVER_ERROR, "storage error").into_response();
    }
    Json(json!({
        "client_id": reg.client_id,
        "client_secret": reg.client_secret,
        "client_name": reg.client_name,
        "redirect_uris": reg.redirect_uris,
        "grant_types": reg.grant_types,
        "token_endpoint_auth_method": reg.token_endpoint_auth_method,
    }))
    .into_response()
}

#[derive(Deserialize)]
struct AuthorizeQuery {
    client_id: String,
    redirect_uri: String,
    response_type: String,
    code_challenge: String,
    code_challenge_method: String,
    scope: Option<String>,
    state: Option<String>,
    resource: Option<String>,
}

async fn authorize(
    State(state): State<Arc<AuthState>>,
    ConnectInfo(addr): ConnectInfo<std::net::SocketAddr>,
    headers: HeaderMap,
    Query(q): Query<AuthorizeQuery>,
) -> impl IntoResponse {
    let ip = state.limiter_ip(addr.ip(), forwarded_for(&headers).as_deref());
    if state.limiter.check(ip).is_err() {
        return oauth_error(StatusCode::TOO_MANY_REQUESTS, "rate_limited", "too many requests");
    }
    if q.response_type != "code" {
        return oauth_error(StatusCode::BAD_REQUEST, "invalid_request", "response_type must be code");
    }
    if q.code_challenge_method != "S256" {
        return oauth_error(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "code_challenge_method must be S256",
        );
    }
    let Some(_client) = state.clients.read::<ClientRegistration>(&q.client_id) else {
        return oauth_error(StatusCode::BAD_REQUEST, "invalid_client", "unknown client_id");
    };
    let scopes = parse_scope_string(q.scope.as_deref().unwrap_or(""));
    let known_tags = state.known_tags.read().unwrap().clone();
    if let Err(e) = validate_scopes(&scopes, &known_tags) {
        return oauth_error(StatusCode::BAD_REQUEST, "invalid_scope", &e);
    }

    let request_id = new_request_id();
    let req = AuthRequest {
        request_id: request_id.clone(),
        client_id: q.client_id.clone(),
        redirect_uri: q.redirect_uri.clone(),
        code_challenge: q.code_challenge.clone(),
        code_challenge_method: q.code_challenge_method.clone(),
        state: q.state.clone(),
        scopes: scopes.clone(),
        resource: q.resource.clone(),
        expires_at: epoch_now() + AUTH_REQUEST_TTL_SECS,
    };
    if state.auth_requests.write(&request_id, &req).is_err() {
        return (StatusCode::INTERNAL_SERVER_ERROR, "storage error").into_response();
    }

    // This implementation auto-consents (no interactive consent UI); a real
    // deployment would render a consent view naming the requested scopes
    // before reaching this point.
    let code = new_code();
    let auth_code = AuthorizationCode {
        code: code.clone(),
        client_id: req.client_id,
        redirect_uri: req.redirect_uri.clone(),
        code_challenge: req.code_challenge,
        code_challenge_method: req.code_challenge_method,
        scopes: req.scopes,
        resource: req.resource,
        expires_at: epoch_now() + CODE_TTL_SECS,
    };
    if state.codes.write(&code, &auth_code).is_err() {
        return (StatusCode::INTERNAL_SERVER_ERROR, "storage error").into_response();
    }
    state.auth_requests.delete(&request_id);

    let mut redirect_url = format!("{}?code={}", req.redirect_uri, code);
    if let Some(s) = &req.state {
        redirect_url.push_str(&format!("&state={s}"));
    }
    Redirect::to(&redirect_url).into_response()
}

#[derive(Deserialize)]
#[serde(tag = "grant_type")]
#[serde(rename_all = "snake_case")]
enum TokenRequest {
    AuthorizationCode {
        code: String,
        client_id: String,
        redirect_uri: String,
        code_verifier: String,
        resource: Option<String>,
    },
    RefreshToken {
        refresh_token: String,
        client_id: String,
    },
}

async fn token(
    State(state): State<Arc<AuthState>>,
    ConnectInfo(addr): ConnectInfo<std::net::SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<TokenRequest>,
) -> impl IntoResponse {
    let ip = state.limiter_ip(addr.ip(), forwarded_for(&headers).as_deref());
    if state.limiter.check(ip).is_err() {
        return oauth_error(StatusCode::TOO_MANY_REQUESTS, "rate_limited", "too many requests");
    }
    match body {
        TokenRequest::AuthorizationCode {
            code,
            client_id,
            redirect_uri,
            code_verifier,
            resource,
        } => {
            let Some(auth_code) = state.codes.read::<AuthorizationCode>(&code) else {
                return oauth_error(StatusCode::BAD_REQUEST, "invalid_grant", "unknown or consumed code");
            };
            // One-shot: delete immediately so a concurrent replay also fails.
            state.codes.delete(&code);
            if auth_code.is_expired()
                || auth_code.client_id != client_id
                || auth_code.redirect_uri != redirect_uri
                || auth_code.resource != resource
            {
                return oauth_error(StatusCode::BAD_REQUEST, "invalid_grant", "code mismatch or expired");
            }
            if !verify_s256(&code_verifier, &auth_code.code_challenge) {
                return oauth_error(StatusCode::BAD_REQUEST, "invalid_grant", "pkce verification failed");
            }
            let access_token = new_token();
            let refresh_token = new_refresh_token();
            let session = Session {
                token: access_token.clone(),
                refresh_token: Some(refresh_token.clone()),
                client_id: auth_code.client_id,
                scopes: auth_code.scopes.clone(),
                resource: auth_code.resource,
                expires_at: epoch_now() + state.config.token_ttl_secs,
            };
            if state.sessions.write(&access_token, &session).is_err() {
                return (StatusCode::INTERNAL_SERVER_ERROR, "storage error").into_response();
            }
            Json(json!({
                "access_token": access_token,
                "refresh_token": refresh_token,
                "token_type": "Bearer",
                "expires_in": state.config.token_ttl_secs,
                "scope": auth_code.scopes.join(" "),
            }))
            .into_response()
        }
        TokenRequest::RefreshToken {
            refresh_token,
            client_id,
        } => {
            let matching = state
                .sessions
                .list_ids()
                .into_iter()
                .find_map(|id| {
                    let s = state.sessions.read::<Session>(&id)?;
                    if s.refresh_token.as_deref() == Some(refresh_token.as_str())
                        && s.client_id == client_id
                    {
                        Some(s)
                    } else {
                        None
                    }
                });
            let Some(old) = matching else {
                return oauth_error(StatusCode::BAD_REQUEST, "invalid_grant", "unknown refresh token");
            };
            state.sessions.delete(&old.token);
            let access_token = new_token();
            let new_refresh = new_refresh_token();
            let session = Session {
                token: access_token.clone(),
                refresh_token: Some(new_refresh.clone()),
                client_id: old.client_id,
                scopes: old.scopes.clone(),
                resource: old.resource,
                expires_at: epoch_now() + state.config.token_ttl_secs,
            };
            if state.sessions.write(&access_token, &session).is_err() {
                return (StatusCode::INTERNAL_SERVER_ERROR, "storage error").into_response();
            }
            Json(json!({
                "access_token": access_token,
                "refresh_token": new_refresh,
                "token_type": "Bearer",
                "expires_in": state.config.token_ttl_secs,
                "scope": session.scopes.join(" "),
            }))
            .into_response()
        }
    }
}

#[derive(Deserialize)]
struct RevokeRequest {
    token: String,
}

async fn revoke(State(state): State<Arc<AuthState>>, Json(body): Json<RevokeRequest>) -> impl IntoResponse {
    state.sessions.delete(&body.token);
    StatusCode::OK
}

async fn well_known(State(state): State<Arc<AuthState>>) -> impl IntoResponse {
    Json(json!({
        "issuer": state.config.issuer,
        "authorization_endpoint": format!("{}/authorize", state.config.issuer),
        "token_endpoint": format!("{}/token", state.config.issuer),
        "registration_endpoint": format!("{}/register", state.config.issuer),
        "revocation_endpoint": format!("{}/revoke", state.config.issuer),
        "response_types_supported": ["code"],
        "grant_types_supported": ["authorization_code", "refresh_token"],
        "code_challenge_methods_supported": ["S256"],
    }))
}

impl AuthState {
    fn limiter_ip(&self, peer: std::net::IpAddr, forwarded_for: Option<&str>) -> std::net::IpAddr {
        IpRateLimiter::resolve_client_ip(peer, forwarded_for, self.config.trust_proxy_hops)
    }
}

fn forwarded_for(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

fn oauth_error(status: StatusCode, code: &str, description: &str) -> axum::response::Response {
    (
        status,
        Json(json!({"error": code, "error_description": description})),
    )
        .into_response()
}

/// Validates a bearer token and returns the authoritative tag scope set.
pub fn validate_bearer_token(state: &AuthState, token: &str) -> Result<Vec<String>, &'static str> {
    match state.sessions.read::<Session>(token) {
        Some(session) if !session.is_expired() => Ok(session.tag_names()),
        Some(_) => Err("invalid_token"),
        None => Err("invalid_token"),
    }
}

fn epoch_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Serialize)]
pub struct HeadersOut {
    pub limit: u32,
    pub remaining: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_state(tag: &str) -> Arc<AuthState> {
        let dir = std::env::temp_dir().join(format!(
            "mcp-aggregator-auth-server-test-{}-{}-{}",
            tag,
            std::process::id(),
            uuid::Uuid::new_v4()
        ));
        Arc::new(
            AuthState::new(dir, vec!["web".to_string(), "db".to_string()], AuthConfig::default())
                .unwrap(),
        )
    }

    #[test]
    fn code_exchange_round_trip_then_replay_fails() {
        let state = temp_state("exchange");
        let reg = ClientRegistration::new(None, vec!["https://client.example/cb".to_string()]);
        state.clients.write(&reg.client_id, &reg).unwrap();

        let verifier = "verifier-value-1234567890";
        let challenge = {
            use base64::Engine;
            use sha2::{Digest, Sha256};
            base64::engine::general_purpose::URL_SAFE_NO_PAD
                .encode(Sha256::digest(verifier.as_bytes()))
        };
        let auth_code = AuthorizationCode {
            code: "code_test".into(),
            client_id: reg.client_id.clone(),
            redirect_uri: "https://client.example/cb".into(),
            code_challenge: challenge,
            code_challenge_method: "S256".into(),
            scopes: vec!["tag:web".into()],
            resource: None,
            expires_at: epoch_now() + 300,
        };
        state.codes.write(&auth_code.code, &auth_code).unwrap();

        // First exchange: simulate what the handler does, without standing up axum.
        let stored = state.codes.read::<AuthorizationCode>(&auth_code.code);
        assert!(stored.is_some());
        state.codes.delete(&auth_code.code);
        assert!(verify_s256(verifier, &stored.unwrap().code_challenge));

        // Second "exchange" finds nothing (one-shot).
        assert!(state.codes.read::<AuthorizationCode>(&auth_code.code).is_none());
    }

    #[test]
    fn validate_bearer_token_rejects_expired_session() {
        let state = temp_state("expired");
        let session = Session {
            token: "tkn_expired".into(),
            refresh_token: None,
            client_id: "c".into(),
            scopes: vec!["tag:web".into()],
            resource: None,
            expires_at: epoch_now() - 10,
        };
        state.sessions.write(&session.token, &session).unwrap();
        let result = validate_bearer_token(&state, "tkn_expired");
        assert_eq!(result, Err("invalid_token"));
    }

    #[test]
    fn sweep_removes_expired_auth_requests_and_codes() {
        let state = temp_state("sweep");
        let expired_req = AuthRequest {
            request_id: "req_x".into(),
            client_id: "c".into(),
            redirect_uri: "https://x".into(),
            code_challenge: "h".into(),
            code_challenge_method: "S256".into(),
            state: None,
            scopes: vec![],
            resource: None,
            expires_at: epoch_now() - 10,
        };
        state.auth_requests.write("req_x", &expired_req).unwrap();
        sweep_expired(&state);
        assert!(state.auth_requests.read::<AuthRequest>("req_x").is_none());
    }
}
