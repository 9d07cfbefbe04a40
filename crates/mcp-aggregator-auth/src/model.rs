use serde::{Deserialize, Serialize};

fn now_epoch() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRegistration {
    pub client_id: String,
    pub client_secret: Option<String>,
    pub client_name: Option<String>,
    pub redirect_uris: Vec<String>,
    pub grant_types: Vec<String>,
    pub token_endpoint_auth_method: String,
    pub created_at: i64,
}

impl ClientRegistration {
    pub fn new(client_name: Option<String>, redirect_uris: Vec<String>) -> Self {
        Self {
            client_id: format!("client_{}", uuid::Uuid::new_v4().simple()),
            client_secret: None,
            client_name,
            redirect_uris,
            grant_types: vec!["authorization_code".to_string(), "refresh_token".to_string()],
            token_endpoint_auth_method: "none".to_string(),
            created_at: now_epoch(),
        }
    }
}

/// Short-lived record of an in-flight OAuth authorization, created at
/// `/authorize` and deleted at code issuance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthRequest {
    pub request_id: String,
    pub client_id: String,
    pub redirect_uri: String,
    pub code_challenge: String,
    pub code_challenge_method: String,
    pub state: Option<String>,
    pub scopes: Vec<String>,
    pub resource: Option<String>,
    pub expires_at: i64,
}

impl AuthRequest {
    pub fn is_expired(&self) -> bool {
        now_epoch() > self.expires_at
    }
}

/// One-shot token binding clientId+redirectUri+resource+scopes; deleted on
/// exchange or expiry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationCode {
    pub code: String,
    pub client_id: String,
    pub redirect_uri: String,
    pub code_challenge: String,
    pub code_challenge_method: String,
    pub scopes: Vec<String>,
    pub resource: Option<String>,
    pub expires_at: i64,
}

impl AuthorizationCode {
    pub fn is_expired(&self) -> bool {
        now_epoch() > self.expires_at
    }
}

/// An issued access token's backing record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub token: String,
    pub refresh_token: Option<String>,
    pub client_id: String,
    pub scopes: Vec<String>,
    pub resource: Option<String>,
    pub expires_at: i64,
}

impl Session {
    pub fn is_expired(&self) -> bool {
        now_epoch() > self.expires_at
    }

    pub fn tag_names(&self) -> Vec<String> {
        self.scopes
            .iter()
            .filter_map(|s| s.strip_prefix("tag:"))
            .map(|s| s.to_string())
            .collect()
    }
}

pub fn new_request_id() -> String {
    format!("req_{}", uuid::Uuid::new_v4().simple())
}

pub fn new_code() -> String {
    format!("code_{}", uuid::Uuid::new_v4().simple())
}

pub fn new_token() -> String {
    format!("tkn_{}", uuid::Uuid::new_v4().simple())
}

pub fn new_refresh_token() -> String {
    format!("rt_{}", uuid::Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_extracts_tag_scopes_only() {
        let s = Session {
            token: "tkn_x".into(),
            refresh_token: None,
            client_id: "c".into(),
            scopes: vec!["tag:web".into(), "openid".into(), "tag:db".into()],
            resource: None,
            expires_at: now_epoch() + 60,
        };
        let tags = s.tag_names();
        assert_eq!(tags, vec!["web".to_string(), "db".to_string()]);
    }
}
