use thiserror::Error;

/// Surface-visible error taxonomy. Internal causes are wrapped, never renamed away.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config json: {0}")]
    InvalidJson(String),
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("unknown transport type `{0}`")]
    UnknownTransport(String),
    #[error("upstream name `{0}` contains the reserved separator token")]
    ReservedSeparator(String),
}

#[derive(Debug, Error, Clone)]
pub enum UpstreamError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("authorization required")]
    Unauthorized { authorization_url: String },
    #[error("circular dependency: upstream advertises this proxy's own identity")]
    CircularDependency,
    #[error("cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("invalid params: {0}")]
    InvalidParams(String),
    #[error("unknown upstream `{0}`")]
    UnknownUpstream(String),
    #[error("request cancelled")]
    RequestCancelled,
    #[error("tag filter parse error: {0}")]
    FilterParse(String),
    #[error("mutually exclusive query params: `tags` and `tag-filter`")]
    MutuallyExclusiveFilters,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid_client")]
    InvalidClient,
    #[error("invalid_grant")]
    InvalidGrant,
    #[error("invalid_request: {0}")]
    InvalidRequest(String),
    #[error("invalid_token")]
    InvalidToken,
    #[error("insufficient_scope")]
    InsufficientScope,
    #[error("rate_limited")]
    RateLimited,
}

impl AuthError {
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::InvalidClient => "invalid_client",
            AuthError::InvalidGrant => "invalid_grant",
            AuthError::InvalidRequest(_) => "invalid_request",
            AuthError::InvalidToken => "invalid_token",
            AuthError::InsufficientScope => "insufficient_scope",
            AuthError::RateLimited => "rate_limited",
        }
    }
}

/// Redacts credentials, URLs, and absolute paths from a message destined for a
/// client or a health endpoint. Best-effort, not a security boundary by itself.
pub fn redact_message(msg: &str) -> String {
    let mut out = String::with_capacity(msg.len());
    for word in msg.split_whitespace() {
        let lower = word.to_ascii_lowercase();
        if lower.contains("token=")
            || lower.contains("authorization:")
            || lower.contains("password=")
            || lower.contains("secret=")
        {
            out.push_str("[REDACTED_CREDENTIAL]");
        } else if word.starts_with("http://") || word.starts_with("https://") {
            out.push_str(&redact_url_to_host(word));
        } else if word.starts_with('/') && word.len() > 1 {
            out.push_str("[REDACTED_PATH]");
        } else {
            out.push_str(word);
        }
        out.push(' ');
    }
    out.trim_end().to_string()
}

fn redact_url_to_host(url: &str) -> String {
    let without_scheme = url.splitn(2, "://").nth(1).unwrap_or(url);
    let host = without_scheme
        .split('/')
        .next()
        .unwrap_or("")
        .split('@')
        .next_back()
        .unwrap_or("");
    if host.is_empty() {
        "[REDACTED_URL]".to_string()
    } else {
        format!("https://{host}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_absolute_paths_and_credentials() {
        let msg = "failed reading /etc/secrets/token with password=hunter2";
        let redacted = redact_message(msg);
        assert!(!redacted.contains("/etc/secrets"));
        assert!(!redacted.contains("hunter2"));
    }
}
