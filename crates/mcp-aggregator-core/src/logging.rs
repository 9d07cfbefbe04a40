//! Structured request/response logging. Unlike the lineage this crate is
//! descended from, events are never persisted (the proxy does not keep
//! request history) — they are emitted through `tracing` only, at the
//! `"rpc"` target, for whoever configured a subscriber to pick up.

use std::sync::atomic::{AtomicI64, Ordering};

use serde_json::Value as JsonValue;

/// A single RPC call's lifecycle, from dispatch to response.
#[derive(Debug, Clone)]
pub struct Event {
    pub ts_ms: i64,
    pub session_id: String,
    pub method: String,
    pub upstream: Option<String>,
    pub duration_ms: Option<i64>,
    pub ok: bool,
    pub error: Option<String>,
}

impl Event {
    pub fn new(method: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            ts_ms: now_millis(),
            session_id: session_id.into(),
            method: method.into(),
            upstream: None,
            duration_ms: None,
            ok: true,
            error: None,
        }
    }

    pub fn emit(&self) {
        if self.ok {
            tracing::info!(
                target: "rpc",
                session_id = %self.session_id,
                method = %self.method,
                upstream = self.upstream.as_deref().unwrap_or(""),
                duration_ms = self.duration_ms.unwrap_or(-1),
                "rpc_ok"
            );
        } else {
            tracing::warn!(
                target: "rpc",
                session_id = %self.session_id,
                method = %self.method,
                upstream = self.upstream.as_deref().unwrap_or(""),
                duration_ms = self.duration_ms.unwrap_or(-1),
                error = self.error.as_deref().unwrap_or(""),
                "rpc_error"
            );
        }
    }
}

// Monotonic-ish millisecond clock so events emitted in the same tick still
// sort in issue order.
static LAST_MS: AtomicI64 = AtomicI64::new(0);
pub fn now_millis() -> i64 {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64;
    loop {
        let prev = LAST_MS.load(Ordering::Relaxed);
        let next = if now > prev { now } else { prev + 1 };
        if LAST_MS
            .compare_exchange(prev, next, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            return next;
        }
    }
}

/// Redacts well-known sensitive keys before a JSON payload is logged.
pub fn redact_json(mut v: JsonValue, keys_lc: &[String]) -> JsonValue {
    fn rec(v: &mut JsonValue, keys_lc: &[String]) {
        match v {
            JsonValue::Object(map) => {
                for (k, val) in map.iter_mut() {
                    if keys_lc.iter().any(|x| x == &k.to_lowercase()) {
                        *val = JsonValue::String("[REDACTED_CREDENTIAL]".to_string());
                    } else {
                        rec(val, keys_lc);
                    }
                }
            }
            JsonValue::Array(arr) => {
                for item in arr.iter_mut() {
                    rec(item, keys_lc);
                }
            }
            _ => {}
        }
    }
    rec(&mut v, keys_lc);
    v
}

pub fn default_redact_keys() -> Vec<String> {
    vec![
        "authorization".into(),
        "token".into(),
        "password".into(),
        "secret".into(),
        "api_key".into(),
        "access_token".into(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_is_strictly_increasing() {
        let a = now_millis();
        let b = now_millis();
        assert!(b >= a);
    }

    #[test]
    fn redact_masks_keys_recursively() {
        let v = serde_json::json!({"Authorization": "Bearer x", "nested": {"password": "p"}});
        let out = redact_json(v, &default_redact_keys());
        let s = out.to_string();
        assert!(!s.contains("Bearer x"));
        assert!(!s.contains("\"p\""));
    }
}
