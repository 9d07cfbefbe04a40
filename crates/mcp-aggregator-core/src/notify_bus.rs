//! Breaks the inbound-session / upstream-worker reference cycle for
//! reverse-direction server→client requests (`sampling/createMessage`,
//! `elicitation/elicit`, `roots/list`) and for upstream→client notifications.
//! Upstream workers publish onto the bus; session tasks subscribe and filter
//! by their own binding policy. No direct reference from upstream to session
//! is ever held.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use rmcp::service::Peer;
use rmcp::RoleServer;
use serde_json::Value as JsonValue;
use tokio::sync::{broadcast, Mutex, RwLock};

use crate::session::InboundSession;

#[derive(Debug, Clone)]
pub struct UpstreamNotification {
    pub upstream: String,
    pub method: String,
    pub params: JsonValue,
}

struct PeerEntry {
    peer: Peer<RoleServer>,
    session: InboundSession,
}

/// Decouples upstream workers from inbound session tasks for upstream→client
/// notification delivery and server→client reverse requests. Upstream
/// workers never hold a reference to a session task; they look up a cloneable
/// `Peer<RoleServer>` handle here, keyed by the binding policy.
#[derive(Clone)]
pub struct NotifyBus {
    notifications: broadcast::Sender<UpstreamNotification>,
    peers: Arc<RwLock<HashMap<String, PeerEntry>>>,
    binding: Arc<Mutex<BindingPolicy>>,
}

impl NotifyBus {
    pub fn new() -> Self {
        let (notifications, _) = broadcast::channel(1024);
        Self {
            notifications,
            peers: Arc::new(RwLock::new(HashMap::new())),
            binding: Arc::new(Mutex::new(BindingPolicy::default())),
        }
    }

    pub fn publish_notification(&self, n: UpstreamNotification) {
        let _ = self.notifications.send(n);
    }

    pub fn subscribe_notifications(&self) -> broadcast::Receiver<UpstreamNotification> {
        self.notifications.subscribe()
    }

    /// Registers (or refreshes) the peer handle for an inbound session so
    /// upstream workers can reach it. Called on every request the session
    /// makes, since the `Peer` is cheap to clone and sessions have no
    /// explicit "hello" step on every transport.
    pub async fn register_peer(&self, peer: Peer<RoleServer>, session: InboundSession) {
        self.peers
            .write()
            .await
            .insert(session.session_id.clone(), PeerEntry { peer, session });
    }

    pub async fn unregister_peer(&self, session_id: &str) {
        self.peers.write().await.remove(session_id);
        self.binding.lock().await.forget(session_id);
    }

    pub async fn record_touch(&self, upstream: &str, session_id: &str) {
        self.binding.lock().await.record_touch(upstream, session_id);
    }

    async fn admitting(&self, upstream_tags: &[String]) -> Vec<(String, Peer<RoleServer>, Instant)> {
        self.peers
            .read()
            .await
            .values()
            .filter(|e| e.session.admits(upstream_tags))
            .map(|e| (e.session.session_id.clone(), e.peer.clone(), e.session.created_at))
            .collect()
    }

    /// Picks exactly one inbound session to service a reverse-direction
    /// request from `upstream`: the session that most recently touched it,
    /// otherwise the oldest session admitting it.
    pub async fn pick_peer(&self, upstream: &str, upstream_tags: &[String]) -> Option<Peer<RoleServer>> {
        let candidates = self.admitting(upstream_tags).await;
        if candidates.is_empty() {
            return None;
        }
        let times: Vec<(String, Instant)> = candidates
            .iter()
            .map(|(sid, _, created_at)| (sid.clone(), *created_at))
            .collect();
        let picked_sid = {
            let binding = self.binding.lock().await;
            binding.pick(upstream, &times).map(|s| s.to_string())
        }?;
        candidates
            .into_iter()
            .find(|(sid, _, _)| *sid == picked_sid)
            .map(|(_, peer, _)| peer)
    }

    /// Runs `f` against every admitted session's peer, best-effort.
    pub async fn for_each_admitting<F, Fut>(&self, upstream_tags: &[String], f: F)
    where
        F: Fn(Peer<RoleServer>) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        for (_, peer, _) in self.admitting(upstream_tags).await {
            f(peer).await;
        }
    }
}

impl Default for NotifyBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks, per upstream, which inbound session last touched it, to implement
/// the reverse-direction binding policy: "most recently touched session;
/// otherwise the oldest session admitting the upstream."
#[derive(Default)]
pub struct BindingPolicy {
    last_touch: std::collections::HashMap<String, String>,
}

impl BindingPolicy {
    pub fn record_touch(&mut self, upstream: &str, session_id: &str) {
        self.last_touch
            .insert(upstream.to_string(), session_id.to_string());
    }

    /// Clears any "last touched" bindings pointing at a session that has
    /// disconnected, so a stale session id is never picked.
    pub fn forget(&mut self, session_id: &str) {
        self.last_touch.retain(|_, sid| sid != session_id);
    }

    pub fn pick<'a>(
        &self,
        upstream: &str,
        admitting_sessions: &'a [(String, std::time::Instant)],
    ) -> Option<&'a str> {
        if let Some(last) = self.last_touch.get(upstream)
            && let Some((sid, _)) = admitting_sessions.iter().find(|(s, _)| s == last)
        {
            return Some(sid.as_str());
        }
        admitting_sessions
            .iter()
            .min_by_key(|(_, created_at)| *created_at)
            .map(|(sid, _)| sid.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn picks_most_recently_touched_session_first() {
        let mut policy = BindingPolicy::default();
        policy.record_touch("math", "s2");
        let now = Instant::now();
        let sessions = vec![
            ("s1".to_string(), now),
            ("s2".to_string(), now + std::time::Duration::from_millis(1)),
        ];
        assert_eq!(policy.pick("math", &sessions), Some("s2"));
    }

    #[test]
    fn falls_back_to_oldest_session_when_no_touch_recorded() {
        let policy = BindingPolicy::default();
        let now = Instant::now();
        let sessions = vec![
            ("s1".to_string(), now),
            ("s2".to_string(), now + std::time::Duration::from_millis(1)),
        ];
        assert_eq!(policy.pick("math", &sessions), Some("s1"));
    }
}
