//! Upstream connection manager: drives each configured upstream through its
//! lifecycle state machine and exposes the set of currently Ready clients.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rmcp::model::{
    CancelledNotificationParam, CreateElicitationRequestParam, CreateElicitationResult,
    CreateMessageRequestParam, CreateMessageResult, ErrorData as McpError, ListRootsResult,
    LoggingMessageNotificationParam, ProgressNotificationParam, ResourceUpdatedNotificationParam,
    ServerCapabilities,
};
use rmcp::service::{NotificationContext, RequestContext, RunningService};
use rmcp::transport::sse_client::SseClientConfig;
use rmcp::transport::streamable_http_client::StreamableHttpClientTransportConfig;
use rmcp::transport::{SseClientTransport, StreamableHttpClientTransport, TokioChildProcess};
use rmcp::{ClientHandler, RoleClient, ServiceError, ServiceExt};
use tokio::process::Command;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;

use crate::client_tokens::{ClientTokenStore, StoredClientToken};
use crate::config::{UpstreamDef, UpstreamKind};
use crate::errors::UpstreamError;
use crate::notify_bus::NotifyBus;

pub type ClientService = RunningService<RoleClient, UpstreamClientHandler>;

/// Bridges upstream→client reverse requests and notifications back to
/// whichever inbound session is currently bound to this upstream, via the
/// shared [`NotifyBus`] rather than a direct reference to a session task.
#[derive(Clone)]
pub struct UpstreamClientHandler {
    name: String,
    tags: Vec<String>,
    bus: NotifyBus,
}

impl UpstreamClientHandler {
    fn new(name: String, tags: Vec<String>, bus: NotifyBus) -> Self {
        Self { name, tags, bus }
    }

    async fn bound_peer(&self) -> Result<rmcp::service::Peer<rmcp::RoleServer>, McpError> {
        self.bus
            .pick_peer(&self.name, &self.tags)
            .await
            .ok_or_else(|| {
                McpError::new(
                    rmcp::model::ErrorCode::METHOD_NOT_FOUND,
                    format!("no inbound session is bound to upstream `{}`", self.name),
                    None,
                )
            })
    }
}

fn map_service_error(e: ServiceError) -> McpError {
    match e {
        ServiceError::McpError(e) => e,
        other => McpError::new(rmcp::model::ErrorCode::INTERNAL_ERROR, other.to_string(), None),
    }
}

impl ClientHandler for UpstreamClientHandler {
    async fn create_message(
        &self,
        params: CreateMessageRequestParam,
        _context: RequestContext<RoleClient>,
    ) -> Result<CreateMessageResult, McpError> {
        self.bound_peer()
            .await?
            .create_message(params)
            .await
            .map_err(map_service_error)
    }

    async fn create_elicitation(
        &self,
        params: CreateElicitationRequestParam,
        _context: RequestContext<RoleClient>,
    ) -> Result<CreateElicitationResult, McpError> {
        self.bound_peer()
            .await?
            .create_elicitation(params)
            .await
            .map_err(map_service_error)
    }

    async fn list_roots(
        &self,
        _context: RequestContext<RoleClient>,
    ) -> Result<ListRootsResult, McpError> {
        self.bound_peer()
            .await?
            .list_roots()
            .await
            .map_err(map_service_error)
    }

    async fn on_cancelled(
        &self,
        params: CancelledNotificationParam,
        _context: NotificationContext<RoleClient>,
    ) {
        tracing::debug!(target: "router", server = %self.name, "forwarding cancelled notification");
        self.bus
            .for_each_admitting(&self.tags, |peer| {
                let params = params.clone();
                async move {
                    let _ = peer.notify_cancelled(params).await;
                }
            })
            .await;
    }

    async fn on_progress(
        &self,
        params: ProgressNotificationParam,
        _context: NotificationContext<RoleClient>,
    ) {
        tracing::debug!(target: "router", server = %self.name, "forwarding progress notification");
        self.bus
            .for_each_admitting(&self.tags, |peer| {
                let params = params.clone();
                async move {
                    let _ = peer.notify_progress(params).await;
                }
            })
            .await;
    }

    async fn on_logging_message(
        &self,
        params: LoggingMessageNotificationParam,
        _context: NotificationContext<RoleClient>,
    ) {
        tracing::debug!(target: "router", server = %self.name, "forwarding logging message notification");
        self.bus
            .for_each_admitting(&self.tags, |peer| {
                let params = params.clone();
                async move {
                    let _ = peer.notify_logging_message(params).await;
                }
            })
            .await;
    }

    async fn on_resource_updated(
        &self,
        params: ResourceUpdatedNotificationParam,
        _context: NotificationContext<RoleClient>,
    ) {
        tracing::debug!(target: "router", server = %self.name, "forwarding resource updated notification");
        self.bus
            .for_each_admitting(&self.tags, |peer| {
                let params = params.clone();
                async move {
                    let _ = peer.notify_resource_updated(params).await;
                }
            })
            .await;
    }

    async fn on_tool_list_changed(&self, _context: NotificationContext<RoleClient>) {
        self.bus
            .for_each_admitting(&self.tags, |peer| async move {
                let _ = peer.notify_tool_list_changed().await;
            })
            .await;
    }

    async fn on_prompt_list_changed(&self, _context: NotificationContext<RoleClient>) {
        self.bus
            .for_each_admitting(&self.tags, |peer| async move {
                let _ = peer.notify_prompt_list_changed().await;
            })
            .await;
    }

    async fn on_resource_list_changed(&self, _context: NotificationContext<RoleClient>) {
        self.bus
            .for_each_admitting(&self.tags, |peer| async move {
                let _ = peer.notify_resource_list_changed().await;
            })
            .await;
    }
}

/// A live handshake with a remote MCP server.
pub struct ReadyClient {
    pub id: u64,
    pub service: Arc<ClientService>,
    pub capabilities: Option<ServerCapabilities>,
    pub protocol_version: String,
    pub server_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadingState {
    Pending,
    Loading,
    AwaitingOAuth { authorization_url: String },
    Ready,
    Failed { cause: String },
    Cancelled,
}

impl LoadingState {
    pub fn label(&self) -> &'static str {
        match self {
            LoadingState::Pending => "pending",
            LoadingState::Loading => "loading",
            LoadingState::AwaitingOAuth { .. } => "awaiting_oauth",
            LoadingState::Ready => "ready",
            LoadingState::Failed { .. } => "failed",
            LoadingState::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone)]
pub struct UpstreamStatus {
    pub name: String,
    pub state: LoadingState,
    pub retry_count: u32,
    pub restart_count: u32,
    pub updated_at: Instant,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct StateChange {
    pub name: String,
    pub state: LoadingState,
    pub tags: Vec<String>,
}

/// Aggregate counts reported on health endpoints.
#[derive(Debug, Clone, Default)]
pub struct Summary {
    pub total: usize,
    pub ready: usize,
    pub loading: usize,
    pub failed: usize,
    pub awaiting_oauth: usize,
    pub cancelled: usize,
}

static NEXT_CLIENT_ID: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);

struct UpstreamSlot {
    def: UpstreamDef,
    status: UpstreamStatus,
    client: Option<Arc<ReadyClient>>,
    worker: Option<JoinHandle<()>>,
}

/// Owns the lifecycle of every configured upstream. Cheap to clone; internal
/// state is behind an `Arc`.
#[derive(Clone)]
pub struct UpstreamManager {
    inner: Arc<Inner>,
}

struct Inner {
    slots: RwLock<HashMap<String, UpstreamSlot>>,
    events_tx: broadcast::Sender<StateChange>,
    own_identity: String,
    connect_retry_max: u32,
    connect_retry_base_delay: Duration,
    bus: NotifyBus,
    token_store: Option<ClientTokenStore>,
}

impl UpstreamManager {
    pub fn new(own_identity: impl Into<String>, bus: NotifyBus) -> Self {
        let (events_tx, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(Inner {
                slots: RwLock::new(HashMap::new()),
                events_tx,
                own_identity: own_identity.into(),
                connect_retry_max: 5,
                connect_retry_base_delay: Duration::from_millis(200),
                bus,
                token_store: None,
            }),
        }
    }

    /// Attaches the per-upstream OAuth client token store (`clientSessions/
    /// oauth_<server>.json` under the config directory). Call before
    /// `start()` so the first connect attempt can see a pre-provisioned
    /// token.
    pub fn with_token_store(mut self, store: ClientTokenStore) -> Self {
        Arc::get_mut(&mut self.inner)
            .expect("with_token_store must run before the manager is cloned")
            .token_store = Some(store);
        self
    }

    /// Overrides the connect-retry budget (max attempts and base backoff
    /// delay). Call before `start()`. Exposed mainly so tests don't have to
    /// wait out the production backoff schedule to observe `Failed`.
    #[cfg(test)]
    fn with_connect_retry(mut self, max: u32, base_delay: Duration) -> Self {
        let inner = Arc::get_mut(&mut self.inner)
            .expect("with_connect_retry must run before the manager is cloned");
        inner.connect_retry_max = max;
        inner.connect_retry_base_delay = base_delay;
        self
    }

    pub fn events(&self) -> broadcast::Receiver<StateChange> {
        self.inner.events_tx.subscribe()
    }

    /// Adds upstreams and starts their worker tasks; idempotent per name.
    pub async fn start(&self, defs: Vec<UpstreamDef>) {
        for def in defs {
            self.spawn_upstream(def).await;
        }
    }

    async fn spawn_upstream(&self, def: UpstreamDef) {
        let name = def.name.clone();
        {
            let mut slots = self.inner.slots.write().await;
            if slots.contains_key(&name) {
                return;
            }
            slots.insert(
                name.clone(),
                UpstreamSlot {
                    def: def.clone(),
                    status: UpstreamStatus {
                        name: name.clone(),
                        state: LoadingState::Pending,
                        retry_count: 0,
                        restart_count: 0,
                        updated_at: Instant::now(),
                        tags: def.tags.clone(),
                    },
                    client: None,
                    worker: None,
                },
            );
        }
        if def.disabled {
            return;
        }
        let this = self.clone();
        let handle = tokio::spawn(async move { this.run_worker(def).await });
        let mut slots = self.inner.slots.write().await;
        if let Some(slot) = slots.get_mut(&name) {
            slot.worker = Some(handle);
        }
    }

    async fn run_worker(&self, def: UpstreamDef) {
        let mut attempt: u32 = 0;
        loop {
            self.set_state(&def.name, LoadingState::Loading).await;
            match connect_upstream(&def, self.inner.bus.clone(), self.inner.token_store.as_ref())
                .await
            {
                Ok((service, capabilities, protocol_version, server_name)) => {
                    if server_name == self.inner.own_identity {
                        self.set_state(
                            &def.name,
                            LoadingState::Failed {
                                cause: UpstreamError::CircularDependency.to_string(),
                            },
                        )
                        .await;
                        return;
                    }
                    let ready = ReadyClient {
                        id: NEXT_CLIENT_ID.fetch_add(1, std::sync::atomic::Ordering::Relaxed),
                        service: Arc::new(service),
                        capabilities,
                        protocol_version,
                        server_name,
                    };
                    {
                        let mut slots = self.inner.slots.write().await;
                        if let Some(slot) = slots.get_mut(&def.name) {
                            slot.client = Some(Arc::new(ready));
                            slot.status.retry_count = 0;
                        }
                    }
                    self.set_state(&def.name, LoadingState::Ready).await;
                    attempt = 0;

                    // Wait for the transport to close (cancellation, crash).
                    let client = {
                        let slots = self.inner.slots.read().await;
                        slots.get(&def.name).and_then(|s| s.client.clone())
                    };
                    if let Some(client) = client {
                        client.service.waiting().await.ok();
                    }
                    {
                        let mut slots = self.inner.slots.write().await;
                        if let Some(slot) = slots.get_mut(&def.name) {
                            slot.client = None;
                        }
                    }

                    if def.restart_policy.on_exit
                        && self.restart_budget_remains(&def.name, &def.restart_policy).await
                    {
                        self.bump_restart_count(&def.name).await;
                        tokio::time::sleep(Duration::from_millis(def.restart_policy.delay_ms))
                            .await;
                        continue;
                    } else {
                        self.set_state(
                            &def.name,
                            LoadingState::Failed {
                                cause: "upstream closed and restart policy exhausted".into(),
                            },
                        )
                        .await;
                        return;
                    }
                }
                Err(UpstreamError::Unauthorized { authorization_url }) => {
                    self.set_state(
                        &def.name,
                        LoadingState::AwaitingOAuth { authorization_url },
                    )
                    .await;
                    return;
                }
                Err(e) => {
                    attempt += 1;
                    if attempt > self.inner.connect_retry_max {
                        self.set_state(
                            &def.name,
                            LoadingState::Failed { cause: e.to_string() },
                        )
                        .await;
                        return;
                    }
                    self.bump_retry_count(&def.name).await;
                    let backoff = self.inner.connect_retry_base_delay * 2u32.pow(attempt - 1);
                    let jitter = Duration::from_millis(rand_jitter_ms(backoff.as_millis() as u64));
                    tokio::time::sleep(backoff + jitter).await;
                    continue;
                }
            }
        }
    }

    async fn restart_budget_remains(&self, name: &str, policy: &crate::config::RestartPolicy) -> bool {
        let slots = self.inner.slots.read().await;
        match (policy.max_restarts, slots.get(name)) {
            (None, _) => true,
            (Some(max), Some(slot)) => slot.status.restart_count < max,
            (Some(_), None) => false,
        }
    }

    async fn bump_restart_count(&self, name: &str) {
        let mut slots = self.inner.slots.write().await;
        if let Some(slot) = slots.get_mut(name) {
            slot.status.restart_count += 1;
        }
    }

    async fn bump_retry_count(&self, name: &str) {
        let mut slots = self.inner.slots.write().await;
        if let Some(slot) = slots.get_mut(name) {
            slot.status.retry_count += 1;
        }
    }

    async fn set_state(&self, name: &str, state: LoadingState) {
        let tags = {
            let mut slots = self.inner.slots.write().await;
            if let Some(slot) = slots.get_mut(name) {
                slot.status.state = state.clone();
                slot.status.updated_at = Instant::now();
                slot.status.tags.clone()
            } else {
                Vec::new()
            }
        };
        let _ = self.inner.events_tx.send(StateChange {
            name: name.to_string(),
            state,
            tags,
        });
    }

    pub async fn ready_clients(&self) -> HashMap<String, Arc<ReadyClient>> {
        let slots = self.inner.slots.read().await;
        slots
            .iter()
            .filter_map(|(name, slot)| slot.client.clone().map(|c| (name.clone(), c)))
            .collect()
    }

    pub async fn statuses(&self) -> Vec<UpstreamStatus> {
        let slots = self.inner.slots.read().await;
        slots.values().map(|s| s.status.clone()).collect()
    }

    pub async fn summary(&self) -> Summary {
        let slots = self.inner.slots.read().await;
        let mut s = Summary::default();
        for slot in slots.values() {
            s.total += 1;
            match &slot.status.state {
                LoadingState::Ready => s.ready += 1,
                LoadingState::Loading | LoadingState::Pending => s.loading += 1,
                LoadingState::Failed { .. } => s.failed += 1,
                LoadingState::AwaitingOAuth { .. } => s.awaiting_oauth += 1,
                LoadingState::Cancelled => s.cancelled += 1,
            }
        }
        s
    }

    /// Persists a freshly obtained bearer token for `name` so the next
    /// (re)connect picks it up via [`apply_client_token`]. Called from the
    /// `/oauth/callback/{upstream}` route once the external authorization
    /// flow hands back a token.
    pub fn store_client_token(&self, name: &str, access_token: &str) {
        if let Some(store) = &self.inner.token_store {
            let _ = store.store(
                name,
                &StoredClientToken {
                    access_token: access_token.to_string(),
                    obtained_at: epoch_now(),
                },
            );
        }
    }

    pub async fn oauth_completed(&self, name: &str) {
        let was_awaiting = {
            let slots = self.inner.slots.read().await;
            matches!(
                slots.get(name).map(|s| &s.status.state),
                Some(LoadingState::AwaitingOAuth { .. })
            )
        };
        if !was_awaiting {
            return;
        }
        let def = {
            let slots = self.inner.slots.read().await;
            slots.get(name).map(|s| s.def.clone())
        };
        if let Some(def) = def {
            let this = self.clone();
            let handle = tokio::spawn(async move { this.run_worker(def).await });
            let mut slots = self.inner.slots.write().await;
            if let Some(slot) = slots.get_mut(name) {
                slot.worker = Some(handle);
            }
        }
    }

    /// Adds, removes, and restarts upstreams per a config diff. Removed
    /// upstreams are cancelled and their clients drained.
    pub async fn reconfigure(&self, diff: crate::config::ConfigDiff) {
        for name in diff.removed {
            self.cancel(&name).await;
        }
        for def in diff.added {
            self.spawn_upstream(def).await;
        }
        for def in diff.changed {
            self.cancel(&def.name).await;
            self.spawn_upstream(def).await;
        }
    }

    async fn cancel(&self, name: &str) {
        let worker = {
            let mut slots = self.inner.slots.write().await;
            if let Some(slot) = slots.get_mut(name) {
                slot.client = None;
                slot.worker.take()
            } else {
                None
            }
        };
        if let Some(handle) = worker {
            handle.abort();
        }
        self.set_state(name, LoadingState::Cancelled).await;
        let mut slots = self.inner.slots.write().await;
        slots.remove(name);
    }

    pub async fn shutdown(&self) {
        let names: Vec<String> = {
            let slots = self.inner.slots.read().await;
            slots.keys().cloned().collect()
        };
        for name in names {
            self.cancel(&name).await;
        }
    }
}

fn rand_jitter_ms(scale: u64) -> u64 {
    // A small, dependency-free jitter source: good enough to desynchronize
    // retries without pulling in a PRNG for one call site.
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0) as u64;
    nanos % (scale.max(1) / 4 + 1)
}

async fn connect_upstream(
    def: &UpstreamDef,
    bus: NotifyBus,
    token_store: Option<&ClientTokenStore>,
) -> Result<(ClientService, Option<ServerCapabilities>, String, String), UpstreamError> {
    let handler = UpstreamClientHandler::new(def.name.clone(), def.tags.clone(), bus);
    match def.kind {
        UpstreamKind::Stdio => {
            let command = def
                .command
                .as_ref()
                .ok_or_else(|| UpstreamError::Connect("missing command".into()))?;
            let mut cmd = Command::new(command);
            cmd.args(&def.args);
            cmd.envs(&def.env);
            if let Some(cwd) = &def.cwd {
                cmd.current_dir(cwd);
            }
            let transport = TokioChildProcess::new(cmd)
                .map_err(|e| UpstreamError::Connect(e.to_string()))?;
            let service = handler
                .serve(transport)
                .await
                .map_err(|e| UpstreamError::Connect(e.to_string()))?;
            let info = service.peer_info();
            let (caps, proto, name) = extract_identity(info);
            Ok((service, caps, proto, name))
        }
        UpstreamKind::Http => {
            let url = def
                .url
                .as_ref()
                .ok_or_else(|| UpstreamError::Connect("missing url".into()))?;
            let mut headers = default_headers(&def.headers)?;
            apply_client_token(&mut headers, def, token_store)?;
            let client = reqwest::Client::builder()
                .default_headers(headers)
                .build()
                .map_err(|e| UpstreamError::Connect(e.to_string()))?;
            let transport = StreamableHttpClientTransport::with_client(
                client,
                StreamableHttpClientTransportConfig::with_uri(url.clone()),
            );
            let service = handler
                .serve(transport)
                .await
                .map_err(|e| classify_connect_error(e))?;
            let info = service.peer_info();
            let (caps, proto, name) = extract_identity(info);
            Ok((service, caps, proto, name))
        }
        UpstreamKind::Sse => {
            let url = def
                .url
                .as_ref()
                .ok_or_else(|| UpstreamError::Connect("missing url".into()))?;
            let mut headers = default_headers(&def.headers)?;
            apply_client_token(&mut headers, def, token_store)?;
            let client = reqwest::Client::builder()
                .default_headers(headers)
                .build()
                .map_err(|e| UpstreamError::Connect(e.to_string()))?;
            let transport = SseClientTransport::start_with_client(
                client,
                SseClientConfig {
                    sse_endpoint: url.clone().into(),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| UpstreamError::Connect(e.to_string()))?;
            let service = handler
                .serve(transport)
                .await
                .map_err(|e| UpstreamError::Connect(e.to_string()))?;
            let info = service.peer_info();
            let (caps, proto, name) = extract_identity(info);
            Ok((service, caps, proto, name))
        }
    }
}

/// Injects a bearer token into `headers` for upstreams that carry OAuth
/// hints, unless the config already set an explicit `Authorization` header.
/// Prefers a previously stored token (e.g. rotated via the callback); falls
/// back to bootstrapping one from the configured client secret on first
/// connect, persisting it so subsequent restarts reuse the same value
/// without re-reading the config.
fn apply_client_token(
    headers: &mut reqwest::header::HeaderMap,
    def: &UpstreamDef,
    token_store: Option<&ClientTokenStore>,
) -> Result<(), UpstreamError> {
    if headers.contains_key(reqwest::header::AUTHORIZATION) {
        return Ok(());
    }
    let Some(store) = token_store else { return Ok(()) };
    let token = match store.load(&def.name) {
        Some(stored) => Some(stored.access_token),
        None => match def.oauth.as_ref().and_then(|o| o.client_secret.clone()) {
            Some(bootstrap) => {
                let _ = store.store(
                    &def.name,
                    &StoredClientToken {
                        access_token: bootstrap.clone(),
                        obtained_at: epoch_now(),
                    },
                );
                Some(bootstrap)
            }
            None => None,
        },
    };
    if let Some(token) = token {
        let value = reqwest::header::HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|_| UpstreamError::Connect("invalid stored client token".into()))?;
        headers.insert(reqwest::header::AUTHORIZATION, value);
    }
    Ok(())
}

fn epoch_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn default_headers(headers: &HashMap<String, String>) -> Result<reqwest::header::HeaderMap, UpstreamError> {
    let mut map = reqwest::header::HeaderMap::new();
    for (k, v) in headers {
        let name = reqwest::header::HeaderName::from_bytes(k.as_bytes())
            .map_err(|_| UpstreamError::Connect(format!("invalid header name {k}")))?;
        let val = reqwest::header::HeaderValue::from_str(v)
            .map_err(|_| UpstreamError::Connect(format!("invalid header value for {k}")))?;
        map.insert(name, val);
    }
    Ok(map)
}

fn classify_connect_error<E: std::fmt::Display>(e: E) -> UpstreamError {
    let msg = e.to_string();
    if msg.contains("401") || msg.to_ascii_lowercase().contains("unauthorized") {
        UpstreamError::Unauthorized {
            authorization_url: String::new(),
        }
    } else {
        UpstreamError::Connect(msg)
    }
}

fn extract_identity(
    info: Option<&rmcp::model::InitializeResult>,
) -> (Option<ServerCapabilities>, String, String) {
    match info {
        Some(init) => (
            Some(init.capabilities.clone()),
            init.protocol_version.to_string(),
            init.server_info.name.clone(),
        ),
        None => (None, String::new(), String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RestartPolicy;

    fn def(name: &str) -> UpstreamDef {
        UpstreamDef {
            name: name.to_string(),
            kind: UpstreamKind::Stdio,
            command: Some("does-not-exist-binary".to_string()),
            args: vec![],
            env: Default::default(),
            cwd: None,
            url: None,
            headers: Default::default(),
            timeout: None,
            tags: vec!["t".to_string()],
            disabled: false,
            restart_policy: RestartPolicy::default(),
            oauth: None,
        }
    }

    #[tokio::test]
    async fn nonexistent_binary_eventually_fails_without_blocking_others() {
        // A nonexistent binary fails `spawn` immediately each attempt, so the
        // time to exhaust the retry budget is the sum of backoffs. Use a
        // small budget here so the test doesn't have to wait out the
        // production schedule (5 attempts at a 200ms base would need 6s+ —
        // see the sibling `app/tests/availability_gate.rs` for that case).
        let mgr = UpstreamManager::new("proxy-under-test", NotifyBus::new())
            .with_connect_retry(2, Duration::from_millis(20));
        mgr.start(vec![def("a"), def("b")]).await;
        let mut attempts = 0;
        loop {
            let statuses = mgr.statuses().await;
            let done = statuses
                .iter()
                .all(|s| matches!(s.state, LoadingState::Failed { .. }));
            if done || attempts > 100 {
                assert!(done, "expected both upstreams to reach Failed");
                break;
            }
            attempts += 1;
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    #[tokio::test]
    async fn summary_counts_match_statuses() {
        let mgr = UpstreamManager::new("proxy-under-test", NotifyBus::new());
        mgr.start(vec![def("a")]).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let summary = mgr.summary().await;
        assert_eq!(summary.total, 1);
    }
}
