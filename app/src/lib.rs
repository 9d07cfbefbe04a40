//! Composition root: owns the configuration source, the upstream fleet, the
//! aggregating router, and the (always-constructed, possibly bypassed)
//! authorization store, and wires them into the inbound transports.

pub mod cli;
pub mod health;
pub mod inbound;

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use mcp_aggregator_auth::{AuthConfig, AuthState};
use mcp_aggregator_core::notify_bus::NotifyBus;
use mcp_aggregator_core::router::Router;
use mcp_aggregator_core::upstream::UpstreamManager;

/// Everything a running proxy needs, shared behind `Arc` across every
/// inbound session and HTTP handler.
pub struct App {
    pub config_loaded: AtomicBool,
    pub upstreams: UpstreamManager,
    pub router: Arc<Router>,
    pub auth: Arc<AuthState>,
    pub auth_enabled: bool,
    pub health_info_level: String,
}

impl App {
    pub fn new(
        upstreams: UpstreamManager,
        router: Arc<Router>,
        auth: Arc<AuthState>,
        auth_enabled: bool,
        health_info_level: String,
    ) -> Self {
        Self {
            config_loaded: AtomicBool::new(false),
            upstreams,
            router,
            auth,
            auth_enabled,
            health_info_level,
        }
    }

    /// The tag universe exposed to unauthenticated callers when auth is
    /// disabled: every tag carried by any configured upstream.
    pub async fn config_tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self
            .upstreams
            .statuses()
            .await
            .into_iter()
            .flat_map(|s| s.tags)
            .collect();
        tags.sort();
        tags.dedup();
        tags
    }
}

pub fn auth_base_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("mcp-aggregator")
        .join("auth")
}

pub fn build_auth_state(
    all_tags: Vec<String>,
    config: AuthConfig,
) -> std::io::Result<Arc<AuthState>> {
    Ok(Arc::new(AuthState::new(auth_base_dir(), all_tags, config)?))
}

pub fn build_router(
    upstreams: UpstreamManager,
    bus: NotifyBus,
    coalesce_window: std::time::Duration,
) -> Arc<Router> {
    Arc::new(Router::new(upstreams, bus).with_coalesce_window(coalesce_window))
}
