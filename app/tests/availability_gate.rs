//! Drives the real streamable-HTTP inbound handler with a fleet that never
//! comes up, over a loopback listener, to exercise the availability gate's
//! "no upstreams available" path the way a deployed proxy would see it.

use std::sync::Arc;

use mcp_aggregator::{build_auth_state, App};
use mcp_aggregator_auth::AuthConfig;
use mcp_aggregator_core::config::{OAuthHints, RestartPolicy, UpstreamDef, UpstreamKind};
use mcp_aggregator_core::notify_bus::NotifyBus;
use mcp_aggregator_core::router::Router;
use mcp_aggregator_core::upstream::UpstreamManager;
use serde_json::{json, Value};

fn doomed_upstream(name: &str) -> UpstreamDef {
    UpstreamDef {
        name: name.to_string(),
        kind: UpstreamKind::Stdio,
        command: Some("mcp-aggregator-test-binary-that-does-not-exist".to_string()),
        args: vec![],
        env: Default::default(),
        cwd: None,
        url: None,
        headers: Default::default(),
        timeout: None,
        tags: vec![],
        disabled: false,
        restart_policy: RestartPolicy::default(),
        oauth: None::<OAuthHints>,
    }
}

async fn spawn_app(upstreams: Vec<UpstreamDef>) -> std::net::SocketAddr {
    let bus = NotifyBus::new();
    let mgr = UpstreamManager::new("proxy-under-test", bus.clone());
    mgr.start(upstreams).await;

    // Each doomed upstream retries its spawn failure through exponential backoff
    // (5 attempts, 200ms base delay) before settling in Failed, which can take
    // upwards of 6-7 seconds; poll well past that worst case.
    for _ in 0..200 {
        let statuses = mgr.statuses().await;
        if !statuses.is_empty()
            && statuses
                .iter()
                .all(|s| matches!(s.state, mcp_aggregator_core::upstream::LoadingState::Failed { .. }))
        {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }

    let router = Arc::new(Router::new(mgr.clone(), bus));
    let auth = build_auth_state(vec![], AuthConfig::default()).unwrap();
    let app = Arc::new(App::new(mgr, router, auth, false, "basic".to_string()));
    app.config_loaded.store(true, std::sync::atomic::Ordering::Relaxed);

    let axum_router = mcp_aggregator::inbound::http::router(app.clone())
        .merge(mcp_aggregator::health::router(app));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            axum_router.into_make_service_with_connect_info::<std::net::SocketAddr>(),
        )
        .await
        .unwrap();
    });
    addr
}

#[tokio::test]
async fn no_upstreams_available_returns_503_with_sanitized_details() {
    let addr = spawn_app(vec![doomed_upstream("crashy")]).await;
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("http://{addr}/mcp"))
        .json(&json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "service_unavailable");
    assert_eq!(body["details"]["total"], 1);
    assert_eq!(body["details"]["available"], 0);
    assert_eq!(body["details"]["failed"], 1);
    let details = body["serverDetails"].as_array().unwrap();
    assert_eq!(details.len(), 1);
    assert_eq!(details[0]["name"], "crashy");
    assert_eq!(details[0]["state"], "failed");
}

#[tokio::test]
async fn empty_fleet_proceeds_with_empty_tool_list() {
    let addr = spawn_app(vec![]).await;
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("http://{addr}/mcp"))
        .json(&json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["result"]["tools"], json!([]));
}

#[tokio::test]
async fn liveness_and_readiness_are_independent_of_upstream_state() {
    let addr = spawn_app(vec![doomed_upstream("crashy")]).await;
    let client = reqwest::Client::new();
    let live = client
        .get(format!("http://{addr}/health/live"))
        .send()
        .await
        .unwrap();
    assert_eq!(live.status(), reqwest::StatusCode::OK);

    let ready = client
        .get(format!("http://{addr}/health/ready"))
        .send()
        .await
        .unwrap();
    assert_eq!(ready.status(), reqwest::StatusCode::OK);

    let health: Value = client
        .get(format!("http://{addr}/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "degraded");
    assert_eq!(health["failed"], 1);
}
