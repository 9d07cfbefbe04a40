//! Drives the real axum router end to end over a loopback listener: register a
//! client, run the authorization-code + PKCE dance, exchange the code, then
//! replay it to confirm the one-shot `invalid_grant` behavior.

use std::sync::Arc;

use base64::Engine;
use mcp_aggregator_auth::{router, AuthConfig, AuthState};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

async fn spawn_server(known_tags: Vec<String>) -> (std::net::SocketAddr, Arc<AuthState>) {
    let dir = std::env::temp_dir().join(format!(
        "mcp-aggregator-auth-e2e-{}-{}",
        std::process::id(),
        uuid::Uuid::new_v4()
    ));
    let state = Arc::new(AuthState::new(dir, known_tags, AuthConfig::default()).unwrap());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(state.clone()).into_make_service_with_connect_info::<std::net::SocketAddr>();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, state)
}

fn pkce_pair() -> (String, String) {
    let verifier = "test-verifier-0123456789abcdefghijklmno";
    let challenge = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .encode(Sha256::digest(verifier.as_bytes()));
    (verifier.to_string(), challenge)
}

#[tokio::test]
async fn code_exchange_then_replay_fails_with_invalid_grant() {
    let (addr, _state) = spawn_server(vec!["web".to_string()]).await;
    let base = format!("http://{addr}");
    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap();

    let register: Value = client
        .post(format!("{base}/register"))
        .json(&json!({"client_name": "test-client", "redirect_uris": ["https://client.example/cb"]}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let client_id = register["client_id"].as_str().unwrap().to_string();

    let (verifier, challenge) = pkce_pair();
    let resp = client
        .get(format!("{base}/authorize"))
        .query(&[
            ("client_id", client_id.as_str()),
            ("redirect_uri", "https://client.example/cb"),
            ("response_type", "code"),
            ("code_challenge", challenge.as_str()),
            ("code_challenge_method", "S256"),
            ("scope", "tag:web"),
            ("state", "xyz"),
        ])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::SEE_OTHER);
    let location = resp
        .headers()
        .get(reqwest::header::LOCATION)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    let parsed = url::Url::parse(&location).unwrap();
    let mut code = None;
    let mut state_param = None;
    for (k, v) in parsed.query_pairs() {
        match k.as_ref() {
            "code" => code = Some(v.to_string()),
            "state" => state_param = Some(v.to_string()),
            _ => {}
        }
    }
    assert_eq!(state_param.as_deref(), Some("xyz"));
    let code = code.expect("authorize redirect carries a code");

    let token: Value = client
        .post(format!("{base}/token"))
        .json(&json!({
            "grant_type": "authorization_code",
            "code": code,
            "client_id": client_id,
            "redirect_uri": "https://client.example/cb",
            "code_verifier": verifier,
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(token["token_type"], "Bearer");
    assert_eq!(token["scope"], "tag:web");
    assert!(token["access_token"].as_str().unwrap().starts_with("tkn_"));

    let replay: Value = client
        .post(format!("{base}/token"))
        .json(&json!({
            "grant_type": "authorization_code",
            "code": code,
            "client_id": client_id,
            "redirect_uri": "https://client.example/cb",
            "code_verifier": verifier,
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(replay["error"], "invalid_grant");
}

#[tokio::test]
async fn authorize_rejects_unknown_tag_scope() {
    let (addr, _state) = spawn_server(vec!["web".to_string()]).await;
    let base = format!("http://{addr}");
    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap();

    let register: Value = client
        .post(format!("{base}/register"))
        .json(&json!({"client_name": null, "redirect_uris": ["https://client.example/cb"]}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let client_id = register["client_id"].as_str().unwrap().to_string();

    let (_verifier, challenge) = pkce_pair();
    let resp = client
        .get(format!("{base}/authorize"))
        .query(&[
            ("client_id", client_id.as_str()),
            ("redirect_uri", "https://client.example/cb"),
            ("response_type", "code"),
            ("code_challenge", challenge.as_str()),
            ("code_challenge_method", "S256"),
            ("scope", "tag:db"),
        ])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "invalid_scope");
}
