use std::sync::atomic::Ordering;
use std::sync::Arc;

use clap::Parser;
use mcp_aggregator_auth::AuthConfig;
use mcp_aggregator_core::config::{load_snapshot, ConfigProvider, OsConfigProvider};
use mcp_aggregator_core::config_watch;
use mcp_aggregator_core::notify_bus::NotifyBus;
use mcp_aggregator_core::upstream::UpstreamManager;
use mcp_aggregator::cli::{Cli, Command, ServeArgs};
use mcp_aggregator::{build_auth_state, build_router, App};
use tower_http::trace::TraceLayer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let args = match cli.command {
        Some(Command::Serve(args)) => args,
        Some(Command::Mcp) | Some(Command::App) | Some(Command::Preset) => {
            anyhow::bail!("this subcommand is handled by a separate tool, not this build");
        }
        None => ServeArgs::default(),
    };

    let _log_guard = init_tracing(&args.log_level, args.log_file.as_deref());

    let config_provider: Box<dyn ConfigProvider> = match &args.config {
        Some(path) => Box::new(ExplicitConfigProvider { path: path.clone() }),
        None => Box::new(OsConfigProvider),
    };
    let snapshot = load_snapshot(config_provider.as_ref())?;
    let all_tags = snapshot.all_tags();

    let bus = NotifyBus::new();
    let upstreams = UpstreamManager::new(mcp_aggregator_core::router::PROXY_NAME, bus.clone())
        .with_token_store(mcp_aggregator_core::client_tokens::ClientTokenStore::new(
            config_provider.base_dir(),
        ));
    upstreams
        .start(snapshot.upstreams.values().cloned().collect())
        .await;

    let router = build_router(
        upstreams.clone(),
        bus,
        std::time::Duration::from_millis(args.coalesce_window_ms),
    );
    let notification_bridge = mcp_aggregator_core::router::spawn_notification_bridge(router.clone());

    let mut auth_config = AuthConfig::default();
    auth_config.rate_limit_max = args.rate_limit_max;
    auth_config.rate_limit_window_secs = args.rate_limit_window;
    auth_config.trust_proxy_hops = args.trust_proxy;
    auth_config.token_ttl_secs = args.session_ttl;
    auth_config.issuer = format!("http://{}:{}", args.host, args.port);
    let auth = build_auth_state(all_tags, auth_config)?;
    let cleanup_handle = mcp_aggregator_auth::spawn_cleanup_sweep(auth.clone());

    let app = Arc::new(App::new(
        upstreams.clone(),
        router.clone(),
        auth.clone(),
        args.enable_auth,
        args.health_info_level.clone(),
    ));
    app.config_loaded.store(true, Ordering::Relaxed);

    let watch_handle = config_watch::watch(config_provider, upstreams.clone(), snapshot);

    match args.transport.as_str() {
        "stdio" => {
            mcp_aggregator::inbound::stdio::serve(router.clone()).await?;
        }
        _ => {
            let listener = tokio::net::TcpListener::bind((args.host.as_str(), args.port)).await?;
            tracing::info!(target: "app", addr = %listener.local_addr()?, "listening");

            let mut axum_router = mcp_aggregator::inbound::http::router(app.clone())
                .merge(mcp_aggregator::health::router(app.clone()));
            if args.enable_auth {
                axum_router = axum_router.merge(mcp_aggregator_auth::router(auth.clone()));
            }
            let axum_router = axum_router.layer(TraceLayer::new_for_http());

            let serve = axum::serve(
                listener,
                axum_router.into_make_service_with_connect_info::<std::net::SocketAddr>(),
            );
            tokio::select! {
                result = serve => { result?; }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!(target: "app", "shutdown signal received");
                }
            }
        }
    }

    watch_handle.abort();
    cleanup_handle.abort();
    notification_bridge.abort();
    upstreams.shutdown().await;
    Ok(())
}

/// Initializes the global tracing subscriber. When `log_file` is set, logs
/// are written (non-blocking) to that file instead of stderr; the returned
/// guard must be held for the process lifetime or buffered lines are lost.
fn init_tracing(level: &str, log_file: Option<&std::path::Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{fmt, EnvFilter};
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    match log_file {
        Some(path) => {
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| std::path::Path::new("."));
            let file_name = path.file_name().unwrap_or_else(|| std::ffi::OsStr::new("mcp-aggregator.log"));
            let appender = tracing_appender::rolling::never(dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            fmt()
                .with_env_filter(filter())
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            fmt().with_env_filter(filter()).init();
            None
        }
    }
}

struct ExplicitConfigProvider {
    path: std::path::PathBuf,
}

impl ConfigProvider for ExplicitConfigProvider {
    fn base_dir(&self) -> std::path::PathBuf {
        self.path
            .parent()
            .map(std::path::Path::to_path_buf)
            .unwrap_or_else(|| std::path::PathBuf::from("."))
    }

    fn config_path(&self) -> std::path::PathBuf {
        self.path.clone()
    }
}
