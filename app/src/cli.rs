use clap::{Parser, Subcommand};

/// Aggregating MCP proxy. Environment variables prefixed `ONE_MCP_` mirror
/// every flag below (e.g. `ONE_MCP_PORT`, `ONE_MCP_ENABLE_AUTH`).
#[derive(Debug, Parser)]
#[command(name = "mcp-aggregator", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the proxy (default when no subcommand is given).
    Serve(ServeArgs),
    /// External collaborator, not implemented in this build.
    Mcp,
    /// External collaborator, not implemented in this build.
    App,
    /// External collaborator, not implemented in this build.
    Preset,
}

#[derive(Debug, Parser, Clone)]
pub struct ServeArgs {
    #[arg(long, env = "ONE_MCP_CONFIG")]
    pub config: Option<std::path::PathBuf>,

    #[arg(long, env = "ONE_MCP_TRANSPORT", default_value = "streamable-http")]
    pub transport: String,

    #[arg(long, env = "ONE_MCP_HOST", default_value = "127.0.0.1")]
    pub host: String,

    #[arg(long, env = "ONE_MCP_PORT", default_value_t = 8091)]
    pub port: u16,

    #[arg(long, env = "ONE_MCP_TRUST_PROXY", default_value_t = 0)]
    pub trust_proxy: usize,

    #[arg(long, env = "ONE_MCP_ENABLE_AUTH", default_value_t = false)]
    pub enable_auth: bool,

    #[arg(long, env = "ONE_MCP_RATE_LIMIT_WINDOW", default_value_t = 60)]
    pub rate_limit_window: u64,

    #[arg(long, env = "ONE_MCP_RATE_LIMIT_MAX", default_value_t = 20)]
    pub rate_limit_max: u32,

    #[arg(long, env = "ONE_MCP_SESSION_TTL", default_value_t = 3600)]
    pub session_ttl: i64,

    #[arg(long, env = "ONE_MCP_HEALTH_INFO_LEVEL", default_value = "basic")]
    pub health_info_level: String,

    #[arg(long, env = "ONE_MCP_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[arg(long, env = "ONE_MCP_LOG_FILE")]
    pub log_file: Option<std::path::PathBuf>,

    #[arg(long, env = "ONE_MCP_ENABLE_ASYNC_LOADING", default_value_t = true)]
    pub enable_async_loading: bool,

    #[arg(long, env = "ONE_MCP_COALESCE_WINDOW_MS", default_value_t = 2000)]
    pub coalesce_window_ms: u64,
}

impl Default for ServeArgs {
    fn default() -> Self {
        Self {
            config: None,
            transport: "streamable-http".to_string(),
            host: "127.0.0.1".to_string(),
            port: 8091,
            trust_proxy: 0,
            enable_auth: false,
            rate_limit_window: 60,
            rate_limit_max: 20,
            session_ttl: 3600,
            health_info_level: "basic".to_string(),
            log_level: "info".to_string(),
            log_file: None,
            enable_async_loading: true,
            coalesce_window_ms: 2000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_serve_with_defaults() {
        let cli = Cli::parse_from(["mcp-aggregator", "serve"]);
        match cli.command {
            Some(Command::Serve(args)) => assert_eq!(args.port, 8091),
            _ => panic!("expected Serve"),
        }
    }

    #[test]
    fn no_subcommand_parses_fine_and_defaults_to_serve_in_main() {
        let cli = Cli::parse_from(["mcp-aggregator"]);
        assert!(cli.command.is_none());
    }
}
