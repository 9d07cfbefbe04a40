use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

/// The fixed token separating an upstream name from a capability name in the
/// aggregate namespace. Chosen to be unlikely inside a valid identifier.
pub const NAMESPACE_SEPARATOR: &str = "_1mcp_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamKind {
    Stdio,
    Http,
    Sse,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RestartPolicy {
    #[serde(default, rename = "restartOnExit")]
    pub on_exit: bool,
    /// `None` means unbounded (the spec's `maxRestarts: ∞`).
    #[serde(default, rename = "maxRestarts")]
    pub max_restarts: Option<u32>,
    #[serde(default = "default_restart_delay_ms", rename = "restartDelay")]
    pub delay_ms: u64,
}

fn default_restart_delay_ms() -> u64 {
    1_000
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OAuthHints {
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
}

/// Raw on-disk shape of a single entry under `mcpServers`. `UpstreamDef` is
/// derived from this after validation; this struct exists to mirror the wire
/// schema exactly (including the optional/inferred `type`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawUpstreamEntry {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub restart_on_exit: bool,
    #[serde(default)]
    pub max_restarts: Option<u32>,
    #[serde(default)]
    pub restart_delay: Option<u64>,
    #[serde(default)]
    pub oauth: Option<OAuthHints>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawConfig {
    #[serde(rename = "mcpServers", default)]
    pub mcp_servers: BTreeMap<String, RawUpstreamEntry>,
}

/// Immutable description of one upstream. Constructing one validates the
/// transport-type inference rule and the namespace-separator invariant.
#[derive(Debug, Clone)]
pub struct UpstreamDef {
    pub name: String,
    pub kind: UpstreamKind,
    pub command: Option<String>,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: Option<String>,
    pub url: Option<String>,
    pub headers: HashMap<String, String>,
    pub timeout: Option<std::time::Duration>,
    pub tags: Vec<String>,
    pub disabled: bool,
    pub restart_policy: RestartPolicy,
    pub oauth: Option<OAuthHints>,
}

impl UpstreamDef {
    fn from_raw(name: String, raw: RawUpstreamEntry) -> Result<Self, ConfigError> {
        if name.contains(NAMESPACE_SEPARATOR) {
            return Err(ConfigError::ReservedSeparator(name));
        }
        let kind = match raw.kind.as_deref() {
            Some("stdio") => UpstreamKind::Stdio,
            Some("http") => UpstreamKind::Http,
            Some("sse") => UpstreamKind::Sse,
            Some(other) => return Err(ConfigError::UnknownTransport(other.to_string())),
            None => {
                if raw.url.is_some() {
                    UpstreamKind::Http
                } else if raw.command.is_some() {
                    UpstreamKind::Stdio
                } else {
                    return Err(ConfigError::MissingField("type"));
                }
            }
        };
        if matches!(kind, UpstreamKind::Stdio) && raw.command.is_none() {
            return Err(ConfigError::MissingField("command"));
        }
        if matches!(kind, UpstreamKind::Http | UpstreamKind::Sse) && raw.url.is_none() {
            return Err(ConfigError::MissingField("url"));
        }
        Ok(Self {
            name,
            kind,
            command: raw.command,
            args: raw.args,
            env: raw.env,
            cwd: raw.cwd,
            url: raw.url,
            headers: raw.headers,
            timeout: raw.timeout.map(std::time::Duration::from_secs),
            tags: raw.tags,
            disabled: raw.disabled,
            restart_policy: RestartPolicy {
                on_exit: raw.restart_on_exit,
                max_restarts: raw.max_restarts,
                delay_ms: raw.restart_delay.unwrap_or_else(default_restart_delay_ms),
            },
            oauth: raw.oauth,
        })
    }
}

/// An immutable snapshot of the configured upstream set, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct ConfigSnapshot {
    pub upstreams: BTreeMap<String, UpstreamDef>,
}

impl ConfigSnapshot {
    pub fn from_raw(raw: RawConfig) -> Result<Self, ConfigError> {
        let mut upstreams = BTreeMap::new();
        for (name, entry) in raw.mcp_servers {
            let def = UpstreamDef::from_raw(name.clone(), entry)?;
            upstreams.insert(name, def);
        }
        Ok(Self { upstreams })
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig =
            serde_json::from_str(text).map_err(|e| ConfigError::InvalidJson(e.to_string()))?;
        Self::from_raw(raw)
    }

    /// All distinct tags across every upstream, used as the scope universe
    /// when auth is disabled.
    pub fn all_tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self
            .upstreams
            .values()
            .flat_map(|u| u.tags.iter().cloned())
            .collect();
        tags.sort();
        tags.dedup();
        tags
    }

    pub fn diff(&self, next: &ConfigSnapshot) -> ConfigDiff {
        let mut added = Vec::new();
        let mut removed = Vec::new();
        let mut changed = Vec::new();
        for (name, def) in &next.upstreams {
            match self.upstreams.get(name) {
                None => added.push(def.clone()),
                Some(prev) if !upstream_defs_equivalent(prev, def) => changed.push(def.clone()),
                Some(_) => {}
            }
        }
        for name in self.upstreams.keys() {
            if !next.upstreams.contains_key(name) {
                removed.push(name.clone());
            }
        }
        ConfigDiff {
            added,
            removed,
            changed,
        }
    }
}

fn upstream_defs_equivalent(a: &UpstreamDef, b: &UpstreamDef) -> bool {
    a.kind == b.kind
        && a.command == b.command
        && a.args == b.args
        && a.env == b.env
        && a.cwd == b.cwd
        && a.url == b.url
        && a.headers == b.headers
        && a.timeout == b.timeout
        && a.tags == b.tags
        && a.disabled == b.disabled
}

/// Carries exactly what changed between two snapshots, consumed by
/// `UpstreamManager::reconfigure`.
#[derive(Debug, Clone, Default)]
pub struct ConfigDiff {
    pub added: Vec<UpstreamDef>,
    pub removed: Vec<String>,
    pub changed: Vec<UpstreamDef>,
}

impl ConfigDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

/// Abstracts the base directory so tests can point at a temp dir instead of
/// the real OS config location.
pub trait ConfigProvider: Send + Sync + 'static {
    fn base_dir(&self) -> PathBuf;

    fn config_path(&self) -> PathBuf {
        self.base_dir().join("mcp.json")
    }
}

pub struct OsConfigProvider;

impl ConfigProvider for OsConfigProvider {
    fn base_dir(&self) -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("mcp-aggregator")
    }
}

pub fn load_snapshot(cp: &dyn ConfigProvider) -> Result<ConfigSnapshot, ConfigError> {
    let path = cp.config_path();
    let text = match std::fs::read_to_string(&path) {
        Ok(t) => t,
        Err(_) => return Ok(ConfigSnapshot::default()),
    };
    ConfigSnapshot::parse(&text)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TempConfigProvider {
        dir: std::path::PathBuf,
    }

    impl TempConfigProvider {
        fn new(tag: &str) -> Self {
            let dir = std::env::temp_dir().join(format!(
                "mcp-aggregator-test-{}-{}-{}",
                tag,
                std::process::id(),
                uuid::Uuid::new_v4()
            ));
            std::fs::create_dir_all(&dir).unwrap();
            Self { dir }
        }
    }

    impl ConfigProvider for TempConfigProvider {
        fn base_dir(&self) -> PathBuf {
            self.dir.clone()
        }
    }

    #[test]
    fn infers_http_from_url_and_stdio_from_command() {
        let json = r#"{"mcpServers": {
            "web": {"url": "http://localhost:1234"},
            "echo": {"command": "echo-server"}
        }}"#;
        let snap = ConfigSnapshot::parse(json).unwrap();
        assert_eq!(snap.upstreams["web"].kind, UpstreamKind::Http);
        assert_eq!(snap.upstreams["echo"].kind, UpstreamKind::Stdio);
    }

    #[test]
    fn rejects_reserved_separator_in_name() {
        let json = r#"{"mcpServers": {"foo_1mcp_bar": {"command": "x"}}}"#;
        let err = ConfigSnapshot::parse(json).unwrap_err();
        assert!(matches!(err, ConfigError::ReservedSeparator(_)));
    }

    #[test]
    fn unknown_transport_type_is_rejected() {
        let json = r#"{"mcpServers": {"x": {"type": "carrier-pigeon"}}}"#;
        let err = ConfigSnapshot::parse(json).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownTransport(_)));
    }

    #[test]
    fn diff_reports_added_removed_and_changed() {
        let a = ConfigSnapshot::parse(r#"{"mcpServers": {"a": {"command":"x"}, "b": {"command":"y"}}}"#).unwrap();
        let b = ConfigSnapshot::parse(r#"{"mcpServers": {"a": {"command":"x","tags":["t"]}, "c": {"command":"z"}}}"#).unwrap();
        let diff = a.diff(&b);
        assert_eq!(diff.removed, vec!["b".to_string()]);
        assert_eq!(diff.added.len(), 1);
        assert_eq!(diff.added[0].name, "c");
        assert_eq!(diff.changed.len(), 1);
        assert_eq!(diff.changed[0].name, "a");
    }

    #[test]
    fn load_snapshot_missing_file_is_empty_not_error() {
        let cp = TempConfigProvider::new("missing");
        let snap = load_snapshot(&cp).unwrap();
        assert!(snap.upstreams.is_empty());
    }
}
