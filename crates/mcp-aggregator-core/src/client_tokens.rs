//! Opaque, per-upstream OAuth client token storage. The proxy does not
//! implement an OAuth client against each upstream's own identity provider
//! (out of scope — see the crate's non-goals); it only needs to remember
//! whatever bearer material a given upstream requires across restarts, the
//! same atomic-rename-on-write discipline `mcp-aggregator-auth::storage`
//! uses for its own records, laid out at `clientSessions/oauth_<server>.json`
//! under the config directory.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredClientToken {
    pub access_token: String,
    pub obtained_at: i64,
}

#[derive(Debug, Clone)]
pub struct ClientTokenStore {
    dir: PathBuf,
}

impl ClientTokenStore {
    pub fn new(config_base_dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: config_base_dir.into().join("clientSessions"),
        }
    }

    fn id_for(upstream: &str) -> String {
        format!("oauth_{upstream}")
    }

    /// Resolves `id` to a path under the store directory, rejecting any id
    /// that would escape it.
    fn resolve(&self, id: &str) -> Option<PathBuf> {
        if id.is_empty() || id.contains('\0') || id.contains("..") || id.contains('/') || id.contains('\\') {
            return None;
        }
        let path = self.dir.join(format!("{id}.json"));
        let normalized = normalize(&path);
        let normalized_dir = normalize(&self.dir);
        if normalized.starts_with(&normalized_dir) {
            Some(path)
        } else {
            None
        }
    }

    pub fn load(&self, upstream: &str) -> Option<StoredClientToken> {
        let path = self.resolve(&Self::id_for(upstream))?;
        let bytes = std::fs::read(path).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    pub fn store(&self, upstream: &str, token: &StoredClientToken) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let id = Self::id_for(upstream);
        let Some(path) = self.resolve(&id) else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "id escapes storage directory",
            ));
        };
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(token)?;
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn clear(&self, upstream: &str) {
        if let Some(path) = self.resolve(&Self::id_for(upstream)) {
            let _ = std::fs::remove_file(path);
        }
    }
}

fn normalize(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| match path.parent() {
        Some(parent) => std::fs::canonicalize(parent)
            .unwrap_or_else(|_| parent.to_path_buf())
            .join(path.file_name().unwrap_or_default()),
        None => path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store(tag: &str) -> ClientTokenStore {
        let dir = std::env::temp_dir().join(format!(
            "mcp-aggregator-client-tokens-test-{}-{}-{}",
            tag,
            std::process::id(),
            uuid::Uuid::new_v4()
        ));
        ClientTokenStore::new(dir)
    }

    #[test]
    fn store_then_load_round_trips() {
        let store = temp_store("roundtrip");
        let token = StoredClientToken {
            access_token: "secret-value".into(),
            obtained_at: 1234,
        };
        store.store("my-upstream", &token).unwrap();
        let loaded = store.load("my-upstream").unwrap();
        assert_eq!(loaded.access_token, "secret-value");
    }

    #[test]
    fn missing_upstream_loads_as_none() {
        let store = temp_store("missing");
        assert!(store.load("nothing-here").is_none());
    }

    #[test]
    fn traversal_in_upstream_name_is_rejected() {
        let store = temp_store("traversal");
        let token = StoredClientToken {
            access_token: "x".into(),
            obtained_at: 0,
        };
        // Upstream names are config-validated elsewhere, but the store itself
        // must never let a crafted name escape its directory.
        assert!(store.resolve(&ClientTokenStore::id_for("../../etc/passwd")).is_none());
        let _ = token;
    }

    #[test]
    fn clear_removes_stored_token() {
        let store = temp_store("clear");
        let token = StoredClientToken {
            access_token: "y".into(),
            obtained_at: 0,
        };
        store.store("svc", &token).unwrap();
        store.clear("svc");
        assert!(store.load("svc").is_none());
    }
}
