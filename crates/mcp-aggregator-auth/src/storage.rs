//! Filesystem-backed record store. Every identifier is prefixed so its type
//! is inferable from the string; every path is re-normalized to reject
//! traversal outside the storage directory; every write is atomic
//! (write-to-temp, then rename).

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

#[derive(Debug, Clone)]
pub struct Storage {
    dir: PathBuf,
}

impl Storage {
    pub fn new(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Resolves `id` to a path under `self.dir`, rejecting any id that would
    /// escape it (`..`, `/`, null bytes).
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

    pub fn write<T: Serialize>(&self, id: &str, value: &T) -> std::io::Result<()> {
        let Some(path) = self.resolve(id) else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "id escapes storage directory",
            ));
        };
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(value)?;
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Reads a record. Parse failures and traversal attempts both behave as
    /// "missing" rather than erroring, per the storage discipline.
    pub fn read<T: DeserializeOwned>(&self, id: &str) -> Option<T> {
        let path = self.resolve(id)?;
        let bytes = std::fs::read(path).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    pub fn delete(&self, id: &str) {
        if let Some(path) = self.resolve(id) {
            let _ = std::fs::remove_file(path);
        }
    }

    pub fn list_ids(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return vec![];
        };
        entries
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let name = e.file_name().to_string_lossy().to_string();
                name.strip_suffix(".json").map(|s| s.to_string())
            })
            .collect()
    }
}

fn normalize(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| {
        // For paths that don't exist yet (the target file), canonicalize the
        // parent and rejoin the file name.
        match path.parent() {
            Some(parent) => std::fs::canonicalize(parent)
                .unwrap_or_else(|_| parent.to_path_buf())
                .join(path.file_name().unwrap_or_default()),
            None => path.to_path_buf(),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Rec {
        value: String,
    }

    fn temp_storage(tag: &str) -> Storage {
        let dir = std::env::temp_dir().join(format!(
            "mcp-aggregator-auth-test-{}-{}-{}",
            tag,
            std::process::id(),
            uuid::Uuid::new_v4()
        ));
        Storage::new(dir).unwrap()
    }

    #[test]
    fn write_then_read_round_trips() {
        let storage = temp_storage("roundtrip");
        let rec = Rec {
            value: "hello".into(),
        };
        storage.write("sess_abc", &rec).unwrap();
        let read: Rec = storage.read("sess_abc").unwrap();
        assert_eq!(read, rec);
    }

    #[test]
    fn traversal_ids_are_rejected() {
        let storage = temp_storage("traversal");
        let rec = Rec { value: "x".into() };
        let err = storage.write("../../etc/passwd", &rec);
        assert!(err.is_err());
        assert!(storage.read::<Rec>("../../etc/passwd").is_none());
        storage.delete("../../etc/passwd"); // must not panic or touch anything
    }

    #[test]
    fn null_byte_and_slash_ids_are_rejected() {
        let storage = temp_storage("nullbyte");
        assert!(storage.read::<Rec>("a/b").is_none());
        assert!(storage.read::<Rec>("a\0b").is_none());
    }

    #[test]
    fn corrupted_file_reads_as_missing() {
        let storage = temp_storage("corrupt");
        let path = storage.dir.join("sess_bad.json");
        std::fs::write(&path, b"{not valid json").unwrap();
        assert!(storage.read::<Rec>("sess_bad").is_none());
    }

    #[test]
    fn list_ids_strips_extension() {
        let storage = temp_storage("list");
        storage.write("sess_a", &Rec { value: "1".into() }).unwrap();
        storage.write("sess_b", &Rec { value: "2".into() }).unwrap();
        let mut ids = storage.list_ids();
        ids.sort();
        assert_eq!(ids, vec!["sess_a".to_string(), "sess_b".to_string()]);
    }
}
