//! Debounced filesystem watch over the config file, recomputing a diff and
//! driving `UpstreamManager::reconfigure` on change.

use std::path::PathBuf;
use std::time::Duration;

use notify::{RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::config::{load_snapshot, ConfigProvider, ConfigSnapshot};
use crate::upstream::UpstreamManager;

const DEBOUNCE: Duration = Duration::from_millis(300);

/// Spawns a background task watching the config file; on a debounced change
/// event it reloads, diffs against the last-known-good snapshot, and calls
/// `reconfigure`. A reload that fails to parse is rejected and the prior
/// config remains active, per the `ConfigError` propagation policy.
pub fn watch(
    cp: Box<dyn ConfigProvider>,
    manager: UpstreamManager,
    mut last_good: ConfigSnapshot,
) -> tokio::task::JoinHandle<()> {
    let path = cp.config_path();
    tokio::spawn(async move {
        let (tx, mut rx) = mpsc::channel::<()>(16);
        let mut watcher = match notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if res.is_ok() {
                let _ = tx.try_send(());
            }
        }) {
            Ok(w) => w,
            Err(e) => {
                tracing::warn!(target: "config", error = %e, "failed to start config watcher");
                return;
            }
        };
        let watch_dir = path.parent().map(PathBuf::from).unwrap_or(path.clone());
        if let Err(e) = watcher.watch(&watch_dir, RecursiveMode::NonRecursive) {
            tracing::warn!(target: "config", error = %e, "failed to watch config directory");
            return;
        }
        loop {
            if rx.recv().await.is_none() {
                return;
            }
            tokio::time::sleep(DEBOUNCE).await;
            while rx.try_recv().is_ok() {}
            match load_snapshot(cp.as_ref()) {
                Ok(next) => {
                    let diff = last_good.diff(&next);
                    if !diff.is_empty() {
                        tracing::info!(
                            target: "config",
                            added = diff.added.len(),
                            removed = diff.removed.len(),
                            changed = diff.changed.len(),
                            "config changed, reconfiguring"
                        );
                        manager.reconfigure(diff).await;
                        last_good = next;
                    }
                }
                Err(e) => {
                    tracing::warn!(target: "config", error = %e, "reload rejected, keeping prior config");
                }
            }
        }
    })
}
