// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Cross-process credential sync.
//!
//! Other processes sharing the slot directory may sign in, renew, or sign
//! out. Changes to the slot file are turned into [`StorageChange`] messages;
//! the session reacts by re-reading the store.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::credential::slots::SLOT_FILE;

/// The slot file was created, replaced, or removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageChange {
    pub path: PathBuf,
}

/// Map a filesystem event to a change of the slot file, if it touched it.
///
/// Temp files used for atomic writes are ignored; the rename that publishes
/// them names the slot file itself.
pub fn change_from_event(event: &notify::Event) -> Option<StorageChange> {
    use notify::EventKind;

    if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)) {
        return None;
    }
    event
        .paths
        .iter()
        .find(|p| p.file_name().and_then(|n| n.to_str()) == Some(SLOT_FILE))
        .map(|path| StorageChange { path: path.clone() })
}

/// Watches a slot directory for credential changes. Uses `notify` for
/// filesystem events with a modification-time polling fallback.
pub struct StorageWatcher {
    dir: PathBuf,
    poll_interval: Duration,
}

impl StorageWatcher {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir, poll_interval: Duration::from_secs(5) }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Forward changes to `change_tx` until `shutdown` is cancelled or the
    /// receiver goes away.
    pub async fn run(self, change_tx: mpsc::Sender<StorageChange>, shutdown: CancellationToken) {
        if let Err(e) = std::fs::create_dir_all(&self.dir) {
            debug!(dir = %self.dir.display(), "cannot create slot directory: {e}");
        }

        let (event_tx, mut event_rx) = mpsc::channel::<StorageChange>(16);
        let _watcher = self.setup_notify_watcher(event_tx);

        let path = self.dir.join(SLOT_FILE);
        let mut last = modified(&path);
        let mut poll_interval = tokio::time::interval(self.poll_interval);

        loop {
            let change = tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(change) = event_rx.recv() => {
                    last = modified(&path);
                    Some(change)
                }
                _ = poll_interval.tick() => {
                    let now = modified(&path);
                    let changed = now != last;
                    last = now;
                    changed.then(|| StorageChange { path: path.clone() })
                }
            };

            if let Some(change) = change {
                if change_tx.send(change).await.is_err() {
                    return;
                }
            }
        }
        debug!(dir = %self.dir.display(), "storage watcher stopped");
    }

    /// Returns the watcher handle (must be kept alive).
    fn setup_notify_watcher(
        &self,
        event_tx: mpsc::Sender<StorageChange>,
    ) -> Option<notify::RecommendedWatcher> {
        use notify::{RecursiveMode, Watcher};

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let Ok(event) = res else { return };
            if let Some(change) = change_from_event(&event) {
                // A full queue already holds a pending resync.
                let _ = event_tx.try_send(change);
            }
        })
        .ok()?;

        watcher.watch(&self.dir, RecursiveMode::NonRecursive).ok()?;
        Some(watcher)
    }
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

#[cfg(test)]
#[path = "sync_tests.rs"]
mod tests;
