//! Watches the config file and child-process socket paths, emitting
//! `FileCreated` / `FileChanged` bus events.
//!
//! `notify`'s watcher callback is synchronous and runs on its own thread;
//! this module bridges it onto the tokio event bus with a small forwarding
//! task, matching the "blocking I/O on a dedicated thread, results marshaled
//! onto the bus" rule.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use notify::{Event as NotifyEvent, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::warn;

use crate::bus::{Bus, Event};

/// Start watching `paths` (only the parent directories need to exist;
/// sockets and credential files may not exist yet at startup — that's the
/// point of watching for their creation). Returns the underlying watcher,
/// which must be kept alive for the duration of the runner's process.
pub fn start(paths: Vec<PathBuf>, bus: Bus) -> notify::Result<RecommendedWatcher> {
    let watched: HashSet<PathBuf> = paths.iter().cloned().collect();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<NotifyEvent>| {
        if let Err(source) = tx.send(res) {
            warn!(error = %source, "file watcher channel closed");
        }
    })?;

    let mut watched_dirs = HashSet::new();
    for path in &paths {
        if let Some(parent) = path.parent() {
            if watched_dirs.insert(parent.to_path_buf()) {
                if let Err(source) = watcher.watch(parent, RecursiveMode::NonRecursive) {
                    warn!(dir = %parent.display(), error = %source, "failed to watch directory");
                }
            }
        }
    }

    tokio::spawn(async move {
        while let Some(res) = rx.recv().await {
            match res {
                Ok(event) => dispatch(&event, &watched, &bus),
                Err(source) => warn!(error = %source, "file watch error"),
            }
        }
    });

    Ok(watcher)
}

fn dispatch(event: &NotifyEvent, watched: &HashSet<PathBuf>, bus: &Bus) {
    for path in &event.paths {
        if !watched.contains(path) {
            continue;
        }
        match event.kind {
            EventKind::Create(_) => bus.publish(Event::FileCreated(path.clone())),
            EventKind::Modify(_) => bus.publish(Event::FileChanged(path.clone())),
            _ => {}
        }
    }
}

/// True if `path` names a watched socket/credential file that has already
/// appeared (used at startup to avoid missing a creation event that fired
/// before the watcher was installed).
pub fn already_exists(path: &Path) -> bool {
    path.exists()
}
