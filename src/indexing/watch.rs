//! Filesystem watching with a quiet-period debounce.
//!
//! [`FileWatcher`] turns raw `notify` events into typed [`WatchEvent`]s,
//! drops ignored paths and feeds a [`Debouncer`], which hands one
//! [`ChangeSet`] to the callback per burst of activity.

use crate::core::error::{Error, Result};
use crate::indexing::discovery::relative_uri;
use notify_debouncer_full::notify::event::ModifyKind;
use notify_debouncer_full::notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use notify_debouncer_full::{new_debouncer, DebounceEventResult, FileIdMap};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Internal tick of the notify debouncer; only stitches rename pairs.
const NOTIFY_TICK: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Add,
    Modify,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WatchEvent {
    pub kind: ChangeKind,
    /// Path relative to the watched root, `/`-separated
    pub path: String,
}

impl WatchEvent {
    pub fn new(kind: ChangeKind, path: impl Into<String>) -> Self {
        Self {
            kind,
            path: path.into(),
        }
    }
}

/// Events collected during one debounce window, one per path, in order of
/// first arrival.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChangeSet {
    pub events: Vec<WatchEvent>,
}

impl ChangeSet {
    pub fn push(&mut self, event: WatchEvent) {
        match self.events.iter_mut().find(|e| e.path == event.path) {
            // a file created in this window is still new whatever happens next, unless it goes away
            Some(existing) => {
                existing.kind = match (existing.kind, event.kind) {
                    (ChangeKind::Add, ChangeKind::Modify) => ChangeKind::Add,
                    (_, kind) => kind,
                };
            }
            None => self.events.push(event),
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.events.iter().map(|e| e.path.as_str())
    }
}

/// Trailing-edge debouncer: every event restarts the window, and the
/// callback fires once the window passes without new events.
pub struct Debouncer {
    tx: mpsc::UnboundedSender<WatchEvent>,
    task: Option<JoinHandle<()>>,
}

impl Debouncer {
    /// Spawn the debounce loop on the current tokio runtime.
    pub fn spawn<F>(window: Duration, on_change: F) -> Self
    where
        F: Fn(ChangeSet) + Send + Sync + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_debounce(rx, window, on_change));
        Self {
            tx,
            task: Some(task),
        }
    }

    /// Handle for feeding events from any thread
    pub fn sender(&self) -> mpsc::UnboundedSender<WatchEvent> {
        self.tx.clone()
    }

    /// Queue one event. Returns `false` once stopped.
    pub fn push(&self, event: WatchEvent) -> bool {
        self.task.is_some() && self.tx.send(event).is_ok()
    }

    /// Cancel the loop and any pending window. Idempotent.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_debounce<F>(mut rx: mpsc::UnboundedReceiver<WatchEvent>, window: Duration, on_change: F)
where
    F: Fn(ChangeSet),
{
    while let Some(first) = rx.recv().await {
        let mut pending = ChangeSet::default();
        pending.push(first);

        loop {
            tokio::select! {
                next = rx.recv() => match next {
                    Some(event) => pending.push(event),
                    None => {
                        on_change(pending);
                        return;
                    }
                },
                _ = tokio::time::sleep(window) => {
                    tracing::debug!(changes = pending.len(), "debounce window elapsed");
                    on_change(pending);
                    break;
                }
            }
        }
    }
}

/// Predicate over root-relative paths: `(path, is_dir) -> ignored`.
/// Removed paths are always passed with `is_dir = true`.
pub type IgnorePredicate = Arc<dyn Fn(&Path, bool) -> bool + Send + Sync>;

type NotifyDebouncer = notify_debouncer_full::Debouncer<RecommendedWatcher, FileIdMap>;

/// Recursive watcher over one root.
pub struct FileWatcher {
    root: PathBuf,
    notify: Option<NotifyDebouncer>,
    debouncer: Debouncer,
}

impl FileWatcher {
    /// Watch `root` recursively. Must be called inside a tokio runtime.
    pub fn start<F>(root: &Path, is_ignored: IgnorePredicate, window: Duration, on_change: F) -> Result<Self>
    where
        F: Fn(ChangeSet) + Send + Sync + 'static,
    {
        if !root.is_dir() {
            return Err(Error::Watch(format!("Not a directory: {}", root.display())));
        }
        let roots = watched_roots(root);

        let debouncer = Debouncer::spawn(window, on_change);
        let tx = debouncer.sender();

        let mut notify = new_debouncer(NOTIFY_TICK, None, move |result: DebounceEventResult| match result {
            Ok(events) => {
                for event in events {
                    for path in &event.paths {
                        if let Some(change) = classify(&event.kind, path, &roots, is_ignored.as_ref()) {
                            if tx.send(change).is_err() {
                                return;
                            }
                        }
                    }
                }
            }
            Err(errors) => {
                for error in errors {
                    tracing::warn!(error = %error, "file watcher error");
                }
            }
        })?;

        notify.watcher().watch(root, RecursiveMode::Recursive)?;
        notify.cache().add_root(root, RecursiveMode::Recursive);

        tracing::info!(root = %root.display(), window_ms = window.as_millis() as u64, "watching for changes");
        Ok(Self {
            root: root.to_path_buf(),
            notify: Some(notify),
            debouncer,
        })
    }

    pub fn is_running(&self) -> bool {
        self.notify.is_some()
    }

    /// Release the OS watch and cancel any pending window. Idempotent.
    pub fn stop(&mut self) {
        if let Some(notify) = self.notify.take() {
            notify.stop();
            tracing::info!(root = %self.root.display(), "stopped watching");
        }
        self.debouncer.stop();
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The root as given plus its canonical form, since event paths may use either.
fn watched_roots(root: &Path) -> Vec<PathBuf> {
    let mut roots = vec![root.to_path_buf()];
    if let Ok(canonical) = root.canonicalize() {
        if canonical != root {
            roots.push(canonical);
        }
    }
    roots
}

/// Map one raw event path to a typed event, or `None` when it is ignored,
/// outside the root, a directory, or not a content change.
fn classify(
    kind: &EventKind,
    path: &Path,
    roots: &[PathBuf],
    is_ignored: &(dyn Fn(&Path, bool) -> bool + Send + Sync),
) -> Option<WatchEvent> {
    let change = match kind {
        EventKind::Create(_) => ChangeKind::Add,
        EventKind::Modify(ModifyKind::Name(_)) => {
            if path.exists() {
                ChangeKind::Add
            } else {
                ChangeKind::Remove
            }
        }
        EventKind::Modify(ModifyKind::Metadata(_)) => return None,
        EventKind::Modify(_) | EventKind::Any | EventKind::Other => ChangeKind::Modify,
        EventKind::Remove(_) => ChangeKind::Remove,
        EventKind::Access(_) => return None,
    };

    // a removed path can no longer say whether it was a directory
    let is_dir = change == ChangeKind::Remove || path.is_dir();
    if is_dir && change != ChangeKind::Remove {
        return None;
    }

    let (root, relative) = roots
        .iter()
        .find_map(|root| relative_uri(root, path).map(|rel| (root, rel)))?;
    let rel_path = path.strip_prefix(root).ok()?;
    if is_ignored(rel_path, is_dir) {
        return None;
    }
    Some(WatchEvent::new(change, relative))
}
